//! Error types for the dynlimits service.

use thiserror::Error;

/// Main error type for dynlimits operations.
///
/// Throttling is not represented here: a rejected request is a normal
/// admission outcome, not a failure.
#[derive(Error, Debug)]
pub enum DynLimitsError {
    /// Service configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid values in the limit rules
    #[error("Rules error: {0}")]
    Rules(String),

    /// An endpoint is claimed by more than one shared group
    #[error("Endpoint {endpoint} is claimed by both group '{first}' and group '{second}'")]
    GroupOverlap {
        endpoint: String,
        first: String,
        second: String,
    },

    /// Malformed indexed catalog
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Layered configuration loading errors
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for dynlimits operations.
pub type Result<T> = std::result::Result<T, DynLimitsError>;
