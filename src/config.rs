//! Configuration management for dynlimits.
//!
//! Settings are layered, lowest precedence first:
//!
//! 1. built-in defaults;
//! 2. a configuration file (`--config`, or `dynlimits.{yaml,toml}` in the
//!    working directory);
//! 3. environment variables with the `DYNLIMITS__` prefix, using `__` for
//!    nesting (e.g. `DYNLIMITS__SERVER__API_KEY_HEADER=X-Client-Key`);
//! 4. command line flags.

use axum::http::HeaderName;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{DynLimitsError, Result};
use crate::ratelimit::{AdaptiveConfig, DynamicScope, RulesSource};

/// Main configuration for the dynlimits service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynLimitsConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Admission gateway listen addresses; one listener each
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<SocketAddr>,

    /// Admin listener address (health and stats)
    #[serde(default)]
    pub admin_addr: Option<SocketAddr>,

    /// Request header carrying the API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            admin_addr: None,
            api_key_header: default_api_key_header(),
        }
    }
}

fn default_listen_addrs() -> Vec<SocketAddr> {
    vec![SocketAddr::from(([0, 0, 0, 0], 7900))]
}

fn default_api_key_header() -> String {
    "X-Api-Key".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the limit rules file (YAML)
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Path to an indexed API catalog (JSON) merged over the rules
    #[serde(default)]
    pub catalog_path: Option<String>,

    /// Whether dynamic limits are per key or per key and endpoint
    #[serde(default)]
    pub dynamic_scope: DynamicScope,

    /// Seconds between idle bucket sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Adaptive recomputation of dynamic limits
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            catalog_path: None,
            dynamic_scope: DynamicScope::default(),
            sweep_interval_secs: default_sweep_interval(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Command line arguments.
///
/// Every flag can also be set through the environment variable named in its
/// help. Flags override both the configuration file and `DYNLIMITS__*`
/// variables.
#[derive(Parser, Debug, Default)]
#[command(
    name = "dynlimits",
    version,
    about = "Per API key and shared endpoint rate limiting gateway",
    long_about = "Admission gateway answering every request with 200 or 429 based on per API key, per endpoint and shared group token buckets."
)]
pub struct Cli {
    #[arg(
        long,
        short = 'c',
        value_name = "FILE",
        help = "Configuration file (YAML or TOML)",
        env = "DYNLIMITS_CONFIG"
    )]
    pub config: Option<String>,

    #[arg(
        long = "listen",
        value_name = "ADDR",
        value_delimiter = ',',
        help = "Gateway listen address, repeatable",
        env = "DYNLIMITS_LISTEN"
    )]
    pub listen: Vec<SocketAddr>,

    #[arg(
        long,
        value_name = "ADDR",
        help = "Admin listen address",
        env = "DYNLIMITS_ADMIN"
    )]
    pub admin: Option<SocketAddr>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Limit rules file (YAML)",
        env = "DYNLIMITS_RULES"
    )]
    pub rules: Option<String>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Indexed API catalog file (JSON)",
        env = "DYNLIMITS_CATALOG"
    )]
    pub catalog: Option<String>,

    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)",
        env = "DYNLIMITS_LOG_LEVEL"
    )]
    pub log_level: Option<String>,

    #[arg(long, help = "Log as JSON lines", env = "DYNLIMITS_LOG_JSON")]
    pub log_json: bool,
}

impl DynLimitsConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if let Some(path) = path {
            builder.add_source(config::File::with_name(path))
        } else {
            builder.add_source(config::File::with_name("dynlimits").required(false))
        };

        let builder = builder.add_source(
            config::Environment::with_prefix("DYNLIMITS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("server.listen_addrs"),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load configuration from a YAML string, without the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from the file named on the command line, then apply its flags.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = Self::load(cli.config.as_deref())?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Override settings with the flags that were given.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if !cli.listen.is_empty() {
            self.server.listen_addrs = cli.listen.clone();
        }
        if let Some(admin) = cli.admin {
            self.server.admin_addr = Some(admin);
        }
        if let Some(rules) = &cli.rules {
            self.rate_limiting.rules_path = Some(rules.clone());
        }
        if let Some(catalog) = &cli.catalog {
            self.rate_limiting.catalog_path = Some(catalog.clone());
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
        if cli.log_json {
            self.logging.json = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addrs.is_empty() {
            return Err(DynLimitsError::Config(
                "at least one listen address is required".to_string(),
            ));
        }
        self.server.api_key_header()?;
        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(DynLimitsError::Config(
                "sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        self.rate_limiting.adaptive.validate()
    }
}

impl ServerConfig {
    /// The API key header as a parsed header name.
    pub fn api_key_header(&self) -> Result<HeaderName> {
        HeaderName::from_bytes(self.api_key_header.as_bytes()).map_err(|e| {
            DynLimitsError::Config(format!(
                "invalid api_key_header '{}': {}",
                self.api_key_header, e
            ))
        })
    }
}

impl RateLimitingConfig {
    /// The files limit rules are read from.
    pub fn rules_source(&self) -> RulesSource {
        RulesSource::new(
            self.rules_path.as_ref().map(PathBuf::from),
            self.catalog_path.as_ref().map(PathBuf::from),
        )
    }
}
