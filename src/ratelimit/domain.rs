//! Accounting domain keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the client making a request.
///
/// Requests without a key (or with an empty one) share the distinguished
/// `Anonymous` identity, which cannot collide with any real key string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Anonymous,
    Key(String),
}

impl ApiKey {
    /// Build a key from an optional header value.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => ApiKey::Key(v.to_string()),
            _ => ApiKey::Anonymous,
        }
    }

    /// The key string, or `None` for anonymous callers.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ApiKey::Anonymous => None,
            ApiKey::Key(k) => Some(k),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, ApiKey::Anonymous)
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiKey::Anonymous => f.write_str("<anonymous>"),
            ApiKey::Key(k) => f.write_str(k),
        }
    }
}

/// The target of a request: listener port plus request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn new(port: u16, path: impl Into<String>) -> Self {
        Self {
            port,
            path: path.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}{}", self.port, self.path)
    }
}

/// How finely dynamic domains are split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicScope {
    /// One bucket per API key
    Key,
    /// One bucket per API key and known endpoint template; other paths
    /// share the key's bucket
    #[default]
    KeyEndpoint,
}

/// The unit a token bucket is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DomainKey {
    /// Independent per-key accounting, optionally split by endpoint
    Dynamic {
        api_key: ApiKey,
        endpoint: Option<String>,
    },
    /// One quota shared by every request routed to the group
    Shared { group: String },
}

impl DomainKey {
    pub fn dynamic(api_key: ApiKey, endpoint: Option<&str>) -> Self {
        DomainKey::Dynamic {
            api_key,
            endpoint: endpoint.map(str::to_string),
        }
    }

    pub fn shared(group: impl Into<String>) -> Self {
        DomainKey::Shared {
            group: group.into(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, DomainKey::Dynamic { .. })
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainKey::Dynamic {
                api_key,
                endpoint: Some(endpoint),
            } => write!(f, "dynamic:{}:{}", api_key, endpoint),
            DomainKey::Dynamic {
                api_key,
                endpoint: None,
            } => write!(f, "dynamic:{}", api_key),
            DomainKey::Shared { group } => write!(f, "shared:{}", group),
        }
    }
}
