//! Limit rules configuration and lookup.
//!
//! The rules are a static table: global defaults, limits for anonymous
//! callers, per-key overrides (optionally per endpoint), shared groups and
//! the endpoint templates request paths are normalized to.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use super::bucket::LimitSpec;
use super::catalog::IndexedCatalog;
use super::domain::ApiKey;
use super::route::PathTemplate;
use super::shared::SharedPolicy;
use crate::error::{DynLimitsError, Result};

fn default_limits() -> LimitSpec {
    LimitSpec::new(60.0, 1.0).with_ttl_idle(Duration::from_secs(300))
}

/// The complete limit table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRules {
    /// Limits for any domain without a more specific entry
    #[serde(default = "default_limits")]
    pub defaults: LimitSpec,
    /// Limits for requests without an API key
    #[serde(default)]
    pub anonymous: Option<LimitSpec>,
    /// Endpoint templates request paths are normalized to
    #[serde(default)]
    pub routes: Vec<String>,
    /// Per-key overrides
    #[serde(default)]
    pub keys: HashMap<String, KeyRules>,
    /// Shared groups by name
    #[serde(default)]
    pub groups: BTreeMap<String, GroupRules>,
}

/// Overrides for a single API key.
///
/// `capacity` and `refill_rate` may be given independently; the missing one
/// comes from the global defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyRules {
    #[serde(default)]
    pub capacity: Option<f64>,
    #[serde(default)]
    pub refill_rate: Option<f64>,
    #[serde(default)]
    pub ttl_idle_secs: Option<u64>,
    /// Limits for this key on specific endpoints
    #[serde(default)]
    pub endpoints: HashMap<String, LimitSpec>,
}

/// A shared group: one quota for all of its member endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRules {
    pub capacity: f64,
    pub refill_rate: f64,
    #[serde(default)]
    pub ttl_idle_secs: Option<u64>,
    #[serde(default)]
    pub endpoints: Vec<GroupEndpoint>,
}

/// A group member, either a bare path template or a template bound to one
/// listener port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupEndpoint {
    Path(String),
    Scoped {
        path: String,
        #[serde(default)]
        port: Option<u16>,
    },
}

impl GroupEndpoint {
    pub fn path(&self) -> &str {
        match self {
            GroupEndpoint::Path(path) | GroupEndpoint::Scoped { path, .. } => path,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            GroupEndpoint::Path(_) => None,
            GroupEndpoint::Scoped { port, .. } => *port,
        }
    }
}

impl KeyRules {
    fn limits(&self, defaults: &LimitSpec) -> Option<LimitSpec> {
        if self.capacity.is_none() && self.refill_rate.is_none() {
            return None;
        }
        Some(LimitSpec {
            capacity: self.capacity.unwrap_or(defaults.capacity),
            refill_rate: self.refill_rate.unwrap_or(defaults.refill_rate),
            ttl_idle_secs: self.ttl_idle_secs,
        })
    }
}

impl GroupRules {
    pub fn limits(&self) -> LimitSpec {
        LimitSpec {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            ttl_idle_secs: self.ttl_idle_secs,
        }
    }
}

impl Default for LimitRules {
    fn default() -> Self {
        Self {
            defaults: default_limits(),
            anonymous: None,
            routes: Vec::new(),
            keys: HashMap::new(),
            groups: BTreeMap::new(),
        }
    }
}

impl LimitRules {
    /// Rules with the given defaults and nothing else.
    pub fn with_defaults(defaults: LimitSpec) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    /// Load and validate rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load and validate rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: LimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| DynLimitsError::Rules(format!("Failed to parse limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check every number, template and group membership.
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate("defaults")?;
        if let Some(anonymous) = &self.anonymous {
            anonymous.validate("anonymous")?;
        }

        for (key, rules) in &self.keys {
            if let Some(limits) = rules.limits(&self.defaults) {
                limits.validate(&format!("key '{key}'"))?;
            }
            for (endpoint, limits) in &rules.endpoints {
                limits.validate(&format!("key '{key}' endpoint '{endpoint}'"))?;
            }
        }

        for (name, group) in &self.groups {
            group.limits().validate(&format!("group '{name}'"))?;
            if group.endpoints.is_empty() {
                return Err(DynLimitsError::Rules(format!(
                    "group '{name}' has no endpoints"
                )));
            }
        }

        self.templates()?;
        SharedPolicy::from_rules(self)?;
        Ok(())
    }

    /// Endpoint templates known to the rules: the declared routes plus every
    /// per-key endpoint override.
    pub fn templates(&self) -> Result<Vec<PathTemplate>> {
        self.routes
            .iter()
            .map(String::as_str)
            .chain(
                self.keys
                    .values()
                    .flat_map(|rules| rules.endpoints.keys().map(String::as_str)),
            )
            .map(PathTemplate::parse)
            .collect()
    }

    /// Resolve the limits for a dynamic domain.
    ///
    /// Lookup order: the key's endpoint override, the key's own limits, the
    /// anonymous limits for anonymous callers, then the global defaults.
    pub fn limits_for_key(&self, api_key: &ApiKey, endpoint: Option<&str>) -> LimitSpec {
        let resolved = match api_key {
            ApiKey::Key(key) => self.keys.get(key).and_then(|rules| {
                endpoint
                    .and_then(|ep| rules.endpoints.get(ep).copied())
                    .or_else(|| rules.limits(&self.defaults))
            }),
            ApiKey::Anonymous => self.anonymous,
        };
        self.with_default_ttl(resolved.unwrap_or(self.defaults))
    }

    /// Resolve the limits for a shared group.
    pub fn limits_for_group(&self, group: &str) -> LimitSpec {
        let spec = self
            .groups
            .get(group)
            .map(GroupRules::limits)
            .unwrap_or(self.defaults);
        self.with_default_ttl(spec)
    }

    /// Whether any bucket created under these rules can ever be evicted.
    pub fn has_idle_ttl(&self) -> bool {
        self.defaults.ttl_idle_secs.is_some()
            || self.anonymous.is_some_and(|a| a.ttl_idle_secs.is_some())
            || self.keys.values().any(|k| {
                k.ttl_idle_secs.is_some() || k.endpoints.values().any(|e| e.ttl_idle_secs.is_some())
            })
            || self.groups.values().any(|g| g.ttl_idle_secs.is_some())
    }

    fn with_default_ttl(&self, mut spec: LimitSpec) -> LimitSpec {
        if spec.ttl_idle_secs.is_none() {
            spec.ttl_idle_secs = self.defaults.ttl_idle_secs;
        }
        spec
    }
}

/// Where the rules come from: an optional YAML rules file plus an optional
/// indexed JSON catalog merged on top.
#[derive(Debug, Clone, Default)]
pub struct RulesSource {
    pub rules_path: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
}

impl RulesSource {
    pub fn new(rules_path: Option<PathBuf>, catalog_path: Option<PathBuf>) -> Self {
        Self {
            rules_path,
            catalog_path,
        }
    }

    /// Whether anything would be read from disk.
    pub fn has_files(&self) -> bool {
        self.rules_path.is_some() || self.catalog_path.is_some()
    }

    /// Read every configured file and build a validated rule set.
    pub fn load(&self) -> Result<LimitRules> {
        let mut rules = match &self.rules_path {
            Some(path) => LimitRules::from_file(path)?,
            None => LimitRules::default(),
        };

        if let Some(path) = &self.catalog_path {
            let catalog = IndexedCatalog::from_file(path)?;
            let merged = catalog.merge_into(&mut rules);
            info!(
                path = %path.display(),
                merged = merged,
                "Merged catalog limits into rules"
            );
            rules.validate()?;
        }

        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> ApiKey {
        ApiKey::Key(k.to_string())
    }

    #[test]
    fn test_parse_full_rules() {
        let yaml = r#"
defaults: { capacity: 60, refill_rate: 1.0, ttl_idle_secs: 300 }
anonymous: { capacity: 1, refill_rate: 0.1 }
routes: [ "/endpoint_a/{id}" ]
keys:
  "000001":
    capacity: 1
    refill_rate: 1000
    endpoints:
      /foo: { capacity: 10, refill_rate: 5 }
groups:
  shared_foo:
    capacity: 10
    refill_rate: 0
    endpoints:
      - /foo
      - { path: /bar, port: 7902 }
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();

        assert_eq!(rules.defaults.capacity, 60.0);
        assert_eq!(rules.routes.len(), 1);
        assert_eq!(rules.keys["000001"].endpoints.len(), 1);

        let group = &rules.groups["shared_foo"];
        assert_eq!(group.endpoints[0], GroupEndpoint::Path("/foo".to_string()));
        assert_eq!(group.endpoints[1].path(), "/bar");
        assert_eq!(group.endpoints[1].port(), Some(7902));
    }

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let rules = LimitRules::from_yaml("{}").unwrap();
        assert_eq!(rules.defaults, default_limits());
        assert!(rules.keys.is_empty());
        assert!(rules.groups.is_empty());
    }

    #[test]
    fn test_lookup_order() {
        let yaml = r#"
defaults: { capacity: 60, refill_rate: 1.0 }
anonymous: { capacity: 2, refill_rate: 0.5 }
keys:
  gold:
    capacity: 100
    refill_rate: 50
    endpoints:
      /slow: { capacity: 5, refill_rate: 1 }
  partial:
    refill_rate: 7
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();

        let spec = rules.limits_for_key(&key("gold"), Some("/slow"));
        assert_eq!((spec.capacity, spec.refill_rate), (5.0, 1.0));

        let spec = rules.limits_for_key(&key("gold"), Some("/fast"));
        assert_eq!((spec.capacity, spec.refill_rate), (100.0, 50.0));

        let spec = rules.limits_for_key(&key("partial"), None);
        assert_eq!((spec.capacity, spec.refill_rate), (60.0, 7.0));

        let spec = rules.limits_for_key(&ApiKey::Anonymous, Some("/slow"));
        assert_eq!((spec.capacity, spec.refill_rate), (2.0, 0.5));

        let spec = rules.limits_for_key(&key("unknown"), Some("/slow"));
        assert_eq!((spec.capacity, spec.refill_rate), (60.0, 1.0));
    }

    #[test]
    fn test_endpoint_override_only_key_falls_back_to_defaults() {
        let yaml = r#"
defaults: { capacity: 60, refill_rate: 1.0 }
keys:
  k:
    endpoints:
      /a: { capacity: 3, refill_rate: 3 }
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        let spec = rules.limits_for_key(&key("k"), Some("/b"));
        assert_eq!(spec.capacity, 60.0);
    }

    #[test]
    fn test_anonymous_falls_back_to_defaults() {
        let rules = LimitRules::with_defaults(LimitSpec::new(4.0, 2.0));
        let spec = rules.limits_for_key(&ApiKey::Anonymous, None);
        assert_eq!((spec.capacity, spec.refill_rate), (4.0, 2.0));
    }

    #[test]
    fn test_default_ttl_is_inherited() {
        let yaml = r#"
defaults: { capacity: 60, refill_rate: 1.0, ttl_idle_secs: 120 }
keys:
  k: { capacity: 1, refill_rate: 1 }
groups:
  g:
    capacity: 10
    refill_rate: 0
    ttl_idle_secs: 5
    endpoints: [ /g ]
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.limits_for_key(&key("k"), None).ttl_idle_secs, Some(120));
        assert_eq!(rules.limits_for_group("g").ttl_idle_secs, Some(5));
        assert!(rules.has_idle_ttl());
    }

    #[test]
    fn test_rejects_negative_numbers() {
        let yaml = r#"
keys:
  k: { capacity: -1 }
"#;
        assert!(matches!(
            LimitRules::from_yaml(yaml),
            Err(DynLimitsError::Rules(_))
        ));
    }

    #[test]
    fn test_rejects_bad_route() {
        let yaml = r#"
routes: [ "no-slash" ]
"#;
        assert!(LimitRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_empty_group() {
        let yaml = r#"
groups:
  g: { capacity: 1, refill_rate: 1 }
"#;
        assert!(LimitRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_overlapping_groups() {
        let yaml = r#"
groups:
  a:
    capacity: 10
    refill_rate: 1
    endpoints: [ "/items/{id}" ]
  b:
    capacity: 10
    refill_rate: 1
    endpoints: [ "/items/special" ]
"#;
        assert!(matches!(
            LimitRules::from_yaml(yaml),
            Err(DynLimitsError::GroupOverlap { .. })
        ));
    }

    #[test]
    fn test_templates_include_key_endpoints() {
        let yaml = r#"
routes: [ "/a/{id}" ]
keys:
  k:
    endpoints:
      "/b/*": { capacity: 1, refill_rate: 1 }
"#;
        let rules = LimitRules::from_yaml(yaml).unwrap();
        let templates: Vec<String> = rules
            .templates()
            .unwrap()
            .iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(templates, vec!["/a/{id}".to_string(), "/b/*".to_string()]);
    }

    #[test]
    fn test_source_without_files_gives_defaults() {
        let source = RulesSource::default();
        assert!(!source.has_files());
        let rules = source.load().unwrap();
        assert_eq!(rules.defaults, default_limits());
    }
}
