//! Indexed API catalog import.
//!
//! The catalog is a compact JSON document that lists HTTP methods and paths
//! once and refers to them by index:
//!
//! ```json
//! {
//!   "version": { "semver": "v1.0.0", "hash": "abc", "released": "2024-01-01T00:00:00Z" },
//!   "methods": ["GET", "POST"],
//!   "paths": ["/endpoint_1/{id}"],
//!   "endpoints": [{ "p": 0, "m": 0 }],
//!   "apilimits": [{ "key": "000001", "limits": [{ "ep": 0, "rl": 120 }] }]
//! }
//! ```
//!
//! `rl` is a per-minute limit. Each entry becomes a per-key endpoint override
//! with `capacity = rl` and `refill_rate = rl / 60`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, warn};

use super::bucket::LimitSpec;
use super::rules::LimitRules;
use crate::error::{DynLimitsError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogVersion {
    #[serde(default)]
    pub semver: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub released: DateTime<Utc>,
}

/// An endpoint: indices into `paths` and `methods`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDef {
    #[serde(rename = "p")]
    pub path_idx: i64,
    #[serde(rename = "m")]
    pub method_idx: i64,
}

/// A per-minute limit on one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    #[serde(rename = "ep")]
    pub endpoint_idx: i64,
    #[serde(rename = "rl")]
    pub per_minute: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyLimits {
    #[serde(rename = "key")]
    pub api_key: String,
    #[serde(default)]
    pub limits: Vec<EndpointLimit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexedCatalog {
    #[serde(default)]
    pub version: CatalogVersion,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointDef>,
    #[serde(default, rename = "apilimits")]
    pub api_limits: Vec<KeyLimits>,
}

fn lookup<T>(items: &[T], idx: i64) -> Option<&T> {
    usize::try_from(idx).ok().and_then(|i| items.get(i))
}

/// Convert a per-minute limit into bucket limits.
pub fn per_minute_limits(per_minute: u64) -> LimitSpec {
    LimitSpec::new(per_minute as f64, per_minute as f64 / 60.0)
}

impl IndexedCatalog {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&contents)?;

        info!(
            path = %path.display(),
            semver = %catalog.version.semver,
            hash = %catalog.version.hash,
            released = %catalog.version.released,
            "Loaded API catalog"
        );
        Ok(catalog)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Report every index that points outside its list.
    pub fn validate(&self) -> Vec<DynLimitsError> {
        let mut errors = Vec::new();

        for (idx, ep) in self.endpoints.iter().enumerate() {
            if lookup(&self.paths, ep.path_idx).is_none() {
                errors.push(DynLimitsError::Catalog(format!(
                    "bad path index {} in endpoint {}",
                    ep.path_idx, idx
                )));
            }
            if lookup(&self.methods, ep.method_idx).is_none() {
                errors.push(DynLimitsError::Catalog(format!(
                    "bad method index {} in endpoint {}",
                    ep.method_idx, idx
                )));
            }
        }

        for (key_idx, key) in self.api_limits.iter().enumerate() {
            for (limit_idx, limit) in key.limits.iter().enumerate() {
                if lookup(&self.endpoints, limit.endpoint_idx).is_none() {
                    errors.push(DynLimitsError::Catalog(format!(
                        "bad endpoint index {} in apilimits {} limit {}",
                        limit.endpoint_idx, key_idx, limit_idx
                    )));
                }
            }
        }

        errors
    }

    /// Resolve an endpoint index to its `(method, path)`.
    pub fn endpoint(&self, idx: i64) -> Option<(&str, &str)> {
        let def = lookup(&self.endpoints, idx)?;
        let method = lookup(&self.methods, def.method_idx)?;
        let path = lookup(&self.paths, def.path_idx)?;
        Some((method.as_str(), path.as_str()))
    }

    /// Per-key, per-path limits described by the catalog.
    ///
    /// Entries with dangling indices or negative limits are skipped. Limits
    /// are tracked per path, so when a path is listed under several methods
    /// the strictest limit wins.
    pub fn key_limits(&self) -> BTreeMap<String, HashMap<String, LimitSpec>> {
        let mut result: BTreeMap<String, HashMap<String, u64>> = BTreeMap::new();

        for key in &self.api_limits {
            for limit in &key.limits {
                let Some((method, path)) = self.endpoint(limit.endpoint_idx) else {
                    warn!(
                        key = %key.api_key,
                        endpoint = limit.endpoint_idx,
                        "Skipping catalog limit with a dangling endpoint index"
                    );
                    continue;
                };
                let Ok(per_minute) = u64::try_from(limit.per_minute) else {
                    warn!(
                        key = %key.api_key,
                        method = method,
                        path = path,
                        rl = limit.per_minute,
                        "Skipping negative catalog limit"
                    );
                    continue;
                };

                result
                    .entry(key.api_key.clone())
                    .or_default()
                    .entry(path.to_string())
                    .and_modify(|current| *current = (*current).min(per_minute))
                    .or_insert(per_minute);
            }
        }

        result
            .into_iter()
            .map(|(key, paths)| {
                let specs = paths
                    .into_iter()
                    .map(|(path, rl)| (path, per_minute_limits(rl)))
                    .collect();
                (key, specs)
            })
            .collect()
    }

    /// Merge the catalog into `rules` as per-key endpoint overrides.
    ///
    /// Catalog entries replace overrides already present for the same key and
    /// path. Returns the number of overrides written.
    pub fn merge_into(&self, rules: &mut LimitRules) -> usize {
        let errors = self.validate();
        if !errors.is_empty() {
            warn!(errors = errors.len(), "Catalog contains dangling indices");
            for error in &errors {
                warn!(error = %error, "Catalog validation");
            }
        }

        let mut merged = 0;
        for (key, endpoints) in self.key_limits() {
            let entry = rules.keys.entry(key).or_default();
            for (path, spec) in endpoints {
                entry.endpoints.insert(path, spec);
                merged += 1;
            }
        }
        merged
    }
}
