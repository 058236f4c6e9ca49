//! Core admission engine.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::bucket::{BucketStatus, LimitSpec, TokenBucket};
use super::clock::{Clock, MonotonicClock};
use super::domain::{ApiKey, DomainKey, DynamicScope, Endpoint};
use super::registry::KeyRegistry;
use super::route::RouteTable;
use super::rules::LimitRules;
use super::shared::SharedPolicy;
use crate::error::Result;

/// Rules compiled into the lookup structures used on every request.
#[derive(Debug)]
struct RuleSet {
    rules: LimitRules,
    routes: RouteTable,
    shared: SharedPolicy,
}

impl RuleSet {
    fn compile(rules: LimitRules) -> Result<Self> {
        rules.validate()?;
        let routes = RouteTable::new(rules.templates()?);
        let shared = SharedPolicy::from_rules(&rules)?;
        Ok(Self {
            rules,
            routes,
            shared,
        })
    }

    fn domain_for(&self, api_key: &ApiKey, endpoint: &Endpoint, scope: DynamicScope) -> DomainKey {
        if let Some(group) = self.shared.group_for(endpoint) {
            return DomainKey::shared(group);
        }
        match scope {
            DynamicScope::Key => DomainKey::dynamic(api_key.clone(), None),
            // Paths outside every template are charged to the key itself.
            DynamicScope::KeyEndpoint => {
                DomainKey::dynamic(api_key.clone(), self.routes.normalize(&endpoint.path))
            }
        }
    }

    fn limits_for(&self, domain: &DomainKey) -> LimitSpec {
        match domain {
            DomainKey::Dynamic { api_key, endpoint } => {
                self.rules.limits_for_key(api_key, endpoint.as_deref())
            }
            DomainKey::Shared { group } => self
                .shared
                .limits(group)
                .unwrap_or_else(|| self.rules.limits_for_group(group)),
        }
    }
}

/// The result of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// The accounting domain the request was charged to
    pub domain: DomainKey,
    pub status: BucketStatus,
}

/// The admission engine.
///
/// Maps each request to an accounting domain, resolves that domain's bucket
/// through the registry and evaluates it. Thread-safe; share it behind an
/// `Arc` across every listener.
#[derive(Debug)]
pub struct RateLimiter {
    registry: KeyRegistry,
    rules: RwLock<Arc<RuleSet>>,
    clock: Arc<dyn Clock>,
    scope: DynamicScope,
    /// Adaptive multiplier for dynamic buckets, as `f64` bits
    scale: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter on the monotonic clock with per-endpoint dynamic
    /// domains.
    pub fn new(rules: LimitRules) -> Result<Self> {
        Self::with_clock(rules, DynamicScope::default(), Arc::new(MonotonicClock::new()))
    }

    /// Create a limiter with an explicit dynamic scope and time source.
    pub fn with_clock(
        rules: LimitRules,
        scope: DynamicScope,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let rules = RuleSet::compile(rules)?;
        info!(
            scope = ?scope,
            keys = rules.rules.keys.len(),
            groups = rules.shared.group_count(),
            routes = rules.routes.len(),
            "Rate limiter initialized"
        );

        Ok(Self {
            registry: KeyRegistry::new(),
            rules: RwLock::new(Arc::new(rules)),
            clock,
            scope,
            scale: AtomicU64::new(1.0f64.to_bits()),
        })
    }

    /// Decide whether a request from `api_key` to `endpoint` is admitted.
    ///
    /// Never blocks waiting for capacity.
    pub fn check(&self, api_key: &ApiKey, endpoint: &Endpoint) -> Admission {
        let domain = self.rules.read().domain_for(api_key, endpoint, self.scope);

        trace!(
            key = %api_key,
            endpoint = %endpoint,
            domain = %domain,
            "Checking rate limit"
        );

        let bucket = self.registry.resolve(&domain, || self.new_bucket(&domain));
        let status = bucket.evaluate(self.clock.now());

        if !status.decision.is_admit() {
            debug!(
                domain = %domain,
                limit = status.limit,
                "Rate limit exceeded"
            );
        }

        Admission { domain, status }
    }

    // Runs under the registry's shard lock, so it reads the newest rules: a
    // concurrent `replace_rules` either sees this bucket in its snapshot or
    // has already swapped the rules it reads here.
    fn new_bucket(&self, domain: &DomainKey) -> TokenBucket {
        let now = self.clock.now();
        let spec = self.rules.read().limits_for(domain);
        let bucket = TokenBucket::new(spec, now);
        let scale = self.scale();
        if domain.is_dynamic() && scale < 1.0 {
            bucket.set_scale(scale, now);
        }
        bucket
    }

    /// The accounting domain a request would be charged to.
    pub fn domain_for(&self, api_key: &ApiKey, endpoint: &Endpoint) -> DomainKey {
        self.rules.read().domain_for(api_key, endpoint, self.scope)
    }

    /// Swap in new rules and push the new limits into every live bucket.
    ///
    /// Buckets keep their accrued tokens. Invalid rules are rejected and the
    /// current ones stay active. Returns the number of buckets updated.
    pub fn replace_rules(&self, rules: LimitRules) -> Result<usize> {
        let compiled = Arc::new(RuleSet::compile(rules)?);
        *self.rules.write() = Arc::clone(&compiled);

        let now = self.clock.now();
        let mut updated = 0;
        for (domain, bucket) in self.registry.snapshot() {
            let spec = compiled.limits_for(&domain);
            if bucket.spec() != spec {
                bucket.apply_spec(spec, now);
                updated += 1;
            }
        }

        info!(
            keys = compiled.rules.keys.len(),
            groups = compiled.shared.group_count(),
            updated = updated,
            "Limit rules replaced"
        );
        Ok(updated)
    }

    /// Scale the refill rate of every dynamic bucket, present and future.
    ///
    /// Shared groups are not affected. Returns the number of buckets touched.
    pub fn rescale_dynamic(&self, scale: f64) -> usize {
        let scale = if scale.is_nan() { 1.0 } else { scale.clamp(0.0, 1.0) };
        self.scale.store(scale.to_bits(), Ordering::Relaxed);

        let now = self.clock.now();
        let mut touched = 0;
        for (domain, bucket) in self.registry.snapshot() {
            if domain.is_dynamic() {
                bucket.set_scale(scale, now);
                touched += 1;
            }
        }
        touched
    }

    /// The adaptive multiplier currently applied to dynamic buckets.
    pub fn scale(&self) -> f64 {
        f64::from_bits(self.scale.load(Ordering::Relaxed))
    }

    /// Drain the admitted and rejected counters of every dynamic bucket.
    pub fn drain_dynamic_counts(&self) -> (u64, u64) {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|(domain, _)| domain.is_dynamic())
            .map(|(_, bucket)| bucket.take_counts())
            .fold((0, 0), |(a, r), (da, dr)| (a + da, r + dr))
    }

    /// Evict idle buckets as of the limiter's clock.
    pub fn evict_idle(&self) -> usize {
        self.registry.evict_idle(self.clock.now())
    }

    /// Whether any configured limit carries an idle ttl.
    pub fn has_idle_ttl(&self) -> bool {
        self.rules.read().rules.has_idle_ttl()
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn scope(&self) -> DynamicScope {
        self.scope
    }

    /// Current reading of the limiter's clock.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Get the number of tracked domains.
    pub fn domain_count(&self) -> usize {
        self.registry.len()
    }

    /// Drop all bucket state.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.registry.clear();
    }
}
