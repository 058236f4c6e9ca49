//! Domain key to token bucket registry.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::bucket::TokenBucket;
use super::domain::DomainKey;
use super::limiter::RateLimiter;

/// Owns every token bucket, keyed by accounting domain.
///
/// The map is sharded, so lookups for unrelated keys rarely touch the same
/// lock and creation holds only one shard's write lock.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    buckets: DashMap<DomainKey, Arc<TokenBucket>>,
    created: AtomicU64,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bucket for `key`, creating it with `init` on first sight.
    ///
    /// Concurrent first accesses create exactly one bucket; every caller
    /// receives that same bucket.
    pub fn resolve<F>(&self, key: &DomainKey, init: F) -> Arc<TokenBucket>
    where
        F: FnOnce() -> TokenBucket,
    {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let entry = self.buckets.entry(key.clone()).or_insert_with(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            let bucket = init();
            debug!(
                key = %key,
                spec = ?bucket.spec(),
                "Creating token bucket"
            );
            Arc::new(bucket)
        });
        Arc::clone(entry.value())
    }

    /// The bucket for `key`, if one exists.
    pub fn get(&self, key: &DomainKey) -> Option<Arc<TokenBucket>> {
        self.buckets.get(key).map(|b| Arc::clone(b.value()))
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Total buckets ever created, including evicted ones.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Every live bucket with its key.
    ///
    /// Shard locks are released before this returns.
    pub fn snapshot(&self) -> Vec<(DomainKey, Arc<TokenBucket>)> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Drop buckets that are idle past their ttl, full, and not referenced
    /// anywhere else. Returns how many were removed.
    ///
    /// The reference count is checked under the shard write lock, and new
    /// references are only handed out under that same lock, so a bucket in
    /// use by an in-flight evaluation is never removed.
    pub fn evict_idle(&self, now: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !(Arc::strong_count(bucket) == 1 && bucket.is_evictable(now)));
        before.saturating_sub(self.buckets.len())
    }

    /// Remove every bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

/// Periodically evict idle buckets from the limiter's registry until
/// `shutdown` flips to `true`.
pub fn spawn_idle_sweep(
    limiter: Arc<RateLimiter>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(interval_secs = every.as_secs_f64(), "Idle bucket sweep started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = limiter.evict_idle();
                    if evicted > 0 {
                        debug!(
                            evicted = evicted,
                            remaining = limiter.registry().len(),
                            "Evicted idle buckets"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Idle bucket sweep stopped");
    })
}
