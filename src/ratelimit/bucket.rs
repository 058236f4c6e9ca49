//! Token bucket implementation.
//!
//! Token counts are kept in fixed point (micro-tokens) and refill arithmetic
//! carries its sub-micro-token remainder, so long runs of small elapsed
//! intervals add up to exactly what a single large interval would.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DynLimitsError, Result};

/// Fixed-point scale: one token is this many micro-tokens.
pub const MICROS_PER_TOKEN: u64 = 1_000_000;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Configured limits for one accounting domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Maximum burst size, in tokens
    pub capacity: f64,
    /// Tokens restored per second
    pub refill_rate: f64,
    /// Idle time after which a full bucket may be evicted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_idle_secs: Option<u64>,
}

impl LimitSpec {
    /// Create a spec without an idle ttl.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            ttl_idle_secs: None,
        }
    }

    /// Set the idle ttl.
    pub fn with_ttl_idle(mut self, ttl: Duration) -> Self {
        self.ttl_idle_secs = Some(ttl.as_secs());
        self
    }

    /// Idle ttl as a duration, if any.
    pub fn ttl_idle(&self) -> Option<Duration> {
        self.ttl_idle_secs.map(Duration::from_secs)
    }

    /// Check that both numbers are finite and non-negative.
    pub fn validate(&self, context: &str) -> Result<()> {
        if !self.capacity.is_finite() || self.capacity < 0.0 {
            return Err(DynLimitsError::Rules(format!(
                "{context}: capacity must be a non-negative number, got {}",
                self.capacity
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(DynLimitsError::Rules(format!(
                "{context}: refill_rate must be a non-negative number, got {}",
                self.refill_rate
            )));
        }
        Ok(())
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Admit,
    Reject,
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Decision plus the bucket figures reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStatus {
    pub decision: Decision,
    /// Whole tokens the bucket can hold
    pub limit: u64,
    /// Whole tokens left after this decision
    pub remaining: u64,
    /// Time until the bucket is full again; `None` if it never refills
    pub reset_after: Option<Duration>,
}

#[derive(Debug)]
struct BucketState {
    spec: LimitSpec,
    capacity: u64,
    available: u64,
    base_rate: u64,
    scale: f64,
    rate: u64,
    // Refill remainder, in micro-tokens * nanoseconds / second.
    carry: u128,
    last_refill_at: Duration,
    // Last evaluation; refills from sweeps or rescaling do not count.
    last_seen: Duration,
    admitted: u64,
    rejected: u64,
}

fn to_micros(tokens: f64) -> u64 {
    (tokens * MICROS_PER_TOKEN as f64).round() as u64
}

impl BucketState {
    fn refill(&mut self, now: Duration) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed = (now - self.last_refill_at).as_nanos();
        self.last_refill_at = now;

        if self.available >= self.capacity {
            self.carry = 0;
            return;
        }

        let total = elapsed * self.rate as u128 + self.carry;
        let added = total / NANOS_PER_SEC;
        let refilled = self.available as u128 + added;
        if refilled >= self.capacity as u128 {
            self.available = self.capacity;
            self.carry = 0;
        } else {
            self.available = refilled as u64;
            self.carry = total % NANOS_PER_SEC;
        }
    }

    fn reset_after(&self) -> Option<Duration> {
        if self.available >= self.capacity {
            return Some(Duration::ZERO);
        }
        if self.rate == 0 {
            return None;
        }
        let deficit = (self.capacity - self.available) as u128 * NANOS_PER_SEC;
        let nanos = deficit.saturating_sub(self.carry).div_ceil(self.rate as u128);
        Some(Duration::from_nanos(nanos.min(u64::MAX as u128) as u64))
    }

    fn status(&self, decision: Decision) -> BucketStatus {
        BucketStatus {
            decision,
            limit: self.capacity / MICROS_PER_TOKEN,
            remaining: self.available / MICROS_PER_TOKEN,
            reset_after: self.reset_after(),
        }
    }

    fn set_rate(&mut self) {
        self.rate = (self.base_rate as f64 * self.scale).round() as u64;
    }
}

/// A token bucket guarding one accounting domain.
///
/// All state sits behind a single per-bucket mutex, so evaluations of the
/// same bucket are linearizable while distinct buckets never contend.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket whose accounting starts at `now`.
    pub fn new(spec: LimitSpec, now: Duration) -> Self {
        let capacity = to_micros(spec.capacity);
        let base_rate = to_micros(spec.refill_rate);
        Self {
            state: Mutex::new(BucketState {
                spec,
                capacity,
                available: capacity,
                base_rate,
                scale: 1.0,
                rate: base_rate,
                carry: 0,
                last_refill_at: now,
                last_seen: now,
                admitted: 0,
                rejected: 0,
            }),
        }
    }

    /// Refill up to `now`, then try to take one token.
    ///
    /// A timestamp earlier than the last update counts as zero elapsed time.
    pub fn evaluate(&self, now: Duration) -> BucketStatus {
        let mut state = self.state.lock();
        state.refill(now);
        state.last_seen = state.last_seen.max(now);

        let decision = if state.available >= MICROS_PER_TOKEN {
            state.available -= MICROS_PER_TOKEN;
            state.admitted += 1;
            Decision::Admit
        } else {
            state.rejected += 1;
            Decision::Reject
        };

        state.status(decision)
    }

    /// Replace the configured limits, keeping the tokens already accrued.
    pub fn apply_spec(&self, spec: LimitSpec, now: Duration) {
        let mut state = self.state.lock();
        state.refill(now);

        state.spec = spec;
        state.capacity = to_micros(spec.capacity);
        state.base_rate = to_micros(spec.refill_rate);
        state.set_rate();
        if state.available >= state.capacity {
            state.available = state.capacity;
            state.carry = 0;
        }
    }

    /// Scale the configured refill rate, keeping the tokens already accrued.
    ///
    /// `scale` is clamped to `[0, 1]`.
    pub fn set_scale(&self, scale: f64, now: Duration) {
        let scale = if scale.is_nan() { 1.0 } else { scale.clamp(0.0, 1.0) };
        let mut state = self.state.lock();
        state.refill(now);
        state.scale = scale;
        state.set_rate();
    }

    /// Drain the admitted and rejected counters.
    pub fn take_counts(&self) -> (u64, u64) {
        let mut state = self.state.lock();
        let counts = (state.admitted, state.rejected);
        state.admitted = 0;
        state.rejected = 0;
        counts
    }

    /// Whether dropping this bucket at `now` would be unobservable.
    ///
    /// True only when the bucket has a ttl, has not been evaluated for at
    /// least that long, and has refilled to capacity. A recreated bucket starts full, so
    /// nothing is granted or lost by the eviction.
    pub fn is_evictable(&self, now: Duration) -> bool {
        let mut state = self.state.lock();
        let Some(ttl) = state.spec.ttl_idle() else {
            return false;
        };
        if now.saturating_sub(state.last_seen) < ttl {
            return false;
        }
        state.refill(now);
        state.available >= state.capacity
    }

    /// Current token count, refilled as of `now`.
    pub fn available(&self, now: Duration) -> f64 {
        let mut state = self.state.lock();
        state.refill(now);
        state.available as f64 / MICROS_PER_TOKEN as f64
    }

    /// Timestamp of the last accounting update.
    pub fn last_refill_at(&self) -> Duration {
        self.state.lock().last_refill_at
    }

    /// Timestamp of the last evaluation, or of creation.
    pub fn last_seen(&self) -> Duration {
        self.state.lock().last_seen
    }

    /// The configured limits.
    pub fn spec(&self) -> LimitSpec {
        self.state.lock().spec
    }

    /// The adaptive multiplier currently applied to the refill rate.
    pub fn scale(&self) -> f64 {
        self.state.lock().scale
    }

    /// Effective refill rate in tokens per second.
    pub fn effective_rate(&self) -> f64 {
        self.state.lock().rate as f64 / MICROS_PER_TOKEN as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let bucket = TokenBucket::new(LimitSpec::new(3.0, 1.0), Duration::ZERO);

        for _ in 0..3 {
            assert_eq!(bucket.evaluate(Duration::ZERO).decision, Decision::Admit);
        }
        assert_eq!(bucket.evaluate(Duration::ZERO).decision, Decision::Reject);
    }

    #[test]
    fn test_fractional_capacity_floors() {
        let bucket = TokenBucket::new(LimitSpec::new(2.5, 0.0), Duration::ZERO);

        assert!(bucket.evaluate(Duration::ZERO).decision.is_admit());
        assert!(bucket.evaluate(Duration::ZERO).decision.is_admit());
        assert!(!bucket.evaluate(Duration::ZERO).decision.is_admit());
    }

    #[test]
    fn test_capacity_below_one_always_rejects() {
        let bucket = TokenBucket::new(LimitSpec::new(0.5, 100.0), Duration::ZERO);

        assert_eq!(bucket.evaluate(Duration::ZERO).decision, Decision::Reject);
        assert_eq!(bucket.evaluate(Duration::from_secs(10)).decision, Decision::Reject);
    }

    #[test]
    fn test_refill_after_wait() {
        let bucket = TokenBucket::new(LimitSpec::new(2.0, 10.0), Duration::ZERO);
        bucket.evaluate(Duration::ZERO);
        bucket.evaluate(Duration::ZERO);
        assert_eq!(bucket.evaluate(Duration::ZERO).decision, Decision::Reject);

        // 10 tokens/s: one token every 100ms
        assert_eq!(bucket.evaluate(ms(99)).decision, Decision::Reject);
        assert_eq!(bucket.evaluate(ms(100)).decision, Decision::Admit);
        assert_eq!(bucket.evaluate(ms(100)).decision, Decision::Reject);
    }

    #[test]
    fn test_small_intervals_accumulate_without_loss() {
        // 3 tokens/s polled every 1ms: 333 steps leave 0.999 tokens.
        let bucket = TokenBucket::new(LimitSpec::new(1.0, 3.0), Duration::ZERO);
        assert!(bucket.evaluate(Duration::ZERO).decision.is_admit());

        let mut now = Duration::ZERO;
        for _ in 0..333 {
            now += ms(1);
            assert_eq!(bucket.evaluate(now).decision, Decision::Reject);
        }
        // Rejected probes consume nothing; 334us more completes the token.
        now += Duration::from_micros(334);
        assert_eq!(bucket.evaluate(now).decision, Decision::Admit);
    }

    #[test]
    fn test_zero_rate_freezes_bucket() {
        let bucket = TokenBucket::new(LimitSpec::new(1.0, 0.0), Duration::ZERO);
        assert!(bucket.evaluate(Duration::ZERO).decision.is_admit());
        assert_eq!(bucket.evaluate(Duration::from_secs(3600)).decision, Decision::Reject);

        let status = bucket.evaluate(Duration::from_secs(7200));
        assert_eq!(status.reset_after, None);
    }

    #[test]
    fn test_clock_regression_is_clamped() {
        let bucket = TokenBucket::new(LimitSpec::new(1.0, 1.0), Duration::from_secs(10));
        assert!(bucket.evaluate(Duration::from_secs(10)).decision.is_admit());

        // Going back in time refills nothing and keeps the newest timestamp.
        assert_eq!(bucket.evaluate(Duration::from_secs(5)).decision, Decision::Reject);
        assert_eq!(bucket.last_refill_at(), Duration::from_secs(10));

        assert!(bucket.evaluate(Duration::from_secs(11)).decision.is_admit());
    }

    #[test]
    fn test_status_reports_limit_and_remaining() {
        let bucket = TokenBucket::new(LimitSpec::new(5.0, 1.0), Duration::ZERO);

        let status = bucket.evaluate(Duration::ZERO);
        assert_eq!(status.limit, 5);
        assert_eq!(status.remaining, 4);
        assert_eq!(status.reset_after, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_apply_spec_preserves_tokens() {
        let bucket = TokenBucket::new(LimitSpec::new(10.0, 1.0), Duration::ZERO);
        for _ in 0..6 {
            bucket.evaluate(Duration::ZERO);
        }
        assert_eq!(bucket.available(Duration::ZERO), 4.0);

        // Raising the limits keeps the 4 accrued tokens.
        bucket.apply_spec(LimitSpec::new(20.0, 2.0), Duration::ZERO);
        assert_eq!(bucket.available(Duration::ZERO), 4.0);
        assert_eq!(bucket.effective_rate(), 2.0);

        // Shrinking capacity clamps.
        bucket.apply_spec(LimitSpec::new(3.0, 2.0), Duration::ZERO);
        assert_eq!(bucket.available(Duration::ZERO), 3.0);
    }

    #[test]
    fn test_apply_spec_accrues_at_old_rate_first() {
        let bucket = TokenBucket::new(LimitSpec::new(10.0, 1.0), Duration::ZERO);
        for _ in 0..10 {
            bucket.evaluate(Duration::ZERO);
        }

        // 2s at the old rate of 1/s, then switch to 0.
        bucket.apply_spec(LimitSpec::new(10.0, 0.0), Duration::from_secs(2));
        assert_eq!(bucket.available(Duration::from_secs(100)), 2.0);
    }

    #[test]
    fn test_set_scale_changes_effective_rate() {
        let bucket = TokenBucket::new(LimitSpec::new(10.0, 4.0), Duration::ZERO);
        bucket.set_scale(0.5, Duration::ZERO);
        assert_eq!(bucket.effective_rate(), 2.0);
        assert_eq!(bucket.scale(), 0.5);

        bucket.set_scale(7.0, Duration::ZERO);
        assert_eq!(bucket.scale(), 1.0);
        assert_eq!(bucket.spec().refill_rate, 4.0);
    }

    #[test]
    fn test_take_counts_drains() {
        let bucket = TokenBucket::new(LimitSpec::new(1.0, 0.0), Duration::ZERO);
        bucket.evaluate(Duration::ZERO);
        bucket.evaluate(Duration::ZERO);
        bucket.evaluate(Duration::ZERO);

        assert_eq!(bucket.take_counts(), (1, 2));
        assert_eq!(bucket.take_counts(), (0, 0));
    }

    #[test]
    fn test_evictable_only_when_idle_and_full() {
        let spec = LimitSpec::new(2.0, 1.0).with_ttl_idle(Duration::from_secs(60));
        let bucket = TokenBucket::new(spec, Duration::ZERO);
        bucket.evaluate(Duration::ZERO);

        assert!(!bucket.is_evictable(Duration::from_secs(30)));
        assert!(bucket.is_evictable(Duration::from_secs(61)));

        let frozen = TokenBucket::new(
            LimitSpec::new(2.0, 0.0).with_ttl_idle(Duration::from_secs(1)),
            Duration::ZERO,
        );
        frozen.evaluate(Duration::ZERO);
        assert!(!frozen.is_evictable(Duration::from_secs(3600)));

        let no_ttl = TokenBucket::new(LimitSpec::new(2.0, 1.0), Duration::ZERO);
        assert!(!no_ttl.is_evictable(Duration::from_secs(3600)));
    }

    #[test]
    fn test_idle_time_ignores_sweeps_and_rescaling() {
        let spec = LimitSpec::new(90.0, 1.0).with_ttl_idle(Duration::from_secs(60));
        let bucket = TokenBucket::new(spec, Duration::ZERO);
        for _ in 0..90 {
            bucket.evaluate(Duration::ZERO);
        }

        // Idle long enough but still refilling.
        assert!(!bucket.is_evictable(Duration::from_secs(60)));
        bucket.set_scale(1.0, Duration::from_secs(70));
        bucket.apply_spec(spec, Duration::from_secs(80));

        // Full at 90s and untouched by requests since 0s.
        assert!(bucket.is_evictable(Duration::from_secs(90)));
        assert_eq!(bucket.last_seen(), Duration::ZERO);

        bucket.evaluate(Duration::from_secs(100));
        assert_eq!(bucket.last_seen(), Duration::from_secs(100));
        assert!(!bucket.is_evictable(Duration::from_secs(120)));
    }

    #[test]
    fn test_spec_validation() {
        assert!(LimitSpec::new(1.0, 0.0).validate("ok").is_ok());
        assert!(LimitSpec::new(-1.0, 1.0).validate("neg").is_err());
        assert!(LimitSpec::new(1.0, f64::NAN).validate("nan").is_err());
        assert!(LimitSpec::new(f64::INFINITY, 1.0).validate("inf").is_err());
    }

    proptest! {
        #[test]
        fn prop_no_more_than_capacity_without_time(capacity in 0u32..200, extra in 1usize..50) {
            let bucket = TokenBucket::new(LimitSpec::new(capacity as f64, 5.0), Duration::ZERO);
            let admitted = (0..capacity as usize + extra)
                .take_while(|_| bucket.evaluate(Duration::ZERO).decision.is_admit())
                .count();
            prop_assert_eq!(admitted, capacity as usize);
        }

        #[test]
        fn prop_full_refill_after_capacity_over_rate(capacity in 1u32..100, rate in 1u32..10_000) {
            let bucket = TokenBucket::new(LimitSpec::new(capacity as f64, rate as f64), Duration::ZERO);
            for _ in 0..capacity {
                prop_assert!(bucket.evaluate(Duration::ZERO).decision.is_admit());
            }
            prop_assert_eq!(bucket.evaluate(Duration::ZERO).decision, Decision::Reject);

            let wait_nanos = (capacity as u128 * NANOS_PER_SEC).div_ceil(rate as u128);
            let later = Duration::from_nanos(wait_nanos as u64);
            for _ in 0..capacity {
                prop_assert!(bucket.evaluate(later).decision.is_admit());
            }
        }

        #[test]
        fn prop_available_stays_within_capacity(
            capacity in 0u32..50,
            rate in 0u32..1_000,
            steps in proptest::collection::vec(0u64..5_000_000, 1..100),
        ) {
            let bucket = TokenBucket::new(LimitSpec::new(capacity as f64, rate as f64), Duration::ZERO);
            let mut now = Duration::ZERO;
            for step in steps {
                now += Duration::from_nanos(step);
                bucket.evaluate(now);
                let available = bucket.available(now);
                prop_assert!(available >= 0.0);
                prop_assert!(available <= capacity as f64);
            }
        }
    }
}
