//! Dynamic limit policy.
//!
//! In static mode dynamic-domain limits are whatever the rules say, for the
//! lifetime of the process. In adaptive mode a periodic task recomputes them
//! from one or both of two signals:
//!
//! - **reload**: the rules and catalog files are re-read and the new limits
//!   are pushed into live buckets;
//! - **load**: the aggregate admitted rate of all dynamic buckets is compared
//!   with a target, and the refill rate of every dynamic bucket is scaled
//!   down multiplicatively when over it or back up additively when under it.
//!
//! Neither signal resets accrued tokens.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;
use super::rules::RulesSource;
use crate::error::{DynLimitsError, Result};

fn default_interval_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_decrease_factor() -> f64 {
    0.5
}

fn default_increase_step() -> f64 {
    0.1
}

fn default_min_scale() -> f64 {
    0.1
}

/// Adaptive recomputation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Run the adaptive task at all
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between recomputations
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Re-read rules and catalog files on every tick
    #[serde(default = "default_true")]
    pub reload_catalog: bool,
    /// Scale dynamic rates from the observed admitted rate
    #[serde(default)]
    pub load: Option<LoadConfig>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            reload_catalog: true,
            load: None,
        }
    }
}

/// Additive-increase, multiplicative-decrease settings for the load signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Aggregate admitted requests per second across dynamic domains
    pub target_rate: f64,
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
    #[serde(default = "default_increase_step")]
    pub increase_step: f64,
    #[serde(default = "default_min_scale")]
    pub min_scale: f64,
}

impl LoadConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.target_rate.is_finite() || self.target_rate <= 0.0 {
            return Err(DynLimitsError::Config(format!(
                "adaptive.load.target_rate must be positive, got {}",
                self.target_rate
            )));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err(DynLimitsError::Config(format!(
                "adaptive.load.decrease_factor must be in (0, 1), got {}",
                self.decrease_factor
            )));
        }
        if !self.increase_step.is_finite() || self.increase_step <= 0.0 {
            return Err(DynLimitsError::Config(format!(
                "adaptive.load.increase_step must be positive, got {}",
                self.increase_step
            )));
        }
        if !(self.min_scale > 0.0 && self.min_scale <= 1.0) {
            return Err(DynLimitsError::Config(format!(
                "adaptive.load.min_scale must be in (0, 1], got {}",
                self.min_scale
            )));
        }
        Ok(())
    }

    /// The scale to apply after observing `observed_rate` at `current` scale.
    pub fn next_scale(&self, current: f64, observed_rate: f64) -> f64 {
        if observed_rate > self.target_rate {
            (current * self.decrease_factor).max(self.min_scale)
        } else {
            (current + self.increase_step).min(1.0)
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.interval_secs == 0 {
            return Err(DynLimitsError::Config(
                "adaptive.interval_secs must be at least 1".to_string(),
            ));
        }
        if let Some(load) = &self.load {
            load.validate()?;
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// The policy mode this configuration selects.
    pub fn mode(&self) -> DynamicMode {
        if self.enabled && (self.reload_catalog || self.load.is_some()) {
            DynamicMode::Adaptive
        } else {
            DynamicMode::Static
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicMode {
    /// Limits are fixed by the rules
    Static,
    /// Limits are recomputed periodically
    Adaptive,
}

/// What one recomputation step did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickReport {
    /// Buckets whose limits changed after a reload
    pub reloaded: Option<usize>,
    /// Admitted requests per second observed since the previous tick
    pub observed_rate: Option<f64>,
    /// Scale in effect after the tick
    pub scale: f64,
}

/// Drives adaptive recomputation for one limiter.
#[derive(Debug)]
pub struct AdaptivePolicy {
    limiter: Arc<RateLimiter>,
    config: AdaptiveConfig,
    source: RulesSource,
    last_tick: Duration,
}

impl AdaptivePolicy {
    pub fn new(limiter: Arc<RateLimiter>, config: AdaptiveConfig, source: RulesSource) -> Self {
        let last_tick = limiter.now();
        Self {
            limiter,
            config,
            source,
            last_tick,
        }
    }

    /// Run one recomputation step.
    ///
    /// Each bucket is locked only for its own update, so concurrent
    /// evaluations are never stalled for more than one step.
    pub fn tick(&mut self) -> TickReport {
        let now = self.limiter.now();
        let mut report = TickReport {
            scale: self.limiter.scale(),
            ..TickReport::default()
        };

        if self.config.reload_catalog && self.source.has_files() {
            match self
                .source
                .load()
                .and_then(|rules| self.limiter.replace_rules(rules))
            {
                Ok(updated) => report.reloaded = Some(updated),
                Err(e) => warn!(error = %e, "Keeping previous limit rules"),
            }
        }

        if let Some(load) = &self.config.load {
            let (admitted, rejected) = self.limiter.drain_dynamic_counts();
            let elapsed = now.saturating_sub(self.last_tick).as_secs_f64();
            if elapsed > 0.0 {
                let observed = admitted as f64 / elapsed;
                let current = self.limiter.scale();
                let next = load.next_scale(current, observed);
                if next != current {
                    let touched = self.limiter.rescale_dynamic(next);
                    info!(
                        observed_rate = observed,
                        target_rate = load.target_rate,
                        rejected = rejected,
                        from = current,
                        to = next,
                        buckets = touched,
                        "Adjusted dynamic limit scale"
                    );
                } else {
                    debug!(observed_rate = observed, scale = current, "Dynamic limit scale unchanged");
                }
                report.observed_rate = Some(observed);
                report.scale = next;
            }
        }

        self.last_tick = now;
        report
    }

    /// Run `tick` every `interval_secs` until `shutdown` flips to `true`.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            info!(
                interval_secs = self.config.interval_secs,
                reload = self.config.reload_catalog,
                load = self.config.load.is_some(),
                "Adaptive limit policy started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Adaptive limit policy stopped");
        })
    }
}
