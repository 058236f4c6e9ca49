//! Rate limiting logic and state management.

mod bucket;
mod catalog;
mod clock;
mod domain;
mod dynamic;
mod limiter;
mod registry;
mod route;
mod rules;
mod shared;

pub use bucket::{BucketStatus, Decision, LimitSpec, TokenBucket, MICROS_PER_TOKEN};
pub use catalog::{per_minute_limits, IndexedCatalog};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use domain::{ApiKey, DomainKey, DynamicScope, Endpoint};
pub use dynamic::{AdaptiveConfig, AdaptivePolicy, DynamicMode, LoadConfig, TickReport};
pub use limiter::{Admission, RateLimiter};
pub use registry::{spawn_idle_sweep, KeyRegistry};
pub use route::{PathTemplate, RouteTable};
pub use rules::{GroupEndpoint, GroupRules, KeyRules, LimitRules, RulesSource};
pub use shared::{EndpointMatcher, SharedPolicy};
