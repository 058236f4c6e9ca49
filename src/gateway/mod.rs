//! HTTP admission gateway.

mod admin;
mod server;
mod service;

pub use admin::{admin_router, StatsSnapshot};
pub use server::{wait_for_shutdown, GatewayServer};
pub use service::{
    admission_router, AdmissionState, GatewayStats, RATELIMIT_LIMIT, RATELIMIT_REMAINING,
    RATELIMIT_RESET,
};
