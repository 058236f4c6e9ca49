//! Admission handler.
//!
//! Every request reaching the gateway is answered with `200 OK` when
//! admitted or `429 Too Many Requests` when throttled, plus the
//! `RateLimit-*` headers describing the bucket it was charged to.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ratelimit::{ApiKey, BucketStatus, Decision, Endpoint, RateLimiter};

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Process-wide decision counters.
#[derive(Debug)]
pub struct GatewayStats {
    instance_id: Uuid,
    started_at: DateTime<Utc>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            started_at: Utc::now(),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn record(&self, decision: Decision) {
        let counter = match decision {
            Decision::Admit => &self.admitted,
            Decision::Reject => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-listener handler state.
#[derive(Debug, Clone)]
pub struct AdmissionState {
    pub limiter: Arc<RateLimiter>,
    pub stats: Arc<GatewayStats>,
    pub api_key_header: HeaderName,
    /// Port of the listener this state is bound to
    pub port: u16,
}

/// Router answering every path and method with an admission decision.
pub fn admission_router(state: AdmissionState) -> Router {
    Router::new()
        .fallback(handle_admission)
        .with_state(Arc::new(state))
}

async fn handle_admission(
    State(state): State<Arc<AdmissionState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let raw_key = headers
        .get(&state.api_key_header)
        .map(|v| String::from_utf8_lossy(v.as_bytes()));
    let api_key = ApiKey::from_header(raw_key.as_deref());
    let endpoint = Endpoint::new(state.port, uri.path());

    let admission = state.limiter.check(&api_key, &endpoint);
    state.stats.record(admission.status.decision);

    trace!(
        key = %api_key,
        endpoint = %endpoint,
        domain = %admission.domain,
        decision = ?admission.status.decision,
        remaining = admission.status.remaining,
        "Admission decision"
    );
    if !admission.status.decision.is_admit() {
        debug!(
            key = %api_key,
            endpoint = %endpoint,
            domain = %admission.domain,
            "Request throttled"
        );
    }

    admission_response(&admission.status)
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

fn admission_response(status: &BucketStatus) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(status.remaining));
    if let Some(reset) = status.reset_after {
        headers.insert(RATELIMIT_RESET, HeaderValue::from(ceil_secs(reset)));
    }

    match status.decision {
        Decision::Admit => (StatusCode::OK, headers, "OK").into_response(),
        Decision::Reject => {
            (StatusCode::TOO_MANY_REQUESTS, headers, "Too Many Requests").into_response()
        }
    }
}
