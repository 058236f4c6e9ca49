//! Admin endpoints: health and statistics.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::service::GatewayStats;
use crate::ratelimit::RateLimiter;

/// Body of `GET /stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub instance_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Buckets currently held by the registry
    pub tracked_domains: usize,
    /// Buckets created since start, including evicted ones
    pub created_domains: u64,
    pub admitted: u64,
    pub rejected: u64,
    /// Adaptive multiplier on dynamic refill rates
    pub scale: f64,
}

struct AdminState {
    limiter: Arc<RateLimiter>,
    stats: Arc<GatewayStats>,
}

pub fn admin_router(limiter: Arc<RateLimiter>, stats: Arc<GatewayStats>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/stats", get(handle_stats))
        .with_state(Arc::new(AdminState { limiter, stats }))
}

async fn handle_stats(State(state): State<Arc<AdminState>>) -> Json<StatsSnapshot> {
    Json(StatsSnapshot {
        instance_id: state.stats.instance_id(),
        started_at: state.stats.started_at(),
        tracked_domains: state.limiter.domain_count(),
        created_domains: state.limiter.registry().created_count(),
        admitted: state.stats.admitted(),
        rejected: state.stats.rejected(),
        scale: state.limiter.scale(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ApiKey, Decision, Endpoint, LimitRules};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router() -> (Router, Arc<RateLimiter>, Arc<GatewayStats>) {
        let limiter = Arc::new(RateLimiter::new(LimitRules::default()).unwrap());
        let stats = Arc::new(GatewayStats::new());
        (admin_router(limiter.clone(), stats.clone()), limiter, stats)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_stats_reports_counters() {
        let (app, limiter, stats) = router();
        limiter.check(&ApiKey::Key("a".to_string()), &Endpoint::new(80, "/x"));
        stats.record(Decision::Admit);
        stats.record(Decision::Reject);

        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let snapshot: StatsSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.instance_id, stats.instance_id());
        assert_eq!(snapshot.tracked_domains, 1);
        assert_eq!(snapshot.created_domains, 1);
        assert_eq!(snapshot.admitted, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.scale, 1.0);
    }

    #[tokio::test]
    async fn test_unknown_admin_path_is_not_found() {
        let (app, _, _) = router();
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
