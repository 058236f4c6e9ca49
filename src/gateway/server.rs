//! HTTP listeners for the admission gateway.

use axum::http::HeaderName;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use super::admin::admin_router;
use super::service::{admission_router, AdmissionState, GatewayStats};
use crate::config::ServerConfig;
use crate::error::{DynLimitsError, Result};
use crate::ratelimit::RateLimiter;

/// The admission gateway: one listener per configured address, all backed by
/// the same limiter, plus an optional admin listener.
pub struct GatewayServer {
    listen_addrs: Vec<SocketAddr>,
    admin_addr: Option<SocketAddr>,
    api_key_header: HeaderName,
    limiter: Arc<RateLimiter>,
    stats: Arc<GatewayStats>,
}

impl GatewayServer {
    pub fn new(config: &ServerConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        if config.listen_addrs.is_empty() {
            return Err(DynLimitsError::Config(
                "at least one listen address is required".to_string(),
            ));
        }

        Ok(Self {
            listen_addrs: config.listen_addrs.clone(),
            admin_addr: config.admin_addr,
            api_key_header: config.api_key_header()?,
            limiter,
            stats: Arc::new(GatewayStats::new()),
        })
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        Arc::clone(&self.stats)
    }

    /// The admission router for a listener bound to `port`.
    pub fn router_for_port(&self, port: u16) -> Router {
        admission_router(AdmissionState {
            limiter: Arc::clone(&self.limiter),
            stats: Arc::clone(&self.stats),
            api_key_header: self.api_key_header.clone(),
            port,
        })
    }

    pub fn admin_router(&self) -> Router {
        admin_router(Arc::clone(&self.limiter), Arc::clone(&self.stats))
    }

    /// Bind every listener and serve until `shutdown` flips to `true`.
    ///
    /// Fails if any address cannot be bound or any listener stops with an
    /// error.
    pub async fn serve_with_shutdown(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut listeners = Vec::with_capacity(self.listen_addrs.len() + 1);

        for addr in &self.listen_addrs {
            let listener = TcpListener::bind(addr).await?;
            let local = listener.local_addr()?;
            info!(addr = %local, "Admission gateway listening");
            let router = self.router_for_port(local.port());
            listeners.push(tokio::spawn(serve(listener, router, shutdown.clone())));
        }

        if let Some(addr) = self.admin_addr {
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %listener.local_addr()?, "Admin listener started");
            listeners.push(tokio::spawn(serve(listener, self.admin_router(), shutdown.clone())));
        }

        let results = futures::future::try_join_all(listeners)
            .await
            .map_err(|e| DynLimitsError::Io(std::io::Error::other(e)))?;

        for result in results {
            result.map_err(|e| {
                error!(error = %e, "Listener failed");
                DynLimitsError::Io(e)
            })?;
        }

        info!(
            admitted = self.stats.admitted(),
            rejected = self.stats.rejected(),
            "Admission gateway stopped"
        );
        Ok(())
    }
}

async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
}

/// Resolve once `shutdown` holds `true` or its sender is gone.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
