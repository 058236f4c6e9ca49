use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dynlimits::config::{Cli, DynLimitsConfig, LoggingConfig};
use dynlimits::gateway::GatewayServer;
use dynlimits::ratelimit::{
    spawn_idle_sweep, AdaptivePolicy, DynamicMode, MonotonicClock, RateLimiter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DynLimitsConfig::from_cli(&cli)?;

    init_tracing(&config.logging);

    info!("Starting dynlimits admission gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen = ?config.server.listen_addrs,
        admin = ?config.server.admin_addr,
        scope = ?config.rate_limiting.dynamic_scope,
        "Configuration loaded"
    );

    // Invalid rules are fatal at startup.
    let source = config.rate_limiting.rules_source();
    let rules = source.load()?;
    let limiter = Arc::new(RateLimiter::with_clock(
        rules,
        config.rate_limiting.dynamic_scope,
        Arc::new(MonotonicClock::new()),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let mut tasks = Vec::new();

    if limiter.has_idle_ttl() {
        tasks.push(spawn_idle_sweep(
            Arc::clone(&limiter),
            Duration::from_secs(config.rate_limiting.sweep_interval_secs),
            shutdown_rx.clone(),
        ));
    }

    let adaptive = config.rate_limiting.adaptive.clone();
    match adaptive.mode() {
        DynamicMode::Adaptive => {
            if adaptive.reload_catalog && !source.has_files() && adaptive.load.is_none() {
                warn!("Adaptive reload enabled without rules or catalog files");
            }
            let policy = AdaptivePolicy::new(Arc::clone(&limiter), adaptive, source);
            tasks.push(policy.spawn(shutdown_rx.clone()));
        }
        DynamicMode::Static => info!("Dynamic limits are static"),
    }

    let server = GatewayServer::new(&config.server, limiter)?;

    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    // Run the gateway until a shutdown signal arrives
    let result = server.serve_with_shutdown(shutdown_rx).await;
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task failed");
        }
    }

    result?;
    info!("dynlimits admission gateway stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dynlimits={}", logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
