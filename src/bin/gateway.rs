// ============================================================================
// API Gateway Service
// ============================================================================
//
// Single entry point for client requests to the backend services:
// - Rate limiting with burst credit (Redis or in-process counters)
// - Request routing by path prefix
// - Round-robin load balancing between service instances
// - Per-instance circuit breaking
//
// ============================================================================

use anyhow::{Context, Result};
use secops_gateway::config::Config;
use secops_gateway::context::GatewayContext;
use secops_gateway::gateway::router::{serve, GatewayRouter};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    config.logging.init_tracing();

    info!("=== API Gateway Service Starting ===");
    info!("Port: {}", config.port);
    info!(
        "Services: {}",
        config
            .services
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!(
        "Circuit breaker: threshold={}, recovery={}s",
        config.circuit_breaker.failure_threshold, config.circuit_breaker.recovery_timeout_secs
    );

    let port = config.port;
    let health_interval = config.health_check_interval_secs;

    // Initialize dependencies
    let ctx = GatewayContext::from_config(config).context("Failed to initialize gateway")?;

    let monitor = if health_interval > 0 {
        Some(
            ctx.registry
                .clone()
                .spawn_health_monitor(Duration::from_secs(health_interval)),
        )
    } else {
        info!("Background health monitor disabled (HEALTH_CHECK_INTERVAL_SECS=0)");
        None
    };

    let app = GatewayRouter::build(ctx);

    // Start server
    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .context("Failed to parse bind address")?;

    info!("API Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    serve(listener, app, shutdown_signal())
        .await
        .context("Failed to start server")?;

    if let Some(handle) = monitor {
        handle.abort();
    }

    info!("API Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
