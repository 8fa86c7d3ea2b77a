use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use aeon_infra::config::RuntimeConfig;
use aeon_infra::domain_event_store::DomainEventStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    aeon_observability::init();

    let config = RuntimeConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(
        aeon_api::app::services::build_services(&config)
            .await
            .context("failed to build services")?,
    );

    let recovery = services
        .recovery
        .clone()
        .spawn(config.missed_domain_event_recovery_interval);

    let app = aeon_api::app::build_app(services.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        flows = ?config.flows.discriminators().collect::<Vec<_>>(),
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    recovery.shutdown().await;
    services
        .domain_event_store
        .destroy()
        .await
        .context("failed to close domain event store")?;
    tracing::info!("shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
