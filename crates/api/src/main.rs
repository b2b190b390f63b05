use std::sync::Arc;

use anyhow::Context;

use taskpulse_api::app::{self, services};
use taskpulse_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    taskpulse_observability::init(config.log_format);

    let services = Arc::new(
        services::build_services(&config)
            .await
            .context("failed to build services")?,
    );
    let background = services.start();

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        queue = %services.queue,
        transport = services.transport,
        "listening"
    );

    axum::serve(listener, app::build_app(services.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    background.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
