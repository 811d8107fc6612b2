// main.rs
use dobot_relay::{
    Relay, build_router,
    config::Settings,
    handlers::cors_layer,
    metrics,
    transport::MqttTransport,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::new()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    if settings.metrics.enabled {
        metrics::setup_metrics(settings.metrics.port)
            .map_err(|e| anyhow::anyhow!("Failed to start metrics exporter: {}", e))?;
        info!("Metrics exported on port {}", settings.metrics.port);
    }

    // An unreachable broker is retried, never fatal.
    let (transport, events) = loop {
        match MqttTransport::connect(&settings.broker, settings.topics.subscriptions()).await {
            Ok(connected) => break connected,
            Err(e) => {
                error!("Failed to connect to broker: {}", e);
                tokio::time::sleep(settings.broker.backoff_max()).await;
            }
        }
    };

    let relay = Relay::new(&settings, Arc::new(transport));
    tokio::spawn(Arc::clone(&relay).run(events));

    let cors = cors_layer(&settings.server.cors_origin)
        .map_err(|e| anyhow::anyhow!("Failed to build CORS layer: {}", e))?;
    let app = build_router(relay, cors);

    let listener = tokio::net::TcpListener::bind(&settings.server.address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind address: {}", e))?;

    info!("Server started on {}", settings.server.address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
