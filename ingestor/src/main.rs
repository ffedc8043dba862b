use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use sensor_ingestor::config::Config;
use sensor_ingestor::db::{self, PgStore};
use sensor_ingestor::dispatch::{self, run_dispatcher};
use sensor_ingestor::fanout::FanOut;
use sensor_ingestor::liveness::LivenessMonitor;
use sensor_ingestor::metrics;
use sensor_ingestor::mqtt;
use sensor_ingestor::processor::Processor;
use sensor_ingestor::rest::{self, AppState};
use sensor_ingestor::store::Stores;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting sensor ingestor");
    info!("MQTT broker: {}:{}", config.mqtt.broker, config.mqtt.port);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());

    metrics::init_metrics();

    let pool = db::make_pool(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to database")?;
    let stores = Stores::from_backend(Arc::new(PgStore::new(pool)));

    let shutdown = CancellationToken::new();
    let fanout = Arc::new(FanOut::new(config.fanout_capacity));
    let processor = Arc::new(Processor::new(stores.clone(), fanout.clone(), config.rules));

    info!("Channel capacity: {}", config.channel_capacity);
    let (ingress, rx) = dispatch::channel(config.channel_capacity);
    let dispatcher_handle = tokio::spawn(run_dispatcher(
        rx,
        processor.clone(),
        config.lane_capacity,
    ));

    let mqtt_handle = tokio::spawn(mqtt::run_mqtt(
        config.mqtt.clone(),
        ingress.clone(),
        shutdown.clone(),
    ));

    let monitor = Arc::new(LivenessMonitor::new(
        stores.clone(),
        processor.alert_publisher(),
        config.liveness,
    ));
    let liveness_handle = tokio::spawn(monitor.run(shutdown.clone()));

    let state = AppState {
        stores,
        ingress,
        fanout: fanout.clone(),
        shutdown: shutdown.clone(),
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
        {
            error!("HTTP server error: {}", e);
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    // Stop intake first; the dispatcher finishes once every ingress handle
    // is gone, which lets in-flight readings complete.
    shutdown.cancel();
    fanout.close_all().await;

    match mqtt_handle.await {
        Ok(Err(e)) => error!("MQTT consumer stopped with error: {}", e),
        Err(e) => error!("MQTT task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = server_handle.await {
        error!("HTTP server task failed: {}", e);
    }
    if let Err(e) = liveness_handle.await {
        error!("Liveness task failed: {}", e);
    }
    if let Err(e) = dispatcher_handle.await {
        error!("Dispatcher task failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
