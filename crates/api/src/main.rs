//! Query service entry point.

use api::{Config, Pipeline};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration, then initialize tracing from its filter
    let config = Config::from_env();
    let filter = match &config {
        Ok(config) => config.log_filter(),
        Err(_) => EnvFilter::new("info"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Refuse to start on a bad value
    let config = match config {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            std::process::exit(1);
        }
    };

    // 3. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 4. Start materializers (and demo publishers, if enabled)
    let pipeline = match Pipeline::start(&config).await {
        Ok(pipeline) => pipeline,
        Err(error) => {
            tracing::error!(%error, "failed to start pipeline");
            std::process::exit(1);
        }
    };

    // 5. Build the application
    let app = api::create_app(
        pipeline.record_queries(&config),
        Some(pipeline.greeter(&config)),
        metrics_handle,
    );

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, group = %config.consumer_group, "starting query service");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Drain the pipeline
    if let Err(error) = pipeline.shutdown().await {
        tracing::error!(%error, "pipeline stopped with a fault");
        std::process::exit(1);
    }
    tracing::info!("server shut down gracefully");
}
