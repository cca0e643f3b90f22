//! Projection worker entry point.

use std::net::SocketAddr;

use common::PartitionKey;
use event_store::{EventStore, PostgresEventStore};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::{Config, WorkerError};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
async fn main() -> worker::Result<()> {
    let config = Config::from_env()?;

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Serve Prometheus metrics
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| WorkerError::Metrics(e.to_string()))?;
    worker::describe_metrics();
    tracing::info!(%metrics_addr, "serving metrics");

    // 3. Connect the store. The worker only reads the log; inline views such as
    //    cart details are registered by the processes that append.
    let store =
        PostgresEventStore::connect(&config.database_url, config.max_connections).await?;
    store.init().await?;
    if config.partition != PartitionKey::default() {
        store.create_partition(&config.partition).await?;
    }

    // 4. Process until shutdown, then release the lease and the pool
    let outcome = worker::run(store.clone(), &config, shutdown_signal()).await;
    store.close().await?;
    tracing::info!("worker shut down gracefully");
    outcome
}
