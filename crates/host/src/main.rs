//! Bus host entry point.

use std::net::SocketAddr;

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
    let config = host::config::Config::from_env();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics_addr: SocketAddr = config
        .metrics_addr()
        .parse()
        .expect("invalid metrics listener address");
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("failed to install Prometheus exporter");
    tracing::info!(%metrics_addr, "serving Prometheus metrics");

    let bus = host::build_bus(config.bus.clone())
        .await
        .expect("failed to build message bus");
    let workers = bus.start_workers().await;
    let poller = bus.timeout_poller().spawn();
    tracing::info!(
        endpoint = %config.bus.endpoint,
        workers = workers.len(),
        "bus host running"
    );

    shutdown_signal().await;

    poller.stop().await;
    workers.shutdown().await;
    tracing::info!("bus host shut down gracefully");
}
