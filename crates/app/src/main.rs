//! Fulfillment process entry point.

use std::sync::Arc;

use app::{Collaborators, Config, FulfillmentSystem};
use common::SystemClock;
use order::InMemoryCatalog;
use payment::InMemoryPaymentGateway;
use tokio::signal;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
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
async fn main() -> app::Result<()> {
    // 1. Configuration and telemetry
    let config = Config::from_env();
    app::telemetry::init_tracing(&config)?;
    let metrics_handle = app::telemetry::install_metrics()?;

    // 2. Services, publishers and consumers
    let system = FulfillmentSystem::build(
        &config,
        Collaborators {
            catalog: Arc::new(InMemoryCatalog::new()),
            gateway: Arc::new(InMemoryPaymentGateway::new()),
            clock: Arc::new(SystemClock),
        },
    )
    .await?;
    let running = system.start();

    // 3. Ops endpoint
    let app = app::create_app(running.services.clone(), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, instance_id = %config.instance_id, "starting fulfillment process");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 4. Drain background work
    running.shutdown().await;
    tracing::info!("process shut down gracefully");
    Ok(())
}
