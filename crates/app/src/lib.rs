//! Order fulfillment process.
//!
//! Runs the order, inventory and payment services in one process over an
//! in-process event bus, with structured logging (tracing), Prometheus
//! metrics and an operational HTTP surface.

pub mod config;
pub mod error;
pub mod routes;
pub mod system;
pub mod telemetry;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use error::{AppError, Result};
pub use system::{Collaborators, FulfillmentSystem, PumpReport, RunningSystem, Services};

/// Creates the Axum router for `/health` and `/metrics`.
pub fn create_app(services: Services, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .with_state(services)
        .merge(metrics_router)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
}
