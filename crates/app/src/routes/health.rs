//! Health check endpoint.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::system::{OutboxBacklog, Services};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub outbox: BTreeMap<&'static str, OutboxBacklog>,
}

/// GET /health: reports liveness and each service's outbox backlog.
///
/// Dead outbox records need an operator but do not make the process unhealthy.
pub async fn check(State(services): State<Services>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        outbox: services.outbox_backlog().await.into_iter().collect(),
    })
}
