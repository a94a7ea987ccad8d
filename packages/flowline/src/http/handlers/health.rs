use axum::{extract::State, Json};
use tracing::instrument;

use crate::health::HealthStatus;
use crate::http::state::HttpState;
use crate::subsystems::queue::QueueDriver;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health snapshot", body = HealthStatus),
    )
)]
#[instrument(level = "debug", skip(state))]
pub async fn handle_health(State(state): State<HttpState>) -> Json<HealthStatus> {
    let mut health = state.health_status.read().unwrap().clone();
    if let Ok(backlog) = state.dispatcher.enqueue.queue().backlog() {
        health.queue.backlog = backlog;
    }
    Json(health)
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct InfoResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub queue_driver: String,
}

#[instrument(level = "debug", skip(state))]
pub async fn handle_info(State(state): State<HttpState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        queue_driver: state.config.queue_driver.clone(),
    })
}
