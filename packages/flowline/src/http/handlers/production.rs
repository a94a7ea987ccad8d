use axum::{extract::State, http::StatusCode, Json};
use chrono::{Duration, Utc};
use flowline_types::{ComponentReadiness, QueueHeartbeatResponse, ReadinessResponse};
use tracing::instrument;

use crate::http::{error::HttpResult, state::HttpState};
use crate::subsystems::queue::QueueDriver;

#[utoipa::path(
    get,
    path = "/api/production/queue/heartbeat",
    responses(
        (status = 200, description = "Queue driver health", body = QueueHeartbeatResponse),
    )
)]
#[instrument(level = "debug", skip(state))]
pub async fn handle_queue_heartbeat(
    State(state): State<HttpState>,
) -> HttpResult<Json<QueueHeartbeatResponse>> {
    let backlog = state
        .dispatcher
        .enqueue
        .queue()
        .backlog()
        .unwrap_or_default();
    let health = state.health_status.read().unwrap();

    Ok(Json(QueueHeartbeatResponse {
        driver: health.queue.driver.clone(),
        durable: health.queue.durable,
        backlog,
        last_heartbeat: health.queue.last_heartbeat,
    }))
}

#[utoipa::path(
    get,
    path = "/api/production/ready",
    responses(
        (status = 200, description = "All components heartbeating", body = ReadinessResponse),
        (status = 503, description = "One or more components stale", body = ReadinessResponse),
    )
)]
#[instrument(level = "debug", skip(state))]
pub async fn handle_ready(
    State(state): State<HttpState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let now = Utc::now();
    let tick = Duration::seconds(state.config.timer_tick_secs.max(1) as i64);
    let health = state.health_status.read().unwrap();

    let components: Vec<ComponentReadiness> = health
        .components
        .iter()
        .map(|(name, last)| ComponentReadiness {
            name: name.clone(),
            ready: now.signed_duration_since(*last) <= tick * 2,
            last_heartbeat: Some(*last),
        })
        .collect();

    let ready = health.is_ready(now, tick);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, components }))
}
