use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use flowline_types::{
    EnqueueExecutionRequest, EnqueueExecutionResponse, ExecutionDetailResponse, ExecutionId,
    NodeId, RetryExecutionRequest, RetryExecutionResponse,
};
use tracing::instrument;

use crate::http::{error::HttpResult, state::HttpState};

#[utoipa::path(
    post,
    path = "/api/executions",
    request_body = EnqueueExecutionRequest,
    responses(
        (status = 200, description = "Execution enqueued", body = EnqueueExecutionResponse),
        (status = 429, description = "Organization quota exceeded"),
    )
)]
#[instrument(level = "debug", skip(state, req))]
pub async fn handle_enqueue_execution(
    State(state): State<HttpState>,
    Json(req): Json<EnqueueExecutionRequest>,
) -> HttpResult<Json<EnqueueExecutionResponse>> {
    state.metrics.record_request("enqueue_execution");
    let execution_id =
        state
            .dispatcher
            .enqueue_manual(req.workflow_id, req.initial_data, None)?;
    Ok(Json(EnqueueExecutionResponse { execution_id }))
}

#[utoipa::path(
    get,
    path = "/api/executions/{executionId}",
    responses(
        (status = 200, description = "Run detail with node timeline", body = ExecutionDetailResponse),
        (status = 404, description = "Unknown execution"),
    )
)]
#[instrument(level = "debug", skip(state))]
pub async fn handle_get_execution(
    State(state): State<HttpState>,
    Path(execution_id): Path<ExecutionId>,
) -> HttpResult<Json<ExecutionDetailResponse>> {
    let (execution, node_timeline) = state.dispatcher.execution(&execution_id)?;
    Ok(Json(ExecutionDetailResponse {
        execution,
        node_timeline,
    }))
}

#[instrument(level = "debug", skip(state, req))]
pub async fn handle_retry_execution(
    State(state): State<HttpState>,
    Path(execution_id): Path<ExecutionId>,
    req: Option<Json<RetryExecutionRequest>>,
) -> HttpResult<Json<RetryExecutionResponse>> {
    let reason = req.and_then(|Json(req)| req.reason);
    let execution_id = state
        .dispatcher
        .retry_execution(&execution_id, reason, None)?;
    Ok(Json(RetryExecutionResponse { execution_id }))
}

#[instrument(level = "debug", skip(state, req))]
pub async fn handle_retry_node(
    State(state): State<HttpState>,
    Path((execution_id, node_id)): Path<(ExecutionId, NodeId)>,
    req: Option<Json<RetryExecutionRequest>>,
) -> HttpResult<Json<RetryExecutionResponse>> {
    let reason = req.and_then(|Json(req)| req.reason);
    let execution_id = state
        .dispatcher
        .retry_node(&execution_id, &node_id, reason, None)?;
    Ok(Json(RetryExecutionResponse { execution_id }))
}

#[instrument(level = "debug", skip(state))]
pub async fn handle_cancel_execution(
    State(state): State<HttpState>,
    Path(execution_id): Path<ExecutionId>,
) -> HttpResult<StatusCode> {
    let cancelled = state.dispatcher.cancel_execution(&execution_id)?;
    if cancelled {
        Ok(StatusCode::ACCEPTED)
    } else {
        Ok(StatusCode::CONFLICT)
    }
}
