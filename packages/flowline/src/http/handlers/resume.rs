use axum::{
    extract::{Path, Query, State},
    Json,
};
use flowline_types::{ExecutionId, NodeId, RetryExecutionResponse};
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use crate::http::{error::HttpResult, state::HttpState};

#[derive(Deserialize)]
pub struct ResumeQuery {
    pub token: String,
    pub signature: String,
}

/// Consume a resume token and make the parked execution runnable again.
/// GET carries no payload; the POST variant accepts a JSON body that
/// becomes the resumed node's output.
#[instrument(level = "debug", skip(state, query))]
pub async fn handle_resume_get(
    State(state): State<HttpState>,
    Path((execution_id, node_id)): Path<(ExecutionId, NodeId)>,
    Query(query): Query<ResumeQuery>,
) -> HttpResult<Json<RetryExecutionResponse>> {
    consume(state, execution_id, node_id, query, None)
}

#[instrument(level = "debug", skip(state, query, payload))]
pub async fn handle_resume_post(
    State(state): State<HttpState>,
    Path((execution_id, node_id)): Path<(ExecutionId, NodeId)>,
    Query(query): Query<ResumeQuery>,
    payload: Option<Json<Value>>,
) -> HttpResult<Json<RetryExecutionResponse>> {
    consume(
        state,
        execution_id,
        node_id,
        query,
        payload.map(|Json(value)| value),
    )
}

fn consume(
    state: HttpState,
    execution_id: ExecutionId,
    node_id: NodeId,
    query: ResumeQuery,
    payload: Option<Value>,
) -> HttpResult<Json<RetryExecutionResponse>> {
    let (_record, execution_id) = state.dispatcher.timers.consume(
        &query.token,
        &query.signature,
        Some(execution_id),
        Some(&node_id),
        payload,
    )?;
    Ok(Json(RetryExecutionResponse { execution_id }))
}
