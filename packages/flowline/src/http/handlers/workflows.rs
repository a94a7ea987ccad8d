use axum::{
    extract::{Path, State},
    Json,
};
use flowline_types::{
    PromoteVersionRequest, PromoteVersionResponse, ValidateVersionRequest,
    ValidateVersionResponse, VersionHistoryResponse, VersionId, WorkflowId,
};
use tracing::instrument;

use crate::http::{error::HttpResult, state::HttpState};

#[utoipa::path(
    get,
    path = "/api/workflows/{id}/versions",
    responses(
        (status = 200, description = "Version history with per-environment active deployments", body = VersionHistoryResponse),
        (status = 404, description = "Unknown workflow"),
    )
)]
#[instrument(level = "debug", skip(state))]
pub async fn handle_list_versions(
    State(state): State<HttpState>,
    Path(workflow_id): Path<WorkflowId>,
) -> HttpResult<Json<VersionHistoryResponse>> {
    state.metrics.record_request("workflow_versions");
    let history = state.dispatcher.repo.version_history(&workflow_id)?;
    Ok(Json(VersionHistoryResponse { history }))
}

#[instrument(level = "debug", skip(state, req))]
pub async fn handle_validate_version(
    State(state): State<HttpState>,
    Path((workflow_id, version_id)): Path<(WorkflowId, VersionId)>,
    Json(req): Json<ValidateVersionRequest>,
) -> HttpResult<Json<ValidateVersionResponse>> {
    let connections = state.dispatcher.connections.clone();
    let diff = state.dispatcher.repo.validate(
        &workflow_id,
        &version_id,
        req.target_environment,
        move |id| connections.get(id).ok().map(|c| c.provider),
    )?;
    Ok(Json(ValidateVersionResponse { diff }))
}

#[instrument(level = "debug", skip(state, req))]
pub async fn handle_promote_version(
    State(state): State<HttpState>,
    Path((workflow_id, version_id)): Path<(WorkflowId, VersionId)>,
    Json(req): Json<PromoteVersionRequest>,
) -> HttpResult<Json<PromoteVersionResponse>> {
    let connections = state.dispatcher.connections.clone();
    let deployment = state.dispatcher.repo.promote(
        &workflow_id,
        &version_id,
        req.target,
        req.acknowledge_breaking,
        req.allow_non_staged_prod,
        None,
        move |id| connections.get(id).ok().map(|c| c.provider),
    )?;

    let rollback_of = deployment.rollback_of;
    Ok(Json(PromoteVersionResponse {
        deployment,
        rollback_of,
    }))
}
