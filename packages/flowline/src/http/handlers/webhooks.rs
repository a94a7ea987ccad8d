use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, Uri},
    Json,
};
use flowline_types::{WebhookAccepted, WebhookId};
use tracing::instrument;

use crate::http::{error::HttpResult, state::HttpState};

/// Webhook ingress. The raw body is required: every provider signature
/// is computed over the exact bytes received, before any JSON parsing.
#[instrument(level = "debug", skip(state, headers, body))]
pub async fn handle_webhook(
    State(state): State<HttpState>,
    Path(webhook_id): Path<WebhookId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<Json<WebhookAccepted>> {
    state.metrics.record_request("webhook_ingress");

    let mut header_map = BTreeMap::new();
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    let host = header_map.get("host").cloned().unwrap_or_default();

    let outcome = state.dispatcher.webhooks.handle(
        &webhook_id,
        &header_map,
        &body,
        method.as_str(),
        &host,
        uri.path(),
    )?;

    Ok(Json(WebhookAccepted {
        success: true,
        duplicate: outcome.duplicate,
        execution_id: outcome.execution_id,
    }))
}
