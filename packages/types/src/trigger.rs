use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{
    ConnectionId, Credential, EventId, ExecutionId, OrganizationId, PollingTriggerId,
    ScheduleTriggerId, WebhookId, WorkflowId,
};

/// A registered webhook binding. The public endpoint is
/// `/api/webhooks/{webhook_id}`; the in-memory route map is a cache
/// rebuilt from these rows at startup.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTrigger {
    pub webhook_id: WebhookId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub app_id: String,
    pub trigger_id: String,
    /// Provider signing secret. Absent means the endpoint accepts
    /// unsigned posts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Credential>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Why a webhook request failed verification. Persisted alongside the 401
/// so operators can see rejected deliveries without the response body ever
/// revealing whether a secret exists.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationFailureReason {
    ProviderNotRegistered,
    MissingSecret,
    MissingSignature,
    MissingTimestamp,
    InvalidSignatureFormat,
    SignatureMismatch,
    TimestampOutOfTolerance,
    InternalError,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerificationFailure {
    pub id: EventId,
    pub webhook_id: WebhookId,
    pub provider: String,
    pub reason: VerificationFailureReason,
    pub at: DateTime<Utc>,
}

/// One received webhook delivery: what came in, whether it deduped, and
/// what execution it produced.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: EventId,
    pub webhook_id: WebhookId,
    pub workflow_id: WorkflowId,
    pub dedupe_token: String,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duplicate: bool,
}

/// Persisted dedupe token; primary key `(webhook_id, token)`. Swept by a
/// periodic cleanup once older than the configured TTL.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDedupe {
    pub webhook_id: WebhookId,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Ok,
    Failed,
}

/// A registered polling binding, with its scheduler state: the cursor
/// handed back to the connector, and the backoff counter that stretches
/// the interval after consecutive failures.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PollingTrigger {
    pub id: PollingTriggerId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub app_id: String,
    pub trigger_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(default)]
    pub parameters: Value,
    pub interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<DateTime<Utc>>,
    pub next_poll_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Value>,
    pub backoff_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<PollStatus>,
    /// Field to dedupe returned events by; event-hash fallback when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

/// A cron-expression trigger binding.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleTrigger {
    pub id: ScheduleTriggerId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Trigger payload carried on a webhook execution job.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTriggerData {
    pub app_id: String,
    pub trigger_id: String,
    pub payload: Value,
    #[serde(default)]
    pub headers: Value,
    pub dedupe_token: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_reason_serializes_screaming() {
        let v = serde_json::to_value(VerificationFailureReason::SignatureMismatch).unwrap();
        assert_eq!(v, "SIGNATURE_MISMATCH");
        let v = serde_json::to_value(VerificationFailureReason::TimestampOutOfTolerance).unwrap();
        assert_eq!(v, "TIMESTAMP_OUT_OF_TOLERANCE");
    }
}
