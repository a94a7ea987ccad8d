use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{
    ExecutionId, NodeId, OrganizationId, ResumeState, TimerId, TokenId, TriggerType, UserId,
    WorkflowId,
};

/// A one-time or short-TTL bearer for step-scoped credential access.
/// Only the sha256 of the token is stored; `used_at` is set exactly once
/// by the atomic consume.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScopedToken {
    pub id: TokenId,
    pub token_hash: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The stored half of a resume token: hash, scope filters, and the saved
/// traversal state that re-enters the queue on consume.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeTokenRecord {
    pub token_id: TokenId,
    pub token_hash: String,
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub node_id: NodeId,
    pub resume_state: ResumeState,
    #[serde(default)]
    pub initial_data: Value,
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// What the caller receives when a node yields with a callback: the bearer
/// token, its HMAC signature, and the URL to post back to. The token
/// itself is never stored.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuedResumeToken {
    pub token_id: TokenId,
    pub token: String,
    pub signature: String,
    pub callback_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Pending,
    Dispatched,
    Failed,
}

/// A due-time driven wakeup. The dispatcher claims pending timers under
/// the row lock so concurrent dispatchers never double-fire.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTimer {
    pub id: TimerId,
    pub execution_id: ExecutionId,
    pub resume_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    pub status: TimerStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}
