use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{ExecutionId, NodeId, OrganizationId, UserId, VersionId, WorkflowId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    RateLimited,
}

impl ExecutionStatus {
    /// Statuses from which the run can still make progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Queued | ExecutionStatus::Running | ExecutionStatus::Waiting
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Polling,
    Schedule,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Webhook => "webhook",
            TriggerType::Polling => "polling",
            TriggerType::Schedule => "schedule",
            TriggerType::Manual => "manual",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    Full,
    Node,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplayInfo {
    pub source_execution_id: ExecutionId,
    pub mode: ReplayMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<UserId>,
}

/// Usage accumulated over one run, emitted to the org quota counters on
/// completion.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Metering {
    pub api_calls_made: u64,
    pub tokens_used: u64,
    pub data_processed_bytes: u64,
    pub cost: f64,
}

impl Metering {
    pub fn accumulate(&mut self, other: &Metering) {
        self.api_calls_made += other.api_calls_made;
        self.tokens_used += other.tokens_used;
        self.data_processed_bytes += other.data_processed_bytes;
        self.cost += other.cost;
    }
}

/// One attempt to traverse a workflow graph end-to-end.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_data: Value,
    #[serde(default)]
    pub node_results: BTreeMap<NodeId, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    #[serde(default)]
    pub metering: Metering,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayInfo>,
    /// Set when this row was created by consuming a resume token of a
    /// parent execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<ExecutionId>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Succeeded,
    Failed,
    Waiting,
    Skipped,
}

/// Node-level telemetry for one attempt. `(execution_id, node_id)` is
/// unique for the final attempt; prior attempts are kept as history rows.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<String>,
}

/// Idempotency cache row: a retried node with the same resolved request
/// reuses the stored result instead of re-invoking the connector.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionResult {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub idempotency_key: String,
    pub result_hash: String,
    pub result_data: Value,
    pub expires_at: DateTime<Utc>,
}

/// Saved traversal state used by resume tokens, retries and replays:
/// which outputs are already known, and how many attempts each node has
/// consumed.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    #[serde(default)]
    pub node_outputs: BTreeMap<NodeId, Value>,
    #[serde(default)]
    pub attempts: BTreeMap<NodeId, u32>,
    /// The node to resume at, when resuming from a callback wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_node_id: Option<NodeId>,
    /// Payload delivered by the resume callback, exposed to the resumed
    /// node as its input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_payload: Option<Value>,
}

/// The queue message. The queue preserves `execution_id` so re-enqueues
/// and redeliveries stay idempotent.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_data: Value,
    #[serde(default)]
    pub initial_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<ResumeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayInfo>,
    /// Explicit version override, used by replays. Normally the deployed
    /// version for the environment is resolved at dequeue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metering_accumulates() {
        let mut total = Metering::default();
        total.accumulate(&Metering {
            api_calls_made: 2,
            tokens_used: 100,
            data_processed_bytes: 512,
            cost: 0.25,
        });
        total.accumulate(&Metering {
            api_calls_made: 1,
            tokens_used: 50,
            data_processed_bytes: 0,
            cost: 0.05,
        });
        assert_eq!(total.api_calls_made, 3);
        assert_eq!(total.tokens_used, 150);
        assert!((total.cost - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn job_round_trips_with_defaults() {
        let job = ExecutionJob {
            execution_id: None,
            workflow_id: WorkflowId::generate(),
            organization_id: OrganizationId::generate(),
            user_id: None,
            trigger_type: TriggerType::Webhook,
            trigger_data: json!({"payload": {"hello": true}}),
            initial_data: Value::Null,
            resume_state: None,
            replay: None,
            version_id: None,
        };

        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: ExecutionJob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.trigger_type, TriggerType::Webhook);
        assert!(decoded.execution_id.is_none());
    }

    #[test]
    fn active_statuses() {
        assert!(ExecutionStatus::Queued.is_active());
        assert!(ExecutionStatus::Waiting.is_active());
        assert!(!ExecutionStatus::Completed.is_active());
        assert!(!ExecutionStatus::RateLimited.is_active());
    }
}
