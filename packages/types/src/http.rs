use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{
    DeploymentId, Environment, Execution, ExecutionId, NodeExecution, WorkflowDeployment,
    WorkflowDiffSummary, WorkflowId, WorkflowVersion,
};

/// Constant-shape error body. Webhook and API error responses never vary
/// their shape with the cause, so a caller cannot probe for secret
/// existence.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDeployment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deployment: Option<WorkflowDeployment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<WorkflowVersion>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentsSummary {
    pub draft: EnvironmentDeployment,
    pub test: EnvironmentDeployment,
    pub production: EnvironmentDeployment,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionHistory {
    pub versions: Vec<WorkflowVersion>,
    pub deployments: Vec<WorkflowDeployment>,
    pub environments: EnvironmentsSummary,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
pub struct VersionHistoryResponse {
    pub history: VersionHistory,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateVersionRequest {
    pub target_environment: Environment,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
pub struct ValidateVersionResponse {
    pub diff: WorkflowDiffSummary,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromoteVersionRequest {
    pub target: Environment,
    #[serde(default)]
    pub acknowledge_breaking: bool,
    /// Allows promoting straight to production without an active test
    /// deployment.
    #[serde(default)]
    pub allow_non_staged_prod: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromoteVersionResponse {
    pub deployment: WorkflowDeployment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<DeploymentId>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueExecutionRequest {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub initial_data: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueExecutionResponse {
    pub execution_id: ExecutionId,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetailResponse {
    #[serde(flatten)]
    pub execution: Execution,
    pub node_timeline: Vec<NodeExecution>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryExecutionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryExecutionResponse {
    pub execution_id: ExecutionId,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAccepted {
    pub success: bool,
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueHeartbeatResponse {
    pub driver: String,
    pub durable: bool,
    pub backlog: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub ready: bool,
    pub components: Vec<ComponentReadiness>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReadiness {
    pub name: String,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_shape_is_constant() {
        let a = serde_json::to_value(ErrorResponse::new("verification failed")).unwrap();
        let b = serde_json::to_value(ErrorResponse::new("unknown webhook")).unwrap();

        let keys = |v: &serde_json::Value| {
            v.as_object()
                .unwrap()
                .keys()
                .cloned()
                .collect::<Vec<String>>()
        };
        assert_eq!(keys(&a), keys(&b));
        assert_eq!(a["success"], false);
    }

    #[test]
    fn promote_request_defaults() {
        let req: PromoteVersionRequest =
            serde_json::from_str(r#"{"target": "test"}"#).unwrap();
        assert_eq!(req.target, Environment::Test);
        assert!(!req.acknowledge_breaking);
        assert!(!req.allow_non_staged_prod);
    }
}
