use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_types::{
    ConnectionId, ConnectionTestResult, ExecutionId, Metering, NodeId, OrganizationId, WorkflowId,
};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::EngineError;

/// The result variant a connector invocation resolves to. Connector code
/// never throws across this boundary; classification happens on the other
/// side so the executor only has to pattern-match.
#[derive(Debug, Clone)]
pub enum Invocation {
    Ok {
        output: Value,
        metering: Metering,
    },
    /// Transient failure; the job is redelivered after at least `delay`.
    Retry {
        delay: Duration,
        message: String,
    },
    /// Permanent failure; the node and the run fail.
    Fail {
        kind: FailKind,
        message: String,
    },
    /// The node handed control to an external callback. The run parks in
    /// `waiting` until the resume token comes back (or the timer fires).
    Callback {
        wait_until: Option<DateTime<Utc>>,
        metadata: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    Validation,
    Auth,
    Permanent,
}

pub struct PollOutcome {
    pub events: Vec<Value>,
    pub cursor: Option<Value>,
}

/// Everything a connector may need about the invocation, plus the
/// cancellation token it must respect at its own suspension points.
#[derive(Clone)]
pub struct InvocationContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// The seam between the execution core and the integration code that
/// talks to third-party APIs. The core calls it; implementations live
/// with the connector catalog.
#[async_trait]
pub trait ConnectorInvoker: Send + Sync {
    async fn execute(
        &self,
        app: &str,
        op: &str,
        credentials: Option<Value>,
        params: Value,
        ctx: &InvocationContext,
    ) -> Invocation;

    async fn poll(
        &self,
        app: &str,
        op: &str,
        credentials: Option<Value>,
        params: Value,
        cursor: Option<Value>,
    ) -> Result<PollOutcome, String>;

    async fn test_connection(&self, app: &str, credentials: Value) -> ConnectionTestResult;
}

/// Resolves a node's connection to decrypted credentials. Implemented by
/// the connection store; the engine never sees ciphertext or keys.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, connection_id: &ConnectionId) -> Result<Option<Value>, EngineError>;
}

/// A resolver for graphs whose nodes carry no connections.
pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn resolve(&self, _connection_id: &ConnectionId) -> Result<Option<Value>, EngineError> {
        Ok(None)
    }
}
