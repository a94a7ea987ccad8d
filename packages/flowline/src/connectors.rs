use async_trait::async_trait;
use flowline_engine::{ConnectorInvoker, Invocation, InvocationContext, PollOutcome};
use flowline_types::ConnectionTestResult;
use serde_json::Value;

/// Stand-in invoker for deployments whose connector catalog is loaded
/// out of process. Executions fail terminally with a clear message
/// instead of hanging, polls return nothing, and connection tests defer
/// to the generic failure path.
#[derive(Default)]
pub struct NullInvoker;

#[async_trait]
impl ConnectorInvoker for NullInvoker {
    async fn execute(
        &self,
        app: &str,
        op: &str,
        _credentials: Option<Value>,
        _params: Value,
        _ctx: &InvocationContext,
    ) -> Invocation {
        Invocation::Fail {
            kind: flowline_engine::FailKind::Permanent,
            message: format!("no connector catalog is bound for {}.{}", app, op),
        }
    }

    async fn poll(
        &self,
        _app: &str,
        _op: &str,
        _credentials: Option<Value>,
        _params: Value,
        cursor: Option<Value>,
    ) -> Result<PollOutcome, String> {
        Ok(PollOutcome {
            events: vec![],
            cursor,
        })
    }

    async fn test_connection(&self, app: &str, _credentials: Value) -> ConnectionTestResult {
        ConnectionTestResult {
            success: false,
            message: "no connector catalog is bound".to_string(),
            response_time_ms: 0,
            error: Some(format!("connector {} unavailable", app)),
        }
    }
}
