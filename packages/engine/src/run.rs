use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowline_types::{
    ErrorDetails, Execution, ExecutionId, Graph, Metering, NodeExecution, NodeExecutionResult,
    NodeId, NodeKind, NodeStatus, OrganizationId, ResumeState, WorkflowId,
};
use rand::Rng;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    idempotency::{self, IdempotencyStore},
    invoker::{ConnectorInvoker, CredentialResolver, FailKind, Invocation, InvocationContext},
    references, EngineError,
};

/// How long cached node results stay reusable.
const RESULT_TTL_HOURS: i64 = 24;
/// Base for the retry backoff curve.
const RETRY_BASE: Duration = Duration::from_secs(2);

pub struct RunRequest<'a> {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub graph: &'a Graph,
    /// Output seeded onto the trigger node: the trigger payload.
    pub trigger_output: Value,
    pub resume_state: Option<ResumeState>,
    /// Replay-from-node: restrict execution to the topological suffix
    /// starting here; earlier outputs come seeded in `resume_state`.
    pub start_node_id: Option<NodeId>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        outputs: BTreeMap<NodeId, Value>,
        metering: Metering,
        records: Vec<NodeExecution>,
    },
    /// A node yielded to an external callback; the caller parks the run
    /// as `waiting` and issues a resume token for `resume_state`.
    Waiting {
        node_id: NodeId,
        resume_state: ResumeState,
        wait_until: Option<chrono::DateTime<Utc>>,
        metadata: Value,
        metering: Metering,
        records: Vec<NodeExecution>,
    },
    /// A retryable failure; the caller nacks the job with `delay` and the
    /// saved state so the redelivery skips completed nodes.
    RetryLater {
        node_id: NodeId,
        delay: Duration,
        resume_state: ResumeState,
        metering: Metering,
        records: Vec<NodeExecution>,
    },
    Failed {
        error: ErrorDetails,
        outputs: BTreeMap<NodeId, Value>,
        metering: Metering,
        records: Vec<NodeExecution>,
    },
    Cancelled {
        metering: Metering,
        records: Vec<NodeExecution>,
    },
}

/// Executes one workflow run: deterministic topological traversal, one
/// node at a time, with the per-node idempotency protocol around every
/// connector invocation. No two nodes of the same run ever execute
/// concurrently.
pub struct RunExecutor {
    invoker: Arc<dyn ConnectorInvoker>,
    credentials: Arc<dyn CredentialResolver>,
    idempotency: Arc<dyn IdempotencyStore>,
    max_attempts: u32,
}

impl RunExecutor {
    pub fn new(
        invoker: Arc<dyn ConnectorInvoker>,
        credentials: Arc<dyn CredentialResolver>,
        idempotency: Arc<dyn IdempotencyStore>,
        max_attempts: u32,
    ) -> Self {
        Self {
            invoker,
            credentials,
            idempotency,
            max_attempts,
        }
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(
            subsys = "RunExecutor",
            execution_id = %request.execution_id,
            organization_id = %request.organization_id,
        )
    )]
    pub async fn run(&self, request: RunRequest<'_>) -> RunOutcome {
        let mut metering = Metering::default();
        let mut records = Vec::new();

        let order = match request.graph.topological_order() {
            Ok(order) => order,
            Err(err) => {
                return RunOutcome::Failed {
                    error: ErrorDetails {
                        node_id: None,
                        error: err.to_string(),
                        context: None,
                    },
                    outputs: BTreeMap::new(),
                    metering,
                    records,
                }
            }
        };

        let order: Vec<NodeId> = match &request.start_node_id {
            None => order,
            Some(start) => {
                let Some(position) = order.iter().position(|id| id == start) else {
                    return RunOutcome::Failed {
                        error: ErrorDetails {
                            node_id: Some(start.clone()),
                            error: EngineError::UnknownStartNode(start.clone()).to_string(),
                            context: None,
                        },
                        outputs: BTreeMap::new(),
                        metering,
                        records,
                    };
                };
                order[position..].to_vec()
            }
        };

        let (mut outputs, mut attempts, resume_node, resume_payload) =
            match request.resume_state.clone() {
                Some(state) => (
                    state.node_outputs,
                    state.attempts,
                    state.resume_node_id,
                    state.resume_payload,
                ),
                None => (BTreeMap::new(), BTreeMap::new(), None, None),
            };

        for node_id in order {
            if request.cancel.is_cancelled() {
                tracing::info!(
                    execution_id = %request.execution_id,
                    node_id = %node_id,
                    "run cancelled between nodes"
                );
                return RunOutcome::Cancelled { metering, records };
            }

            // replay/resume path: history already holds this output
            if outputs.contains_key(&node_id) {
                continue;
            }

            let Some(node) = request.graph.node(&node_id) else {
                // topological_order only yields known ids
                continue;
            };

            let started_at = Utc::now();

            // the trigger node's output is the trigger payload itself
            if node.kind == NodeKind::Trigger {
                outputs.insert(node_id.clone(), request.trigger_output.clone());
                records.push(NodeExecution {
                    execution_id: request.execution_id,
                    node_id: node_id.clone(),
                    attempt: 1,
                    status: NodeStatus::Succeeded,
                    started_at,
                    ended_at: Some(Utc::now()),
                    input: Value::Null,
                    output: Some(request.trigger_output.clone()),
                    error: None,
                    idempotency_key: None,
                    request_hash: None,
                });
                continue;
            }

            // a node that parked the run resumes with the callback
            // payload as its output
            if resume_node.as_ref() == Some(&node_id) {
                let output = resume_payload.clone().unwrap_or(Value::Null);
                outputs.insert(node_id.clone(), output.clone());
                records.push(NodeExecution {
                    execution_id: request.execution_id,
                    node_id: node_id.clone(),
                    attempt: attempts.get(&node_id).copied().unwrap_or(1),
                    status: NodeStatus::Succeeded,
                    started_at,
                    ended_at: Some(Utc::now()),
                    input: Value::Null,
                    output: Some(output),
                    error: None,
                    idempotency_key: None,
                    request_hash: None,
                });
                continue;
            }

            let resolved = match references::resolve_params(&node_id, &node.params, &outputs) {
                Ok(resolved) => resolved,
                Err(err) => {
                    records.push(NodeExecution {
                        execution_id: request.execution_id,
                        node_id: node_id.clone(),
                        attempt: attempts.get(&node_id).copied().unwrap_or(0) + 1,
                        status: NodeStatus::Failed,
                        started_at,
                        ended_at: Some(Utc::now()),
                        input: node.params.clone(),
                        output: None,
                        error: Some(err.to_string()),
                        idempotency_key: None,
                        request_hash: None,
                    });
                    return RunOutcome::Failed {
                        error: ErrorDetails {
                            node_id: Some(node_id),
                            error: err.to_string(),
                            context: None,
                        },
                        outputs,
                        metering,
                        records,
                    };
                }
            };

            let request_hash = idempotency::request_hash(&node.op, &resolved);
            let user_key = resolved
                .get("idempotencyKey")
                .and_then(Value::as_str)
                .map(str::to_string);
            let idem_key = idempotency::idempotency_key(
                user_key.as_deref(),
                &request.execution_id,
                &node_id,
                &request_hash,
            );

            // reuse a cached result instead of repeating the side effect
            if let Some(row) = self
                .idempotency
                .get(&request.execution_id, &node_id, &idem_key)
            {
                if idempotency::reusable(&row, &request_hash, Utc::now()) {
                    tracing::debug!(
                        execution_id = %request.execution_id,
                        node_id = %node_id,
                        "reusing cached node result"
                    );
                    outputs.insert(node_id.clone(), row.result_data.clone());
                    records.push(NodeExecution {
                        execution_id: request.execution_id,
                        node_id: node_id.clone(),
                        attempt: attempts.get(&node_id).copied().unwrap_or(0) + 1,
                        status: NodeStatus::Succeeded,
                        started_at,
                        ended_at: Some(Utc::now()),
                        input: resolved,
                        output: Some(row.result_data),
                        error: None,
                        idempotency_key: Some(idem_key),
                        request_hash: Some(request_hash),
                    });
                    continue;
                }
            }

            let credentials = match &node.connection_id {
                None => None,
                Some(connection_id) => match self.credentials.resolve(connection_id).await {
                    Ok(creds) => creds,
                    Err(err) => {
                        records.push(NodeExecution {
                            execution_id: request.execution_id,
                            node_id: node_id.clone(),
                            attempt: attempts.get(&node_id).copied().unwrap_or(0) + 1,
                            status: NodeStatus::Failed,
                            started_at,
                            ended_at: Some(Utc::now()),
                            input: resolved,
                            output: None,
                            error: Some(err.to_string()),
                            idempotency_key: Some(idem_key),
                            request_hash: Some(request_hash),
                        });
                        return RunOutcome::Failed {
                            error: ErrorDetails {
                                node_id: Some(node_id),
                                error: err.to_string(),
                                context: None,
                            },
                            outputs,
                            metering,
                            records,
                        };
                    }
                },
            };

            let attempt = attempts.get(&node_id).copied().unwrap_or(0) + 1;
            attempts.insert(node_id.clone(), attempt);

            let ctx = InvocationContext {
                execution_id: request.execution_id,
                workflow_id: request.workflow_id,
                organization_id: request.organization_id,
                node_id: node_id.clone(),
                attempt,
                cancel: request.cancel.clone(),
            };

            tracing::debug!(
                execution_id = %request.execution_id,
                organization_id = %request.organization_id,
                node_id = %node_id,
                attempt,
                "invoking connector"
            );

            let outcome = self
                .invoker
                .execute(&node.app, &node.op, credentials, resolved.clone(), &ctx)
                .await;

            match outcome {
                Invocation::Ok {
                    output,
                    metering: node_metering,
                } => {
                    metering.accumulate(&node_metering);
                    self.idempotency.put(NodeExecutionResult {
                        execution_id: request.execution_id,
                        node_id: node_id.clone(),
                        idempotency_key: idem_key.clone(),
                        result_hash: request_hash.clone(),
                        result_data: output.clone(),
                        expires_at: Utc::now() + chrono::Duration::hours(RESULT_TTL_HOURS),
                    });
                    outputs.insert(node_id.clone(), output.clone());
                    records.push(NodeExecution {
                        execution_id: request.execution_id,
                        node_id: node_id.clone(),
                        attempt,
                        status: NodeStatus::Succeeded,
                        started_at,
                        ended_at: Some(Utc::now()),
                        input: resolved,
                        output: Some(output),
                        error: None,
                        idempotency_key: Some(idem_key),
                        request_hash: Some(request_hash),
                    });
                }
                Invocation::Retry { delay, message } => {
                    records.push(NodeExecution {
                        execution_id: request.execution_id,
                        node_id: node_id.clone(),
                        attempt,
                        status: NodeStatus::Failed,
                        started_at,
                        ended_at: Some(Utc::now()),
                        input: resolved,
                        output: None,
                        error: Some(message.clone()),
                        idempotency_key: Some(idem_key),
                        request_hash: Some(request_hash),
                    });

                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            execution_id = %request.execution_id,
                            node_id = %node_id,
                            attempt,
                            "retry attempts exhausted"
                        );
                        return RunOutcome::Failed {
                            error: ErrorDetails {
                                node_id: Some(node_id),
                                error: format!(
                                    "retries exhausted after {} attempts: {}",
                                    attempt, message
                                ),
                                context: None,
                            },
                            outputs,
                            metering,
                            records,
                        };
                    }

                    return RunOutcome::RetryLater {
                        node_id: node_id.clone(),
                        delay: retry_delay(attempt, delay),
                        resume_state: ResumeState {
                            node_outputs: outputs,
                            attempts,
                            resume_node_id: None,
                            resume_payload: None,
                        },
                        metering,
                        records,
                    };
                }
                Invocation::Fail { kind, message } => {
                    records.push(NodeExecution {
                        execution_id: request.execution_id,
                        node_id: node_id.clone(),
                        attempt,
                        status: NodeStatus::Failed,
                        started_at,
                        ended_at: Some(Utc::now()),
                        input: resolved,
                        output: None,
                        error: Some(message.clone()),
                        idempotency_key: Some(idem_key),
                        request_hash: Some(request_hash),
                    });
                    return RunOutcome::Failed {
                        error: ErrorDetails {
                            node_id: Some(node_id),
                            error: message,
                            context: Some(json!({"kind": fail_kind_str(kind)})),
                        },
                        outputs,
                        metering,
                        records,
                    };
                }
                Invocation::Callback {
                    wait_until,
                    metadata,
                } => {
                    records.push(NodeExecution {
                        execution_id: request.execution_id,
                        node_id: node_id.clone(),
                        attempt,
                        status: NodeStatus::Waiting,
                        started_at,
                        ended_at: None,
                        input: resolved,
                        output: None,
                        error: None,
                        idempotency_key: Some(idem_key),
                        request_hash: Some(request_hash),
                    });
                    return RunOutcome::Waiting {
                        node_id: node_id.clone(),
                        resume_state: ResumeState {
                            node_outputs: outputs,
                            attempts,
                            resume_node_id: Some(node_id),
                            resume_payload: None,
                        },
                        wait_until,
                        metadata,
                        metering,
                        records,
                    };
                }
            }
        }

        RunOutcome::Completed {
            outputs,
            metering,
            records,
        }
    }
}

fn fail_kind_str(kind: FailKind) -> &'static str {
    match kind {
        FailKind::Validation => "validation",
        FailKind::Auth => "auth",
        FailKind::Permanent => "permanent",
    }
}

/// Exponential backoff with full jitter of ±25%, floored by whatever the
/// connector asked for.
fn retry_delay(attempt: u32, connector_delay: Duration) -> Duration {
    let exp = RETRY_BASE.as_millis() as u64 * 2u64.pow(attempt.saturating_sub(1).min(6));
    let jitter_span = exp / 4;
    let jittered = if jitter_span == 0 {
        exp
    } else {
        let offset = rand::rng().random_range(0..=jitter_span * 2);
        exp - jitter_span + offset
    };
    connector_delay.max(Duration::from_millis(jittered))
}

/// Seeds a replay's resume state from a completed source execution: all
/// outputs strictly before `start_node_id` in the deterministic order.
pub fn seed_outputs_for_replay(
    source: &Execution,
    graph: &Graph,
    start_node_id: &NodeId,
) -> Result<ResumeState, EngineError> {
    let order = graph.topological_order()?;
    let position = order
        .iter()
        .position(|id| id == start_node_id)
        .ok_or_else(|| EngineError::UnknownStartNode(start_node_id.clone()))?;

    let mut node_outputs = BTreeMap::new();
    for node_id in &order[..position] {
        if let Some(output) = source.node_results.get(node_id) {
            node_outputs.insert(node_id.clone(), output.clone());
        }
    }

    Ok(ResumeState {
        node_outputs,
        attempts: BTreeMap::new(),
        resume_node_id: None,
        resume_payload: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::invoker::{NoCredentials, PollOutcome};
    use async_trait::async_trait;
    use flowline_types::{ConnectionTestResult, Edge, Node};
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted invoker: per-op queues of outcomes, falling back to an
    /// echo of the resolved params. Counts invocations per op.
    struct MockInvoker {
        scripts: Mutex<HashMap<String, VecDeque<Invocation>>>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl MockInvoker {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn script(&self, op: &str, outcomes: Vec<Invocation>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(op.to_string(), outcomes.into());
        }

        fn calls(&self, op: &str) -> u32 {
            self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ConnectorInvoker for MockInvoker {
        async fn execute(
            &self,
            _app: &str,
            op: &str,
            _credentials: Option<Value>,
            params: Value,
            _ctx: &InvocationContext,
        ) -> Invocation {
            *self.calls.lock().unwrap().entry(op.to_string()).or_insert(0) += 1;

            if let Some(queue) = self.scripts.lock().unwrap().get_mut(op) {
                if let Some(outcome) = queue.pop_front() {
                    return outcome;
                }
            }

            Invocation::Ok {
                output: json!({"op": op, "echo": params}),
                metering: Metering {
                    api_calls_made: 1,
                    ..Default::default()
                },
            }
        }

        async fn poll(
            &self,
            _app: &str,
            _op: &str,
            _credentials: Option<Value>,
            _params: Value,
            _cursor: Option<Value>,
        ) -> Result<PollOutcome, String> {
            Ok(PollOutcome {
                events: vec![],
                cursor: None,
            })
        }

        async fn test_connection(&self, _app: &str, _credentials: Value) -> ConnectionTestResult {
            ConnectionTestResult {
                success: true,
                message: "ok".to_string(),
                response_time_ms: 1,
                error: None,
            }
        }
    }

    fn node(id: &str, kind: NodeKind, op: &str, params: Value) -> Node {
        Node {
            id: NodeId::new(id).unwrap(),
            kind,
            app: "mock".to_string(),
            op: op.to_string(),
            params,
            connection_id: None,
        }
    }

    fn edge(from: &str, to: &str) -> Edge {
        Edge {
            id: None,
            from: NodeId::new(from).unwrap(),
            to: NodeId::new(to).unwrap(),
        }
    }

    fn linear_graph() -> Graph {
        Graph {
            nodes: vec![
                node("start", NodeKind::Trigger, "trigger", json!({})),
                node(
                    "a",
                    NodeKind::Action,
                    "op_a",
                    json!({"from": "{{start.text}}"}),
                ),
                node("b", NodeKind::Action, "op_b", json!({})),
                node("c", NodeKind::Action, "op_c", json!({})),
            ],
            edges: vec![edge("start", "a"), edge("a", "b"), edge("b", "c")],
        }
    }

    fn executor(invoker: Arc<MockInvoker>) -> RunExecutor {
        RunExecutor::new(
            invoker,
            Arc::new(NoCredentials),
            Arc::new(InMemoryIdempotencyStore::new()),
            3,
        )
    }

    fn request(graph: &Graph) -> RunRequest<'_> {
        RunRequest {
            execution_id: ExecutionId::generate(),
            workflow_id: WorkflowId::generate(),
            organization_id: OrganizationId::generate(),
            graph,
            trigger_output: json!({"text": "hello"}),
            resume_state: None,
            start_node_id: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn linear_run_completes_in_order() {
        let invoker = Arc::new(MockInvoker::new());
        let graph = linear_graph();
        let exec = executor(invoker.clone());

        let outcome = exec.run(request(&graph)).await;
        let RunOutcome::Completed {
            outputs,
            metering,
            records,
        } = outcome
        else {
            panic!("expected completion, got {:?}", outcome);
        };

        assert_eq!(outputs.len(), 4);
        // reference into trigger payload resolved
        assert_eq!(
            outputs[&NodeId::new("a").unwrap()]["echo"]["from"],
            json!("hello")
        );
        assert_eq!(metering.api_calls_made, 3);

        let order: Vec<String> = records.iter().map(|r| r.node_id.to_string()).collect();
        assert_eq!(order, vec!["start", "a", "b", "c"]);
        assert!(records.iter().all(|r| r.status == NodeStatus::Succeeded));
    }

    #[tokio::test]
    async fn redelivery_reuses_cached_results() {
        let invoker = Arc::new(MockInvoker::new());
        let graph = linear_graph();
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let exec = RunExecutor::new(
            invoker.clone(),
            Arc::new(NoCredentials),
            store.clone(),
            3,
        );

        let execution_id = ExecutionId::generate();
        let mut req = request(&graph);
        req.execution_id = execution_id;
        exec.run(req).await;
        assert_eq!(invoker.calls("op_a"), 1);

        // same execution redelivered: every node answers from cache
        let mut req = request(&graph);
        req.execution_id = execution_id;
        let outcome = exec.run(req).await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(invoker.calls("op_a"), 1);
        assert_eq!(invoker.calls("op_b"), 1);
        assert_eq!(invoker.calls("op_c"), 1);
    }

    #[tokio::test]
    async fn retry_then_resume_completes() {
        let invoker = Arc::new(MockInvoker::new());
        invoker.script(
            "op_b",
            vec![Invocation::Retry {
                delay: Duration::from_millis(10),
                message: "rate limited".to_string(),
            }],
        );
        let graph = linear_graph();
        let exec = executor(invoker.clone());

        let execution_id = ExecutionId::generate();
        let mut req = request(&graph);
        req.execution_id = execution_id;
        let outcome = exec.run(req).await;

        let RunOutcome::RetryLater {
            node_id,
            delay,
            resume_state,
            ..
        } = outcome
        else {
            panic!("expected retry, got {:?}", outcome);
        };
        assert_eq!(node_id.as_ref(), "b");
        assert!(delay >= Duration::from_millis(10));
        // a's output survived into the saved state
        assert!(resume_state
            .node_outputs
            .contains_key(&NodeId::new("a").unwrap()));
        assert_eq!(resume_state.attempts[&NodeId::new("b").unwrap()], 1);

        // redelivery picks up where it stopped
        let mut req = request(&graph);
        req.execution_id = execution_id;
        req.resume_state = Some(resume_state);
        let outcome = exec.run(req).await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        // a was not re-invoked, b was invoked twice overall
        assert_eq!(invoker.calls("op_a"), 1);
        assert_eq!(invoker.calls("op_b"), 2);
    }

    #[tokio::test]
    async fn retries_exhaust_into_failure() {
        let invoker = Arc::new(MockInvoker::new());
        let retry = || Invocation::Retry {
            delay: Duration::from_millis(1),
            message: "still down".to_string(),
        };
        invoker.script("op_b", vec![retry(), retry(), retry()]);
        let graph = linear_graph();
        let exec = executor(invoker.clone());

        let execution_id = ExecutionId::generate();
        let mut state = None;
        for _ in 0..2 {
            let mut req = request(&graph);
            req.execution_id = execution_id;
            req.resume_state = state.take();
            match exec.run(req).await {
                RunOutcome::RetryLater { resume_state, .. } => state = Some(resume_state),
                other => panic!("expected retry, got {:?}", other),
            }
        }

        let mut req = request(&graph);
        req.execution_id = execution_id;
        req.resume_state = state;
        let outcome = exec.run(req).await;
        let RunOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!(error.node_id, Some(NodeId::new("b").unwrap()));
        assert!(error.error.contains("retries exhausted"));
        assert_eq!(invoker.calls("op_b"), 3);
    }

    #[tokio::test]
    async fn terminal_failure_halts_run() {
        let invoker = Arc::new(MockInvoker::new());
        invoker.script(
            "op_b",
            vec![Invocation::Fail {
                kind: FailKind::Permanent,
                message: "bad request".to_string(),
            }],
        );
        let graph = linear_graph();
        let exec = executor(invoker.clone());

        let outcome = exec.run(request(&graph)).await;
        let RunOutcome::Failed { error, records, .. } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!(error.node_id, Some(NodeId::new("b").unwrap()));
        // c never ran
        assert_eq!(invoker.calls("op_c"), 0);
        assert!(records
            .iter()
            .any(|r| r.node_id.as_ref() == "b" && r.status == NodeStatus::Failed));
    }

    #[tokio::test]
    async fn callback_parks_then_resume_payload_becomes_output() {
        let invoker = Arc::new(MockInvoker::new());
        invoker.script(
            "op_b",
            vec![Invocation::Callback {
                wait_until: None,
                metadata: json!({"channel": "approval"}),
            }],
        );
        let graph = linear_graph();
        let exec = executor(invoker.clone());

        let execution_id = ExecutionId::generate();
        let mut req = request(&graph);
        req.execution_id = execution_id;
        let outcome = exec.run(req).await;

        let RunOutcome::Waiting {
            node_id,
            mut resume_state,
            ..
        } = outcome
        else {
            panic!("expected waiting, got {:?}", outcome);
        };
        assert_eq!(node_id.as_ref(), "b");

        // callback arrives with a payload
        resume_state.resume_payload = Some(json!({"approved": true}));
        let mut req = request(&graph);
        req.execution_id = execution_id;
        req.resume_state = Some(resume_state);
        let outcome = exec.run(req).await;

        let RunOutcome::Completed { outputs, .. } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(outputs[&NodeId::new("b").unwrap()], json!({"approved": true}));
        // b was not re-invoked after the callback
        assert_eq!(invoker.calls("op_b"), 1);
        assert_eq!(invoker.calls("op_c"), 1);
    }

    #[tokio::test]
    async fn missing_reference_is_terminal() {
        let invoker = Arc::new(MockInvoker::new());
        let graph = Graph {
            nodes: vec![
                node("start", NodeKind::Trigger, "trigger", json!({})),
                node(
                    "a",
                    NodeKind::Action,
                    "op_a",
                    json!({"v": "{{ghost.field}}"}),
                ),
            ],
            edges: vec![edge("start", "a")],
        };
        let exec = executor(invoker.clone());

        let outcome = exec.run(request(&graph)).await;
        let RunOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(error.error.contains("references missing output"));
        assert_eq!(invoker.calls("op_a"), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_between_nodes() {
        let invoker = Arc::new(MockInvoker::new());
        let graph = linear_graph();
        let exec = executor(invoker.clone());

        let mut req = request(&graph);
        req.cancel = CancellationToken::new();
        req.cancel.cancel();
        let outcome = exec.run(req).await;

        assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
        assert_eq!(invoker.calls("op_a"), 0);
    }

    #[tokio::test]
    async fn replay_from_node_skips_seeded_prefix() {
        let invoker = Arc::new(MockInvoker::new());
        let graph = linear_graph();
        let exec = executor(invoker.clone());

        let mut seeded = BTreeMap::new();
        seeded.insert(NodeId::new("start").unwrap(), json!({"text": "hello"}));
        seeded.insert(NodeId::new("a").unwrap(), json!({"seeded": true}));

        let mut req = request(&graph);
        req.start_node_id = Some(NodeId::new("b").unwrap());
        req.resume_state = Some(ResumeState {
            node_outputs: seeded,
            attempts: BTreeMap::new(),
            resume_node_id: None,
            resume_payload: None,
        });
        let outcome = exec.run(req).await;

        let RunOutcome::Completed { outputs, .. } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        // a's seeded output is preserved verbatim
        assert_eq!(outputs[&NodeId::new("a").unwrap()], json!({"seeded": true}));
        assert_eq!(invoker.calls("op_a"), 0);
        assert_eq!(invoker.calls("op_b"), 1);
        assert_eq!(invoker.calls("op_c"), 1);
    }

    #[test]
    fn retry_delay_grows_and_respects_floor() {
        let floor = Duration::from_secs(30);
        assert_eq!(retry_delay(1, floor), floor);

        // without a floor, delay grows with the attempt
        let d1 = retry_delay(1, Duration::ZERO);
        let d4 = retry_delay(4, Duration::ZERO);
        assert!(d4 > d1);
        // capped exponent: attempt 20 behaves like attempt 7
        let d20 = retry_delay(20, Duration::ZERO);
        assert!(d20 <= Duration::from_millis(2 * 1000 * 64 * 5 / 4 * 2));
    }

    #[test]
    fn seed_outputs_takes_strict_prefix() {
        let graph = linear_graph();
        let mut source_results = BTreeMap::new();
        for id in ["start", "a", "b", "c"] {
            source_results.insert(NodeId::new(id).unwrap(), json!({"from": id}));
        }
        let source = Execution {
            execution_id: ExecutionId::generate(),
            workflow_id: WorkflowId::generate(),
            organization_id: OrganizationId::generate(),
            user_id: None,
            version_id: None,
            status: flowline_types::ExecutionStatus::Completed,
            trigger_type: flowline_types::TriggerType::Manual,
            trigger_data: Value::Null,
            node_results: source_results,
            error_details: None,
            metering: Metering::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            replay: None,
            parent_execution_id: None,
        };

        let state = seed_outputs_for_replay(&source, &graph, &NodeId::new("b").unwrap()).unwrap();
        assert!(state.node_outputs.contains_key(&NodeId::new("start").unwrap()));
        assert!(state.node_outputs.contains_key(&NodeId::new("a").unwrap()));
        assert!(!state.node_outputs.contains_key(&NodeId::new("b").unwrap()));
        assert!(!state.node_outputs.contains_key(&NodeId::new("c").unwrap()));
    }
}
