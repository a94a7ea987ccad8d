//! End-to-end pipeline scenarios: webhook ingress through signature
//! verification, dedupe, admission, the queue, and the executor fleet,
//! driven over the public router.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use flowline::dispatcher::Dispatcher;
use flowline::http::server::make_router;
use flowline::subsystems::timers::IssueTokenRequest;
use flowline::subsystems::trigger::verify::emit;
use flowline::test_utils::{test_dispatcher_with_invoker, ScriptedInvoker, TestEnv, TEST_MASTER_KEY};
use flowline_engine::{FailKind, Invocation};
use flowline_types::{
    Credential, Edge, ExecutionCounters, ExecutionId, ExecutionStatus, Graph, Node, NodeId,
    NodeKind, Organization, ResumeState, TriggerType, VerificationFailureReason, WorkflowId,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use utils::context::AppContext;
use utils::storage::db::handles;

// quiet the unused import in builds without the crypto assertions
#[allow(unused_imports)]
use flowline_crypto::derive_legacy_key;

struct Harness {
    ctx: AppContext,
    dispatcher: Arc<Dispatcher>,
    invoker: Arc<ScriptedInvoker>,
    router: axum::Router,
    _env: TestEnv,
}

impl Harness {
    fn new() -> Self {
        flowline::init_tracing_tests();

        let env = TestEnv::new();
        let invoker = Arc::new(ScriptedInvoker::new());
        let dispatcher = test_dispatcher_with_invoker(&env.config, invoker.clone());
        let router = make_router(
            env.config.clone(),
            dispatcher.clone(),
            utils::telemetry::HttpMetrics::init(&opentelemetry::global::meter("test")),
        );

        let ctx = AppContext::new();
        std::thread::spawn({
            let dispatcher = dispatcher.clone();
            let ctx = ctx.clone();
            move || {
                dispatcher.start(ctx).unwrap();
            }
        });

        Self {
            ctx,
            dispatcher,
            invoker,
            router,
            _env: env,
        }
    }

    fn provision_org(&self, max_concurrent: u32, max_rpm: u32) -> Organization {
        let mut org = Organization::provision_trial("acme", Utc::now());
        org.plan.max_concurrent_executions = max_concurrent;
        org.plan.max_executions_per_minute = max_rpm;
        self.dispatcher
            .db
            .set(&handles::ORGANIZATIONS, org.id, org.clone())
            .unwrap();
        org
    }

    fn create_workflow(&self, org: &Organization) -> WorkflowId {
        let graph = Graph {
            nodes: vec![
                node("start", NodeKind::Trigger, "trigger"),
                node("a", NodeKind::Action, "op_a"),
                node("b", NodeKind::Action, "op_b"),
                node("c", NodeKind::Action, "op_c"),
            ],
            edges: vec![edge("start", "a"), edge("a", "b"), edge("b", "c")],
        };
        self.dispatcher
            .repo
            .create_workflow(org.id, "pipeline", graph)
            .unwrap()
            .id
    }

    fn request(&self, req: Request<Body>) -> (StatusCode, Value) {
        self.ctx.rt.block_on(async {
            let response = self.router.clone().oneshot(req).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, body)
        })
    }

    fn wait_for_status(&self, execution_id: ExecutionId, status: ExecutionStatus) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let current = self
                .dispatcher
                .db
                .get(&handles::EXECUTIONS, &execution_id)
                .unwrap();
            if let Some(execution) = &current {
                if execution.status == status {
                    return;
                }
                assert!(
                    execution.status.is_active() || execution.status == status,
                    "execution settled in {:?} while waiting for {:?}",
                    execution.status,
                    status
                );
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {:?}, currently {:?}",
                status,
                current.map(|e| e.status)
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn executions(&self) -> Vec<flowline_types::Execution> {
        self.dispatcher
            .db
            .collect_where(&handles::EXECUTIONS, |_, _| true)
            .unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ctx.kill();
    }
}

fn node(id: &str, kind: NodeKind, op: &str) -> Node {
    Node {
        id: NodeId::new(id).unwrap(),
        kind,
        app: "mock".to_string(),
        op: op.to_string(),
        params: json!({}),
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

fn slack_post(webhook_id: &str, body: &str, signature: &str, timestamp: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/api/webhooks/{}", webhook_id))
        .header("content-type", "application/json")
        .header("x-slack-signature", signature)
        .header("x-slack-request-timestamp", timestamp)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[test]
fn webhook_to_completed_execution() {
    let harness = Harness::new();
    let org = harness.provision_org(10, 100);
    let workflow_id = harness.create_workflow(&org);

    let secret = "slack-signing-secret";
    let registration = harness
        .dispatcher
        .webhooks
        .register(
            workflow_id,
            org.id,
            "slack",
            "message",
            Some(Credential::new(secret.to_string())),
        )
        .unwrap();

    let body = r#"{"event":{"type":"message","text":"hi"}}"#;
    let now = Utc::now().timestamp();
    let (signature, timestamp) = emit::slack(secret, now, body.as_bytes());

    let (status, response) = harness.request(slack_post(
        registration.webhook_id.as_ref(),
        body,
        &signature,
        &timestamp,
    ));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["success"], true);
    assert_eq!(response["duplicate"], false);

    let execution_id: ExecutionId = response["executionId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    harness.wait_for_status(execution_id, ExecutionStatus::Completed);

    let executions = harness.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].trigger_type, TriggerType::Webhook);
    // the trigger payload flowed into the run
    let (detail, timeline) = harness.dispatcher.execution(&execution_id).unwrap();
    assert_eq!(detail.status, ExecutionStatus::Completed);
    assert_eq!(timeline.first().unwrap().node_id.as_ref(), "start");
    assert_eq!(
        timeline.first().unwrap().output.as_ref().unwrap()["event"]["text"],
        "hi"
    );
}

#[test]
fn replayed_delivery_is_deduplicated() {
    let harness = Harness::new();
    let org = harness.provision_org(10, 100);
    let workflow_id = harness.create_workflow(&org);

    let secret = "whsec_stripe";
    let registration = harness
        .dispatcher
        .webhooks
        .register(
            workflow_id,
            org.id,
            "stripe",
            "invoice.paid",
            Some(Credential::new(secret.to_string())),
        )
        .unwrap();

    let body = r#"{"type":"invoice.paid","id":"evt_1"}"#;
    let signature = emit::stripe(secret, Utc::now().timestamp(), body.as_bytes());

    let post = || {
        Request::builder()
            .method("POST")
            .uri(format!("/api/webhooks/{}", registration.webhook_id))
            .header("content-type", "application/json")
            .header("stripe-signature", signature.clone())
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let (status, first) = harness.request(post());
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["duplicate"], false);

    let (status, second) = harness.request(post());
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["duplicate"], true);
    assert!(second["executionId"].is_null());

    // exactly one execution for the two deliveries
    assert_eq!(harness.executions().len(), 1);

    // the duplicate is recorded as such
    let events = harness
        .dispatcher
        .db
        .collect_where(&handles::WEBHOOK_EVENTS, |_, e| e.duplicate)
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[test]
fn quota_rejection_returns_429_with_audit() {
    let harness = Harness::new();
    let org = harness.provision_org(2, 100);
    let workflow_id = harness.create_workflow(&org);

    // two runs already in flight
    harness
        .dispatcher
        .db
        .set(
            &handles::EXECUTION_COUNTERS,
            org.id,
            ExecutionCounters {
                running_executions: 2,
                window_start: Utc::now(),
                executions_in_window: 2,
            },
        )
        .unwrap();

    let (status, body) = harness.request(
        Request::builder()
            .method("POST")
            .uri("/api/executions")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"workflowId": workflow_id, "initialData": {}}).to_string(),
            ))
            .unwrap(),
    );

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);

    let audit = harness
        .dispatcher
        .db
        .collect_where(&handles::QUOTA_AUDIT, |_, _| true)
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].event_type, "concurrency_exceeded");
    assert_eq!(audit[0].limit_value, 2);
    assert_eq!(audit[0].observed_value, 2);

    // the rejected run is visible as rate limited
    let rate_limited = harness
        .dispatcher
        .db
        .collect_where(&handles::EXECUTIONS, |_, e| {
            e.status == ExecutionStatus::RateLimited
        })
        .unwrap();
    assert_eq!(rate_limited.len(), 1);
}

#[test]
fn replay_from_node_seeds_prefix_and_reruns_suffix() {
    let harness = Harness::new();
    let org = harness.provision_org(10, 100);
    let workflow_id = harness.create_workflow(&org);

    // first run completes normally
    let execution_id = harness
        .dispatcher
        .enqueue_manual(workflow_id, json!({"seed": 1}), None)
        .unwrap();
    harness.wait_for_status(execution_id, ExecutionStatus::Completed);
    assert_eq!(harness.invoker.calls("op_a"), 1);

    let (source, _) = harness.dispatcher.execution(&execution_id).unwrap();
    let a_output = source.node_results[&NodeId::new("a").unwrap()].clone();

    // replay from node b over the API
    let (status, body) = harness.request(
        Request::builder()
            .method("POST")
            .uri(format!("/api/executions/{}/nodes/b/retry", execution_id))
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap(),
    );
    assert_eq!(status, StatusCode::OK);
    let replay_id: ExecutionId = body["executionId"].as_str().unwrap().parse().unwrap();
    assert_ne!(replay_id, execution_id);

    harness.wait_for_status(replay_id, ExecutionStatus::Completed);

    let (replayed, _) = harness.dispatcher.execution(&replay_id).unwrap();
    // a's output was carried over, not recomputed
    assert_eq!(
        replayed.node_results[&NodeId::new("a").unwrap()],
        a_output
    );
    assert_eq!(harness.invoker.calls("op_a"), 1);
    // b and c re-executed
    assert_eq!(harness.invoker.calls("op_b"), 2);
    assert_eq!(harness.invoker.calls("op_c"), 2);

    assert_eq!(
        replayed.replay.as_ref().unwrap().source_execution_id,
        execution_id
    );
}

#[test]
fn tampered_signature_is_rejected_and_recorded() {
    let harness = Harness::new();
    let org = harness.provision_org(10, 100);
    let workflow_id = harness.create_workflow(&org);

    let secret = "slack-signing-secret";
    let registration = harness
        .dispatcher
        .webhooks
        .register(
            workflow_id,
            org.id,
            "slack",
            "message",
            Some(Credential::new(secret.to_string())),
        )
        .unwrap();

    let body = r#"{"event":{"type":"message","text":"hi"}}"#;
    let now = Utc::now().timestamp();
    let (signature, timestamp) = emit::slack(secret, now, body.as_bytes());

    // flip one bit in the last hex digit
    let mut tampered = signature.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == '0' { '1' } else { '0' });

    let (status, response) = harness.request(slack_post(
        registration.webhook_id.as_ref(),
        body,
        &tampered,
        &timestamp,
    ));
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["success"], false);

    // zero executions enqueued
    assert!(harness.executions().is_empty());

    let failures = harness
        .dispatcher
        .db
        .collect_where(&handles::VERIFICATION_FAILURES, |_, _| true)
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].reason,
        VerificationFailureReason::SignatureMismatch
    );
}

#[test]
fn resume_token_is_single_use_over_http() {
    let harness = Harness::new();
    let org = harness.provision_org(10, 100);
    let workflow_id = harness.create_workflow(&org);

    // node b yields to an external callback
    harness.invoker.script(
        "op_b",
        vec![Invocation::Callback {
            wait_until: None,
            metadata: json!({"channel": "approval"}),
        }],
    );

    let execution_id = harness
        .dispatcher
        .enqueue_manual(workflow_id, json!({}), None)
        .unwrap();
    harness.wait_for_status(execution_id, ExecutionStatus::Waiting);

    // rebuild the parked state and issue a callback token for it
    let (parked, _) = harness.dispatcher.execution(&execution_id).unwrap();
    let issued = harness
        .dispatcher
        .timers
        .issue_token(IssueTokenRequest {
            execution_id,
            workflow_id,
            organization_id: org.id,
            node_id: NodeId::new("b").unwrap(),
            resume_state: ResumeState {
                node_outputs: parked.node_results.clone(),
                attempts: Default::default(),
                resume_node_id: Some(NodeId::new("b").unwrap()),
                resume_payload: None,
            },
            initial_data: Value::Null,
            trigger_type: TriggerType::Manual,
            wait_until: None,
            metadata: None,
            ttl: None,
        })
        .unwrap();

    let callback = format!(
        "/api/runs/{}/nodes/b/resume?token={}&signature={}",
        execution_id, issued.token, issued.signature
    );

    let (status, body) = harness.request(
        Request::builder()
            .method("POST")
            .uri(callback.clone())
            .header("content-type", "application/json")
            .body(Body::from(json!({"approved": true}).to_string()))
            .unwrap(),
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["executionId"].as_str().unwrap(), execution_id.to_string());

    harness.wait_for_status(execution_id, ExecutionStatus::Completed);

    // the callback payload became node b's output
    let (resumed, _) = harness.dispatcher.execution(&execution_id).unwrap();
    assert_eq!(
        resumed.node_results[&NodeId::new("b").unwrap()],
        json!({"approved": true})
    );

    // second consume: gone
    let (status, body) = harness.request(
        Request::builder()
            .method("POST")
            .uri(callback)
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap(),
    );
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["success"], false);
}

#[test]
fn retryable_failure_redelivers_and_completes() {
    let harness = Harness::new();
    let org = harness.provision_org(10, 100);
    let workflow_id = harness.create_workflow(&org);

    harness.invoker.script(
        "op_b",
        vec![Invocation::Retry {
            delay: Duration::from_millis(10),
            message: "rate limited upstream".to_string(),
        }],
    );

    let execution_id = harness
        .dispatcher
        .enqueue_manual(workflow_id, json!({}), None)
        .unwrap();
    harness.wait_for_status(execution_id, ExecutionStatus::Completed);

    // a ran once, b was retried once after the redelivery
    assert_eq!(harness.invoker.calls("op_a"), 1);
    assert_eq!(harness.invoker.calls("op_b"), 2);
}

#[test]
fn terminal_failure_surfaces_error_details() {
    let harness = Harness::new();
    let org = harness.provision_org(10, 100);
    let workflow_id = harness.create_workflow(&org);

    harness.invoker.script(
        "op_b",
        vec![Invocation::Fail {
            kind: FailKind::Permanent,
            message: "upstream 400".to_string(),
        }],
    );

    let execution_id = harness
        .dispatcher
        .enqueue_manual(workflow_id, json!({}), None)
        .unwrap();
    harness.wait_for_status(execution_id, ExecutionStatus::Failed);

    let (failed, _) = harness.dispatcher.execution(&execution_id).unwrap();
    let error = failed.error_details.unwrap();
    assert_eq!(error.node_id, Some(NodeId::new("b").unwrap()));
    assert!(error.error.contains("upstream 400"));
    // c never ran
    assert_eq!(harness.invoker.calls("op_c"), 0);

    // the concurrency slot was released
    assert_eq!(
        harness
            .dispatcher
            .enqueue
            .admission()
            .running(&org.id)
            .unwrap(),
        0
    );
}

#[test]
fn readiness_flips_once_workers_heartbeat() {
    let harness = Harness::new();

    // workers heartbeat quickly after start
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) = harness.request(
            Request::builder()
                .method("GET")
                .uri("/api/production/ready")
                .body(Body::empty())
                .unwrap(),
        );
        if status == StatusCode::OK {
            assert_eq!(body["ready"], true);
            break;
        }
        assert!(Instant::now() < deadline, "readiness never flipped");
        std::thread::sleep(Duration::from_millis(50));
    }

    let (status, body) = harness.request(
        Request::builder()
            .method("GET")
            .uri("/api/production/queue/heartbeat")
            .body(Body::empty())
            .unwrap(),
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["driver"], "inmemory");
    assert_eq!(body["durable"], false);
}

#[test]
fn master_key_round_trips_credentials() {
    // the legacy key path used by the harness dispatcher
    let key = derive_legacy_key(TEST_MASTER_KEY).unwrap();
    let (iv, ct) = flowline_crypto::seal(&key, b"credential blob", flowline_crypto::CREDENTIALS_AAD).unwrap();
    let opened = flowline_crypto::open(&key, &iv, &ct, flowline_crypto::CREDENTIALS_AAD).unwrap();
    assert_eq!(opened, b"credential blob");
}
