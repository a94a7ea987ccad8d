//! Shared fixtures for unit and end-to-end tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use flowline_crypto::{derive_legacy_key, InMemoryKeyStore, KeyService};
use flowline_engine::{ConnectorInvoker, Invocation, InvocationContext, PollOutcome};
use flowline_types::{ConnectionTestResult, Organization, OrganizationId};
use serde_json::{json, Value};
use utils::storage::db::{handles, CoreDb};
use utils::telemetry::{CoreMetrics, QueueMetrics};

pub use crate::connectors::NullInvoker;

use crate::admission::Admission;
use crate::config::{Config, Secrets};
use crate::dispatcher::Dispatcher;
use crate::enqueue::EnqueueService;
use crate::subsystems::queue::MemoryQueue;

pub const TEST_MASTER_KEY: &str = "flowline-test-master-key-0123456789abcdef";

pub fn test_key_service() -> Arc<KeyService> {
    Arc::new(
        KeyService::new(
            Arc::new(InMemoryKeyStore::new()),
            None,
            Some(derive_legacy_key(TEST_MASTER_KEY).unwrap()),
        )
        .unwrap(),
    )
}

pub fn test_enqueue_service(db: &CoreDb) -> EnqueueService {
    let metrics = QueueMetrics::init(&opentelemetry::global::meter("test"));
    let admission = Admission::new(db.clone(), metrics.clone());
    EnqueueService::new(
        db.clone(),
        admission,
        Arc::new(MemoryQueue::new("inmemory", false)),
        metrics,
    )
}

/// Provisions a generously-limited trial org and returns its id.
pub fn provisioned_org(db: &CoreDb) -> OrganizationId {
    let mut org = Organization::provision_trial("test-org", Utc::now());
    org.plan.max_concurrent_executions = 100;
    org.plan.max_executions_per_minute = 1_000;
    db.set(&handles::ORGANIZATIONS, org.id, org.clone()).unwrap();
    org.id
}

/// A config rooted in a fresh temp dir, development mode, in-memory queue.
pub struct TestEnv {
    pub config: Config,
    _dir: tempfile::TempDir,
}

impl TestEnv {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data: dir.path().to_path_buf(),
            development: true,
            queue_driver: "inmemory".to_string(),
            executor_workers: 2,
            poll_tick_ms: 50,
            timer_tick_secs: 1,
            ..Config::default()
        };
        Self { config, _dir: dir }
    }
}

pub fn test_secrets() -> Secrets {
    Secrets {
        database_url: Some("postgres://flowline-test".to_string()),
        encryption_master_key: Some(TEST_MASTER_KEY.to_string()),
        jwt_secret: Some("flowline-test-jwt-secret".to_string()),
    }
}

pub fn test_dispatcher_with_config(config: &Config) -> Arc<Dispatcher> {
    test_dispatcher_with_invoker(config, Arc::new(NullInvoker))
}

pub fn test_dispatcher_with_invoker(
    config: &Config,
    invoker: Arc<dyn ConnectorInvoker>,
) -> Arc<Dispatcher> {
    let metrics = CoreMetrics::init(&opentelemetry::global::meter("test"));
    Arc::new(Dispatcher::new(config, &test_secrets(), invoker, metrics).unwrap())
}

/// Scripted poll invoker: a queue of `(events, next_cursor)` batches,
/// then empty polls; or a permanently failing variant.
pub struct PollScriptInvoker {
    batches: Mutex<VecDeque<(Vec<Value>, Option<Value>)>>,
    failing: bool,
}

impl PollScriptInvoker {
    pub fn new(batches: Vec<(Vec<Value>, Option<Value>)>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            failing: true,
        }
    }
}

#[async_trait]
impl ConnectorInvoker for PollScriptInvoker {
    async fn execute(
        &self,
        _app: &str,
        op: &str,
        _credentials: Option<Value>,
        params: Value,
        _ctx: &InvocationContext,
    ) -> Invocation {
        Invocation::Ok {
            output: json!({"op": op, "echo": params}),
            metering: Default::default(),
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
        if self.failing {
            return Err("upstream unavailable".to_string());
        }
        match self.batches.lock().unwrap().pop_front() {
            Some((events, next_cursor)) => Ok(PollOutcome {
                events,
                cursor: next_cursor.or(cursor),
            }),
            None => Ok(PollOutcome {
                events: vec![],
                cursor,
            }),
        }
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

/// Scripted execute invoker for pipeline tests: per-op outcome queues,
/// echo fallback, invocation counting.
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Invocation>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedInvoker {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, op: &str, outcomes: Vec<Invocation>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(op.to_string(), outcomes.into());
    }

    pub fn calls(&self, op: &str) -> u32 {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ConnectorInvoker for ScriptedInvoker {
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
            metering: flowline_types::Metering {
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
        cursor: Option<Value>,
    ) -> Result<PollOutcome, String> {
        Ok(PollOutcome {
            events: vec![],
            cursor,
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
