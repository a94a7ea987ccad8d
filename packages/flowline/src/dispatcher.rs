use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flowline_crypto::{
    derive_legacy_key, JwtService, KeyRecordStore, KeyService, KmsProvider, SecretTokenService,
};
use flowline_engine::{seed_outputs_for_replay, ConnectorInvoker};
use flowline_types::{
    EncryptionKey, ExecutionId, ExecutionJob, NodeId, ReplayInfo, ReplayMode, TriggerType, UserId,
};
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;
use utils::context::AppContext;
use utils::storage::db::{handles, CoreDb, DBError};
use utils::storage::fs::JsonFileStore;
use utils::telemetry::CoreMetrics;

use crate::admission::Admission;
use crate::config::{Config, Secrets};
use crate::connections::{ConnectionStore, StoreCredentialResolver};
use crate::enqueue::{EnqueueError, EnqueueService};
use crate::health::{create_shared_health_status, SharedHealthStatus};
use crate::repo::{RepoError, WorkflowRepo};
use crate::subsystems::executor::ExecutorManager;
use crate::subsystems::queue::{self, QueueDriver};
use crate::subsystems::timers::TimerService;
use crate::subsystems::trigger::polling::PollingManager;
use crate::subsystems::trigger::schedule::ScheduleManager;
use crate::subsystems::trigger::webhook::WebhookManager;

/// Key-table storage for the key service.
struct DbKeyStore(CoreDb);

impl KeyRecordStore for DbKeyStore {
    fn list(&self) -> std::result::Result<Vec<EncryptionKey>, flowline_crypto::CryptoError> {
        self.0
            .collect_where(&handles::ENCRYPTION_KEYS, |_, _| true)
            .map_err(|e| flowline_crypto::CryptoError::KeyStore(e.to_string()))
    }

    fn get(&self, id: &str) -> std::result::Result<Option<EncryptionKey>, flowline_crypto::CryptoError> {
        self.0
            .get(&handles::ENCRYPTION_KEYS, &id.to_string())
            .map_err(|e| flowline_crypto::CryptoError::KeyStore(e.to_string()))
    }

    fn put(&self, key: EncryptionKey) -> std::result::Result<(), flowline_crypto::CryptoError> {
        self.0
            .set(&handles::ENCRYPTION_KEYS, key.id.clone(), key)
            .map_err(|e| flowline_crypto::CryptoError::KeyStore(e.to_string()))
    }
}

/// The process container: every service constructed once, wired here,
/// and passed down. Cross-process coordination happens through the store
/// and the queue, never through globals.
pub struct Dispatcher {
    pub config: Config,
    pub db: CoreDb,
    pub keys: Arc<KeyService>,
    pub jwt: Arc<JwtService>,
    pub secret_tokens: Arc<SecretTokenService>,
    pub repo: WorkflowRepo,
    pub connections: Arc<ConnectionStore>,
    pub enqueue: EnqueueService,
    pub webhooks: Arc<WebhookManager>,
    pub polling: Arc<PollingManager>,
    pub schedules: Arc<ScheduleManager>,
    pub timers: Arc<TimerService>,
    pub executor: Arc<ExecutorManager>,
    pub health: SharedHealthStatus,
    pub metrics: CoreMetrics,
}

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("execution {0} has no recorded output for node {1}")]
    NoNodeHistory(ExecutionId, NodeId),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error("db: {0}")]
    Db(#[from] DBError),

    #[error("engine: {0}")]
    Engine(#[from] flowline_engine::EngineError),
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        secrets: &Secrets,
        invoker: Arc<dyn ConnectorInvoker>,
        metrics: CoreMetrics,
    ) -> Result<Self> {
        let db = CoreDb::new()?;

        let legacy_key = match secrets.encryption_master_key.as_deref() {
            Some(master) => Some(derive_legacy_key(master).context("ENCRYPTION_MASTER_KEY")?),
            None => None,
        };

        let kms = match config.kms_provider.as_deref() {
            None => None,
            Some(provider) => {
                let provider: KmsProvider = provider
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!("KMS_PROVIDER: {}", e))?;
                Some(flowline_crypto::kms::build_provider(provider, legacy_key)?)
            }
        };

        let keys = Arc::new(
            KeyService::new(Arc::new(DbKeyStore(db.clone())), kms, legacy_key)
                .context("no usable encryption key source")?,
        );

        let jwt = Arc::new(JwtService::new(
            secrets.jwt_secret.as_deref(),
            config.development,
        )?);

        let secret_tokens = Arc::new(SecretTokenService::new(
            secrets
                .encryption_master_key
                .clone()
                .unwrap_or_else(|| String::from_utf8_lossy(jwt.secret_bytes()).into_owned())
                .into_bytes(),
            chrono::Duration::seconds(30),
        ));

        let queue = queue::build_driver(config)?;
        let admission = Admission::new(db.clone(), metrics.queue.clone());
        let enqueue = EnqueueService::new(
            db.clone(),
            admission,
            queue.clone(),
            metrics.queue.clone(),
        );

        let file_store = if config.allow_file_connection_store && config.development {
            let path = config
                .connection_store_path
                .clone()
                .unwrap_or_else(|| config.data.join("connections.json"));
            Some(Arc::new(JsonFileStore::new(path)?))
        } else {
            None
        };
        let connections = Arc::new(ConnectionStore::new(
            db.clone(),
            keys.clone(),
            invoker.clone(),
            file_store,
        ));

        let repo = WorkflowRepo::new(db.clone());

        let webhooks = Arc::new(WebhookManager::new(
            db.clone(),
            enqueue.clone(),
            metrics.trigger.clone(),
        )?);

        let polling = Arc::new(PollingManager::new(
            db.clone(),
            invoker.clone(),
            connections.clone(),
            enqueue.clone(),
            Duration::from_millis(config.poll_tick_ms),
            metrics.trigger.clone(),
        ));

        let schedules = Arc::new(ScheduleManager::new(
            db.clone(),
            enqueue.clone(),
            Duration::from_millis(config.poll_tick_ms),
            metrics.trigger.clone(),
        ));

        let public_url = config
            .server_public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", config.host, config.port));
        let timers = Arc::new(TimerService::new(
            db.clone(),
            enqueue.clone(),
            jwt.secret_bytes().to_vec(),
            public_url,
            Duration::from_secs(config.timer_tick_secs),
        ));

        let executor = Arc::new(ExecutorManager::new(
            db.clone(),
            repo.clone(),
            enqueue.clone(),
            invoker,
            Arc::new(StoreCredentialResolver(connections.clone())),
            timers.clone(),
            config.executor_workers,
            Duration::from_secs(config.ack_deadline_secs),
            config.max_attempts,
            metrics.executor.clone(),
        ));

        let health = create_shared_health_status(
            queue.driver_name().to_string(),
            queue.durable(),
        );

        Ok(Self {
            config: config.clone(),
            db,
            keys,
            jwt,
            secret_tokens,
            repo,
            connections,
            enqueue,
            webhooks,
            polling,
            schedules,
            timers,
            executor,
            health,
            metrics,
        })
    }

    /// Starts every supervised task and blocks until the kill signal.
    #[instrument(level = "debug", skip(self, ctx), fields(subsys = "Dispatcher"))]
    pub fn start(self: &Arc<Self>, ctx: AppContext) -> Result<()> {
        self.executor.start(ctx.clone(), self.health.clone());
        self.timers.start(ctx.clone(), self.health.clone());
        self.polling.start(ctx.clone());
        self.schedules.start(ctx.clone());

        // dedupe sweeper + queue health refresher
        let dispatcher = self.clone();
        let mut sweep_kill = ctx.get_kill_receiver();
        ctx.rt.spawn(async move {
            let ttl = chrono::Duration::seconds(dispatcher.config.webhook_dedupe_ttl_secs as i64);
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = sweep_kill.recv() => break,
                    _ = interval.tick() => {}
                }

                if let Err(err) = dispatcher.webhooks.sweep_dedupe(ttl) {
                    tracing::error!("dedupe sweep failed: {}", err);
                }
                if let Ok(backlog) = dispatcher.enqueue.queue().backlog() {
                    dispatcher.health.write().unwrap().queue.backlog = backlog;
                }
            }
        });

        tracing::info!(
            queue_driver = self.enqueue.queue().driver_name(),
            workers = self.config.executor_workers,
            "dispatcher started"
        );

        // block until shutdown
        let mut kill = ctx.get_kill_receiver();
        ctx.rt.block_on(async move {
            let _ = kill.recv().await;
        });
        tracing::info!("dispatcher shutting down");
        Ok(())
    }

    /// Manual enqueue from the API.
    pub fn enqueue_manual(
        &self,
        workflow_id: flowline_types::WorkflowId,
        initial_data: Value,
        user_id: Option<UserId>,
    ) -> Result<ExecutionId, DispatcherError> {
        let workflow = self.repo.get_workflow(&workflow_id)?;
        let job = ExecutionJob {
            execution_id: None,
            workflow_id,
            organization_id: workflow.organization_id,
            user_id,
            trigger_type: TriggerType::Manual,
            trigger_data: initial_data.clone(),
            initial_data,
            resume_state: None,
            replay: None,
            version_id: None,
        };
        Ok(self.enqueue.enqueue(job)?)
    }

    /// Full replay: a new execution over the same version with the same
    /// trigger payload.
    #[instrument(level = "debug", skip(self), fields(subsys = "Dispatcher"))]
    pub fn retry_execution(
        &self,
        execution_id: &ExecutionId,
        reason: Option<String>,
        triggered_by: Option<UserId>,
    ) -> Result<ExecutionId, DispatcherError> {
        let source = self
            .db
            .get(&handles::EXECUTIONS, execution_id)?
            .ok_or(DispatcherError::ExecutionNotFound(*execution_id))?;

        let job = ExecutionJob {
            execution_id: None,
            workflow_id: source.workflow_id,
            organization_id: source.organization_id,
            user_id: triggered_by,
            trigger_type: source.trigger_type,
            trigger_data: source.trigger_data.clone(),
            initial_data: Value::Null,
            resume_state: None,
            replay: Some(ReplayInfo {
                source_execution_id: *execution_id,
                mode: ReplayMode::Full,
                node_id: None,
                reason,
                triggered_by,
            }),
            version_id: source.version_id,
        };
        Ok(self.enqueue.enqueue(job)?)
    }

    /// Node replay: a new execution that seeds every output before
    /// `node_id` from the source run and re-executes the suffix.
    #[instrument(level = "debug", skip(self), fields(subsys = "Dispatcher"))]
    pub fn retry_node(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        reason: Option<String>,
        triggered_by: Option<UserId>,
    ) -> Result<ExecutionId, DispatcherError> {
        let source = self
            .db
            .get(&handles::EXECUTIONS, execution_id)?
            .ok_or(DispatcherError::ExecutionNotFound(*execution_id))?;

        let graph = match source.version_id {
            Some(version_id) => self.repo.get_version(&version_id)?.graph,
            None => {
                self.repo
                    .resolve_graph(&source.workflow_id, flowline_types::Environment::Production)?
                    .1
            }
        };

        if source.node_results.is_empty() {
            return Err(DispatcherError::NoNodeHistory(*execution_id, node_id.clone()));
        }
        let resume_state = seed_outputs_for_replay(&source, &graph, node_id)?;

        let job = ExecutionJob {
            execution_id: None,
            workflow_id: source.workflow_id,
            organization_id: source.organization_id,
            user_id: triggered_by,
            trigger_type: source.trigger_type,
            trigger_data: source.trigger_data.clone(),
            initial_data: Value::Null,
            resume_state: Some(resume_state),
            replay: Some(ReplayInfo {
                source_execution_id: *execution_id,
                mode: ReplayMode::Node,
                node_id: Some(node_id.clone()),
                reason,
                triggered_by,
            }),
            version_id: source.version_id,
        };
        Ok(self.enqueue.enqueue(job)?)
    }

    /// Appends a connector entitlement change to its audit table. Rows
    /// are append-only, like the quota audit.
    pub fn record_connector_entitlement(
        &self,
        organization_id: flowline_types::OrganizationId,
        connector: impl Into<String>,
        action: flowline_types::ConnectorAuditAction,
        performed_by: Option<UserId>,
        reason: Option<String>,
    ) -> Result<(), DispatcherError> {
        let event = flowline_types::ConnectorAuditEvent {
            id: flowline_types::EventId::generate(),
            organization_id,
            connector: connector.into(),
            action,
            performed_by,
            reason,
            metadata: Value::Null,
            created_at: chrono::Utc::now(),
        };
        self.db.set(&handles::CONNECTOR_AUDIT, event.id, event)?;
        Ok(())
    }

    pub fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<bool, DispatcherError> {
        let cancelled = self.executor.cancel(execution_id)?;
        if cancelled {
            // slots are released by whoever holds them; a queued
            // execution that never reaches a worker is released when the
            // worker drains its lease
            tracing::info!(execution_id = %execution_id, "execution cancellation requested");
        }
        Ok(cancelled)
    }

    pub fn execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<(flowline_types::Execution, Vec<flowline_types::NodeExecution>), DispatcherError>
    {
        let execution = self
            .db
            .get(&handles::EXECUTIONS, execution_id)?
            .ok_or(DispatcherError::ExecutionNotFound(*execution_id))?;

        let mut timeline = self
            .db
            .collect_where(&handles::NODE_EXECUTIONS, |(id, _, _), _| {
                id == execution_id
            })?;
        timeline.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then(a.attempt.cmp(&b.attempt))
        });

        Ok((execution, timeline))
    }
}
