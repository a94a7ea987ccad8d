use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use flowline_engine::{
    redact_value, ConnectorInvoker, CredentialResolver, IdempotencyStore, RunExecutor,
    RunOutcome, RunRequest,
};
use flowline_types::{
    ErrorDetails, ExecutionId, ExecutionJob, ExecutionStatus, Graph, Metering, NodeExecution,
    NodeExecutionResult, NodeId, ReplayMode, ResumeState, TriggerType,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use utils::context::AppContext;
use utils::storage::db::{handles, CoreDb, DBError};
use utils::telemetry::ExecutorMetrics;

use crate::enqueue::EnqueueService;
use crate::health::{heartbeat, SharedHealthStatus};
use crate::repo::WorkflowRepo;
use crate::subsystems::queue::{QueueDriver, QueueLease};
use crate::subsystems::timers::{IssueTokenRequest, TimerService};

/// Pause before retrying dequeue when admission pushes back.
const BACKPRESSURE_DELAY: Duration = Duration::from_secs(1);
/// Idle poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Idempotency cache over the node-results table.
pub struct DbIdempotencyStore(pub CoreDb);

impl IdempotencyStore for DbIdempotencyStore {
    fn get(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        idempotency_key: &str,
    ) -> Option<NodeExecutionResult> {
        self.0
            .get(
                &handles::NODE_RESULTS,
                &(*execution_id, node_id.clone(), idempotency_key.to_string()),
            )
            .ok()
            .flatten()
    }

    fn put(&self, result: NodeExecutionResult) {
        let key = (
            result.execution_id,
            result.node_id.clone(),
            result.idempotency_key.clone(),
        );
        if let Err(err) = self.0.set(&handles::NODE_RESULTS, key, result) {
            tracing::error!("failed to persist idempotency row: {}", err);
        }
    }
}

/// The worker fleet: pulls leased jobs, re-checks admission, drives the
/// run executor, and writes back every status transition. One lease is
/// processed at a time per worker; parallelism across executions comes
/// from the worker count and stays bounded by admission.
pub struct ExecutorManager {
    db: CoreDb,
    repo: WorkflowRepo,
    enqueue: EnqueueService,
    runner: Arc<RunExecutor>,
    timers: Arc<TimerService>,
    workers: usize,
    ack_deadline: Duration,
    cancel_tokens: Arc<DashMap<ExecutionId, CancellationToken>>,
    metrics: ExecutorMetrics,
}

impl ExecutorManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: CoreDb,
        repo: WorkflowRepo,
        enqueue: EnqueueService,
        invoker: Arc<dyn ConnectorInvoker>,
        credentials: Arc<dyn CredentialResolver>,
        timers: Arc<TimerService>,
        workers: usize,
        ack_deadline: Duration,
        max_attempts: u32,
        metrics: ExecutorMetrics,
    ) -> Self {
        let runner = Arc::new(RunExecutor::new(
            invoker,
            credentials,
            Arc::new(DbIdempotencyStore(db.clone())),
            max_attempts,
        ));
        Self {
            db,
            repo,
            enqueue,
            runner,
            timers,
            workers,
            ack_deadline,
            cancel_tokens: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub fn start(self: &Arc<Self>, ctx: AppContext, health: SharedHealthStatus) {
        for worker in 0..self.workers {
            let manager = self.clone();
            let health = health.clone();
            let mut kill = ctx.get_kill_receiver();
            ctx.rt.spawn(async move {
                let component = format!("executor-worker-{}", worker);
                loop {
                    heartbeat(&health, &component);

                    tokio::select! {
                        _ = kill.recv() => {
                            tracing::debug!(worker, "executor worker shutting down");
                            break;
                        }
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }

                    loop {
                        let lease = match manager.enqueue.queue().dequeue(manager.ack_deadline) {
                            Ok(Some(lease)) => lease,
                            Ok(None) => break,
                            Err(err) => {
                                tracing::error!(worker, "dequeue failed: {}", err);
                                break;
                            }
                        };
                        heartbeat(&health, &component);
                        manager.process(lease).await;
                    }
                }
            });
        }
    }

    /// Requests cancellation: flips the row and trips the in-flight
    /// token. The running node is allowed to finish; the executor stops
    /// at the next node boundary.
    pub fn cancel(&self, execution_id: &ExecutionId) -> Result<bool, DBError> {
        let flipped = self.db.update(&handles::EXECUTIONS, *execution_id, |slot| {
            match slot.as_mut() {
                Some(execution) if execution.status.is_active() => {
                    execution.status = ExecutionStatus::Cancelled;
                    execution.completed_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        })?;

        if flipped {
            if let Some(token) = self.cancel_tokens.get(execution_id) {
                token.cancel();
            }
        }
        Ok(flipped)
    }

    #[instrument(level = "debug", skip(self, lease), fields(subsys = "ExecutorManager"))]
    pub async fn process(&self, lease: QueueLease) {
        let job = lease.job.clone();
        let Some(execution_id) = job.execution_id else {
            // jobs without ids cannot be tracked; drop them
            tracing::error!("job without execution id; acking and dropping");
            let _ = self.enqueue.queue().ack(&lease);
            return;
        };

        match self.process_inner(&lease, job, execution_id).await {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(
                    execution_id = %execution_id,
                    "job processing failed terminally: {}",
                    err
                );
                let _ = self.fail_execution(
                    execution_id,
                    ErrorDetails {
                        node_id: None,
                        error: err,
                        context: None,
                    },
                );
                let _ = self.enqueue.admission().release(lease.job.organization_id);
                let _ = self.enqueue.queue().ack(&lease);
            }
        }
    }

    async fn process_inner(
        &self,
        lease: &QueueLease,
        job: ExecutionJob,
        execution_id: ExecutionId,
    ) -> Result<(), String> {
        let queue = self.enqueue.queue().clone();

        let execution = self
            .db
            .get(&handles::EXECUTIONS, &execution_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "execution row missing".to_string())?;

        // cancelled while queued
        if execution.status == ExecutionStatus::Cancelled {
            self.enqueue
                .admission()
                .release(job.organization_id)
                .map_err(|e| e.to_string())?;
            queue.ack(lease).map_err(|e| e.to_string())?;
            return Ok(());
        }

        // dequeue-side admission recheck guards cold replays admitted
        // under older limits
        let org = self
            .db
            .get(&handles::ORGANIZATIONS, &job.organization_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "organization missing".to_string())?;
        if !self
            .enqueue
            .admission()
            .within_concurrency(&org)
            .map_err(|e| e.to_string())?
        {
            tracing::debug!(
                execution_id = %execution_id,
                organization_id = %org.id,
                "backpressure: concurrency exceeded at dequeue, redelivering"
            );
            queue
                .nack(lease, BACKPRESSURE_DELAY, None)
                .map_err(|e| e.to_string())?;
            return Ok(());
        }

        // mark running, keeping the first started_at across redeliveries
        let started_at = self
            .db
            .update(&handles::EXECUTIONS, execution_id, |slot| {
                slot.as_mut().map(|execution| {
                    execution.status = ExecutionStatus::Running;
                    let started = execution.started_at.unwrap_or_else(Utc::now);
                    execution.started_at = Some(started);
                    started
                })
            })
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "execution row disappeared".to_string())?;

        let (version_id, graph) = self.resolve_graph(&job)?;
        if let Some(version_id) = version_id {
            let _ = self.db.update(&handles::EXECUTIONS, execution_id, |slot| {
                if let Some(execution) = slot.as_mut() {
                    execution.version_id = Some(version_id);
                }
            });
        }

        let start_node_id = job
            .replay
            .as_ref()
            .filter(|replay| replay.mode == ReplayMode::Node)
            .and_then(|replay| replay.node_id.clone());

        let cancel = CancellationToken::new();
        self.cancel_tokens.insert(execution_id, cancel.clone());

        let trigger_output = trigger_output(&job);
        let request = RunRequest {
            execution_id,
            workflow_id: job.workflow_id,
            organization_id: job.organization_id,
            graph: &graph,
            trigger_output,
            resume_state: job.resume_state.clone(),
            start_node_id,
            cancel,
        };

        let outcome = self.runner.run(request).await;
        self.cancel_tokens.remove(&execution_id);

        match outcome {
            RunOutcome::Completed {
                outputs,
                metering,
                records,
            } => {
                self.persist_records(&records);
                let now = Utc::now();
                let duration = now.signed_duration_since(started_at).num_milliseconds();
                self.db
                    .update(&handles::EXECUTIONS, execution_id, |slot| {
                        if let Some(execution) = slot.as_mut() {
                            execution.status = ExecutionStatus::Completed;
                            execution.completed_at = Some(now);
                            execution.duration_ms = Some(duration.max(0) as u64);
                            execution.metering.accumulate(&metering);
                            execution.node_results = outputs
                                .iter()
                                .map(|(id, value)| (id.clone(), redact_value(value)))
                                .collect();
                        }
                    })
                    .map_err(|e| e.to_string())?;
                self.emit_usage(&job, &metering);
                self.enqueue
                    .admission()
                    .release(job.organization_id)
                    .map_err(|e| e.to_string())?;
                queue.ack(lease).map_err(|e| e.to_string())?;

                self.metrics.executions_completed.add(1, &[]);
                self.metrics
                    .execution_seconds
                    .record(duration.max(0) as f64 / 1000.0, &[]);
                tracing::info!(
                    execution_id = %execution_id,
                    organization_id = %job.organization_id,
                    duration_ms = duration,
                    "execution completed"
                );
            }
            RunOutcome::Waiting {
                node_id,
                resume_state,
                wait_until,
                metadata,
                metering,
                records,
            } => {
                self.persist_records(&records);
                self.park_waiting(
                    lease,
                    &job,
                    execution_id,
                    node_id,
                    resume_state,
                    wait_until,
                    metadata,
                    metering,
                )?;
            }
            RunOutcome::RetryLater {
                node_id,
                delay,
                resume_state,
                metering,
                records,
            } => {
                self.persist_records(&records);
                self.metrics.node_retries.add(1, &[]);
                let attempt = resume_state.attempts.get(&node_id).copied().unwrap_or(0);
                tracing::warn!(
                    execution_id = %execution_id,
                    organization_id = %job.organization_id,
                    node_id = %node_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "node retry scheduled"
                );

                self.db
                    .update(&handles::EXECUTIONS, execution_id, |slot| {
                        if let Some(execution) = slot.as_mut() {
                            execution.status = ExecutionStatus::Queued;
                            execution.metering.accumulate(&metering);
                        }
                    })
                    .map_err(|e| e.to_string())?;

                let mut updated = job.clone();
                updated.resume_state = Some(resume_state);
                queue
                    .nack(lease, delay, Some(updated))
                    .map_err(|e| e.to_string())?;
            }
            RunOutcome::Failed {
                error,
                outputs,
                metering,
                records,
            } => {
                self.persist_records(&records);
                self.db
                    .update(&handles::EXECUTIONS, execution_id, |slot| {
                        if let Some(execution) = slot.as_mut() {
                            execution.metering.accumulate(&metering);
                            execution.node_results = outputs
                                .iter()
                                .map(|(id, value)| (id.clone(), redact_value(value)))
                                .collect();
                        }
                    })
                    .map_err(|e| e.to_string())?;
                self.fail_execution(execution_id, error)
                    .map_err(|e| e.to_string())?;
                self.enqueue
                    .admission()
                    .release(job.organization_id)
                    .map_err(|e| e.to_string())?;
                queue.ack(lease).map_err(|e| e.to_string())?;
                self.metrics.executions_failed.add(1, &[]);
            }
            RunOutcome::Cancelled { metering, records } => {
                self.persist_records(&records);
                self.db
                    .update(&handles::EXECUTIONS, execution_id, |slot| {
                        if let Some(execution) = slot.as_mut() {
                            execution.status = ExecutionStatus::Cancelled;
                            execution.metering.accumulate(&metering);
                            execution.completed_at.get_or_insert_with(Utc::now);
                        }
                    })
                    .map_err(|e| e.to_string())?;
                self.enqueue
                    .admission()
                    .release(job.organization_id)
                    .map_err(|e| e.to_string())?;
                queue.ack(lease).map_err(|e| e.to_string())?;
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn park_waiting(
        &self,
        lease: &QueueLease,
        job: &ExecutionJob,
        execution_id: ExecutionId,
        node_id: NodeId,
        resume_state: ResumeState,
        wait_until: Option<chrono::DateTime<Utc>>,
        metadata: Value,
        metering: Metering,
    ) -> Result<(), String> {
        let issued = self
            .timers
            .issue_token(IssueTokenRequest {
                execution_id,
                workflow_id: job.workflow_id,
                organization_id: job.organization_id,
                node_id: node_id.clone(),
                resume_state: resume_state.clone(),
                initial_data: job.initial_data.clone(),
                trigger_type: job.trigger_type,
                wait_until,
                metadata: Some(metadata),
                ttl: None,
            })
            .map_err(|e| e.to_string())?;

        if let Some(wait_until) = wait_until {
            let wakeup = ExecutionJob {
                execution_id: Some(execution_id),
                resume_state: Some(resume_state.clone()),
                replay: None,
                version_id: job.version_id,
                trigger_data: Value::Null,
                ..job.clone()
            };
            self.timers
                .schedule_timer(execution_id, wait_until, &wakeup)
                .map_err(|e| e.to_string())?;
        }

        self.db
            .update(&handles::EXECUTIONS, execution_id, |slot| {
                if let Some(execution) = slot.as_mut() {
                    execution.status = ExecutionStatus::Waiting;
                    execution.metering.accumulate(&metering);
                    // partial outputs are visible in the run detail while
                    // the execution is parked
                    execution.node_results = resume_state
                        .node_outputs
                        .iter()
                        .map(|(id, value)| (id.clone(), redact_value(value)))
                        .collect();
                }
            })
            .map_err(|e| e.to_string())?;

        // a parked run holds no concurrency slot; resumption re-admits
        self.enqueue
            .admission()
            .release(job.organization_id)
            .map_err(|e| e.to_string())?;
        self.enqueue
            .queue()
            .ack(lease)
            .map_err(|e| e.to_string())?;

        tracing::info!(
            execution_id = %execution_id,
            node_id = %node_id,
            token_id = %issued.token_id,
            wait_until = ?wait_until,
            "execution waiting on callback"
        );
        Ok(())
    }

    fn resolve_graph(&self, job: &ExecutionJob) -> Result<(Option<flowline_types::VersionId>, Graph), String> {
        if let Some(version_id) = job.version_id {
            let version = self
                .repo
                .get_version(&version_id)
                .map_err(|e| e.to_string())?;
            return Ok((Some(version.id), version.graph));
        }
        self.repo
            .resolve_graph(&job.workflow_id, flowline_types::Environment::Production)
            .map_err(|e| e.to_string())
    }

    fn persist_records(&self, records: &[NodeExecution]) {
        for record in records {
            self.metrics.nodes_invoked.add(1, &[]);
            let mut stored = record.clone();
            stored.input = redact_value(&stored.input);
            stored.output = stored.output.as_ref().map(redact_value);
            stored.error = stored.error.as_deref().map(flowline_engine::redact::redact_string);

            let key = (stored.execution_id, stored.node_id.clone(), stored.attempt);
            if let Err(err) = self.db.set(&handles::NODE_EXECUTIONS, key, stored) {
                tracing::error!("failed to persist node execution: {}", err);
            }
        }
    }

    fn fail_execution(
        &self,
        execution_id: ExecutionId,
        error: ErrorDetails,
    ) -> Result<(), DBError> {
        let redacted = ErrorDetails {
            node_id: error.node_id.clone(),
            error: flowline_engine::redact::redact_string(&error.error),
            context: error.context.as_ref().map(redact_value),
        };
        self.db.update(&handles::EXECUTIONS, execution_id, |slot| {
            if let Some(execution) = slot.as_mut() {
                execution.status = ExecutionStatus::Failed;
                execution.error_details = Some(redacted);
                execution.completed_at = Some(Utc::now());
            }
        })
    }

    fn emit_usage(&self, job: &ExecutionJob, metering: &Metering) {
        let result = self
            .db
            .update(&handles::ORGANIZATIONS, job.organization_id, |slot| {
                if let Some(org) = slot.as_mut() {
                    org.usage.executions_total += 1;
                    org.usage.api_calls_total += metering.api_calls_made;
                    org.usage.tokens_total += metering.tokens_used;
                    org.usage.storage_bytes += metering.data_processed_bytes;
                }
            });
        if let Err(err) = result {
            tracing::error!("failed to emit usage delta: {}", err);
        }
    }
}

/// Extracts the trigger node's output from the job: the delivery payload
/// for webhooks and polls, the initial data for manual runs.
fn trigger_output(job: &ExecutionJob) -> Value {
    match job.trigger_type {
        TriggerType::Webhook | TriggerType::Polling => job
            .trigger_data
            .get("payload")
            .cloned()
            .unwrap_or_else(|| job.trigger_data.clone()),
        TriggerType::Schedule => job.trigger_data.clone(),
        TriggerType::Manual => {
            if job.initial_data.is_null() {
                job.trigger_data.clone()
            } else {
                job.initial_data.clone()
            }
        }
    }
}
