use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowline_engine::redact_value;
use flowline_types::{
    Execution, ExecutionId, ExecutionStatus, Metering, Organization, OrgStatus,
};
use thiserror::Error;
use tracing::instrument;
use utils::storage::db::{handles, CoreDb, DBError};
use utils::telemetry::QueueMetrics;

use crate::admission::{Admission, AdmissionError};
use crate::subsystems::queue::{QueueDriver, QueueError};

/// The single path by which anything becomes a queued execution: webhook
/// deliveries, poll events, schedules, manual enqueues, timer wakeups and
/// resume callbacks all pass through here, so admission and the execution
/// row are handled in exactly one place.
#[derive(Clone)]
pub struct EnqueueService {
    db: CoreDb,
    admission: Admission,
    queue: Arc<dyn QueueDriver>,
    metrics: QueueMetrics,
}

#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("organization not found")]
    OrgNotFound,

    #[error("organization is not active")]
    OrgInactive,

    #[error("execution already finished")]
    ExecutionFinished,

    #[error(transparent)]
    Quota(#[from] AdmissionError),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("db: {0}")]
    Db(#[from] DBError),
}

impl EnqueueService {
    pub fn new(
        db: CoreDb,
        admission: Admission,
        queue: Arc<dyn QueueDriver>,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            db,
            admission,
            queue,
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<dyn QueueDriver> {
        &self.queue
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    fn organization(&self, job: &flowline_types::ExecutionJob) -> Result<Organization, EnqueueError> {
        let org = self
            .db
            .get(&handles::ORGANIZATIONS, &job.organization_id)?
            .ok_or(EnqueueError::OrgNotFound)?;
        match org.status {
            OrgStatus::Active | OrgStatus::Trial => Ok(org),
            OrgStatus::Suspended | OrgStatus::Churned => Err(EnqueueError::OrgInactive),
        }
    }

    /// Admits and enqueues one job. A fresh job gets a new execution row;
    /// a job carrying an `execution_id` (timer wakeups, resume callbacks,
    /// redeliveries) flips its existing row back to `queued`. Rejections
    /// are visible: a fresh job that fails admission still gets a row,
    /// marked `rate_limited`.
    #[instrument(level = "debug", skip(self, job), fields(subsys = "EnqueueService", workflow_id = %job.workflow_id))]
    pub fn enqueue(
        &self,
        mut job: flowline_types::ExecutionJob,
    ) -> Result<ExecutionId, EnqueueError> {
        let org = self.organization(&job)?;

        let execution_id = job.execution_id.unwrap_or_else(ExecutionId::generate);
        job.execution_id = Some(execution_id);

        if let Err(err) = self.admission.try_admit(&org) {
            if matches!(err, AdmissionError::QuotaExceeded { .. }) {
                let _ = self.record_row(&job, execution_id, ExecutionStatus::RateLimited);
            }
            return Err(err.into());
        }

        if let Err(err) = self.record_row(&job, execution_id, ExecutionStatus::Queued) {
            // a wakeup for a run that finished or was cancelled in the
            // meantime; hand the slot back
            self.admission.release(org.id)?;
            return Err(err);
        }
        self.queue.enqueue(job, Duration::ZERO)?;
        self.metrics.enqueued.add(1, &[]);

        Ok(execution_id)
    }

    fn record_row(
        &self,
        job: &flowline_types::ExecutionJob,
        execution_id: ExecutionId,
        status: ExecutionStatus,
    ) -> Result<(), EnqueueError> {
        let now = Utc::now();
        self.db
            .update(&handles::EXECUTIONS, execution_id, |slot| {
                match slot.as_mut() {
                    Some(execution) => {
                        // terminal rows stay terminal; only live runs and
                        // fresh rate-limit marks may transition
                        if !execution.status.is_active()
                            && status != ExecutionStatus::RateLimited
                        {
                            return Err(EnqueueError::ExecutionFinished);
                        }
                        execution.status = status;
                        Ok(())
                    }
                    None => {
                        *slot = Some(Execution {
                            execution_id,
                            workflow_id: job.workflow_id,
                            organization_id: job.organization_id,
                            user_id: job.user_id,
                            version_id: job.version_id,
                            status,
                            trigger_type: job.trigger_type,
                            // persisted trigger data always passes the redactor
                            trigger_data: redact_value(&job.trigger_data),
                            node_results: Default::default(),
                            error_details: None,
                            metering: Metering::default(),
                            created_at: now,
                            started_at: None,
                            completed_at: None,
                            duration_ms: None,
                            replay: job.replay.clone(),
                            parent_execution_id: job
                                .replay
                                .as_ref()
                                .map(|replay| replay.source_execution_id),
                        });
                        Ok(())
                    }
                }
            })??;
        Ok(())
    }
}
