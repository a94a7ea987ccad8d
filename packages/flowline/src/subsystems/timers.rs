use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine};
use chrono::{DateTime, Utc};
use flowline_types::{
    sha256_hex, ExecutionId, ExecutionJob, ExecutionStatus, IssuedResumeToken, NodeId,
    OrganizationId, ResumeState, ResumeTokenRecord, TimerId, TimerStatus, TokenId, TriggerType,
    WorkflowId, WorkflowTimer,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::instrument;
use utils::context::AppContext;
use utils::storage::db::{handles, CoreDb, DBError};

use crate::enqueue::EnqueueService;
use crate::health::{heartbeat, SharedHealthStatus};

type HmacSha256 = Hmac<Sha256>;

const MIN_TTL: chrono::Duration = chrono::Duration::seconds(60);
const DEFAULT_TTL_DAYS: i64 = 7;

/// Resume tokens and workflow timers: the two ways a `waiting` execution
/// re-enters the queue. Tokens are single-use bearers validated by HMAC
/// before any storage access; timers are claimed under the row lock so
/// concurrent dispatchers never double-fire.
pub struct TimerService {
    db: CoreDb,
    enqueue: EnqueueService,
    signing_secret: Vec<u8>,
    public_url: String,
    tick: Duration,
}

#[derive(Error, Debug)]
pub enum ResumeError {
    #[error("signature invalid")]
    InvalidSignature,

    #[error("resume token unknown")]
    TokenUnknown,

    #[error("resume token already consumed")]
    TokenConsumed,

    #[error("resume token expired")]
    TokenExpired,

    #[error("execution is not active")]
    ExecutionNotActive,

    #[error("db: {0}")]
    Db(#[from] DBError),

    #[error("enqueue: {0}")]
    Enqueue(#[from] crate::enqueue::EnqueueError),
}

pub struct IssueTokenRequest {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub organization_id: OrganizationId,
    pub node_id: NodeId,
    pub resume_state: ResumeState,
    pub initial_data: Value,
    pub trigger_type: TriggerType,
    pub wait_until: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
    pub ttl: Option<chrono::Duration>,
}

impl TimerService {
    pub fn new(
        db: CoreDb,
        enqueue: EnqueueService,
        signing_secret: impl Into<Vec<u8>>,
        public_url: impl Into<String>,
        tick: Duration,
    ) -> Self {
        Self {
            db,
            enqueue,
            signing_secret: signing_secret.into(),
            public_url: public_url.into(),
            tick,
        }
    }

    fn sign(&self, token: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.signing_secret)
            .expect("hmac accepts any key size");
        mac.update(token.as_bytes());
        const_hex::encode(mac.finalize().into_bytes())
    }

    /// Issues a resume token for a parked node. The bearer is returned
    /// once; storage keeps only its sha256. TTL is clamped to at least a
    /// minute and defaults to seven days.
    #[instrument(level = "debug", skip(self, request), fields(subsys = "TimerService", execution_id = %request.execution_id))]
    pub fn issue_token(&self, request: IssueTokenRequest) -> Result<IssuedResumeToken, ResumeError> {
        let mut raw = [0u8; 32];
        rand::rng().fill_bytes(&mut raw);
        let token = B64URL.encode(raw);
        let signature = self.sign(&token);

        let ttl = request
            .ttl
            .unwrap_or_else(|| chrono::Duration::days(DEFAULT_TTL_DAYS))
            .max(MIN_TTL);
        let expires_at = Utc::now() + ttl;

        let record = ResumeTokenRecord {
            token_id: TokenId::generate(),
            token_hash: sha256_hex(token.as_bytes()),
            execution_id: request.execution_id,
            workflow_id: request.workflow_id,
            organization_id: request.organization_id,
            node_id: request.node_id.clone(),
            resume_state: request.resume_state,
            initial_data: request.initial_data,
            trigger_type: request.trigger_type,
            wait_until: request.wait_until,
            metadata: request.metadata,
            expires_at,
            consumed_at: None,
            created_at: Utc::now(),
        };
        self.db
            .set(&handles::RESUME_TOKENS, record.token_id, record.clone())?;

        let callback_url = format!(
            "{}/api/runs/{}/nodes/{}/resume?token={}&signature={}",
            self.public_url.trim_end_matches('/'),
            request.execution_id,
            request.node_id,
            token,
            signature
        );

        Ok(IssuedResumeToken {
            token_id: record.token_id,
            token,
            signature,
            callback_url,
            expires_at,
        })
    }

    /// Persists the timer that re-enqueues a waiting execution at
    /// `resume_at`. The payload is the complete wakeup job.
    pub fn schedule_timer(
        &self,
        execution_id: ExecutionId,
        resume_at: DateTime<Utc>,
        wakeup: &ExecutionJob,
    ) -> Result<WorkflowTimer, ResumeError> {
        let timer = WorkflowTimer {
            id: TimerId::generate(),
            execution_id,
            resume_at,
            payload: serde_json::to_value(wakeup).unwrap_or(Value::Null),
            status: TimerStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
        };
        self.db.set(&handles::TIMERS, timer.id, timer.clone())?;
        Ok(timer)
    }

    /// Consumes a resume token: signature first (timing-safe, before any
    /// storage access), then one conditional update that flips
    /// `consumed_at` exactly once, then the re-enqueue that makes the
    /// execution runnable again.
    #[instrument(level = "debug", skip(self, token, signature, payload), fields(subsys = "TimerService"))]
    pub fn consume(
        &self,
        token: &str,
        signature: &str,
        execution_id: Option<ExecutionId>,
        node_id: Option<&NodeId>,
        payload: Option<Value>,
    ) -> Result<(ResumeTokenRecord, ExecutionId), ResumeError> {
        let expected = self.sign(token);
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(ResumeError::InvalidSignature);
        }

        let hash = sha256_hex(token.as_bytes());
        let candidate = self
            .db
            .collect_where(&handles::RESUME_TOKENS, |_, r| r.token_hash == hash)?
            .into_iter()
            .next()
            .ok_or(ResumeError::TokenUnknown)?;

        if let Some(execution_id) = execution_id {
            if candidate.execution_id != execution_id {
                return Err(ResumeError::TokenUnknown);
            }
        }
        if let Some(node_id) = node_id {
            if &candidate.node_id != node_id {
                return Err(ResumeError::TokenUnknown);
            }
        }

        // a token tied to a cancelled or finished execution cannot fire
        let execution = self
            .db
            .get(&handles::EXECUTIONS, &candidate.execution_id)?
            .ok_or(ResumeError::ExecutionNotActive)?;
        if !execution.status.is_active() {
            return Err(ResumeError::ExecutionNotActive);
        }

        let record = self
            .db
            .update(&handles::RESUME_TOKENS, candidate.token_id, |slot| {
                let record = slot.as_mut().ok_or(ResumeError::TokenUnknown)?;
                if record.consumed_at.is_some() {
                    return Err(ResumeError::TokenConsumed);
                }
                if record.expires_at <= Utc::now() {
                    return Err(ResumeError::TokenExpired);
                }
                record.consumed_at = Some(Utc::now());
                Ok(record.clone())
            })??;

        let mut resume_state = record.resume_state.clone();
        resume_state.resume_payload = payload.or(Some(Value::Null));

        let job = ExecutionJob {
            execution_id: Some(record.execution_id),
            workflow_id: record.workflow_id,
            organization_id: record.organization_id,
            user_id: None,
            trigger_type: record.trigger_type,
            trigger_data: Value::Null,
            initial_data: record.initial_data.clone(),
            resume_state: Some(resume_state),
            replay: None,
            version_id: None,
        };
        let execution_id = self.enqueue.enqueue(job)?;

        Ok((record, execution_id))
    }

    /// The timer dispatcher loop.
    pub fn start(self: &Arc<Self>, ctx: AppContext, health: SharedHealthStatus) {
        let service = self.clone();
        let mut kill = ctx.get_kill_receiver();
        ctx.rt.spawn(async move {
            let mut interval = tokio::time::interval(service.tick);
            loop {
                tokio::select! {
                    _ = kill.recv() => {
                        tracing::debug!("timer dispatcher shutting down");
                        break;
                    }
                    _ = interval.tick() => {}
                }

                heartbeat(&health, "timers");
                if let Err(err) = service.dispatch_due() {
                    tracing::error!("timer dispatch failed: {}", err);
                }
            }
        });
    }

    /// Fires every due pending timer. The pending→dispatched flip happens
    /// under the row lock, so a timer observed by two dispatchers fires
    /// once.
    pub fn dispatch_due(&self) -> Result<usize, DBError> {
        let now = Utc::now();
        let due = self.db.collect_where(&handles::TIMERS, |_, t| {
            t.status == TimerStatus::Pending && t.resume_at <= now
        })?;

        let mut fired = 0;
        for timer in due {
            let claimed = self.db.update(&handles::TIMERS, timer.id, |slot| {
                match slot.as_mut() {
                    Some(current) if current.status == TimerStatus::Pending => {
                        current.status = TimerStatus::Dispatched;
                        current.attempts += 1;
                        true
                    }
                    _ => false,
                }
            })?;
            if !claimed {
                continue;
            }

            let job: Option<ExecutionJob> = serde_json::from_value(timer.payload.clone()).ok();
            let result = match job {
                Some(job) => self.enqueue.enqueue(job).map(|_| ()).map_err(|e| e.to_string()),
                None => Err("timer payload is not a wakeup job".to_string()),
            };

            match result {
                Ok(()) => {
                    fired += 1;
                    tracing::debug!(timer_id = %timer.id, execution_id = %timer.execution_id, "timer dispatched");
                }
                Err(err) => {
                    tracing::warn!(timer_id = %timer.id, "timer dispatch failed: {}", err);
                    self.db.update(&handles::TIMERS, timer.id, |slot| {
                        if let Some(current) = slot.as_mut() {
                            current.status = TimerStatus::Failed;
                        }
                    })?;
                }
            }
        }

        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{provisioned_org, test_enqueue_service};
    use flowline_types::{Execution, Metering};
    use serde_json::json;

    fn service(db: &CoreDb) -> TimerService {
        TimerService::new(
            db.clone(),
            test_enqueue_service(db),
            b"jwt-secret-for-tests".to_vec(),
            "https://flowline.example.com",
            Duration::from_millis(50),
        )
    }

    fn waiting_execution(db: &CoreDb, org: OrganizationId) -> Execution {
        let execution = Execution {
            execution_id: ExecutionId::generate(),
            workflow_id: WorkflowId::generate(),
            organization_id: org,
            user_id: None,
            version_id: None,
            status: ExecutionStatus::Waiting,
            trigger_type: TriggerType::Webhook,
            trigger_data: Value::Null,
            node_results: Default::default(),
            error_details: None,
            metering: Metering::default(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            replay: None,
            parent_execution_id: None,
        };
        db.set(&handles::EXECUTIONS, execution.execution_id, execution.clone())
            .unwrap();
        execution
    }

    fn issue(service: &TimerService, execution: &Execution) -> IssuedResumeToken {
        service
            .issue_token(IssueTokenRequest {
                execution_id: execution.execution_id,
                workflow_id: execution.workflow_id,
                organization_id: execution.organization_id,
                node_id: NodeId::new("approval").unwrap(),
                resume_state: ResumeState::default(),
                initial_data: Value::Null,
                trigger_type: TriggerType::Webhook,
                wait_until: None,
                metadata: None,
                ttl: None,
            })
            .unwrap()
    }

    #[test]
    fn token_round_trip_is_single_use() {
        let db = CoreDb::new().unwrap();
        let service = service(&db);
        let org = provisioned_org(&db);
        let execution = waiting_execution(&db, org);

        let issued = issue(&service, &execution);
        assert!(issued
            .callback_url
            .starts_with("https://flowline.example.com/api/runs/"));

        let (record, execution_id) = service
            .consume(
                &issued.token,
                &issued.signature,
                Some(execution.execution_id),
                None,
                Some(json!({"approved": true})),
            )
            .unwrap();
        assert_eq!(execution_id, execution.execution_id);
        assert!(record.consumed_at.is_some());

        // second consume fails closed
        assert!(matches!(
            service.consume(&issued.token, &issued.signature, None, None, None),
            Err(ResumeError::TokenConsumed)
        ));
    }

    #[test]
    fn bad_signature_fails_before_lookup() {
        let db = CoreDb::new().unwrap();
        let service = service(&db);
        let org = provisioned_org(&db);
        let execution = waiting_execution(&db, org);
        let issued = issue(&service, &execution);

        let mut bad = issued.signature.clone();
        let flipped = if bad.ends_with('0') { "1" } else { "0" };
        bad.replace_range(bad.len() - 1.., flipped);

        assert!(matches!(
            service.consume(&issued.token, &bad, None, None, None),
            Err(ResumeError::InvalidSignature)
        ));
    }

    #[test]
    fn cancelled_execution_rejects_consume() {
        let db = CoreDb::new().unwrap();
        let service = service(&db);
        let org = provisioned_org(&db);
        let execution = waiting_execution(&db, org);
        let issued = issue(&service, &execution);

        db.update(&handles::EXECUTIONS, execution.execution_id, |slot| {
            slot.as_mut().unwrap().status = ExecutionStatus::Cancelled;
        })
        .unwrap();

        assert!(matches!(
            service.consume(&issued.token, &issued.signature, None, None, None),
            Err(ResumeError::ExecutionNotActive)
        ));
    }

    #[test]
    fn scope_filters_must_match() {
        let db = CoreDb::new().unwrap();
        let service = service(&db);
        let org = provisioned_org(&db);
        let execution = waiting_execution(&db, org);
        let issued = issue(&service, &execution);

        assert!(matches!(
            service.consume(
                &issued.token,
                &issued.signature,
                Some(ExecutionId::generate()),
                None,
                None
            ),
            Err(ResumeError::TokenUnknown)
        ));
        assert!(matches!(
            service.consume(
                &issued.token,
                &issued.signature,
                None,
                Some(&NodeId::new("other-node").unwrap()),
                None
            ),
            Err(ResumeError::TokenUnknown)
        ));
    }

    #[test]
    fn due_timer_fires_exactly_once() {
        let db = CoreDb::new().unwrap();
        let service = service(&db);
        let org = provisioned_org(&db);
        let execution = waiting_execution(&db, org);

        let wakeup = ExecutionJob {
            execution_id: Some(execution.execution_id),
            workflow_id: execution.workflow_id,
            organization_id: execution.organization_id,
            user_id: None,
            trigger_type: TriggerType::Webhook,
            trigger_data: Value::Null,
            initial_data: Value::Null,
            resume_state: Some(ResumeState::default()),
            replay: None,
            version_id: None,
        };
        service
            .schedule_timer(
                execution.execution_id,
                Utc::now() - chrono::Duration::seconds(1),
                &wakeup,
            )
            .unwrap();

        assert_eq!(service.dispatch_due().unwrap(), 1);
        // already dispatched: a second sweep fires nothing
        assert_eq!(service.dispatch_due().unwrap(), 0);

        let execution_row = db
            .get(&handles::EXECUTIONS, &execution.execution_id)
            .unwrap()
            .unwrap();
        assert_eq!(execution_row.status, ExecutionStatus::Queued);
    }

    #[test]
    fn future_timer_does_not_fire() {
        let db = CoreDb::new().unwrap();
        let service = service(&db);
        let org = provisioned_org(&db);
        let execution = waiting_execution(&db, org);

        let wakeup = ExecutionJob {
            execution_id: Some(execution.execution_id),
            workflow_id: execution.workflow_id,
            organization_id: execution.organization_id,
            user_id: None,
            trigger_type: TriggerType::Webhook,
            trigger_data: Value::Null,
            initial_data: Value::Null,
            resume_state: None,
            replay: None,
            version_id: None,
        };
        service
            .schedule_timer(
                execution.execution_id,
                Utc::now() + chrono::Duration::minutes(10),
                &wakeup,
            )
            .unwrap();

        assert_eq!(service.dispatch_due().unwrap(), 0);
    }
}
