use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use flowline_types::{
    canonical_json, md5_hex, EventId, ExecutionId, ExecutionJob, OrganizationId, TriggerType,
    VerificationFailure, VerificationFailureReason, WebhookDedupe, WebhookEvent, WebhookId,
    WebhookTrigger, WebhookTriggerData, WorkflowId,
};
use lru::LruCache;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::instrument;
use utils::storage::db::{handles, CoreDb, DBError};
use utils::telemetry::TriggerMetrics;

use super::verify::{self, WebhookRequest};
use crate::enqueue::{EnqueueError, EnqueueService};

/// Bound on the per-webhook in-memory dedupe set.
const DEDUPE_CACHE_CAP: usize = 500;

/// Webhook ingestion: registration, provider signature verification,
/// dedupe, and handoff to the queue. Registrations are persisted; the
/// route map here is a cache rebuilt from storage at startup.
pub struct WebhookManager {
    db: CoreDb,
    enqueue: EnqueueService,
    routes: DashMap<WebhookId, WebhookTrigger>,
    dedupe_cache: DashMap<WebhookId, Mutex<LruCache<String, ()>>>,
    metrics: TriggerMetrics,
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("unknown webhook")]
    Unknown,

    #[error("verification failed")]
    Verification(VerificationFailureReason),

    #[error("db: {0}")]
    Db(#[from] DBError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// What the HTTP layer returns on a 200.
#[derive(Debug)]
pub struct WebhookOutcome {
    pub duplicate: bool,
    pub execution_id: Option<ExecutionId>,
}

impl WebhookManager {
    pub fn new(db: CoreDb, enqueue: EnqueueService, metrics: TriggerMetrics) -> Result<Self, DBError> {
        let manager = Self {
            db,
            enqueue,
            routes: DashMap::new(),
            dedupe_cache: DashMap::new(),
            metrics,
        };
        manager.rebuild_routes()?;
        Ok(manager)
    }

    /// Rebuilds the in-memory route map from the persisted registrations.
    fn rebuild_routes(&self) -> Result<(), DBError> {
        let registrations = self
            .db
            .collect_where(&handles::WEBHOOK_TRIGGERS, |_, t| t.is_active)?;
        let count = registrations.len();
        for trigger in registrations {
            self.routes.insert(trigger.webhook_id.clone(), trigger);
        }
        if count > 0 {
            tracing::info!(count, "webhook routes rebuilt from storage");
        }
        Ok(())
    }

    /// Registers a webhook binding. The id is a stable digest of the
    /// binding plus creation time, so the endpoint URL survives restarts.
    #[instrument(level = "debug", skip(self, secret), fields(subsys = "WebhookManager"))]
    pub fn register(
        &self,
        workflow_id: WorkflowId,
        organization_id: OrganizationId,
        app_id: impl Into<String> + std::fmt::Debug,
        trigger_id: impl Into<String> + std::fmt::Debug,
        secret: Option<flowline_types::Credential>,
    ) -> Result<WebhookTrigger, DBError> {
        let app_id = app_id.into();
        let trigger_id = trigger_id.into();
        let created_at = Utc::now();

        let trigger = WebhookTrigger {
            webhook_id: WebhookId::derive(&app_id, &trigger_id, &workflow_id, created_at),
            workflow_id,
            organization_id,
            app_id,
            trigger_id,
            secret,
            is_active: true,
            created_at,
        };

        self.db.set(
            &handles::WEBHOOK_TRIGGERS,
            trigger.webhook_id.clone(),
            trigger.clone(),
        )?;
        self.routes
            .insert(trigger.webhook_id.clone(), trigger.clone());

        tracing::info!(
            webhook_id = %trigger.webhook_id,
            workflow_id = %trigger.workflow_id,
            "webhook registered at /api/webhooks/{}",
            trigger.webhook_id
        );
        Ok(trigger)
    }

    pub fn deregister(&self, webhook_id: &WebhookId) -> Result<(), DBError> {
        self.db.update(&handles::WEBHOOK_TRIGGERS, webhook_id.clone(), |slot| {
            if let Some(trigger) = slot.as_mut() {
                trigger.is_active = false;
            }
        })?;
        self.routes.remove(webhook_id);
        self.dedupe_cache.remove(webhook_id);
        Ok(())
    }

    /// One incoming delivery: verify, dedupe, enqueue.
    #[instrument(level = "debug", skip(self, headers, body), fields(subsys = "WebhookManager", webhook_id = %webhook_id))]
    pub fn handle(
        &self,
        webhook_id: &WebhookId,
        headers: &BTreeMap<String, String>,
        body: &[u8],
        method: &str,
        host: &str,
        path: &str,
    ) -> Result<WebhookOutcome, WebhookError> {
        self.metrics.webhooks_received.add(1, &[]);

        let trigger = self
            .routes
            .get(webhook_id)
            .map(|t| t.clone())
            .ok_or(WebhookError::Unknown)?;

        if let Some(secret) = &trigger.secret {
            let request = WebhookRequest {
                headers,
                body,
                method,
                host,
                path,
            };
            if let Err(reason) =
                verify::verify(&trigger.app_id, secret.as_str(), &request, Utc::now().timestamp())
            {
                self.record_verification_failure(&trigger, reason);
                return Err(WebhookError::Verification(reason));
            }
        }

        let payload: Value = serde_json::from_slice(body)
            .unwrap_or_else(|_| json!({"raw": String::from_utf8_lossy(body)}));

        let dedupe_token = md5_hex(&format!(
            "{}|{}|{}|{}|{}",
            trigger.workflow_id,
            trigger.webhook_id,
            trigger.trigger_id,
            trigger.app_id,
            canonical_json(&payload)
        ));

        if !self.claim_token(&trigger.webhook_id, &dedupe_token)? {
            self.metrics.dedupe_hits.add(1, &[]);
            self.record_event(&trigger, &dedupe_token, true, None, None)?;
            return Ok(WebhookOutcome {
                duplicate: true,
                execution_id: None,
            });
        }

        let job = ExecutionJob {
            execution_id: None,
            workflow_id: trigger.workflow_id,
            organization_id: trigger.organization_id,
            user_id: None,
            trigger_type: TriggerType::Webhook,
            trigger_data: serde_json::to_value(WebhookTriggerData {
                app_id: trigger.app_id.clone(),
                trigger_id: trigger.trigger_id.clone(),
                payload: payload.clone(),
                headers: json!(headers),
                dedupe_token: dedupe_token.clone(),
                timestamp: Utc::now(),
                source: trigger.app_id.clone(),
            })
            .unwrap_or(payload),
            initial_data: Value::Null,
            resume_state: None,
            replay: None,
            version_id: None,
        };

        match self.enqueue.enqueue(job) {
            Ok(execution_id) => {
                self.metrics.record_trigger_fired("webhook");
                self.record_event(&trigger, &dedupe_token, false, Some(execution_id), None)?;
                Ok(WebhookOutcome {
                    duplicate: false,
                    execution_id: Some(execution_id),
                })
            }
            Err(err) => {
                self.record_event(&trigger, &dedupe_token, false, None, Some(err.to_string()))?;
                Err(err.into())
            }
        }
    }

    /// Claims a dedupe token: returns true when this delivery is the
    /// first with the token. The bounded cache answers the hot path; the
    /// persisted row is the claim itself, inserted under the entry lock
    /// so two identical concurrent deliveries cannot both win.
    fn claim_token(&self, webhook_id: &WebhookId, token: &str) -> Result<bool, DBError> {
        if let Some(cache) = self.dedupe_cache.get(webhook_id) {
            if cache.lock().unwrap().contains(&token.to_string()) {
                return Ok(false);
            }
        }

        let fresh = self.db.update(
            &handles::WEBHOOK_DEDUPE,
            (webhook_id.clone(), token.to_string()),
            |slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(WebhookDedupe {
                    webhook_id: webhook_id.clone(),
                    token: token.to_string(),
                    created_at: Utc::now(),
                });
                true
            },
        )?;

        if fresh {
            self.dedupe_cache
                .entry(webhook_id.clone())
                .or_insert_with(|| {
                    Mutex::new(LruCache::new(NonZeroUsize::new(DEDUPE_CACHE_CAP).unwrap()))
                })
                .lock()
                .unwrap()
                .put(token.to_string(), ());
        }

        Ok(fresh)
    }

    fn record_verification_failure(
        &self,
        trigger: &WebhookTrigger,
        reason: VerificationFailureReason,
    ) {
        self.metrics.record_verification_failure(&trigger.app_id);
        let failure = VerificationFailure {
            id: EventId::generate(),
            webhook_id: trigger.webhook_id.clone(),
            provider: trigger.app_id.clone(),
            reason,
            at: Utc::now(),
        };
        if let Err(err) = self
            .db
            .set(&handles::VERIFICATION_FAILURES, failure.id, failure)
        {
            tracing::error!("failed to record verification failure: {}", err);
        }
        tracing::warn!(
            webhook_id = %trigger.webhook_id,
            provider = %trigger.app_id,
            reason = ?reason,
            "webhook verification failed"
        );
    }

    fn record_event(
        &self,
        trigger: &WebhookTrigger,
        dedupe_token: &str,
        duplicate: bool,
        execution_id: Option<ExecutionId>,
        error: Option<String>,
    ) -> Result<(), DBError> {
        let event = WebhookEvent {
            id: EventId::generate(),
            webhook_id: trigger.webhook_id.clone(),
            workflow_id: trigger.workflow_id,
            dedupe_token: dedupe_token.to_string(),
            received_at: Utc::now(),
            processed: execution_id.is_some(),
            execution_id,
            error,
            duplicate,
        };
        self.db.set(&handles::WEBHOOK_EVENTS, event.id, event)
    }

    /// Drops persisted dedupe tokens older than the TTL. Run
    /// periodically by the dispatcher.
    #[instrument(level = "debug", skip(self), fields(subsys = "WebhookManager"))]
    pub fn sweep_dedupe(&self, ttl: Duration) -> Result<usize, DBError> {
        let cutoff = Utc::now() - ttl;
        let stale = self
            .db
            .collect_where(&handles::WEBHOOK_DEDUPE, |_, d| d.created_at < cutoff)?;
        let count = stale.len();
        for row in stale {
            self.db
                .remove(&handles::WEBHOOK_DEDUPE, &(row.webhook_id, row.token))?;
        }
        if count > 0 {
            tracing::debug!(count, "swept stale webhook dedupe tokens");
        }
        Ok(count)
    }

    pub fn lookup(&self, webhook_id: &WebhookId) -> Option<WebhookTrigger> {
        self.routes.get(webhook_id).map(|t| t.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{provisioned_org, test_enqueue_service};
    use flowline_types::WorkflowId;

    fn manager(db: &CoreDb) -> WebhookManager {
        WebhookManager::new(
            db.clone(),
            test_enqueue_service(db),
            TriggerMetrics::init(&opentelemetry::global::meter("test")),
        )
        .unwrap()
    }

    #[test]
    fn routes_rebuild_from_storage() {
        let db = CoreDb::new().unwrap();
        let first = manager(&db);
        let org = provisioned_org(&db);

        let registered = first
            .register(WorkflowId::generate(), org, "slack", "message", None)
            .unwrap();

        // a fresh manager over the same storage serves the same route
        let second = manager(&db);
        let found = second.lookup(&registered.webhook_id).unwrap();
        assert_eq!(found.workflow_id, registered.workflow_id);
    }

    #[test]
    fn unsigned_webhook_enqueues_and_dedupes() {
        let db = CoreDb::new().unwrap();
        let manager = manager(&db);
        let org = provisioned_org(&db);
        let registered = manager
            .register(WorkflowId::generate(), org, "custom", "event", None)
            .unwrap();

        let headers = BTreeMap::new();
        let body = br#"{"id": 7}"#;
        let first = manager
            .handle(&registered.webhook_id, &headers, body, "post", "h", "/p")
            .unwrap();
        assert!(!first.duplicate);
        assert!(first.execution_id.is_some());

        let second = manager
            .handle(&registered.webhook_id, &headers, body, "post", "h", "/p")
            .unwrap();
        assert!(second.duplicate);
        assert!(second.execution_id.is_none());

        // a different payload is a different token
        let third = manager
            .handle(&registered.webhook_id, &headers, br#"{"id": 8}"#, "post", "h", "/p")
            .unwrap();
        assert!(!third.duplicate);
    }

    #[test]
    fn unknown_webhook_is_rejected() {
        let db = CoreDb::new().unwrap();
        let manager = manager(&db);
        let headers = BTreeMap::new();

        let missing = WebhookId::new("00000000deadbeef").unwrap();
        assert!(matches!(
            manager.handle(&missing, &headers, b"{}", "post", "h", "/p"),
            Err(WebhookError::Unknown)
        ));
    }

    #[test]
    fn sweep_removes_only_stale_tokens() {
        let db = CoreDb::new().unwrap();
        let manager = manager(&db);
        let org = provisioned_org(&db);
        let registered = manager
            .register(WorkflowId::generate(), org, "custom", "event", None)
            .unwrap();

        let headers = BTreeMap::new();
        manager
            .handle(&registered.webhook_id, &headers, br#"{"id": 1}"#, "post", "h", "/p")
            .unwrap();

        // nothing is old enough yet
        assert_eq!(manager.sweep_dedupe(Duration::hours(24)).unwrap(), 0);
        // a zero TTL sweeps everything
        assert_eq!(manager.sweep_dedupe(Duration::zero()).unwrap(), 1);
    }
}
