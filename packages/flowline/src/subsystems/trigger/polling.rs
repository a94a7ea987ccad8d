use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use flowline_engine::ConnectorInvoker;
use flowline_types::{
    canonical_md5, md5_hex, ExecutionJob, PollStatus, PollingTrigger, PollingTriggerId,
    TriggerType,
};
use lru::LruCache;
use rand::Rng;
use serde_json::{json, Value};
use tracing::instrument;
use utils::context::AppContext;
use utils::storage::db::{handles, CoreDb, DBError};
use utils::telemetry::TriggerMetrics;

use crate::connections::ConnectionStore;
use crate::enqueue::EnqueueService;

/// Per-trigger bound on remembered event dedupe hashes.
const EVENT_DEDUPE_CAP: usize = 500;
/// Backoff exponent cap: interval * 2^6 at worst.
const MAX_BACKOFF_EXP: u32 = 6;

/// The polling scheduler: wakes each active trigger at its `next_poll_at`,
/// calls the connector with the saved cursor, dedupes the returned events
/// and enqueues one execution per fresh event. Each trigger polls at most
/// once at a time, and its cursor only advances after the whole batch is
/// enqueued.
pub struct PollingManager {
    db: CoreDb,
    invoker: Arc<dyn ConnectorInvoker>,
    connections: Arc<ConnectionStore>,
    enqueue: EnqueueService,
    tick: Duration,
    in_flight: Arc<DashMap<PollingTriggerId, ()>>,
    event_dedupe: Arc<DashMap<PollingTriggerId, Mutex<LruCache<String, ()>>>>,
    metrics: TriggerMetrics,
}

impl PollingManager {
    pub fn new(
        db: CoreDb,
        invoker: Arc<dyn ConnectorInvoker>,
        connections: Arc<ConnectionStore>,
        enqueue: EnqueueService,
        tick: Duration,
        metrics: TriggerMetrics,
    ) -> Self {
        Self {
            db,
            invoker,
            connections,
            enqueue,
            tick,
            in_flight: Arc::new(DashMap::new()),
            event_dedupe: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub fn register(&self, trigger: PollingTrigger) -> Result<(), DBError> {
        self.db
            .set(&handles::POLLING_TRIGGERS, trigger.id, trigger)
    }

    pub fn deactivate(&self, id: &PollingTriggerId) -> Result<(), DBError> {
        self.db.update(&handles::POLLING_TRIGGERS, *id, |slot| {
            if let Some(trigger) = slot.as_mut() {
                trigger.is_active = false;
            }
        })
    }

    /// The scheduler loop. Loads due triggers every tick; at startup any
    /// trigger whose `next_poll_at` already passed fires immediately
    /// (`max(0, next_poll_at - now)` collapses into "due on first scan").
    pub fn start(self: &Arc<Self>, ctx: AppContext) {
        let manager = self.clone();
        let mut kill = ctx.get_kill_receiver();
        ctx.rt.spawn(async move {
            let mut interval = tokio::time::interval(manager.tick);
            loop {
                tokio::select! {
                    _ = kill.recv() => {
                        tracing::debug!("polling scheduler shutting down");
                        break;
                    }
                    _ = interval.tick() => {}
                }

                let due = match manager.due_triggers() {
                    Ok(due) => due,
                    Err(err) => {
                        tracing::error!("polling scan failed: {}", err);
                        continue;
                    }
                };

                for trigger in due {
                    // at most one in-flight poll per trigger
                    if manager.in_flight.insert(trigger.id, ()).is_some() {
                        continue;
                    }
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        let id = trigger.id;
                        manager.poll_one(trigger).await;
                        manager.in_flight.remove(&id);
                    });
                }
            }
        });
    }

    fn due_triggers(&self) -> Result<Vec<PollingTrigger>, DBError> {
        let now = Utc::now();
        self.db.collect_where(&handles::POLLING_TRIGGERS, |_, t| {
            t.is_active && t.next_poll_at <= now
        })
    }

    #[instrument(level = "debug", skip(self, trigger), fields(subsys = "PollingManager", trigger_id = %trigger.id))]
    async fn poll_one(&self, trigger: PollingTrigger) {
        self.metrics.polls_run.add(1, &[]);

        let credentials = match &trigger.connection_id {
            None => None,
            Some(connection_id) => match self.connections.credentials(connection_id).await {
                Ok(credentials) => Some(credentials),
                Err(err) => {
                    tracing::warn!(trigger_id = %trigger.id, "poll credentials unavailable: {}", err);
                    self.record_failure(&trigger);
                    return;
                }
            },
        };

        let outcome = self
            .invoker
            .poll(
                &trigger.app_id,
                &trigger.trigger_id,
                credentials,
                trigger.parameters.clone(),
                trigger.cursor.clone(),
            )
            .await;

        match outcome {
            Ok(poll) => {
                let mut all_enqueued = true;
                for event in &poll.events {
                    match self.handle_event(&trigger, event) {
                        Ok(()) => {}
                        Err(err) => {
                            all_enqueued = false;
                            tracing::warn!(
                                trigger_id = %trigger.id,
                                "failed to enqueue polled event: {}",
                                err
                            );
                        }
                    }
                }

                // the cursor moves only when the whole batch made it in;
                // a partial batch re-polls from the old cursor and relies
                // on dedupe
                let cursor = if all_enqueued { poll.cursor } else { trigger.cursor.clone() };
                self.record_success(&trigger, cursor);
            }
            Err(err) => {
                tracing::warn!(trigger_id = %trigger.id, "poll failed: {}", err);
                self.record_failure(&trigger);
            }
        }
    }

    fn handle_event(&self, trigger: &PollingTrigger, event: &Value) -> Result<(), String> {
        let dedupe_token = match &trigger.dedupe_key {
            Some(key) => match event.get(key) {
                Some(value) => md5_hex(&format!("{}-{}", trigger.trigger_id, value)),
                None => canonical_md5(event),
            },
            None => canonical_md5(event),
        };

        let fresh = {
            let entry = self.event_dedupe.entry(trigger.id).or_insert_with(|| {
                Mutex::new(LruCache::new(NonZeroUsize::new(EVENT_DEDUPE_CAP).unwrap()))
            });
            let mut cache = entry.lock().unwrap();
            cache.put(dedupe_token.clone(), ()).is_none()
        };
        if !fresh {
            self.metrics.dedupe_hits.add(1, &[]);
            return Ok(());
        }

        let job = ExecutionJob {
            execution_id: None,
            workflow_id: trigger.workflow_id,
            organization_id: trigger.organization_id,
            user_id: None,
            trigger_type: TriggerType::Polling,
            trigger_data: json!({
                "appId": trigger.app_id,
                "triggerId": trigger.trigger_id,
                "payload": event,
                "dedupeToken": dedupe_token,
                "timestamp": Utc::now(),
                "source": trigger.app_id,
            }),
            initial_data: Value::Null,
            resume_state: None,
            replay: None,
            version_id: None,
        };

        self.enqueue.enqueue(job).map_err(|e| e.to_string())?;
        self.metrics.record_trigger_fired("polling");
        Ok(())
    }

    fn record_success(&self, trigger: &PollingTrigger, cursor: Option<Value>) {
        let now = Utc::now();
        let interval = chrono::Duration::seconds(trigger.interval_secs.max(1) as i64);
        let result = self
            .db
            .update(&handles::POLLING_TRIGGERS, trigger.id, |slot| {
                if let Some(current) = slot.as_mut() {
                    current.last_poll = Some(now);
                    current.next_poll_at = now + interval;
                    current.backoff_count = 0;
                    current.last_status = Some(PollStatus::Ok);
                    if let Some(cursor) = cursor.clone() {
                        current.cursor = Some(cursor);
                    }
                }
            });
        if let Err(err) = result {
            tracing::error!(trigger_id = %trigger.id, "failed to record poll success: {}", err);
        }
    }

    /// Failure backoff: `interval * 2^min(backoff, 6)` with full jitter
    /// of ±25%.
    fn record_failure(&self, trigger: &PollingTrigger) {
        self.metrics.poll_errors.add(1, &[]);

        let now = Utc::now();
        let backoff = trigger.backoff_count + 1;
        let base_secs =
            trigger.interval_secs.max(1) * 2u64.pow(backoff.min(MAX_BACKOFF_EXP));
        let jitter_span = base_secs / 4;
        let delay_secs = if jitter_span == 0 {
            base_secs
        } else {
            let offset = rand::rng().random_range(0..=jitter_span * 2);
            base_secs - jitter_span + offset
        };

        let result = self
            .db
            .update(&handles::POLLING_TRIGGERS, trigger.id, |slot| {
                if let Some(current) = slot.as_mut() {
                    current.last_poll = Some(now);
                    current.backoff_count = backoff;
                    current.next_poll_at = now + chrono::Duration::seconds(delay_secs as i64);
                    current.last_status = Some(PollStatus::Failed);
                }
            });
        if let Err(err) = result {
            tracing::error!(trigger_id = %trigger.id, "failed to record poll failure: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_enqueue_service, NullInvoker, PollScriptInvoker};
    use flowline_types::{Organization, OrganizationId, WorkflowId};

    fn trigger(interval_secs: u64, dedupe_key: Option<&str>) -> PollingTrigger {
        PollingTrigger {
            id: PollingTriggerId::generate(),
            workflow_id: WorkflowId::generate(),
            organization_id: OrganizationId::generate(),
            app_id: "sheets".to_string(),
            trigger_id: "new_row".to_string(),
            connection_id: None,
            parameters: json!({}),
            interval_secs,
            last_poll: None,
            next_poll_at: Utc::now() - chrono::Duration::seconds(1),
            is_active: true,
            cursor: None,
            backoff_count: 0,
            last_status: None,
            dedupe_key: dedupe_key.map(str::to_string),
        }
    }

    fn manager_with(
        db: &CoreDb,
        invoker: Arc<dyn ConnectorInvoker>,
    ) -> (Arc<PollingManager>, EnqueueService) {
        let enqueue = test_enqueue_service(db);
        let keys = crate::test_utils::test_key_service();
        let connections = Arc::new(ConnectionStore::new(
            db.clone(),
            keys,
            Arc::new(NullInvoker::default()),
            None,
        ));
        let manager = Arc::new(PollingManager::new(
            db.clone(),
            invoker,
            connections,
            enqueue.clone(),
            Duration::from_millis(50),
            TriggerMetrics::init(&opentelemetry::global::meter("test")),
        ));
        (manager, enqueue)
    }

    fn provision_org(db: &CoreDb, id: OrganizationId) {
        let mut org = Organization::provision_trial("acme", Utc::now());
        org.id = id;
        org.plan.max_executions_per_minute = 1000;
        org.plan.max_concurrent_executions = 1000;
        db.set(&handles::ORGANIZATIONS, id, org).unwrap();
    }

    #[tokio::test]
    async fn poll_enqueues_fresh_events_and_advances_cursor() {
        let db = CoreDb::new().unwrap();
        let invoker = Arc::new(PollScriptInvoker::new(vec![
            (vec![json!({"id": "e1"}), json!({"id": "e2"})], Some(json!("cursor-1"))),
        ]));
        let (manager, _) = manager_with(&db, invoker);

        let trigger = trigger(10, Some("id"));
        provision_org(&db, trigger.organization_id);
        manager.register(trigger.clone()).unwrap();

        manager.poll_one(trigger.clone()).await;

        // two executions, cursor advanced, backoff reset
        let executions = db
            .collect_where(&handles::EXECUTIONS, |_, _| true)
            .unwrap();
        assert_eq!(executions.len(), 2);

        let updated = db
            .get(&handles::POLLING_TRIGGERS, &trigger.id)
            .unwrap()
            .unwrap();
        assert_eq!(updated.cursor, Some(json!("cursor-1")));
        assert_eq!(updated.backoff_count, 0);
        assert_eq!(updated.last_status, Some(PollStatus::Ok));
        assert!(updated.next_poll_at > Utc::now());
    }

    #[tokio::test]
    async fn duplicate_events_are_suppressed() {
        let db = CoreDb::new().unwrap();
        let invoker = Arc::new(PollScriptInvoker::new(vec![
            (vec![json!({"id": "same"})], None),
            (vec![json!({"id": "same"})], None),
        ]));
        let (manager, _) = manager_with(&db, invoker);

        let trigger = trigger(10, Some("id"));
        provision_org(&db, trigger.organization_id);
        manager.register(trigger.clone()).unwrap();

        manager.poll_one(trigger.clone()).await;
        let trigger = db
            .get(&handles::POLLING_TRIGGERS, &trigger.id)
            .unwrap()
            .unwrap();
        manager.poll_one(trigger).await;

        let executions = db
            .collect_where(&handles::EXECUTIONS, |_, _| true)
            .unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn failure_backs_off_exponentially() {
        let db = CoreDb::new().unwrap();
        let invoker = Arc::new(PollScriptInvoker::failing());
        let (manager, _) = manager_with(&db, invoker);

        let trigger = trigger(10, None);
        provision_org(&db, trigger.organization_id);
        manager.register(trigger.clone()).unwrap();

        manager.poll_one(trigger.clone()).await;
        let after_first = db
            .get(&handles::POLLING_TRIGGERS, &trigger.id)
            .unwrap()
            .unwrap();
        assert_eq!(after_first.backoff_count, 1);
        assert_eq!(after_first.last_status, Some(PollStatus::Failed));
        // interval 10s * 2^1 = 20s ± 25%
        let delay = after_first
            .next_poll_at
            .signed_duration_since(Utc::now())
            .num_seconds();
        assert!((14..=26).contains(&delay), "delay was {}", delay);

        manager.poll_one(after_first.clone()).await;
        let after_second = db
            .get(&handles::POLLING_TRIGGERS, &trigger.id)
            .unwrap()
            .unwrap();
        assert_eq!(after_second.backoff_count, 2);
        // 10s * 2^2 = 40s ± 25%
        let delay = after_second
            .next_poll_at
            .signed_duration_since(Utc::now())
            .num_seconds();
        assert!((29..=51).contains(&delay), "delay was {}", delay);
    }

    #[tokio::test]
    async fn cursor_stays_put_when_batch_fails_to_enqueue() {
        let db = CoreDb::new().unwrap();
        let invoker = Arc::new(PollScriptInvoker::new(vec![
            (vec![json!({"id": "e1"})], Some(json!("cursor-next"))),
        ]));
        let (manager, _) = manager_with(&db, invoker);

        let mut trigger = trigger(10, Some("id"));
        trigger.cursor = Some(json!("cursor-old"));
        // no org provisioned: enqueue fails
        manager.register(trigger.clone()).unwrap();

        manager.poll_one(trigger.clone()).await;

        let updated = db
            .get(&handles::POLLING_TRIGGERS, &trigger.id)
            .unwrap()
            .unwrap();
        assert_eq!(updated.cursor, Some(json!("cursor-old")));
    }
}
