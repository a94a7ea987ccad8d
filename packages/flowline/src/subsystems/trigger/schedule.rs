use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use flowline_types::{ExecutionJob, ScheduleTrigger, ScheduleTriggerId, TriggerType};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::instrument;
use utils::context::AppContext;
use utils::storage::db::{handles, CoreDb, DBError};
use utils::telemetry::TriggerMetrics;

use crate::enqueue::EnqueueService;

/// Cron-expression triggers. Same scan-and-fire loop as the polling
/// scheduler, with the next fire time computed from the cron expression
/// after every firing.
pub struct ScheduleManager {
    db: CoreDb,
    enqueue: EnqueueService,
    tick: Duration,
    metrics: TriggerMetrics,
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid cron expression {expression}: {reason}")]
    Cron { expression: String, reason: String },

    #[error("db: {0}")]
    Db(#[from] DBError),
}

impl ScheduleManager {
    pub fn new(db: CoreDb, enqueue: EnqueueService, tick: Duration, metrics: TriggerMetrics) -> Self {
        Self {
            db,
            enqueue,
            tick,
            metrics,
        }
    }

    /// Validates the expression and registers the trigger with its first
    /// fire time already computed.
    #[instrument(level = "debug", skip(self, trigger), fields(subsys = "ScheduleManager"))]
    pub fn register(&self, mut trigger: ScheduleTrigger) -> Result<ScheduleTrigger, ScheduleError> {
        let schedule = Schedule::from_str(&trigger.cron).map_err(|e| ScheduleError::Cron {
            expression: trigger.cron.clone(),
            reason: e.to_string(),
        })?;
        let next = schedule.upcoming(Utc).next().ok_or_else(|| ScheduleError::Cron {
            expression: trigger.cron.clone(),
            reason: "schedule produces no upcoming fire times".to_string(),
        })?;

        trigger.next_fire_at = Some(next);
        self.db
            .set(&handles::SCHEDULE_TRIGGERS, trigger.id, trigger.clone())?;
        Ok(trigger)
    }

    pub fn deactivate(&self, id: &ScheduleTriggerId) -> Result<(), DBError> {
        self.db.update(&handles::SCHEDULE_TRIGGERS, *id, |slot| {
            if let Some(trigger) = slot.as_mut() {
                trigger.is_active = false;
            }
        })
    }

    pub fn start(self: &Arc<Self>, ctx: AppContext) {
        let manager = self.clone();
        let mut kill = ctx.get_kill_receiver();
        ctx.rt.spawn(async move {
            let mut interval = tokio::time::interval(manager.tick);
            loop {
                tokio::select! {
                    _ = kill.recv() => {
                        tracing::debug!("schedule manager shutting down");
                        break;
                    }
                    _ = interval.tick() => {}
                }

                if let Err(err) = manager.fire_due() {
                    tracing::error!("schedule scan failed: {}", err);
                }
            }
        });
    }

    pub fn fire_due(&self) -> Result<(), DBError> {
        let now = Utc::now();
        let due = self.db.collect_where(&handles::SCHEDULE_TRIGGERS, |_, t| {
            t.is_active && t.next_fire_at.map(|at| at <= now).unwrap_or(false)
        })?;

        for trigger in due {
            let fired_at = trigger.next_fire_at.unwrap_or(now);

            // advance the fire time before enqueueing so a slow enqueue
            // cannot double-fire the same slot
            let advanced = self
                .db
                .update(&handles::SCHEDULE_TRIGGERS, trigger.id, |slot| {
                    let Some(current) = slot.as_mut() else {
                        return false;
                    };
                    if current.next_fire_at != trigger.next_fire_at {
                        // someone else already claimed this firing
                        return false;
                    }
                    current.next_fire_at = Schedule::from_str(&current.cron)
                        .ok()
                        .and_then(|s| s.upcoming(Utc).next());
                    true
                })?;
            if !advanced {
                continue;
            }

            let job = ExecutionJob {
                execution_id: None,
                workflow_id: trigger.workflow_id,
                organization_id: trigger.organization_id,
                user_id: None,
                trigger_type: TriggerType::Schedule,
                trigger_data: json!({
                    "cron": trigger.cron,
                    "firedAt": fired_at,
                }),
                initial_data: Value::Null,
                resume_state: None,
                replay: None,
                version_id: None,
            };
            match self.enqueue.enqueue(job) {
                Ok(_) => self.metrics.record_trigger_fired("schedule"),
                Err(err) => {
                    tracing::warn!(trigger_id = %trigger.id, "schedule enqueue failed: {}", err);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_enqueue_service;
    use flowline_types::{Organization, OrganizationId, WorkflowId};

    #[test]
    fn invalid_cron_is_rejected() {
        let db = CoreDb::new().unwrap();
        let manager = ScheduleManager::new(
            db.clone(),
            test_enqueue_service(&db),
            Duration::from_millis(50),
            TriggerMetrics::init(&opentelemetry::global::meter("test")),
        );

        let trigger = ScheduleTrigger {
            id: ScheduleTriggerId::generate(),
            workflow_id: WorkflowId::generate(),
            organization_id: OrganizationId::generate(),
            cron: "not a cron".to_string(),
            next_fire_at: None,
            is_active: true,
            created_at: Utc::now(),
        };
        assert!(matches!(
            manager.register(trigger),
            Err(ScheduleError::Cron { .. })
        ));
    }

    #[test]
    fn due_trigger_fires_once_and_advances() {
        let db = CoreDb::new().unwrap();
        let manager = ScheduleManager::new(
            db.clone(),
            test_enqueue_service(&db),
            Duration::from_millis(50),
            TriggerMetrics::init(&opentelemetry::global::meter("test")),
        );

        let org = Organization::provision_trial("acme", Utc::now());
        db.set(&handles::ORGANIZATIONS, org.id, org.clone()).unwrap();

        // register with a valid expression, then force it due
        let trigger = manager
            .register(ScheduleTrigger {
                id: ScheduleTriggerId::generate(),
                workflow_id: WorkflowId::generate(),
                organization_id: org.id,
                // top of every hour; sec min hour dom month dow
                cron: "0 0 * * * *".to_string(),
                next_fire_at: None,
                is_active: true,
                created_at: Utc::now(),
            })
            .unwrap();
        db.update(&handles::SCHEDULE_TRIGGERS, trigger.id, |slot| {
            slot.as_mut().unwrap().next_fire_at = Some(Utc::now() - chrono::Duration::seconds(1));
        })
        .unwrap();

        manager.fire_due().unwrap();

        let executions = db
            .collect_where(&handles::EXECUTIONS, |_, _| true)
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].trigger_type, TriggerType::Schedule);

        // the slot advanced into the future; an immediate rescan is a no-op
        manager.fire_due().unwrap();
        let executions = db
            .collect_where(&handles::EXECUTIONS, |_, _| true)
            .unwrap();
        assert_eq!(executions.len(), 1);
    }
}
