use chrono::{Duration, Utc};
use flowline_types::{
    EventId, ExecutionCounters, Organization, OrganizationId, QuotaAuditEvent,
};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;
use utils::storage::db::{handles, CoreDb, DBError};
use utils::telemetry::QueueMetrics;

const WINDOW: Duration = Duration::seconds(60);

/// The synchronous admission gate: per-organization concurrency bound and
/// a fixed 60-second request window, both checked and bumped in one
/// atomic counter update. Every rejection appends an audit row; audit
/// rows are never modified.
#[derive(Clone)]
pub struct Admission {
    db: CoreDb,
    metrics: QueueMetrics,
}

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("organization {organization_id} exceeded {event_type}")]
    QuotaExceeded {
        organization_id: OrganizationId,
        event_type: &'static str,
    },

    #[error("db: {0}")]
    Db(#[from] DBError),
}

enum Decision {
    Admitted,
    Rejected {
        event_type: &'static str,
        limit_value: u64,
        observed_value: u64,
        window_count: Option<u64>,
        window_start: Option<chrono::DateTime<Utc>>,
    },
}

impl Admission {
    pub fn new(db: CoreDb, metrics: QueueMetrics) -> Self {
        Self { db, metrics }
    }

    /// Admit one new execution for the organization, or reject with an
    /// audit trail. On admit both counters are already bumped when this
    /// returns; callers must pair every admit with a [`Self::release`].
    #[instrument(level = "debug", skip(self, org), fields(subsys = "Admission", organization_id = %org.id))]
    pub fn try_admit(&self, org: &Organization) -> Result<(), AdmissionError> {
        let now = Utc::now();
        let max_concurrent = org.plan.max_concurrent_executions;
        let max_rpm = org.plan.max_executions_per_minute;

        let decision = self
            .db
            .update(&handles::EXECUTION_COUNTERS, org.id, |slot| {
                let mut counters = slot.unwrap_or_else(|| ExecutionCounters::fresh(now));

                // fixed window rollover
                if now.signed_duration_since(counters.window_start) > WINDOW {
                    counters.window_start = now;
                    counters.executions_in_window = 0;
                }

                if counters.running_executions >= max_concurrent {
                    *slot = Some(counters);
                    return Decision::Rejected {
                        event_type: "concurrency_exceeded",
                        limit_value: max_concurrent as u64,
                        observed_value: counters.running_executions as u64,
                        window_count: None,
                        window_start: None,
                    };
                }

                if counters.executions_in_window >= max_rpm {
                    *slot = Some(counters);
                    return Decision::Rejected {
                        event_type: "rpm_exceeded",
                        limit_value: max_rpm as u64,
                        observed_value: counters.executions_in_window as u64,
                        window_count: Some(counters.executions_in_window as u64),
                        window_start: Some(counters.window_start),
                    };
                }

                counters.running_executions += 1;
                counters.executions_in_window += 1;
                *slot = Some(counters);
                Decision::Admitted
            })?;

        match decision {
            Decision::Admitted => Ok(()),
            Decision::Rejected {
                event_type,
                limit_value,
                observed_value,
                window_count,
                window_start,
            } => {
                self.metrics.record_admission_rejection(event_type);
                let event = QuotaAuditEvent {
                    id: EventId::generate(),
                    organization_id: org.id,
                    event_type: event_type.to_string(),
                    limit_value,
                    observed_value,
                    window_count,
                    window_start,
                    metadata: json!({}),
                    created_at: now,
                };
                self.db.set(&handles::QUOTA_AUDIT, event.id, event)?;
                tracing::warn!(
                    organization_id = %org.id,
                    event_type,
                    limit_value,
                    observed_value,
                    "admission rejected"
                );
                Err(AdmissionError::QuotaExceeded {
                    organization_id: org.id,
                    event_type,
                })
            }
        }
    }

    /// The dequeue-side recheck: a cold replay may have been admitted
    /// under limits that have since shrunk. Read-only.
    pub fn within_concurrency(&self, org: &Organization) -> Result<bool, AdmissionError> {
        let counters = self
            .db
            .get(&handles::EXECUTION_COUNTERS, &org.id)?
            .unwrap_or_else(|| ExecutionCounters::fresh(Utc::now()));
        Ok(counters.running_executions <= org.plan.max_concurrent_executions)
    }

    /// Releases one concurrency slot; called on completion, failure,
    /// cancellation, and when a run parks into `waiting`.
    #[instrument(level = "debug", skip(self), fields(subsys = "Admission"))]
    pub fn release(&self, organization_id: OrganizationId) -> Result<(), AdmissionError> {
        self.db
            .update(&handles::EXECUTION_COUNTERS, organization_id, |slot| {
                if let Some(counters) = slot.as_mut() {
                    counters.running_executions = counters.running_executions.saturating_sub(1);
                }
            })?;
        Ok(())
    }

    pub fn running(&self, organization_id: &OrganizationId) -> Result<u32, AdmissionError> {
        Ok(self
            .db
            .get(&handles::EXECUTION_COUNTERS, organization_id)?
            .map(|c| c.running_executions)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::global;

    fn org(max_concurrent: u32, max_rpm: u32) -> Organization {
        let mut org = Organization::provision_trial("acme", Utc::now());
        org.plan.max_concurrent_executions = max_concurrent;
        org.plan.max_executions_per_minute = max_rpm;
        org
    }

    fn admission(db: &CoreDb) -> Admission {
        Admission::new(db.clone(), QueueMetrics::init(&global::meter("test")))
    }

    #[test]
    fn concurrency_limit_is_enforced() {
        let db = CoreDb::new().unwrap();
        let admission = admission(&db);
        let org = org(2, 100);

        admission.try_admit(&org).unwrap();
        admission.try_admit(&org).unwrap();
        let err = admission.try_admit(&org).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::QuotaExceeded {
                event_type: "concurrency_exceeded",
                ..
            }
        ));

        // the audit trail has exactly one row with the observed values
        let audit = db
            .collect_where(&handles::QUOTA_AUDIT, |_, _| true)
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].event_type, "concurrency_exceeded");
        assert_eq!(audit[0].limit_value, 2);
        assert_eq!(audit[0].observed_value, 2);

        // releasing a slot admits again
        admission.release(org.id).unwrap();
        admission.try_admit(&org).unwrap();
    }

    #[test]
    fn rpm_limit_counts_admissions_in_window() {
        let db = CoreDb::new().unwrap();
        let admission = admission(&db);
        let org = org(100, 3);

        for _ in 0..3 {
            admission.try_admit(&org).unwrap();
            admission.release(org.id).unwrap();
        }
        let err = admission.try_admit(&org).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::QuotaExceeded {
                event_type: "rpm_exceeded",
                ..
            }
        ));

        let audit = db
            .collect_where(&handles::QUOTA_AUDIT, |_, v| v.event_type == "rpm_exceeded")
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].window_count, Some(3));
        assert!(audit[0].window_start.is_some());
    }

    #[test]
    fn window_rolls_over() {
        let db = CoreDb::new().unwrap();
        let admission = admission(&db);
        let org = org(100, 1);

        admission.try_admit(&org).unwrap();
        admission.release(org.id).unwrap();
        assert!(admission.try_admit(&org).is_err());

        // age the window past 60 seconds
        db.update(&handles::EXECUTION_COUNTERS, org.id, |slot| {
            let counters = slot.as_mut().unwrap();
            counters.window_start = Utc::now() - Duration::seconds(61);
        })
        .unwrap();

        admission.try_admit(&org).unwrap();
    }

    #[test]
    fn admission_safety_under_concurrency() {
        let db = CoreDb::new().unwrap();
        let admission = admission(&db);
        let org = org(5, 10_000);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let admission = admission.clone();
                let org = org.clone();
                std::thread::spawn(move || {
                    let mut admitted = 0u32;
                    for _ in 0..100 {
                        if admission.try_admit(&org).is_ok() {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let total: u32 = threads.into_iter().map(|t| t.join().unwrap()).sum();
        // never more slots handed out than the limit
        assert!(total <= 5);
        assert!(admission.running(&org.id).unwrap() <= 5);
    }

    #[test]
    fn release_never_underflows() {
        let db = CoreDb::new().unwrap();
        let admission = admission(&db);
        let org_id = OrganizationId::generate();

        admission.release(org_id).unwrap();
        assert_eq!(admission.running(&org_id).unwrap(), 0);
    }
}
