use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    pub timestamp: DateTime<Utc>,
    /// Last heartbeat per supervised component (executor workers, timer
    /// dispatcher, polling scheduler, ...)
    pub components: HashMap<String, DateTime<Utc>>,
    pub queue: QueueHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub driver: String,
    pub durable: bool,
    pub backlog: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl HealthStatus {
    pub fn new(driver: String, durable: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            components: HashMap::new(),
            queue: QueueHealth {
                driver,
                durable,
                backlog: 0,
                last_heartbeat: None,
            },
        }
    }

    /// A component is ready while its last heartbeat is within twice its
    /// tick period; readiness requires every registered component.
    pub fn is_ready(&self, now: DateTime<Utc>, tick: Duration) -> bool {
        !self.components.is_empty()
            && self
                .components
                .values()
                .all(|last| now.signed_duration_since(*last) <= tick * 2)
    }
}

pub type SharedHealthStatus = Arc<RwLock<HealthStatus>>;

pub fn create_shared_health_status(driver: String, durable: bool) -> SharedHealthStatus {
    Arc::new(RwLock::new(HealthStatus::new(driver, durable)))
}

pub fn heartbeat(status: &SharedHealthStatus, component: &str) {
    let mut status = status.write().unwrap();
    let now = Utc::now();
    status.timestamp = now;
    status.components.insert(component.to_string(), now);
    status.queue.last_heartbeat = Some(now);
}
