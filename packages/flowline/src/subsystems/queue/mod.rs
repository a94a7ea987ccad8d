mod durable;
mod memory;

pub use durable::DurableQueue;
pub use memory::MemoryQueue;

use flowline_types::ExecutionJob;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{Config, QueueDriverKind};

/// A leased job: invisible to other consumers until acked, nacked, or the
/// visibility timeout passes.
#[derive(Debug, Clone)]
pub struct QueueLease {
    pub lease_id: Uuid,
    pub job: ExecutionJob,
}

/// The queue contract: durable FIFO of execution jobs with delayed
/// delivery, at-least-once consumption, and ack/nack. Redelivery happens
/// when a lease's deadline passes without an ack.
pub trait QueueDriver: Send + Sync {
    fn driver_name(&self) -> &str;

    fn durable(&self) -> bool;

    fn enqueue(&self, job: ExecutionJob, delay: Duration) -> Result<(), QueueError>;

    /// Non-blocking: `None` when nothing is deliverable right now.
    fn dequeue(&self, visibility: Duration) -> Result<Option<QueueLease>, QueueError>;

    fn ack(&self, lease: &QueueLease) -> Result<(), QueueError>;

    /// Returns the job for redelivery after `delay`. `updated` replaces
    /// the payload, which is how retry state (completed node outputs,
    /// attempt counters) survives the redelivery.
    fn nack(
        &self,
        lease: &QueueLease,
        delay: Duration,
        updated: Option<ExecutionJob>,
    ) -> Result<(), QueueError>;

    /// Jobs waiting plus jobs in flight.
    fn backlog(&self) -> Result<usize, QueueError>;
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("unknown lease {0}")]
    UnknownLease(Uuid),

    #[error("queue persistence: {0}")]
    Persistence(String),

    #[error("queue codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("in-memory queue driver is forbidden outside tests")]
    InMemoryForbidden,
}

/// Builds the configured driver. The production supervisor separately
/// refuses to start when the driver is not durable.
pub fn build_driver(config: &Config) -> Result<std::sync::Arc<dyn QueueDriver>, QueueError> {
    let kind = config
        .queue_driver_kind()
        .map_err(|e| QueueError::Persistence(e.to_string()))?;

    Ok(match kind {
        QueueDriverKind::Durable => std::sync::Arc::new(
            DurableQueue::new(config.data.join("queue"))
                .map_err(|e| QueueError::Persistence(e.to_string()))?,
        ),
        QueueDriverKind::InMemory => {
            if !config.development {
                return Err(QueueError::InMemoryForbidden);
            }
            std::sync::Arc::new(MemoryQueue::new("inmemory", false))
        }
        // answers health checks as durable, for smoke tests only
        QueueDriverKind::Mock => std::sync::Arc::new(MemoryQueue::new("mock-durable", true)),
    })
}
