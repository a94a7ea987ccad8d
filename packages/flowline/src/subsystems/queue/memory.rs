use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use flowline_types::ExecutionJob;
use uuid::Uuid;

use super::{QueueDriver, QueueError, QueueLease};

struct ReadyItem {
    ready_at: Instant,
    seq: u64,
    job: ExecutionJob,
}

// heap order: earliest ready_at first, FIFO within the same instant
impl PartialEq for ReadyItem {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}
impl Eq for ReadyItem {}
impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

struct InFlight {
    deadline: Instant,
    seq: u64,
    job: ExecutionJob,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    ready: BinaryHeap<Reverse<ReadyItem>>,
    in_flight: HashMap<Uuid, InFlight>,
}

/// Test-only queue driver: the full contract (delay, visibility timeout,
/// ack/nack) with no persistence. The supervisor refuses to start the
/// production stack on this driver; the `mock-durable` variant is the
/// same structure answering health checks as durable.
pub struct MemoryQueue {
    name: String,
    durable: bool,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl QueueDriver for MemoryQueue {
    fn driver_name(&self) -> &str {
        &self.name
    }

    fn durable(&self) -> bool {
        self.durable
    }

    fn enqueue(&self, job: ExecutionJob, delay: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let seq = inner.seq;
        inner.ready.push(Reverse(ReadyItem {
            ready_at: Instant::now() + delay,
            seq,
            job,
        }));
        Ok(())
    }

    fn dequeue(&self, visibility: Duration) -> Result<Option<QueueLease>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        // expired leases return to the ready heap first
        let expired: Vec<Uuid> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            if let Some(flight) = inner.in_flight.remove(&lease_id) {
                inner.ready.push(Reverse(ReadyItem {
                    ready_at: now,
                    seq: flight.seq,
                    job: flight.job,
                }));
            }
        }

        match inner.ready.peek() {
            Some(Reverse(item)) if item.ready_at <= now => {}
            _ => return Ok(None),
        }

        let Reverse(item) = inner.ready.pop().expect("peeked above");
        let lease_id = Uuid::new_v4();
        inner.in_flight.insert(
            lease_id,
            InFlight {
                deadline: now + visibility,
                seq: item.seq,
                job: item.job.clone(),
            },
        );

        Ok(Some(QueueLease {
            lease_id,
            job: item.job,
        }))
    }

    fn ack(&self, lease: &QueueLease) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .in_flight
            .remove(&lease.lease_id)
            .map(|_| ())
            .ok_or(QueueError::UnknownLease(lease.lease_id))
    }

    fn nack(
        &self,
        lease: &QueueLease,
        delay: Duration,
        updated: Option<ExecutionJob>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let flight = inner
            .in_flight
            .remove(&lease.lease_id)
            .ok_or(QueueError::UnknownLease(lease.lease_id))?;
        inner.ready.push(Reverse(ReadyItem {
            ready_at: Instant::now() + delay,
            seq: flight.seq,
            job: updated.unwrap_or(flight.job),
        }));
        Ok(())
    }

    fn backlog(&self) -> Result<usize, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.ready.len() + inner.in_flight.len())
    }
}
