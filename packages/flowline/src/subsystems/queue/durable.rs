use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use flowline_types::ExecutionJob;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use super::{QueueDriver, QueueError, QueueLease};

/// One job record on disk. `ready_at_ms` keeps delayed delivery across a
/// restart; `enqueued_at_ms` keeps FIFO order when the index is rebuilt.
#[derive(Serialize, Deserialize)]
struct JobRecord {
    ready_at_ms: u64,
    enqueued_at_ms: u64,
    job: ExecutionJob,
}

struct Item {
    ready_at: Instant,
    order: (u64, u64),
    file_id: Uuid,
    job: ExecutionJob,
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order && self.file_id == other.file_id
    }
}
impl Eq for Item {}
impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Item {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ready_at, self.order, self.file_id).cmp(&(other.ready_at, other.order, other.file_id))
    }
}

struct InFlight {
    deadline: Instant,
    order: (u64, u64),
    file_id: Uuid,
    job: ExecutionJob,
}

#[derive(Default)]
struct Inner {
    counter: u64,
    ready: BinaryHeap<Reverse<Item>>,
    in_flight: HashMap<Uuid, InFlight>,
}

/// The production queue driver: an fsynced file-per-job log under the
/// data directory, with an in-process ready index. Jobs survive process
/// restarts; leases do not, which is exactly at-least-once: anything in
/// flight at crash time is redelivered on the next start.
pub struct DurableQueue {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl DurableQueue {
    #[instrument(skip(dir), fields(subsys = "DurableQueue"))]
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let dir: PathBuf = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| QueueError::Persistence(format!("creating {}: {}", dir.display(), e)))?;

        let queue = Self {
            dir,
            inner: Mutex::new(Inner::default()),
        };
        queue.rebuild_index()?;
        Ok(queue)
    }

    fn rebuild_index(&self) -> Result<(), QueueError> {
        let mut records: Vec<(Uuid, JobRecord)> = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| QueueError::Persistence(format!("reading queue dir: {}", e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| QueueError::Persistence(e.to_string()))?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(file_id) = Uuid::parse_str(stem) else {
                continue;
            };
            let bytes = std::fs::read(&path)
                .map_err(|e| QueueError::Persistence(format!("reading {}: {}", path.display(), e)))?;
            match serde_json::from_slice::<JobRecord>(&bytes) {
                Ok(record) => records.push((file_id, record)),
                Err(err) => {
                    // a torn write from a crash mid-enqueue; skip it
                    tracing::warn!("skipping unreadable queue record {}: {}", path.display(), err);
                }
            }
        }

        records.sort_by_key(|(_, r)| (r.ready_at_ms, r.enqueued_at_ms));

        let now = Instant::now();
        let now_ms = unix_ms();
        let mut inner = self.inner.lock().unwrap();
        for (file_id, record) in records {
            inner.counter += 1;
            let counter = inner.counter;
            let delay = Duration::from_millis(record.ready_at_ms.saturating_sub(now_ms));
            inner.ready.push(Reverse(Item {
                ready_at: now + delay,
                order: (record.enqueued_at_ms, counter),
                file_id,
                job: record.job,
            }));
        }

        tracing::info!(
            backlog = inner.ready.len(),
            "durable queue index rebuilt from {}",
            self.dir.display()
        );
        Ok(())
    }

    fn job_path(&self, file_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", file_id))
    }

    fn write_record(&self, file_id: &Uuid, record: &JobRecord) -> Result<(), QueueError> {
        let path = self.job_path(file_id);
        let bytes = serde_json::to_vec(record)?;
        let mut file = std::fs::File::create(&path)
            .map_err(|e| QueueError::Persistence(format!("creating {}: {}", path.display(), e)))?;
        file.write_all(&bytes)
            .map_err(|e| QueueError::Persistence(format!("writing {}: {}", path.display(), e)))?;
        file.sync_all()
            .map_err(|e| QueueError::Persistence(format!("syncing {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn remove_record(&self, file_id: &Uuid) -> Result<(), QueueError> {
        let path = self.job_path(file_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::Persistence(format!(
                "removing {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl QueueDriver for DurableQueue {
    fn driver_name(&self) -> &str {
        "durable"
    }

    fn durable(&self) -> bool {
        true
    }

    #[instrument(level = "debug", skip(self, job), fields(subsys = "DurableQueue"))]
    fn enqueue(&self, job: ExecutionJob, delay: Duration) -> Result<(), QueueError> {
        let file_id = Uuid::new_v4();
        let now_ms = unix_ms();
        let record = JobRecord {
            ready_at_ms: now_ms + delay.as_millis() as u64,
            enqueued_at_ms: now_ms,
            job: job.clone(),
        };
        // persist before indexing: a crash between the two redelivers,
        // never loses
        self.write_record(&file_id, &record)?;

        let mut inner = self.inner.lock().unwrap();
        inner.counter += 1;
        let counter = inner.counter;
        inner.ready.push(Reverse(Item {
            ready_at: Instant::now() + delay,
            order: (now_ms, counter),
            file_id,
            job,
        }));
        Ok(())
    }

    fn dequeue(&self, visibility: Duration) -> Result<Option<QueueLease>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let expired: Vec<Uuid> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            if let Some(flight) = inner.in_flight.remove(&lease_id) {
                inner.ready.push(Reverse(Item {
                    ready_at: now,
                    order: flight.order,
                    file_id: flight.file_id,
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
                order: item.order,
                file_id: item.file_id,
                job: item.job.clone(),
            },
        );

        Ok(Some(QueueLease {
            lease_id,
            job: item.job,
        }))
    }

    fn ack(&self, lease: &QueueLease) -> Result<(), QueueError> {
        let file_id = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .in_flight
                .remove(&lease.lease_id)
                .ok_or(QueueError::UnknownLease(lease.lease_id))?
                .file_id
        };
        self.remove_record(&file_id)
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

        let job = updated.unwrap_or(flight.job);
        // persist the redelivery payload so retry state survives a crash
        let record = JobRecord {
            ready_at_ms: unix_ms() + delay.as_millis() as u64,
            enqueued_at_ms: flight.order.0,
            job: job.clone(),
        };
        self.write_record(&flight.file_id, &record)?;

        inner.ready.push(Reverse(Item {
            ready_at: Instant::now() + delay,
            order: flight.order,
            file_id: flight.file_id,
            job,
        }));
        Ok(())
    }

    fn backlog(&self) -> Result<usize, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.ready.len() + inner.in_flight.len())
    }
}
