//! Multi-domain submissions.
//!
//! A batch record lives under `batch:{id}` and is updated only through
//! compare-and-swap, so concurrent completions from different workers never
//! lose an update. Items are released to the queue a few at a time; each
//! completion frees a slot for the next pending item.

use crate::clock::{self, Clock, SystemClock};
use crate::config::BatchConfig;
use crate::error::QueueError;
use crate::queue::JobQueue;
use crate::store::SharedStore;
use crate::types::{CheckMode, CheckTarget, Fingerprint, Job, Report};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const KEY_PREFIX: &str = "batch:";

/// How long a finished batch stays readable after its deadline.
const RECORD_GRACE: Duration = Duration::from_secs(60 * 60);

const MAX_CAS_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting for a free slot
    Pending,
    /// Enqueued as a job
    Dispatched { job_id: String },
    /// Finished with a report (which may itself be an error report)
    Resolved { report: Report },
    /// Still unresolved when the batch deadline passed
    TimedOut,
}

impl ItemState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ItemState::Resolved { .. } | ItemState::TimedOut)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItem {
    pub target: CheckTarget,
    pub fingerprint: Fingerprint,
    #[serde(flatten)]
    pub state: ItemState,
}

impl BatchItem {
    pub fn is_failure(&self) -> bool {
        match &self.state {
            ItemState::Resolved { report } => report.is_error(),
            ItemState::TimedOut => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRecord {
    pub batch_id: String,
    pub requester_id: u64,
    pub mode: CheckMode,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub items: Vec<BatchItem>,
    /// Resolved items, including timed-out ones; never decreases
    pub completed_count: usize,
    pub finished: bool,
}

impl BatchRecord {
    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            batch_id: self.batch_id.clone(),
            completed: self.completed_count,
            total: self.total(),
            failed: self.items.iter().filter(|i| i.is_failure()).count(),
            finished: self.finished,
        }
    }

    /// Timeout error describing unresolved items, if the batch timed out.
    pub fn timeout_error(&self) -> Option<QueueError> {
        let unresolved = self
            .items
            .iter()
            .filter(|i| matches!(i.state, ItemState::TimedOut))
            .count();
        (unresolved > 0).then(|| QueueError::BatchTimeout {
            batch_id: self.batch_id.clone(),
            unresolved,
        })
    }

    fn in_flight(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.state, ItemState::Dispatched { .. }))
            .count()
    }

    /// Mark every unresolved item as timed out and finish the batch.
    fn expire(&mut self) -> bool {
        if self.finished {
            return false;
        }
        for item in &mut self.items {
            if !item.state.is_resolved() {
                item.state = ItemState::TimedOut;
                self.completed_count += 1;
            }
        }
        self.finished = true;
        true
    }
}

/// Aggregate progress of a batch.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch_id: String,
    pub completed: usize,
    pub total: usize,
    pub failed: usize,
    pub finished: bool,
}

impl fmt::Display for BatchProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.completed, self.total)
    }
}

#[derive(Clone)]
pub struct BatchCoordinator {
    store: Arc<dyn SharedStore>,
    queue: JobQueue,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
}

impl BatchCoordinator {
    pub fn new(store: Arc<dyn SharedStore>, queue: JobQueue, config: BatchConfig) -> Self {
        Self::with_clock(store, queue, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SharedStore>,
        queue: JobQueue,
        config: BatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            config,
        }
    }

    fn key(batch_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, batch_id)
    }

    /// Create a batch and release its first group of items to the queue.
    pub async fn submit_batch(
        &self,
        requester_id: u64,
        targets: &[CheckTarget],
        mode: CheckMode,
    ) -> crate::Result<String> {
        if targets.is_empty() {
            return Err(QueueError::internal("cannot submit an empty batch"));
        }

        let now = self.clock.now();
        let batch_id = uuid::Uuid::new_v4().simple().to_string();
        let record = BatchRecord {
            batch_id: batch_id.clone(),
            requester_id,
            mode,
            created_at: now,
            deadline: clock::add(now, self.config.timeout),
            items: targets
                .iter()
                .map(|t| {
                    let target = CheckTarget::new(t.domain.clone(), t.port, mode);
                    BatchItem {
                        fingerprint: target.fingerprint(),
                        target,
                        state: ItemState::Pending,
                    }
                })
                .collect(),
            completed_count: 0,
            finished: false,
        };

        let ttl = self.config.timeout + RECORD_GRACE;
        let created = self
            .store
            .set_if_absent(&Self::key(&batch_id), &serde_json::to_string(&record)?, ttl)
            .await?;
        if !created {
            return Err(QueueError::internal(format!(
                "batch id collision for '{}'",
                batch_id
            )));
        }

        info!(%batch_id, requester_id, total = record.total(), "Created batch");
        self.dispatch_pending(&batch_id).await?;
        Ok(batch_id)
    }

    pub async fn get(&self, batch_id: &str) -> crate::Result<BatchRecord> {
        match self.store.get(&Self::key(batch_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(QueueError::not_found("batch", batch_id)),
        }
    }

    /// Apply `change` to the record atomically, retrying on contention.
    ///
    /// `change` returns whether it modified the record; unchanged records are
    /// not written back.
    async fn update<F>(&self, batch_id: &str, mut change: F) -> crate::Result<BatchRecord>
    where
        F: FnMut(&mut BatchRecord, DateTime<Utc>) -> bool,
    {
        let key = Self::key(batch_id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| QueueError::not_found("batch", batch_id))?;
            let mut record: BatchRecord = serde_json::from_str(&raw)?;

            let now = self.clock.now();
            if !change(&mut record, now) {
                return Ok(record);
            }

            let ttl = clock::until(now, clock::add(record.deadline, RECORD_GRACE))
                .max(Duration::from_secs(1));
            let encoded = serde_json::to_string(&record)?;
            if self
                .store
                .compare_and_swap(&key, Some(&raw), &encoded, Some(ttl))
                .await?
            {
                return Ok(record);
            }
            debug!(%batch_id, "Batch record changed concurrently, retrying");
        }

        Err(QueueError::store_unavailable(
            "batch_update",
            format!("batch '{}' kept changing under contention", batch_id),
        ))
    }

    /// Enqueue pending items until the batch has `group_size` in flight.
    async fn dispatch_pending(&self, batch_id: &str) -> crate::Result<usize> {
        let group_size = self.config.group_size.max(1);
        let mut jobs: Vec<Job> = Vec::new();

        let record = self
            .update(batch_id, |record, now| {
                jobs.clear();
                if record.finished {
                    return false;
                }
                if now >= record.deadline {
                    return record.expire();
                }

                let free = group_size.saturating_sub(record.in_flight());
                let requester_id = record.requester_id;
                for item in record
                    .items
                    .iter_mut()
                    .filter(|i| matches!(i.state, ItemState::Pending))
                    .take(free)
                {
                    let job = Job::new(
                        requester_id,
                        item.target.domain.clone(),
                        item.target.port,
                        item.target.mode,
                    )
                    .in_batch(batch_id);
                    item.state = ItemState::Dispatched {
                        job_id: job.id.clone(),
                    };
                    jobs.push(job);
                }
                !jobs.is_empty()
            })
            .await?;

        if record.finished && jobs.is_empty() {
            return Ok(0);
        }

        for job in &jobs {
            if let Err(e) = self.queue.enqueue(job).await {
                // The item stays dispatched and resolves as a timeout
                error!(%batch_id, job_id = %job.id, error = %e, "Failed to enqueue batch item");
                return Err(e);
            }
        }

        if !jobs.is_empty() {
            debug!(%batch_id, dispatched = jobs.len(), "Dispatched batch items");
        }
        Ok(jobs.len())
    }

    /// Record the report for one item and release the next pending item.
    ///
    /// Completions for items already resolved (redelivered jobs) and for
    /// finished batches are ignored, so progress never moves backwards.
    pub async fn on_item_complete(
        &self,
        batch_id: &str,
        fingerprint: &Fingerprint,
        report: &Report,
    ) -> crate::Result<BatchProgress> {
        let record = self
            .update(batch_id, |record, now| {
                if record.finished {
                    return false;
                }
                if now >= record.deadline {
                    return record.expire();
                }

                let Some(item) = record
                    .items
                    .iter_mut()
                    .find(|i| &i.fingerprint == fingerprint && !i.state.is_resolved())
                else {
                    return false;
                };

                item.state = ItemState::Resolved {
                    report: report.clone(),
                };
                record.completed_count += 1;
                if record.completed_count >= record.total() {
                    record.finished = true;
                }
                true
            })
            .await?;

        let progress = record.progress();
        if progress.finished {
            if let Some(err) = record.timeout_error() {
                warn!(%batch_id, "{}", err);
            }
            info!(%batch_id, progress = %progress, failed = progress.failed, "Batch finished");
        } else {
            debug!(%batch_id, progress = %progress, "Batch progress");
            self.dispatch_pending(batch_id).await?;
        }

        Ok(progress)
    }

    /// Current progress; finalizes the batch if its deadline has passed.
    pub async fn poll_progress(&self, batch_id: &str) -> crate::Result<BatchProgress> {
        let record = self
            .update(batch_id, |record, now| {
                !record.finished && now >= record.deadline && record.expire()
            })
            .await?;

        if let Some(err) = record.timeout_error() {
            debug!(%batch_id, "{}", err);
        }
        Ok(record.progress())
    }
}
