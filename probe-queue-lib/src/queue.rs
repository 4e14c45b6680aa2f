//! At-least-once job queue over the shared store.
//!
//! Layout:
//! - `job:{id}` JSON job record
//! - `queue:pending` list of job ids waiting for a worker
//! - `queue:inflight` claim set scored by visibility deadline (epoch ms)
//! - `job-result:{id}` report published for the producer
//!
//! A claimed job that is neither acked nor nacked before its deadline is
//! moved back to `queue:pending` by the next dequeue.

use crate::clock::{self, Clock, SystemClock};
use crate::error::QueueError;
use crate::store::SharedStore;
use crate::types::{Job, Report};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PENDING: &str = "queue:pending";
const IN_FLIGHT: &str = "queue:inflight";
const JOB_PREFIX: &str = "job:";
const RESULT_PREFIX: &str = "job-result:";

/// Job records outlive any sane queue wait, but not forever.
const JOB_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A job claimed by a worker until `expires_at`.
///
/// The deadline doubles as the claim token: a later claim of the same job
/// always carries a later deadline, so a lapsed lease cannot touch it.
#[derive(Debug, Clone)]
pub struct JobLease {
    pub job: Job,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl JobLease {
    fn deadline_ms(&self) -> i64 {
        self.expires_at.timestamp_millis()
    }
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn job_key(job_id: &str) -> String {
        format!("{}{}", JOB_PREFIX, job_id)
    }

    fn result_key(job_id: &str) -> String {
        format!("{}{}", RESULT_PREFIX, job_id)
    }

    /// Add a job to the tail of the queue.
    pub async fn enqueue(&self, job: &Job) -> crate::Result<String> {
        let encoded = serde_json::to_string(job)?;
        self.store
            .set(&Self::job_key(&job.id), &encoded, Some(JOB_RECORD_TTL))
            .await?;
        let depth = self.store.push_back(PENDING, &job.id).await?;
        info!(job_id = %job.id, domain = %job.domain, depth, "Enqueued job");
        Ok(job.id.clone())
    }

    /// Claim the next job, hiding it from other workers for `visibility_timeout`.
    ///
    /// Expired claims are returned to the queue first. Ids whose record is
    /// gone (acked elsewhere or reset) are skipped.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> crate::Result<Option<JobLease>> {
        let now = self.clock.now();
        let redelivered = self
            .store
            .reclaim_expired(IN_FLIGHT, PENDING, now.timestamp_millis())
            .await?;
        if !redelivered.is_empty() {
            warn!(count = redelivered.len(), ids = ?redelivered, "Redelivering jobs with expired visibility");
        }

        let expires_at = clock::add(now, visibility_timeout);
        let deadline_ms = expires_at.timestamp_millis();
        loop {
            let Some(job_id) = self
                .store
                .claim_next(PENDING, IN_FLIGHT, deadline_ms)
                .await?
            else {
                return Ok(None);
            };

            let key = Self::job_key(&job_id);
            let Some(raw) = self.store.get(&key).await? else {
                debug!(%job_id, "Skipping job without a record");
                self.store.remove_claim(IN_FLIGHT, &job_id, deadline_ms).await?;
                continue;
            };

            let mut job: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!(%job_id, error = %e, "Dropping undecodable job record");
                    self.store.remove_claim(IN_FLIGHT, &job_id, deadline_ms).await?;
                    self.store.delete(&key).await?;
                    continue;
                }
            };

            job.attempt_count += 1;
            self.store
                .set(&key, &serde_json::to_string(&job)?, Some(JOB_RECORD_TTL))
                .await?;

            debug!(%job_id, worker_id, attempt = job.attempt_count, "Claimed job");
            return Ok(Some(JobLease {
                job,
                worker_id: worker_id.to_string(),
                expires_at,
            }));
        }
    }

    /// Mark a job finished and forget it.
    ///
    /// Returns false if the lease had lapsed. The claim then belongs to a
    /// later delivery and is left alone; the record is still removed so a
    /// redelivery waiting in the queue is skipped.
    pub async fn ack(&self, lease: &JobLease) -> crate::Result<bool> {
        let job_id = &lease.job.id;
        let held = self
            .store
            .remove_claim(IN_FLIGHT, job_id, lease.deadline_ms())
            .await?;
        self.store.delete(&Self::job_key(job_id)).await?;
        if held {
            debug!(%job_id, "Acked job");
        } else {
            warn!(%job_id, worker_id = %lease.worker_id, "Acked job after its lease lapsed");
        }
        Ok(held)
    }

    /// Return a claimed job to the queue for redelivery.
    ///
    /// Only the current lease can nack. Returns false if the lease had
    /// lapsed: the job was already requeued by visibility expiry, and may
    /// now be claimed by another worker, so nothing is pushed.
    pub async fn nack(&self, lease: &JobLease) -> crate::Result<bool> {
        let job_id = &lease.job.id;
        if !self
            .store
            .remove_claim(IN_FLIGHT, job_id, lease.deadline_ms())
            .await?
        {
            warn!(%job_id, worker_id = %lease.worker_id, "Nack ignored, lease already lapsed");
            return Ok(false);
        }
        self.store.push_back(PENDING, job_id).await?;
        info!(%job_id, "Nacked job for redelivery");
        Ok(true)
    }

    /// Drop every pending job. In-flight jobs are left to finish or expire.
    ///
    /// Returns how many jobs were discarded.
    pub async fn reset(&self) -> crate::Result<usize> {
        let drained = self.store.drain_list(PENDING).await?;
        for job_id in &drained {
            self.store.delete(&Self::job_key(job_id)).await?;
        }
        warn!(dropped = drained.len(), "Queue reset");
        Ok(drained.len())
    }

    /// Number of jobs waiting for a worker.
    pub async fn depth(&self) -> crate::Result<u64> {
        Ok(self.store.list_len(PENDING).await?)
    }

    /// Number of jobs currently claimed.
    pub async fn in_flight(&self) -> crate::Result<u64> {
        Ok(self.store.claim_count(IN_FLIGHT).await?)
    }

    /// Load a job record, if it still exists.
    pub async fn job(&self, job_id: &str) -> crate::Result<Option<Job>> {
        match self.store.get(&Self::job_key(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Publish the final report for a job where its producer can poll it.
    ///
    /// The first delivery of a job wins. Returns false when a report was
    /// already published, i.e. this is a redelivery.
    pub async fn publish_result(&self, job_id: &str, report: &Report, ttl: Duration) -> crate::Result<bool> {
        let encoded = serde_json::to_string(report)?;
        let first = self
            .store
            .set_if_absent(&Self::result_key(job_id), &encoded, ttl)
            .await?;
        if !first {
            debug!(%job_id, "Result already published by an earlier delivery");
        }
        Ok(first)
    }

    /// Read the report published for a job.
    pub async fn result(&self, job_id: &str) -> crate::Result<Option<Report>> {
        match self.store.get(&Self::result_key(job_id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| QueueError::Serialization {
                    message: format!("invalid result for job '{}': {}", job_id, e),
                }),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::{CheckMode, Fingerprint};

    fn fixture() -> (Arc<ManualClock>, Arc<MemoryStore>, JobQueue) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let queue = JobQueue::with_clock(store.clone(), clock.clone());
        (clock, store, queue)
    }

    fn job(domain: &str) -> Job {
        Job::new(7, domain, 443, CheckMode::Short)
    }

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_enqueue_dequeue_ack() {
        let (_, _, queue) = fixture();
        let id = queue.enqueue(&job("a.com")).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 1);

        let lease = queue.dequeue("w1", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(lease.job.id, id);
        assert_eq!(lease.job.attempt_count, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.in_flight().await.unwrap(), 1);

        assert!(queue.ack(&lease).await.unwrap());
        assert_eq!(queue.in_flight().await.unwrap(), 0);
        assert!(queue.job(&id).await.unwrap().is_none());
        assert!(queue.dequeue("w1", VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claimed_job_invisible_until_deadline() {
        let (clock, _, queue) = fixture();
        let id = queue.enqueue(&job("a.com")).await.unwrap();
        queue.dequeue("w1", VISIBILITY).await.unwrap().unwrap();

        assert!(queue.dequeue("w2", VISIBILITY).await.unwrap().is_none());

        clock.advance(VISIBILITY + Duration::from_secs(1));
        let redelivered = queue.dequeue("w2", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(redelivered.job.id, id);
        assert_eq!(redelivered.job.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_nack_requeues_once() {
        let (_, _, queue) = fixture();
        queue.enqueue(&job("a.com")).await.unwrap();
        let lease = queue.dequeue("w1", VISIBILITY).await.unwrap().unwrap();

        assert!(queue.nack(&lease).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 1);
        assert_eq!(queue.in_flight().await.unwrap(), 0);

        // A second nack of the same lease has no claim left to return
        assert!(!queue.nack(&lease).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lapsed_nack_leaves_next_claim_hidden() {
        let (clock, _, queue) = fixture();
        let id = queue.enqueue(&job("a.com")).await.unwrap();
        let stale = queue.dequeue("w1", VISIBILITY).await.unwrap().unwrap();

        clock.advance(VISIBILITY + Duration::from_secs(1));
        let current = queue.dequeue("w2", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(current.job.id, id);

        assert!(!queue.nack(&stale).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.in_flight().await.unwrap(), 1);
        assert!(queue.dequeue("w3", VISIBILITY).await.unwrap().is_none());

        assert!(queue.nack(&current).await.unwrap());
        assert_eq!(queue.dequeue("w3", VISIBILITY).await.unwrap().unwrap().job.id, id);
    }

    #[tokio::test]
    async fn test_lapsed_ack_keeps_next_claim() {
        let (clock, _, queue) = fixture();
        let id = queue.enqueue(&job("a.com")).await.unwrap();
        let stale = queue.dequeue("w1", VISIBILITY).await.unwrap().unwrap();

        clock.advance(VISIBILITY + Duration::from_secs(1));
        let current = queue.dequeue("w2", VISIBILITY).await.unwrap().unwrap();

        assert!(!queue.ack(&stale).await.unwrap());
        assert_eq!(queue.in_flight().await.unwrap(), 1);
        assert!(queue.job(&id).await.unwrap().is_none());

        assert!(queue.ack(&current).await.unwrap());
        assert_eq!(queue.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_drops_pending_only() {
        let (_, _, queue) = fixture();
        let running = queue.enqueue(&job("a.com")).await.unwrap();
        queue.enqueue(&job("b.com")).await.unwrap();
        queue.enqueue(&job("c.com")).await.unwrap();

        let lease = queue.dequeue("w1", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(lease.job.id, running);

        assert_eq!(queue.reset().await.unwrap(), 2);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.in_flight().await.unwrap(), 1);
        assert!(queue.job(&running).await.unwrap().is_some());

        let fp = Fingerprint::new("a.com", 443, CheckMode::Short);
        queue
            .publish_result(&running, &Report::completed(fp, "ok", 1), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(queue.ack(&lease).await.unwrap());
        assert_eq!(queue.result(&running).await.unwrap().unwrap().headline(), "ok");
    }

    #[tokio::test]
    async fn test_missing_record_is_skipped() {
        let (_, store, queue) = fixture();
        store.push_back("queue:pending", "ghost").await.unwrap();
        let id = queue.enqueue(&job("a.com")).await.unwrap();

        let lease = queue.dequeue("w1", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(lease.job.id, id);
        assert_eq!(queue.in_flight().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_rejects_enqueue() {
        let (_, store, queue) = fixture();
        store.set_available(false);
        let err = queue.enqueue(&job("a.com")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, QueueError::StoreUnavailable { .. }));
    }
}
