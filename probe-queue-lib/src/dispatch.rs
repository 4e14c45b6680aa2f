//! Producer-side entry point.
//!
//! Turns a user's free-text submission into a cached answer, a single queued
//! job, or a batch. Producers get a handle back immediately and observe
//! completion by polling.

use crate::batch::{BatchProgress, BatchRecord};
use crate::error::QueueError;
use crate::prefs::HistoryEntry;
use crate::queue::JobQueue;
use crate::services::Services;
use crate::types::{CheckMode, CheckTarget, Fingerprint, Job, Report};
use crate::utils::extract_domains;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Handle to a queued single-domain job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job_id: String,
    pub fingerprint: Fingerprint,
}

impl JobHandle {
    /// Published report, if the job has finished.
    pub async fn poll(&self, queue: &JobQueue) -> crate::Result<Option<Report>> {
        queue.result(&self.job_id).await
    }

    /// Poll until the report appears or `timeout` elapses.
    pub async fn wait(
        &self,
        queue: &JobQueue,
        timeout: Duration,
        interval: Duration,
    ) -> crate::Result<Report> {
        let started = Instant::now();
        loop {
            if let Some(report) = self.poll(queue).await? {
                return Ok(report);
            }
            if started.elapsed() >= timeout {
                return Err(QueueError::AwaitTimeout {
                    fingerprint: self.fingerprint.to_string(),
                    duration: timeout,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// What a submission turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// A fresh cached report answered the request directly
    Cached(Report),
    /// One job was enqueued
    Queued(JobHandle),
    /// Several domains were split into a batch
    Batch(String),
}

#[derive(Clone)]
pub struct Dispatcher {
    services: Services,
}

impl Dispatcher {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Accept a submission from `user_id`.
    ///
    /// The rate limiter runs first and fails closed. `mode` overrides the
    /// user's stored preference.
    pub async fn submit(
        &self,
        user_id: u64,
        text: &str,
        mode: Option<CheckMode>,
    ) -> crate::Result<Submission> {
        let services = &self.services;

        services
            .rate_limiter
            .check_and_record(user_id)
            .await?
            .into_result(user_id)?;

        let extraction = extract_domains(text);
        if extraction.targets.is_empty() {
            let offending = extraction
                .rejected
                .first()
                .cloned()
                .unwrap_or_else(|| text.trim().to_string());
            return Err(QueueError::invalid_domain(offending, "no valid domain found"));
        }
        if !extraction.rejected.is_empty() {
            debug!(user_id, rejected = ?extraction.rejected, "Ignoring unparseable tokens");
        }

        let mode = match mode {
            Some(mode) => mode,
            None => services.prefs.mode(user_id).await,
        };

        let targets: Vec<CheckTarget> = extraction
            .targets
            .into_iter()
            .map(|t| CheckTarget::new(t.domain, t.port, mode))
            .collect();

        if let [target] = targets.as_slice() {
            return self.submit_single(user_id, target).await;
        }

        let batch_id = services
            .batches
            .submit_batch(user_id, &targets, mode)
            .await?;
        info!(user_id, %batch_id, total = targets.len(), "Submitted batch");
        Ok(Submission::Batch(batch_id))
    }

    async fn submit_single(&self, user_id: u64, target: &CheckTarget) -> crate::Result<Submission> {
        let services = &self.services;
        let fingerprint = target.fingerprint();

        if let Some(report) = services.cache.get(&fingerprint).await {
            let entry = HistoryEntry::from_report(&target.domain, target.port, target.mode, &report);
            if let Err(e) = services.prefs.record(user_id, &entry).await {
                warn!(user_id, error = %e, "Failed to record history");
            }
            debug!(user_id, %fingerprint, "Answered from cache");
            return Ok(Submission::Cached(report));
        }

        let job = Job::new(user_id, target.domain.clone(), target.port, target.mode);
        let job_id = services.queue.enqueue(&job).await?;
        Ok(Submission::Queued(JobHandle {
            job_id,
            fingerprint,
        }))
    }

    pub async fn job_result(&self, job_id: &str) -> crate::Result<Option<Report>> {
        self.services.queue.result(job_id).await
    }

    pub async fn batch_progress(&self, batch_id: &str) -> crate::Result<BatchProgress> {
        self.services.batches.poll_progress(batch_id).await
    }

    pub async fn batch(&self, batch_id: &str) -> crate::Result<BatchRecord> {
        self.services.batches.get(batch_id).await
    }
}
