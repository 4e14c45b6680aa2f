//! Worker loop: dequeue, deduplicate, probe, publish.
//!
//! For each claimed job the worker serves a cached report if one is fresh,
//! otherwise becomes the single holder for the fingerprint (or waits for the
//! current holder), runs the probe under the retry policy and publishes the
//! report. Only the lease holder writes the cache. Any store failure along
//! the way, or a probe that cannot be started, nacks the job so another
//! delivery can finish it.

use crate::error::QueueError;
use crate::prefs::HistoryEntry;
use crate::probe::Probe;
use crate::services::Services;
use crate::types::{Fingerprint, Job, Report};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub(crate) const HEARTBEAT_PREFIX: &str = "worker:heartbeat:";

/// Lock acquisitions tried before a job is handed back to the queue.
const MAX_ACQUIRE_ROUNDS: usize = 3;

/// Where a delivered report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    /// Fresh cache entry
    Cache,
    /// This worker ran the probe
    Probe,
    /// Another holder ran the probe while this job waited
    Shared,
}

/// What happened to one dequeued job.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    Delivered {
        job_id: String,
        fingerprint: Fingerprint,
        source: ReportSource,
        is_error: bool,
    },
    Requeued {
        job_id: String,
        reason: String,
    },
}

pub struct Worker {
    id: String,
    services: Services,
    probe: Arc<dyn Probe>,
}

impl Worker {
    pub fn new<I: Into<String>>(id: I, services: Services, probe: Arc<dyn Probe>) -> Self {
        Self {
            id: id.into(),
            services,
            probe,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process at most one job. Returns `None` when the queue was empty.
    pub async fn run_once(&self) -> crate::Result<Option<WorkOutcome>> {
        let visibility = self.services.config.queue.visibility_timeout;
        let Some(lease) = self.services.queue.dequeue(&self.id, visibility).await? else {
            return Ok(None);
        };
        let job = lease.job.clone();

        info!(worker = %self.id, job_id = %job.id, target = %job.target(), attempt = job.attempt_count, "Processing job");

        let result = match self.resolve(&job).await {
            Ok((report, source)) => self.deliver(&job, &report).await.map(|_| (report, source)),
            Err(e) => Err(e),
        };

        match result {
            Ok((report, source)) => {
                self.services.queue.ack(&lease).await?;
                info!(
                    worker = %self.id,
                    job_id = %job.id,
                    ?source,
                    is_error = report.is_error(),
                    "Job delivered"
                );
                Ok(Some(WorkOutcome::Delivered {
                    job_id: job.id,
                    fingerprint: report.fingerprint.clone(),
                    source,
                    is_error: report.is_error(),
                }))
            }
            Err(e) => {
                warn!(worker = %self.id, job_id = %job.id, error = %e, "Returning job to queue");
                self.services.queue.nack(&lease).await?;
                Ok(Some(WorkOutcome::Requeued {
                    job_id: job.id,
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Produce the report for a job, deduplicating against other holders.
    async fn resolve(&self, job: &Job) -> crate::Result<(Report, ReportSource)> {
        let fingerprint = job.fingerprint();
        let services = &self.services;

        if let Some(report) = services.cache.get(&fingerprint).await {
            return Ok((report, ReportSource::Cache));
        }

        let lease_ttl = services.config.lock.lease_ttl;
        let wait_bound = services.config.retry.max_time
            + services.config.retry.attempt_timeout(job.mode);

        for _ in 0..MAX_ACQUIRE_ROUNDS {
            match services
                .lock
                .try_acquire(&fingerprint, &job.id, lease_ttl)
                .await?
            {
                Some(lease) => {
                    // Another holder may have finished between the miss and the acquire
                    if let Some(report) = services.cache.get(&fingerprint).await {
                        self.release(&lease).await;
                        return Ok((report, ReportSource::Cache));
                    }

                    let report = match self.compute(job, &fingerprint).await {
                        Ok(report) => report,
                        Err(e) => {
                            self.release(&lease).await;
                            return Err(e);
                        }
                    };

                    match services.lock.is_held(&lease).await {
                        Ok(true) => {
                            services.cache.put_default(&fingerprint, &report).await;
                        }
                        Ok(false) => warn!(
                            %fingerprint,
                            job_id = %job.id,
                            "Lease expired during probe, not publishing to cache"
                        ),
                        Err(e) => warn!(%fingerprint, error = %e, "Could not confirm lease, not publishing to cache"),
                    }
                    self.release(&lease).await;
                    return Ok((report, ReportSource::Probe));
                }
                None => match services.lock.await_result(&fingerprint, wait_bound).await {
                    Ok(report) => return Ok((report, ReportSource::Shared)),
                    Err(QueueError::LeaseVacated { .. }) => {
                        debug!(%fingerprint, job_id = %job.id, "Holder vanished, retrying acquisition");
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        Err(QueueError::LeaseVacated {
            fingerprint: fingerprint.to_string(),
        })
    }

    async fn release(&self, lease: &crate::lock::Lease) {
        if let Err(e) = self.services.lock.release(lease).await {
            warn!(fingerprint = %lease.fingerprint(), error = %e, "Failed to release lock, it will expire");
        }
    }

    /// Run the probe under the retry policy. Terminal failures become error
    /// reports; a probe that could not run is returned as an error so nothing
    /// gets cached.
    async fn compute(&self, job: &Job, fingerprint: &Fingerprint) -> crate::Result<Report> {
        let target = job.target();
        let probe = self.probe.clone();

        let result = self
            .services
            .retry
            .execute(&target, |_| {
                let probe = probe.clone();
                let target = target.clone();
                async move { probe.probe(&target).await }
            })
            .await;

        match result {
            Ok(outcome) => Ok(Report::completed(
                fingerprint.clone(),
                outcome.body,
                outcome.attempts,
            )),
            Err(QueueError::TransientProbe {
                kind,
                attempts,
                message,
                ..
            })
            | Err(QueueError::PermanentProbe {
                kind,
                attempts,
                message,
                ..
            }) => Ok(Report::failed(fingerprint.clone(), kind, message, attempts)),
            Err(other) => {
                error!(worker = %self.id, %fingerprint, error = %other, "Probe did not produce a report");
                Err(other)
            }
        }
    }

    /// Make the report visible to the producer, history and batch.
    ///
    /// History is written only by the delivery that published the job's
    /// result first, so a redelivered job leaves a single entry.
    async fn deliver(&self, job: &Job, report: &Report) -> crate::Result<()> {
        let services = &self.services;

        let first = services
            .queue
            .publish_result(&job.id, report, services.config.cache.ttl)
            .await?;

        if first {
            let entry = HistoryEntry::from_report(&job.domain, job.port, job.mode, report);
            if let Err(e) = services.prefs.record(job.requester_id, &entry).await {
                warn!(user_id = job.requester_id, error = %e, "Failed to record history");
            }
        }

        if let Some(batch_id) = &job.batch_id {
            match services
                .batches
                .on_item_complete(batch_id, &report.fingerprint, report)
                .await
            {
                Ok(progress) => debug!(%batch_id, %progress, "Updated batch"),
                Err(QueueError::NotFound { .. }) => {
                    warn!(%batch_id, job_id = %job.id, "Batch expired before item completed")
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Write this worker's heartbeat.
    pub async fn heartbeat(&self) -> crate::Result<()> {
        write_heartbeat(&self.services, &self.id).await
    }

    /// Process jobs until `shutdown` turns true.
    ///
    /// Sleeps for the poll interval when the queue is empty or the store is
    /// failing; a heartbeat is refreshed in the background throughout.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = self.services.config.queue.poll_interval;
        let heartbeat = self.spawn_heartbeat(shutdown.clone());

        info!(worker = %self.id, "Worker started");

        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(worker = %self.id, error = %e, "Worker iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }

        heartbeat.abort();
        if let Err(e) = self
            .services
            .store
            .delete(&format!("{}{}", HEARTBEAT_PREFIX, self.id))
            .await
        {
            debug!(worker = %self.id, error = %e, "Could not remove heartbeat");
        }
        info!(worker = %self.id, "Worker stopped");
    }

    fn spawn_heartbeat(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let services = self.services.clone();
        let id = self.id.clone();
        let interval = services.config.queue.heartbeat_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = write_heartbeat(&services, &id).await {
                            warn!(worker = %id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        })
    }
}

async fn write_heartbeat(services: &Services, worker_id: &str) -> crate::Result<()> {
    let now = services.clock.now();
    services
        .store
        .set(
            &format!("{}{}", HEARTBEAT_PREFIX, worker_id),
            &now.to_rfc3339(),
            Some(services.config.queue.heartbeat_stale * 2),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::probe::CommandProbe;
    use crate::store::{MemoryStore, SharedStore};
    use crate::types::{CheckMode, FailureKind, ProbeError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProbe {
        calls: AtomicU32,
        result: Result<String, ProbeError>,
    }

    #[async_trait]
    impl Probe for CountingProbe {
        async fn probe(&self, _target: &crate::types::CheckTarget) -> Result<String, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn fixture(result: Result<String, ProbeError>) -> (Arc<MemoryStore>, Services, Arc<CountingProbe>, Worker) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let mut config = QueueConfig::default();
        config.retry.jitter = 0.0;
        let services = Services::with_clock(store.clone(), config, clock);
        let probe = Arc::new(CountingProbe {
            calls: AtomicU32::new(0),
            result,
        });
        let worker = Worker::new("w1", services.clone(), probe.clone());
        (store, services, probe, worker)
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (_, _, _, worker) = fixture(Ok("ok".to_string()));
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_is_probed_cached_and_acked() {
        let (_, services, probe, worker) = fixture(Ok("TLS ok\nmore".to_string()));
        let job = Job::new(5, "example.com", 443, CheckMode::Short);
        services.queue.enqueue(&job).await.unwrap();

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            WorkOutcome::Delivered {
                source: ReportSource::Probe,
                is_error: false,
                ..
            }
        ));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert!(services.cache.get(&job.fingerprint()).await.is_some());
        assert_eq!(services.queue.in_flight().await.unwrap(), 0);

        let result = services.queue.result(&job.id).await.unwrap().unwrap();
        assert_eq!(result.headline(), "TLS ok");
        assert_eq!(services.prefs.history(5).await.unwrap().len(), 1);

        // Same fingerprint again is served from cache
        services
            .queue
            .enqueue(&Job::new(6, "example.com", 443, CheckMode::Short))
            .await
            .unwrap();
        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            WorkOutcome::Delivered {
                source: ReportSource::Cache,
                ..
            }
        ));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_yields_error_report() {
        let (_, services, probe, worker) = fixture(Err(ProbeError::new(
            FailureKind::MalformedInput,
            "label too long",
        )));
        let job = Job::new(5, "example.com", 443, CheckMode::Short);
        services.queue.enqueue(&job).await.unwrap();

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, WorkOutcome::Delivered { is_error: true, .. }));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        let cached = services.cache.get(&job.fingerprint()).await.unwrap();
        assert!(cached.is_error());
        assert_eq!(cached.headline(), "unreachable (malformed input)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_after_retries_keeps_attempt_count() {
        struct FlakyThenBroken(AtomicU32);

        #[async_trait]
        impl Probe for FlakyThenBroken {
            async fn probe(&self, _target: &crate::types::CheckTarget) -> Result<String, ProbeError> {
                if self.0.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProbeError::new(FailureKind::ConnectionReset, "reset"))
                } else {
                    Err(ProbeError::new(FailureKind::ProtocolMismatch, "no TLS"))
                }
            }
        }

        let (_, services, _, _) = fixture(Ok("unused".to_string()));
        let worker = Worker::new("w1", services.clone(), Arc::new(FlakyThenBroken(AtomicU32::new(0))));
        let job = Job::new(5, "example.com", 443, CheckMode::Short);
        services.queue.enqueue(&job).await.unwrap();

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, WorkOutcome::Delivered { is_error: true, .. }));

        let result = services.queue.result(&job.id).await.unwrap().unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(services.cache.get(&job.fingerprint()).await.unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_missing_probe_program_requeues_without_caching() {
        let (_, services, _, _) = fixture(Ok("unused".to_string()));
        let probe = Arc::new(CommandProbe::new(
            "/nonexistent/probe-queue-check",
            ["{domain}"],
        ));
        let worker = Worker::new("w1", services.clone(), probe);
        let job = Job::new(5, "example.com", 443, CheckMode::Short);
        services.queue.enqueue(&job).await.unwrap();

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, WorkOutcome::Requeued { .. }));
        assert!(services.cache.get(&job.fingerprint()).await.is_none());
        assert!(services.queue.result(&job.id).await.unwrap().is_none());
        assert!(services.prefs.history(5).await.unwrap().is_empty());
        assert_eq!(services.queue.depth().await.unwrap(), 1);
        assert_eq!(services.queue.in_flight().await.unwrap(), 0);

        // The fingerprint is free for the next delivery
        assert!(services
            .lock
            .try_acquire(&job.fingerprint(), "w2", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_redelivered_job_records_history_once() {
        let (_, services, probe, worker) = fixture(Ok("TLS ok".to_string()));
        let job = Job::new(5, "example.com", 443, CheckMode::Short);
        services.queue.enqueue(&job).await.unwrap();
        worker.run_once().await.unwrap().unwrap();

        // The same job arrives again after it was already delivered
        services.queue.enqueue(&job).await.unwrap();
        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, WorkOutcome::Delivered { .. }));

        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(services.prefs.history(5).await.unwrap().len(), 1);
        assert_eq!(services.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_requeues_job() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let mut config = QueueConfig::default();
        config.retry.max_time = Duration::from_secs(1);
        config.retry.short_timeout = Duration::from_secs(1);
        config.lock.poll_interval = Duration::from_millis(100);
        let services = Services::with_clock(store, config, clock);
        let worker = Worker::new("w1", services.clone(), Arc::new(CountingProbe {
            calls: AtomicU32::new(0),
            result: Ok("ok".to_string()),
        }));

        let job = Job::new(5, "example.com", 443, CheckMode::Short);
        services.queue.enqueue(&job).await.unwrap();
        // Another holder owns the fingerprint and never finishes
        services
            .lock
            .try_acquire(&job.fingerprint(), "other", Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, WorkOutcome::Requeued { .. }));
        assert_eq!(services.queue.depth().await.unwrap(), 1);
        assert_eq!(services.queue.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_error() {
        let (store, services, _, worker) = fixture(Ok("ok".to_string()));
        services
            .queue
            .enqueue(&Job::new(5, "example.com", 443, CheckMode::Short))
            .await
            .unwrap();

        store.set_available(false);
        assert!(worker.run_once().await.is_err());
        store.set_available(true);
        assert_eq!(services.queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_written() {
        let (store, _, _, worker) = fixture(Ok("ok".to_string()));
        worker.heartbeat().await.unwrap();
        assert!(store.get("worker:heartbeat:w1").await.unwrap().is_some());
    }
}
