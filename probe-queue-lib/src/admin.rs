//! Operational commands and liveness reporting.

use crate::clock;
use crate::rate_limit::RateLimitState;
use crate::services::Services;
use crate::worker::HEARTBEAT_PREFIX;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Last heartbeat seen from one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub age_secs: Option<u64>,
    pub fresh: bool,
}

/// Store reachability, queue figures and worker liveness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub store_ok: bool,
    pub store_error: Option<String>,
    pub queue_depth: u64,
    pub in_flight: u64,
    pub workers: Vec<WorkerHeartbeat>,
}

impl HealthReport {
    /// Store reachable and at least one worker with a fresh heartbeat.
    pub fn is_healthy(&self) -> bool {
        self.store_ok && self.workers.iter().any(|w| w.fresh)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.store_error {
            None => writeln!(f, "Store:     reachable")?,
            Some(e) => writeln!(f, "Store:     UNREACHABLE ({})", e)?,
        }
        writeln!(f, "Pending:   {}", self.queue_depth)?;
        writeln!(f, "In flight: {}", self.in_flight)?;
        if self.workers.is_empty() {
            return write!(f, "Workers:   none");
        }
        write!(f, "Workers:")?;
        for worker in &self.workers {
            let age = worker
                .age_secs
                .map(|s| format!("{}s ago", s))
                .unwrap_or_else(|| "unreadable".to_string());
            let state = if worker.fresh { "fresh" } else { "stale" };
            write!(f, "\n  {:<24} {:<12} {}", worker.worker_id, age, state)?;
        }
        Ok(())
    }
}

/// Admin facade over the shared components.
#[derive(Clone)]
pub struct Admin {
    services: Services,
}

impl Admin {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Drop every pending job. In-flight jobs finish or expire on their own.
    pub async fn reset_queue(&self) -> crate::Result<usize> {
        let dropped = self.services.queue.reset().await?;
        info!(dropped, "Admin reset queue");
        Ok(dropped)
    }

    pub async fn clear_cache(&self) -> crate::Result<u64> {
        let removed = self.services.cache.clear_all().await?;
        info!(removed, "Admin cleared cache");
        Ok(removed)
    }

    pub async fn inspect_user(&self, user_id: u64) -> crate::Result<RateLimitState> {
        self.services.rate_limiter.inspect(user_id).await
    }

    /// Clear counters, violations and any ban for a user.
    pub async fn pardon_user(&self, user_id: u64) -> crate::Result<u64> {
        let removed = self.services.rate_limiter.pardon(user_id).await?;
        info!(user_id, removed, "Admin pardoned user");
        Ok(removed)
    }

    /// Collect a health report. Store failures are reported, not returned.
    pub async fn health(&self) -> HealthReport {
        let services = &self.services;

        if let Err(e) = services.store.ping().await {
            warn!(error = %e, "Health check: store unreachable");
            return HealthReport {
                store_ok: false,
                store_error: Some(e.to_string()),
                queue_depth: 0,
                in_flight: 0,
                workers: Vec::new(),
            };
        }

        let figures = async {
            let depth = services.queue.depth().await?;
            let in_flight = services.queue.in_flight().await?;
            let workers = self.heartbeats().await?;
            crate::Result::Ok((depth, in_flight, workers))
        };

        match figures.await {
            Ok((queue_depth, in_flight, workers)) => HealthReport {
                store_ok: true,
                store_error: None,
                queue_depth,
                in_flight,
                workers,
            },
            Err(e) => HealthReport {
                store_ok: false,
                store_error: Some(e.to_string()),
                queue_depth: 0,
                in_flight: 0,
                workers: Vec::new(),
            },
        }
    }

    async fn heartbeats(&self) -> crate::Result<Vec<WorkerHeartbeat>> {
        let services = &self.services;
        let now = services.clock.now();
        let stale_after = services.config.queue.heartbeat_stale;

        let mut keys = services.store.keys(HEARTBEAT_PREFIX).await?;
        keys.sort();

        let values = join_all(keys.iter().map(|key| services.store.get(key))).await;

        let mut workers = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            let Some(raw) = value? else {
                continue;
            };
            let last_seen = DateTime::parse_from_rfc3339(&raw)
                .ok()
                .map(|t| t.with_timezone(&Utc));
            let age = last_seen.map(|seen| clock::until(seen, now));
            workers.push(WorkerHeartbeat {
                worker_id: key.trim_start_matches(HEARTBEAT_PREFIX).to_string(),
                last_seen,
                age_secs: age.map(|a| a.as_secs()),
                fresh: age.is_some_and(|a| a < stale_after),
            });
        }
        Ok(workers)
    }
}

/// Seconds rendered for humans, e.g. `90s` or `5m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::store::{MemoryStore, SharedStore};
    use crate::types::{CheckMode, Fingerprint, Job, Report};
    use std::sync::Arc;

    fn fixture() -> (Arc<ManualClock>, Arc<MemoryStore>, Services, Admin) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let services = Services::with_clock(store.clone(), QueueConfig::default(), clock.clone());
        let admin = Admin::new(services.clone());
        (clock, store, services, admin)
    }

    #[tokio::test]
    async fn test_reset_and_clear() {
        let (_, _, services, admin) = fixture();
        for domain in ["a.com", "b.com"] {
            services
                .queue
                .enqueue(&Job::new(1, domain, 443, CheckMode::Short))
                .await
                .unwrap();
        }
        let fp = Fingerprint::new("a.com", 443, CheckMode::Short);
        services
            .cache
            .put_default(&fp, &Report::completed(fp.clone(), "ok", 1))
            .await;

        assert_eq!(admin.reset_queue().await.unwrap(), 2);
        assert_eq!(services.queue.depth().await.unwrap(), 0);
        assert_eq!(admin.clear_cache().await.unwrap(), 1);
        assert!(services.cache.get(&fp).await.is_none());
    }

    #[tokio::test]
    async fn test_inspect_and_pardon() {
        let (_, _, services, admin) = fixture();
        services.rate_limiter.check_and_record(9).await.unwrap();
        assert_eq!(admin.inspect_user(9).await.unwrap().short_window_count, 1);

        admin.pardon_user(9).await.unwrap();
        let state = admin.inspect_user(9).await.unwrap();
        assert_eq!(state.short_window_count, 0);
        assert_eq!(state.violation_count, 0);
    }

    #[tokio::test]
    async fn test_health_tracks_heartbeat_freshness() {
        let (clock, store, services, admin) = fixture();

        let report = admin.health().await;
        assert!(report.store_ok);
        assert!(!report.is_healthy(), "no workers yet");

        store
            .set(
                &format!("{}w1", HEARTBEAT_PREFIX),
                &services.clock.now().to_rfc3339(),
                None,
            )
            .await
            .unwrap();
        let report = admin.health().await;
        assert!(report.is_healthy());
        assert_eq!(report.workers[0].worker_id, "w1");
        assert_eq!(report.workers[0].age_secs, Some(0));

        clock.advance(services.config.queue.heartbeat_stale + Duration::from_secs(1));
        let report = admin.health().await;
        assert!(!report.workers[0].fresh);
        assert!(!report.is_healthy());
        assert!(report.to_string().contains("stale"));
    }

    #[tokio::test]
    async fn test_health_reports_store_outage() {
        let (_, store, _, admin) = fixture();
        store.set_available(false);
        let report = admin.health().await;
        assert!(!report.store_ok);
        assert!(report.store_error.is_some());
        assert!(report.to_string().contains("UNREACHABLE"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
    }
}
