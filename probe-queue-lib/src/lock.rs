//! Single-flight deduplication of concurrent checks.
//!
//! A marker under `inflight:{fingerprint}` names the job currently computing
//! that fingerprint. The marker expires after its lease TTL, so a crashed
//! holder blocks others for at most one lease period.

use crate::cache::ResultCache;
use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::store::SharedStore;
use crate::types::{Fingerprint, Report};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "inflight:";

/// Stored form of a held lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InFlightMarker {
    pub fingerprint: Fingerprint,
    pub holder_job_id: String,
    pub acquired_at: DateTime<Utc>,
    pub lease_ttl_ms: u64,
}

/// Proof of holding the lock for one fingerprint.
///
/// Carries the exact stored value so release and ownership checks only ever
/// touch this holder's marker.
#[derive(Debug, Clone)]
pub struct Lease {
    pub marker: InFlightMarker,
    raw: String,
}

impl Lease {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.marker.fingerprint
    }
}

#[derive(Clone)]
pub struct InFlightLock {
    store: Arc<dyn SharedStore>,
    cache: ResultCache,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl InFlightLock {
    pub fn new(store: Arc<dyn SharedStore>, cache: ResultCache, poll_interval: Duration) -> Self {
        Self::with_clock(store, cache, poll_interval, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SharedStore>,
        cache: ResultCache,
        poll_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            poll_interval,
        }
    }

    fn key(fingerprint: &Fingerprint) -> String {
        format!("{}{}", KEY_PREFIX, fingerprint)
    }

    /// Try to become the single holder for `fingerprint`.
    ///
    /// Returns `None` when someone else holds a live lease.
    pub async fn try_acquire(
        &self,
        fingerprint: &Fingerprint,
        holder_job_id: &str,
        lease_ttl: Duration,
    ) -> crate::Result<Option<Lease>> {
        let marker = InFlightMarker {
            fingerprint: fingerprint.clone(),
            holder_job_id: holder_job_id.to_string(),
            acquired_at: self.clock.now(),
            lease_ttl_ms: u64::try_from(lease_ttl.as_millis()).unwrap_or(u64::MAX),
        };
        let raw = serde_json::to_string(&marker)?;

        let granted = self
            .store
            .set_if_absent(&Self::key(fingerprint), &raw, lease_ttl)
            .await?;

        if granted {
            debug!(%fingerprint, holder = holder_job_id, "Acquired in-flight lock");
            Ok(Some(Lease { marker, raw }))
        } else {
            debug!(%fingerprint, job = holder_job_id, "In-flight lock denied");
            Ok(None)
        }
    }

    /// Whether `lease` is still the live marker for its fingerprint.
    pub async fn is_held(&self, lease: &Lease) -> crate::Result<bool> {
        let current = self.store.get(&Self::key(lease.fingerprint())).await?;
        Ok(current.as_deref() == Some(lease.raw.as_str()))
    }

    /// Release the lock if this lease still owns it.
    ///
    /// Returns false when the lease had already expired (and possibly passed
    /// to someone else), in which case nothing is deleted.
    pub async fn release(&self, lease: &Lease) -> crate::Result<bool> {
        let released = self
            .store
            .compare_and_delete(&Self::key(lease.fingerprint()), &lease.raw)
            .await?;
        if released {
            debug!(fingerprint = %lease.fingerprint(), "Released in-flight lock");
        } else {
            warn!(
                fingerprint = %lease.fingerprint(),
                holder = %lease.marker.holder_job_id,
                "Lease expired before release"
            );
        }
        Ok(released)
    }

    /// Current holder, if any.
    pub async fn holder(&self, fingerprint: &Fingerprint) -> crate::Result<Option<InFlightMarker>> {
        match self.store.get(&Self::key(fingerprint)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Wait for the holder of `fingerprint` to publish its result.
    ///
    /// Polls the cache until a report appears. Fails with `LeaseVacated` if
    /// the marker disappears without a result, or `AwaitTimeout` once
    /// `timeout` elapses.
    pub async fn await_result(
        &self,
        fingerprint: &Fingerprint,
        timeout: Duration,
    ) -> crate::Result<Report> {
        let started = Instant::now();
        let key = Self::key(fingerprint);

        loop {
            if let Some(report) = self.cache.get(fingerprint).await {
                debug!(%fingerprint, "Received result from lock holder");
                return Ok(report);
            }

            if self.store.get(&key).await?.is_none() {
                // The holder may have published and released between the two reads
                if let Some(report) = self.cache.get(fingerprint).await {
                    return Ok(report);
                }
                return Err(QueueError::LeaseVacated {
                    fingerprint: fingerprint.to_string(),
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(QueueError::AwaitTimeout {
                    fingerprint: fingerprint.to_string(),
                    duration: timeout,
                });
            }

            tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }
}
