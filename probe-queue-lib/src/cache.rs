//! Result cache keyed by check fingerprint.
//!
//! Entries are written whole as one JSON value, so a reader never sees a
//! partial report. The cache is an optimization: when the store is down every
//! read is a miss and every write is skipped with a warning.

use crate::clock::{self, Clock, SystemClock};
use crate::store::SharedStore;
use crate::types::{Fingerprint, Report};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "result:";

/// A stored report plus the metadata needed to judge its freshness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub report: Report,
    pub computed_at: DateTime<Utc>,
    #[serde(with = "ttl_secs")]
    pub ttl: Duration,
}

mod ttl_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(ttl.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl CacheEntry {
    /// Whether the entry is past its TTL at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        clock::until(self.computed_at, now) >= self.ttl
    }
}

/// Fingerprint → report mapping with TTL expiry.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn SharedStore>, default_ttl: Duration) -> Self {
        Self::with_clock(store, default_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SharedStore>,
        default_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn key(fingerprint: &Fingerprint) -> String {
        format!("{}{}", KEY_PREFIX, fingerprint)
    }

    /// Look up a fresh report.
    ///
    /// Entries older than their TTL are misses even if the store still holds
    /// them; undecodable entries and store failures are misses too.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Report> {
        let key = Self::key(fingerprint);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(%fingerprint, "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(%fingerprint, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%fingerprint, error = %e, "Discarding undecodable cache entry");
                return None;
            }
        };

        if entry.is_expired(self.clock.now()) {
            debug!(%fingerprint, computed_at = %entry.computed_at, "Cache entry expired");
            return None;
        }

        debug!(%fingerprint, "Cache hit");
        Some(entry.report)
    }

    /// Store a report, replacing any previous entry for the fingerprint.
    ///
    /// Returns whether the write reached the store.
    pub async fn put(&self, fingerprint: &Fingerprint, report: &Report, ttl: Duration) -> bool {
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            report: report.clone(),
            computed_at: self.clock.now(),
            ttl,
        };

        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(%fingerprint, error = %e, "Failed to encode cache entry");
                return false;
            }
        };

        match self
            .store
            .set(&Self::key(fingerprint), &encoded, Some(ttl))
            .await
        {
            Ok(()) => {
                debug!(%fingerprint, ttl_secs = ttl.as_secs(), "Cached report");
                true
            }
            Err(e) => {
                warn!(%fingerprint, error = %e, "Cache write failed");
                false
            }
        }
    }

    /// [`put`](Self::put) with the configured TTL.
    pub async fn put_default(&self, fingerprint: &Fingerprint, report: &Report) -> bool {
        self.put(fingerprint, report, self.default_ttl).await
    }

    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> crate::Result<bool> {
        Ok(self.store.delete(&Self::key(fingerprint)).await?)
    }

    /// Drop every cached report. Returns how many entries were removed.
    pub async fn clear_all(&self) -> crate::Result<u64> {
        let removed = self.store.delete_prefix(KEY_PREFIX).await?;
        debug!(removed, "Cleared result cache");
        Ok(removed)
    }
}
