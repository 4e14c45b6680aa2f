//! Per-user output mode preference and recent check history.

use crate::store::SharedStore;
use crate::types::{CheckMode, Report};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const HISTORY_LEN: usize = 10;
pub const HISTORY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One line of a user's check history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub domain: String,
    pub port: u16,
    pub mode: CheckMode,
    pub headline: String,
    pub is_error: bool,
    pub checked_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_report(domain: &str, port: u16, mode: CheckMode, report: &Report) -> Self {
        Self {
            domain: domain.to_string(),
            port,
            mode,
            headline: report.headline(),
            is_error: report.is_error(),
            checked_at: report.computed_at,
        }
    }
}

#[derive(Clone)]
pub struct UserPrefs {
    store: Arc<dyn SharedStore>,
}

impl UserPrefs {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    fn mode_key(user_id: u64) -> String {
        format!("mode:{}", user_id)
    }

    fn history_key(user_id: u64) -> String {
        format!("history:{}", user_id)
    }

    /// Stored mode, falling back to short when unset or unreadable.
    pub async fn mode(&self, user_id: u64) -> CheckMode {
        match self.store.get(&Self::mode_key(user_id)).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_default(),
            Ok(None) => CheckMode::default(),
            Err(e) => {
                warn!(user_id, error = %e, "Could not read mode preference");
                CheckMode::default()
            }
        }
    }

    pub async fn set_mode(&self, user_id: u64, mode: CheckMode) -> crate::Result<()> {
        self.store
            .set(&Self::mode_key(user_id), mode.as_str(), None)
            .await?;
        Ok(())
    }

    /// Flip between short and full, returning the new mode.
    pub async fn toggle_mode(&self, user_id: u64) -> crate::Result<CheckMode> {
        let next = match self.mode(user_id).await {
            CheckMode::Short => CheckMode::Full,
            CheckMode::Full => CheckMode::Short,
        };
        self.set_mode(user_id, next).await?;
        Ok(next)
    }

    /// Prepend an entry, keeping the most recent [`HISTORY_LEN`].
    pub async fn record(&self, user_id: u64, entry: &HistoryEntry) -> crate::Result<()> {
        let key = Self::history_key(user_id);
        self.store
            .push_front(&key, &serde_json::to_string(entry)?)
            .await?;
        self.store.list_trim(&key, HISTORY_LEN).await?;
        self.store.expire(&key, HISTORY_TTL).await?;
        Ok(())
    }

    /// Most recent entries first; undecodable lines are skipped.
    pub async fn history(&self, user_id: u64) -> crate::Result<Vec<HistoryEntry>> {
        let raw = self
            .store
            .list_range(&Self::history_key(user_id), 0, HISTORY_LEN - 1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Fingerprint;

    #[tokio::test]
    async fn test_mode_defaults_and_toggles() {
        let prefs = UserPrefs::new(Arc::new(MemoryStore::new()));
        assert_eq!(prefs.mode(1).await, CheckMode::Short);
        assert_eq!(prefs.toggle_mode(1).await.unwrap(), CheckMode::Full);
        assert_eq!(prefs.mode(1).await, CheckMode::Full);
        assert_eq!(prefs.mode(2).await, CheckMode::Short);
    }

    #[tokio::test]
    async fn test_history_keeps_last_ten() {
        let prefs = UserPrefs::new(Arc::new(MemoryStore::new()));
        for i in 0..12 {
            let domain = format!("site{}.com", i);
            let fp = Fingerprint::new(&domain, 443, CheckMode::Short);
            let report = Report::completed(fp, format!("report {}", i), 1);
            prefs
                .record(1, &HistoryEntry::from_report(&domain, 443, CheckMode::Short, &report))
                .await
                .unwrap();
        }

        let history = prefs.history(1).await.unwrap();
        assert_eq!(history.len(), HISTORY_LEN);
        assert_eq!(history[0].domain, "site11.com");
        assert_eq!(history[9].domain, "site2.com");
        assert_eq!(history[0].headline, "report 11");
    }
}
