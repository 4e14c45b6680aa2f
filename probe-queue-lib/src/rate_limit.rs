//! Per-user rate limiting with progressive penalties.
//!
//! Two fixed-window counters per user (short window and UTC day) are kept as
//! increment-with-expiry keys. Exceeding either records a violation; from the
//! configured threshold on, violations ban the user for a duration taken from
//! the escalation table. Violations are forgotten after a quiet cooldown.
//!
//! Keys, all under `rate:{user}:`:
//! - `w:{window_index}` short window counter
//! - `d:{yyyymmdd}` daily counter
//! - `violations` violation counter, expiry refreshed on every violation
//! - `ban` ban deadline in epoch milliseconds

use crate::clock::{self, Clock, SystemClock};
use crate::config::{PenaltyConfig, RateLimitConfig};
use crate::error::QueueError;
use crate::store::SharedStore;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    WindowExceeded,
    DailyExceeded,
    Banned,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::WindowExceeded => write!(f, "too many requests in window"),
            DenyReason::DailyExceeded => write!(f, "daily limit reached"),
            DenyReason::Banned => write!(f, "temporarily banned"),
        }
    }
}

/// Outcome of [`RateLimiter::check_and_record`].
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed,
    Denied {
        retry_after: Duration,
        reason: DenyReason,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }

    /// Convert a denial into [`QueueError::RateLimited`].
    pub fn into_result(self, user_id: u64) -> Result<(), QueueError> {
        match self {
            RateDecision::Allowed => Ok(()),
            RateDecision::Denied { retry_after, .. } => Err(QueueError::RateLimited {
                user_id,
                retry_after,
            }),
        }
    }
}

/// Snapshot of a user's limiter state, for admin inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitState {
    pub user_id: u64,
    pub short_window_count: u64,
    pub daily_count: u64,
    pub window_reset_at: DateTime<Utc>,
    pub daily_reset_at: DateTime<Utc>,
    pub violation_count: u32,
    /// Remaining time before the violation count resets
    pub violations_reset_in: Option<Duration>,
    pub ban_until: Option<DateTime<Utc>>,
}

impl RateLimitState {
    pub fn is_banned(&self, now: DateTime<Utc>) -> bool {
        self.ban_until.is_some_and(|until| until > now)
    }
}

impl fmt::Display for RateLimitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "User {}", self.user_id)?;
        writeln!(
            f,
            "  Window:     {} request(s), resets {}",
            self.short_window_count,
            self.window_reset_at.format("%H:%M:%S UTC")
        )?;
        writeln!(
            f,
            "  Daily:      {} request(s), resets {}",
            self.daily_count,
            self.daily_reset_at.format("%Y-%m-%d %H:%M UTC")
        )?;
        match self.violations_reset_in {
            Some(left) => writeln!(
                f,
                "  Violations: {} (forgotten in {}s)",
                self.violation_count,
                left.as_secs()
            )?,
            None => writeln!(f, "  Violations: {}", self.violation_count)?,
        }
        match self.ban_until {
            Some(until) => write!(f, "  Banned until {}", until.format("%Y-%m-%d %H:%M:%S UTC")),
            None => write!(f, "  Not banned"),
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    limits: RateLimitConfig,
    penalty: PenaltyConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, limits: RateLimitConfig, penalty: PenaltyConfig) -> Self {
        Self::with_clock(store, limits, penalty, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SharedStore>,
        limits: RateLimitConfig,
        penalty: PenaltyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            limits,
            penalty,
        }
    }

    fn prefix(user_id: u64) -> String {
        format!("rate:{}:", user_id)
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.limits.window.as_millis())
            .unwrap_or(i64::MAX)
            .max(1)
    }

    /// Index and end of the short window containing `now`.
    fn window_bounds(&self, now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
        let window_ms = self.window_ms();
        let index = now.timestamp_millis().div_euclid(window_ms);
        let reset_ms = index.saturating_add(1).saturating_mul(window_ms);
        let reset_at = Utc
            .timestamp_millis_opt(reset_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (index, reset_at)
    }

    /// Day key and the next UTC midnight.
    fn day_bounds(now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let today = now.date_naive();
        let reset_at = today
            .succ_opt()
            .map(|d| d.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or_else(|| clock::add(now, DAY));
        (today.format("%Y%m%d").to_string(), reset_at)
    }

    async fn read_ban(&self, user_id: u64) -> crate::Result<Option<(String, DateTime<Utc>)>> {
        let key = format!("{}ban", Self::prefix(user_id));
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let until = raw
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| QueueError::Serialization {
                message: format!("invalid ban deadline '{}' for user {}", raw, user_id),
            })?;
        Ok(Some((raw, until)))
    }

    /// Count one request for `user_id` and decide whether it may proceed.
    ///
    /// Requests during an active ban are rejected without touching any
    /// counter. Store failures are returned as errors so callers fail closed.
    pub async fn check_and_record(&self, user_id: u64) -> crate::Result<RateDecision> {
        let now = self.clock.now();

        if let Some((_, until)) = self.read_ban(user_id).await? {
            if until > now {
                debug!(user_id, ban_until = %until, "Rejected request from banned user");
                return Ok(RateDecision::Denied {
                    retry_after: clock::until(now, until),
                    reason: DenyReason::Banned,
                });
            }
        }

        let prefix = Self::prefix(user_id);

        let (window_index, window_reset_at) = self.window_bounds(now);
        let window_count = self
            .store
            .incr_with_expiry(
                &format!("{}w:{}", prefix, window_index),
                clock::until(now, window_reset_at).max(Duration::from_millis(1)),
            )
            .await?;

        let (reason, reset_at) = if window_count > i64::from(self.limits.window_limit) {
            (DenyReason::WindowExceeded, window_reset_at)
        } else {
            let (day, daily_reset_at) = Self::day_bounds(now);
            let daily_count = self
                .store
                .incr_with_expiry(
                    &format!("{}d:{}", prefix, day),
                    clock::until(now, daily_reset_at).max(Duration::from_secs(1)),
                )
                .await?;

            if daily_count > i64::from(self.limits.daily_limit) {
                (DenyReason::DailyExceeded, daily_reset_at)
            } else {
                return Ok(RateDecision::Allowed);
            }
        };

        let mut retry_after = clock::until(now, reset_at);
        let violations = self.record_violation(user_id).await?;

        if let Some(ban) = self.penalty.ban_for(violations) {
            let until = self.extend_ban(user_id, clock::add(now, ban)).await?;
            retry_after = retry_after.max(clock::until(now, until));
            warn!(
                user_id,
                violations,
                ban_secs = ban.as_secs(),
                ban_until = %until,
                "User banned after repeated violations"
            );
        } else {
            warn!(user_id, violations, %reason, "Request throttled");
        }

        Ok(RateDecision::Denied {
            retry_after: retry_after.max(Duration::from_secs(1)),
            reason,
        })
    }

    /// Increment the violation counter and push its reset out by the cooldown.
    async fn record_violation(&self, user_id: u64) -> crate::Result<u32> {
        let key = format!("{}violations", Self::prefix(user_id));
        let cooldown = self.penalty.violation_cooldown;
        let count = self.store.incr_with_expiry(&key, cooldown).await?;
        self.store.expire(&key, cooldown).await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Raise the ban deadline to at least `candidate`, never lowering it.
    async fn extend_ban(&self, user_id: u64, candidate: DateTime<Utc>) -> crate::Result<DateTime<Utc>> {
        let key = format!("{}ban", Self::prefix(user_id));

        for _ in 0..8 {
            let current = self.read_ban(user_id).await?;
            let until = match &current {
                Some((_, existing)) if *existing >= candidate => return Ok(*existing),
                _ => candidate,
            };

            let ttl = clock::until(self.clock.now(), until).max(Duration::from_millis(1));
            let swapped = self
                .store
                .compare_and_swap(
                    &key,
                    current.as_ref().map(|(raw, _)| raw.as_str()),
                    &until.timestamp_millis().to_string(),
                    Some(ttl),
                )
                .await?;
            if swapped {
                return Ok(until);
            }
        }

        Err(QueueError::store_unavailable(
            "extend_ban",
            "ban deadline kept changing under contention",
        ))
    }

    /// Read the current state without recording a request.
    pub async fn inspect(&self, user_id: u64) -> crate::Result<RateLimitState> {
        let now = self.clock.now();
        let prefix = Self::prefix(user_id);
        let (window_index, window_reset_at) = self.window_bounds(now);
        let (day, daily_reset_at) = Self::day_bounds(now);

        let read_count = |raw: Option<String>| raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);

        let short_window_count =
            read_count(self.store.get(&format!("{}w:{}", prefix, window_index)).await?);
        let daily_count = read_count(self.store.get(&format!("{}d:{}", prefix, day)).await?);

        let violations_key = format!("{}violations", prefix);
        let violation_count = read_count(self.store.get(&violations_key).await?);
        let violations_reset_in = if violation_count > 0 {
            self.store.ttl(&violations_key).await?
        } else {
            None
        };

        let ban_until = self
            .read_ban(user_id)
            .await?
            .map(|(_, until)| until)
            .filter(|until| *until > now);

        Ok(RateLimitState {
            user_id,
            short_window_count,
            daily_count,
            window_reset_at,
            daily_reset_at,
            violation_count: u32::try_from(violation_count).unwrap_or(u32::MAX),
            violations_reset_in,
            ban_until,
        })
    }

    /// Clear every counter, violation and ban for a user.
    pub async fn pardon(&self, user_id: u64) -> crate::Result<u64> {
        let removed = self.store.delete_prefix(&Self::prefix(user_id)).await?;
        debug!(user_id, removed, "Pardoned user");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn fixture(window_limit: u32, daily_limit: u32) -> (Arc<ManualClock>, Arc<MemoryStore>, RateLimiter) {
        // Start just after a window boundary so tests do not straddle one
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = RateLimiter::with_clock(
            store.clone(),
            RateLimitConfig {
                window: Duration::from_secs(60),
                window_limit,
                daily_limit,
            },
            PenaltyConfig::default(),
            clock.clone(),
        );
        (clock, store, limiter)
    }

    #[tokio::test]
    async fn test_request_over_window_limit_is_denied() {
        let (_, _, limiter) = fixture(10, 100);
        for _ in 0..10 {
            assert!(limiter.check_and_record(1).await.unwrap().is_allowed());
        }

        match limiter.check_and_record(1).await.unwrap() {
            RateDecision::Denied { retry_after, reason } => {
                assert_eq!(reason, DenyReason::WindowExceeded);
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            RateDecision::Allowed => panic!("11th request should be denied"),
        }

        // Other users are unaffected
        assert!(limiter.check_and_record(2).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_window_resets_at_boundary() {
        let (clock, _, limiter) = fixture(2, 100);
        limiter.check_and_record(1).await.unwrap();
        limiter.check_and_record(1).await.unwrap();
        assert!(!limiter.check_and_record(1).await.unwrap().is_allowed());

        clock.advance(Duration::from_secs(60));
        assert!(limiter.check_and_record(1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_daily_limit() {
        let (clock, _, limiter) = fixture(100, 3);
        for _ in 0..3 {
            assert!(limiter.check_and_record(1).await.unwrap().is_allowed());
        }
        match limiter.check_and_record(1).await.unwrap() {
            RateDecision::Denied { reason, retry_after } => {
                assert_eq!(reason, DenyReason::DailyExceeded);
                assert!(retry_after > Duration::from_secs(11 * 3600));
            }
            RateDecision::Allowed => panic!("daily limit should apply"),
        }

        clock.advance(Duration::from_secs(12 * 3600));
        assert!(limiter.check_and_record(1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_fifth_violation_bans_with_first_tier() {
        let (_, _, limiter) = fixture(1, 100);
        assert!(limiter.check_and_record(1).await.unwrap().is_allowed());

        for _ in 0..4 {
            let decision = limiter.check_and_record(1).await.unwrap();
            assert!(matches!(
                decision,
                RateDecision::Denied {
                    reason: DenyReason::WindowExceeded,
                    ..
                }
            ));
        }
        assert!(limiter.inspect(1).await.unwrap().ban_until.is_none());

        match limiter.check_and_record(1).await.unwrap() {
            RateDecision::Denied { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            RateDecision::Allowed => panic!("should be banned"),
        }
        let state = limiter.inspect(1).await.unwrap();
        assert_eq!(state.violation_count, 5);
        assert!(state.ban_until.is_some());
    }

    #[tokio::test]
    async fn test_requests_during_ban_are_idempotent() {
        let (clock, _, limiter) = fixture(1, 100);
        for _ in 0..6 {
            limiter.check_and_record(1).await.unwrap();
        }
        let before = limiter.inspect(1).await.unwrap();

        clock.advance(Duration::from_secs(10));
        for _ in 0..5 {
            match limiter.check_and_record(1).await.unwrap() {
                RateDecision::Denied { reason, retry_after } => {
                    assert_eq!(reason, DenyReason::Banned);
                    assert_eq!(retry_after, Duration::from_secs(50));
                }
                RateDecision::Allowed => panic!("banned user allowed"),
            }
        }

        let after = limiter.inspect(1).await.unwrap();
        assert_eq!(after.violation_count, before.violation_count);
        assert_eq!(after.ban_until, before.ban_until);
        assert_eq!(after.short_window_count, before.short_window_count);
    }

    #[tokio::test]
    async fn test_ban_escalates_and_never_shrinks() {
        let (clock, _, limiter) = fixture(1, 1000);
        let tiers = [60u64, 300, 900, 3600, 3600];
        let mut last_ban = Duration::ZERO;

        // Burn the first four violations
        limiter.check_and_record(1).await.unwrap();
        for _ in 0..4 {
            limiter.check_and_record(1).await.unwrap();
        }

        for tier in tiers {
            let decision = limiter.check_and_record(1).await.unwrap();
            let RateDecision::Denied { retry_after, .. } = decision else {
                panic!("expected a ban");
            };
            assert_eq!(retry_after, Duration::from_secs(tier));
            assert!(retry_after >= last_ban);
            last_ban = retry_after;

            // Wait out the ban, then use up the fresh window's single slot
            clock.advance(retry_after);
            clock.advance(Duration::from_secs(60));
            assert!(limiter.check_and_record(1).await.unwrap().is_allowed());
        }
    }

    #[tokio::test]
    async fn test_violations_reset_after_cooldown() {
        let (clock, _, limiter) = fixture(1, 1000);
        limiter.check_and_record(1).await.unwrap();
        for _ in 0..3 {
            limiter.check_and_record(1).await.unwrap();
        }
        assert_eq!(limiter.inspect(1).await.unwrap().violation_count, 3);

        clock.advance(PenaltyConfig::default().violation_cooldown + Duration::from_secs(1));
        assert_eq!(limiter.inspect(1).await.unwrap().violation_count, 0);
    }

    #[tokio::test]
    async fn test_pardon_clears_everything() {
        let (_, _, limiter) = fixture(1, 100);
        for _ in 0..6 {
            limiter.check_and_record(1).await.unwrap();
        }
        assert!(limiter.pardon(1).await.unwrap() > 0);
        let state = limiter.inspect(1).await.unwrap();
        assert_eq!(state.violation_count, 0);
        assert!(state.ban_until.is_none());
        assert!(limiter.check_and_record(1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let (_, store, limiter) = fixture(10, 100);
        store.set_available(false);
        let err = limiter.check_and_record(1).await.unwrap_err();
        assert!(matches!(err, QueueError::StoreUnavailable { .. }));
    }

    #[test]
    fn test_denial_maps_to_error() {
        let decision = RateDecision::Denied {
            retry_after: Duration::from_secs(12),
            reason: DenyReason::WindowExceeded,
        };
        let err = decision.into_result(9).unwrap_err();
        assert_eq!(err.user_message(), "rate limited, retry in 12s");
    }
}
