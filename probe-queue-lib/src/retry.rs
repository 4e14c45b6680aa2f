//! Retry orchestration around probe invocations.
//!
//! Each attempt runs under a per-mode timeout. Transient failures back off
//! exponentially with jitter; permanent failures return immediately. The
//! whole sequence is capped by `max_time`.

use crate::config::RetryConfig;
use crate::error::QueueError;
use crate::types::{CheckTarget, FailureKind, ProbeError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Successful probe output.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub body: String,
    /// Attempts spent, including the successful one
    pub attempts: u32,
}

/// Retry policy derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap on a single backoff delay, applied before jitter
    pub max_delay: Duration,
    pub max_time: Duration,
    /// Uniform jitter fraction in `[0, 1)`
    pub jitter: f64,
    pub short_timeout: Duration,
    pub full_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_time: config.max_time,
            jitter: config.jitter,
            short_timeout: config.short_timeout,
            full_timeout: config.full_timeout,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` is 1-indexed.
    ///
    /// `min(base_delay * 2^(attempt-1), max_delay) * (1 + u)` with `u`
    /// uniform in `±jitter`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter <= 0.0 {
            return exp_delay;
        }

        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        exp_delay.mul_f64(factor.max(0.0))
    }

    pub fn attempt_timeout(&self, target: &CheckTarget) -> Duration {
        match target.mode {
            crate::types::CheckMode::Short => self.short_timeout,
            crate::types::CheckMode::Full => self.full_timeout,
        }
    }
}

/// Runs probe attempts according to a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryOrchestrator {
    policy: RetryPolicy,
}

impl RetryOrchestrator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `probe` until it succeeds, fails permanently, or the policy
    /// runs out of attempts or time.
    ///
    /// The closure receives the 1-indexed attempt number. Exhausted transient
    /// failures surface as [`QueueError::TransientProbe`], permanent ones as
    /// [`QueueError::PermanentProbe`]. A probe that cannot run at all returns
    /// [`QueueError::ProbeUnavailable`] without retrying.
    pub async fn execute<F, Fut>(
        &self,
        target: &CheckTarget,
        mut probe: F,
    ) -> Result<ProbeOutcome, QueueError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<String, ProbeError>>,
    {
        let started = Instant::now();
        let attempt_timeout = self.policy.attempt_timeout(target);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(%target, attempt, "Starting probe attempt");

            let result = match tokio::time::timeout(attempt_timeout, probe(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::timeout(format!(
                    "no answer within {}s",
                    attempt_timeout.as_secs_f64()
                ))),
            };

            let err = match result {
                Ok(body) => {
                    debug!(%target, attempt, "Probe succeeded");
                    return Ok(ProbeOutcome {
                        body,
                        attempts: attempt,
                    });
                }
                Err(err) => err,
            };

            let (kind, message) = match err {
                ProbeError::Unavailable { message } => {
                    error!(%target, attempt, error = %message, "Probe could not run");
                    return Err(QueueError::ProbeUnavailable {
                        target: target.to_string(),
                        message,
                    });
                }
                ProbeError::Failed { kind, message } => (kind, message),
            };

            if !kind.is_transient() {
                error!(%target, attempt, ?kind, error = %message, "Permanent probe failure");
                return Err(QueueError::PermanentProbe {
                    target: target.to_string(),
                    kind,
                    attempts: attempt,
                    message,
                });
            }

            if attempt >= self.policy.max_attempts {
                return Err(self.exhausted(target, kind, message, attempt));
            }

            let delay = self.policy.delay_for_attempt(attempt);
            let elapsed = started.elapsed();
            if elapsed + delay >= self.policy.max_time {
                warn!(
                    %target,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Retry budget exhausted before next attempt"
                );
                return Err(self.exhausted(target, kind, message, attempt));
            }

            warn!(
                %target,
                attempt,
                max = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                ?kind,
                error = %message,
                "Retrying after transient error"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn exhausted(
        &self,
        target: &CheckTarget,
        kind: FailureKind,
        message: String,
        attempts: u32,
    ) -> QueueError {
        error!(%target, attempts, ?kind, "Probe failed after retries");
        QueueError::TransientProbe {
            target: target.to_string(),
            kind,
            attempts,
            message,
        }
    }
}

/// Failure kind carried by a probe error, if any.
pub fn failure_kind(err: &QueueError) -> Option<FailureKind> {
    match err {
        QueueError::TransientProbe { kind, .. } | QueueError::PermanentProbe { kind, .. } => {
            Some(*kind)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckMode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_time: Duration::from_secs(300),
            jitter: 0.0,
            short_timeout: Duration::from_secs(30),
            full_timeout: Duration::from_secs(60),
        }
    }

    fn target() -> CheckTarget {
        CheckTarget::new("example.com", 443, CheckMode::Short)
    }

    #[test]
    fn test_delay_doubles() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_capped_by_max_delay() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..policy()
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));

        let jittered = RetryPolicy {
            jitter: 0.2,
            ..policy
        };
        for _ in 0..64 {
            assert!(jittered.delay_for_attempt(10) <= Duration::from_secs(6));
        }
    }

    #[test]
    fn test_delay_jitter_stays_in_band() {
        let policy = RetryPolicy {
            jitter: 0.2,
            ..policy()
        };
        for _ in 0..64 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(3200));
            assert!(delay <= Duration::from_millis(4800));
        }
    }

    #[test]
    fn test_timeout_scales_with_mode() {
        let policy = policy();
        assert_eq!(policy.attempt_timeout(&target()), Duration::from_secs(30));
        let full = CheckTarget::new("example.com", 443, CheckMode::Full);
        assert_eq!(policy.attempt_timeout(&full), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let orchestrator = RetryOrchestrator::new(policy());
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = orchestrator
            .execute(&target(), |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProbeError::new(FailureKind::ConnectionReset, "reset"))
                    } else {
                        Ok("report".to_string())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.body, "report");
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_timing_out_probe_runs_max_attempts() {
        let orchestrator = RetryOrchestrator::new(policy());
        let calls = Arc::new(AtomicU32::new(0));

        let err = orchestrator
            .execute(&target(), |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("never".to_string())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            QueueError::TransientProbe { kind, attempts, .. } => {
                assert_eq!(kind, FailureKind::Timeout);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let orchestrator = RetryOrchestrator::new(policy());
        let calls = Arc::new(AtomicU32::new(0));

        let err = orchestrator
            .execute(&target(), |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(ProbeError::new(FailureKind::CertificateParse, "bad DER"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            QueueError::PermanentProbe { attempts: 1, .. }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_reports_attempts_spent() {
        let orchestrator = RetryOrchestrator::new(policy());
        let calls = Arc::new(AtomicU32::new(0));

        let err = orchestrator
            .execute(&target(), |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err::<String, _>(ProbeError::new(FailureKind::ConnectionReset, "reset"))
                    } else {
                        Err(ProbeError::new(FailureKind::ProtocolMismatch, "no TLS"))
                    }
                }
            })
            .await
            .unwrap_err();

        match err {
            QueueError::PermanentProbe { kind, attempts, .. } => {
                assert_eq!(kind, FailureKind::ProtocolMismatch);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_probe_is_not_retried() {
        let orchestrator = RetryOrchestrator::new(policy());
        let calls = Arc::new(AtomicU32::new(0));

        let err = orchestrator
            .execute(&target(), |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(ProbeError::unavailable("No such file or directory"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, QueueError::ProbeUnavailable { .. }));
        assert_eq!(failure_kind(&err), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_time_bounded_by_max_time() {
        let policy = RetryPolicy {
            max_attempts: 10,
            max_time: Duration::from_secs(100),
            ..policy()
        };
        let orchestrator = RetryOrchestrator::new(policy);
        let started = Instant::now();

        let err = orchestrator
            .execute(&target(), |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("never".to_string())
            })
            .await
            .unwrap_err();

        // Attempts end at 30s, 62s and 96s; waiting another 8s would cross 100s
        assert!(started.elapsed() <= Duration::from_secs(100) + Duration::from_secs(30));
        assert!(matches!(err, QueueError::TransientProbe { attempts: 3, .. }));
    }
}
