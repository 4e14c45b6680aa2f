//! Core data types for queued domain checks.
//!
//! This module defines the structures that travel through the shared store:
//! jobs, fingerprints, reports and the typed failure classification produced
//! at the probe boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Port probed when a submission does not name one.
pub const DEFAULT_PORT: u16 = 443;

/// How much work a check performs.
///
/// Full mode runs every sub-check and gets a longer per-attempt timeout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    /// Condensed report (default)
    #[default]
    Short,
    /// Every sub-check
    Full,
}

impl CheckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckMode::Short => "short",
            CheckMode::Full => "full",
        }
    }
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "short" => Ok(CheckMode::Short),
            "full" => Ok(CheckMode::Full),
            other => Err(format!("unknown check mode '{}', use short/full", other)),
        }
    }
}

/// What a probe is asked to inspect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CheckTarget {
    pub domain: String,
    pub port: u16,
    pub mode: CheckMode,
}

impl CheckTarget {
    pub fn new<D: Into<String>>(domain: D, port: u16, mode: CheckMode) -> Self {
        Self {
            domain: domain.into(),
            port,
            mode,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.domain, self.port, self.mode)
    }
}

impl fmt::Display for CheckTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.port)
    }
}

/// Cache and lock key identifying interchangeable checks.
///
/// Formatted as `{domain}:{port}:{mode}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(domain: &str, port: u16, mode: CheckMode) -> Self {
        Self(format!("{}:{}:{}", domain.to_lowercase(), port, mode))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work owned by the queue until a worker claims it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job identifier
    pub id: String,

    /// Opaque numeric user identifier of the submitter
    pub requester_id: u64,

    pub domain: String,
    pub port: u16,
    pub mode: CheckMode,
    pub submitted_at: DateTime<Utc>,

    /// Number of times a worker has claimed this job
    #[serde(rename = "attempts", default)]
    pub attempt_count: u32,

    /// Batch this job belongs to, if it came from a multi-domain submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl Job {
    pub fn new<D: Into<String>>(requester_id: u64, domain: D, port: u16, mode: CheckMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            requester_id,
            domain: domain.into(),
            port,
            mode,
            submitted_at: Utc::now(),
            attempt_count: 0,
            batch_id: None,
        }
    }

    /// Attach the job to a batch.
    pub fn in_batch<B: Into<String>>(mut self, batch_id: B) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn target(&self) -> CheckTarget {
        CheckTarget::new(self.domain.clone(), self.port, self.mode)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.domain, self.port, self.mode)
    }
}

/// Typed classification of probe failures.
///
/// Produced by the probe boundary itself so nothing downstream has to
/// inspect error text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An attempt exceeded its timeout
    Timeout,
    /// The peer reset or refused the connection
    ConnectionReset,
    /// Name resolution failed in a way that may succeed later
    TemporaryResolution,
    /// The input can never be probed (bad hostname, bad port)
    MalformedInput,
    /// A certificate could not be parsed, independent of the network
    CertificateParse,
    /// The remote speaks something the probe cannot negotiate
    ProtocolMismatch,
}

impl FailureKind {
    /// Transient failures are retried; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::ConnectionReset | FailureKind::TemporaryResolution
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionReset => "connection reset",
            FailureKind::TemporaryResolution => "temporary resolution failure",
            FailureKind::MalformedInput => "malformed input",
            FailureKind::CertificateParse => "certificate parse error",
            FailureKind::ProtocolMismatch => "protocol mismatch",
        };
        f.write_str(label)
    }
}

/// Failure reported by a single probe attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProbeError {
    /// The check ran and the target failed it
    #[error("{kind}: {message}")]
    Failed { kind: FailureKind, message: String },

    /// The probe itself could not run on this worker (missing program,
    /// exhausted process or file limits). Not a property of the target.
    #[error("probe unavailable: {message}")]
    Unavailable { message: String },
}

impl ProbeError {
    pub fn new<M: Into<String>>(kind: FailureKind, message: M) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout<M: Into<String>>(message: M) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn unavailable<M: Into<String>>(message: M) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Failure kind of the target, `None` when the probe could not run.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_some_and(|kind| kind.is_transient())
    }
}

/// Outcome stored for a fingerprint, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportStatus {
    /// The probe finished and produced a report body
    Completed { body: String },
    /// The probe failed terminally
    Failed { kind: FailureKind, reason: String },
}

/// Result of a check, as published to the cache and result slots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub fingerprint: Fingerprint,
    #[serde(flatten)]
    pub status: ReportStatus,
    pub computed_at: DateTime<Utc>,

    /// Probe attempts spent producing this report
    pub attempts: u32,
}

impl Report {
    pub fn completed<B: Into<String>>(fingerprint: Fingerprint, body: B, attempts: u32) -> Self {
        Self {
            fingerprint,
            status: ReportStatus::Completed { body: body.into() },
            computed_at: Utc::now(),
            attempts,
        }
    }

    pub fn failed<R: Into<String>>(
        fingerprint: Fingerprint,
        kind: FailureKind,
        reason: R,
        attempts: u32,
    ) -> Self {
        Self {
            fingerprint,
            status: ReportStatus::Failed {
                kind,
                reason: reason.into(),
            },
            computed_at: Utc::now(),
            attempts,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, ReportStatus::Failed { .. })
    }

    /// First line of the report, used for history entries and summaries.
    pub fn headline(&self) -> String {
        match &self.status {
            ReportStatus::Completed { body } => body.lines().next().unwrap_or("").to_string(),
            ReportStatus::Failed { kind, .. } => format!("unreachable ({})", kind),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            ReportStatus::Completed { body } => f.write_str(body),
            ReportStatus::Failed { kind, reason } => {
                write!(f, "{} is unreachable: {} ({})", self.fingerprint, reason, kind)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = Fingerprint::new("Example.COM", 443, CheckMode::Full);
        assert_eq!(fp.as_str(), "example.com:443:full");
    }

    #[test]
    fn test_equal_targets_share_fingerprint() {
        let a = Job::new(1, "example.com", 443, CheckMode::Short);
        let b = Job::new(2, "example.com", 443, CheckMode::Short);
        assert_ne!(a.id, b.id);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(
            a.fingerprint(),
            Job::new(1, "example.com", 8443, CheckMode::Short).fingerprint()
        );
    }

    #[test]
    fn test_job_wire_format_uses_attempts() {
        let job = Job::new(42, "example.com", 443, CheckMode::Short);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["attempts"], 0);
        assert_eq!(json["mode"], "short");
        assert!(json.get("batch_id").is_none());
    }

    #[test]
    fn test_failure_kind_classification() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(FailureKind::ConnectionReset.is_transient());
        assert!(FailureKind::TemporaryResolution.is_transient());
        assert!(!FailureKind::MalformedInput.is_transient());
        assert!(!FailureKind::CertificateParse.is_transient());
        assert!(!FailureKind::ProtocolMismatch.is_transient());
    }

    #[test]
    fn test_unavailable_probe_has_no_kind() {
        let err = ProbeError::unavailable("No such file or directory");
        assert_eq!(err.kind(), None);
        assert!(!err.is_transient());
        assert_eq!(
            ProbeError::new(FailureKind::ConnectionReset, "reset").kind(),
            Some(FailureKind::ConnectionReset)
        );
    }

    #[test]
    fn test_error_report_headline() {
        let fp = Fingerprint::new("down.example", 443, CheckMode::Short);
        let report = Report::failed(fp, FailureKind::Timeout, "no answer", 3);
        assert!(report.is_error());
        assert_eq!(report.headline(), "unreachable (timeout)");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("FULL".parse::<CheckMode>(), Ok(CheckMode::Full));
        assert!("medium".parse::<CheckMode>().is_err());
    }
}
