//! Probe boundary.
//!
//! The network checks themselves live outside this crate. A [`Probe`] runs
//! one attempt against a target and classifies its own failures, so nothing
//! downstream inspects error text.

use crate::types::{CheckTarget, FailureKind, ProbeError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// One probe attempt against a target.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Run the check and return the rendered report body.
    async fn probe(&self, target: &CheckTarget) -> Result<String, ProbeError>;
}

/// sysexits `EX_DATAERR`: input can never be probed.
pub const EXIT_MALFORMED: i32 = 65;
/// sysexits `EX_TEMPFAIL`: try again later.
pub const EXIT_TEMPFAIL: i32 = 75;
/// sysexits `EX_PROTOCOL`: remote speaks something unsupported.
pub const EXIT_PROTOCOL: i32 = 76;

/// Probe that runs an external program per attempt.
///
/// Arguments may contain `{domain}`, `{port}` and `{mode}` placeholders. The
/// program prints the report on stdout and signals failures with sysexits
/// codes; any other non-zero exit is treated as a transient connection
/// failure. A program that cannot be started is reported as
/// [`ProbeError::Unavailable`]. The child is killed if the attempt is
/// cancelled.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn render_args(&self, target: &CheckTarget) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{domain}", &target.domain)
                    .replace("{port}", &target.port.to_string())
                    .replace("{mode}", target.mode.as_str())
            })
            .collect()
    }
}

/// Map a probe program's exit code to a failure kind.
pub fn classify_exit(code: Option<i32>) -> FailureKind {
    match code {
        Some(EXIT_MALFORMED) => FailureKind::MalformedInput,
        Some(EXIT_TEMPFAIL) => FailureKind::TemporaryResolution,
        Some(EXIT_PROTOCOL) => FailureKind::ProtocolMismatch,
        _ => FailureKind::ConnectionReset,
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn probe(&self, target: &CheckTarget) -> Result<String, ProbeError> {
        let args = self.render_args(target);
        debug!(program = %self.program, ?args, "Running probe command");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ProbeError::unavailable(format!("failed to start probe '{}': {}", self.program, e))
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string());
        }

        let kind = classify_exit(output.status.code());
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("probe exited with {}", output.status)
        } else {
            stderr
        };
        Err(ProbeError::new(kind, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckMode;

    fn target() -> CheckTarget {
        CheckTarget::new("example.com", 8443, CheckMode::Full)
    }

    #[test]
    fn test_exit_code_classification() {
        assert_eq!(classify_exit(Some(65)), FailureKind::MalformedInput);
        assert_eq!(classify_exit(Some(75)), FailureKind::TemporaryResolution);
        assert_eq!(classify_exit(Some(76)), FailureKind::ProtocolMismatch);
        assert_eq!(classify_exit(Some(1)), FailureKind::ConnectionReset);
        assert_eq!(classify_exit(None), FailureKind::ConnectionReset);
        assert!(classify_exit(Some(75)).is_transient());
        assert!(!classify_exit(Some(65)).is_transient());
    }

    #[test]
    fn test_placeholders() {
        let probe = CommandProbe::new("check", ["--host={domain}", "-p", "{port}", "{mode}"]);
        assert_eq!(
            probe.render_args(&target()),
            vec!["--host=example.com", "-p", "8443", "full"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_success_returns_stdout() {
        let probe = CommandProbe::new("sh", ["-c", "echo \"$0 ok\"", "{domain}"]);
        assert_eq!(probe.probe(&target()).await.unwrap(), "example.com ok");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_failure_is_classified() {
        let probe = CommandProbe::new("sh", ["-c", "echo bad name >&2; exit 65"]);
        let err = probe.probe(&target()).await.unwrap_err();
        assert_eq!(
            err,
            ProbeError::new(FailureKind::MalformedInput, "bad name")
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable_not_a_target_failure() {
        let probe = CommandProbe::new("/nonexistent/probe-binary", Vec::<String>::new());
        let err = probe.probe(&target()).await.unwrap_err();
        assert!(matches!(err, ProbeError::Unavailable { .. }));
        assert_eq!(err.kind(), None);
    }
}
