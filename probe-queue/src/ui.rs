//! Human-readable output for probe-queue.
//!
//! Colored report lines, batch tables, health and rate-limit summaries, and
//! a spinner for `submit --wait`. JSON output bypasses this module.

use console::{pad_str, style, Alignment, Term};
use probe_queue_lib::{BatchRecord, HealthReport, ItemState, RateLimitState, Report, ReportStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Spinner ──────────────────────────────────────────────────────────────────

const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// An async braille-dot spinner that writes to stderr so stdout stays clean.
pub struct Spinner {
    running: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Spinner {
    /// Start a spinner, or nothing at all when stderr is not a terminal.
    pub fn start(message: String) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        if !Term::stderr().is_term() {
            return Self {
                running,
                handle: None,
            };
        }

        let running_clone = running.clone();
        let handle = tokio::spawn(async move {
            let term = Term::stderr();
            let mut idx = 0usize;
            while running_clone.load(Ordering::Relaxed) {
                let frame = SPINNER_FRAMES[idx % SPINNER_FRAMES.len()];
                let _ = term.clear_line();
                let _ = term.write_str(&format!("{} {}", style(frame).cyan(), message));
                idx += 1;
                tokio::time::sleep(Duration::from_millis(80)).await;
            }
            let _ = term.clear_line();
        });

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Stop the spinner and clear the line.
    pub async fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.await;
        }
    }
}

// ── Reports ──────────────────────────────────────────────────────────────────

/// Print one report with a status marker.
pub fn print_report(report: &Report) {
    match &report.status {
        ReportStatus::Completed { body } => {
            println!(
                "{} {} {}",
                style("✓").green().bold(),
                style(report.fingerprint.as_str()).bold(),
                style(format!(
                    "({} attempt{})",
                    report.attempts,
                    plural(report.attempts as usize)
                ))
                .dim(),
            );
            for line in body.lines() {
                println!("  {}", line);
            }
        }
        ReportStatus::Failed { kind, reason } => {
            println!(
                "{} {} {}",
                style("✗").red().bold(),
                style(report.fingerprint.as_str()).bold(),
                style(format!("unreachable: {}", kind)).red(),
            );
            println!("  {}", style(reason).dim());
        }
    }
}

/// Print a batch with one line per item.
pub fn print_batch(record: &BatchRecord) {
    let progress = record.progress();
    let state = if record.finished {
        style("finished").green()
    } else {
        style("running").yellow()
    };
    println!(
        "{} {} {} {}",
        style("Batch").bold(),
        style(&record.batch_id).cyan(),
        style(format!("[{}]", progress)).bold(),
        state,
    );
    if progress.failed > 0 {
        println!("  {}", style(format!("{} failed", progress.failed)).red());
    }

    for item in &record.items {
        let name = pad_str(item.fingerprint.as_str(), 36, Alignment::Left, None);
        let status = match &item.state {
            ItemState::Pending => style("pending".to_string()).dim(),
            ItemState::Dispatched { .. } => style("checking".to_string()).yellow(),
            ItemState::Resolved { report } if report.is_error() => {
                style(report.headline()).red()
            }
            ItemState::Resolved { report } => style(report.headline()).green(),
            ItemState::TimedOut => style("timed out".to_string()).red(),
        };
        println!("  {} {}", name, status);
    }
}

// ── Admin ────────────────────────────────────────────────────────────────────

pub fn print_health(report: &HealthReport) {
    let verdict = if report.is_healthy() {
        style("HEALTHY").green().bold()
    } else {
        style("UNHEALTHY").red().bold()
    };
    println!("{} {}", style("probe-queue").bold(), verdict);
    println!("{}", report);
}

pub fn print_rate_state(state: &RateLimitState) {
    let banned = state.ban_until.is_some();
    println!("{}", state);
    if banned {
        println!("  {}", style("Use `admin pardon` to lift the ban").dim());
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}
