//! # Probe Queue Library
//!
//! Queueing and resilience core for a distributed domain check service.
//!
//! Producers submit checks, workers pull them from a shared queue, and every
//! piece of cross-process coordination (claims, cached reports, single-flight
//! locks, rate-limit counters, batch records) goes through one injected
//! [`SharedStore`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use probe_queue_lib::{
//!     CommandProbe, Dispatcher, MemoryStore, QueueConfig, Services, Submission, Worker,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let services = Services::new(Arc::new(MemoryStore::new()), QueueConfig::default());
//!     let dispatcher = Dispatcher::new(services.clone());
//!     let worker = Worker::new(
//!         "w1",
//!         services.clone(),
//!         Arc::new(CommandProbe::new("tls-probe", ["{domain}:{port}"])),
//!     );
//!
//!     if let Submission::Queued(handle) = dispatcher.submit(42, "example.com", None).await? {
//!         worker.run_once().await?;
//!         let report = handle
//!             .wait(&services.queue, Duration::from_secs(5), Duration::from_millis(100))
//!             .await?;
//!         println!("{}", report);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **At-least-once queue**: visibility timeouts with automatic redelivery
//! - **Result cache**: TTL-bounded, degrades to a miss when the store fails
//! - **Single-flight locks**: one probe per fingerprint across all workers
//! - **Retries**: exponential backoff with jitter and a total time cap
//! - **Rate limiting**: window and daily counters with escalating bans
//! - **Batches**: sub-grouped dispatch with monotonic progress and deadlines

// Re-export main public API types and functions
pub use admin::{format_duration, Admin, HealthReport, WorkerHeartbeat};
pub use batch::{BatchCoordinator, BatchItem, BatchProgress, BatchRecord, ItemState};
pub use cache::{CacheEntry, ResultCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    load_env_config, parse_duration, BatchConfig, CacheConfig, ConfigManager, FileConfig,
    LockConfig, PenaltyConfig, QueueConfig, QueueSettings, RateLimitConfig, RetryConfig,
    StoreConfig,
};
pub use dispatch::{Dispatcher, JobHandle, Submission};
pub use error::QueueError;
pub use lock::{InFlightLock, InFlightMarker, Lease};
pub use prefs::{HistoryEntry, UserPrefs};
pub use probe::{classify_exit, CommandProbe, Probe};
pub use queue::{JobLease, JobQueue};
pub use rate_limit::{DenyReason, RateDecision, RateLimitState, RateLimiter};
pub use retry::{ProbeOutcome, RetryOrchestrator, RetryPolicy};
pub use services::Services;
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use store::{MemoryStore, SharedStore, StoreError, StoreResult};
pub use types::{
    CheckMode, CheckTarget, FailureKind, Fingerprint, Job, ProbeError, Report, ReportStatus,
    DEFAULT_PORT,
};
pub use utils::{extract_domains, parse_target, validate_domain, DomainInput, Extraction};
pub use worker::{ReportSource, WorkOutcome, Worker};

// Public modules
pub mod probe;
pub mod store;

// Internal modules - their types are re-exported above
mod admin;
mod batch;
mod cache;
mod clock;
mod config;
mod dispatch;
mod error;
mod lock;
mod prefs;
mod queue;
mod rate_limit;
mod retry;
mod services;
mod types;
mod utils;
mod worker;

// Type alias for convenience
pub type Result<T> = std::result::Result<T, QueueError>;

// Library version and metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");

/// Information about the library build and features
#[derive(Debug, Clone)]
pub struct LibraryInfo {
    pub version: &'static str,
    pub author: &'static str,
    pub features: Vec<&'static str>,
}

/// Get library information for debugging or display purposes.
pub fn info() -> LibraryInfo {
    LibraryInfo {
        version: VERSION,
        author: AUTHOR,
        features: enabled_features(),
    }
}

#[allow(clippy::vec_init_then_push)]
fn enabled_features() -> Vec<&'static str> {
    let mut features = Vec::new();

    #[cfg(feature = "redis")]
    features.push("redis");

    features
}
