//! Configuration file parsing and management.
//!
//! This module handles loading configuration from TOML files and `PQ_*`
//! environment variables, merging them with proper precedence rules, and
//! resolving the result into a validated [`QueueConfig`].
//!
//! Precedence, lowest first: built-in defaults, XDG config, global config,
//! local config (or an explicit `--config` file), environment, CLI flags.

use crate::error::QueueError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration loaded from TOML files or the environment.
///
/// Every field is optional so layers can be merged; durations are written as
/// strings such as `"500ms"`, `"30s"`, `"5m"`, `"1h"` or `"7d"`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty: Option<PenaltySection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueSection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockSection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreSection>,
}

/// `[rate_limit]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RateLimitSection {
    /// Short window length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,

    /// Requests allowed per short window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Requests allowed per UTC day
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u32>,
}

/// `[penalty]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PenaltySection {
    /// Ban durations, shortest first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban_table: Option<Vec<String>>,

    /// Violation count from which bans apply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_threshold: Option<u32>,

    /// Quiet period after which the violation count resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_cooldown: Option<String>,
}

/// `[cache]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

/// `[retry]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RetrySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time: Option<String>,

    /// Jitter fraction, e.g. 0.2 for ±20%
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_timeout: Option<String>,
}

/// `[queue]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct QueueSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility_timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_stale: Option<String>,
}

/// `[batch]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BatchSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// `[lock]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LockSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_ttl: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
}

/// `[store]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StoreSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

/// Merge two optional sections field by field, `higher` winning.
fn merge_section<T, F>(lower: Option<T>, higher: Option<T>, merge: F) -> Option<T>
where
    F: FnOnce(T, T) -> T,
{
    match (lower, higher) {
        (Some(lower), Some(higher)) => Some(merge(lower, higher)),
        (lower, higher) => higher.or(lower),
    }
}

impl FileConfig {
    /// Overlay `higher` on top of `self`.
    pub fn merge(self, higher: FileConfig) -> FileConfig {
        FileConfig {
            rate_limit: merge_section(self.rate_limit, higher.rate_limit, |l, h| {
                RateLimitSection {
                    window: h.window.or(l.window),
                    limit: h.limit.or(l.limit),
                    daily_limit: h.daily_limit.or(l.daily_limit),
                }
            }),
            penalty: merge_section(self.penalty, higher.penalty, |l, h| PenaltySection {
                ban_table: h.ban_table.or(l.ban_table),
                violation_threshold: h.violation_threshold.or(l.violation_threshold),
                violation_cooldown: h.violation_cooldown.or(l.violation_cooldown),
            }),
            cache: merge_section(self.cache, higher.cache, |l, h| CacheSection {
                ttl: h.ttl.or(l.ttl),
            }),
            retry: merge_section(self.retry, higher.retry, |l, h| RetrySection {
                max_retries: h.max_retries.or(l.max_retries),
                base_delay: h.base_delay.or(l.base_delay),
                max_delay: h.max_delay.or(l.max_delay),
                max_time: h.max_time.or(l.max_time),
                jitter: h.jitter.or(l.jitter),
                short_timeout: h.short_timeout.or(l.short_timeout),
                full_timeout: h.full_timeout.or(l.full_timeout),
            }),
            queue: merge_section(self.queue, higher.queue, |l, h| QueueSection {
                visibility_timeout: h.visibility_timeout.or(l.visibility_timeout),
                poll_interval: h.poll_interval.or(l.poll_interval),
                heartbeat_interval: h.heartbeat_interval.or(l.heartbeat_interval),
                heartbeat_stale: h.heartbeat_stale.or(l.heartbeat_stale),
            }),
            batch: merge_section(self.batch, higher.batch, |l, h| BatchSection {
                group_size: h.group_size.or(l.group_size),
                timeout: h.timeout.or(l.timeout),
            }),
            lock: merge_section(self.lock, higher.lock, |l, h| LockSection {
                lease_ttl: h.lease_ttl.or(l.lease_ttl),
                poll_interval: h.poll_interval.or(l.poll_interval),
            }),
            store: merge_section(self.store, higher.store, |l, h| StoreSection {
                redis_url: h.redis_url.or(l.redis_url),
                key_prefix: h.key_prefix.or(l.key_prefix),
            }),
        }
    }
}

/// Per-user request limits.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Length of the short fixed window
    pub window: Duration,
    /// Requests allowed per short window
    pub window_limit: u32,
    /// Requests allowed per UTC day
    pub daily_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            window_limit: 10,
            daily_limit: 100,
        }
    }
}

/// Progressive penalty escalation.
#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyConfig {
    /// Violations before the first ban
    pub violation_threshold: u32,
    /// Ban durations indexed by escalation step, shortest first
    pub ban_table: Vec<Duration>,
    /// Quiet period after which violations are forgotten
    pub violation_cooldown: Duration,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            violation_threshold: 5,
            ban_table: vec![
                Duration::from_secs(60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(60 * 60),
            ],
            violation_cooldown: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl PenaltyConfig {
    /// Ban for the given violation count, `None` while below the threshold.
    pub fn ban_for(&self, violations: u32) -> Option<Duration> {
        if violations < self.violation_threshold || self.ban_table.is_empty() {
            return None;
        }
        let step = (violations - self.violation_threshold) as usize;
        let index = step.min(self.ban_table.len() - 1);
        Some(self.ban_table[index])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Retry and timeout policy around probe invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Cap on any single backoff delay
    pub max_delay: Duration,
    /// Cap on total elapsed time across attempts
    pub max_time: Duration,
    /// Uniform jitter fraction applied to each delay
    pub jitter: f64,
    pub short_timeout: Duration,
    pub full_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_time: Duration::from_secs(300),
            jitter: 0.2,
            short_timeout: Duration::from_secs(30),
            full_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Per-attempt timeout for a check mode.
    pub fn attempt_timeout(&self, mode: crate::types::CheckMode) -> Duration {
        match mode {
            crate::types::CheckMode::Short => self.short_timeout,
            crate::types::CheckMode::Full => self.full_timeout,
        }
    }

    /// Longest a single job can spend in the retry loop.
    pub fn worst_case(&self) -> Duration {
        self.max_time + self.short_timeout.max(self.full_timeout)
    }
}

/// Queue delivery and worker loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// How long a claimed job stays invisible before redelivery
    pub visibility_timeout: Duration,
    /// Idle sleep between empty dequeues
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Heartbeats older than this count as stale
    pub heartbeat_stale: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(7 * 60),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_stale: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Items in flight per batch
    pub group_size: usize,
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            group_size: 3,
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockConfig {
    /// Expiry of an in-flight marker whose holder stopped responding
    pub lease_ttl: Duration,
    /// How often waiters look for the holder's result
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(7 * 60),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub redis_url: String,
    /// Namespace prepended to every key
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "pq:".to_string(),
        }
    }
}

/// Fully resolved configuration shared by every component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueConfig {
    pub rate_limit: RateLimitConfig,
    pub penalty: PenaltyConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub queue: QueueSettings,
    pub batch: BatchConfig,
    pub lock: LockConfig,
    pub store: StoreConfig,
}

fn duration_field(name: &str, value: &Option<String>, target: &mut Duration) -> Result<(), QueueError> {
    if let Some(raw) = value {
        *target = parse_duration(raw).ok_or_else(|| {
            QueueError::config(format!(
                "Invalid duration '{}' for {}. Use format like '500ms', '30s', '5m', '1h'",
                raw, name
            ))
        })?;
    }
    Ok(())
}

impl QueueConfig {
    /// Apply a merged configuration layer on top of the current values.
    pub fn apply(&mut self, layer: &FileConfig) -> Result<(), QueueError> {
        if let Some(rl) = &layer.rate_limit {
            duration_field("rate_limit.window", &rl.window, &mut self.rate_limit.window)?;
            if let Some(limit) = rl.limit {
                self.rate_limit.window_limit = limit;
            }
            if let Some(daily) = rl.daily_limit {
                self.rate_limit.daily_limit = daily;
            }
        }

        if let Some(penalty) = &layer.penalty {
            if let Some(table) = &penalty.ban_table {
                self.penalty.ban_table = table
                    .iter()
                    .map(|raw| {
                        parse_duration(raw).ok_or_else(|| {
                            QueueError::config(format!("Invalid ban duration '{}'", raw))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
            }
            if let Some(threshold) = penalty.violation_threshold {
                self.penalty.violation_threshold = threshold;
            }
            duration_field(
                "penalty.violation_cooldown",
                &penalty.violation_cooldown,
                &mut self.penalty.violation_cooldown,
            )?;
        }

        if let Some(cache) = &layer.cache {
            duration_field("cache.ttl", &cache.ttl, &mut self.cache.ttl)?;
        }

        if let Some(retry) = &layer.retry {
            if let Some(max) = retry.max_retries {
                self.retry.max_retries = max;
            }
            if let Some(jitter) = retry.jitter {
                self.retry.jitter = jitter;
            }
            duration_field("retry.base_delay", &retry.base_delay, &mut self.retry.base_delay)?;
            duration_field("retry.max_delay", &retry.max_delay, &mut self.retry.max_delay)?;
            duration_field("retry.max_time", &retry.max_time, &mut self.retry.max_time)?;
            duration_field(
                "retry.short_timeout",
                &retry.short_timeout,
                &mut self.retry.short_timeout,
            )?;
            duration_field(
                "retry.full_timeout",
                &retry.full_timeout,
                &mut self.retry.full_timeout,
            )?;
        }

        if let Some(queue) = &layer.queue {
            duration_field(
                "queue.visibility_timeout",
                &queue.visibility_timeout,
                &mut self.queue.visibility_timeout,
            )?;
            duration_field(
                "queue.poll_interval",
                &queue.poll_interval,
                &mut self.queue.poll_interval,
            )?;
            duration_field(
                "queue.heartbeat_interval",
                &queue.heartbeat_interval,
                &mut self.queue.heartbeat_interval,
            )?;
            duration_field(
                "queue.heartbeat_stale",
                &queue.heartbeat_stale,
                &mut self.queue.heartbeat_stale,
            )?;
        }

        if let Some(batch) = &layer.batch {
            if let Some(size) = batch.group_size {
                self.batch.group_size = size;
            }
            duration_field("batch.timeout", &batch.timeout, &mut self.batch.timeout)?;
        }

        if let Some(lock) = &layer.lock {
            duration_field("lock.lease_ttl", &lock.lease_ttl, &mut self.lock.lease_ttl)?;
            duration_field(
                "lock.poll_interval",
                &lock.poll_interval,
                &mut self.lock.poll_interval,
            )?;
        }

        if let Some(store) = &layer.store {
            if let Some(url) = &store.redis_url {
                self.store.redis_url = url.clone();
            }
            if let Some(prefix) = &store.key_prefix {
                self.store.key_prefix = prefix.clone();
            }
        }

        Ok(())
    }

    /// Defaults overlaid with the given layers, lowest precedence first, then validated.
    pub fn from_layers<'a, I>(layers: I) -> Result<Self, QueueError>
    where
        I: IntoIterator<Item = &'a FileConfig>,
    {
        let mut config = QueueConfig::default();
        for layer in layers {
            config.apply(layer)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would break limiter or retry invariants.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.rate_limit.window.is_zero() {
            return Err(QueueError::config("Rate limit window must be non-zero"));
        }
        if self.rate_limit.window_limit == 0 || self.rate_limit.daily_limit == 0 {
            return Err(QueueError::config("Rate limits must be at least 1"));
        }

        if self.penalty.ban_table.is_empty() {
            return Err(QueueError::config("Ban table cannot be empty"));
        }
        if self.penalty.ban_table.windows(2).any(|w| w[1] < w[0]) {
            return Err(QueueError::config(
                "Ban table must be ordered from shortest to longest",
            ));
        }
        if self.penalty.violation_threshold == 0 {
            return Err(QueueError::config("Violation threshold must be at least 1"));
        }
        let longest_ban = self.penalty.ban_table.iter().max().copied().unwrap_or_default();
        if self.penalty.violation_cooldown < longest_ban {
            return Err(QueueError::config(format!(
                "Violation cooldown ({:?}) must not be shorter than the longest ban ({:?})",
                self.penalty.violation_cooldown, longest_ban
            )));
        }

        if self.cache.ttl.is_zero() {
            return Err(QueueError::config("Cache TTL must be non-zero"));
        }

        if self.retry.max_retries == 0 {
            return Err(QueueError::config("max_retries must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(QueueError::config("Jitter must be in the range [0, 1)"));
        }
        if self.retry.short_timeout.is_zero() || self.retry.full_timeout.is_zero() {
            return Err(QueueError::config("Attempt timeouts must be non-zero"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(QueueError::config(
                "retry.max_delay must not be shorter than retry.base_delay",
            ));
        }

        if self.queue.visibility_timeout.is_zero() {
            return Err(QueueError::config("Visibility timeout must be non-zero"));
        }
        if self.batch.group_size == 0 {
            return Err(QueueError::config("Batch group size must be at least 1"));
        }
        if self.batch.timeout.is_zero() {
            return Err(QueueError::config("Batch timeout must be non-zero"));
        }
        if self.lock.lease_ttl.is_zero() {
            return Err(QueueError::config("Lease TTL must be non-zero"));
        }

        // A claim or lease that lapses mid-probe hands the job to a second worker
        let worst_case = self.retry.worst_case();
        if self.queue.visibility_timeout <= worst_case {
            return Err(QueueError::config(format!(
                "queue.visibility_timeout ({:?}) must exceed retry.max_time plus the longest attempt timeout ({:?})",
                self.queue.visibility_timeout, worst_case
            )));
        }
        if self.lock.lease_ttl <= worst_case {
            return Err(QueueError::config(format!(
                "lock.lease_ttl ({:?}) must exceed retry.max_time plus the longest attempt timeout ({:?})",
                self.lock.lease_ttl, worst_case
            )));
        }

        Ok(())
    }
}

/// Configuration discovery and loading functionality.
pub struct ConfigManager {
    /// Whether to report which config files were picked up
    pub verbose: bool,
}

impl ConfigManager {
    /// Create a new configuration manager.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Load configuration from a specific file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The parsed configuration or an error if parsing fails.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<FileConfig, QueueError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(QueueError::file_error(
                path.to_string_lossy(),
                "Configuration file not found",
            ));
        }

        let content = fs::read_to_string(path).map_err(|e| {
            QueueError::file_error(
                path.to_string_lossy(),
                format!("Failed to read configuration file: {}", e),
            )
        })?;

        let config: FileConfig = toml::from_str(&content).map_err(|e| QueueError::ConfigError {
            message: format!("Failed to parse TOML configuration: {}", e),
        })?;

        self.validate_config(&config)?;

        Ok(config)
    }

    /// Discover and load configuration files in precedence order.
    ///
    /// Looks for configuration files in standard locations and merges them
    /// according to precedence rules.
    pub fn discover_and_load(&self) -> Result<FileConfig, QueueError> {
        let mut merged_config = FileConfig::default();
        let mut loaded_files = Vec::new();

        let candidates = [
            self.get_xdg_config_path(),
            self.get_global_config_path(),
            self.get_local_config_path(),
        ];

        for path in candidates.into_iter().flatten() {
            match self.load_file(&path) {
                Ok(config) => {
                    merged_config = merged_config.merge(config);
                    loaded_files.push(path);
                }
                Err(e) => warn!("Skipping config file {}: {}", path.display(), e),
            }
        }

        if self.verbose {
            for path in &loaded_files {
                info!("Loaded config file {}", path.display());
            }
        } else {
            debug!(files = loaded_files.len(), "Config discovery finished");
        }

        Ok(merged_config)
    }

    /// Load every configuration source and resolve it.
    ///
    /// An explicit file replaces the local config in the precedence chain;
    /// environment variables are applied last.
    pub fn resolve(&self, explicit: Option<&Path>) -> Result<QueueConfig, QueueError> {
        let mut files = self.discover_and_load()?;
        if let Some(path) = explicit {
            files = files.merge(self.load_file(path)?);
        }
        let env = load_env_config(self.verbose);
        QueueConfig::from_layers([&files, &env])
    }

    /// Get the local configuration file path.
    fn get_local_config_path(&self) -> Option<PathBuf> {
        let candidates = ["./probe-queue.toml", "./.probe-queue.toml"];

        candidates
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
    }

    /// Get the global configuration file path.
    fn get_global_config_path(&self) -> Option<PathBuf> {
        let home = env::var_os("HOME")?;
        [".probe-queue.toml", "probe-queue.toml"]
            .iter()
            .map(|candidate| Path::new(&home).join(candidate))
            .find(|path| path.exists())
    }

    /// Get the XDG configuration file path.
    fn get_xdg_config_path(&self) -> Option<PathBuf> {
        let config_dir = env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| Path::new(&home).join(".config")))?;

        let path = config_dir.join("probe-queue").join("config.toml");
        if path.exists() {
            Some(path)
        } else {
            None
        }
    }

    /// Validate a configuration for format issues before it is merged.
    fn validate_config(&self, config: &FileConfig) -> Result<(), QueueError> {
        let mut durations: Vec<(&str, &Option<String>)> = Vec::new();
        if let Some(rl) = &config.rate_limit {
            durations.push(("rate_limit.window", &rl.window));
        }
        if let Some(p) = &config.penalty {
            durations.push(("penalty.violation_cooldown", &p.violation_cooldown));
            if let Some(table) = &p.ban_table {
                if table.is_empty() {
                    return Err(QueueError::config("penalty.ban_table cannot be empty"));
                }
            }
        }
        if let Some(c) = &config.cache {
            durations.push(("cache.ttl", &c.ttl));
        }
        if let Some(r) = &config.retry {
            durations.push(("retry.base_delay", &r.base_delay));
            durations.push(("retry.max_delay", &r.max_delay));
            durations.push(("retry.max_time", &r.max_time));
            durations.push(("retry.short_timeout", &r.short_timeout));
            durations.push(("retry.full_timeout", &r.full_timeout));
        }
        if let Some(q) = &config.queue {
            durations.push(("queue.visibility_timeout", &q.visibility_timeout));
            durations.push(("queue.poll_interval", &q.poll_interval));
        }
        if let Some(b) = &config.batch {
            durations.push(("batch.timeout", &b.timeout));
            if b.group_size == Some(0) {
                return Err(QueueError::config("batch.group_size must be at least 1"));
            }
        }
        if let Some(l) = &config.lock {
            durations.push(("lock.lease_ttl", &l.lease_ttl));
        }

        for (name, value) in durations {
            if let Some(raw) = value {
                if parse_duration(raw).is_none() {
                    return Err(QueueError::ConfigError {
                        message: format!(
                            "Invalid duration '{}' for {}. Use format like '30s', '5m', '1h'",
                            raw, name
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Load configuration from `PQ_*` environment variables.
///
/// Invalid values are logged as warnings and ignored.
pub fn load_env_config(verbose: bool) -> FileConfig {
    env_config_from(|name| env::var(name).ok(), verbose)
}

fn env_duration<F>(lookup: &F, name: &str, verbose: bool) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    if parse_duration(&raw).is_some() {
        if verbose {
            info!("Using {}={}", name, raw);
        }
        Some(raw)
    } else {
        warn!("Invalid {}='{}', use format like '30s', '5m', '1h'", name, raw);
        None
    }
}

fn env_number<T, F>(lookup: &F, name: &str, verbose: bool) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => {
            if verbose {
                info!("Using {}={}", name, raw);
            }
            Some(value)
        }
        Err(_) => {
            warn!("Invalid {}='{}', expected a number", name, raw);
            None
        }
    }
}

fn env_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).filter(|v| !v.trim().is_empty())
}

fn some_section<T: Default + PartialEq>(section: T) -> Option<T> {
    if section == T::default() {
        None
    } else {
        Some(section)
    }
}

fn env_config_from<F>(lookup: F, verbose: bool) -> FileConfig
where
    F: Fn(&str) -> Option<String>,
{
    let ban_table = lookup("PQ_BAN_TABLE").and_then(|raw| {
        let entries: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !entries.is_empty() && entries.iter().all(|e| parse_duration(e).is_some()) {
            Some(entries)
        } else {
            warn!("Invalid PQ_BAN_TABLE='{}', use a list like '1m,5m,15m,60m'", raw);
            None
        }
    });

    FileConfig {
        rate_limit: some_section(RateLimitSection {
            window: env_duration(&lookup, "PQ_RATE_WINDOW", verbose),
            limit: env_number(&lookup, "PQ_RATE_LIMIT", verbose),
            daily_limit: env_number(&lookup, "PQ_DAILY_LIMIT", verbose),
        }),
        penalty: some_section(PenaltySection {
            ban_table,
            violation_threshold: env_number(&lookup, "PQ_VIOLATION_THRESHOLD", verbose),
            violation_cooldown: env_duration(&lookup, "PQ_VIOLATION_COOLDOWN", verbose),
        }),
        cache: some_section(CacheSection {
            ttl: env_duration(&lookup, "PQ_CACHE_TTL", verbose),
        }),
        retry: some_section(RetrySection {
            max_retries: env_number(&lookup, "PQ_MAX_RETRIES", verbose),
            base_delay: env_duration(&lookup, "PQ_BASE_DELAY", verbose),
            max_delay: env_duration(&lookup, "PQ_MAX_DELAY", verbose),
            max_time: env_duration(&lookup, "PQ_MAX_TIME", verbose),
            jitter: env_number(&lookup, "PQ_JITTER", verbose),
            short_timeout: env_duration(&lookup, "PQ_SHORT_TIMEOUT", verbose),
            full_timeout: env_duration(&lookup, "PQ_FULL_TIMEOUT", verbose),
        }),
        queue: some_section(QueueSection {
            visibility_timeout: env_duration(&lookup, "PQ_VISIBILITY_TIMEOUT", verbose),
            ..Default::default()
        }),
        batch: some_section(BatchSection {
            group_size: env_number(&lookup, "PQ_BATCH_GROUP_SIZE", verbose),
            timeout: env_duration(&lookup, "PQ_BATCH_TIMEOUT", verbose),
        }),
        lock: some_section(LockSection {
            lease_ttl: env_duration(&lookup, "PQ_LEASE_TTL", verbose),
            ..Default::default()
        }),
        store: some_section(StoreSection {
            redis_url: env_string(&lookup, "PQ_REDIS_URL"),
            key_prefix: env_string(&lookup, "PQ_KEY_PREFIX"),
        }),
    }
}

/// Parse a duration string like "500ms", "5s", "2m", "1h" or "7d".
///
/// A bare number is read as seconds. Returns `None` if parsing fails.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim().to_lowercase();

    if let Some(ms) = input.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(s) = input.strip_suffix('s') {
        s.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(m) = input.strip_suffix('m') {
        m.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(h) = input.strip_suffix('h') {
        h.trim()
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(60 * 60))
            .map(Duration::from_secs)
    } else if let Some(d) = input.strip_suffix('d') {
        d.trim()
            .parse::<u64>()
            .ok()
            .and_then(|d| d.checked_mul(24 * 60 * 60))
            .map(Duration::from_secs)
    } else {
        input.parse::<u64>().ok().map(Duration::from_secs)
    }
}
