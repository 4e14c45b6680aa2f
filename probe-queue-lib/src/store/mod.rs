//! Shared store abstraction.
//!
//! Every cross-process piece of state (queue lists, claims, cache entries,
//! locks, rate-limit counters, batch records) lives behind [`SharedStore`].
//! Components receive an `Arc<dyn SharedStore>` explicitly, so production
//! runs against Redis while tests substitute [`MemoryStore`].
//!
//! The trait only exposes primitives that are atomic on their own:
//! conditional set, compare-and-swap, increment-with-expiry, and the
//! claim moves used for visibility timeouts.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a store backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or command rejected.
    #[error("store unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },

    /// A key holds something the operation cannot interpret.
    #[error("corrupt value at '{key}': {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    pub fn unavailable<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn corrupt<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Low-latency shared data store used as the only coordination substrate.
///
/// Implementations must make each method atomic with respect to every other
/// caller, across processes.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Round-trip to the backend.
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditional write, optionally expiring.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Replace the value if it currently equals `expected` (`None` = absent).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Delete the key only if it currently equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Reset the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining lifetime, `None` if the key is absent or never expires.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Increment a counter; the expiry is applied only when the counter is created.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Delete every key starting with `prefix`, returning how many went away.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64>;

    /// Append to a list, returning its new length.
    async fn push_back(&self, list: &str, value: &str) -> StoreResult<u64>;

    /// Prepend to a list, returning its new length.
    async fn push_front(&self, list: &str, value: &str) -> StoreResult<u64>;

    async fn list_len(&self, list: &str) -> StoreResult<u64>;

    /// Items `start..=stop` of a list.
    async fn list_range(&self, list: &str, start: usize, stop: usize) -> StoreResult<Vec<String>>;

    /// Keep only the first `keep` items of a list.
    async fn list_trim(&self, list: &str, keep: usize) -> StoreResult<()>;

    /// Remove and return every item of a list in one step.
    async fn drain_list(&self, list: &str) -> StoreResult<Vec<String>>;

    /// Pop the head of `list` and record it in `claims` with `deadline_ms`.
    async fn claim_next(
        &self,
        list: &str,
        claims: &str,
        deadline_ms: i64,
    ) -> StoreResult<Option<String>>;

    /// Move every claim whose deadline is at or before `now_ms` back onto `list`.
    async fn reclaim_expired(
        &self,
        claims: &str,
        list: &str,
        now_ms: i64,
    ) -> StoreResult<Vec<String>>;

    /// Drop a claim while it still carries `deadline_ms`.
    ///
    /// Returns false if the member is not claimed or was claimed again under
    /// a different deadline.
    async fn remove_claim(&self, claims: &str, member: &str, deadline_ms: i64) -> StoreResult<bool>;

    async fn claim_count(&self, claims: &str) -> StoreResult<u64>;
}
