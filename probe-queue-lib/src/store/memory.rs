//! In-process [`SharedStore`] used by tests and single-node runs.

use super::{SharedStore, StoreError, StoreResult};
use crate::clock::{self, Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    claims: HashMap<String, HashMap<String, i64>>,
    expiries: HashMap<String, DateTime<Utc>>,
}

impl State {
    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.lists.contains_key(key) || self.claims.contains_key(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiries.remove(key);
        let s = self.strings.remove(key).is_some();
        let l = self.lists.remove(key).is_some();
        let c = self.claims.remove(key).is_some();
        s || l || c
    }

    /// Drop every key whose expiry has passed.
    fn purge(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn set_expiry(&mut self, key: &str, now: DateTime<Utc>, ttl: Option<Duration>) {
        match ttl {
            Some(ttl) => {
                self.expiries.insert(key.to_string(), clock::add(now, ttl));
            }
            None => {
                self.expiries.remove(key);
            }
        }
    }

    fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.strings
            .keys()
            .chain(self.lists.keys())
            .chain(self.claims.keys())
    }
}

/// Single-process store with TTL semantics driven by an injected [`Clock`].
///
/// A process-wide availability switch lets tests simulate an unreachable
/// backend.
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Make every subsequent operation fail as if the backend were down.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Lock the state after purging expired keys.
    fn state(&self, operation: &str) -> StoreResult<MutexGuard<'_, State>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(operation, "memory store marked unavailable"));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::unavailable(operation, "memory store lock poisoned"))?;
        state.purge(self.clock.now());
        Ok(state)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.state("ping").map(|_| ())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let state = self.state("get")?;
        Ok(state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state("set")?;
        state.remove(key);
        state.strings.insert(key.to_string(), value.to_string());
        state.set_expiry(key, now, ttl);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut state = self.state("set_if_absent")?;
        if state.contains(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        state.set_expiry(key, now, Some(ttl));
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut state = self.state("compare_and_swap")?;
        if state.strings.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), new.to_string());
        state.set_expiry(key, now, ttl);
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut state = self.state("compare_and_delete")?;
        if state.strings.get(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        Ok(state.remove(key))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.state("delete")?;
        Ok(state.remove(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut state = self.state("expire")?;
        if !state.contains(key) {
            return Ok(false);
        }
        state.set_expiry(key, now, Some(ttl));
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = self.clock.now();
        let state = self.state("ttl")?;
        Ok(state.expiries.get(key).map(|at| clock::until(now, *at)))
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let now = self.clock.now();
        let mut state = self.state("incr_with_expiry")?;
        let current = state.strings.get(key).cloned();
        let next = match current {
            Some(raw) => {
                raw.parse::<i64>()
                    .map_err(|e| StoreError::corrupt(key, format!("not a counter: {}", e)))?
                    + 1
            }
            None => {
                state.set_expiry(key, now, Some(ttl));
                1
            }
        };
        state.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let state = self.state("keys")?;
        let mut keys: Vec<String> = state
            .all_keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut state = self.state("delete_prefix")?;
        let doomed: Vec<String> = state
            .all_keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let mut removed = 0;
        for key in doomed {
            if state.remove(&key) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn push_back(&self, list: &str, value: &str) -> StoreResult<u64> {
        let mut state = self.state("push_back")?;
        let items = state.lists.entry(list.to_string()).or_default();
        items.push_back(value.to_string());
        Ok(items.len() as u64)
    }

    async fn push_front(&self, list: &str, value: &str) -> StoreResult<u64> {
        let mut state = self.state("push_front")?;
        let items = state.lists.entry(list.to_string()).or_default();
        items.push_front(value.to_string());
        Ok(items.len() as u64)
    }

    async fn list_len(&self, list: &str) -> StoreResult<u64> {
        let state = self.state("list_len")?;
        Ok(state.lists.get(list).map_or(0, |l| l.len() as u64))
    }

    async fn list_range(&self, list: &str, start: usize, stop: usize) -> StoreResult<Vec<String>> {
        let state = self.state("list_range")?;
        Ok(state
            .lists
            .get(list)
            .map(|items| {
                items
                    .iter()
                    .skip(start)
                    .take((stop + 1).saturating_sub(start))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_trim(&self, list: &str, keep: usize) -> StoreResult<()> {
        let mut state = self.state("list_trim")?;
        let emptied = match state.lists.get_mut(list) {
            Some(items) => {
                items.truncate(keep);
                items.is_empty()
            }
            None => false,
        };
        if emptied {
            state.remove(list);
        }
        Ok(())
    }

    async fn drain_list(&self, list: &str) -> StoreResult<Vec<String>> {
        let mut state = self.state("drain_list")?;
        state.expiries.remove(list);
        Ok(state
            .lists
            .remove(list)
            .map(|items| items.into_iter().collect())
            .unwrap_or_default())
    }

    async fn claim_next(
        &self,
        list: &str,
        claims: &str,
        deadline_ms: i64,
    ) -> StoreResult<Option<String>> {
        let mut state = self.state("claim_next")?;
        let Some(id) = state.lists.get_mut(list).and_then(|items| items.pop_front()) else {
            return Ok(None);
        };
        if state.lists.get(list).is_some_and(|items| items.is_empty()) {
            state.lists.remove(list);
        }
        state
            .claims
            .entry(claims.to_string())
            .or_default()
            .insert(id.clone(), deadline_ms);
        Ok(Some(id))
    }

    async fn reclaim_expired(
        &self,
        claims: &str,
        list: &str,
        now_ms: i64,
    ) -> StoreResult<Vec<String>> {
        let mut state = self.state("reclaim_expired")?;
        let mut expired: Vec<(String, i64)> = match state.claims.get(claims) {
            Some(set) => set
                .iter()
                .filter(|(_, deadline)| **deadline <= now_ms)
                .map(|(id, deadline)| (id.clone(), *deadline))
                .collect(),
            None => return Ok(Vec::new()),
        };
        expired.sort_by_key(|(_, deadline)| *deadline);

        let ids: Vec<String> = expired.into_iter().map(|(id, _)| id).collect();
        if let Some(set) = state.claims.get_mut(claims) {
            for id in &ids {
                set.remove(id);
            }
        }
        let items = state.lists.entry(list.to_string()).or_default();
        for id in &ids {
            items.push_back(id.clone());
        }
        if items.is_empty() {
            state.lists.remove(list);
        }
        Ok(ids)
    }

    async fn remove_claim(&self, claims: &str, member: &str, deadline_ms: i64) -> StoreResult<bool> {
        let mut state = self.state("remove_claim")?;
        let Some(set) = state.claims.get_mut(claims) else {
            return Ok(false);
        };
        if set.get(member) != Some(&deadline_ms) {
            return Ok(false);
        }
        set.remove(member);
        Ok(true)
    }

    async fn claim_count(&self, claims: &str) -> StoreResult<u64> {
        let state = self.state("claim_count")?;
        Ok(state.claims.get(claims).map_or(0, |set| set.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_ttl() {
        let (store, clock) = store_with_clock();
        assert!(store.set_if_absent("lock", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", Duration::from_secs(10)).await.unwrap());

        clock.advance(Duration::from_secs(11));
        assert!(store.set_if_absent("lock", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some("b".to_string()));
    }

    #[test]
    fn test_compare_and_swap() {
        let store = MemoryStore::new();
        tokio_test::block_on(async {
            assert!(store.compare_and_swap("k", None, "1", None).await.unwrap());
            assert!(!store.compare_and_swap("k", None, "2", None).await.unwrap());
            assert!(store.compare_and_swap("k", Some("1"), "2", None).await.unwrap());
            assert!(!store.compare_and_delete("k", "1").await.unwrap());
            assert!(store.compare_and_delete("k", "2").await.unwrap());
            assert_eq!(store.get("k").await.unwrap(), None);
        });
    }

    #[tokio::test]
    async fn test_incr_keeps_first_expiry() {
        let (store, clock) = store_with_clock();
        assert_eq!(store.incr_with_expiry("c", Duration::from_secs(60)).await.unwrap(), 1);
        clock.advance(Duration::from_secs(40));
        assert_eq!(store.incr_with_expiry("c", Duration::from_secs(60)).await.unwrap(), 2);
        clock.advance(Duration::from_secs(21));
        assert_eq!(store.incr_with_expiry("c", Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claims_move_between_list_and_set() {
        let store = MemoryStore::new();
        store.push_back("q", "a").await.unwrap();
        store.push_back("q", "b").await.unwrap();

        assert_eq!(store.claim_next("q", "c", 100).await.unwrap(), Some("a".to_string()));
        assert_eq!(store.list_len("q").await.unwrap(), 1);
        assert_eq!(store.claim_count("c").await.unwrap(), 1);

        assert!(store.reclaim_expired("c", "q", 99).await.unwrap().is_empty());
        assert_eq!(store.reclaim_expired("c", "q", 100).await.unwrap(), vec!["a"]);
        assert_eq!(store.list_range("q", 0, 10).await.unwrap(), vec!["b", "a"]);
        assert!(!store.remove_claim("c", "a", 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_claim_checks_deadline() {
        let store = MemoryStore::new();
        store.push_back("q", "a").await.unwrap();
        store.claim_next("q", "c", 100).await.unwrap();
        store.reclaim_expired("c", "q", 100).await.unwrap();
        store.claim_next("q", "c", 250).await.unwrap();

        // The first claim's deadline no longer matches
        assert!(!store.remove_claim("c", "a", 100).await.unwrap());
        assert_eq!(store.claim_count("c").await.unwrap(), 1);
        assert!(store.remove_claim("c", "a", 250).await.unwrap());
        assert_eq!(store.claim_count("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_trim_and_drain() {
        let store = MemoryStore::new();
        for item in ["3", "2", "1"] {
            store.push_front("h", item).await.unwrap();
        }
        store.list_trim("h", 2).await.unwrap();
        assert_eq!(store.list_range("h", 0, 9).await.unwrap(), vec!["1", "2"]);
        assert_eq!(store.drain_list("h").await.unwrap(), vec!["1", "2"]);
        assert_eq!(store.list_len("h").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_prefix_spans_types() {
        let store = MemoryStore::new();
        store.set("result:a", "1", None).await.unwrap();
        store.set("result:b", "2", None).await.unwrap();
        store.push_back("result:list", "x").await.unwrap();
        store.set("other", "3", None).await.unwrap();

        assert_eq!(store.delete_prefix("result:").await.unwrap(), 3);
        assert_eq!(store.keys("").await.unwrap(), vec!["other"]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable { .. })
        ));
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
