//! Redis-backed [`SharedStore`].
//!
//! Multi-key moves (claims, compare-and-swap, counters with expiry) run as
//! Lua scripts so each one is a single atomic step on the server.

use super::{SharedStore, StoreError, StoreResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Redis scripts for atomic operations
mod scripts {
    use redis::Script;

    /// Replace a value if it matches the expected one (or is absent)
    pub fn compare_and_swap() -> Script {
        Script::new(
            r#"
            local current = redis.call('GET', KEYS[1])
            if ARGV[1] == '1' then
                if current ~= ARGV[2] then return 0 end
            else
                if current then return 0 end
            end
            if tonumber(ARGV[4]) > 0 then
                redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
            else
                redis.call('SET', KEYS[1], ARGV[3])
            end
            return 1
            "#,
        )
    }

    /// Delete a key only while it still holds the expected value
    pub fn compare_and_delete() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
    }

    /// Counter whose expiry is fixed when it is created
    pub fn incr_with_expiry() -> Script {
        Script::new(
            r#"
            local count = redis.call('INCR', KEYS[1])
            if count == 1 then
                redis.call('PEXPIRE', KEYS[1], ARGV[1])
            end
            return count
            "#,
        )
    }

    /// Pop the list head into the claim set
    pub fn claim_next() -> Script {
        Script::new(
            r#"
            local id = redis.call('LPOP', KEYS[1])
            if id then
                redis.call('ZADD', KEYS[2], ARGV[1], id)
            end
            return id
            "#,
        )
    }

    /// Move expired claims back onto the list
    pub fn reclaim_expired() -> Script {
        Script::new(
            r#"
            local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
            for _, id in ipairs(ids) do
                redis.call('ZREM', KEYS[1], id)
                redis.call('RPUSH', KEYS[2], id)
            end
            return ids
            "#,
        )
    }

    /// Drop a claim only while its deadline score is unchanged
    pub fn remove_claim() -> Script {
        Script::new(
            r#"
            local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
            if score and tonumber(score) == tonumber(ARGV[2]) then
                return redis.call('ZREM', KEYS[1], ARGV[1])
            end
            return 0
            "#,
        )
    }

    /// Take every list item and delete the list
    pub fn drain_list() -> Script {
        Script::new(
            r#"
            local items = redis.call('LRANGE', KEYS[1], 0, -1)
            redis.call('DEL', KEYS[1])
            return items
            "#,
        )
    }
}

struct Scripts {
    compare_and_swap: Script,
    compare_and_delete: Script,
    incr_with_expiry: Script,
    claim_next: Script,
    reclaim_expired: Script,
    remove_claim: Script,
    drain_list: Script,
}

/// Shared store backed by a Redis server.
///
/// Every key is namespaced with `key_prefix` so several deployments can share
/// one server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    scripts: std::sync::Arc<Scripts>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

fn unavailable(operation: &'static str) -> impl Fn(RedisError) -> StoreError {
    move |e| StoreError::unavailable(operation, e.to_string())
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Keys requested per SCAN round trip.
const SCAN_BATCH: usize = 500;

fn scan_command(cursor: u64, pattern: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("SCAN");
    cmd.arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(SCAN_BATCH);
    cmd
}

/// Escape glob metacharacters so a prefix matches literally in SCAN MATCH.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl RedisStore {
    /// Connect to `redis_url` and namespace keys under `key_prefix`.
    pub async fn connect(redis_url: &str, key_prefix: &str) -> StoreResult<Self> {
        info!("Connecting to Redis store at {}", redis_url);

        let client = redis::Client::open(redis_url).map_err(unavailable("connect"))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(unavailable("connect"))?;

        info!("Successfully connected to Redis store");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            scripts: std::sync::Arc::new(Scripts {
                compare_and_swap: scripts::compare_and_swap(),
                compare_and_delete: scripts::compare_and_delete(),
                incr_with_expiry: scripts::incr_with_expiry(),
                claim_next: scripts::claim_next(),
                reclaim_expired: scripts::reclaim_expired(),
                remove_claim: scripts::remove_claim(),
                drain_list: scripts::drain_list(),
            }),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Walk the keyspace with SCAN so a large namespace never blocks the server.
    async fn matching_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", glob_escape(&self.key(prefix)));

        let mut found = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = scan_command(cursor, &pattern)
                .query_async(&mut conn)
                .await
                .map_err(unavailable("scan"))?;
            found.extend(keys);

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once
        found.sort();
        found.dedup();
        Ok(found)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(unavailable("ping"))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(unavailable("get"))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(unavailable("set"))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(unavailable("set_if_absent"))?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let swapped = self
            .scripts
            .compare_and_swap
            .key(self.key(key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl.map(millis).unwrap_or(0))
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(unavailable("compare_and_swap"))?;
        Ok(swapped == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted = self
            .scripts
            .compare_and_delete
            .key(self.key(key))
            .arg(expected)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(unavailable("compare_and_delete"))?;
        Ok(deleted == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<i64>(&mut conn)
            .await
            .map_err(unavailable("delete"))?;
        Ok(deleted > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let applied = redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(millis(ttl))
            .query_async::<i64>(&mut conn)
            .await
            .map_err(unavailable("expire"))?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let remaining = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async::<i64>(&mut conn)
            .await
            .map_err(unavailable("ttl"))?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        self.scripts
            .incr_with_expiry
            .key(self.key(key))
            .arg(millis(ttl))
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(unavailable("incr_with_expiry"))
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .matching_keys(prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.key_prefix).map(str::to_string))
            .collect();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let keys = self.matching_keys(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut removed = 0u64;
        for chunk in keys.chunks(500) {
            removed += redis::cmd("DEL")
                .arg(chunk)
                .query_async::<u64>(&mut conn)
                .await
                .map_err(unavailable("delete_prefix"))?;
        }
        Ok(removed)
    }

    async fn push_back(&self, list: &str, value: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("RPUSH")
            .arg(self.key(list))
            .arg(value)
            .query_async::<u64>(&mut conn)
            .await
            .map_err(unavailable("push_back"))
    }

    async fn push_front(&self, list: &str, value: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(self.key(list))
            .arg(value)
            .query_async::<u64>(&mut conn)
            .await
            .map_err(unavailable("push_front"))
    }

    async fn list_len(&self, list: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(self.key(list))
            .query_async::<u64>(&mut conn)
            .await
            .map_err(unavailable("list_len"))
    }

    async fn list_range(&self, list: &str, start: usize, stop: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("LRANGE")
            .arg(self.key(list))
            .arg(start)
            .arg(stop)
            .query_async::<Vec<String>>(&mut conn)
            .await
            .map_err(unavailable("list_range"))
    }

    async fn list_trim(&self, list: &str, keep: usize) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        if keep == 0 {
            return self.delete(list).await.map(|_| ());
        }
        redis::cmd("LTRIM")
            .arg(self.key(list))
            .arg(0)
            .arg(keep - 1)
            .query_async::<()>(&mut conn)
            .await
            .map_err(unavailable("list_trim"))
    }

    async fn drain_list(&self, list: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.scripts
            .drain_list
            .key(self.key(list))
            .invoke_async::<Vec<String>>(&mut conn)
            .await
            .map_err(unavailable("drain_list"))
    }

    async fn claim_next(
        &self,
        list: &str,
        claims: &str,
        deadline_ms: i64,
    ) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.scripts
            .claim_next
            .key(self.key(list))
            .key(self.key(claims))
            .arg(deadline_ms)
            .invoke_async::<Option<String>>(&mut conn)
            .await
            .map_err(unavailable("claim_next"))
    }

    async fn reclaim_expired(
        &self,
        claims: &str,
        list: &str,
        now_ms: i64,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.scripts
            .reclaim_expired
            .key(self.key(claims))
            .key(self.key(list))
            .arg(now_ms)
            .invoke_async::<Vec<String>>(&mut conn)
            .await
            .map_err(unavailable("reclaim_expired"))
    }

    async fn remove_claim(&self, claims: &str, member: &str, deadline_ms: i64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed = self
            .scripts
            .remove_claim
            .key(self.key(claims))
            .arg(member)
            .arg(deadline_ms)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(unavailable("remove_claim"))?;
        Ok(removed > 0)
    }

    async fn claim_count(&self, claims: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(self.key(claims))
            .query_async::<u64>(&mut conn)
            .await
            .map_err(unavailable("claim_count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("pq:result:"), "pq:result:");
        assert_eq!(glob_escape("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_prefix_lookup_uses_cursor_scan() {
        let packed = String::from_utf8(scan_command(17, "pq:result:*").get_packed_command()).unwrap();
        assert!(packed.contains("SCAN"));
        assert!(!packed.contains("KEYS"));
        assert!(packed.contains("\r\n17\r\n"));
        assert!(packed.contains("MATCH\r\n$11\r\npq:result:*"));
        assert!(packed.contains("COUNT\r\n$3\r\n500"));
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
