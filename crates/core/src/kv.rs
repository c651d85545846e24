// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared KV/scripting client (§4.A).
//!
//! A single pooled connection reused by the limiter registry, the quota
//! manager and the digest validator. Every call is fallible with
//! [`CoreError::BackendUnavailable`] on connection loss — this client never
//! hides a backend error as a success.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};

/// Outcome of the atomic unique-session admit script (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaAdmitOutcome {
    pub admitted: bool,
    /// Number of unique sessions in the window after this call.
    pub current: u32,
}

/// Typed operations the core consumes from the backing store.
///
/// Object-safe and async, following the provider-trait shape used
/// throughout `querymt-querymt/crates/querymt` for pluggable backends.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;

    /// Set a key, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()>;

    async fn del(&self, key: &str) -> CoreResult<()>;

    /// Atomically increment a counter key, refreshing its TTL, and return
    /// the post-increment value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> CoreResult<i64>;

    /// Atomically decrement a counter key (saturating at 0).
    async fn decr(&self, key: &str) -> CoreResult<i64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoreResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> CoreResult<()>;

    async fn zscore(&self, key: &str, member: &str) -> CoreResult<Option<f64>>;

    async fn zcard(&self, key: &str) -> CoreResult<u64>;

    /// Remove members with score in `[min, max]`; returns the number removed.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<u64>;

    /// Remaining TTL on `key`, or `None` if it is absent or carries no expiry.
    async fn ttl(&self, key: &str) -> CoreResult<Option<Duration>>;

    /// Run the §4.C unique-session admit algorithm atomically against `key`.
    async fn admit_unique_session(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_seconds: u32,
        max_sessions: u32,
    ) -> CoreResult<QuotaAdmitOutcome>;

    /// Atomically add `member` to the zset at `key` iff its cardinality is
    /// below `max`, used by §4.B to admit into the distributed running-set.
    /// Returns whether the member was added.
    async fn try_acquire_slot(
        &self,
        key: &str,
        member: &str,
        score: f64,
        max: u32,
    ) -> CoreResult<bool>;
}

// ── Redis-backed implementation ──────────────────────────────────────────

/// The Lua script implementing §4.C's atomic admit algorithm verbatim.
const ADMIT_UNIQUE_SESSION_SCRIPT: &str = r#"
local key = KEYS[1]
local member = ARGV[1]
local now = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3]) * 1000
local max_sessions = tonumber(ARGV[4])
local window_seconds = tonumber(ARGV[3])

if redis.call('ZSCORE', key, member) then
    redis.call('ZADD', key, now, member)
    redis.call('EXPIRE', key, window_seconds)
    return {1, redis.call('ZCARD', key)}
end

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)
local n = redis.call('ZCARD', key)
if n >= max_sessions then
    redis.call('EXPIRE', key, window_seconds)
    return {0, n}
end

redis.call('ZADD', key, now, member)
redis.call('EXPIRE', key, window_seconds)
return {1, n + 1}
"#;

const TRY_ACQUIRE_SLOT_SCRIPT: &str = r#"
local key = KEYS[1]
local member = ARGV[1]
local score = tonumber(ARGV[2])
local max = tonumber(ARGV[3])

local n = redis.call('ZCARD', key)
if n >= max then
    return 0
end
redis.call('ZADD', key, score, member)
return 1
"#;

pub struct RedisKvClient {
    pool: deadpool_redis::Pool,
    admit_script: redis::Script,
    acquire_slot_script: redis::Script,
}

impl RedisKvClient {
    pub fn new(redis_url: &str) -> CoreResult<Self> {
        let cfg = deadpool_redis::Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| CoreError::BackendUnavailable(e.to_string()))?;
        Ok(Self {
            pool,
            admit_script: redis::Script::new(ADMIT_UNIQUE_SESSION_SCRIPT),
            acquire_slot_script: redis::Script::new(TRY_ACQUIRE_SLOT_SCRIPT),
        })
    }

    async fn conn(&self) -> CoreResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))
    }
}

#[async_trait]
impl KvClient for RedisKvClient {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| CoreError::BackendUnavailable(e.to_string())),
            None => {
                conn.set::<_, _, ()>(key, value).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| CoreError::BackendUnavailable(e.to_string()))
    }

    async fn del(&self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> CoreResult<i64> {
        let mut conn = self.conn().await?;
        let value: i64 =
            conn.incr(key, 1).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))?;
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| CoreError::BackendUnavailable(e.to_string()))?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> CoreResult<i64> {
        let mut conn = self.conn().await?;
        let value: i64 =
            conn.decr(key, 1).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))?;
        if value < 0 {
            let _: Result<i64, _> = conn.set(key, 0).await;
            return Ok(0);
        }
        Ok(value)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(|e| CoreError::BackendUnavailable(e.to_string()))
    }

    async fn zrem(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        conn.zrem::<_, _, ()>(key, member).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))
    }

    async fn zscore(&self, key: &str, member: &str) -> CoreResult<Option<f64>> {
        let mut conn = self.conn().await?;
        conn.zscore(key, member).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))
    }

    async fn zcard(&self, key: &str) -> CoreResult<u64> {
        let mut conn = self.conn().await?;
        conn.zcard(key).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<u64> {
        let mut conn = self.conn().await?;
        conn.zrembyscore(key, min, max).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))
    }

    async fn ttl(&self, key: &str) -> CoreResult<Option<Duration>> {
        let mut conn = self.conn().await?;
        let secs: i64 = conn.ttl(key).await.map_err(|e| CoreError::BackendUnavailable(e.to_string()))?;
        Ok((secs > 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn admit_unique_session(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_seconds: u32,
        max_sessions: u32,
    ) -> CoreResult<QuotaAdmitOutcome> {
        let mut conn = self.conn().await?;
        let (admitted, current): (i64, u32) = self
            .admit_script
            .key(key)
            .arg(member)
            .arg(now_ms)
            .arg(window_seconds)
            .arg(max_sessions)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::BackendUnavailable(e.to_string()))?;
        Ok(QuotaAdmitOutcome { admitted: admitted == 1, current })
    }

    async fn try_acquire_slot(&self, key: &str, member: &str, score: f64, max: u32) -> CoreResult<bool> {
        let mut conn = self.conn().await?;
        let admitted: i64 = self
            .acquire_slot_script
            .key(key)
            .arg(member)
            .arg(score)
            .arg(max)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::BackendUnavailable(e.to_string()))?;
        Ok(admitted == 1)
    }
}

// ── In-memory fake for tests ─────────────────────────────────────────────

#[derive(Default)]
struct FakeStore {
    strings: HashMap<String, (String, Option<std::time::Instant>)>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

/// In-process stand-in for Redis used by the test suite. Serializes every
/// operation behind one mutex so the quota admit path is genuinely atomic,
/// matching what the real Lua script guarantees server-side.
pub struct FakeKvClient {
    store: Arc<Mutex<FakeStore>>,
}

impl Default for FakeKvClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKvClient {
    pub fn new() -> Self {
        Self { store: Arc::new(Mutex::new(FakeStore::default())) }
    }

    fn expired(entry: &(String, Option<std::time::Instant>)) -> bool {
        matches!(entry.1, Some(deadline) if deadline <= std::time::Instant::now())
    }
}

#[async_trait]
impl KvClient for FakeKvClient {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let store = self.store.lock().await;
        Ok(store.strings.get(key).filter(|e| !Self::expired(e)).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        let deadline = ttl.map(|d| std::time::Instant::now() + d);
        store.strings.insert(key.to_owned(), (value.to_owned(), deadline));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        if let Some(entry) = store.strings.get_mut(key) {
            entry.1 = Some(std::time::Instant::now() + ttl);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        store.strings.remove(key);
        store.zsets.remove(key);
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> CoreResult<i64> {
        let mut store = self.store.lock().await;
        let current = store
            .strings
            .get(key)
            .filter(|e| !Self::expired(e))
            .and_then(|(v, _)| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        let deadline = Some(std::time::Instant::now() + ttl);
        store.strings.insert(key.to_owned(), (next.to_string(), deadline));
        Ok(next)
    }

    async fn decr(&self, key: &str) -> CoreResult<i64> {
        let mut store = self.store.lock().await;
        let current = store
            .strings
            .get(key)
            .filter(|e| !Self::expired(e))
            .and_then(|(v, _)| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = (current - 1).max(0);
        let deadline = store.strings.get(key).and_then(|e| e.1);
        store.strings.insert(key.to_owned(), (next.to_string(), deadline));
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        store.zsets.entry(key.to_owned()).or_default().insert(member.to_owned(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut store = self.store.lock().await;
        if let Some(set) = store.zsets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> CoreResult<Option<f64>> {
        let store = self.store.lock().await;
        Ok(store.zsets.get(key).and_then(|set| set.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> CoreResult<u64> {
        let store = self.store.lock().await;
        Ok(store.zsets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<u64> {
        let mut store = self.store.lock().await;
        let Some(set) = store.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| !(*score >= min && *score <= max));
        Ok((before - set.len()) as u64)
    }

    async fn ttl(&self, key: &str) -> CoreResult<Option<Duration>> {
        let store = self.store.lock().await;
        Ok(store.strings.get(key).filter(|e| !Self::expired(e)).and_then(|(_, deadline)| {
            deadline.map(|d| d.saturating_duration_since(std::time::Instant::now())).filter(|d| !d.is_zero())
        }))
    }

    async fn admit_unique_session(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_seconds: u32,
        max_sessions: u32,
    ) -> CoreResult<QuotaAdmitOutcome> {
        // Single mutex acquisition for the whole check-and-admit sequence —
        // the in-process equivalent of the server-side Lua script's atomicity.
        let mut store = self.store.lock().await;
        let set = store.zsets.entry(key.to_owned()).or_default();

        if set.contains_key(member) {
            set.insert(member.to_owned(), now_ms as f64);
            return Ok(QuotaAdmitOutcome { admitted: true, current: set.len() as u32 });
        }

        let window_ms = window_seconds as i64 * 1000;
        let cutoff = (now_ms - window_ms) as f64;
        set.retain(|_, score| *score > cutoff);

        let n = set.len() as u32;
        if n >= max_sessions {
            return Ok(QuotaAdmitOutcome { admitted: false, current: n });
        }

        set.insert(member.to_owned(), now_ms as f64);
        Ok(QuotaAdmitOutcome { admitted: true, current: n + 1 })
    }

    async fn try_acquire_slot(&self, key: &str, member: &str, score: f64, max: u32) -> CoreResult<bool> {
        let mut store = self.store.lock().await;
        let set = store.zsets.entry(key.to_owned()).or_default();
        if set.len() as u32 >= max {
            return Ok(false);
        }
        set.insert(member.to_owned(), score);
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_roundtrip() {
        let kv = FakeKvClient::new();
        kv.set("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_owned()));
    }

    #[tokio::test]
    async fn ttl_expiry_makes_key_invisible() {
        let kv = FakeKvClient::new();
        kv.set("k", "v", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_with_ttl_is_monotonic() {
        let kv = FakeKvClient::new();
        assert_eq!(kv.incr_with_ttl("c", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(kv.incr_with_ttl("c", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(kv.decr("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn decr_saturates_at_zero() {
        let kv = FakeKvClient::new();
        assert_eq!(kv.decr("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zset_window_eviction() {
        let kv = FakeKvClient::new();
        kv.zadd("z", "a", 100.0).await.unwrap();
        kv.zadd("z", "b", 200.0).await.unwrap();
        let removed = kv.zremrangebyscore("z", f64::NEG_INFINITY, 150.0).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(kv.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn admit_unique_session_rejects_over_capacity() {
        let kv = FakeKvClient::new();
        for i in 0..5 {
            let out = kv.admit_unique_session("acct", &format!("fp{i}"), 1000, 3600, 5).await.unwrap();
            assert!(out.admitted);
        }
        let out = kv.admit_unique_session("acct", "fp-overflow", 1000, 3600, 5).await.unwrap();
        assert!(!out.admitted);
        assert_eq!(out.current, 5);
    }

    #[tokio::test]
    async fn admit_unique_session_refreshes_existing_fingerprint() {
        let kv = FakeKvClient::new();
        kv.admit_unique_session("acct", "fp", 1000, 3600, 1).await.unwrap();
        let out = kv.admit_unique_session("acct", "fp", 2000, 3600, 1).await.unwrap();
        assert!(out.admitted);
        assert_eq!(out.current, 1);
    }

    #[tokio::test]
    async fn ttl_reports_remaining_time_and_none_when_absent() {
        let kv = FakeKvClient::new();
        assert_eq!(kv.ttl("missing").await.unwrap(), None);
        kv.set("k", "v", Some(Duration::from_secs(60))).await.unwrap();
        let remaining = kv.ttl("k").await.unwrap().expect("ttl should be set");
        assert!(remaining <= Duration::from_secs(60) && remaining > Duration::from_secs(58));
    }

    #[tokio::test]
    async fn try_acquire_slot_respects_capacity() {
        let kv = FakeKvClient::new();
        assert!(kv.try_acquire_slot("sem:r", "job-1", 1.0, 1).await.unwrap());
        assert!(!kv.try_acquire_slot("sem:r", "job-2", 2.0, 1).await.unwrap());
        kv.zrem("sem:r", "job-1").await.unwrap();
        assert!(kv.try_acquire_slot("sem:r", "job-2", 3.0, 1).await.unwrap());
    }
}
