use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Entry stored in the local DashMap with an expiry timestamp.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    value: String,
    pub(crate) expires_at: Instant,
}

/// Fixed-window counter kept locally when no Redis tier is configured.
#[derive(Clone, Copy)]
struct Counter {
    count: u64,
    window_ends: Instant,
}

/// Two-tier cache: in-memory DashMap (tier 1) optionally backed by Redis
/// (tier 2). PG is the source of truth and handled by callers.
///
/// Local entries honour TTLs: they are checked on read and evicted lazily,
/// and `evict_expired()` sweeps them from the cleanup job.
#[derive(Clone)]
pub struct TieredCache {
    pub(crate) local: Arc<DashMap<String, CacheEntry>>,
    counters: Arc<DashMap<String, Counter>>,
    redis: Option<ConnectionManager>,
}

impl TieredCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            counters: Arc::new(DashMap::new()),
            redis: Some(redis),
        }
    }

    /// Single-replica mode: everything lives in process memory.
    pub fn local_only() -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            counters: Arc::new(DashMap::new()),
            redis: None,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // tier 1: in-memory (with TTL check)
        if let Some(entry) = self.local.get(key) {
            if Instant::now() < entry.expires_at {
                return serde_json::from_str(&entry.value).ok();
            }
            // expired; drop the ref before removing
            drop(entry);
            self.local.remove(key);
        }

        // tier 2: redis
        let mut conn = self.redis.clone()?;
        if let Ok(Some(v)) = conn.get::<_, Option<String>>(key).await {
            // Re-use the Redis TTL for the local entry, 30s if unknown.
            let ttl_secs: i64 = conn.ttl(key).await.unwrap_or(30);
            let ttl = if ttl_secs > 0 {
                Duration::from_secs(ttl_secs as u64)
            } else {
                Duration::from_secs(30)
            };
            self.local.insert(
                key.to_string(),
                CacheEntry {
                    value: v.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
            return serde_json::from_str(&v).ok();
        }

        None
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        self.local.insert(
            key.to_string(),
            CacheEntry {
                value: json.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );

        if let Some(mut conn) = self.redis.clone() {
            conn.set_ex::<_, _, ()>(key, json, ttl_secs).await?;
        }
        Ok(())
    }

    /// Drop a key from both tiers. Redis failures are logged, not returned:
    /// the entry still expires through its TTL.
    pub async fn invalidate(&self, key: &str) {
        self.local.remove(key);
        if let Some(mut conn) = self.redis.clone() {
            if let Err(e) = conn.del::<_, ()>(key).await {
                tracing::warn!(key, "failed to invalidate redis cache entry: {}", e);
            }
        }
    }

    /// Remove all locally-expired entries and finished counter windows.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len() + self.counters.len();
        self.local.retain(|_, entry| entry.expires_at > now);
        self.counters.retain(|_, c| c.window_ends > now);
        before - (self.local.len() + self.counters.len())
    }

    /// Current number of entries in the local cache (for metrics / debugging).
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Increment a fixed-window counter and return the new count.
    pub async fn increment(&self, key: &str, window_secs: u64) -> anyhow::Result<u64> {
        let Some(mut conn) = self.redis.clone() else {
            return Ok(self.increment_local(key, window_secs));
        };
        // Atomic INCR + EXPIRE
        let script = redis::Script::new(
            r#"
            local current = redis.call("INCR", KEYS[1])
            if current == 1 then
                redis.call("EXPIRE", KEYS[1], ARGV[1])
            end
            return current
        "#,
        );
        let count: u64 = script
            .key(key)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    fn increment_local(&self, key: &str, window_secs: u64) -> u64 {
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            window_ends: now + Duration::from_secs(window_secs),
        });
        if now >= entry.window_ends {
            entry.count = 0;
            entry.window_ends = now + Duration::from_secs(window_secs);
        }
        entry.count += 1;
        entry.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_set_get_roundtrip() {
        let cache = TieredCache::local_only();
        cache.set("k", &vec![1, 2, 3], 60).await.unwrap();
        let v: Option<Vec<i32>> = cache.get("k").await;
        assert_eq!(v, Some(vec![1, 2, 3]));
        assert_eq!(cache.local_len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_returned() {
        let cache = TieredCache::local_only();
        cache.set("k", &"v", 0).await.unwrap();
        let v: Option<String> = cache.get("k").await;
        assert!(v.is_none());
        assert_eq!(cache.local_len(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache = TieredCache::local_only();
        cache.set("k", &1u8, 60).await.unwrap();
        cache.invalidate("k").await;
        assert!(cache.get::<u8>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_local_counter_counts_within_window() {
        let cache = TieredCache::local_only();
        assert_eq!(cache.increment("rate:a", 60).await.unwrap(), 1);
        assert_eq!(cache.increment("rate:a", 60).await.unwrap(), 2);
        assert_eq!(cache.increment("rate:b", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_local_counter_resets_after_window() {
        let cache = TieredCache::local_only();
        assert_eq!(cache.increment("rate:a", 0).await.unwrap(), 1);
        // zero-length window: every call starts a new one
        assert_eq!(cache.increment("rate:a", 0).await.unwrap(), 1);
        assert_eq!(cache.evict_expired(), 1);
    }
}
