//! Token liveness cache
//!
//! Holds `auth:{username}=1` with a TTL. Redis when configured, otherwise a
//! process-local map whose entries expire against the injected clock.

use async_trait::async_trait;
use common::redis::RedisClient;
use common::TimeProvider;
use dashmap::DashMap;
use errors::{HeraldError, HeraldResult};
use std::sync::Arc;

/// Key/value store with per-key expiry
#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> HeraldResult<()>;
    async fn exists(&self, key: &str) -> HeraldResult<bool>;
    /// Returns whether a key was removed
    async fn del(&self, key: &str) -> HeraldResult<bool>;
}

/// Redis-backed cache shared by every instance pointing at the same server
#[derive(Debug, Clone)]
pub struct RedisTokenCache {
    client: RedisClient,
}

impl RedisTokenCache {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

fn redis_error(err: anyhow::Error) -> HeraldError {
    HeraldError::ServiceUnavailable(format!("token cache: {:#}", err))
}

#[async_trait]
impl TokenCache for RedisTokenCache {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> HeraldResult<()> {
        self.client
            .set_ex(key, value, ttl_secs)
            .await
            .map_err(redis_error)
    }

    async fn exists(&self, key: &str) -> HeraldResult<bool> {
        self.client.exists(key).await.map_err(redis_error)
    }

    async fn del(&self, key: &str) -> HeraldResult<bool> {
        Ok(self.client.del(key).await.map_err(redis_error)? > 0)
    }
}

/// In-process cache for single-instance deployments and tests
///
/// Only presence matters to callers, so values are not kept.
pub struct MemoryTokenCache {
    /// key -> expiry instant in milliseconds
    entries: DashMap<String, i64>,
    clock: Arc<dyn TimeProvider>,
}

impl MemoryTokenCache {
    pub fn new(clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn set_ex(&self, key: &str, _value: &str, ttl_secs: u64) -> HeraldResult<()> {
        let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        self.entries.insert(
            key.to_string(),
            self.clock.now_millis().saturating_add(ttl_ms),
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> HeraldResult<bool> {
        let now = self.clock.now_millis();
        // Expired entries are removed lazily on lookup
        let expired = match self.entries.get(key) {
            Some(expires_at) if *expires_at > now => return Ok(true),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, expires_at| *expires_at <= now);
        }
        Ok(false)
    }

    async fn del(&self, key: &str) -> HeraldResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use common::ManualTimeProvider;

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let clock = Arc::new(ManualTimeProvider::new(1_000_000));
        let cache = MemoryTokenCache::new(clock.clone());

        cache.set_ex("auth:admin", "1", 10).await.unwrap();
        assert!(cache.exists("auth:admin").await.unwrap());

        clock.advance_millis(9_999);
        assert!(cache.exists("auth:admin").await.unwrap());

        clock.advance_millis(1);
        assert!(!cache.exists("auth:admin").await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_memory_cache_del() {
        let cache = MemoryTokenCache::new(Arc::new(ManualTimeProvider::new(0)));
        cache.set_ex("auth:bob", "1", 60).await.unwrap();
        assert!(cache.del("auth:bob").await.unwrap());
        assert!(!cache.del("auth:bob").await.unwrap());
        assert!(!cache.exists("auth:bob").await.unwrap());
    }
}
