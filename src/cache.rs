//! Read-through Redis cache for the status endpoint.
//!
//! Status reads hit Redis first and fall back to the live computation on
//! a miss. The write-back is a spawned task whose failure is logged and
//! swallowed: a cache that cannot be written must never fail a read that
//! already has its answer.

use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Cache key namespace.
const KEY_PREFIX: &str = "matchcast:cache";

pub struct ReadThroughCache {
    redis: ConnectionManager,
    ttl: Duration,
}

impl ReadThroughCache {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    /// Returns the cached value for `key`, or computes, returns, and
    /// asynchronously caches it.
    ///
    /// Cache read failures degrade to the computation; only the
    /// computation's own error is ever returned.
    pub async fn get_or_compute<T, E, Fut>(
        &self,
        key: &str,
        compute: impl FnOnce() -> Fut,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<T, E>>,
    {
        let full_key = cache_key(key);
        let mut conn = self.redis.clone();

        match conn.get::<_, Option<String>>(&full_key).await {
            Ok(Some(data)) => match serde_json::from_str(&data) {
                Ok(value) => {
                    tracing::debug!(key = %full_key, "Cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::debug!(key = %full_key, error = %e, "Discarding unreadable cache entry");
                }
            },
            Ok(None) => {
                tracing::debug!(key = %full_key, "Cache miss");
            }
            Err(e) => {
                tracing::warn!(key = %full_key, error = %e, "Cache read failed, computing directly");
            }
        }

        let value = compute().await?;

        // Serialize on this side so the spawned task owns a plain string.
        match serde_json::to_string(&value) {
            Ok(serialized) => {
                let ttl_secs = self.ttl.as_secs();
                let mut conn = self.redis.clone();
                tokio::spawn(async move {
                    if let Err(e) = conn
                        .set_ex::<_, _, ()>(&full_key, serialized, ttl_secs)
                        .await
                    {
                        tracing::warn!(key = %full_key, error = %e, "Cache write failed");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(key = %full_key, error = %e, "Value not cacheable, skipping write");
            }
        }

        Ok(value)
    }

    /// Drops a cached entry, forcing the next read to recompute.
    pub async fn invalidate(&self, key: &str) {
        let full_key = cache_key(key);
        let mut conn = self.redis.clone();
        if let Err(e) = conn.del::<_, ()>(&full_key).await {
            tracing::warn!(key = %full_key, error = %e, "Cache invalidation failed");
        }
    }
}

fn cache_key(key: &str) -> String {
    format!("{}:{}", KEY_PREFIX, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_namespaced() {
        assert_eq!(cache_key("status"), "matchcast:cache:status");
    }
}
