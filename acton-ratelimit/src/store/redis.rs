//! Redis-backed store for limits shared across service instances

use std::ops::DerefMut;

use async_trait::async_trait;
use deadpool_redis::Pool as RedisPool;
use serde_json::Value;

use super::KeyValueStore;
use crate::error::{Error, Result};

/// Key-value store over a `deadpool-redis` connection pool
///
/// Values are stored as JSON strings with `SET key value EX ttl`.
#[derive(Clone)]
pub struct RedisStore {
    pool: RedisPool,
    prefix: Option<String>,
}

impl RedisStore {
    /// Create a store over an existing pool
    pub fn new(pool: RedisPool) -> Self {
        Self { pool, prefix: None }
    }

    /// Namespace every key with `prefix:`
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| {
            let redis_err = redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to get Redis connection",
                e.to_string(),
            ));
            Error::Redis(Box::new(redis_err))
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.connection().await?;

        let raw: Option<String> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(conn.deref_mut())
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        let raw = serde_json::to_string(&value)?;

        let _: () = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(raw)
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(conn.deref_mut())
            .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;

        let _: i64 = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(conn.deref_mut())
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_redis::{Config as DeadpoolConfig, Runtime};

    fn lazy_pool() -> RedisPool {
        // Building a pool does not connect; connections are opened on first use.
        DeadpoolConfig::from_url("redis://127.0.0.1:6379")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap()
    }

    #[tokio::test]
    async fn test_prefixed_keys() {
        let store = RedisStore::new(lazy_pool()).with_prefix("ratelimit");
        assert_eq!(store.full_key("rate_limit_abc"), "ratelimit:rate_limit_abc");

        let bare = RedisStore::new(lazy_pool());
        assert_eq!(bare.full_key("k"), "k");
    }
}
