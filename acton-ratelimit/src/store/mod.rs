//! Key-value store contract consumed by the rate limiters
//!
//! Limiters persist their state as JSON documents through [`KeyValueStore`].
//! The store owns expiry: every write carries a TTL and the store is expected
//! to drop the entry once it elapses. No compare-and-swap is required; limiters
//! perform a plain read-modify-write and accept lost updates under contention.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub mod memory;
#[cfg(feature = "cache")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "cache")]
pub use self::redis::RedisStore;

/// Minimal key-value capability backing the limiters
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value stored under `key`, or `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key` for `ttl_secs` seconds
    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<()>;

    /// Remove `key`
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Read `key` and decode it, falling back to `default` when absent
pub async fn get_or<T>(store: &dyn KeyValueStore, key: &str, default: T) -> Result<T>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(default),
    }
}

/// Encode `value` and write it under `key`
pub async fn put<T>(store: &dyn KeyValueStore, key: &str, value: &T, ttl_secs: u64) -> Result<()>
where
    T: Serialize,
{
    let value = serde_json::to_value(value)?;
    store.set(key, value, ttl_secs.max(1)).await
}

/// Named store handles, resolved once at startup
///
/// The `cache` option of [`RateLimitConfig`](crate::config::RateLimitConfig)
/// selects an entry from here; the chosen handle is then passed to the
/// middleware explicitly.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: HashMap<String, Arc<dyn KeyValueStore>>,
}

impl StoreRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under `name`
    pub fn with_store(mut self, name: impl Into<String>, store: Arc<dyn KeyValueStore>) -> Self {
        self.stores.insert(name.into(), store);
        self
    }

    /// Look up a store by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn KeyValueStore>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("no store registered as '{}'", name)))
    }

    /// Registered store names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u64,
    }

    #[tokio::test]
    async fn test_get_or_returns_default_when_missing() {
        let store = MemoryStore::new();
        let value = get_or(&store, "missing", Sample { count: 7 }).await.unwrap();
        assert_eq!(value, Sample { count: 7 });
    }

    #[tokio::test]
    async fn test_put_then_get_or() {
        let store = MemoryStore::new();
        put(&store, "k", &Sample { count: 3 }, 60).await.unwrap();

        let value = get_or(&store, "k", Sample { count: 0 }).await.unwrap();
        assert_eq!(value, Sample { count: 3 });
    }

    #[tokio::test]
    async fn test_get_or_surfaces_shape_mismatch() {
        let store = MemoryStore::new();
        store
            .set("k", serde_json::json!("not a sample"), 60)
            .await
            .unwrap();

        let err = get_or(&store, "k", Sample { count: 0 }).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StoreRegistry::new().with_store("default", Arc::new(MemoryStore::new()));

        assert!(registry.get("default").is_ok());
        assert!(matches!(
            registry.get("redis"),
            Err(Error::Configuration(_))
        ));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["default"]);
    }
}
