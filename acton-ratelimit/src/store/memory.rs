//! In-process store backed by `DashMap`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::KeyValueStore;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: f64,
}

/// In-memory key-value store with lazy TTL expiry
///
/// Expired entries are dropped when next read, or in bulk by
/// [`purge_expired`](Self::purge_expired). Keys that are never read again
/// (past fixed windows, clients that went away) are only reclaimed by a purge,
/// so long-running processes should run [`spawn_purge`](Self::spawn_purge).
/// Suitable for a single instance or for tests; use
/// [`RedisStore`](super::RedisStore) to share limits across instances.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store using the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that expires entries against `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of entries currently held, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Purge expired entries every `period` on a background task
    ///
    /// The task runs until the returned handle is aborted or the runtime
    /// shuts down.
    pub fn spawn_purge(&self, period: Duration) -> JoinHandle<()> {
        let store = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = store.len(), "Purged expired entries");
                }
            }
        })
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = self.clock.now();

        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }

        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<()> {
        let expires_at = self.clock.now() + ttl_secs as f64;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
