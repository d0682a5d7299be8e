//! Token bucket rate limiter

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{validate_window, RateLimitDecision, RateLimiter};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{self, KeyValueStore};

/// Persisted bucket state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_update: f64,
}

/// Bucket of `limit` tokens refilling continuously at `limit / window` per second
///
/// Refill uses fractional seconds; `remaining` is reported as whole tokens.
/// State is written back on every attempt, allowed or not, so the refill
/// clock keeps running.
#[derive(Clone)]
pub struct TokenBucketRateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketRateLimiter {
    /// Create a limiter using the system clock
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`
    pub fn with_clock(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    async fn attempt(
        &self,
        identifier: &str,
        limit: u64,
        window_secs: u64,
        cost: u64,
    ) -> Result<RateLimitDecision> {
        validate_window(window_secs)?;

        let now = self.clock.now();
        let capacity = limit as f64;
        let refill_rate = capacity / window_secs as f64;

        let mut state = store::get_or(
            self.store.as_ref(),
            identifier,
            BucketState {
                tokens: capacity,
                last_update: now,
            },
        )
        .await?;

        let elapsed = (now - state.last_update).max(0.0);
        state.tokens = capacity.min(state.tokens + elapsed * refill_rate);
        state.last_update = now;

        let allowed = state.tokens >= cost as f64;
        if allowed {
            state.tokens -= cost as f64;
        }

        store::put(self.store.as_ref(), identifier, &state, window_secs).await?;

        let reset = if refill_rate > 0.0 {
            (now + (capacity - state.tokens) / refill_rate).floor() as i64
        } else {
            now.floor() as i64
        };

        trace!(
            key = %identifier,
            tokens = state.tokens,
            limit,
            allowed,
            "token bucket attempt"
        );

        Ok(RateLimitDecision {
            allowed,
            limit,
            remaining: (state.tokens.floor().max(0.0) as u64).min(limit),
            reset,
        })
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        self.store.delete(identifier).await
    }
}
