//! Rate limiting strategies
//!
//! Every strategy implements [`RateLimiter`] against a [`KeyValueStore`]:
//! a single `attempt` that consumes `cost` units from the quota tracked under
//! an identifier, and a `reset` that clears that quota.
//!
//! Strategies are chosen by the closed [`Strategy`] enum through
//! [`build_limiter`]. Custom implementations are registered by name in a
//! [`LimiterRegistry`] and selected with the `strategy_class` option.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::KeyValueStore;

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

pub use fixed_window::FixedWindowRateLimiter;
pub use sliding_window::SlidingWindowRateLimiter;
pub use token_bucket::TokenBucketRateLimiter;

/// Outcome of a single [`RateLimiter::attempt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Ceiling in effect for this check
    pub limit: u64,
    /// Units left after this attempt, never above `limit`
    pub remaining: u64,
    /// Unix timestamp at which the quota is fully restored
    pub reset: i64,
}

/// Admission control over a quota tracked in a key-value store
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to consume `cost` units of a `limit` per `window_secs` quota
    async fn attempt(
        &self,
        identifier: &str,
        limit: u64,
        window_secs: u64,
        cost: u64,
    ) -> Result<RateLimitDecision>;

    /// Clear all state tracked for `identifier`
    ///
    /// `identifier` is the same value passed to `attempt`, usually the
    /// generated `rate_limit_<hash>` key.
    async fn reset(&self, identifier: &str) -> Result<()>;
}

/// Built-in rate limiting algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Decaying counter approximating a rolling window
    #[default]
    SlidingWindow,
    /// Continuously refilling bucket
    TokenBucket,
    /// Counter per discrete window
    FixedWindow,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlidingWindow => write!(f, "sliding_window"),
            Self::TokenBucket => write!(f, "token_bucket"),
            Self::FixedWindow => write!(f, "fixed_window"),
        }
    }
}

/// Build a built-in limiter bound to `store`
pub fn build_limiter(
    strategy: Strategy,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn RateLimiter> {
    match strategy {
        Strategy::SlidingWindow => Arc::new(SlidingWindowRateLimiter::with_clock(store, clock)),
        Strategy::TokenBucket => Arc::new(TokenBucketRateLimiter::with_clock(store, clock)),
        Strategy::FixedWindow => Arc::new(FixedWindowRateLimiter::with_clock(store, clock)),
    }
}

/// Constructor for a custom limiter
pub type LimiterFactory =
    Arc<dyn Fn(Arc<dyn KeyValueStore>, Arc<dyn Clock>) -> Arc<dyn RateLimiter> + Send + Sync>;

/// Named custom limiter constructors
///
/// Names registered here are what the `strategy_class` option refers to.
#[derive(Clone, Default)]
pub struct LimiterRegistry {
    factories: HashMap<String, LimiterFactory>,
}

impl LimiterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a limiter constructor under `name`
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Arc<dyn KeyValueStore>, Arc<dyn Clock>) -> Arc<dyn RateLimiter>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate the limiter registered as `name`
    ///
    /// An unknown name is a configuration error rather than a silent fallback
    /// to the default strategy.
    pub fn build(
        &self,
        name: &str,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn RateLimiter>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::Configuration(format!("unknown strategy class '{}'", name))
        })?;
        Ok(factory(store, clock))
    }
}

impl fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn validate_window(window_secs: u64) -> Result<()> {
    if window_secs == 0 {
        return Err(Error::Configuration(
            "rate limit window must be at least one second".to_string(),
        ));
    }
    Ok(())
}
