//! Fixed window rate limiter

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::{validate_window, RateLimitDecision, RateLimiter};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{self, KeyValueStore};

/// Window assumed by [`FixedWindowRateLimiter::reset`] when rebuilding the key
pub const RESET_REFERENCE_WINDOW_SECS: i64 = 3600;

/// Counts requests per discrete window aligned to multiples of the window size
///
/// Each window gets its own key (`<identifier>_<window_start>`) that expires
/// when the window ends. Requests straddling a boundary can briefly exceed
/// the limit over a span shorter than one window.
#[derive(Clone)]
pub struct FixedWindowRateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowRateLimiter {
    /// Create a limiter using the system clock
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`
    pub fn with_clock(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn window_key(identifier: &str, window_start: i64) -> String {
        format!("{}_{}", identifier, window_start)
    }
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn attempt(
        &self,
        identifier: &str,
        limit: u64,
        window_secs: u64,
        cost: u64,
    ) -> Result<RateLimitDecision> {
        validate_window(window_secs)?;

        let now = self.clock.now_secs();
        let window = window_secs as i64;
        let window_start = now.div_euclid(window) * window;
        let key = Self::window_key(identifier, window_start);

        let mut count: u64 = store::get_or(self.store.as_ref(), &key, 0).await?;
        let allowed = count.saturating_add(cost) <= limit;

        if allowed {
            count += cost;
            let ttl = (window_start + window - now) as u64;
            store::put(self.store.as_ref(), &key, &count, ttl).await?;
        }

        trace!(key = %key, count, limit, allowed, "fixed window attempt");

        Ok(RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset: window_start + window,
        })
    }

    /// Delete the counter of the current window
    ///
    /// The key is rebuilt with a [`RESET_REFERENCE_WINDOW_SECS`] window, so it
    /// only matches counters created with a one hour window. Counters for any
    /// other window size are left to expire on their own.
    async fn reset(&self, identifier: &str) -> Result<()> {
        let now = self.clock.now_secs();
        let window_start =
            now.div_euclid(RESET_REFERENCE_WINDOW_SECS) * RESET_REFERENCE_WINDOW_SECS;
        self.store
            .delete(&Self::window_key(identifier, window_start))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn limiter_at(start: f64) -> (FixedWindowRateLimiter, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(start);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = FixedWindowRateLimiter::with_clock(store.clone(), Arc::new(clock.clone()));
        (limiter, clock, store)
    }

    #[tokio::test]
    async fn test_six_calls_in_one_window() {
        let (limiter, clock, _) = limiter_at(1_200.0);

        let mut remaining = Vec::new();
        for _ in 0..5 {
            let decision = limiter.attempt("client", 5, 60, 1).await.unwrap();
            assert!(decision.allowed);
            remaining.push(decision.remaining);
            clock.advance(1.0);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let denied = limiter.attempt("client", 5, 60, 1).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 5);
    }

    #[tokio::test]
    async fn test_reset_is_window_end() {
        let (limiter, _, _) = limiter_at(1_234.5);

        let decision = limiter.attempt("client", 10, 60, 1).await.unwrap();
        assert_eq!(decision.reset, 1_260);
    }

    #[tokio::test]
    async fn test_next_window_starts_fresh() {
        let (limiter, clock, _) = limiter_at(1_200.0);

        let decision = limiter.attempt("client", 2, 60, 2).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!limiter.attempt("client", 2, 60, 1).await.unwrap().allowed);

        clock.set(1_260.0);
        let decision = limiter.attempt("client", 2, 60, 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset, 1_320);
    }

    #[tokio::test]
    async fn test_denied_attempt_does_not_count() {
        let (limiter, _, _) = limiter_at(1_200.0);

        assert!(limiter.attempt("client", 3, 60, 2).await.unwrap().allowed);
        let denied = limiter.attempt("client", 3, 60, 2).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 1);

        let decision = limiter.attempt("client", 3, 60, 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_counter_expires_with_window() {
        let (limiter, clock, store) = limiter_at(1_230.0);

        limiter.attempt("client", 5, 60, 1).await.unwrap();
        let key = FixedWindowRateLimiter::window_key("client", 1_200);
        assert!(store.get(&key).await.unwrap().is_some());

        clock.set(1_260.0);
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_with_hour_window() {
        let (limiter, _, _) = limiter_at(7_300.0);

        for _ in 0..3 {
            limiter.attempt("client", 3, 3600, 1).await.unwrap();
        }
        assert!(!limiter.attempt("client", 3, 3600, 1).await.unwrap().allowed);

        limiter.reset("client").await.unwrap();

        let decision = limiter.attempt("client", 3, 3600, 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_reset_misses_other_window_sizes() {
        // 7_300 falls in the 60s window starting at 7_260 but the hour window
        // starting at 7_200, so reset targets a different key.
        let (limiter, _, _) = limiter_at(7_300.0);

        limiter.attempt("client", 1, 60, 1).await.unwrap();
        limiter.reset("client").await.unwrap();

        assert!(!limiter.attempt("client", 1, 60, 1).await.unwrap().allowed);
    }
}
