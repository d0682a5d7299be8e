//! Sliding window rate limiter

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{validate_window, RateLimitDecision, RateLimiter};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{self, KeyValueStore};

/// Persisted window state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct WindowState {
    count: u64,
    reset: i64,
    window_start: i64,
}

impl WindowState {
    fn fresh(now: i64, window: i64) -> Self {
        Self {
            count: 0,
            reset: now + window,
            window_start: now,
        }
    }
}

/// Approximates a rolling window by linearly decaying a single counter
///
/// The stored count is scaled by `1 - elapsed / window` on every attempt,
/// where `elapsed` is measured from the moment the window was opened. Once a
/// full window has elapsed the counter starts over. The reported `reset` is
/// fixed when the window opens and is not moved as the count decays.
#[derive(Clone)]
pub struct SlidingWindowRateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowRateLimiter {
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
impl RateLimiter for SlidingWindowRateLimiter {
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

        let mut state = store::get_or(
            self.store.as_ref(),
            identifier,
            WindowState::fresh(now, window),
        )
        .await?;

        let elapsed = now - state.window_start;
        if elapsed >= window {
            state = WindowState::fresh(now, window);
        } else {
            let weight = 1.0 - elapsed.max(0) as f64 / window as f64;
            state.count = (state.count as f64 * weight) as u64;
        }

        let allowed = state.count.saturating_add(cost) <= limit;
        if allowed {
            state.count += cost;
            store::put(self.store.as_ref(), identifier, &state, window_secs).await?;
        }

        trace!(
            key = %identifier,
            count = state.count,
            limit,
            allowed,
            "sliding window attempt"
        );

        Ok(RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(state.count),
            reset: state.reset,
        })
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        self.store.delete(identifier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn limiter_at(start: f64) -> (SlidingWindowRateLimiter, ManualClock) {
        let clock = ManualClock::new(start);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = SlidingWindowRateLimiter::with_clock(store, Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_half_window_decay_admits_half_limit() {
        let (limiter, clock) = limiter_at(5_000.0);

        let full = limiter.attempt("client", 100, 60, 100).await.unwrap();
        assert!(full.allowed);
        assert_eq!(full.remaining, 0);

        clock.advance(30.0);
        let decision = limiter.attempt("client", 100, 60, 50).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_decay_is_monotonic_within_window() {
        let (limiter, clock) = limiter_at(5_000.0);
        limiter.attempt("client", 100, 60, 90).await.unwrap();

        // Zero-cost attempts: the count only ever shrinks as time passes.
        let mut last_remaining = 10;
        for _ in 0..5 {
            clock.advance(10.0);
            let decision = limiter.attempt("client", 100, 60, 0).await.unwrap();
            assert!(decision.remaining >= last_remaining);
            last_remaining = decision.remaining;
        }
        assert!(last_remaining > 10);
    }

    #[tokio::test]
    async fn test_full_window_resets_count() {
        let (limiter, clock) = limiter_at(5_000.0);

        limiter.attempt("client", 10, 60, 10).await.unwrap();
        assert!(!limiter.attempt("client", 10, 60, 1).await.unwrap().allowed);

        clock.advance(60.0);
        let decision = limiter.attempt("client", 10, 60, 10).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset, 5_120);
    }

    #[tokio::test]
    async fn test_reset_timestamp_is_anchored_to_window_open() {
        let (limiter, clock) = limiter_at(5_000.0);

        let first = limiter.attempt("client", 10, 60, 1).await.unwrap();
        assert_eq!(first.reset, 5_060);

        clock.advance(45.0);
        let later = limiter.attempt("client", 10, 60, 1).await.unwrap();
        assert_eq!(later.reset, 5_060);
    }

    #[tokio::test]
    async fn test_denied_attempt_reports_decayed_count() {
        let (limiter, clock) = limiter_at(5_000.0);

        limiter.attempt("client", 10, 60, 10).await.unwrap();
        clock.advance(30.0);

        // 10 * 0.5 = 5 in flight, 6 more would overflow
        let decision = limiter.attempt("client", 10, 60, 6).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 5);
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let (limiter, _) = limiter_at(5_000.0);

        limiter.attempt("client", 5, 60, 5).await.unwrap();
        limiter.reset("client").await.unwrap();

        let decision = limiter.attempt("client", 5, 60, 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }
}
