//! # acton-ratelimit
//!
//! Store-backed HTTP rate limiting for axum services.
//!
//! ## Features
//!
//! - **Strategies**: sliding window (default), token bucket, fixed window, or
//!   any custom [`RateLimiter`](limiter::RateLimiter) registered by name
//! - **Identity**: client IP, authenticated user, route, API key or bearer
//!   token, alone or combined
//! - **Policies**: named per-route overrides of limit, window, strategy and message
//! - **Stores**: in-process memory or Redis (`cache` feature) for limits
//!   shared across instances
//! - **Headers**: `X-RateLimit-*` on every limited response, `Retry-After` on 429
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use acton_ratelimit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let rate_limit = RateLimitMiddleware::new(config.rate_limit.clone(), store)?;
//!
//!     let app = Router::new()
//!         .route("/", get(|| async { "ok" }))
//!         .layer(axum::middleware::from_fn_with_state(
//!             rate_limit,
//!             RateLimitMiddleware::middleware,
//!         ));
//!
//!     Server::new(config).serve(app).await
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod identifier;
pub mod limiter;
pub mod middleware;
pub mod observability;
pub mod policy;
pub mod server;
pub mod store;

#[cfg(feature = "cache")]
pub mod cache;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{Config, LimiterPolicy, OneOrMany, RateLimitConfig, RedisConfig};
    pub use crate::error::{Error, ErrorResponse, Result};
    pub use crate::identifier::{
        AuthenticatedUser, IdentifierCallback, IdentifierResolver, IdentifierType, RouteParams,
    };
    pub use crate::limiter::{
        build_limiter, FixedWindowRateLimiter, LimiterRegistry, RateLimitDecision, RateLimiter,
        SlidingWindowRateLimiter, Strategy, TokenBucketRateLimiter,
    };
    pub use crate::middleware::{
        CostCallback, KeyGenerator, PreparedCheck, RateLimitMiddleware, RateLimitOutcome,
        SkipCheck,
    };
    pub use crate::observability::init_tracing;
    pub use crate::policy::{LimitCallback, LimiterResolver, Policy, PolicyResolver};
    pub use crate::server::Server;
    pub use crate::store::{KeyValueStore, MemoryStore, StoreRegistry};

    #[cfg(feature = "cache")]
    pub use crate::store::RedisStore;

    #[cfg(feature = "cache")]
    pub use crate::cache::{connect_store, create_pool};

    pub use axum::{
        extract::{Request, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::{delete, get, post, put},
        Json, Router,
    };

    pub use serde::{Deserialize, Serialize};

    pub use tracing::{debug, error, info, instrument, trace, warn};
}
