//! Demo service protected by the rate limiting middleware
//!
//! Stores are registered as `default` (in-process memory) and, with the
//! `cache` feature and a `[redis]` section, `redis`. Select one with
//! `rate_limit.cache`.

use std::sync::Arc;
use std::time::Duration;

use acton_ratelimit::prelude::*;
use anyhow::Context;

/// How often the in-process store drops expired entries
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

async fn index() -> &'static str {
    "ok"
}

async fn login() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "accepted" }))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn build_stores(config: &Config) -> anyhow::Result<StoreRegistry> {
    let memory = MemoryStore::new();
    memory.spawn_purge(PURGE_INTERVAL);
    let registry = StoreRegistry::new().with_store("default", Arc::new(memory));

    #[cfg(feature = "cache")]
    {
        if let Some(redis) = &config.redis {
            let store = connect_store(redis)
                .await
                .context("failed to connect to Redis")?;
            return Ok(registry.with_store("redis", Arc::new(store)));
        }
    }

    #[cfg(not(feature = "cache"))]
    {
        if config.redis.is_some() {
            warn!("[redis] is configured but the `cache` feature is disabled");
        }
    }

    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config)?;

    let stores = build_stores(&config).await?;
    let store = stores.get(&config.rate_limit.cache)?;

    let rate_limit = RateLimitMiddleware::builder(config.rate_limit.clone(), store)
        .skip_check(Arc::new(|req: &Request| req.uri().path() == "/health"))
        .limiter_resolver(Arc::new(|req: &Request| {
            (req.uri().path() == "/login").then(|| "login".to_string())
        }))
        .build()
        .context("invalid rate limit configuration")?;

    let app = Router::new()
        .route("/", get(index))
        .route("/login", post(login))
        .route("/health", get(health))
        .layer(axum::middleware::from_fn_with_state(
            rate_limit,
            RateLimitMiddleware::middleware,
        ));

    Server::new(config).serve(app).await?;

    Ok(())
}
