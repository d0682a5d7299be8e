//! Redis connection pool management

use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::time::Duration;

use crate::{
    config::RedisConfig,
    error::{Error, Result},
    store::RedisStore,
};

/// Create a Redis connection pool with retry logic
///
/// Retries up to `max_retries` times with exponential backoff starting at
/// `retry_delay_secs`.
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Redis connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Redis connection pool created: max_connections={}",
                        config.max_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to Redis after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));

                tracing::warn!(
                    "Redis connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Connect and wrap the pool in a [`RedisStore`] using the configured prefix
pub async fn connect_store(config: &RedisConfig) -> Result<RedisStore> {
    let store = RedisStore::new(create_pool(config).await?);
    Ok(match &config.key_prefix {
        Some(prefix) => store.with_prefix(prefix.clone()),
        None => store,
    })
}

/// Attempt to create a Redis pool (single try)
async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let pool = DeadpoolConfig::from_url(&config.url)
        .builder()
        .map_err(|e| Error::Internal(format!("Failed to build Redis pool: {}", e)))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create Redis pool: {}", e)))?;

    // Test the connection
    let conn = pool
        .get()
        .await
        .map_err(|e| Error::Internal(format!("Failed to get Redis connection: {}", e)))?;
    drop(conn);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_fails_without_retry() {
        let config = RedisConfig {
            url: "not-a-url".to_string(),
            max_connections: 4,
            max_retries: 0,
            retry_delay_secs: 0,
            key_prefix: None,
        };

        let err = create_pool(&config).await.err().unwrap();
        assert!(matches!(err, Error::Internal(_)));
    }
}
