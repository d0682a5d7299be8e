//! Error types and HTTP response conversion

use axum::{
    http::{header::HeaderValue, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the rate limiter
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Invalid rate limiter configuration (unknown strategy class, bad window)
    #[error("Rate limiter misconfigured: {0}")]
    Configuration(String),

    /// Key-value store failure (serialization, backend)
    #[error("Store error: {0}")]
    Store(String),

    /// Redis error
    #[cfg(feature = "cache")]
    #[error("Redis error: {0}")]
    Redis(Box<redis::RedisError>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rate limit exceeded (429)
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        /// User-facing message
        message: String,
        /// Seconds the client should wait before retrying
        retry_after: Option<u64>,
    },

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a rate limit exceeded error
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Error::RateLimitExceeded {
            message: message.into(),
            retry_after,
        }
    }

    /// Whether this error is a rate limit denial rather than a failure
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimitExceeded { .. })
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Optional error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    /// Create error response with a code
    pub fn with_code(
        status: StatusCode,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut retry_after_header = None;

        let (status, error_response) = match self {
            Error::RateLimitExceeded {
                message,
                retry_after,
            } => {
                retry_after_header = retry_after;
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    ErrorResponse::with_code(
                        StatusCode::TOO_MANY_REQUESTS,
                        "RATE_LIMIT_EXCEEDED",
                        message,
                    ),
                )
            }

            Error::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    e.to_string(),
                ),
            ),

            Error::Configuration(msg) => {
                tracing::error!("Rate limiter misconfigured: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "CONFIG_ERROR",
                        "Rate limiter misconfigured",
                    ),
                )
            }

            Error::Store(msg) => {
                tracing::error!("Store error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "STORE_ERROR",
                        "Rate limit store unavailable",
                    ),
                )
            }

            #[cfg(feature = "cache")]
            Error::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "CACHE_ERROR",
                        "Cache operation failed",
                    ),
                )
            }

            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "IO_ERROR",
                        "Internal server error",
                    ),
                )
            }

            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "Internal server error",
                    ),
                )
            }
        };

        let mut response = (status, Json(error_response)).into_response();

        if let Some(secs) = retry_after_header {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("retry-after"), value);
            }
        }

        response
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(format!("serialization failed: {}", err))
    }
}

#[cfg(feature = "cache")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}
