//! HTTP middleware

pub mod rate_limit;

pub use rate_limit::{
    CostCallback, KeyGenerator, PreparedCheck, RateLimitBuilder, RateLimitMiddleware,
    RateLimitOutcome, SkipCheck, KEY_PREFIX,
};
