//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: ACTON_, sections separated by `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/acton-ratelimit/{service_name}/config.toml
//! 4. System directory: /etc/acton-ratelimit/{service_name}/config.toml
//! 5. Default values
//!
//! # Example (config.toml)
//!
//! ```toml
//! [service]
//! name = "edge"
//! port = 8080
//!
//! [rate_limit]
//! limit = 100
//! window_secs = 60
//! identifier = ["ip", "route"]
//! strategy = "token_bucket"
//! ip_header = ["cf-connecting-ip", "x-forwarded-for"]
//!
//! [rate_limit.limiters.login]
//! limit = 5
//! window_secs = 300
//! strategy = "fixed_window"
//! message = "Too many login attempts"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::identifier::IdentifierType;
use crate::limiter::Strategy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Redis configuration (optional)
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// A setting that accepts either a single value or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single value
    One(T),
    /// An ordered list of values
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// View the values as a slice
    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        }
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(values: Vec<T>) -> Self {
        Self::Many(values)
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum units allowed per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How clients are identified; a list is joined with `_`
    #[serde(default = "default_identifier")]
    pub identifier: OneOrMany<IdentifierType>,

    /// Built-in algorithm to apply
    #[serde(default)]
    pub strategy: Strategy,

    /// Name of a registered custom limiter; takes precedence over `strategy`
    #[serde(default)]
    pub strategy_class: Option<String>,

    /// Name of the store holding limiter state
    #[serde(default = "default_cache")]
    pub cache: String,

    /// Whether to add `X-RateLimit-*` headers to allowed responses
    #[serde(default = "default_true")]
    pub headers: bool,

    /// Message returned when the limit is exceeded
    #[serde(default = "default_message")]
    pub message: String,

    /// Header(s) consulted, in order, for the client IP
    #[serde(default = "default_ip_header")]
    pub ip_header: OneOrMany<String>,

    /// Whether denials carry a `Retry-After` header
    #[serde(default = "default_true")]
    pub include_retry_after: bool,

    /// Headers scanned, in order, for an API key or bearer token
    #[serde(default = "default_token_headers")]
    pub token_headers: Vec<String>,

    /// Named policy overrides, selected per request
    #[serde(default)]
    pub limiters: HashMap<String, LimiterPolicy>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
            identifier: default_identifier(),
            strategy: Strategy::default(),
            strategy_class: None,
            cache: default_cache(),
            headers: true,
            message: default_message(),
            ip_header: default_ip_header(),
            include_retry_after: true,
            token_headers: default_token_headers(),
            limiters: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Add a named policy override
    pub fn with_limiter(mut self, name: impl Into<String>, policy: LimiterPolicy) -> Self {
        self.limiters.insert(name.into(), policy);
        self
    }
}

/// Named policy override; unset fields fall back to the global settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterPolicy {
    /// Maximum units allowed per window
    #[serde(default)]
    pub limit: Option<u64>,

    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,

    /// Built-in algorithm to apply
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// Name of a registered custom limiter
    #[serde(default)]
    pub strategy_class: Option<String>,

    /// Message returned when the limit is exceeded
    #[serde(default)]
    pub message: Option<String>,
}

impl LimiterPolicy {
    /// Create an empty override
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the window length
    pub fn with_window_secs(mut self, window_secs: u64) -> Self {
        self.window_secs = Some(window_secs);
        self
    }

    /// Set the built-in strategy
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set the custom limiter name
    pub fn with_strategy_class(mut self, name: impl Into<String>) -> Self {
        self.strategy_class = Some(name.into());
        self
    }

    /// Set the denial message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (redis://host:port)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Maximum retry attempts for establishing Redis connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Prefix applied to every limiter key
    #[serde(default)]
    pub key_prefix: Option<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_limit() -> u64 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_identifier() -> OneOrMany<IdentifierType> {
    OneOrMany::One(IdentifierType::Ip)
}

fn default_cache() -> String {
    "default".to_string()
}

fn default_message() -> String {
    "Rate limit exceeded. Please try again later.".to_string()
}

fn default_ip_header() -> OneOrMany<String> {
    OneOrMany::One("x-forwarded-for".to_string())
}

fn default_token_headers() -> Vec<String> {
    vec!["Authorization".to_string(), "X-API-Key".to_string()]
}

fn default_redis_max_connections() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found is used):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/acton-ratelimit/{service_name}/config.toml
    /// 3. System directory: /etc/acton-ratelimit/{service_name}/config.toml
    ///
    /// Environment variables (ACTON_ prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "acton-ratelimit".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first so higher priority files override
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("ACTON_").split("__"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// Bypasses XDG directories. Useful for testing or non-standard deployments.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ACTON_").split("__"))
            .extract()?;

        Ok(config)
    }

    /// Candidate config file paths, highest priority first
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix("acton-ratelimit");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Some(path) = xdg_dirs.find_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc/acton-ratelimit")
                .join(service_name)
                .join("config.toml"),
        );

        paths
    }

    /// Get Redis URL
    pub fn redis_url(&self) -> Option<&str> {
        self.redis.as_ref().map(|r| r.url.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "acton-ratelimit".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
            },
            rate_limit: RateLimitConfig::default(),
            redis: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.rate_limit.limit, 60);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.rate_limit.strategy, Strategy::SlidingWindow);
        assert_eq!(config.rate_limit.identifier.as_slice(), &[IdentifierType::Ip]);
        assert_eq!(config.rate_limit.ip_header.as_slice(), &["x-forwarded-for".to_string()]);
        assert_eq!(
            config.rate_limit.token_headers,
            vec!["Authorization".to_string(), "X-API-Key".to_string()]
        );
        assert!(config.rate_limit.headers);
        assert!(config.rate_limit.include_retry_after);
        assert_eq!(config.rate_limit.cache, "default");
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "edge"

[rate_limit]
limit = 100
identifier = ["ip", "route"]
strategy = "token_bucket"
ip_header = ["cf-connecting-ip", "x-forwarded-for"]

[rate_limit.limiters.login]
limit = 5
window_secs = 300
strategy = "fixed_window"
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();

        assert_eq!(config.service.name, "edge");
        assert_eq!(config.rate_limit.limit, 100);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.rate_limit.strategy, Strategy::TokenBucket);
        assert_eq!(
            config.rate_limit.identifier.as_slice(),
            &[IdentifierType::Ip, IdentifierType::Route]
        );
        assert_eq!(config.rate_limit.ip_header.as_slice().len(), 2);

        let login = &config.rate_limit.limiters["login"];
        assert_eq!(login.limit, Some(5));
        assert_eq!(login.window_secs, Some(300));
        assert_eq!(login.strategy, Some(Strategy::FixedWindow));
        assert_eq!(login.message, None);
    }

    #[test]
    fn test_limiter_policy_builder() {
        let policy = LimiterPolicy::new()
            .with_limit(10)
            .with_window_secs(30)
            .with_strategy_class("leaky")
            .with_message("slow down");

        assert_eq!(policy.limit, Some(10));
        assert_eq!(policy.window_secs, Some(30));
        assert_eq!(policy.strategy_class.as_deref(), Some("leaky"));
        assert_eq!(policy.message.as_deref(), Some("slow down"));
    }
}
