//! Per-request policy resolution
//!
//! A request is limited either by the global settings or by a named
//! [`LimiterPolicy`] picked from the `limiters` map. The name comes from a
//! resolver callback or, failing that, from the route's [`RouteParams`].
//! Fields left unset on the named policy fall back to the global settings.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Request;

use crate::config::{LimiterPolicy, RateLimitConfig};
use crate::identifier::RouteParams;
use crate::limiter::Strategy;

/// Picks a named policy for a request
pub type LimiterResolver = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// Computes the limit for a request and its resolved identity
pub type LimitCallback = Arc<dyn Fn(&Request, &str) -> u64 + Send + Sync>;

/// Effective settings for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Name of the matched policy, `None` for the global defaults
    pub name: Option<String>,
    /// Maximum units per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Built-in algorithm
    pub strategy: Strategy,
    /// Registered custom limiter, takes precedence over `strategy`
    pub strategy_class: Option<String>,
    /// Denial message
    pub message: String,
}

/// Resolves the [`Policy`] in effect for a request
#[derive(Clone)]
pub struct PolicyResolver {
    defaults: LimiterDefaults,
    limiters: HashMap<String, LimiterPolicy>,
    resolver: Option<LimiterResolver>,
    limit_callback: Option<LimitCallback>,
}

#[derive(Debug, Clone)]
struct LimiterDefaults {
    limit: u64,
    window_secs: u64,
    strategy: Strategy,
    strategy_class: Option<String>,
    message: String,
}

impl PolicyResolver {
    /// Create a resolver from the rate limit configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            defaults: LimiterDefaults {
                limit: config.limit,
                window_secs: config.window_secs,
                strategy: config.strategy,
                strategy_class: config.strategy_class.clone(),
                message: config.message.clone(),
            },
            limiters: config.limiters.clone(),
            resolver: None,
            limit_callback: None,
        }
    }

    /// Choose the named policy with `resolver` before consulting the route
    pub fn with_resolver(mut self, resolver: LimiterResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Compute the limit dynamically when the named policy does not set one
    pub fn with_limit_callback(mut self, callback: LimitCallback) -> Self {
        self.limit_callback = Some(callback);
        self
    }

    /// Name and override of the policy selected for `request`, if any
    pub fn select<'a>(&'a self, request: &Request) -> Option<(&'a str, &'a LimiterPolicy)> {
        if let Some(resolver) = &self.resolver {
            if let Some(found) = resolver(request).and_then(|name| self.named(&name)) {
                return Some(found);
            }
        }

        request
            .extensions()
            .get::<RouteParams>()
            .and_then(|params| params.rate_limiter.as_deref())
            .and_then(|name| self.named(name))
    }

    fn named(&self, name: &str) -> Option<(&str, &LimiterPolicy)> {
        self.limiters
            .get_key_value(name)
            .map(|(name, policy)| (name.as_str(), policy))
    }

    /// Merge the selected override over the defaults for `request`
    ///
    /// The limit comes from the named policy, else the limit callback, else
    /// the global limit.
    pub fn resolve(&self, request: &Request, identifier: &str) -> Policy {
        let selected = self.select(request);
        let named = selected.map(|(_, policy)| policy);

        let limit = match named.and_then(|p| p.limit) {
            Some(limit) => limit,
            None => match &self.limit_callback {
                Some(callback) => callback(request, identifier),
                None => self.defaults.limit,
            },
        };

        let strategy_class = named
            .and_then(|p| p.strategy_class.clone())
            .or_else(|| self.defaults.strategy_class.clone());

        Policy {
            name: selected.map(|(name, _)| name.to_string()),
            limit,
            window_secs: named
                .and_then(|p| p.window_secs)
                .unwrap_or(self.defaults.window_secs),
            strategy: named
                .and_then(|p| p.strategy)
                .unwrap_or(self.defaults.strategy),
            strategy_class,
            message: named
                .and_then(|p| p.message.clone())
                .unwrap_or_else(|| self.defaults.message.clone()),
        }
    }

    /// Every custom limiter name referenced by the configuration
    pub fn strategy_classes(&self) -> impl Iterator<Item = &str> {
        self.defaults
            .strategy_class
            .as_deref()
            .into_iter()
            .chain(
                self.limiters
                    .values()
                    .filter_map(|p| p.strategy_class.as_deref()),
            )
    }
}

impl std::fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyResolver")
            .field("defaults", &self.defaults)
            .field("limiters", &self.limiters)
            .field("resolver", &self.resolver.is_some())
            .field("limit_callback", &self.limit_callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn config() -> RateLimitConfig {
        RateLimitConfig::default()
            .with_limiter(
                "login",
                LimiterPolicy::new()
                    .with_limit(5)
                    .with_window_secs(300)
                    .with_strategy(Strategy::FixedWindow)
                    .with_message("Too many login attempts"),
            )
            .with_limiter("burst", LimiterPolicy::new().with_window_secs(1))
    }

    fn request(path: &str) -> Request {
        http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    fn routed(path: &str, limiter: &str) -> Request {
        let mut req = request(path);
        req.extensions_mut()
            .insert(RouteParams::new("Users", "login").with_rate_limiter(limiter));
        req
    }

    #[test]
    fn test_defaults_without_match() {
        let policy = PolicyResolver::from_config(&config()).resolve(&request("/"), "ip");

        assert_eq!(policy.name, None);
        assert_eq!(policy.limit, 60);
        assert_eq!(policy.window_secs, 60);
        assert_eq!(policy.strategy, Strategy::SlidingWindow);
        assert_eq!(policy.message, "Rate limit exceeded. Please try again later.");
    }

    #[test]
    fn test_route_attribute_selects_policy() {
        let policy = PolicyResolver::from_config(&config()).resolve(&routed("/login", "login"), "ip");

        assert_eq!(policy.name.as_deref(), Some("login"));
        assert_eq!(policy.limit, 5);
        assert_eq!(policy.window_secs, 300);
        assert_eq!(policy.strategy, Strategy::FixedWindow);
        assert_eq!(policy.message, "Too many login attempts");
    }

    #[test]
    fn test_unknown_route_policy_uses_defaults() {
        let policy = PolicyResolver::from_config(&config()).resolve(&routed("/x", "nope"), "ip");
        assert_eq!(policy.name, None);
        assert_eq!(policy.limit, 60);
    }

    #[test]
    fn test_resolver_takes_precedence_over_route() {
        let resolver = PolicyResolver::from_config(&config()).with_resolver(Arc::new(
            |req: &Request| req.uri().path().strip_prefix("/p/").map(str::to_string),
        ));

        let policy = resolver.resolve(&routed("/p/burst", "login"), "ip");
        assert_eq!(policy.name.as_deref(), Some("burst"));
        assert_eq!(policy.window_secs, 1);
        assert_eq!(policy.limit, 60);
    }

    #[test]
    fn test_unmatched_resolver_falls_back_to_route() {
        let resolver = PolicyResolver::from_config(&config())
            .with_resolver(Arc::new(|_: &Request| Some("missing".to_string())));

        let policy = resolver.resolve(&routed("/login", "login"), "ip");
        assert_eq!(policy.name.as_deref(), Some("login"));
    }

    #[test]
    fn test_limit_callback_applies_without_named_limit() {
        let resolver = PolicyResolver::from_config(&config()).with_limit_callback(Arc::new(
            |_: &Request, identifier: &str| if identifier.starts_with("user_") { 1000 } else { 10 },
        ));

        assert_eq!(resolver.resolve(&request("/"), "user_1").limit, 1000);
        assert_eq!(resolver.resolve(&request("/"), "1.2.3.4").limit, 10);
        // named policy without a limit still defers to the callback
        assert_eq!(resolver.resolve(&routed("/", "burst"), "user_1").limit, 1000);
        // named policy limit wins
        assert_eq!(resolver.resolve(&routed("/", "login"), "user_1").limit, 5);
    }

    #[test]
    fn test_strategy_classes_lists_references() {
        let mut config = config().with_limiter(
            "custom",
            LimiterPolicy::new().with_strategy_class("leaky_bucket"),
        );
        config.strategy_class = Some("global_class".to_string());

        let resolver = PolicyResolver::from_config(&config);
        let mut names: Vec<_> = resolver.strategy_classes().collect();
        names.sort();
        assert_eq!(names, vec!["global_class", "leaky_bucket"]);

        let policy = resolver.resolve(&routed("/", "custom"), "ip");
        assert_eq!(policy.strategy_class.as_deref(), Some("leaky_bucket"));
        let policy = resolver.resolve(&request("/"), "ip");
        assert_eq!(policy.strategy_class.as_deref(), Some("global_class"));
    }
}
