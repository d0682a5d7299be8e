//! Store-backed rate limiting middleware
//!
//! Drives one of the [`limiter`](crate::limiter) strategies per request:
//!
//! 1. Skip check: bypass entirely when the skip callback says so
//! 2. Policy: named override from the resolver callback or route, else defaults
//! 3. Identity: configured identifier types or the identifier callback
//! 4. Cost: cost callback, default 1
//! 5. Key: key generator, default `rate_limit_<hash(identity)>`
//! 6. Attempt: against the injected store
//!
//! Allowed requests are forwarded and annotated with `X-RateLimit-*`
//! headers. Denied requests fail with [`Error::RateLimitExceeded`] (HTTP 429,
//! optionally with `Retry-After`). Store errors propagate unchanged.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::HeaderValue, HeaderName},
    middleware::Next,
    response::Response,
};
use chrono::DateTime;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::identifier::{hash_value, IdentifierCallback, IdentifierResolver};
use crate::limiter::{build_limiter, LimiterRegistry, RateLimitDecision, RateLimiter};
use crate::policy::{LimitCallback, LimiterResolver, Policy, PolicyResolver};
use crate::store::KeyValueStore;

/// Prefix of generated store keys
pub const KEY_PREFIX: &str = "rate_limit_";

/// Decides whether a request bypasses rate limiting
pub type SkipCheck = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Computes how many units a request consumes
pub type CostCallback = Arc<dyn Fn(&Request) -> u64 + Send + Sync>;

/// Builds the store key from the resolved identity
pub type KeyGenerator = Arc<dyn Fn(&str, &Request) -> String + Send + Sync>;

/// Result of checking a request against its quota
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// The skip check bypassed rate limiting
    Skipped,
    /// The request fits in its quota
    Allowed {
        /// Limiter decision, used for response headers
        decision: RateLimitDecision,
        /// Policy applied to the request
        policy: Policy,
    },
}

/// Request attributes resolved ahead of a limiter attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCheck {
    /// Resolved client identity
    pub identifier: String,
    /// Policy in effect
    pub policy: Policy,
    /// Units this request consumes
    pub cost: u64,
    /// Store key the quota is tracked under
    pub key: String,
}

/// Rate limiting middleware state
///
/// Cheap to clone; share one instance across the router with
/// `axum::middleware::from_fn_with_state`.
///
/// # Example
///
/// ```rust,ignore
/// let store = Arc::new(MemoryStore::new());
/// let rate_limit = RateLimitMiddleware::builder(config.rate_limit.clone(), store)
///     .skip_check(Arc::new(|req: &Request| req.uri().path() == "/health"))
///     .build()?;
///
/// let app = Router::new()
///     .route("/api/items", get(list_items))
///     .layer(axum::middleware::from_fn_with_state(
///         rate_limit,
///         RateLimitMiddleware::middleware,
///     ));
/// ```
#[derive(Clone)]
pub struct RateLimitMiddleware {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    registry: LimiterRegistry,
    identifiers: IdentifierResolver,
    policies: PolicyResolver,
    skip_check: Option<SkipCheck>,
    cost_callback: Option<CostCallback>,
    key_generator: Option<KeyGenerator>,
    headers: bool,
    include_retry_after: bool,
}

/// Builder for [`RateLimitMiddleware`]
pub struct RateLimitBuilder {
    config: RateLimitConfig,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    registry: LimiterRegistry,
    skip_check: Option<SkipCheck>,
    cost_callback: Option<CostCallback>,
    identifier_callback: Option<IdentifierCallback>,
    limit_callback: Option<LimitCallback>,
    key_generator: Option<KeyGenerator>,
    limiter_resolver: Option<LimiterResolver>,
}

impl RateLimitBuilder {
    /// Bypass rate limiting for requests matching `check`
    pub fn skip_check(mut self, check: SkipCheck) -> Self {
        self.skip_check = Some(check);
        self
    }

    /// Charge each request the cost computed by `callback`
    pub fn cost_callback(mut self, callback: CostCallback) -> Self {
        self.cost_callback = Some(callback);
        self
    }

    /// Replace identifier resolution with `callback`
    pub fn identifier_callback(mut self, callback: IdentifierCallback) -> Self {
        self.identifier_callback = Some(callback);
        self
    }

    /// Compute the limit per request and identity
    pub fn limit_callback(mut self, callback: LimitCallback) -> Self {
        self.limit_callback = Some(callback);
        self
    }

    /// Replace the default `rate_limit_<hash>` key
    pub fn key_generator(mut self, generator: KeyGenerator) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Pick the named policy for each request
    pub fn limiter_resolver(mut self, resolver: LimiterResolver) -> Self {
        self.limiter_resolver = Some(resolver);
        self
    }

    /// Custom limiters available to `strategy_class`
    pub fn registry(mut self, registry: LimiterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Time source for limiters and `Retry-After`
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and build the middleware
    ///
    /// Fails if any configured `strategy_class` is not registered.
    pub fn build(self) -> Result<RateLimitMiddleware> {
        let mut identifiers = IdentifierResolver::from_config(&self.config);
        if let Some(callback) = self.identifier_callback {
            identifiers = identifiers.with_callback(callback);
        }

        let mut policies = PolicyResolver::from_config(&self.config);
        if let Some(resolver) = self.limiter_resolver {
            policies = policies.with_resolver(resolver);
        }
        if let Some(callback) = self.limit_callback {
            policies = policies.with_limit_callback(callback);
        }

        if let Some(missing) = policies
            .strategy_classes()
            .find(|name| !self.registry.contains(name))
        {
            return Err(Error::Configuration(format!(
                "strategy class '{}' is not registered",
                missing
            )));
        }

        debug!(
            limit = self.config.limit,
            window_secs = self.config.window_secs,
            strategy = %self.config.strategy,
            limiters = self.config.limiters.len(),
            "Rate limit middleware configured"
        );

        Ok(RateLimitMiddleware {
            inner: Arc::new(Inner {
                store: self.store,
                clock: self.clock,
                registry: self.registry,
                identifiers,
                policies,
                skip_check: self.skip_check,
                cost_callback: self.cost_callback,
                key_generator: self.key_generator,
                headers: self.config.headers,
                include_retry_after: self.config.include_retry_after,
            }),
        })
    }
}

impl RateLimitMiddleware {
    /// Start building middleware over `store`
    pub fn builder(config: RateLimitConfig, store: Arc<dyn KeyValueStore>) -> RateLimitBuilder {
        RateLimitBuilder {
            config,
            store,
            clock: Arc::new(SystemClock),
            registry: LimiterRegistry::new(),
            skip_check: None,
            cost_callback: None,
            identifier_callback: None,
            limit_callback: None,
            key_generator: None,
            limiter_resolver: None,
        }
    }

    /// Build middleware with no callbacks
    pub fn new(config: RateLimitConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::builder(config, store).build()
    }

    /// Middleware function to enforce rate limits
    ///
    /// Use with `axum::middleware::from_fn_with_state`.
    pub async fn middleware(
        State(rate_limit): State<Self>,
        request: Request,
        next: Next,
    ) -> std::result::Result<Response, Error> {
        let decision = match rate_limit.check(&request).await? {
            RateLimitOutcome::Skipped => return Ok(next.run(request).await),
            RateLimitOutcome::Allowed { decision, .. } => decision,
        };

        let mut response = next.run(request).await;

        if rate_limit.inner.headers {
            add_rate_limit_headers(&mut response, &decision);
        }

        Ok(response)
    }

    /// Check `request` against its quota, consuming its cost if allowed
    ///
    /// Returns [`Error::RateLimitExceeded`] when the quota is exhausted.
    /// Everything read from the request is resolved before the returned
    /// future is created, so it does not borrow `request`.
    pub fn check(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<RateLimitOutcome>> + Send + '_ {
        let prepared = self.prepare(request);

        async move {
            match prepared {
                Some(prepared) => self.attempt(prepared).await,
                None => Ok(RateLimitOutcome::Skipped),
            }
        }
    }

    /// Resolve identity, policy, cost and key for `request`
    ///
    /// Returns `None` when the skip check bypasses rate limiting.
    pub fn prepare(&self, request: &Request) -> Option<PreparedCheck> {
        let inner = &self.inner;

        if let Some(skip) = &inner.skip_check {
            if skip(request) {
                debug!(path = %request.uri().path(), "Rate limit skipped");
                return None;
            }
        }

        let identifier = inner.identifiers.resolve(request);
        let policy = inner.policies.resolve(request, &identifier);
        let cost = inner.cost_callback.as_ref().map_or(1, |cost| cost(request));
        let key = self.key_for(&identifier, request);

        Some(PreparedCheck {
            identifier,
            policy,
            cost,
            key,
        })
    }

    /// Run a prepared check against the store
    pub async fn attempt(&self, prepared: PreparedCheck) -> Result<RateLimitOutcome> {
        let inner = &self.inner;
        let PreparedCheck {
            identifier,
            policy,
            cost,
            key,
        } = prepared;

        let limiter = self.limiter_for(&policy)?;
        let decision = limiter
            .attempt(&key, policy.limit, policy.window_secs, cost)
            .await?;

        if !decision.allowed {
            warn!(
                identifier = %identifier,
                policy = policy.name.as_deref().unwrap_or("default"),
                limit = decision.limit,
                cost,
                "Rate limit exceeded"
            );

            let retry_after = inner
                .include_retry_after
                .then(|| (decision.reset - inner.clock.now_secs()).max(1) as u64);

            return Err(Error::rate_limited(policy.message, retry_after));
        }

        debug!(
            identifier = %identifier,
            policy = policy.name.as_deref().unwrap_or("default"),
            remaining = decision.remaining,
            limit = decision.limit,
            "Rate limit check passed"
        );

        Ok(RateLimitOutcome::Allowed { decision, policy })
    }

    /// Clear the quota tracked for `request` under its current policy
    pub fn reset(&self, request: &Request) -> impl Future<Output = Result<()>> + Send + '_ {
        let identifier = self.inner.identifiers.resolve(request);
        let policy = self.inner.policies.resolve(request, &identifier);
        let key = self.key_for(&identifier, request);

        async move { self.limiter_for(&policy)?.reset(&key).await }
    }

    /// Store key for a resolved identity
    pub fn key_for(&self, identifier: &str, request: &Request) -> String {
        match &self.inner.key_generator {
            Some(generator) => generator(identifier, request),
            None => format!("{}{}", KEY_PREFIX, hash_value(identifier)),
        }
    }

    /// Limiter instance for `policy`, bound to the injected store
    ///
    /// A `strategy_class` takes precedence over the built-in `strategy`.
    pub fn limiter_for(&self, policy: &Policy) -> Result<Arc<dyn RateLimiter>> {
        let inner = &self.inner;
        match &policy.strategy_class {
            Some(name) => inner
                .registry
                .build(name, inner.store.clone(), inner.clock.clone()),
            None => Ok(build_limiter(
                policy.strategy,
                inner.store.clone(),
                inner.clock.clone(),
            )),
        }
    }
}

/// Add rate limit headers to response
fn add_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();

    let reset_date = DateTime::from_timestamp(decision.reset, 0)
        .map(|date| date.to_rfc3339())
        .unwrap_or_default();

    let values = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset.to_string()),
        ("x-ratelimit-reset-date", reset_date),
    ];

    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}
