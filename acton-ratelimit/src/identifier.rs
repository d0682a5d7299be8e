//! Client identity resolution
//!
//! Derives the string a request's quota is tracked under. Identity can come
//! from the client IP, the authenticated user, the matched route, or an API
//! key / bearer token. Several types may be combined; their parts are joined
//! with `_`.

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};
use serde::{Deserialize, Serialize};

use crate::config::RateLimitConfig;

/// Fallback identity when no client address is known
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Custom identity resolution replacing the configured types
pub type IdentifierCallback = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// How a client is identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    /// Client IP address
    Ip,
    /// Authenticated user, falling back to IP
    User,
    /// Routed plugin/controller/action, suffixed with IP
    Route,
    /// API key from the token headers, falling back to IP
    ApiKey,
    /// Alias of [`IdentifierType::ApiKey`]
    Token,
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => write!(f, "ip"),
            Self::User => write!(f, "user"),
            Self::Route => write!(f, "route"),
            Self::ApiKey => write!(f, "api_key"),
            Self::Token => write!(f, "token"),
        }
    }
}

/// Authenticated principal, inserted as a request extension by auth middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Stable user id
    pub id: String,
}

impl AuthenticatedUser {
    /// Create a principal with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Routing attributes, inserted as a request extension by the router
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams {
    /// Owning plugin; `app` when unset
    pub plugin: Option<String>,
    /// Controller name
    pub controller: Option<String>,
    /// Action name
    pub action: Option<String>,
    /// Name of the limiter policy attached to this route
    pub rate_limiter: Option<String>,
}

impl RouteParams {
    /// Create params for a controller action
    pub fn new(controller: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            controller: Some(controller.into()),
            action: Some(action.into()),
            ..Self::default()
        }
    }

    /// Set the plugin
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Attach a named limiter policy
    pub fn with_rate_limiter(mut self, name: impl Into<String>) -> Self {
        self.rate_limiter = Some(name.into());
        self
    }
}

/// Hash an identifying value for use in keys
///
/// Raw tokens and identities never reach the store.
pub fn hash_value(value: &str) -> String {
    blake3::hash(value.as_bytes()).to_hex().to_string()
}

/// Raw header value, decoded lossily; empty when absent
///
/// Values with bytes outside visible ASCII are still used rather than
/// treated as missing.
fn header_value<'a>(request: &'a Request, name: &str) -> Cow<'a, str> {
    request
        .headers()
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()))
        .unwrap_or(Cow::Borrowed(""))
}

/// Resolves the rate limiting identity of a request
#[derive(Clone)]
pub struct IdentifierResolver {
    types: Vec<IdentifierType>,
    ip_headers: Vec<String>,
    token_headers: Vec<String>,
    callback: Option<IdentifierCallback>,
}

impl IdentifierResolver {
    /// Create a resolver from explicit settings
    pub fn new(
        types: Vec<IdentifierType>,
        ip_headers: Vec<String>,
        token_headers: Vec<String>,
    ) -> Self {
        Self {
            types,
            ip_headers,
            token_headers,
            callback: None,
        }
    }

    /// Create a resolver from the rate limit configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.identifier.as_slice().to_vec(),
            config.ip_header.as_slice().to_vec(),
            config.token_headers.clone(),
        )
    }

    /// Replace resolution entirely with `callback`
    pub fn with_callback(mut self, callback: IdentifierCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Resolve the identity of `request`
    pub fn resolve(&self, request: &Request) -> String {
        if let Some(callback) = &self.callback {
            return callback(request);
        }

        match self.types.as_slice() {
            [] => self.client_ip(request),
            [single] => self.resolve_type(*single, request),
            many => many
                .iter()
                .map(|kind| self.resolve_type(*kind, request))
                .collect::<Vec<_>>()
                .join("_"),
        }
    }

    /// Resolve one identifier type
    pub fn resolve_type(&self, kind: IdentifierType, request: &Request) -> String {
        match kind {
            IdentifierType::Ip => self.client_ip(request),
            IdentifierType::User => self.user_identifier(request),
            IdentifierType::Route => self.route_identifier(request),
            IdentifierType::ApiKey | IdentifierType::Token => self.api_key_identifier(request),
        }
    }

    /// First entry of the first populated IP header, else the peer address
    pub fn client_ip(&self, request: &Request) -> String {
        for header in &self.ip_headers {
            let value = header_value(request, header);

            if !value.is_empty() {
                let first = value.split(',').next().unwrap_or("");
                return first.trim().to_string();
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }

    fn user_identifier(&self, request: &Request) -> String {
        match request.extensions().get::<AuthenticatedUser>() {
            Some(user) => format!("user_{}", user.id),
            None => self.client_ip(request),
        }
    }

    fn route_identifier(&self, request: &Request) -> String {
        let params = request.extensions().get::<RouteParams>();
        let plugin = params.and_then(|p| p.plugin.as_deref()).unwrap_or("app");
        let controller = params
            .and_then(|p| p.controller.as_deref())
            .unwrap_or("unknown");
        let action = params.and_then(|p| p.action.as_deref()).unwrap_or("unknown");

        format!(
            "{}::{}.{}_{}",
            plugin,
            controller,
            action,
            self.client_ip(request)
        )
    }

    fn api_key_identifier(&self, request: &Request) -> String {
        for header in &self.token_headers {
            let value = header_value(request, header);

            if value.is_empty() {
                continue;
            }

            if header.eq_ignore_ascii_case("authorization") {
                if let Some((scheme, token)) = value.split_once(' ') {
                    return format!("{}_{}", scheme.to_lowercase(), hash_value(token));
                }
            }

            return format!("token_{}", hash_value(&value));
        }

        self.client_ip(request)
    }
}

impl fmt::Debug for IdentifierResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifierResolver")
            .field("types", &self.types)
            .field("ip_headers", &self.ip_headers)
            .field("token_headers", &self.token_headers)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
