//! Authentication gate consulted before any connect is accepted.

use std::{collections::HashMap, net::SocketAddr};

use tracing::debug;

/// Credentials and metadata captured when the transport channel was opened.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Token from an `Authorization: Bearer` header.
    pub bearer_token: Option<String>,
    /// Token from a `?token=` query parameter.
    pub query_token: Option<String>,
    /// Request cookies by name.
    pub cookies: HashMap<String, String>,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestContext {
    /// Parse a `Cookie` header value into the cookie map.
    pub fn add_cookie_header(&mut self, header: &str) {
        for pair in header.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                self.cookies
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }
}

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller {
    pub owner_id: String,
}

impl Caller {
    #[must_use]
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
        }
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }
}

/// Decides whether a transport channel may open broker sessions.
pub trait AuthGate: Send + Sync {
    /// The caller behind this request, if it is authenticated.
    fn authenticate(&self, ctx: &RequestContext) -> Option<Caller>;

    fn is_authenticated(&self, ctx: &RequestContext) -> bool {
        self.authenticate(ctx).is_some()
    }
}

/// Gate for deployments with authentication disabled.
#[derive(Debug, Default, Clone)]
pub struct OpenGate;

impl AuthGate for OpenGate {
    fn authenticate(&self, _ctx: &RequestContext) -> Option<Caller> {
        Some(Caller::anonymous())
    }
}

/// Gate backed by a static token table.
///
/// The token is taken from the session cookie, then the bearer header,
/// then the query string.
#[derive(Debug, Clone)]
pub struct TokenGate {
    cookie_name: String,
    tokens: HashMap<String, String>,
}

impl TokenGate {
    /// `tokens` maps token value to owner id.
    #[must_use]
    pub fn new(cookie_name: impl Into<String>, tokens: HashMap<String, String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            tokens,
        }
    }
}

impl AuthGate for TokenGate {
    fn authenticate(&self, ctx: &RequestContext) -> Option<Caller> {
        let token = ctx
            .cookies
            .get(&self.cookie_name)
            .or(ctx.bearer_token.as_ref())
            .or(ctx.query_token.as_ref())?;

        let caller = self.tokens.get(token).map(Caller::new);
        if caller.is_none() {
            debug!(remote_addr = ?ctx.remote_addr, "Rejected unknown broker token");
        }
        caller
    }
}
