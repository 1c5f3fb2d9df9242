//! Derives the caller key that rate counters are bucketed by.
//!
//! Missing identity data never fails: it maps to an empty string, and every
//! caller without a derivable identity shares that one bucket.

use axum::extract::{ConnectInfo, Request};
use http::header::{AUTHORIZATION, COOKIE};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

/// Header consulted last by the network address strategy
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Built-in ways of deriving an identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    #[default]
    Ip,
    AuthToken,
    Cookie,
}

/// Client address resolved by an upstream layer (e.g. a trusted proxy
/// parser). Takes priority over the socket peer address when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Caller-supplied identity rule
pub type CustomExtractor = Arc<dyn Fn(&Request) -> String + Send + Sync>;

#[derive(Clone)]
pub struct IdentityExtractor {
    strategy: IdentityStrategy,
    session_cookie: String,
    custom: Option<CustomExtractor>,
}

impl fmt::Debug for IdentityExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityExtractor")
            .field("strategy", &self.strategy)
            .field("session_cookie", &self.session_cookie)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl Default for IdentityExtractor {
    fn default() -> Self {
        Self::new(IdentityStrategy::default())
    }
}

impl IdentityExtractor {
    pub fn new(strategy: IdentityStrategy) -> Self {
        Self {
            strategy,
            session_cookie: "session".to_string(),
            custom: None,
        }
    }

    /// Name of the cookie read by [`IdentityStrategy::Cookie`]
    pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
        self.session_cookie = name.into();
        self
    }

    /// Use a custom rule instead of any built-in strategy
    pub fn with_custom<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(extractor));
        self
    }

    pub fn strategy(&self) -> IdentityStrategy {
        self.strategy
    }

    pub fn extract(&self, request: &Request) -> String {
        if let Some(custom) = &self.custom {
            return custom(request);
        }

        match self.strategy {
            IdentityStrategy::Ip => by_address(request),
            IdentityStrategy::AuthToken => by_credential(request),
            IdentityStrategy::Cookie => by_cookie(request, &self.session_cookie),
        }
    }
}

fn by_address(request: &Request) -> String {
    if let Some(ClientIp(ip)) = request.extensions().get::<ClientIp>() {
        return ip.to_string();
    }
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    request
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|first| first.trim().to_string())
        .unwrap_or_default()
}

fn by_credential(request: &Request) -> String {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn by_cookie(request: &Request, name: &str) -> String {
    request
        .headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .unwrap_or_default()
}
