//! Session gate: admits a WebSocket upgrade only when its session cookie
//! resolves to a user.
//!
//! A request without a resolvable cookie is not an error. The gate declines
//! it and the hub hands the request to the next handler instead of upgrading.

use dashmap::DashMap;
use rtd_core::Identity;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tracing::debug;

/// Session lookup owned by the account subsystem.
pub trait SessionStore: Send + Sync {
    /// Resolve a session cookie value to the user it belongs to.
    fn resolve(&self, cookie: &str) -> Option<Identity>;

    /// Re-validate a cached identity. `None` means the user is gone.
    fn refresh(&self, identity: &Identity) -> Option<Identity> {
        Some(identity.clone())
    }
}

/// Cookie → secret → user tables held in memory.
#[derive(Default)]
pub struct InMemorySessionStore {
    secrets: DashMap<String, String>,
    users: DashMap<String, Identity>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&self, cookie: &str, secret: &str) {
        self.secrets.insert(cookie.to_string(), secret.to_string());
    }

    pub fn remove_session(&self, cookie: &str) {
        self.secrets.remove(cookie);
    }

    pub fn insert_user(&self, secret: &str, identity: Identity) {
        self.users.insert(secret.to_string(), identity);
    }

    pub fn remove_user(&self, secret: &str) {
        self.users.remove(secret);
    }
}

impl SessionStore for InMemorySessionStore {
    fn resolve(&self, cookie: &str) -> Option<Identity> {
        let secret = self.secrets.get(cookie)?.value().clone();
        self.users.get(&secret).map(|u| u.value().clone())
    }

    fn refresh(&self, identity: &Identity) -> Option<Identity> {
        self.users
            .iter()
            .find(|u| u.value().id == identity.id)
            .map(|u| u.value().clone())
    }
}

/// Outcome of checking an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Admit { identity: Identity, cookie: String },
    Decline(&'static str),
}

pub struct SessionGate {
    cookie_name: String,
    store: Arc<dyn SessionStore>,
}

impl SessionGate {
    pub fn new(cookie_name: impl Into<String>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            store,
        }
    }

    pub fn check(&self, request: &Request) -> GateDecision {
        let Some(cookie) = self.session_cookie(request) else {
            return GateDecision::Decline("no session cookie");
        };
        match self.store.resolve(&cookie) {
            Some(identity) => {
                debug!(user = %identity.id, "session resolved");
                GateDecision::Admit { identity, cookie }
            }
            None => GateDecision::Decline("unknown session"),
        }
    }

    fn session_cookie(&self, request: &Request) -> Option<String> {
        request
            .headers()
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_cookie_pairs)
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value)
    }
}

/// Split a `Cookie` header value into trimmed `(name, value)` pairs.
/// Fragments without `=` are skipped.
pub fn parse_cookie_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Receives upgrade requests the gate declined.
pub trait NextHandler: Send + Sync {
    fn handle(&self, request: &Request) -> ErrorResponse;
}

/// Answers every declined request with `404 Not Found`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

impl NextHandler for NotFound {
    fn handle(&self, _request: &Request) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some("not found".to_string()));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    }
}
