//! Connection-time authentication.
//!
//! Clients present `identity:key` as HTTP Basic credentials on the WebSocket
//! upgrade request. The hub checks them once, before any frame is read.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;

/// Decides whether an identity/key pair may connect.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, identity: &str, key: &str) -> bool;
}

/// Registry of client identities and their secret keys.
#[derive(Debug, Default)]
pub struct Credentials {
    keys: DashMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the key of an identity.
    pub fn add(&self, identity: impl Into<String>, key: impl Into<String>) {
        self.keys.insert(identity.into(), key.into());
    }

    /// Remove an identity. Returns false if it was unknown.
    pub fn remove(&self, identity: &str) -> bool {
        self.keys.remove(identity).is_some()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.keys.contains_key(identity)
    }
}

impl Authenticator for Credentials {
    fn authenticate(&self, identity: &str, key: &str) -> bool {
        self.keys.get(identity).is_some_and(|stored| stored.value() == key)
    }
}

/// Encode an `Authorization` header value.
pub fn basic_header(identity: &str, key: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", identity, key)))
}

/// Decode an `Authorization: Basic ...` header value into (identity, key).
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (identity, key) = text.split_once(':')?;
    Some((identity.to_string(), key.to_string()))
}
