//! Rate limit key derivation.

use std::collections::BTreeMap;
use std::fmt;

use crate::hashing::short_digest;

/// Key used when a caller supplies no discriminators.
pub const DEFAULT_KEY: &str = "default";

const KEY_DIGEST_LEN: usize = 16;

/// Identifies whose allowance a request draws from.
///
/// Built from named discriminators (client address, user id, method name and
/// anything else the caller wants to partition by). The resolved key is a
/// digest of the sorted discriminators, so the same inputs always map to the
/// same state regardless of insertion order.
///
/// ```ignore
/// let key = RateLimitKey::new().user("analyst-7").method("get_quote");
/// limiter.check(&key).await?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitKey {
    parts: BTreeMap<String, String>,
}

impl RateLimitKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named discriminator, replacing any previous value for `name`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.insert(name.into(), value.into());
        self
    }

    pub fn address(self, address: impl Into<String>) -> Self {
        self.with("address", address)
    }

    pub fn user(self, user: impl Into<String>) -> Self {
        self.with("user", user)
    }

    pub fn method(self, method: impl Into<String>) -> Self {
        self.with("method", method)
    }

    /// Per client address.
    pub fn for_address(address: impl Into<String>) -> Self {
        Self::new().address(address)
    }

    /// Per authenticated user.
    pub fn for_user(user: impl Into<String>) -> Self {
        Self::new().user(user)
    }

    /// Per method, optionally narrowed to one user.
    pub fn for_method(method: impl Into<String>, user: Option<&str>) -> Self {
        let key = Self::new().method(method);
        match user {
            Some(user) => key.user(user),
            None => key,
        }
    }

    /// True when no discriminators were supplied.
    pub fn is_default(&self) -> bool {
        self.parts.is_empty()
    }

    /// Resolves the key the backend stores state under.
    pub fn resolve(&self) -> String {
        if self.parts.is_empty() {
            return DEFAULT_KEY.to_string();
        }
        // Length-prefixed parts keep the encoding injective
        let encoded: String = self
            .parts
            .iter()
            .map(|(name, value)| format!("{}:{name}{}:{value}", name.len(), value.len()))
            .collect();
        short_digest(&encoded, KEY_DIGEST_LEN)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resolve())
    }
}
