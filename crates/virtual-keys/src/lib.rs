//! Virtual key allow-list
//!
//! Clients present a proxy-local "virtual key" as `Authorization: Bearer <key>`.
//! The set is built once at startup and only read afterwards, so lookups from
//! concurrent requests need no synchronization.
//!
//! Comparison is a plain `HashSet` membership test: exact, case-sensitive, and
//! not constant-time. Clients are trusted private processes sharing one
//! subscription, so timing side channels are out of the threat model.

use std::collections::HashSet;

/// Required scheme prefix on the `Authorization` header.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Extract the presented credential from a raw `Authorization` header value.
///
/// Returns the empty string when the header is missing or does not start with
/// the exact `Bearer ` prefix. Nothing beyond the prefix is trimmed.
pub fn bearer_token(authorization: Option<&str>) -> &str {
    authorization
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .unwrap_or("")
}

/// Immutable set of accepted virtual keys.
#[derive(Debug, Clone, Default)]
pub struct VirtualKeys {
    keys: HashSet<String>,
}

impl VirtualKeys {
    /// Build the set. Duplicates collapse; empty strings are dropped since the
    /// empty credential stands for "nothing presented".
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys
            .into_iter()
            .map(Into::into)
            .filter(|k: &String| !k.is_empty())
            .collect();
        Self { keys }
    }

    /// Number of distinct accepted keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether the raw `Authorization` header value carries an accepted key.
    pub fn check(&self, authorization: Option<&str>) -> bool {
        self.contains(bearer_token(authorization))
    }

    /// Exact membership test on an already-extracted key.
    pub fn contains(&self, key: &str) -> bool {
        !key.is_empty() && self.keys.contains(key)
    }
}
