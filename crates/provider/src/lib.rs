//! Upstream credential providers
//!
//! Defines the `Provider` trait that decouples the forwarding gateway from the
//! upstream authentication scheme. The gateway strips the client's transport
//! headers and then hands the outbound header map to the provider, which is the
//! only component that ever sees the real credential.

pub mod shared_token;

pub use shared_token::{
    ANTHROPIC_BETA, BROWSER_ACCESS_HEADER, OAUTH_BETA_FLAG, SharedTokenProvider, merge_beta_flag,
};

use reqwest::header::HeaderMap;

/// Errors raised while constructing a provider.
///
/// Request rewriting itself is infallible: every value the provider writes is
/// validated up front, so a provider that built successfully can always
/// rewrite.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Upstream authentication strategy applied to every forwarded request.
pub trait Provider: Send + Sync {
    /// Identifier for logging (e.g. "shared-token")
    fn id(&self) -> &str;

    /// Rewrite outbound headers in place before the request leaves the proxy.
    fn prepare_request(&self, headers: &mut HeaderMap);
}
