//! Shared-token provider: one real OAuth credential for every client.
//!
//! The client's own `Authorization` (its virtual key) is replaced with the
//! shared bearer token, `x-api-key` is dropped because the upstream rejects
//! requests carrying both schemes, and the OAuth beta flag plus the
//! browser-access header are injected.

use crate::{Provider, ProviderError};
use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::{debug, warn};

/// Capability header carrying comma-separated opt-in flags.
pub const ANTHROPIC_BETA: &str = "anthropic-beta";

/// Header the upstream requires alongside OAuth bearer tokens.
pub const BROWSER_ACCESS_HEADER: &str = "anthropic-dangerous-direct-browser-access";

const X_API_KEY: &str = "x-api-key";

/// Beta flag that enables OAuth bearer authentication upstream.
pub const OAUTH_BETA_FLAG: &str = "oauth-2025-04-20";

/// Injects a single shared OAuth token into every outbound request.
pub struct SharedTokenProvider {
    authorization: HeaderValue,
    token: Secret<String>,
}

impl SharedTokenProvider {
    /// Fails when the token is empty or not representable as a header value.
    pub fn new(token: Secret<String>) -> crate::Result<Self> {
        if token.expose().is_empty() {
            return Err(ProviderError::InvalidCredential(
                "shared token is empty".into(),
            ));
        }
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
            .map_err(|e| {
                ProviderError::InvalidCredential(format!("token is not a valid header value: {e}"))
            })?;
        authorization.set_sensitive(true);
        Ok(Self {
            authorization,
            token,
        })
    }

    /// Masked preview of the token for log lines.
    pub fn masked_token(&self) -> String {
        self.token.masked()
    }
}

impl Provider for SharedTokenProvider {
    fn id(&self) -> &str {
        "shared-token"
    }

    fn prepare_request(&self, headers: &mut HeaderMap) {
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers.remove(X_API_KEY);
        merge_beta_flag(headers, OAUTH_BETA_FLAG);
        headers.insert(BROWSER_ACCESS_HEADER, HeaderValue::from_static("true"));

        debug!(
            authorization = %format!("Bearer {}", self.masked_token()),
            anthropic_beta = ?headers.get(ANTHROPIC_BETA),
            "injected oauth headers"
        );
    }
}

/// Merge `flag` into the `anthropic-beta` header without dropping client flags.
///
/// - absent or blank: set to `flag`
/// - already listed as a token: left as-is
/// - otherwise: existing value(s) joined by `,`, then `,flag`
///
/// Works on raw bytes so client values containing non-UTF-8 octets survive.
pub fn merge_beta_flag(headers: &mut HeaderMap, flag: &'static str) {
    let mut existing: Vec<u8> = Vec::new();
    for value in headers.get_all(ANTHROPIC_BETA) {
        let bytes = value.as_bytes();
        if bytes.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if !existing.is_empty() {
            existing.push(b',');
        }
        existing.extend_from_slice(bytes);
    }

    if existing.is_empty() {
        headers.insert(ANTHROPIC_BETA, HeaderValue::from_static(flag));
        return;
    }

    let already_present = existing
        .split(|b| *b == b',')
        .any(|token| token.trim_ascii() == flag.as_bytes());
    if !already_present {
        existing.push(b',');
        existing.extend_from_slice(flag.as_bytes());
    }

    match HeaderValue::from_bytes(&existing) {
        Ok(v) => {
            headers.insert(ANTHROPIC_BETA, v);
        }
        Err(e) => {
            warn!(error = %e, "failed to construct merged anthropic-beta header");
            headers.insert(ANTHROPIC_BETA, HeaderValue::from_static(flag));
        }
    }
}
