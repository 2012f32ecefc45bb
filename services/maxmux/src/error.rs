//! Per-request errors and their client-visible responses
//!
//! Both envelopes mirror the upstream API's own error shape,
//! `{"error":{"message":"...","type":"..."}}`, so client SDKs parse them the
//! same way as upstream errors. Configuration errors are startup-fatal and
//! live in `common::Error`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Request-scoped failures that end one request without affecting others.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Authorization header missing, not `Bearer `, or key not in the set.
    #[error("invalid virtual key")]
    InvalidVirtualKey,

    /// No response could be obtained from upstream (DNS, connect, TLS, timeout).
    #[error("upstream error")]
    Upstream(#[source] reqwest::Error),

    /// The connection limiter was closed while the request waited for a slot.
    #[error("proxy unavailable")]
    Unavailable,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidVirtualKey => StatusCode::UNAUTHORIZED,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Machine-readable `type` field of the envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidVirtualKey => "authentication_error",
            ProxyError::Upstream(_) | ProxyError::Unavailable => "proxy_error",
        }
    }

    /// Metric label describing what kind of upstream failure occurred.
    pub fn upstream_kind(&self) -> Option<&'static str> {
        match self {
            ProxyError::InvalidVirtualKey | ProxyError::Unavailable => None,
            ProxyError::Upstream(e) if e.is_timeout() => Some("timeout"),
            ProxyError::Upstream(e) if e.is_connect() => Some("connect"),
            ProxyError::Upstream(_) => Some("other"),
        }
    }

    /// Serialized JSON envelope. The message is the variant's Display text,
    /// never the underlying transport error.
    pub fn body(&self) -> String {
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                kind: self.error_type(),
            },
        };
        serde_json::to_string(&envelope).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            self.body(),
        )
            .into_response()
    }
}
