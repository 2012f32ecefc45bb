//! HTTP proxy logic
//!
//! Checks the caller's virtual key, strips hop-by-hop headers, lets the
//! provider swap in the real credential, and forwards to the upstream.
//! The upstream response (including error statuses) is relayed verbatim and
//! streamed chunk by chunk. Nothing is retried: a transport failure ends the
//! request with a 502.
//!
//! Forwarded requests hold a slot from `max_connections` until their response
//! body is finished or dropped, so long streams count against the limit for
//! their whole life. Requests beyond the limit wait for a slot.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::body::{Body, HttpBody};
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use provider::Provider;
use reqwest::Url;
use tokio::sync::Semaphore;
use tracing::{Span, debug, error, info, instrument, warn};
use virtual_keys::VirtualKeys;

use crate::error::ProxyError;
use crate::metrics::{self, ServiceMetrics};
use crate::relay::{AwaitingResponse, RelayBody, RelayContext};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Header values masked in debug header dumps.
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "x-api-key"];

/// Shared state passed to the proxy handler via axum State extractor.
///
/// Everything here is immutable after startup; clones share the same
/// key set, provider, connection pool and slot limiter.
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream: Arc<Url>,
    pub keys: Arc<VirtualKeys>,
    pub provider: Arc<dyn Provider>,
    pub metrics: ServiceMetrics,
    /// One permit per concurrently forwarded request (`max_connections`).
    pub limiter: Arc<Semaphore>,
}

impl ProxyState {
    pub fn new(
        client: reqwest::Client,
        upstream: Url,
        keys: VirtualKeys,
        provider: Arc<dyn Provider>,
        metrics: ServiceMetrics,
        max_connections: usize,
    ) -> Self {
        Self {
            client,
            upstream: Arc::new(upstream),
            keys: Arc::new(keys),
            provider,
            metrics,
            limiter: Arc::new(Semaphore::new(
                max_connections.min(Semaphore::MAX_PERMITS),
            )),
        }
    }
}

/// Build the upstream HTTP client.
///
/// Redirects are passed back to the caller rather than followed. Only the
/// connect phase has a default bound; `read_timeout` limits the idle gap
/// between reads, never the total duration, so long streams survive.
pub fn build_client(
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none());
    if let Some(timeout) = read_timeout {
        builder = builder.read_timeout(timeout);
    }
    builder.build()
}

/// Authenticate, rewrite, forward and relay one request.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !state.keys.check(authorization) {
        let remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        warn!(method = %method, path = %path, remote = %remote, "rejected invalid virtual key");
        state.metrics.rejected_total.fetch_add(1, Ordering::Relaxed);
        metrics::record_rejection();
        return ProxyError::InvalidVirtualKey.into_response();
    }

    let permit = match state.limiter.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            warn!(method = %method, path = %path, "connection limiter closed, refusing request");
            return ProxyError::Unavailable.into_response();
        }
    };

    info!(method = %method, path = %path, provider = state.provider.id(), "forwarding");
    log_request_headers(request.headers());

    let (parts, body) = request.into_parts();
    let mut headers = outbound_headers(&parts.headers);
    state.provider.prepare_request(&mut headers);
    let url = upstream_url(&state.upstream, &parts.uri);

    let in_flight = state.metrics.begin_request();

    let mut upstream_request = state.client.request(method.clone(), url).headers(headers);
    if body.size_hint().exact() != Some(0) {
        upstream_request =
            upstream_request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let awaiting = AwaitingResponse::new(&method, &path, started);
    let sent = upstream_request.send().await;
    awaiting.disarm();

    match sent {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            let ctx = RelayContext {
                method,
                path,
                status,
                started,
                span: Span::current(),
                _permit: permit,
                _in_flight: in_flight,
            };
            relay_response(upstream_response, ctx)
        }
        Err(e) => {
            error!(error = %e, method = %method, path = %path, "upstream error");
            let err = ProxyError::Upstream(e);
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error(err.upstream_kind().unwrap_or("other"));

            let elapsed = started.elapsed();
            metrics::record_request(
                StatusCode::BAD_GATEWAY.as_u16(),
                method.as_str(),
                elapsed.as_secs_f64(),
            );
            info!(
                method = %method,
                path = %path,
                status = StatusCode::BAD_GATEWAY.as_u16(),
                outcome = "upstream_error",
                duration_ms = elapsed.as_millis() as u64,
                "completed"
            );
            err.into_response()
        }
    }
}

/// Copy upstream status and headers, then stream the body through `RelayBody`.
fn relay_response(upstream: reqwest::Response, ctx: RelayContext) -> Response {
    let status = upstream.status();
    let headers = forwardable_headers(upstream.headers());

    let body = Body::from_stream(RelayBody::new(upstream.bytes_stream(), ctx));
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Destination URL: upstream scheme, host and port with the inbound path and
/// query. Any path, credentials or fragment on the configured upstream are
/// dropped.
pub fn upstream_url(upstream: &Url, uri: &Uri) -> Url {
    let mut url = upstream.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_path(uri.path());
    url.set_query(uri.query());
    url.set_fragment(None);
    url
}

/// Inbound headers minus hop-by-hop headers and `Host` (the client derives
/// `Host` from the upstream URL).
pub fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = forwardable_headers(inbound);
    headers.remove(header::HOST);
    headers
}

/// Drop hop-by-hop headers, including any named in `Connection`.
fn forwardable_headers(source: &HeaderMap) -> HeaderMap {
    let listed: HashSet<HeaderName> = source
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    let mut headers = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        if !is_hop_by_hop(name.as_str()) && !listed.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// One debug record per inbound header, credentials masked.
fn log_request_headers(headers: &HeaderMap) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        if CREDENTIAL_HEADERS.contains(&name.as_str()) {
            debug!(header = %name, value = %common::mask(&value), "request header");
        } else {
            debug!(header = %name, value = %value, "request header");
        }
    }
}
