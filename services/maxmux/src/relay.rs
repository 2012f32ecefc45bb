//! Streaming relay of upstream response bodies
//!
//! `RelayBody` wraps the upstream byte stream and hands every chunk to the
//! client as soon as it arrives. It never buffers, so server-sent events reach
//! the caller with the same latency as a direct connection.
//!
//! Dropping the body (hyper does this when the client disconnects) drops the
//! upstream stream with it, which closes the upstream connection. The drop is
//! also where the per-request completion record is written and where the
//! request gives back its connection slot. `AwaitingResponse` covers the gap
//! before upstream headers arrive, so every forwarded request logs exactly one
//! completion whatever the outcome.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use axum::http::{Method, StatusCode};
use bytes::Bytes;
use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{Span, info, warn};

use crate::metrics::{self, InFlightGuard};

/// How a relayed response body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Still streaming.
    Streaming,
    /// Upstream finished and every chunk was handed to the client.
    Completed,
    /// Upstream stream failed after headers were already sent.
    UpstreamInterrupted,
    /// Client went away before the upstream finished.
    ClientDisconnected,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Streaming => "streaming",
            RelayOutcome::Completed => "completed",
            RelayOutcome::UpstreamInterrupted => "upstream_interrupted",
            RelayOutcome::ClientDisconnected => "client_disconnected",
        }
    }
}

impl fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request details carried into the completion record.
#[derive(Debug)]
pub struct RelayContext {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub started: Instant,
    pub span: Span,
    /// Held until the body is dropped; releases the connection slot.
    pub _permit: OwnedSemaphorePermit,
    pub _in_flight: InFlightGuard,
}

pin_project! {
    /// Chunk-for-chunk pass-through stream that logs completion on drop.
    pub struct RelayBody<S> {
        #[pin]
        inner: S,
        ctx: RelayContext,
        outcome: RelayOutcome,
        bytes: u64,
    }

    impl<S> PinnedDrop for RelayBody<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if *this.outcome == RelayOutcome::Streaming {
                *this.outcome = RelayOutcome::ClientDisconnected;
            }
            let ctx = &*this.ctx;
            let _enter = ctx.span.enter();
            let elapsed = ctx.started.elapsed();

            if *this.outcome == RelayOutcome::ClientDisconnected {
                info!(
                    method = %ctx.method,
                    path = %ctx.path,
                    bytes = *this.bytes,
                    "client disconnected mid-stream, abandoning upstream"
                );
            }

            metrics::record_request(ctx.status.as_u16(), ctx.method.as_str(), elapsed.as_secs_f64());
            info!(
                method = %ctx.method,
                path = %ctx.path,
                status = ctx.status.as_u16(),
                outcome = %this.outcome,
                bytes = *this.bytes,
                duration_ms = elapsed.as_millis() as u64,
                "completed"
            );
        }
    }
}

impl<S> RelayBody<S> {
    pub fn new(inner: S, ctx: RelayContext) -> Self {
        Self {
            inner,
            ctx,
            outcome: RelayOutcome::Streaming,
            bytes: 0,
        }
    }
}

/// Completion record for a request abandoned while waiting on upstream
/// headers. Dropping an armed guard means the handler future itself was
/// dropped, which only happens when the caller went away.
pub struct AwaitingResponse<'a> {
    method: &'a Method,
    path: &'a str,
    started: Instant,
    armed: bool,
}

impl<'a> AwaitingResponse<'a> {
    pub fn new(method: &'a Method, path: &'a str, started: Instant) -> Self {
        Self {
            method,
            path,
            started,
            armed: true,
        }
    }

    /// The send resolved; the caller of the send writes the record from here on.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AwaitingResponse<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let elapsed = self.started.elapsed();
        info!(
            method = %self.method,
            path = %self.path,
            "client disconnected before upstream responded, abandoning upstream"
        );
        info!(
            method = %self.method,
            path = %self.path,
            outcome = %RelayOutcome::ClientDisconnected,
            bytes = 0u64,
            duration_ms = elapsed.as_millis() as u64,
            "completed"
        );
    }
}

impl<S, E> Stream for RelayBody<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.outcome != RelayOutcome::Streaming {
            return Poll::Ready(None);
        }

        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                *this.outcome = RelayOutcome::UpstreamInterrupted;
                let _enter = this.ctx.span.enter();
                warn!(
                    error = %e,
                    method = %this.ctx.method,
                    path = %this.ctx.path,
                    bytes = *this.bytes,
                    "upstream stream interrupted after headers were sent"
                );
                Poll::Ready(Some(Err(e)))
            }
            None => {
                *this.outcome = RelayOutcome::Completed;
                Poll::Ready(None)
            }
        }
    }
}
