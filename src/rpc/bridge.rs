//! Host side of the RPC bridge
//!
//! Every call passes the same gates, in order:
//!
//! ```text
//! identity headers ── missing ─────────────────► 403
//! live-sandbox index ─ unknown / mismatch / stale ► 403
//! per-sandbox bucket ─ empty ──────────────────► 429
//! body ────────────── not an RpcRequest ──────► 400
//! registry ────────── no such capability ─────► 200, error flag set
//! handler ─────────── Err / panic ────────────► 200, error flag set
//!                     Ok ─────────────────────► 200, value
//! ```
//!
//! Handlers run on their own task so a panic surfaces as a `JoinError`
//! instead of tearing down the connection.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, UnixListener};
use tower::ServiceExt;
use tracing::{debug, info, info_span, warn, Instrument};

use super::envelope::{
    decode_key_header, RpcRequest, RpcResponse, CALL_PATH, HEADER_CONVERSATION_KEY, HEADER_ERROR,
    HEADER_METHOD_KIND, HEADER_RUN_ID, HEADER_SANDBOX_ID,
};
use crate::capability::{CallContext, CallRequest, CapabilityRegistry};
use crate::governor::{Authorized, LiveError, LiveSandboxes, ShortCircuit};
use crate::metrics::{self, RPC_CALLS, RPC_REJECTED};
use crate::security::{KeyedRateLimiter, RateLimitError};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Burst of calls a sandbox may make
    pub rate_capacity: u64,
    /// Sustained calls per second per sandbox
    pub rate_per_sec: f64,
    pub max_body_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            rate_capacity: 50,
            rate_per_sec: 10.0,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct Bridge {
    registry: Arc<CapabilityRegistry>,
    live: Arc<LiveSandboxes>,
    limiter: Arc<KeyedRateLimiter>,
    config: BridgeConfig,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    live_sandboxes: usize,
    capabilities: usize,
}

impl Bridge {
    pub fn new(registry: Arc<CapabilityRegistry>, live: Arc<LiveSandboxes>, config: BridgeConfig) -> Self {
        Self {
            limiter: Arc::new(KeyedRateLimiter::new(config.rate_capacity, config.rate_per_sec)),
            registry,
            live,
            config,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(CALL_PATH, post(call))
            .route("/metrics", get(metrics_text))
            .route("/healthz", get(health))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .with_state(self.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "rpc bridge listening");
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }

    /// Bind a Unix socket any sandbox uid may connect to
    ///
    /// A stale socket file from an earlier run is replaced.
    pub fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale bridge socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        Ok(listener)
    }

    /// Serve over a Unix socket until `shutdown` resolves
    ///
    /// Connections already accepted run to completion on their own tasks.
    pub async fn serve_unix<F>(self, listener: UnixListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = ?addr, "rpc bridge listening on unix socket");
        }
        let router = self.router();
        tokio::pin!(shutdown);

        loop {
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "failed to accept bridge connection");
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let router = router.clone();
            let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                router.clone().oneshot(request)
            });
            tokio::spawn(async move {
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(error = %e, "bridge connection ended with error");
                }
            });
        }
        Ok(())
    }

    /// Drop rate-limit buckets of sandboxes that are gone
    fn prune_limiter(&self) {
        if self.limiter.len() > self.live.len() * 2 + 64 {
            self.limiter.retain(|id| self.live.contains(id));
        }
    }
}

/// Why a call was turned away before reaching the registry
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("missing or malformed sandbox identity")]
    MissingIdentity,
    #[error(transparent)]
    Unauthorized(#[from] LiveError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::MissingIdentity | BridgeError::Unauthorized(_) => StatusCode::FORBIDDEN,
            BridgeError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::Malformed(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            BridgeError::MissingIdentity => "unknown_sandbox",
            BridgeError::Unauthorized(e) => e.reason(),
            BridgeError::RateLimited(_) => "rate_limited",
            BridgeError::Malformed(_) => "malformed",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        RPC_REJECTED.with_label_values(&[self.reason()]).inc();
        let mut response = (self.status(), Json(RpcResponse::err(self.to_string()))).into_response();
        let headers = response.headers_mut();
        headers.insert(HEADER_ERROR, HeaderValue::from_static("1"));
        if let BridgeError::RateLimited(e) = &self {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(e.retry_after.as_secs().max(1)));
        }
        response
    }
}

fn reply(body: RpcResponse, kind: &str) -> Response {
    let flag = if body.is_error() { "1" } else { "0" };
    let mut response = (StatusCode::OK, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(HEADER_ERROR, HeaderValue::from_static(flag));
    if let Ok(kind) = HeaderValue::from_str(kind) {
        headers.insert(HEADER_METHOD_KIND, kind);
    }
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Identity, rate limit and envelope checks
fn admit(bridge: &Bridge, headers: &HeaderMap, body: &[u8]) -> Result<(Authorized, RpcRequest), BridgeError> {
    let (Some(sandbox_id), Some(key), Some(run_id)) = (
        header_str(headers, HEADER_SANDBOX_ID),
        header_str(headers, HEADER_CONVERSATION_KEY),
        header_str(headers, HEADER_RUN_ID),
    ) else {
        return Err(BridgeError::MissingIdentity);
    };

    let key = decode_key_header(key).ok_or(BridgeError::MissingIdentity)?;
    let authorized = bridge.live.authorize(sandbox_id, &key, run_id)?;

    bridge.prune_limiter();
    bridge.limiter.check(sandbox_id)?;

    let request = serde_json::from_slice(body)?;
    Ok((authorized, request))
}

async fn call(State(bridge): State<Bridge>, headers: HeaderMap, body: Bytes) -> Response {
    let (authorized, request) = match admit(&bridge, &headers, &body) {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!(
                sandbox_id = header_str(&headers, HEADER_SANDBOX_ID).unwrap_or("-"),
                reason = e.reason(),
                "rejected capability call"
            );
            return e.into_response();
        }
    };
    let sandbox_id = authorized.handle.sandbox_id.as_str();

    let descriptor = match bridge.registry.resolve(&request.capability_name) {
        Ok(d) => d,
        Err(e) => {
            RPC_CALLS.with_label_values(&["unknown", "error"]).inc();
            return reply(RpcResponse::err(e.to_string()), "tool");
        }
    };

    let context = CallContext {
        conversation_key: authorized.handle.conversation_key.clone(),
        sandbox_id: authorized.handle.sandbox_id.clone(),
        run_id: authorized.run_id.clone(),
        shared_dir: authorized.handle.shared_dir.clone(),
        guest_shared_root: authorized.handle.guest_shared_dir.clone(),
    };
    let call_request = CallRequest::new(request.args, request.kwargs);
    let handler = descriptor.handler.clone();
    let span = info_span!(
        "capability_call",
        capability = %descriptor.name,
        kind = %descriptor.kind,
        sandbox_id,
        run_id = %authorized.run_id,
    );
    let joined = tokio::spawn(async move { handler.call(call_request, &context).await }.instrument(span)).await;

    let kind = descriptor.kind;
    let (body, outcome) = match joined {
        Ok(Ok(value)) => {
            if kind.short_circuits() {
                authorized.journal.record(ShortCircuit {
                    capability: descriptor.name.clone(),
                    kind,
                    value: value.clone(),
                });
            }
            (RpcResponse::ok(value), "ok")
        }
        Ok(Err(e)) => (RpcResponse::err(e.to_string()), "error"),
        Err(e) => {
            warn!(capability = %descriptor.name, error = %e, "capability handler panicked");
            (RpcResponse::err("capability failed unexpectedly"), "panic")
        }
    };

    RPC_CALLS.with_label_values(&[descriptor.name.as_str(), outcome]).inc();
    debug!(
        capability = %descriptor.name,
        kind = %kind,
        sandbox_id,
        run_id = %authorized.run_id,
        outcome,
        "capability call"
    );
    reply(body, kind.as_str())
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
}

async fn health(State(bridge): State<Bridge>) -> Json<Health> {
    Json(Health {
        status: "ok",
        live_sandboxes: bridge.live.len(),
        capabilities: bridge.registry.len(),
    })
}
