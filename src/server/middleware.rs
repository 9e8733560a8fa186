//! Gateway adapter between HTTP semantics and the decision engine.
//!
//! A [`tower::Layer`] that extracts the client IP and `API_KEY` header
//! from each request, resolves the identity and policy, evaluates the
//! decision engine, and either delegates to the inner service or writes
//! the 429/500 response itself. The adapter owns the per-evaluation
//! structured log record; the engine stays silent.

use crate::limiter::engine::RateLimiter;
use crate::limiter::resolver::PolicyRegistry;
use crate::limiter::{Decision, RATE_LIMIT_EXCEEDED_MESSAGE};
use crate::metrics;
use crate::storage::Storage;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};
use tracing::{error, info, warn};

/// Request header carrying the API key. Name matching is
/// case-insensitive per HTTP; the value is case-sensitive.
const API_KEY_HEADER: &str = "API_KEY";

/// Applies rate limiting in front of an inner service.
pub struct RateLimitLayer<S: Storage> {
    limiter: Arc<RateLimiter<S>>,
    registry: Arc<PolicyRegistry>,
    evaluation_deadline: Option<Duration>,
}

impl<S: Storage> RateLimitLayer<S> {
    pub fn new(limiter: Arc<RateLimiter<S>>, registry: Arc<PolicyRegistry>) -> Self {
        Self {
            limiter,
            registry,
            evaluation_deadline: None,
        }
    }

    /// Deadline forwarded to the store for every evaluation this layer
    /// performs. Wins over the store's own safety-net timeout when
    /// tighter.
    pub fn with_evaluation_deadline(mut self, deadline: Duration) -> Self {
        self.evaluation_deadline = Some(deadline);
        self
    }
}

impl<S: Storage> Clone for RateLimitLayer<S> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            registry: Arc::clone(&self.registry),
            evaluation_deadline: self.evaluation_deadline,
        }
    }
}

impl<Inner, S: Storage> Layer<Inner> for RateLimitLayer<S> {
    type Service = RateLimitService<Inner, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            registry: Arc::clone(&self.registry),
            evaluation_deadline: self.evaluation_deadline,
        }
    }
}

pub struct RateLimitService<Inner, S: Storage> {
    inner: Inner,
    limiter: Arc<RateLimiter<S>>,
    registry: Arc<PolicyRegistry>,
    evaluation_deadline: Option<Duration>,
}

impl<Inner: Clone, S: Storage> Clone for RateLimitService<Inner, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            registry: Arc::clone(&self.registry),
            evaluation_deadline: self.evaluation_deadline,
        }
    }
}

impl<Inner, S> Service<Request<Body>> for RateLimitService<Inner, S>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send,
    S: Storage + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = BoxFuture<'static, Result<Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Take the ready inner service and leave its clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let limiter = Arc::clone(&self.limiter);
        let registry = Arc::clone(&self.registry);
        let deadline = self.evaluation_deadline;

        Box::pin(async move {
            let client_ip = extract_client_ip(&req);
            let api_key = req
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let (identity, policy) = registry.resolve(&client_ip, &api_key);
            let kind = identity.kind().as_str();

            let started = Instant::now();
            match limiter.evaluate(&identity, &policy, deadline).await {
                Ok(decision) => {
                    metrics::record_decision(
                        kind,
                        decision.label(),
                        started.elapsed().as_secs_f64(),
                    );

                    match &decision {
                        Decision::Pass {
                            remaining_tokens,
                            limit,
                        } => {
                            info!(
                                identity_kind = kind,
                                identity = identity.value(),
                                limit,
                                window_secs = policy.window.as_secs_f64(),
                                remaining = remaining_tokens,
                                outcome = decision.label(),
                                "request allowed"
                            );
                            inner.call(req).await
                        }
                        Decision::PreBlocked => {
                            warn!(
                                identity_kind = kind,
                                identity = identity.value(),
                                limit = policy.capacity,
                                window_secs = policy.window.as_secs_f64(),
                                outcome = decision.label(),
                                "request denied, identity is blocked"
                            );
                            Ok(rate_limit_exceeded_response())
                        }
                        Decision::JustExhausted {
                            remaining_tokens,
                            limit,
                        } => {
                            warn!(
                                identity_kind = kind,
                                identity = identity.value(),
                                limit,
                                window_secs = policy.window.as_secs_f64(),
                                remaining = remaining_tokens,
                                outcome = decision.label(),
                                "rate limit exceeded, blocking identity"
                            );
                            Ok(rate_limit_exceeded_response())
                        }
                    }
                }
                Err(err) => {
                    metrics::record_evaluation_error(kind);
                    error!(
                        identity_kind = kind,
                        identity = identity.value(),
                        error = %err,
                        "rate limiter evaluation failed"
                    );
                    Ok(internal_server_error_response())
                }
            }
        })
    }
}

/// Extract the client IP, first non-empty source wins:
/// 1. first comma-separated entry of `X-Forwarded-For`, trimmed;
/// 2. `X-Real-IP`;
/// 3. the transport remote address with the `:port` suffix stripped.
fn extract_client_ip(req: &Request<Body>) -> String {
    if let Some(forwarded_for) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded_for.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
    {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| strip_port(&info.0.to_string()))
        .unwrap_or_default()
}

/// Strip a trailing `:port` using the LAST colon as separator. Bracketed
/// IPv6 addresses ("[::1]:4242") survive this; raw unbracketed IPv6 does
/// not and is a known limitation.
fn strip_port(addr: &str) -> String {
    match addr.rfind(':') {
        Some(idx) => addr[..idx].to_string(),
        None => addr.to_string(),
    }
}

fn rate_limit_exceeded_response() -> Response {
    json_response(
        StatusCode::TOO_MANY_REQUESTS,
        serde_json::json!({ "message": RATE_LIMIT_EXCEEDED_MESSAGE }),
        RATE_LIMIT_EXCEEDED_MESSAGE,
    )
}

fn internal_server_error_response() -> Response {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        serde_json::json!({ "error": "Internal Server Error" }),
        "Internal Server Error",
    )
}

/// Build a JSON response, falling back to plain text with the same
/// status if the body cannot be encoded.
fn json_response(status: StatusCode, body: serde_json::Value, fallback: &str) -> Response {
    let response = serde_json::to_vec(&body).ok().and_then(|bytes| {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .ok()
    });

    response.unwrap_or_else(|| plain_text_response(status, fallback))
}

fn plain_text_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}
