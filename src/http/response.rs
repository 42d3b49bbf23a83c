//! Gateway-generated responses.
//!
//! # Responsibilities
//! - Map proxy errors and gateway rejections to HTTP responses
//! - Attach rate limit metadata headers
//!
//! # Design Decisions
//! - Every error body is JSON with a stable `error` code
//! - Rejections that clients should back off from carry `Retry-After`

use axum::{
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::proxy::error::{ErrorCode, ProxyError};
use crate::resilience::CircuitOpen;
use crate::security::rate_limit::RateLimitDecision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Set `X-RateLimit-*` headers from a decision.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at()));
}

fn with_retry_after(mut response: Response, secs: u64) -> Response {
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    response
}

/// 429 for an exhausted budget.
pub fn rate_limited(decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after_secs();
    let body = json!({
        "error": ErrorCode::RateLimitExceeded.as_str(),
        "message": format!("Too many requests for the {} tier, retry later", decision.tier),
        "retryAfter": retry_after,
    });
    let mut response = with_retry_after(
        (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response(),
        retry_after,
    );
    apply_rate_limit_headers(response.headers_mut(), decision);
    response
}

/// 503 for a call refused by an open breaker.
pub fn circuit_open(open: &CircuitOpen) -> Response {
    let retry_after = open.retry_after_secs();
    let body = json!({
        "error": ErrorCode::CircuitOpen.as_str(),
        "service": open.service,
        "retryAfter": retry_after,
    });
    with_retry_after(
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response(),
        retry_after,
    )
}

pub fn route_not_found(path: &str) -> Response {
    let body = json!({
        "error": ErrorCode::RouteNotFound.as_str(),
        "message": format!("No upstream serves {}", path),
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

pub fn unauthorized(message: &str) -> Response {
    let body = json!({
        "error": "UNAUTHORIZED",
        "message": message,
    });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.code.as_str(),
            "message": self.message,
            "retryable": self.retryable,
        });
        if !self.details.is_empty() {
            body["details"] = json!(self.details);
        }
        (self.status_code, Json(body)).into_response()
    }
}
