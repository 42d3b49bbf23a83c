//! Retrying streaming proxy.
//!
//! # Data Flow
//! ```text
//! ProxyRequest
//!     → can_proxy / multipart header validation (fail fast)
//!     → CallContext (deadline = max(config timeout, size-based timeout))
//!     → attempt loop: Transport::send raced against deadline + cancellation
//!         failure → classify → retry after backoff while retryable,
//!                   attempts remain and the body can be replayed
//!     → ProxyResponse (live body) or ProxyError
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use tokio_util::sync::CancellationToken;

use crate::config::TimeoutConfig;
use crate::http::multipart;
use crate::http::request::X_REQUEST_ID;
use crate::observability::metrics;
use crate::proxy::body::{declared_length, OutboundBody};
use crate::proxy::error::{classify, ClassifyContext, ErrorCode, ProxyError, RawError};
use crate::proxy::transport::Transport;
use crate::proxy::types::{ProxyConfig, ProxyRequest, ProxyResponse};
use crate::resilience::backoff::retry_delay_from;
use crate::resilience::{dynamic_timeout, CallContext, Interrupted};
use crate::security::headers::{append_forwarded_for, apply_user_headers, strip_hop_by_hop};

const PROXYABLE_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

/// Upstream statuses that are retried before being passed through.
const RETRY_STATUSES: [StatusCode; 3] = [
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

pub struct StreamProxy {
    transport: Arc<dyn Transport>,
    timeouts: TimeoutConfig,
}

impl StreamProxy {
    pub fn new(transport: Arc<dyn Transport>, timeouts: TimeoutConfig) -> Self {
        Self {
            transport,
            timeouts,
        }
    }

    /// Whether the request is something this proxy forwards at all.
    pub fn can_proxy(&self, request: &ProxyRequest) -> bool {
        !request.path.is_empty() && PROXYABLE_METHODS.contains(&request.method)
    }

    pub fn dynamic_timeout(&self, content_length: Option<u64>) -> Duration {
        dynamic_timeout(&self.timeouts, content_length)
    }

    pub async fn proxy_stream(
        &self,
        request: ProxyRequest,
        config: &ProxyConfig,
    ) -> Result<ProxyResponse, ProxyError> {
        self.proxy_stream_with_cancel(request, config, CancellationToken::new())
            .await
    }

    /// Forward `request`, giving up when `cancel` fires.
    pub async fn proxy_stream_with_cancel(
        &self,
        mut request: ProxyRequest,
        config: &ProxyConfig,
        cancel: CancellationToken,
    ) -> Result<ProxyResponse, ProxyError> {
        let target = target_url(&config.target_url, &request.path);
        let context = ClassifyContext {
            request_url: request.path.clone(),
            target_url: target.clone(),
            method: request.method.to_string(),
        };

        if !self.can_proxy(&request) {
            return Err(ProxyError::new(
                ErrorCode::ValidationError,
                format!("cannot proxy {} {:?}", request.method, request.path),
            )
            .with_context(&context));
        }

        if is_multipart(&request.headers) {
            let validation = multipart::validate_upload_headers(&request.headers);
            if !validation.valid {
                tracing::warn!(
                    target_url = %target,
                    errors = ?validation.errors,
                    "Rejected malformed multipart upload"
                );
                return Err(ProxyError::validation(validation.errors).with_context(&context));
            }
        }

        let budget = config
            .timeout
            .max(self.dynamic_timeout(declared_length(&request.headers)));
        let call = CallContext::new(budget, cancel);

        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                let raw = RawError::Invalid(format!("invalid target url {}: {}", target, e));
                return Err(classify(&raw, &context));
            }
        };

        let headers = forwarded_headers(&request);
        let body = match call
            .run(OutboundBody::prepare(
                request.body.take(),
                &request.headers,
                config.buffer_size,
            ))
            .await
        {
            Ok(Ok(body)) => body,
            Ok(Err(raw)) => return Err(classify(&raw, &context)),
            Err(interrupted) => return Err(classify(&RawError::from(interrupted), &context)),
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let mut outbound = Request::new(body.for_attempt());
            *outbound.method_mut() = request.method.clone();
            *outbound.uri_mut() = uri.clone();
            *outbound.headers_mut() = headers.clone();

            let outcome = match call.run(self.transport.send(outbound)).await {
                Ok(result) => result,
                Err(interrupted) => Err(RawError::from(interrupted)),
            };

            let retries_left = attempt <= config.max_retries && body.is_replayable();

            let failure = match outcome {
                Ok(response) if RETRY_STATUSES.contains(&response.status()) && retries_left => {
                    let status = response.status();
                    let classified = classify(&RawError::Status(status), &context);
                    drop(response);
                    classified
                }
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    let mut headers = parts.headers;
                    strip_hop_by_hop(&mut headers);
                    tracing::debug!(
                        target_url = %target,
                        status = %parts.status,
                        attempt,
                        "Upstream responded"
                    );
                    return Ok(ProxyResponse::new(parts.status, headers, body, attempt));
                }
                Err(raw) => {
                    let classified = classify(&raw, &context).with_attempts(attempt);
                    let deadline_hit = matches!(raw, RawError::Timeout(_)) && call.is_expired();
                    if !classified.retryable || !retries_left || deadline_hit {
                        tracing::warn!(
                            target_url = %target,
                            code = %classified.code,
                            attempt,
                            error = %classified.message,
                            "Upstream call failed"
                        );
                        metrics::record_upstream_error(classified.code.as_str());
                        return Err(classified);
                    }
                    classified
                }
            };

            let delay = retry_delay_from(config.retry_delay, &failure, attempt);
            if delay >= call.remaining() {
                tracing::warn!(
                    target_url = %target,
                    code = %failure.code,
                    attempt,
                    "No time left for another attempt"
                );
                metrics::record_upstream_error(ErrorCode::TimeoutError.as_str());
                return Err(classify(&RawError::Timeout(call.budget()), &context)
                    .with_attempts(attempt));
            }

            tracing::info!(
                target_url = %target,
                code = %failure.code,
                attempt,
                delay = ?delay,
                "Retrying upstream call"
            );
            metrics::record_retry(failure.code.as_str());

            if let Err(interrupted) = call.sleep(delay).await {
                let raw = RawError::from(interrupted);
                let error = classify(&raw, &context).with_attempts(attempt);
                if interrupted == Interrupted::Cancelled {
                    tracing::debug!(target_url = %target, "Call cancelled during backoff");
                }
                return Err(error);
            }
        }
    }
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/"))
}

fn target_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Headers sent upstream on every attempt.
fn forwarded_headers(request: &ProxyRequest) -> HeaderMap {
    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    if let Some(addr) = request.client_addr {
        append_forwarded_for(&mut headers, addr);
    }
    apply_user_headers(&mut headers, request.user.as_ref());

    if let Some(id) = request.request_id.as_deref() {
        if let Ok(value) = HeaderValue::from_str(id) {
            headers.insert(X_REQUEST_ID, value);
        }
    }
    headers
}
