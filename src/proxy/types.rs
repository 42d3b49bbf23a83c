//! Per-call proxy structures.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::{RetryConfig, TimeoutConfig};
use crate::security::access_control::UserContext;

/// An inbound request about to be forwarded.
pub struct ProxyRequest {
    pub method: Method,
    /// Path and query, relative to the target base URL.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    pub client_addr: Option<SocketAddr>,
    pub user: Option<UserContext>,
    pub request_id: Option<String>,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            client_addr: None,
            user: None,
            request_id: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn with_user(mut self, user: Option<UserContext>) -> Self {
        self.user = user;
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// How one call is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub target_url: String,
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub buffer_size: usize,
}

impl ProxyConfig {
    pub fn new(target_url: impl Into<String>, timeouts: &TimeoutConfig, retries: &RetryConfig) -> Self {
        Self {
            target_url: target_url.into(),
            timeout: Duration::from_millis(timeouts.base_ms),
            max_retries: retries.max_retries,
            retry_delay: Duration::from_millis(retries.base_delay_ms),
            buffer_size: retries.buffer_size,
        }
    }
}

/// A forwarded response with its body still streaming.
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
    pub success: bool,
    pub attempts: u32,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Body, attempts: u32) -> Self {
        Self {
            status,
            headers,
            body,
            success: status.is_success() || status.is_redirection(),
            attempts,
        }
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
