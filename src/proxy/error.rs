//! Proxy error taxonomy and the classifier that maps raw failures onto it.
//!
//! Classification order, first match wins:
//! 1. deadline elapsed / timed out        → TIMEOUT_ERROR    (408, retryable)
//! 2. connect, refused, reset, DNS         → CONNECTION_ERROR (502, retryable)
//! 3. caller cancellation                  → REQUEST_ABORTED  (499)
//! 4. body stream / pipe failures          → STREAM_ERROR     (500)
//! 5. malformed input                      → VALIDATION_ERROR (400)
//! 6. anything else                        → UNKNOWN_ERROR    (500, retryable
//!    only for transient system codes or transient upstream statuses)

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::resilience::Interrupted;

/// Stable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TimeoutError,
    ConnectionError,
    RequestAborted,
    StreamError,
    ValidationError,
    UnknownError,
    CircuitOpen,
    RateLimitExceeded,
    RouteNotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::RequestAborted => "REQUEST_ABORTED",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
        }
    }

    /// Advisory HTTP status for the code.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::TimeoutError => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::ConnectionError => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestAborted => client_closed_request(),
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorCode::StreamError | ErrorCode::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether errors with this code are retried by default.
    pub fn default_retryable(&self) -> bool {
        matches!(self, ErrorCode::TimeoutError | ErrorCode::ConnectionError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 499 Client Closed Request (nginx convention).
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Upstream statuses worth another attempt.
pub const TRANSIENT_STATUSES: [u16; 7] = [408, 429, 502, 503, 504, 507, 509];

/// System error codes worth another attempt.
pub const TRANSIENT_SYSTEM_CODES: [&str; 6] = [
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
];

pub fn is_transient_status(status: StatusCode) -> bool {
    TRANSIENT_STATUSES.contains(&status.as_u16())
}

/// A raw failure observed while proxying, before classification.
#[derive(Debug, Error)]
pub enum RawError {
    #[error("deadline of {0:?} elapsed")]
    Timeout(Duration),

    #[error("request cancelled by caller")]
    Cancelled,

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("upstream transport failure: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("body stream failure: {0}")]
    Stream(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("upstream responded with {0}")]
    Status(StatusCode),
}

impl From<Interrupted> for RawError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::DeadlineElapsed(budget) => RawError::Timeout(budget),
            Interrupted::Cancelled => RawError::Cancelled,
        }
    }
}

impl RawError {
    /// Deepest `io::Error` in the source chain, if any.
    fn io_error(&self) -> Option<&io::Error> {
        let mut current: Option<&(dyn StdError + 'static)> = match self {
            RawError::Io(e) => return Some(e),
            RawError::Client(e) => e.source(),
            _ => None,
        };
        while let Some(err) = current {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                return Some(io);
            }
            current = err.source();
        }
        None
    }

    fn chain_mentions(&self, needle: &str) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(err) = current {
            if err.to_string().to_ascii_lowercase().contains(needle) {
                return true;
            }
            current = err.source();
        }
        false
    }

    fn hyper_error(&self) -> Option<&hyper::Error> {
        let mut current: Option<&(dyn StdError + 'static)> = match self {
            RawError::Client(e) => e.source(),
            _ => None,
        };
        while let Some(err) = current {
            if let Some(hyper) = err.downcast_ref::<hyper::Error>() {
                return Some(hyper);
            }
            current = err.source();
        }
        None
    }

    /// Errno-style code of the underlying system failure, if one is known.
    pub fn system_code(&self) -> Option<&'static str> {
        if let Some(io) = self.io_error() {
            let code = match io.kind() {
                io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
                io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
                io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
                io::ErrorKind::BrokenPipe => Some("EPIPE"),
                io::ErrorKind::NotConnected => Some("ENOTCONN"),
                io::ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
                _ => None,
            };
            if code.is_some() {
                return code;
            }
        }
        if self.chain_mentions("dns error") || self.chain_mentions("failed to lookup address") {
            return Some("ENOTFOUND");
        }
        if self.hyper_error().is_some_and(|e| e.is_incomplete_message()) {
            return Some("ECONNRESET");
        }
        None
    }

    fn code(&self) -> ErrorCode {
        let system_code = self.system_code();
        let io_kind = self.io_error().map(io::Error::kind);

        // 1. timeouts
        if matches!(self, RawError::Timeout(_)) || io_kind == Some(io::ErrorKind::TimedOut) {
            return ErrorCode::TimeoutError;
        }

        // 2. connection-level failures
        let connect_failure = matches!(self, RawError::Client(e) if e.is_connect());
        if connect_failure
            || matches!(
                system_code,
                Some("ECONNREFUSED" | "ECONNRESET" | "ECONNABORTED" | "ENOTFOUND" | "ENOTCONN" | "EADDRNOTAVAIL")
            )
        {
            return ErrorCode::ConnectionError;
        }

        // 3. caller cancellation
        if matches!(self, RawError::Cancelled) {
            return ErrorCode::RequestAborted;
        }

        // 4. stream / pipe failures
        if matches!(self, RawError::Stream(_))
            || matches!(
                io_kind,
                Some(io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof)
            )
        {
            return ErrorCode::StreamError;
        }

        // 5. malformed input
        if matches!(self, RawError::Invalid(_))
            || matches!(
                io_kind,
                Some(io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData)
            )
        {
            return ErrorCode::ValidationError;
        }

        ErrorCode::UnknownError
    }

    fn unknown_is_transient(&self) -> bool {
        if let RawError::Status(status) = self {
            return is_transient_status(*status);
        }
        self.system_code()
            .is_some_and(|code| TRANSIENT_SYSTEM_CODES.contains(&code))
    }
}

/// Where a failure happened, attached to the classified error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifyContext {
    pub request_url: String,
    pub target_url: String,
    pub method: String,
}

/// A typed, classified proxy failure.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{code}: {message}")]
pub struct ProxyError {
    pub code: ErrorCode,
    #[serde(serialize_with = "serialize_status")]
    pub status_code: StatusCode,
    pub retryable: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(skip)]
    pub context: ClassifyContext,
    #[serde(skip)]
    pub attempts: u32,
}

fn serialize_status<S: serde::Serializer>(status: &StatusCode, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u16(status.as_u16())
}

impl ProxyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code: code.status(),
            retryable: code.default_retryable(),
            message: message.into(),
            details: Vec::new(),
            context: ClassifyContext::default(),
            attempts: 0,
        }
    }

    /// A validation failure listing every defect.
    pub fn validation(details: Vec<String>) -> Self {
        let mut error = Self::new(ErrorCode::ValidationError, "request failed validation");
        error.details = details;
        error
    }

    pub fn with_context(mut self, context: &ClassifyContext) -> Self {
        self.context = context.clone();
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Map a raw failure to a typed error.
pub fn classify(raw: &RawError, context: &ClassifyContext) -> ProxyError {
    let code = raw.code();
    let retryable = match code {
        ErrorCode::UnknownError => raw.unknown_is_transient(),
        other => other.default_retryable(),
    };

    ProxyError {
        code,
        status_code: code.status(),
        retryable,
        message: raw.to_string(),
        details: Vec::new(),
        context: context.clone(),
        attempts: 0,
    }
}

/// Whether a raw failure is worth another attempt.
pub fn is_retryable(raw: &RawError) -> bool {
    classify(raw, &ClassifyContext::default()).retryable
}
