//! Outbound request bodies.
//!
//! Small bodies are buffered once and replayed on every attempt. Large or
//! unsized bodies stream straight through; such a body can only be sent
//! again if the previous attempt failed before reading from it.

use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap};
use futures_util::{stream, StreamExt};

use crate::proxy::error::RawError;

#[derive(Clone)]
pub enum OutboundBody {
    Empty,
    Buffered(Bytes),
    Streaming(Arc<Mutex<Option<Body>>>),
}

impl OutboundBody {
    /// Prepare `body` for forwarding. Bodies whose declared length fits in
    /// `buffer_size` are read into memory.
    pub async fn prepare(
        body: Option<Body>,
        headers: &HeaderMap,
        buffer_size: usize,
    ) -> Result<Self, RawError> {
        let Some(body) = body else {
            return Ok(OutboundBody::Empty);
        };

        match declared_length(headers) {
            Some(0) => Ok(OutboundBody::Empty),
            Some(len) if len <= buffer_size as u64 => {
                let bytes = axum::body::to_bytes(body, buffer_size)
                    .await
                    .map_err(|e| RawError::Stream(e.to_string()))?;
                Ok(OutboundBody::Buffered(bytes))
            }
            _ => Ok(OutboundBody::Streaming(Arc::new(Mutex::new(Some(body))))),
        }
    }

    /// Whether another attempt can send this body again.
    pub fn is_replayable(&self) -> bool {
        match self {
            OutboundBody::Empty | OutboundBody::Buffered(_) => true,
            OutboundBody::Streaming(slot) => slot
                .lock()
                .map(|guard| guard.is_some())
                .unwrap_or(false),
        }
    }

    /// Body for one attempt.
    ///
    /// A streaming body is only taken from its slot once the transport
    /// starts polling it, so an attempt that fails while connecting leaves
    /// it in place for the next one.
    pub fn for_attempt(&self) -> Body {
        match self {
            OutboundBody::Empty => Body::empty(),
            OutboundBody::Buffered(bytes) => Body::from(bytes.clone()),
            OutboundBody::Streaming(slot) => {
                let slot = Arc::clone(slot);
                let lazy = stream::once(async move {
                    slot.lock().ok().and_then(|mut guard| guard.take())
                })
                .flat_map(|taken| match taken {
                    Some(body) => body.into_data_stream().left_stream(),
                    None => stream::empty::<Result<Bytes, axum::Error>>().right_stream(),
                });
                Body::from_stream(lazy)
            }
        }
    }
}

/// Declared `Content-Length`, if present and numeric.
pub fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
