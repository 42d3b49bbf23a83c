//! Header manipulation for forwarded traffic.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Append the client address to X-Forwarded-For
//! - Replace client-supplied `x-user-*` identity headers with the
//!   authenticated context
//!
//! # Design Decisions
//! - Identity headers from the client are never trusted
//! - Existing X-Forwarded-For chains are kept and extended

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::security::access_control::UserContext;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");
pub const X_USER_ROLE: HeaderName = HeaderName::from_static("x-user-role");

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Append `client` to the X-Forwarded-For chain.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: SocketAddr) {
    let ip = client.ip().to_string();
    let chain = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, ip),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Drop inbound identity headers and, for an authenticated caller, set them
/// from the resolved context.
pub fn apply_user_headers(headers: &mut HeaderMap, user: Option<&UserContext>) {
    headers.remove(&X_USER_ID);
    headers.remove(&X_USER_EMAIL);
    headers.remove(&X_USER_ROLE);

    let Some(user) = user else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&user.user_id) {
        headers.insert(X_USER_ID, value);
    }
    if let Some(email) = user.email.as_deref() {
        if let Ok(value) = HeaderValue::from_str(email) {
            headers.insert(X_USER_EMAIL, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&user.role) {
        headers.insert(X_USER_ROLE, value);
    }
}
