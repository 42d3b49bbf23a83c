//! Caller identity.
//!
//! Identity is owned by an external auth service; the gateway only needs a
//! resolved user context for rate limit keys, tier selection and the
//! `x-user-*` headers forwarded upstream. The `Authenticator` trait is that
//! seam. `StaticTokenAuthenticator` resolves bearer tokens from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::config::AuthConfig;
use crate::http::response::unauthorized;

/// Context attached to authenticated requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    pub email: Option<String>,
    pub role: String,
}

impl UserContext {
    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case("admin")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed authorization header")]
    Malformed,
    #[error("unknown credentials")]
    Unknown,
}

/// Resolves the caller from request headers.
pub trait Authenticator: Send + Sync {
    /// `Ok(None)` for anonymous requests.
    fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserContext>, AuthError>;
}

/// Bearer token from the `Authorization` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| AuthError::Malformed)?;
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(Some(token.trim()))
        }
        _ => Err(AuthError::Malformed),
    }
}

/// Authenticator backed by the `[auth]` token table.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserContext>,
}

impl StaticTokenAuthenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    UserContext {
                        user_id: t.user_id.clone(),
                        email: t.email.clone(),
                        role: t.role.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserContext>, AuthError> {
        match bearer_token(headers)? {
            None => Ok(None),
            Some(token) => self
                .tokens
                .get(token)
                .cloned()
                .map(Some)
                .ok_or(AuthError::Unknown),
        }
    }
}

/// Attach a `UserContext` extension when the caller authenticates.
/// Anonymous requests pass through; bad credentials are rejected.
pub async fn access_control_middleware(
    State(authenticator): State<Arc<dyn Authenticator>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match authenticator.authenticate(req.headers()) {
        Ok(Some(ctx)) => {
            tracing::debug!(user_id = %ctx.user_id, role = %ctx.role, "Caller authenticated");
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Ok(None) => next.run(req).await,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected credentials");
            unauthorized(&e.to_string()).into_response()
        }
    }
}
