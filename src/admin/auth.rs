use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::http::server::GatewayState;

/// Admit the configured API key, or an authenticated caller with the admin role.
pub async fn admin_auth_middleware(
    State(state): State<GatewayState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = &state.config.admin.api_key;
    if let Some(auth_val) = auth_header {
        if !api_key.is_empty() && auth_val == format!("Bearer {}", api_key) {
            return Ok(next.run(request).await);
        }
    }

    match state.authenticator.authenticate(request.headers()) {
        Ok(Some(user)) if user.is_admin() => {
            tracing::debug!(user_id = %user.user_id, "Admin access by role");
            Ok(next.run(request).await)
        }
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
