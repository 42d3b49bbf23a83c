//! Admin API, served on its own listener.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::GatewayState;

pub fn setup_admin_router(state: GatewayState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/breakers/{service}", get(get_breaker))
        .route("/admin/rate-limits/{client_id}", get(get_rate_limits))
        .route("/admin/rate-limits/{tier}/{client_id}", delete(reset_rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
