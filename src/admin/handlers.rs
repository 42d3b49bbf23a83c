use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::http::server::GatewayState;
use crate::resilience::BreakerStatistics;
use crate::security::rate_limit::TierStatus;
use crate::security::tiers::Tier;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub upstreams: usize,
    pub breakers: usize,
    pub rate_limit_enabled: bool,
    pub rate_limit_backend: &'static str,
    pub rate_limit_degraded: bool,
}

#[derive(Serialize)]
pub struct ClientRateLimits {
    pub client_id: String,
    pub tiers: Vec<TierStatus>,
}

fn not_found(message: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "NOT_FOUND", "message": message })),
    )
        .into_response()
}

pub async fn get_status(State(state): State<GatewayState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started_at.elapsed().as_secs(),
        upstreams: state.upstreams.len(),
        breakers: state.breakers.len(),
        rate_limit_enabled: state.limiter.is_enabled(),
        rate_limit_backend: state.limiter.backend_name(),
        rate_limit_degraded: state.limiter.is_degraded(),
    })
}

/// Statistics of every configured upstream's breaker.
pub async fn get_breakers(State(state): State<GatewayState>) -> Json<Vec<BreakerStatistics>> {
    for upstream in state.upstreams.upstreams() {
        state.breakers.get(&upstream.name);
    }
    Json(state.breakers.statistics())
}

pub async fn get_breaker(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
) -> Response {
    let known = state.upstreams.upstreams().iter().any(|u| u.name == service);
    let breaker = match state.breakers.lookup(&service) {
        Some(breaker) => breaker,
        None if known => state.breakers.get(&service),
        None => return not_found(format!("unknown service '{}'", service)),
    };
    Json(breaker.statistics()).into_response()
}

pub async fn get_rate_limits(
    State(state): State<GatewayState>,
    Path(client_id): Path<String>,
) -> Json<ClientRateLimits> {
    let tiers = state.limiter.peek(&client_id).await;
    Json(ClientRateLimits { client_id, tiers })
}

pub async fn reset_rate_limit(
    State(state): State<GatewayState>,
    Path((tier, client_id)): Path<(String, String)>,
) -> Response {
    let tier: Tier = match tier.parse() {
        Ok(tier) => tier,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "INVALID_TIER", "message": message })),
            )
                .into_response()
        }
    };

    match state.limiter.reset(tier, &client_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!(tier = %tier, client = %client_id, error = %e, "Rate limit reset failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "STORE_UNAVAILABLE", "message": e.to_string() })),
            )
                .into_response()
        }
    }
}
