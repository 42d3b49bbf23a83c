//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router with the gateway handler
//! - Wire up middleware (request ID, tracing, auth, rate limits)
//! - Resolve the upstream, gate the call through its circuit breaker
//! - Forward through the stream proxy and record the outcome
//!
//! # Layer order (outermost first)
//! ```text
//! set request id → trace → propagate request id → in-flight limit → timeout
//!     → authenticator → rate limiter → gateway_handler
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::GatewayConfig;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer, RequestIdExt};
use crate::http::response::{circuit_open, route_not_found};
use crate::observability::metrics;
use crate::proxy::{ErrorCode, HyperTransport, ProxyConfig, ProxyError, ProxyRequest, StreamProxy, Transport};
use crate::resilience::CircuitBreakerRegistry;
use crate::routing::UpstreamTable;
use crate::security::access_control::{
    access_control_middleware, Authenticator, StaticTokenAuthenticator, UserContext,
};
use crate::security::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::security::store::StoreError;

/// Shared gateway state injected into handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub upstreams: Arc<UpstreamTable>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub proxy: Arc<StreamProxy>,
    pub authenticator: Arc<dyn Authenticator>,
    pub started_at: Instant,
}

impl GatewayState {
    /// Build every subsystem from configuration, forwarding over HTTP.
    pub fn from_config(config: GatewayConfig) -> Result<Self, StoreError> {
        let transport = Arc::new(HyperTransport::new(Duration::from_millis(
            config.timeouts.connect_ms,
        )));
        Self::with_transport(config, transport)
    }

    /// Like [`GatewayState::from_config`] with a caller-supplied transport.
    pub fn with_transport(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, StoreError> {
        let limiter = RateLimiter::from_config(&config.rate_limit)?;
        tracing::info!(backend = limiter.backend_name(), "Rate limiter ready");

        Ok(Self {
            upstreams: Arc::new(UpstreamTable::from_config(&config.upstreams)),
            breakers: Arc::new(CircuitBreakerRegistry::new(&config.circuit_breaker)),
            limiter: Arc::new(limiter),
            proxy: Arc::new(StreamProxy::new(transport, config.timeouts.clone())),
            authenticator: Arc::new(StaticTokenAuthenticator::from_config(&config.auth)),
            config: Arc::new(config),
            started_at: Instant::now(),
        })
    }
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    state: GatewayState,
}

impl HttpServer {
    pub fn new(state: GatewayState) -> Self {
        let router = Self::build_router(state.clone());
        Self { router, state }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    pub fn build_router(state: GatewayState) -> Router {
        // The proxy enforces per-call deadlines; this only bounds a stuck handler.
        let outer_timeout =
            Duration::from_millis(state.config.timeouts.max_ms) + Duration::from_secs(5);
        let in_flight = Arc::new(Semaphore::new(state.config.listener.max_connections.max(1)));

        Router::new()
            .route("/{*path}", any(gateway_handler))
            .route("/", any(gateway_handler))
            .layer(middleware::from_fn_with_state(
                state.limiter.clone(),
                rate_limit_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                state.authenticator.clone(),
                access_control_middleware,
            ))
            .with_state(state)
            .layer(TimeoutLayer::new(outer_timeout))
            .layer(middleware::from_fn_with_state(in_flight, in_flight_limit))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstreams = self.state.upstreams.len(),
            "HTTP server starting"
        );

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server received shutdown signal");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Hold one of `max_connections` permits for the lifetime of the handler.
async fn in_flight_limit(
    State(permits): State<Arc<Semaphore>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match permits.acquire_owned().await {
        Ok(_permit) => next.run(request).await,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Whether a proxy failure says something about upstream health.
fn counts_against_upstream(error: &ProxyError) -> bool {
    !matches!(
        error.code,
        ErrorCode::ValidationError | ErrorCode::RequestAborted
    )
}

/// Resolve the upstream, gate through its breaker, forward, record.
async fn gateway_handler(State(state): State<GatewayState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let request_id = request.request_id();

    let Some(route) = state.upstreams.resolve(&path_and_query) else {
        tracing::warn!(request_id = ?request_id, path = %path, "No upstream matched");
        metrics::record_request(method.as_str(), 404, "none", start);
        return route_not_found(&path);
    };

    let breaker = state.breakers.get(&route.service);
    if let Err(open) = breaker.try_acquire() {
        tracing::warn!(
            request_id = ?request_id,
            service = %route.service,
            retry_after = open.retry_after_secs(),
            "Circuit open, rejecting request"
        );
        metrics::record_request(method.as_str(), 503, &route.service, start);
        return circuit_open(&open);
    }

    tracing::debug!(
        request_id = ?request_id,
        method = %method,
        path = %path,
        service = %route.service,
        "Proxying request"
    );

    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let user = request.extensions().get::<UserContext>().cloned();

    let (parts, body) = request.into_parts();
    let body = (!body.is_end_stream()).then_some(body);

    let mut proxy_request = ProxyRequest::new(parts.method, route.forward_path.clone())
        .with_headers(parts.headers)
        .with_user(user)
        .with_request_id(request_id.clone());
    if let Some(body) = body {
        proxy_request = proxy_request.with_body(body);
    }
    if let Some(addr) = client_addr {
        proxy_request = proxy_request.with_client_addr(addr);
    }

    let config = ProxyConfig::new(
        route.base_url.clone(),
        &state.config.timeouts,
        &state.config.retries,
    );

    match state.proxy.proxy_stream(proxy_request, &config).await {
        Ok(response) => {
            let status = response.status;
            if matches!(
                status,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            ) {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
            metrics::record_request(method.as_str(), status.as_u16(), &route.service, start);
            response.into_response()
        }
        Err(error) => {
            if counts_against_upstream(&error) {
                breaker.record_failure();
            }
            tracing::warn!(
                request_id = ?request_id,
                service = %route.service,
                code = %error.code,
                attempts = error.attempts,
                "Proxy call failed"
            );
            metrics::record_request(
                method.as_str(),
                error.status_code.as_u16(),
                &route.service,
                start,
            );
            error.into_response()
        }
    }
}
