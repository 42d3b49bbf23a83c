//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Initialize subsystems in dependency order
//! - Start background tasks (breaker housekeeping, rate limit purging)
//! - Bind listeners and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::setup_admin_router;
use crate::config::loader::ConfigError;
use crate::config::validation::validate_config;
use crate::config::GatewayConfig;
use crate::http::server::{GatewayState, HttpServer};
use crate::lifecycle::shutdown::Shutdown;
use crate::security::store::StoreError;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("rate limit store: {0}")]
    Store(#[from] StoreError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
}

async fn bind(address: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| StartupError::Bind {
            address: address.to_string(),
            source,
        })
}

/// A running gateway: proxy listener, optional admin listener and
/// background tasks, all tied to one shutdown coordinator.
pub struct Gateway {
    state: GatewayState,
    shutdown: Shutdown,
    local_addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    server: JoinHandle<io::Result<()>>,
    admin: Option<JoinHandle<io::Result<()>>>,
    background: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Start every subsystem described by `config`.
    pub async fn start(config: GatewayConfig) -> Result<Self, StartupError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let state = GatewayState::from_config(config)?;
        Self::start_with_state(state).await
    }

    /// Start from prebuilt state (e.g. with a custom transport).
    pub async fn start_with_state(state: GatewayState) -> Result<Self, StartupError> {
        let shutdown = Shutdown::new();
        let config = state.config.clone();

        let background = vec![
            tokio::spawn(state.breakers.clone().run_housekeeping(shutdown.subscribe())),
            tokio::spawn(state.limiter.clone().run_purge(shutdown.subscribe())),
        ];

        let admin_listener = if config.admin.enabled {
            Some(bind(&config.admin.bind_address).await?)
        } else {
            None
        };
        let listener = bind(&config.listener.bind_address).await?;

        let local_addr = listener.local_addr().map_err(|source| StartupError::Bind {
            address: config.listener.bind_address.clone(),
            source,
        })?;

        let (admin_addr, admin) = match admin_listener {
            Some(listener) => {
                let addr = listener.local_addr().ok();
                let router = setup_admin_router(state.clone());
                let mut rx = shutdown.subscribe();
                tracing::info!(address = ?addr, "Admin API listening");
                let handle = tokio::spawn(async move {
                    axum::serve(listener, router)
                        .with_graceful_shutdown(async move {
                            let _ = rx.recv().await;
                        })
                        .await
                });
                (addr, Some(handle))
            }
            None => (None, None),
        };

        let server = HttpServer::new(state.clone());
        let server = tokio::spawn(server.run(listener, shutdown.subscribe()));

        tracing::info!(
            address = %local_addr,
            upstreams = config.upstreams.len(),
            rate_limit_backend = state.limiter.backend_name(),
            "Gateway started"
        );

        Ok(Self {
            state,
            shutdown,
            local_addr,
            admin_addr,
            server,
            admin,
            background,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Wait for every task to finish. Returns after shutdown is triggered.
    pub async fn wait(self) -> io::Result<()> {
        let result = match self.server.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::other(e)),
        };
        if let Some(admin) = self.admin {
            if let Ok(Err(e)) = admin.await {
                tracing::error!(error = %e, "Admin listener failed");
            }
        }
        for task in self.background {
            let _ = task.await;
        }
        tracing::info!("Gateway stopped");
        result
    }

    /// Trigger shutdown and wait for it to complete.
    pub async fn stop(self) -> io::Result<()> {
        self.shutdown.trigger();
        self.wait().await
    }
}
