//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::security::tiers::{Tier, TierPolicy, TierRule};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// Static upstream table. First matching path prefix wins.
    pub upstreams: Vec<UpstreamConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Circuit breaker defaults and per-service overrides.
    pub circuit_breaker: CircuitBreakerSettings,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Static bearer tokens understood by the authenticator.
    pub auth: AuthConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// A backend service the gateway forwards to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Service name. Keys the circuit breaker registry.
    pub name: String,

    /// Base URL requests are forwarded to (e.g., "http://127.0.0.1:3001").
    pub base_url: String,

    /// Path prefix routed to this service.
    pub path_prefix: String,

    /// Remove the matched prefix before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,
}

/// Timeout configuration for proxied calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Base call timeout in milliseconds (used when no body size is known).
    pub base_ms: u64,

    /// Upper bound for size-scaled timeouts in milliseconds.
    pub max_ms: u64,

    /// Assumed minimum upstream throughput, in bytes per millisecond.
    pub min_throughput_bytes_per_ms: u64,

    /// TCP connect timeout in milliseconds.
    pub connect_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_ms: 30_000,
            max_ms: 300_000,
            min_throughput_bytes_per_ms: 1024,
            connect_ms: 5_000,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries performed after the first attempt.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Request bodies up to this many bytes are buffered so they can be replayed.
    pub buffer_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            buffer_size: 64 * 1024,
        }
    }
}

/// Tunables of a single circuit breaker.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,

    /// Time the breaker stays open before a trial call, in milliseconds.
    pub open_timeout_ms: u64,

    /// Housekeeping period in milliseconds.
    pub statistics_reset_ms: u64,

    /// Failure-free period after which counters are cleared, in milliseconds.
    pub failure_monitoring_window_ms: u64,
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn statistics_reset(&self) -> Duration {
        Duration::from_millis(self.statistics_reset_ms)
    }

    pub fn failure_monitoring_window(&self) -> Duration {
        Duration::from_millis(self.failure_monitoring_window_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 60_000,
            statistics_reset_ms: 60_000,
            failure_monitoring_window_ms: 120_000,
        }
    }
}

/// Circuit breaker section: defaults plus per-service overrides.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    #[serde(flatten)]
    pub defaults: BreakerConfig,

    /// Overrides keyed by upstream service name.
    pub services: HashMap<String, BreakerConfig>,
}

/// Which counter store backs the rate limiter.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackend {
    #[default]
    Memory,
    Redis,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Counter store.
    pub backend: RateLimitBackend,

    /// Redis connection URL, required for the redis backend.
    pub redis_url: Option<String>,

    /// Key namespace in the shared store.
    pub key_prefix: String,

    /// How long to stay on the in-process store after the shared store failed.
    pub fallback_retry_secs: u64,

    /// Upper bound on one shared-store call before it counts as a failure.
    pub store_timeout_ms: u64,

    /// Expired in-process records are purged at this interval.
    pub purge_interval_secs: u64,

    /// Tier budgets. Missing tiers use built-in defaults.
    pub tiers: HashMap<Tier, TierPolicy>,

    /// Ordered tier selection table. Empty means the built-in table.
    pub rules: Vec<TierRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: RateLimitBackend::Memory,
            redis_url: None,
            key_prefix: "gateway:rl".to_string(),
            fallback_retry_secs: 30,
            store_timeout_ms: 250,
            purge_interval_secs: 60,
            tiers: HashMap::new(),
            rules: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// Resolved policy for a tier.
    pub fn policy(&self, tier: Tier) -> TierPolicy {
        self.tiers
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.default_policy())
    }
}

/// A bearer token known to the static authenticator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

/// Authenticator configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenConfig>,
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "compact").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [[upstreams]]
            name = "properties"
            base_url = "http://127.0.0.1:3001"
            path_prefix = "/api/properties"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstreams.len(), 1);
        assert!(!config.upstreams[0].strip_prefix);
        assert_eq!(config.timeouts.base_ms, 30_000);
        assert_eq!(config.circuit_breaker.defaults.failure_threshold, 5);
        assert_eq!(config.rate_limit.backend, RateLimitBackend::Memory);
    }

    #[test]
    fn test_breaker_overrides_and_tier_budgets() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [circuit_breaker]
            failure_threshold = 3

            [circuit_breaker.services.users]
            failure_threshold = 10
            open_timeout_ms = 5000

            [rate_limit]
            backend = "redis"
            redis_url = "redis://127.0.0.1/"

            [rate_limit.tiers.auth]
            points = 3
            window_secs = 60
            block_secs = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.defaults.failure_threshold, 3);
        let users = config.circuit_breaker.services["users"];
        assert_eq!(users.failure_threshold, 10);
        assert_eq!(users.open_timeout(), Duration::from_secs(5));
        assert_eq!(config.rate_limit.backend, RateLimitBackend::Redis);
        assert_eq!(config.rate_limit.policy(Tier::Auth).points, 3);
        assert_eq!(config.rate_limit.policy(Tier::Admin).points, 200);
    }
}
