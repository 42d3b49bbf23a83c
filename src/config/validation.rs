//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (breaker overrides name known upstreams)
//! - Validate value ranges (timeouts > 0, budgets > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{BreakerConfig, GatewayConfig, RateLimitBackend};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    let mut names = HashSet::new();
    for (i, upstream) in config.upstreams.iter().enumerate() {
        let field = format!("upstreams[{}]", i);
        if upstream.name.is_empty() {
            errors.push(ValidationError::new(&field, "name must not be empty"));
        } else if !names.insert(upstream.name.as_str()) {
            errors.push(ValidationError::new(
                &field,
                format!("duplicate upstream name '{}'", upstream.name),
            ));
        }
        match Url::parse(&upstream.base_url) {
            Ok(url) if url.scheme() == "http" => {}
            Ok(url) => errors.push(ValidationError::new(
                format!("{}.base_url", field),
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => errors.push(ValidationError::new(
                format!("{}.base_url", field),
                e.to_string(),
            )),
        }
        if !upstream.path_prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("{}.path_prefix", field),
                "must start with '/'",
            ));
        }
    }

    let timeouts = &config.timeouts;
    if timeouts.base_ms == 0 {
        errors.push(ValidationError::new("timeouts.base_ms", "must be > 0"));
    }
    if timeouts.max_ms < timeouts.base_ms {
        errors.push(ValidationError::new("timeouts.max_ms", "must be >= base_ms"));
    }
    if timeouts.min_throughput_bytes_per_ms == 0 {
        errors.push(ValidationError::new(
            "timeouts.min_throughput_bytes_per_ms",
            "must be > 0",
        ));
    }

    validate_breaker("circuit_breaker", &config.circuit_breaker.defaults, &mut errors);
    for (service, breaker) in &config.circuit_breaker.services {
        let field = format!("circuit_breaker.services.{}", service);
        if !names.contains(service.as_str()) {
            errors.push(ValidationError::new(&field, "no upstream with this name"));
        }
        validate_breaker(&field, breaker, &mut errors);
    }

    let rate_limit = &config.rate_limit;
    if rate_limit.backend == RateLimitBackend::Redis && rate_limit.redis_url.is_none() {
        errors.push(ValidationError::new(
            "rate_limit.redis_url",
            "required when backend = \"redis\"",
        ));
    }
    if rate_limit.store_timeout_ms == 0 {
        errors.push(ValidationError::new("rate_limit.store_timeout_ms", "must be > 0"));
    }
    for (tier, policy) in &rate_limit.tiers {
        if policy.points == 0 || policy.window_secs == 0 {
            errors.push(ValidationError::new(
                format!("rate_limit.tiers.{}", tier),
                "points and window_secs must be > 0",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_breaker(field: &str, breaker: &BreakerConfig, errors: &mut Vec<ValidationError>) {
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::new(
            format!("{}.failure_threshold", field),
            "must be > 0",
        ));
    }
    if breaker.open_timeout_ms == 0 {
        errors.push(ValidationError::new(
            format!("{}.open_timeout_ms", field),
            "must be > 0",
        ));
    }
    if breaker.statistics_reset_ms == 0 {
        errors.push(ValidationError::new(
            format!("{}.statistics_reset_ms", field),
            "must be > 0",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::UpstreamConfig;

    fn upstream(name: &str, base_url: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.into(),
            base_url: base_url.into(),
            path_prefix: format!("/api/{}", name),
            strip_prefix: false,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.upstreams.push(upstream("users", "http://127.0.0.1:3001"));
        config.upstreams.push(upstream("users", "ftp://127.0.0.1"));
        config.circuit_breaker.defaults.failure_threshold = 0;
        config.rate_limit.backend = RateLimitBackend::Redis;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"listener.bind_address"));
        assert!(fields.contains(&"upstreams[1]"));
        assert!(fields.contains(&"upstreams[1].base_url"));
        assert!(fields.contains(&"circuit_breaker.failure_threshold"));
        assert!(fields.contains(&"rate_limit.redis_url"));
    }

    #[test]
    fn test_override_must_name_upstream() {
        let mut config = GatewayConfig::default();
        config.upstreams.push(upstream("users", "http://127.0.0.1:3001"));
        config
            .circuit_breaker
            .services
            .insert("billing".into(), BreakerConfig::default());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "circuit_breaker.services.billing");
    }
}
