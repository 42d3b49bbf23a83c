//! Registry of circuit breakers keyed by upstream service name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::{BreakerConfig, CircuitBreakerSettings};
use crate::resilience::circuit_breaker::{BreakerStatistics, CircuitBreaker};

/// Owns one breaker per upstream service, created on first use and kept
/// for the process lifetime.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: &CircuitBreakerSettings) -> Self {
        Self {
            defaults: settings.defaults,
            overrides: settings.services.clone(),
            breakers: DashMap::new(),
        }
    }

    /// Config a breaker for `service` is (or would be) created with.
    pub fn config_for(&self, service: &str) -> BreakerConfig {
        self.overrides.get(service).copied().unwrap_or(self.defaults)
    }

    /// The breaker for `service`, created lazily.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.clone();
        }
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                tracing::debug!(service, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(service, self.config_for(service)))
            })
            .clone()
    }

    /// The breaker for `service` if one was created.
    pub fn lookup(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|b| b.clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Statistics of every known breaker, sorted by service name.
    pub fn statistics(&self) -> Vec<BreakerStatistics> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.statistics()).collect();
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    /// Housekeeping period: the shortest `statistics_reset` of any config.
    pub fn housekeeping_interval(&self) -> Duration {
        self.overrides
            .values()
            .map(BreakerConfig::statistics_reset)
            .chain(std::iter::once(self.defaults.statistics_reset()))
            .min()
            .unwrap_or(Duration::from_secs(60))
            .max(Duration::from_millis(10))
    }

    /// Run one housekeeping pass over every breaker.
    pub fn housekeep(&self) {
        let breakers: Vec<_> = self.breakers.iter().map(|b| b.clone()).collect();
        for breaker in breakers {
            breaker.housekeep();
        }
    }

    /// Periodic housekeeping until shutdown.
    pub async fn run_housekeeping(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = self.housekeeping_interval();
        tracing::info!(interval = ?interval, "Circuit breaker housekeeping starting");

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.housekeep(),
                _ = shutdown.recv() => {
                    tracing::info!("Circuit breaker housekeeping received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;

    fn settings() -> CircuitBreakerSettings {
        let mut settings = CircuitBreakerSettings::default();
        settings.defaults.failure_threshold = 2;
        settings.services.insert(
            "media".into(),
            BreakerConfig {
                failure_threshold: 1,
                statistics_reset_ms: 250,
                ..BreakerConfig::default()
            },
        );
        settings
    }

    #[test]
    fn test_one_breaker_per_service() {
        let registry = CircuitBreakerRegistry::new(&settings());
        assert!(registry.is_empty());

        let a = registry.get("users");
        let b = registry.get("users");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("media").is_none());
    }

    #[test]
    fn test_overrides_apply() {
        let registry = CircuitBreakerRegistry::new(&settings());
        assert_eq!(registry.get("users").config().failure_threshold, 2);
        assert_eq!(registry.get("media").config().failure_threshold, 1);
        assert_eq!(registry.housekeeping_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_breakers_are_isolated() {
        let registry = CircuitBreakerRegistry::new(&settings());
        registry.get("media").record_failure();

        assert_eq!(registry.get("media").state(), CircuitState::Open);
        assert_eq!(registry.get("users").state(), CircuitState::Closed);

        let stats = registry.statistics();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].service, "media");
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_task_stops_on_shutdown() {
        let registry = Arc::new(CircuitBreakerRegistry::new(&settings()));
        registry.get("media").record_failure();

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(registry.clone().run_housekeeping(rx));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.get("media").state(), CircuitState::HalfOpen);

        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
