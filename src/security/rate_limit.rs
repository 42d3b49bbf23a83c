//! Tiered rate limiting.
//!
//! # Responsibilities
//! - Pick the tier of a request from the tier table
//! - Consume one point from the caller's budget in that tier
//! - Fall back to in-process counters while the shared store is down
//! - Reject exhausted callers with 429 and tag every response with the
//!   remaining budget
//!
//! # Design Decisions
//! - Counter keys are `{tier}:{client_id}`
//! - The limiter fails open: a broken store never blocks traffic
//! - Every shared-store call is bounded by `store_timeout_ms`; a slow store
//!   counts as a failed one

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::config::{RateLimitBackend, RateLimitConfig};
use crate::http::response::{apply_rate_limit_headers, rate_limited};
use crate::observability::metrics;
use crate::security::access_control::UserContext;
use crate::security::redis_store::RedisStore;
use crate::security::store::{Consumption, MemoryStore, RateLimitStore, StoreError};
use crate::security::tiers::{Tier, TierPolicy, TierTable};

/// Outcome of one consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub tier: Tier,
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub ms_before_reset: u64,
}

impl RateLimitDecision {
    fn from_consumption(tier: Tier, policy: &TierPolicy, consumption: &Consumption) -> Self {
        Self {
            tier,
            allowed: consumption.allowed,
            limit: policy.points,
            remaining: consumption.remaining(policy),
            ms_before_reset: consumption.ms_before_reset,
        }
    }

    /// Seconds until the caller may retry, rounded up, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        self.ms_before_reset.div_ceil(1000).max(1)
    }

    /// Unix time (seconds) at which the budget resets.
    pub fn reset_at(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now + self.ms_before_reset.div_ceil(1000)
    }
}

/// Budget state of one tier for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub limit: u32,
    pub consumed: u32,
    pub remaining: u32,
    pub ms_before_reset: u64,
    pub blocked: bool,
}

/// Rate limit key of a caller: the remote IP, qualified by user when known.
pub fn client_id(ip: IpAddr, user: Option<&UserContext>) -> String {
    match user {
        Some(user) => format!("{}:{}", ip, user.user_id),
        None => ip.to_string(),
    }
}

fn store_key(tier: Tier, client_id: &str) -> String {
    format!("{}:{}", tier, client_id)
}

pub struct RateLimiter {
    enabled: bool,
    config: RateLimitConfig,
    table: TierTable,
    shared: Option<Arc<dyn RateLimitStore>>,
    memory: Arc<MemoryStore>,
    fallback_retry: Duration,
    store_timeout: Duration,
    degraded_until: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Build the limiter with the backend selected in `config`.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, StoreError> {
        let shared: Option<Arc<dyn RateLimitStore>> = match config.backend {
            RateLimitBackend::Memory => None,
            RateLimitBackend::Redis => {
                let url = config.redis_url.as_deref().ok_or_else(|| {
                    StoreError::Unavailable("redis backend selected without redis_url".into())
                })?;
                let store = RedisStore::new(url, config.key_prefix.clone())?
                    .with_response_timeout(Duration::from_millis(config.store_timeout_ms.max(1)));
                Some(Arc::new(store))
            }
        };
        Ok(Self::build(config, shared))
    }

    /// In-process counters only.
    pub fn in_memory(config: &RateLimitConfig) -> Self {
        Self::build(config, None)
    }

    /// Use `store` as the shared backend, with in-process fallback.
    pub fn with_store(config: &RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: &RateLimitConfig, shared: Option<Arc<dyn RateLimitStore>>) -> Self {
        Self {
            enabled: config.enabled,
            config: config.clone(),
            table: TierTable::from_config(&config.rules),
            shared,
            memory: Arc::new(MemoryStore::new()),
            fallback_retry: Duration::from_secs(config.fallback_retry_secs.max(1)),
            store_timeout: Duration::from_millis(config.store_timeout_ms.max(1)),
            degraded_until: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policy(&self, tier: Tier) -> TierPolicy {
        self.config.policy(tier)
    }

    pub fn select_tier(&self, path: &str, role: Option<&str>) -> Tier {
        self.table.select(path, role)
    }

    /// Name of the store currently serving requests.
    pub fn backend_name(&self) -> &'static str {
        match &self.shared {
            Some(shared) if !self.is_degraded() => shared.name(),
            _ => self.memory.name(),
        }
    }

    /// Whether the shared store is bypassed after a failure.
    pub fn is_degraded(&self) -> bool {
        self.degraded_until
            .lock()
            .map(|guard| guard.is_some_and(|until| Instant::now() < until))
            .unwrap_or(false)
    }

    /// The shared store, unless it failed recently.
    fn shared_store(&self) -> Option<&Arc<dyn RateLimitStore>> {
        let shared = self.shared.as_ref()?;
        let Ok(mut degraded) = self.degraded_until.lock() else {
            return Some(shared);
        };
        match *degraded {
            Some(until) if Instant::now() < until => None,
            Some(_) => {
                tracing::info!(store = shared.name(), "Retrying shared rate limit store");
                *degraded = None;
                Some(shared)
            }
            None => Some(shared),
        }
    }

    fn degrade(&self, error: &StoreError) {
        tracing::warn!(
            error = %error,
            retry_in = ?self.fallback_retry,
            "Shared rate limit store failed, using in-process counters"
        );
        if let Ok(mut degraded) = self.degraded_until.lock() {
            *degraded = Some(Instant::now() + self.fallback_retry);
        }
    }

    /// Run one shared-store call, failing it once `store_timeout` elapses.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        time::timeout(self.store_timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.store_timeout)))
    }

    /// Take one point from `client_id`'s budget in `tier`.
    pub async fn consume(&self, tier: Tier, client_id: &str) -> RateLimitDecision {
        let policy = self.policy(tier);
        let key = store_key(tier, client_id);

        if let Some(shared) = self.shared_store() {
            match self.bounded(shared.consume(&key, &policy)).await {
                Ok(consumption) => {
                    return RateLimitDecision::from_consumption(tier, &policy, &consumption)
                }
                Err(e) => self.degrade(&e),
            }
        }

        let consumption = self.memory.take(&key, &policy);
        RateLimitDecision::from_consumption(tier, &policy, &consumption)
    }

    /// Status of every tier for `client_id`, without consuming.
    pub async fn peek(&self, client_id: &str) -> Vec<TierStatus> {
        let mut statuses = Vec::with_capacity(Tier::ALL.len());
        for tier in Tier::ALL {
            let policy = self.policy(tier);
            let key = store_key(tier, client_id);

            let snapshot = match self.shared_store() {
                Some(shared) => match self.bounded(shared.peek(&key, &policy)).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        self.degrade(&e);
                        self.memory.snapshot(&key, &policy)
                    }
                },
                None => self.memory.snapshot(&key, &policy),
            };

            statuses.push(match snapshot {
                Some(c) => TierStatus {
                    tier,
                    limit: policy.points,
                    consumed: c.consumed_points,
                    remaining: c.remaining(&policy),
                    ms_before_reset: c.ms_before_reset,
                    blocked: !c.allowed,
                },
                None => TierStatus {
                    tier,
                    limit: policy.points,
                    consumed: 0,
                    remaining: policy.points,
                    ms_before_reset: 0,
                    blocked: false,
                },
            });
        }
        statuses
    }

    /// Forget `client_id`'s usage in `tier`, in every store.
    pub async fn reset(&self, tier: Tier, client_id: &str) -> Result<(), StoreError> {
        let key = store_key(tier, client_id);
        self.memory.forget(&key);
        if let Some(shared) = &self.shared {
            self.bounded(shared.reset(&key)).await?;
        }
        tracing::info!(tier = %tier, client = %client_id, "Rate limit budget reset");
        Ok(())
    }

    pub fn purge_expired(&self) -> usize {
        self.memory.purge_expired()
    }

    /// Periodically purge expired in-process records until shutdown.
    pub async fn run_purge(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.config.purge_interval_secs.max(1));
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = self.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, "Purged expired rate limit records");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Rate limit purge received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Middleware enforcing the per-tier budgets.
///
/// Runs after the authenticator so the caller's role and id are known.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.is_enabled() {
        return next.run(request).await;
    }

    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::from([0, 0, 0, 0]));
    let user = request.extensions().get::<UserContext>();
    let tier = limiter.select_tier(request.uri().path(), user.map(|u| u.role.as_str()));
    let client = client_id(ip, user);

    let decision = limiter.consume(tier, &client).await;
    if !decision.allowed {
        tracing::warn!(
            client = %client,
            tier = %tier,
            retry_after = decision.retry_after_secs(),
            "Rate limit exceeded"
        );
        metrics::record_rate_limited(tier.as_str());
        return rate_limited(&decision);
    }

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct DownStore {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RateLimitStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn consume(&self, _: &str, _: &TierPolicy) -> Result<Consumption, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn peek(&self, _: &str, _: &TierPolicy) -> Result<Option<Consumption>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn reset(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Never answers.
    struct StalledStore;

    #[async_trait]
    impl RateLimitStore for StalledStore {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn consume(&self, _: &str, _: &TierPolicy) -> Result<Consumption, StoreError> {
            std::future::pending().await
        }

        async fn peek(&self, _: &str, _: &TierPolicy) -> Result<Option<Consumption>, StoreError> {
            std::future::pending().await
        }

        async fn reset(&self, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    fn config() -> RateLimitConfig {
        let mut config = RateLimitConfig::default();
        config.tiers.insert(Tier::Auth, TierPolicy::new(5, 900, 900));
        config
    }

    #[tokio::test]
    async fn test_exactly_points_allowed() {
        let limiter = RateLimiter::in_memory(&config());
        for i in 0..5 {
            let decision = limiter.consume(Tier::Auth, "1.2.3.4").await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, 5);
            assert_eq!(decision.remaining, 4 - i);
        }

        let denied = limiter.consume(Tier::Auth, "1.2.3.4").await;
        assert!(!denied.allowed);
        assert!(denied.ms_before_reset > 0);
        assert_eq!(denied.retry_after_secs(), 900);

        assert!(limiter.consume(Tier::General, "1.2.3.4").await.allowed);
    }

    #[tokio::test]
    async fn test_peek_and_reset() {
        let limiter = RateLimiter::in_memory(&config());
        limiter.consume(Tier::Search, "c").await;
        limiter.consume(Tier::Search, "c").await;

        let statuses = limiter.peek("c").await;
        assert_eq!(statuses.len(), Tier::ALL.len());
        let search = statuses.iter().find(|s| s.tier == Tier::Search).unwrap();
        assert_eq!(search.consumed, 2);
        assert_eq!(search.remaining, 28);
        let general = statuses.iter().find(|s| s.tier == Tier::General).unwrap();
        assert_eq!(general.consumed, 0);

        limiter.reset(Tier::Search, "c").await.unwrap();
        let statuses = limiter.peek("c").await;
        let search = statuses.iter().find(|s| s.tier == Tier::Search).unwrap();
        assert_eq!(search.consumed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_when_shared_store_is_down() {
        let store = Arc::new(DownStore::default());
        let limiter = RateLimiter::with_store(&config(), store.clone());
        assert_eq!(limiter.backend_name(), "down");

        let decision = limiter.consume(Tier::General, "c").await;
        assert!(decision.allowed);
        assert!(limiter.is_degraded());
        assert_eq!(limiter.backend_name(), "memory");

        // Degraded period: the shared store is not touched.
        limiter.consume(Tier::General, "c").await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        limiter.consume(Tier::General, "c").await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_client_id() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(client_id(ip, None), "10.1.2.3");
        let user = UserContext {
            user_id: "42".into(),
            email: None,
            role: "user".into(),
        };
        assert_eq!(client_id(ip, Some(&user)), "10.1.2.3:42");
    }

    #[test]
    fn test_decision_timing() {
        let decision = RateLimitDecision {
            tier: Tier::General,
            allowed: true,
            limit: 100,
            remaining: 99,
            ms_before_reset: 1,
        };
        assert_eq!(decision.retry_after_secs(), 1);
        assert!(decision.reset_at() > 1_600_000_000);
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let config = RateLimitConfig {
            backend: RateLimitBackend::Redis,
            ..RateLimitConfig::default()
        };
        assert!(RateLimiter::from_config(&config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_fails_open_within_timeout() {
        let limiter = Arc::new(RateLimiter::with_store(&config(), Arc::new(StalledStore)));
        let start = Instant::now();

        let decisions = futures_util::future::join_all(
            (0..5).map(|i| {
                let limiter = limiter.clone();
                async move { limiter.consume(Tier::General, &format!("c{}", i)).await }
            }),
        )
        .await;

        assert!(decisions.iter().all(|d| d.allowed));
        assert!(start.elapsed() <= Duration::from_millis(250));
        assert!(limiter.is_degraded());

        let statuses = limiter.peek("c0").await;
        let general = statuses.iter().find(|s| s.tier == Tier::General).unwrap();
        assert_eq!(general.consumed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_reset_times_out() {
        let limiter = RateLimiter::with_store(&config(), Arc::new(StalledStore));
        let result = limiter.reset(Tier::General, "c").await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_silent_redis_does_not_stall_traffic() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = RateLimitConfig {
            backend: RateLimitBackend::Redis,
            redis_url: Some(format!("redis://{}/", addr)),
            store_timeout_ms: 200,
            ..config()
        };
        let limiter = Arc::new(RateLimiter::from_config(&config).unwrap());

        let start = std::time::Instant::now();
        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let decision = limiter.consume(Tier::General, &format!("c{}", i)).await;
                    (decision, start.elapsed())
                })
            })
            .collect();

        for task in tasks {
            let (decision, elapsed) = task.await.unwrap();
            assert!(decision.allowed);
            assert!(elapsed < Duration::from_secs(1), "consume took {:?}", elapsed);
        }
        assert!(limiter.is_degraded());
    }
}
