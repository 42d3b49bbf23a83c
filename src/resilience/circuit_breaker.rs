//! Circuit breaker for upstream protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: upstream assumed down, requests fail fast
//! - Half-Open: trial calls decide whether the upstream recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold
//! Open → Half-Open: first call (or housekeeping tick) after open_timeout
//! Half-Open → Closed: HALF_OPEN_SUCCESSES consecutive trial successes
//! Half-Open → Open: any trial failure
//! ```
//!
//! # Design Decisions
//! - One breaker per upstream service (see `registry.rs`)
//! - Fail fast in Open state; the upstream call is never made
//! - All mutation happens under one mutex so concurrent outcomes serialize
//! - Per-process only: it protects this instance's outbound connections

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::observability::metrics;

/// Trial successes needed to close a half-open breaker.
pub const HALF_OPEN_SUCCESSES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Rejection issued while the breaker is open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit for '{service}' is open, retry in {retry_after:?}")]
pub struct CircuitOpen {
    pub service: String,
    pub retry_after: Duration,
}

impl CircuitOpen {
    /// `retry_after` in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Outcome of [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpen),
    #[error(transparent)]
    Inner(E),
}

/// Point-in-time view of a breaker, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatistics {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub last_failure_ms_ago: Option<u64>,
    pub next_attempt_in_ms: Option<u64>,
    pub total_trips: u64,
    pub total_rejections: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    total_trips: u64,
    total_rejections: u64,
    total_successes: u64,
    total_failures: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            next_attempt: None,
            total_trips: 0,
            total_rejections: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

/// Per-upstream circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State stays consistent even if a holder panicked: every mutation is
        // a handful of field writes with no early exits.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Admit or reject a call. An open breaker whose timeout elapsed is
    /// switched to half-open and the call is admitted as a trial.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let next_attempt = inner.next_attempt.unwrap_or(now);
                if now < next_attempt {
                    inner.total_rejections += 1;
                    metrics::record_circuit_rejection(&self.service);
                    Err(CircuitOpen {
                        service: self.service.clone(),
                        retry_after: next_attempt - now,
                    })
                } else {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    Ok(())
                }
            }
        }
    }

    /// Record a successful upstream call.
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.total_successes += 1;
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= HALF_OPEN_SUCCESSES {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            // A call admitted before the breaker tripped; it proves nothing.
            CircuitState::Open => {}
        }
    }

    /// Record a failed upstream call.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    /// Run `call` through the breaker. `Err` from the call counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(BreakerError::Open)?;
        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Periodic maintenance, independent of traffic.
    ///
    /// Clears the counters of a closed breaker that has seen no failure for
    /// the monitoring window, and moves an open breaker whose timeout
    /// elapsed to half-open so it can recover without incoming calls.
    pub fn housekeep(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Open => {
                if inner.next_attempt.is_some_and(|next| now >= next) {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::Closed => {
                let quiet = inner.last_failure.map_or(true, |at| {
                    now.saturating_duration_since(at) >= self.config.failure_monitoring_window()
                });
                if quiet && (inner.failure_count > 0 || inner.success_count > 0) {
                    tracing::debug!(service = %self.service, "Clearing circuit breaker counters");
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    pub fn statistics(&self) -> BreakerStatistics {
        let now = Instant::now();
        let inner = self.lock();
        BreakerStatistics {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            last_failure_ms_ago: inner
                .last_failure
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            next_attempt_in_ms: match inner.state {
                CircuitState::Open => inner
                    .next_attempt
                    .map(|next| next.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
            total_trips: inner.total_trips,
            total_rejections: inner.total_rejections,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;

        match to {
            CircuitState::Open => {
                inner.next_attempt = Some(now + self.config.open_timeout());
                inner.total_trips += 1;
                tracing::warn!(
                    service = %self.service,
                    from = from.as_str(),
                    open_for = ?self.config.open_timeout(),
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.next_attempt = None;
                tracing::info!(service = %self.service, "Circuit half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                inner.next_attempt = None;
                tracing::info!(service = %self.service, "Circuit closed");
            }
        }
        metrics::record_circuit_state(&self.service, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "users",
            BreakerConfig {
                failure_threshold: threshold,
                open_timeout_ms: open_ms,
                statistics_reset_ms: 1_000,
                failure_monitoring_window_ms: 5_000,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 60_000);
        assert_eq!(cb.state(), CircuitState::Closed);

        for _ in 0..2 {
            assert!(matches!(fail(&cb).await, Err(BreakerError::Inner("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.statistics().failure_count, 2);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.statistics().failure_count, 0);
        assert_eq!(cb.statistics().total_trips, 1);
    }

    #[tokio::test]
    async fn test_open_rejects_without_calling_upstream() {
        let cb = breaker(1, 60_000);
        let _ = fail(&cb).await;

        let calls = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;

        match result {
            Err(BreakerError::Open(open)) => {
                assert_eq!(open.service, "users");
                assert!(open.retry_after <= Duration::from_secs(60));
                assert_eq!(open.retry_after_secs(), 60);
            }
            other => panic!("expected open circuit, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.statistics().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3, 60_000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery() {
        let cb = breaker(2, 1_000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.statistics().success_count, 1);

        succeed(&cb).await.unwrap();
        let stats = cb.statistics();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 1_000);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1_500)).await;

        assert!(matches!(fail(&cb).await, Err(BreakerError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        let stats = cb.statistics();
        assert_eq!(stats.next_attempt_in_ms, Some(1_000));
        assert_eq!(stats.total_trips, 2);
        assert!(matches!(succeed(&cb).await, Err(BreakerError::Open(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_recovers_idle_breaker() {
        let cb = breaker(1, 1_000);
        let _ = fail(&cb).await;

        cb.housekeep();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        cb.housekeep();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_clears_quiet_counters() {
        let cb = breaker(5, 1_000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_millis(4_000)).await;
        cb.housekeep();
        assert_eq!(cb.statistics().failure_count, 2);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        cb.housekeep();
        assert_eq!(cb.statistics().failure_count, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
