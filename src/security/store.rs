//! Counter stores backing the rate limiter.
//!
//! # Responsibilities
//! - Count consumed points per key inside a fixed window
//! - Apply the block penalty once a budget is exhausted
//! - Report how long until the client may send again
//!
//! # Design Decisions
//! - One trait, interchangeable backends selected at startup
//! - `MemoryStore` is per-process; `RedisStore` is shared across instances
//! - Keys are opaque here; the limiter builds them from tier and client

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::security::tiers::TierPolicy;

/// Result of a single consumption (or peek) against a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    /// Points consumed in the current window, including the one just taken.
    pub consumed_points: u32,
    /// Milliseconds until the window (or block) ends.
    pub ms_before_reset: u64,
    /// Whether this consumption fit within the budget.
    pub allowed: bool,
}

impl Consumption {
    pub fn remaining(&self, policy: &TierPolicy) -> u32 {
        policy.points.saturating_sub(self.consumed_points)
    }
}

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
}

/// Storage strategy for rate limit counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Short backend name for logs and the admin API.
    fn name(&self) -> &'static str;

    /// Take one point from `key`'s budget.
    async fn consume(&self, key: &str, policy: &TierPolicy) -> Result<Consumption, StoreError>;

    /// Current state of `key` without consuming. `None` if no live record exists.
    async fn peek(&self, key: &str, policy: &TierPolicy)
        -> Result<Option<Consumption>, StoreError>;

    /// Forget everything recorded for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

/// Milliseconds in `d`, rounded up so a pending reset never reports 0.
pub(crate) fn ceil_millis(d: Duration) -> u64 {
    let ms = d.as_millis() as u64;
    if d.subsec_nanos() % 1_000_000 != 0 {
        ms + 1
    } else {
        ms
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowRecord {
    window_start: Instant,
    consumed: u32,
    blocked_until: Option<Instant>,
}

impl WindowRecord {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            consumed: 0,
            blocked_until: None,
        }
    }

    fn window_end(&self, policy: &TierPolicy) -> Instant {
        self.window_start + Duration::from_millis(policy.window_ms())
    }

    /// When this record stops mattering.
    fn expires_at(&self, policy: &TierPolicy) -> Instant {
        let window_end = self.window_end(policy);
        match self.blocked_until {
            Some(until) if until > window_end => until,
            _ => window_end,
        }
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    fn snapshot(&self, now: Instant, policy: &TierPolicy) -> Option<Consumption> {
        if self.blocked_until.is_some() && !self.is_blocked(now) {
            // The next consumption opens a fresh window.
            return None;
        }
        let reset_at = self.expires_at(policy);
        Some(Consumption {
            consumed_points: self.consumed,
            ms_before_reset: ceil_millis(reset_at.saturating_duration_since(now)),
            allowed: self.consumed <= policy.points && !self.is_blocked(now),
        })
    }
}

/// In-process fixed-window counters. Valid for a single instance only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, (WindowRecord, TierPolicy)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records (expired ones may linger until purged).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop records whose window and block have both elapsed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, (record, policy)| record.expires_at(policy) > now);
        before.saturating_sub(self.records.len())
    }

    /// Synchronous consumption; the store never fails.
    pub fn take(&self, key: &str, policy: &TierPolicy) -> Consumption {
        self.consume_at(key, policy, Instant::now())
    }

    /// Synchronous peek.
    pub fn snapshot(&self, key: &str, policy: &TierPolicy) -> Option<Consumption> {
        let now = Instant::now();
        self.records.get(key).and_then(|entry| {
            let (record, _) = entry.value();
            if record.expires_at(policy) > now {
                record.snapshot(now, policy)
            } else {
                None
            }
        })
    }

    pub fn forget(&self, key: &str) {
        self.records.remove(key);
    }

    fn consume_at(&self, key: &str, policy: &TierPolicy, now: Instant) -> Consumption {
        let mut entry = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| (WindowRecord::new(now), *policy));
        let (record, stored_policy) = entry.value_mut();
        *stored_policy = *policy;

        if let Some(until) = record.blocked_until {
            if now < until {
                record.consumed = record.consumed.saturating_add(1);
                return Consumption {
                    consumed_points: record.consumed,
                    ms_before_reset: ceil_millis(until - now).max(1),
                    allowed: false,
                };
            }
            *record = WindowRecord::new(now);
        } else if now >= record.window_end(policy) {
            *record = WindowRecord::new(now);
        }

        record.consumed = record.consumed.saturating_add(1);
        let window_left = record.window_end(policy).saturating_duration_since(now);

        if record.consumed <= policy.points {
            return Consumption {
                consumed_points: record.consumed,
                ms_before_reset: ceil_millis(window_left),
                allowed: true,
            };
        }

        let wait = if policy.block_secs > 0 {
            let block = Duration::from_millis(policy.block_ms());
            record.blocked_until = Some(now + block);
            block
        } else {
            window_left
        };
        Consumption {
            consumed_points: record.consumed,
            ms_before_reset: ceil_millis(wait).max(1),
            allowed: false,
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn consume(&self, key: &str, policy: &TierPolicy) -> Result<Consumption, StoreError> {
        Ok(self.take(key, policy))
    }

    async fn peek(
        &self,
        key: &str,
        policy: &TierPolicy,
    ) -> Result<Option<Consumption>, StoreError> {
        Ok(self.snapshot(key, policy))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.forget(key);
        Ok(())
    }
}
