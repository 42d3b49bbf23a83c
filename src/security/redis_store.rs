//! Shared counter store on Redis.
//!
//! Consumption runs as a single Lua script so increment, expiry and the
//! budget comparison are atomic per key across every gateway instance.
//!
//! # Design Decisions
//! - `ConnectionManager` owns reconnection; connect and response are bounded
//! - Only one caller connects at a time; the others fail immediately and
//!   the limiter serves them from in-process counters

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use tokio::time;

use crate::security::store::{Consumption, RateLimitStore, StoreError};
use crate::security::tiers::TierPolicy;

/// KEYS[1] = counter, KEYS[2] = block marker.
/// ARGV[1] = window ms, ARGV[2] = points, ARGV[3] = block ms.
/// Returns {consumed, ms_before_reset, blocked}.
///
/// Setting a block drops the counter, so a fresh window starts once the
/// block expires.
const CONSUME_SCRIPT: &str = r#"
local block_ttl = redis.call('PTTL', KEYS[2])
if block_ttl > 0 then
  return {tonumber(ARGV[2]) + 1, block_ttl, 1}
end
local consumed = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
if consumed > tonumber(ARGV[2]) and tonumber(ARGV[3]) > 0 then
  redis.call('SET', KEYS[2], '1', 'PX', ARGV[3])
  redis.call('DEL', KEYS[1])
  return {consumed, tonumber(ARGV[3]), 1}
end
return {consumed, ttl, 0}
"#;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(250);

pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    connect_timeout: Duration,
    response_timeout: Duration,
    script: redis::Script,
    manager: Mutex<Option<ConnectionManager>>,
    connecting: tokio::sync::Mutex<()>,
}

impl RedisStore {
    /// Create a store. The connection is established lazily on first use.
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            script: redis::Script::new(CONSUME_SCRIPT),
            manager: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn block_key(&self, key: &str) -> String {
        format!("{}:{}:block", self.prefix, key)
    }

    fn cached(&self) -> Option<ConnectionManager> {
        self.manager.lock().ok().and_then(|guard| guard.clone())
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_connection_timeout(self.connect_timeout)
            .set_response_timeout(self.response_timeout)
            .set_number_of_retries(1)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(conn) = self.cached() {
            return Ok(conn);
        }

        let Ok(_connecting) = self.connecting.try_lock() else {
            return Err(StoreError::Unavailable(
                "connection attempt already in progress".to_string(),
            ));
        };
        if let Some(conn) = self.cached() {
            return Ok(conn);
        }

        let conn = time::timeout(
            self.connect_timeout,
            self.client
                .get_connection_manager_with_config(self.manager_config()),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.connect_timeout))??;

        tracing::info!(prefix = %self.prefix, "Connected to shared rate limit store");
        if let Ok(mut cached) = self.manager.lock() {
            *cached = Some(conn.clone());
        }
        Ok(conn)
    }
}

fn clamp_ms(ms: i64) -> u64 {
    ms.max(1) as u64
}

#[async_trait]
impl RateLimitStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn consume(&self, key: &str, policy: &TierPolicy) -> Result<Consumption, StoreError> {
        let counter = self.counter_key(key);
        let block = self.block_key(key);
        let mut conn = self.connection().await?;
        let mut invocation = self.script.key(&counter);
        invocation
            .key(&block)
            .arg(policy.window_ms())
            .arg(policy.points)
            .arg(policy.block_ms());
        let (consumed, ttl, blocked): (i64, i64, i64) = invocation.invoke_async(&mut conn).await?;

        let consumed = u32::try_from(consumed.max(0)).unwrap_or(u32::MAX);
        Ok(Consumption {
            consumed_points: consumed,
            ms_before_reset: clamp_ms(ttl),
            allowed: blocked == 0 && consumed <= policy.points,
        })
    }

    async fn peek(
        &self,
        key: &str,
        policy: &TierPolicy,
    ) -> Result<Option<Consumption>, StoreError> {
        let counter = self.counter_key(key);
        let block = self.block_key(key);
        let mut conn = self.connection().await?;
        let (consumed, ttl, block_ttl): (Option<i64>, i64, i64) = redis::pipe()
            .get(&counter)
            .pttl(&counter)
            .pttl(&block)
            .query_async(&mut conn)
            .await?;

        if block_ttl > 0 {
            return Ok(Some(Consumption {
                consumed_points: policy.points.saturating_add(1),
                ms_before_reset: clamp_ms(block_ttl),
                allowed: false,
            }));
        }
        Ok(consumed.map(|consumed| {
            let consumed = u32::try_from(consumed.max(0)).unwrap_or(u32::MAX);
            Consumption {
                consumed_points: consumed,
                ms_before_reset: clamp_ms(ttl),
                allowed: consumed <= policy.points,
            }
        }))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let keys = [self.counter_key(key), self.block_key(key)];
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(&keys).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_malformed_url() {
        assert!(RedisStore::new("not-a-redis-url", "gw").is_err());
    }

    #[test]
    fn test_key_layout() {
        let store = RedisStore::new("redis://127.0.0.1:6379/", "gateway:rl").unwrap();
        assert_eq!(store.counter_key("auth:10.0.0.1"), "gateway:rl:auth:10.0.0.1");
        assert_eq!(
            store.block_key("auth:10.0.0.1"),
            "gateway:rl:auth:10.0.0.1:block"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        // Port 1 is never a redis server; connection is refused or times out.
        let store = RedisStore::new("redis://127.0.0.1:1/", "gw")
            .unwrap()
            .with_connect_timeout(Duration::from_millis(200));
        let result = store.consume("k", &TierPolicy::new(1, 60, 0)).await;
        assert!(result.is_err());
    }

    /// Accepts connections and never answers.
    async fn silent_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("redis://{}/", addr)
    }

    #[tokio::test]
    async fn test_silent_server_fails_within_connect_timeout() {
        let store = RedisStore::new(&silent_server().await, "gw")
            .unwrap()
            .with_connect_timeout(Duration::from_millis(200))
            .with_response_timeout(Duration::from_millis(200));

        let start = std::time::Instant::now();
        let result = store.consume("k", &TierPolicy::new(1, 60, 0)).await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_callers_do_not_queue_behind_connect() {
        let store = RedisStore::new(&silent_server().await, "gw")
            .unwrap()
            .with_connect_timeout(Duration::from_millis(300));
        let policy = TierPolicy::new(1, 60, 0);

        let start = std::time::Instant::now();
        let results = futures_util::future::join_all(
            (0..5).map(|i| {
                let store = &store;
                let policy = &policy;
                async move {
                    let key = format!("c{}", i);
                    let result = store.consume(&key, policy).await;
                    (result, start.elapsed())
                }
            }),
        )
        .await;

        for (result, elapsed) in results {
            assert!(result.is_err());
            assert!(elapsed < Duration::from_secs(1), "caller waited {:?}", elapsed);
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_script_starts_fresh_window_after_short_block() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let prefix = format!("gw-test:{}", uuid::Uuid::new_v4());
        let redis = RedisStore::new(&url, prefix).unwrap();
        let memory = crate::security::store::MemoryStore::new();
        let policy = TierPolicy::new(2, 60, 1);

        for store in [&redis as &dyn RateLimitStore, &memory] {
            assert!(store.consume("k", &policy).await.unwrap().allowed);
            assert!(store.consume("k", &policy).await.unwrap().allowed);

            let denied = store.consume("k", &policy).await.unwrap();
            assert!(!denied.allowed, "{} should deny", store.name());
            assert!(denied.ms_before_reset <= 1_000);
            assert!(!store.consume("k", &policy).await.unwrap().allowed);
        }

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        for store in [&redis as &dyn RateLimitStore, &memory] {
            let c = store.consume("k", &policy).await.unwrap();
            assert!(c.allowed, "{} should allow after the block", store.name());
            assert_eq!(c.consumed_points, 1);
            assert!(store.peek("k", &policy).await.unwrap().unwrap().allowed);
        }

        redis.reset("k").await.unwrap();
        assert!(redis.peek("k", &policy).await.unwrap().is_none());
    }
}
