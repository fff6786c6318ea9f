//! Cross-instance limiter backed by a shared store.
//!
//! The check-and-increment is one atomic store call. When the store errors the
//! limiter fails open: the request is allowed as [`LimitOutcome::DegradedAllowed`],
//! a warning is logged, and further checks skip the store until a background
//! health check sees it answer again. Every store call is bounded by a command
//! timeout, so a hung store degrades the same way as one that errors.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::field::display;
use tracing::{debug, info, warn};

use super::{LimitOutcome, RateLimitDecision, RateLimitPolicy};
use crate::error::{ErrorCode, GuardError};

// ═══════════════════════════════════════════════════════════════════════════════
// Store Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one atomic hit against the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHit {
    /// Window count after this hit. Stops growing once past the limit.
    pub count: u64,

    /// Time left in the key's window
    pub ttl: Duration,
}

/// Shared store failures. Never surfaced to callers of the limiter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl StoreError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Redis(e) if e.is_timeout() => "timeout",
            Self::Redis(e) if e.is_io_error() || e.is_connection_dropped() => "connection",
            Self::Redis(_) => "redis",
            Self::Protocol(_) => "protocol",
        }
    }
}

impl From<StoreError> for GuardError {
    fn from(err: StoreError) -> Self {
        GuardError::with_internal(
            ErrorCode::DependencyUnavailable,
            "Service temporarily unavailable",
            err.to_string(),
        )
        .with_source(err)
    }
}

/// Run one store call, failing with [`StoreError::Timeout`] once `limit` elapses.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

/// Atomic counter-with-expiry store shared by every instance.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one hit for `key` in a window of `window`, opening the window on
    /// the first hit. Once the count is past `max_requests` it is not incremented.
    async fn hit(&self, key: &str, max_requests: u64, window: Duration) -> Result<StoreHit, StoreError>;

    /// Liveness check used while the store is marked unhealthy.
    async fn ping(&self) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Store
// ═══════════════════════════════════════════════════════════════════════════════

const HIT_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])

local current = tonumber(redis.call('GET', key) or '0')
if current > limit then
    local ttl = redis.call('PTTL', key)
    if ttl < 0 then
        redis.call('PEXPIRE', key, window_ms)
        ttl = window_ms
    end
    return {current, ttl}
end

current = redis.call('INCR', key)
if current == 1 then
    redis.call('PEXPIRE', key, window_ms)
end

local ttl = redis.call('PTTL', key)
if ttl < 0 then
    redis.call('PEXPIRE', key, window_ms)
    ttl = window_ms
end

return {current, ttl}
"#;

/// Redis-backed store. One Lua script per hit keeps read, increment and expiry atomic.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    script: Arc<redis::Script>,
    key_prefix: String,
}

impl RedisStore {
    /// Connect and verify the server answers, giving up after `connect_timeout`.
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = bounded(connect_timeout, async {
            ConnectionManager::new(client).await.map_err(StoreError::from)
        })
        .await?;
        let store = Self {
            conn,
            script: Arc::new(redis::Script::new(HIT_SCRIPT)),
            key_prefix: key_prefix.into(),
        };
        bounded(connect_timeout, store.ping()).await?;
        info!(key_prefix = %store.key_prefix, "Rate limiter connected to Redis");
        Ok(store)
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn hit(&self, key: &str, max_requests: u64, window: Duration) -> Result<StoreHit, StoreError> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis().max(1) as u64;

        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(format!("{}{}", self.key_prefix, key))
            .arg(max_requests)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        if count < 1 {
            return Err(StoreError::Protocol(format!("non-positive count {count}")));
        }

        Ok(StoreHit {
            count: count as u64,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("PING answered {reply}")))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process store with the same contract as [`RedisStore`].
///
/// Enforces one limit across every limiter sharing the instance. Expired keys
/// are replaced on their next hit; call [`MemoryStore::purge_expired`] to drop
/// the rest.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, (u64, Instant)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, (_, expires_at)| *expires_at > now);
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn hit(&self, key: &str, max_requests: u64, window: Duration) -> Result<StoreHit, StoreError> {
        let now = Instant::now();

        let (count, expires_at) = match self.windows.entry(key.to_owned()) {
            Entry::Vacant(vacant) => *vacant.insert((1, now + window)),
            Entry::Occupied(mut occupied) => {
                let (count, expires_at) = occupied.get_mut();
                if *expires_at <= now {
                    *count = 1;
                    *expires_at = now + window;
                } else if *count <= max_requests {
                    *count += 1;
                }
                (*count, *expires_at)
            }
        };

        Ok(StoreHit {
            count,
            ttl: expires_at.saturating_duration_since(now),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Distributed limiter with fail-open degradation.
pub struct DistributedRateLimiter {
    store: Arc<dyn RateLimitStore>,
    healthy: Arc<RwLock<bool>>,
    recheck: Arc<Semaphore>,
    recheck_interval: Duration,
    command_timeout: Duration,
}

impl DistributedRateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            healthy: Arc::new(RwLock::new(true)),
            recheck: Arc::new(Semaphore::new(1)),
            recheck_interval: Duration::from_secs(5),
            command_timeout: Duration::from_millis(250),
        }
    }

    /// Delay between health checks after a store failure.
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    /// Upper bound on a single store call.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn is_healthy(&self) -> bool {
        *self.healthy.read()
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Count one request for `key` under `policy`. Never errors.
    pub async fn check(&self, policy: &RateLimitPolicy, key: &str) -> RateLimitDecision {
        if !self.is_healthy() {
            return self.degraded(policy, "unhealthy", None);
        }

        let hit = bounded(
            self.command_timeout,
            self.store.hit(key, policy.max_requests, policy.window),
        )
        .await;

        match hit {
            Ok(hit) => {
                let decision = RateLimitDecision::from_count(hit.count, policy.max_requests, hit.ttl);
                counter!(
                    "rate_limit_checks_total",
                    "tier" => "distributed",
                    "outcome" => decision.outcome.as_str()
                )
                .increment(1);
                decision
            }
            Err(e) => {
                self.mark_unhealthy();
                self.degraded(policy, e.reason(), Some(&e))
            }
        }
    }

    fn degraded(
        &self,
        policy: &RateLimitPolicy,
        reason: &'static str,
        error: Option<&StoreError>,
    ) -> RateLimitDecision {
        counter!("rate_limit_degraded_total", "reason" => reason).increment(1);
        counter!(
            "rate_limit_checks_total",
            "tier" => "distributed",
            "outcome" => LimitOutcome::DegradedAllowed.as_str()
        )
        .increment(1);
        warn!(
            store = self.store.name(),
            reason,
            error = error.map(display),
            key_prefix = %policy.key_prefix,
            "Distributed rate limit skipped; allowing request (fail-open)"
        );
        RateLimitDecision::degraded(policy.max_requests)
    }

    /// Mark the store unhealthy and start a health check task if none is running.
    fn mark_unhealthy(&self) {
        *self.healthy.write() = false;

        let Ok(permit) = Arc::clone(&self.recheck).try_acquire_owned() else {
            return;
        };

        let store = Arc::clone(&self.store);
        let healthy = Arc::clone(&self.healthy);
        let interval = self.recheck_interval;
        let command_timeout = self.command_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            loop {
                tokio::time::sleep(interval).await;
                match bounded(command_timeout, store.ping()).await {
                    Ok(()) => {
                        *healthy.write() = true;
                        info!(store = store.name(), "Rate limit store recovered");
                        break;
                    }
                    Err(e) => debug!(store = store.name(), error = %e, "Rate limit store still unavailable"),
                }
            }
        });
    }
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("store", &self.store.name())
            .field("healthy", &self.is_healthy())
            .field("recheck_interval", &self.recheck_interval)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}
