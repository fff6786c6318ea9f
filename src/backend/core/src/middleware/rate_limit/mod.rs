//! Rate limiting for the request defense pipeline.
//!
//! Two tiers share one decision shape:
//! - [`LocalRateLimiter`]: in-process, sharded map with a background eviction sweep
//! - [`DistributedRateLimiter`]: shared store (Redis) so every instance enforces one limit
//!
//! Both implement a fixed window with blocking: the window opens on the first
//! request for a key, every request inside it is counted, and once the count
//! passes `max_requests` the key stays rejected until the window closes. This
//! is not a continuously sliding window.
//!
//! # Example
//!
//! ```rust,ignore
//! use menu_guard_core::middleware::rate_limit::{LocalRateLimiter, PolicyTable, TrafficClass};
//!
//! let limiter = LocalRateLimiter::new(Duration::from_secs(60));
//! let policies = PolicyTable::default();
//! let decision = limiter.check(policies.get(TrafficClass::Auth), "auth:203.0.113.7:Mozilla/5.0");
//! assert!(decision.allowed());
//! ```

pub mod distributed;
pub mod local;

pub use distributed::{
    DistributedRateLimiter, MemoryStore, RateLimitStore, RedisStore, StoreError, StoreHit,
};
pub use local::{LocalRateLimiter, RateLimitEntry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Policies
// ═══════════════════════════════════════════════════════════════════════════════

/// Traffic classes, one rate limit policy each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    /// Login, signup, password reset
    Auth,
    /// Image and file uploads
    Upload,
    /// General dashboard API
    Api,
    /// Public, unauthenticated menu reads
    PublicMenu,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 4] = [Self::Auth, Self::Upload, Self::Api, Self::PublicMenu];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Upload => "upload",
            Self::Api => "api",
            Self::PublicMenu => "public_menu",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable limit for one traffic class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests allowed per window
    pub max_requests: u64,

    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Namespace for keys of this policy, in memory and in the shared store
    pub key_prefix: String,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u64, window: Duration, key_prefix: impl Into<String>) -> Self {
        Self {
            max_requests,
            window,
            key_prefix: key_prefix.into(),
        }
    }
}

/// Policy per traffic class. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    pub auth: RateLimitPolicy,
    pub upload: RateLimitPolicy,
    pub api: RateLimitPolicy,
    pub public_menu: RateLimitPolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            auth: RateLimitPolicy::new(5, Duration::from_secs(15 * 60), "auth"),
            upload: RateLimitPolicy::new(10, Duration::from_secs(60), "upload"),
            api: RateLimitPolicy::new(100, Duration::from_secs(60), "api"),
            public_menu: RateLimitPolicy::new(60, Duration::from_secs(60), "menu"),
        }
    }
}

impl PolicyTable {
    pub fn get(&self, class: TrafficClass) -> &RateLimitPolicy {
        match class {
            TrafficClass::Auth => &self.auth,
            TrafficClass::Upload => &self.upload,
            TrafficClass::Api => &self.api,
            TrafficClass::PublicMenu => &self.public_menu,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decisions
// ═══════════════════════════════════════════════════════════════════════════════

/// Which limiter produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitTier {
    Local,
    Distributed,
}

impl RateLimitTier {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Distributed => "distributed",
        }
    }
}

/// Outcome of one limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOutcome {
    /// Checked and under the limit
    Allowed,
    /// Could not check (store unavailable); allowed by the fail-open policy
    DegradedAllowed,
    /// Checked and over the limit
    Rejected,
}

impl LimitOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::DegradedAllowed => "degraded_allowed",
            Self::Rejected => "rejected",
        }
    }
}

/// Rate limit check result.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub outcome: LimitOutcome,

    /// Requests allowed per window
    pub limit: u64,

    /// Requests left in the current window
    pub remaining: u64,

    /// When the current window closes
    pub reset_at: DateTime<Utc>,

    /// Set on rejection
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// Build a decision from a window count and the time left in the window.
    pub(crate) fn from_count(count: u64, limit: u64, reset_in: Duration) -> Self {
        let allowed = count <= limit;
        Self {
            outcome: if allowed {
                LimitOutcome::Allowed
            } else {
                LimitOutcome::Rejected
            },
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: reset_at_from_now(reset_in),
            retry_after_secs: (!allowed).then(|| retry_after_secs(reset_in)),
        }
    }

    pub(crate) fn degraded(limit: u64) -> Self {
        Self {
            outcome: LimitOutcome::DegradedAllowed,
            limit,
            remaining: limit,
            reset_at: Utc::now(),
            retry_after_secs: None,
        }
    }

    pub fn allowed(&self) -> bool {
        !matches!(self.outcome, LimitOutcome::Rejected)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, LimitOutcome::DegradedAllowed)
    }
}

/// Seconds a client should wait: the remaining window rounded up, at least 1.
pub fn retry_after_secs(reset_in: Duration) -> u64 {
    let secs = reset_in.as_secs() + u64::from(reset_in.subsec_nanos() > 0);
    secs.max(1)
}

fn reset_at_from_now(reset_in: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(reset_in)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or_else(Utc::now)
}
