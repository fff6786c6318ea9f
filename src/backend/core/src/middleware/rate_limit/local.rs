//! In-process fixed-window limiter with a background eviction sweep.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{LimitOutcome, RateLimitDecision, RateLimitPolicy};

// ═══════════════════════════════════════════════════════════════════════════════
// Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// Window state for one (policy, client) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Requests observed in the current window
    pub count: u64,

    /// When the current window closes
    pub window_reset_at: Instant,

    /// Set once `count` passed the limit; sticky until the window closes
    pub blocked: bool,
}

impl RateLimitEntry {
    /// Fresh window that already counts the current request.
    fn start(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            window_reset_at: now + window,
            blocked: false,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.window_reset_at
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Local rate limiter.
///
/// Each instance owns its map and its sweeper task. The sweeper starts in
/// [`LocalRateLimiter::new`] and stops on [`LocalRateLimiter::shutdown`] or drop.
///
/// Read-modify-write on a key goes through the `DashMap` entry API, which holds
/// the key's shard lock for the whole update, so concurrent checks on the same
/// key never lose an increment.
pub struct LocalRateLimiter {
    entries: Arc<DashMap<String, RateLimitEntry>>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalRateLimiter {
    /// Create a limiter and start its sweep task. Must be called inside a Tokio runtime.
    pub fn new(sweep_interval: Duration) -> Self {
        let limiter = Self::without_sweeper();
        let handle = tokio::spawn(sweep_loop(
            Arc::clone(&limiter.entries),
            sweep_interval,
            limiter.shutdown.clone(),
        ));
        *limiter.sweeper.lock() = Some(handle);
        limiter
    }

    /// Create a limiter with no background sweep. Callers drive [`Self::sweep_expired`].
    pub fn without_sweeper() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Count one request for `key` under `policy`.
    ///
    /// Never fails. A blocked key is rejected without incrementing until its
    /// window closes, then the entry is replaced with a fresh window.
    pub fn check(&self, policy: &RateLimitPolicy, key: &str) -> RateLimitDecision {
        let now = Instant::now();

        let entry = match self.entries.entry(key.to_owned()) {
            Entry::Vacant(vacant) => *vacant.insert(RateLimitEntry::start(now, policy.window)),
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.is_expired(now) {
                    *current = RateLimitEntry::start(now, policy.window);
                } else if !current.blocked {
                    current.count = current.count.saturating_add(1);
                    if current.count > policy.max_requests {
                        current.blocked = true;
                    }
                }
                *current
            }
        };

        let reset_in = entry.window_reset_at.saturating_duration_since(now);
        let mut decision = RateLimitDecision::from_count(entry.count, policy.max_requests, reset_in);
        if entry.blocked {
            decision.outcome = LimitOutcome::Rejected;
            decision.remaining = 0;
            decision.retry_after_secs = Some(super::retry_after_secs(reset_in));
        }

        counter!(
            "rate_limit_checks_total",
            "tier" => "local",
            "outcome" => decision.outcome.as_str()
        )
        .increment(1);

        trace!(key = %key, count = entry.count, blocked = entry.blocked, "Local rate limit check");

        decision
    }

    /// Remove every entry whose window has closed. Returns the number evicted.
    ///
    /// Safe to run alongside `check`: `retain` takes each shard's write lock, and
    /// an entry is only dropped if its window is already over at sweep time.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.entries)
    }

    /// Snapshot of the entry for `key`.
    pub fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|e| *e)
    }

    /// Live entries, including expired ones the sweep has not reached yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("Local rate limiter sweeper stopped");
    }
}

impl Drop for LocalRateLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for LocalRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRateLimiter")
            .field("entries", &self.entries.len())
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

fn sweep(entries: &DashMap<String, RateLimitEntry>) -> usize {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before.saturating_sub(entries.len())
}

async fn sweep_loop(
    entries: Arc<DashMap<String, RateLimitEntry>>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = sweep(&entries);
                gauge!("rate_limit_local_entries").set(entries.len() as f64);
                debug!(evicted, remaining = entries.len(), "Rate limit sweep completed");
            }
        }
    }
}
