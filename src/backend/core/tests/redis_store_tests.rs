//! Tests for the Redis-backed rate limit store.
//!
//! These need a running server and are ignored by default:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_store_tests -- --ignored
//! ```
//!
//! Every test uses its own key prefix, so runs do not interfere.

use menu_guard_core::middleware::{
    DistributedRateLimiter, LimitOutcome, RateLimitPolicy, RateLimitStore, RedisStore,
};
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const WINDOW: Duration = Duration::from_secs(60);

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique_prefix() -> String {
    format!("menu-guard-test:{}:", Uuid::new_v4())
}

async fn store(prefix: &str) -> RedisStore {
    RedisStore::connect(&redis_url(), prefix, Duration::from_secs(5))
        .await
        .expect("redis reachable at REDIS_URL")
}

async fn raw_connection() -> MultiplexedConnection {
    redis::Client::open(redis_url())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

async fn pttl(conn: &mut MultiplexedConnection, key: &str) -> i64 {
    redis::cmd("PTTL").arg(key).query_async(conn).await.unwrap()
}

// ============================================================================
// Script
// ============================================================================

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn test_hits_count_up_within_window() {
    let prefix = unique_prefix();
    let store = store(&prefix).await;

    for expected in 1..=3 {
        let hit = store.hit("client", 5, WINDOW).await.unwrap();
        assert_eq!(hit.count, expected);
        assert!(hit.ttl > Duration::ZERO && hit.ttl <= WINDOW, "ttl {:?}", hit.ttl);
    }
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn test_count_stops_one_past_limit() {
    let prefix = unique_prefix();
    let store = store(&prefix).await;

    let counts: Vec<u64> = {
        let mut counts = Vec::new();
        for _ in 0..5 {
            counts.push(store.hit("client", 2, WINDOW).await.unwrap().count);
        }
        counts
    };
    assert_eq!(counts, vec![1, 2, 3, 3, 3]);

    let mut conn = raw_connection().await;
    let stored: u64 = redis::cmd("GET")
        .arg(format!("{prefix}client"))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(stored, 3);
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn test_window_expires() {
    let prefix = unique_prefix();
    let store = store(&prefix).await;
    let window = Duration::from_millis(300);

    assert_eq!(store.hit("client", 1, window).await.unwrap().count, 1);
    assert_eq!(store.hit("client", 1, window).await.unwrap().count, 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.hit("client", 1, window).await.unwrap().count, 1);
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn test_first_hit_sets_expiry() {
    let prefix = unique_prefix();
    let store = store(&prefix).await;
    let mut conn = raw_connection().await;

    store.hit("client", 5, WINDOW).await.unwrap();
    let ttl = pttl(&mut conn, &format!("{prefix}client")).await;
    assert!(ttl > 0 && ttl <= WINDOW.as_millis() as i64, "pttl {ttl}");
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn test_blocked_key_without_expiry_gets_one() {
    let prefix = unique_prefix();
    let store = store(&prefix).await;
    let mut conn = raw_connection().await;
    let key = format!("{prefix}client");

    // Over the limit and persistent, as after a lost PEXPIRE
    let _: () = redis::cmd("SET").arg(&key).arg(10).query_async(&mut conn).await.unwrap();
    assert_eq!(pttl(&mut conn, &key).await, -1);

    let hit = store.hit("client", 2, WINDOW).await.unwrap();
    assert_eq!(hit.count, 10);
    assert_eq!(hit.ttl, WINDOW);

    let ttl = pttl(&mut conn, &key).await;
    assert!(ttl > 0 && ttl <= WINDOW.as_millis() as i64, "pttl {ttl}");
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn test_ping() {
    let store = store(&unique_prefix()).await;
    store.ping().await.unwrap();
    assert_eq!(store.name(), "redis");
}

#[tokio::test]
#[ignore = "requires REDIS_URL"]
async fn test_unreachable_server_fails_to_connect() {
    let result = RedisStore::connect("redis://127.0.0.1:1", unique_prefix(), Duration::from_secs(1)).await;
    assert!(result.is_err());
}

// ============================================================================
// Limiter
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires REDIS_URL"]
async fn test_instances_share_one_limit_under_concurrency() {
    const MAX: u64 = 20;
    let prefix = unique_prefix();
    let p = Arc::new(RateLimitPolicy::new(MAX, WINDOW, "api"));

    // Two limiters with separate connections stand in for two instances
    let a = Arc::new(DistributedRateLimiter::new(Arc::new(store(&prefix).await)));
    let b = Arc::new(DistributedRateLimiter::new(Arc::new(store(&prefix).await)));

    let tasks: Vec<_> = (0..MAX + 1)
        .map(|i| {
            let limiter = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
            let p = Arc::clone(&p);
            tokio::spawn(async move { limiter.check(&p, "shared").await.outcome })
        })
        .collect();

    let (mut allowed, mut rejected) = (0, 0);
    for task in tasks {
        match task.await.unwrap() {
            LimitOutcome::Allowed => allowed += 1,
            LimitOutcome::Rejected => rejected += 1,
            LimitOutcome::DegradedAllowed => panic!("redis reported unavailable"),
        }
    }

    assert_eq!((allowed, rejected), (MAX, 1));
}
