//! Behavioural tests for the cache and rate limiter through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use toolguard::cache::HeuristicMonitor;
use toolguard::clock::ManualClock;
use toolguard::{
    BackendConfig, CacheConfig, CacheManager, CacheManagerBuilder, EvictionStrategy,
    RateLimitConfig, RateLimitError, RateLimitKey, RateLimiter, RateLimiterBuilder,
    UnavailablePolicy, WrapOptions,
};

const T0: u64 = 1_700_000_000_000;

// == Helpers ==

fn cache<V: Clone + Send + 'static>(
    max_size: usize,
    strategy: EvictionStrategy,
    default_ttl: Option<Duration>,
    clock: Arc<ManualClock>,
) -> CacheManager<V> {
    CacheManagerBuilder::new(CacheConfig {
        max_size,
        eviction_strategy: strategy,
        default_ttl,
        enable_background_cleanup: false,
        ..CacheConfig::default()
    })
    .clock(clock)
    .memory_monitor(Arc::new(HeuristicMonitor))
    .build()
    .unwrap()
}

fn sorted_keys<V: Clone + Send + 'static>(cache: &CacheManager<V>) -> Vec<String> {
    let mut keys = cache.keys(None);
    keys.sort();
    keys
}

fn limiter(config: RateLimitConfig, clock: Arc<ManualClock>) -> RateLimiter {
    RateLimiterBuilder::new(config).clock(clock).build().unwrap()
}

// == Cache ==

#[test]
fn test_value_available_until_ttl_elapses() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache = cache(10, EvictionStrategy::Lru, None, clock.clone());

    assert!(cache.set("quote:AAPL", "189.3".to_string(), Some(Duration::from_secs(30))));
    clock.advance(Duration::from_millis(29_999));
    assert_eq!(cache.get("quote:AAPL").as_deref(), Some("189.3"));

    clock.advance(Duration::from_millis(1));
    assert_eq!(cache.get("quote:AAPL"), None);
    assert_eq!(cache.get_stats().expirations, 1);
}

#[test]
fn test_default_ttl_applies_when_omitted() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache = cache(10, EvictionStrategy::Lru, Some(Duration::from_secs(5)), clock.clone());

    cache.set("news", 1u32, None);
    clock.advance(Duration::from_secs(5));
    assert_eq!(cache.get("news"), None);
}

#[test]
fn test_size_never_exceeds_max() {
    let clock = Arc::new(ManualClock::new(T0));
    for strategy in [EvictionStrategy::Lru, EvictionStrategy::Lfu, EvictionStrategy::Fifo] {
        let cache = cache(5, strategy, None, clock.clone());
        for i in 0..50 {
            cache.set(format!("key{i}"), i, None);
            assert!(cache.len() <= 5, "{strategy} exceeded capacity");
        }
        assert_eq!(cache.get_stats().evictions, 45);
    }
}

#[test]
fn test_lru_evicts_least_recently_used() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache = cache(2, EvictionStrategy::Lru, None, clock);

    cache.set("a", 1, None);
    cache.set("b", 2, None);
    cache.get("a");
    cache.set("c", 3, None);

    assert_eq!(sorted_keys(&cache), vec!["a", "c"]);
}

#[test]
fn test_lfu_evicts_least_frequently_used() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache = cache(2, EvictionStrategy::Lfu, None, clock);

    cache.set("a", 1, None);
    cache.set("b", 2, None);
    for _ in 0..3 {
        cache.get("a");
    }
    cache.set("c", 3, None);

    assert_eq!(sorted_keys(&cache), vec!["a", "c"]);
}

#[test]
fn test_fifo_evicts_in_insertion_order() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache = cache(3, EvictionStrategy::Fifo, None, clock);

    for key in ["a", "b", "c"] {
        cache.set(key, 0, None);
    }
    for _ in 0..5 {
        cache.get("a");
    }

    cache.set("d", 0, None);
    assert_eq!(sorted_keys(&cache), vec!["b", "c", "d"]);
    cache.set("e", 0, None);
    assert_eq!(sorted_keys(&cache), vec!["c", "d", "e"]);
}

#[test]
fn test_end_to_end_lru_sequence() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache = cache(3, EvictionStrategy::Lru, None, clock);

    cache.set("1", "a", None);
    cache.set("2", "b", None);
    cache.set("3", "c", None);
    assert_eq!(cache.get("1"), Some("a"));
    cache.set("4", "d", None);

    assert_eq!(sorted_keys(&cache), vec!["1", "3", "4"]);
}

#[test]
fn test_stats_are_idempotent() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache = cache(10, EvictionStrategy::Lru, None, clock);
    cache.set("k", 1, None);
    cache.get("k");
    cache.get("missing");

    let first = cache.get_stats();
    let second = cache.get_stats();
    assert_eq!(first, second);
    assert_eq!(first.hits, 1);
    assert_eq!(first.misses, 1);
}

#[test]
fn test_concurrent_disjoint_writers() {
    const THREADS: usize = 8;
    const KEYS_PER_THREAD: usize = 50;

    let clock = Arc::new(ManualClock::new(T0));
    let cache = Arc::new(cache(THREADS * KEYS_PER_THREAD, EvictionStrategy::Lru, None, clock));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..KEYS_PER_THREAD {
                    let key = format!("t{t}:k{i}");
                    cache.set(key.clone(), t * 1000 + i, None);
                    assert_eq!(cache.get(&key), Some(t * 1000 + i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len(), THREADS * KEYS_PER_THREAD);
    for t in 0..THREADS {
        for i in 0..KEYS_PER_THREAD {
            assert_eq!(cache.get(&format!("t{t}:k{i}")), Some(t * 1000 + i));
        }
    }
    assert_eq!(cache.get_stats().evictions, 0);
}

#[test]
fn test_concurrent_writers_respect_capacity() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache = Arc::new(cache(16, EvictionStrategy::Lfu, None, clock));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..200 {
                    cache.set(format!("t{t}:k{i}"), i, None);
                    assert!(cache.len() <= 16);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len(), 16);
}

#[tokio::test]
async fn test_memoized_operation_runs_once_per_args() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache: Arc<CacheManager<Value>> =
        Arc::new(cache(100, EvictionStrategy::Lru, None, clock.clone()));
    let calls = AtomicUsize::new(0);

    let ratios = cache.wrap(
        "get_ratios",
        |symbol: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(json!({ "symbol": symbol, "pe": 31.2 })) }
        },
        WrapOptions::new().ttl(Duration::from_secs(60)),
    );

    let first = assert_ok!(ratios.call("MSFT".to_string()).await);
    let second = assert_ok!(ratios.call("MSFT".to_string()).await);
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_ok!(ratios.call("NVDA".to_string()).await);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    clock.advance(Duration::from_secs(60));
    assert_ok!(ratios.call("MSFT".to_string()).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let clock = Arc::new(ManualClock::new(T0));
    let cache = cache(10, EvictionStrategy::Lru, None, clock);
    cache.set("k", 1, None);

    cache.shutdown().await;
    cache.shutdown().await;
    assert!(cache.is_empty());
}

// == Rate Limiter ==

#[tokio::test]
async fn test_token_bucket_retry_after() {
    let clock = Arc::new(ManualClock::new(T0));
    let limiter = limiter(RateLimitConfig::token_bucket(1.0, 1), clock.clone());
    let key = RateLimitKey::for_user("agent-7");

    assert_ok!(limiter.check(&key).await);
    let denied = assert_err!(limiter.check(&key).await);
    let retry_after = denied.retry_after().unwrap();
    assert!((retry_after.as_secs_f64() - 1.0).abs() < 1e-3);

    clock.advance(retry_after);
    assert_ok!(limiter.check(&key).await);
}

#[tokio::test]
async fn test_sliding_window_recovers_after_window() {
    let clock = Arc::new(ManualClock::new(T0));
    let limiter = limiter(
        RateLimitConfig::sliding_window(2.0, Duration::from_secs(1)),
        clock.clone(),
    );
    let key = RateLimitKey::for_address("10.1.2.3");

    assert_ok!(limiter.check(&key).await);
    clock.advance(Duration::from_millis(100));
    assert_ok!(limiter.check(&key).await);
    assert!(matches!(
        limiter.check(&key).await,
        Err(RateLimitError::Exceeded { .. })
    ));

    clock.advance(Duration::from_secs(1));
    assert_ok!(limiter.check(&key).await);
}

#[tokio::test]
async fn test_fixed_window_resets_on_boundary() {
    let clock = Arc::new(ManualClock::new(T0));
    let limiter = limiter(
        RateLimitConfig::fixed_window(3.0, Duration::from_secs(1)),
        clock.clone(),
    );
    let key = RateLimitKey::for_method("get_news", Some("agent-1"));

    for _ in 0..3 {
        assert_ok!(limiter.check(&key).await);
    }
    let (allowed, info) = limiter.is_allowed(&key).await;
    assert!(!allowed);
    assert_eq!(info.remaining, 0);

    clock.advance(Duration::from_secs(1));
    let (allowed, info) = limiter.is_allowed(&key).await;
    assert!(allowed);
    assert_eq!(info.remaining, 2);
}

#[tokio::test]
async fn test_reset_key_clears_allowance() {
    let clock = Arc::new(ManualClock::new(T0));
    let limiter = limiter(RateLimitConfig::token_bucket(1.0, 1), clock);
    let key = RateLimitKey::for_user("agent-9");

    assert_ok!(limiter.check(&key).await);
    assert_err!(limiter.check(&key).await);

    assert!(limiter.reset_key(&key.resolve()).await);
    assert_ok!(limiter.check(&key).await);
    assert!(!limiter.reset_key("never-seen").await);
}

#[tokio::test]
async fn test_limiter_stats_are_idempotent() {
    let clock = Arc::new(ManualClock::new(T0));
    let limiter = limiter(RateLimitConfig::token_bucket(1.0, 1), clock);
    let key = RateLimitKey::new();

    assert_ok!(limiter.check(&key).await);
    assert_err!(limiter.check(&key).await);

    let stats = limiter.get_stats();
    assert_eq!(stats, limiter.get_stats());
    assert_eq!(stats.allowed, 1);
    assert_eq!(stats.denied, 1);
    assert_eq!(stats.active_buckets, 1);
}

fn unreachable_redis(policy: UnavailablePolicy) -> RateLimiter {
    RateLimiter::new(RateLimitConfig {
        backend: BackendConfig::Redis {
            url: "redis://127.0.0.1:1".to_string(),
            key_prefix: "toolguard-test:".to_string(),
        },
        backend_timeout: Duration::from_millis(200),
        on_unavailable: policy,
        ..RateLimitConfig::token_bucket(5.0, 5)
    })
    .unwrap()
}

#[tokio::test]
async fn test_unreachable_backend_with_allow_policy() {
    let limiter = unreachable_redis(UnavailablePolicy::Allow);

    let info = assert_ok!(limiter.check(&RateLimitKey::for_user("agent-1")).await);
    assert_eq!(info.remaining, info.limit);
    assert_eq!(limiter.get_stats().backend_failures, 1);
}

#[tokio::test]
async fn test_unreachable_backend_with_deny_policy() {
    let limiter = unreachable_redis(UnavailablePolicy::Deny);

    let result = limiter.check(&RateLimitKey::for_user("agent-1")).await;
    assert!(matches!(result, Err(RateLimitError::BackendUnavailable(_))));

    let (allowed, _) = limiter.is_allowed(&RateLimitKey::for_user("agent-1")).await;
    assert!(!allowed);
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let config = RateLimitConfig {
        window_size: None,
        ..RateLimitConfig::sliding_window(2.0, Duration::from_secs(1))
    };
    assert!(RateLimiter::new(config).is_err());

    let cache_config = CacheConfig {
        max_size: 0,
        ..CacheConfig::default()
    };
    assert!(CacheManager::<Value>::new(cache_config).is_err());
}

#[test]
fn test_is_allowed_from_synchronous_code() {
    let clock = Arc::new(ManualClock::new(T0));
    let limiter = limiter(RateLimitConfig::token_bucket(2.0, 2), clock);
    let key = RateLimitKey::for_address("192.0.2.10");

    let (allowed, info) = tokio_test::block_on(limiter.is_allowed(&key));
    assert!(allowed);
    assert_eq!(info.limit, 2);
    assert_eq!(info.remaining, 1);
}
