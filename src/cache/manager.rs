//! Cache Manager Module
//!
//! Thread-safe façade over [`CacheStore`] that owns the background janitor
//! and the memory-pressure policy.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::memory::{MemoryMonitor, SystemMemoryMonitor};
use crate::cache::{CacheStats, CacheStore, CleanupReport};
use crate::clock::{system_clock, SharedClock};
use crate::config::CacheConfig;
use crate::error::ConfigError;
use crate::observe::{self, SharedMetrics};
use crate::tasks::{spawn_periodic_task, BackgroundTask};

// == Janitor Outcome ==
/// What one janitor wakeup did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub expired: usize,
    pub evicted: usize,
    /// Memory pressure was detected on this wakeup
    pub pressure: bool,
}

// == Memory Stats ==
/// Memory-related view of the manager.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub memory_threshold: f64,
    pub background_cleanup_enabled: bool,
    /// Latest system usage ratio, None when the monitor has no reading
    pub system_memory_usage: Option<f64>,
    pub memory_pressure_detected: Option<bool>,
    pub memory_cleanups: u64,
    pub last_memory_cleanup: Option<u64>,
}

struct Shared<V> {
    store: Mutex<CacheStore<V>>,
    config: CacheConfig,
    monitor: Arc<dyn MemoryMonitor>,
    metrics: SharedMetrics,
    background_enabled: AtomicBool,
}

impl<V: Clone> Shared<V> {
    fn store(&self) -> MutexGuard<'_, CacheStore<V>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Samples the monitor; a failed probe counts as "no reading".
    fn memory_reading(&self) -> Option<f64> {
        match self.monitor.usage_ratio() {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "memory probe failed");
                None
            }
        }
    }

    /// One janitor wakeup: purge, sample pressure, then clean accordingly.
    fn run_cleanup_cycle(&self) -> CleanupOutcome {
        let expired = self.store().cleanup_expired();

        // Sampled without holding the table lock
        let reading = self.memory_reading();

        let mut store = self.store();
        let pressure = match reading {
            Some(ratio) => ratio > self.config.memory_threshold,
            None => {
                store.len() as f64 > self.config.pressure_fill_ratio * store.max_size() as f64
            }
        };

        if !pressure {
            if expired > 0 {
                debug!(expired, cache_size = store.len(), "routine cleanup completed");
            }
            return CleanupOutcome {
                expired,
                evicted: 0,
                pressure: false,
            };
        }

        store.stats_mut().record_pressure_trigger();
        let CleanupReport {
            expired: more_expired,
            evicted,
        } = store.aggressive_cleanup(self.config.aggressive_target());
        let now = store.now_ms();
        store.stats_mut().record_memory_cleanup(now);
        let final_size = store.len();
        drop(store);

        self.metrics
            .increment_counter(observe::CACHE_MEMORY_CLEANUPS, 1);
        self.metrics
            .increment_counter(observe::CACHE_EVICTIONS, evicted as u64);
        info!(
            expired = expired + more_expired,
            evicted,
            final_cache_size = final_size,
            memory_usage = ?reading,
            "aggressive cleanup completed"
        );

        CleanupOutcome {
            expired: expired + more_expired,
            evicted,
            pressure: true,
        }
    }
}

// == Builder ==
/// Configures optional collaborators before the manager is created.
pub struct CacheManagerBuilder {
    config: CacheConfig,
    clock: SharedClock,
    monitor: Option<Arc<dyn MemoryMonitor>>,
    metrics: SharedMetrics,
}

impl CacheManagerBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            monitor: None,
            metrics: observe::noop_metrics(),
        }
    }

    /// Replaces the time source.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the memory probe. Defaults to [`SystemMemoryMonitor`].
    pub fn memory_monitor(mut self, monitor: Arc<dyn MemoryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Sets the metrics sink.
    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validates the configuration and builds the manager. Background cleanup
    /// does not run until [`CacheManager::start`] is called.
    pub fn build<V: Clone + Send + 'static>(self) -> Result<CacheManager<V>, ConfigError> {
        self.config.validate()?;

        let store = CacheStore::new(
            self.config.max_size,
            self.config.default_ttl,
            self.config.eviction_strategy,
        )
        .with_clock(self.clock);
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(SystemMemoryMonitor::new()));

        info!(
            max_size = self.config.max_size,
            default_ttl_secs = ?self.config.default_ttl.map(|ttl| ttl.as_secs()),
            strategy = %self.config.eviction_strategy,
            memory_threshold = self.config.memory_threshold,
            background_cleanup = self.config.enable_background_cleanup,
            "cache manager initialized"
        );

        Ok(CacheManager {
            shared: Arc::new(Shared {
                store: Mutex::new(store),
                background_enabled: AtomicBool::new(self.config.enable_background_cleanup),
                config: self.config,
                monitor,
                metrics: self.metrics,
            }),
            janitor: Mutex::new(None),
            shutdown_initiated: AtomicBool::new(false),
        })
    }
}

// == Cache Manager ==
/// Bounded TTL cache shared by every handler of a server process.
///
/// All table mutations go through a single mutex that is never held across
/// an `.await`.
pub struct CacheManager<V> {
    shared: Arc<Shared<V>>,
    janitor: Mutex<Option<BackgroundTask>>,
    shutdown_initiated: AtomicBool,
}

impl<V: Clone + Send + 'static> CacheManager<V> {
    /// Creates a manager with the system clock and memory probe.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        CacheManagerBuilder::new(config).build()
    }

    // == Get ==
    /// Returns the cached value, or None on a miss. Never fails.
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.shared.store().get(key);
        match value {
            Some(_) => {
                debug!(key, "cache hit");
                self.shared.metrics.increment_counter(observe::CACHE_HITS, 1);
            }
            None => {
                debug!(key, "cache miss");
                self.shared.metrics.increment_counter(observe::CACHE_MISSES, 1);
            }
        }
        value
    }

    // == Set ==
    /// Stores `value` under `key`. `ttl` falls back to the configured
    /// default. Evicts synchronously when the table exceeds `max_size`.
    ///
    /// Returns false when the value was not cached; callers may ignore this.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) -> bool {
        let key = key.into();
        let (stored, evicted) = {
            let mut store = self.shared.store();
            let before = store.stats().evictions;
            let stored = store.set(key.clone(), value, ttl);
            (stored, store.stats().evictions - before)
        };
        if evicted > 0 {
            self.shared
                .metrics
                .increment_counter(observe::CACHE_EVICTIONS, evicted);
        }
        debug!(key = %key, stored, evicted, "cache set");
        stored
    }

    /// Removes `key`. Returns true if it was present.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.shared.store().delete(key);
        if removed {
            debug!(key, "cache delete");
        }
        removed
    }

    /// Removes every entry, or only keys containing `pattern`.
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let count = self.shared.store().clear(pattern);
        info!(pattern = ?pattern, count, "cache cleared");
        count
    }

    /// Removes each listed key, returning how many existed.
    pub fn invalidate<I, S>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut store = self.shared.store();
        keys.into_iter()
            .filter(|key| store.delete(key.as_ref()))
            .count()
    }

    /// Snapshot of the counters.
    pub fn get_stats(&self) -> CacheStats {
        self.shared.store().stats()
    }

    pub fn len(&self) -> usize {
        self.shared.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.store().is_empty()
    }

    /// Lists keys, optionally filtered by substring.
    pub fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        self.shared.store().keys(pattern)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Memory threshold, janitor state and the latest system reading.
    pub fn get_memory_stats(&self) -> MemoryStats {
        let reading = self.shared.memory_reading();
        let stats = self.get_stats();
        MemoryStats {
            memory_threshold: self.shared.config.memory_threshold,
            background_cleanup_enabled: self.background_cleanup_enabled(),
            system_memory_usage: reading,
            memory_pressure_detected: reading.map(|r| r > self.shared.config.memory_threshold),
            memory_cleanups: stats.memory_cleanups,
            last_memory_cleanup: stats.last_memory_cleanup,
        }
    }

    /// Whether the janitor is enabled (and, once started, actually running).
    pub fn background_cleanup_enabled(&self) -> bool {
        self.shared.background_enabled.load(Ordering::SeqCst)
    }

    // == Janitor ==
    /// Runs one janitor iteration immediately.
    pub fn run_cleanup_cycle(&self) -> CleanupOutcome {
        self.shared.run_cleanup_cycle()
    }

    /// Starts the background janitor on the current Tokio runtime.
    ///
    /// Returns false if background cleanup is disabled or cannot run here; in
    /// that case the flag is cleared and the cache keeps working with lazy
    /// expiry only. Calling `start` twice is harmless.
    pub fn start(&self) -> bool {
        if !self.background_cleanup_enabled() {
            return false;
        }
        let mut slot = self.janitor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return true;
        }

        let shared = Arc::clone(&self.shared);
        let task = spawn_periodic_task(
            "cache_janitor",
            self.shared.config.background_cleanup_interval,
            self.shared.config.error_backoff,
            move || {
                let shared = Arc::clone(&shared);
                async move {
                    shared.run_cleanup_cycle();
                    Ok::<_, Infallible>(())
                }
            },
        );

        match task {
            Some(task) => {
                *slot = Some(task);
                true
            }
            None => {
                warn!("disabling cache background cleanup");
                self.shared.background_enabled.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stops the janitor, waiting at most `shutdown_timeout`.
    pub async fn stop(&self) {
        let task = self
            .janitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.shutdown(self.shared.config.shutdown_timeout).await;
        }
    }

    /// Stops the janitor and drops every entry. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            debug!("cache manager shutdown already initiated");
            return;
        }
        self.stop().await;

        let cleared = self.shared.store().clear(None);
        let stats = self.get_stats();
        info!(
            cleared,
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            hit_rate = stats.hit_rate(),
            "cache manager shut down"
        );
    }
}

impl<V> Drop for CacheManager<V> {
    fn drop(&mut self) {
        let slot = self.janitor.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.as_ref() {
            task.cancel();
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::{HeuristicMonitor, MemoryProbeError};
    use crate::cache::EvictionStrategy;
    use crate::clock::ManualClock;
    use crate::observe::testing::RecordingMetrics;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug)]
    struct FixedMonitor(AtomicU64);

    impl FixedMonitor {
        fn new(ratio: f64) -> Self {
            Self(AtomicU64::new(ratio.to_bits()))
        }
    }

    impl MemoryMonitor for FixedMonitor {
        fn usage_ratio(&self) -> Result<Option<f64>, MemoryProbeError> {
            Ok(Some(f64::from_bits(self.0.load(Ordering::SeqCst))))
        }
    }

    #[derive(Debug)]
    struct BrokenMonitor;

    impl MemoryMonitor for BrokenMonitor {
        fn usage_ratio(&self) -> Result<Option<f64>, MemoryProbeError> {
            Err(MemoryProbeError::Unavailable("no /proc".to_string()))
        }
    }

    fn config(max_size: usize, strategy: EvictionStrategy) -> CacheConfig {
        CacheConfig {
            max_size,
            default_ttl: None,
            eviction_strategy: strategy,
            enable_background_cleanup: false,
            ..CacheConfig::default()
        }
    }

    fn manager(
        config: CacheConfig,
        monitor: Arc<dyn MemoryMonitor>,
    ) -> (CacheManager<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let manager = CacheManagerBuilder::new(config)
            .clock(clock.clone())
            .memory_monitor(monitor)
            .build()
            .unwrap();
        (manager, clock)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = CacheManager::<String>::new(CacheConfig {
            max_size: 0,
            ..CacheConfig::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_set_get_delete() {
        let (cache, _) = manager(config(10, EvictionStrategy::Lru), Arc::new(HeuristicMonitor));

        assert!(cache.set("a", "1".to_string(), None));
        assert_eq!(cache.get("a"), Some("1".to_string()));
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("a"), None);

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_ttl_with_simulated_clock() {
        let (cache, clock) = manager(config(10, EvictionStrategy::Lru), Arc::new(HeuristicMonitor));

        cache.set("quote", "42".to_string(), Some(Duration::from_secs(30)));
        clock.advance(Duration::from_secs(29));
        assert_eq!(cache.get("quote"), Some("42".to_string()));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("quote"), None);
    }

    #[test]
    fn test_invalidate_counts_existing() {
        let (cache, _) = manager(config(10, EvictionStrategy::Lru), Arc::new(HeuristicMonitor));
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);

        assert_eq!(cache.invalidate(["a", "b", "c"]), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats_idempotent() {
        let (cache, _) = manager(config(10, EvictionStrategy::Lru), Arc::new(HeuristicMonitor));
        cache.set("a", "1".to_string(), None);
        cache.get("a");
        cache.get("b");

        assert_eq!(cache.get_stats(), cache.get_stats());
    }

    #[test]
    fn test_metrics_are_fed() {
        let metrics = Arc::new(RecordingMetrics::default());
        let cache: CacheManager<u32> = CacheManagerBuilder::new(config(1, EvictionStrategy::Lru))
            .memory_monitor(Arc::new(HeuristicMonitor))
            .metrics(metrics.clone())
            .build()
            .unwrap();

        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.get("b");
        cache.get("a");

        assert_eq!(metrics.counter(observe::CACHE_HITS), 1);
        assert_eq!(metrics.counter(observe::CACHE_MISSES), 1);
        assert_eq!(metrics.counter(observe::CACHE_EVICTIONS), 1);
    }

    #[test]
    fn test_routine_cleanup_without_pressure() {
        let (cache, clock) = manager(config(100, EvictionStrategy::Lru), Arc::new(FixedMonitor::new(0.1)));
        cache.set("short", "x".to_string(), Some(Duration::from_secs(1)));
        cache.set("long", "y".to_string(), None);
        clock.advance(Duration::from_secs(2));

        let outcome = cache.run_cleanup_cycle();
        assert_eq!(outcome, CleanupOutcome { expired: 1, evicted: 0, pressure: false });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_stats().memory_cleanups, 0);
    }

    #[test]
    fn test_aggressive_cleanup_under_system_pressure() {
        let (cache, _) = manager(config(10, EvictionStrategy::Lru), Arc::new(FixedMonitor::new(0.95)));
        for i in 0..10 {
            cache.set(format!("k{i}"), i.to_string(), None);
        }

        let outcome = cache.run_cleanup_cycle();
        assert!(outcome.pressure);
        assert_eq!(outcome.evicted, 5);
        assert_eq!(cache.len(), 5);

        let stats = cache.get_stats();
        assert_eq!(stats.memory_cleanups, 1);
        assert_eq!(stats.memory_pressure_triggers, 1);
        assert_eq!(stats.last_memory_cleanup, Some(1_700_000_000_000));
    }

    #[test]
    fn test_heuristic_pressure_when_no_reading() {
        let (cache, _) = manager(config(10, EvictionStrategy::Fifo), Arc::new(HeuristicMonitor));
        for i in 0..9 {
            cache.set(format!("k{i}"), i.to_string(), None);
        }
        // 9 is not more than 0.9 * 10
        assert!(!cache.run_cleanup_cycle().pressure);

        cache.set("k9", "9".to_string(), None);
        let outcome = cache.run_cleanup_cycle();
        assert!(outcome.pressure);
        assert_eq!(cache.len(), 5);
        assert!(cache.keys(None).contains(&"k9".to_string()));
    }

    #[test]
    fn test_failed_probe_falls_back_to_heuristic() {
        let (cache, _) = manager(config(10, EvictionStrategy::Lru), Arc::new(BrokenMonitor));
        for i in 0..9 {
            cache.set(format!("k{i}"), i.to_string(), None);
        }
        assert!(!cache.run_cleanup_cycle().pressure);

        cache.set("k9", "9".to_string(), None);
        let outcome = cache.run_cleanup_cycle();
        assert!(outcome.pressure);
        assert_eq!(outcome.evicted, 5);
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.get_stats().memory_cleanups, 1);

        let memory = cache.get_memory_stats();
        assert_eq!(memory.system_memory_usage, None);
        assert_eq!(memory.memory_pressure_detected, None);
    }

    #[test]
    fn test_memory_stats() {
        let (cache, _) = manager(config(10, EvictionStrategy::Lru), Arc::new(FixedMonitor::new(0.9)));
        let stats = cache.get_memory_stats();
        assert_eq!(stats.system_memory_usage, Some(0.9));
        assert_eq!(stats.memory_pressure_detected, Some(true));
        assert!(!stats.background_cleanup_enabled);
    }

    #[test]
    fn test_start_outside_runtime_disables_janitor() {
        let cache: CacheManager<String> = CacheManagerBuilder::new(CacheConfig::default())
            .memory_monitor(Arc::new(HeuristicMonitor))
            .build()
            .unwrap();

        assert!(cache.background_cleanup_enabled());
        assert!(!cache.start());
        assert!(!cache.background_cleanup_enabled());

        // Still fully functional synchronously
        cache.set("a", "1".to_string(), None);
        assert_eq!(cache.get("a"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_janitor_purges_in_background() {
        let cache: CacheManager<String> = CacheManagerBuilder::new(CacheConfig {
            background_cleanup_interval: Duration::from_millis(50),
            ..CacheConfig::default()
        })
        .memory_monitor(Arc::new(HeuristicMonitor))
        .build()
        .unwrap();

        assert!(cache.start());
        assert!(cache.start());
        cache.set("short", "x".to_string(), Some(Duration::from_millis(10)));
        cache.set("long", "y".to_string(), Some(Duration::from_secs(3600)));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_stats().expirations, 1);
        cache.shutdown().await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (cache, _) = manager(config(10, EvictionStrategy::Lru), Arc::new(HeuristicMonitor));
        cache.set("a", "1".to_string(), None);
        cache.shutdown().await;
        cache.set("b", "2".to_string(), None);
        cache.shutdown().await;
        // Second shutdown did not clear again
        assert_eq!(cache.len(), 1);
    }
}
