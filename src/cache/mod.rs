//! Cache Module
//!
//! Provides an in-memory cache with TTL expiration, strategy-driven eviction
//! (LRU, LFU, FIFO), a background janitor and memory-pressure cleanup.

mod entry;
mod eviction;
mod manager;
mod memoize;
mod memory;
mod stats;
mod store;


// Re-export public types
pub use entry::CacheEntry;
pub use eviction::EvictionStrategy;
pub use manager::{CacheManager, CacheManagerBuilder, CleanupOutcome, MemoryStats};
pub use memoize::{KeyFn, MaybeAbsent, Memoized, WrapOptions};
pub use memory::{HeuristicMonitor, MemoryMonitor, MemoryProbeError, SystemMemoryMonitor};
pub use stats::CacheStats;
pub use store::{CacheStore, CleanupReport};

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;
