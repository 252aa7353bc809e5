//! Memory Monitor Module
//!
//! Pluggable probe for system memory pressure used by the cache janitor.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use sysinfo::System;
use thiserror::Error;

/// Errors raised while sampling memory usage.
#[derive(Debug, Error)]
pub enum MemoryProbeError {
    /// The platform reported no usable memory figures
    #[error("memory probe unavailable: {0}")]
    Unavailable(String),
}

// == Memory Monitor ==
/// Reports system memory usage as a fraction in `[0, 1]`.
pub trait MemoryMonitor: Send + Sync + fmt::Debug {
    /// Returns the current usage ratio, or `Ok(None)` when the monitor has no
    /// reading and the caller should fall back to its own heuristic.
    fn usage_ratio(&self) -> Result<Option<f64>, MemoryProbeError>;
}

// == Heuristic Monitor ==
/// Never reports a reading; the janitor falls back to its fill-level
/// heuristic.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicMonitor;

impl MemoryMonitor for HeuristicMonitor {
    fn usage_ratio(&self) -> Result<Option<f64>, MemoryProbeError> {
        Ok(None)
    }
}

// == System Monitor ==
/// Samples physical memory through `sysinfo`.
pub struct SystemMemoryMonitor {
    system: Mutex<System>,
}

impl SystemMemoryMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemMemoryMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemoryMonitor").finish_non_exhaustive()
    }
}

impl MemoryMonitor for SystemMemoryMonitor {
    fn usage_ratio(&self) -> Result<Option<f64>, MemoryProbeError> {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_memory();

        let total = sys.total_memory();
        let used = sys.used_memory();
        if total == 0 {
            return Err(MemoryProbeError::Unavailable(
                "total memory reported as zero".to_string(),
            ));
        }
        Ok(Some((used as f64 / total as f64).clamp(0.0, 1.0)))
    }
}
