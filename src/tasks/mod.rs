//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a manager is alive.
//!
//! # Tasks
//! - Cache janitor: expiry purge and memory-pressure cleanup
//! - Rate limit sweep: drops stale keys from the in-memory backend

mod cleanup;

pub use cleanup::{spawn_periodic_task, BackgroundTask};
