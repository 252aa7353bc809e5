//! Periodic Cleanup Task
//!
//! Runs a housekeeping closure at a fixed interval until cancelled. Used by
//! the cache janitor and by the rate limiter's stale-key sweep.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// == Background Task ==
/// Handle to a running periodic task.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Task name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the task to stop after its current iteration.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    // == Shutdown ==
    /// Cancels the task and waits up to `timeout` for it to exit. A task
    /// that does not finish in time is aborted.
    ///
    /// Returns true if the task stopped on its own.
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        self.token.cancel();
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(())) => {
                debug!(task = self.name, "background task stopped");
                true
            }
            Ok(Err(e)) => {
                warn!(task = self.name, error = %e, "background task ended abnormally");
                false
            }
            Err(_) => {
                warn!(
                    task = self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "background task did not stop in time, aborting"
                );
                self.handle.abort();
                false
            }
        }
    }
}

/// Spawns `tick` every `interval` on the current Tokio runtime.
///
/// A tick that returns an error is logged and followed by `error_backoff`
/// before the next regular sleep; the task itself keeps running. Returns
/// None when called outside a Tokio runtime.
///
/// # Example
/// ```ignore
/// let task = spawn_periodic_task("sweep", Duration::from_secs(1), Duration::from_secs(5), || async {
///     Ok::<_, std::convert::Infallible>(())
/// })
/// .expect("inside a runtime");
/// // Later, during shutdown:
/// task.shutdown(Duration::from_secs(2)).await;
/// ```
pub fn spawn_periodic_task<F, Fut, E>(
    name: &'static str,
    interval: Duration,
    error_backoff: Duration,
    mut tick: F,
) -> Option<BackgroundTask>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display,
{
    let runtime = match Handle::try_current() {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(task = name, error = %e, "no Tokio runtime, background task not started");
            return None;
        }
    };

    let token = CancellationToken::new();
    let cancelled = token.clone();

    let handle = runtime.spawn(async move {
        info!(
            task = name,
            interval_ms = interval.as_millis() as u64,
            "starting background task"
        );

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let failed = match tick().await {
                Ok(()) => false,
                Err(e) => {
                    error!(task = name, error = %e, "background iteration failed");
                    true
                }
            };
            if failed {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(error_backoff) => {}
                }
            }
        }
    });

    Some(BackgroundTask {
        name,
        token,
        handle,
    })
}
