use std::fmt::Display;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Process-wide owner of detached background work.
///
/// Jobs are not tied to the caller that scheduled them. Every accepted job runs to completion;
/// [`BackgroundTasks::shutdown`] only stops new work from being accepted and waits.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` on the runtime. Returns false once shutdown has started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T, E, F>(&self, name: &'static str, job: F) -> bool
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        if self.tracker.is_closed() {
            warn!(event = "task.rejected", task = name, "task.rejected");
            return false;
        }
        self.tracker.spawn(async move {
            match job.await {
                Ok(_) => debug!(event = "task.finish", task = name, "task.finish"),
                Err(e) => warn!(
                    event = "task.failed",
                    task = name,
                    error = %e,
                    "task.failed"
                ),
            }
        });
        true
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Waits for every tracked job to finish. Returns false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        // `TaskTracker::wait` only resolves once closed; an open tracker is polled by count.
        let started = tokio::time::Instant::now();
        while !self.tracker.is_empty() {
            if started.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Stops accepting work and waits for every accepted job, queued or running.
    ///
    /// Returns false if `timeout` elapsed with jobs still pending.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending == 0 {
            return true;
        }
        info!(event = "task.shutdown.wait", pending, "task.shutdown.wait");
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    event = "task.shutdown.timeout",
                    still_running = self.tracker.len(),
                    "task.shutdown.timeout"
                );
                false
            }
        }
    }
}
