//! Blocking operation offloader.
//!
//! Git, pip, filesystem walks and blocking HTTP downloads run on tokio's
//! blocking pool. A semaphore caps how many of them run at once across
//! every instance sharing the offloader.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::trace;

use crate::error::{Error, Result};

/// Bounded gateway to the blocking thread pool.
#[derive(Debug, Clone)]
pub struct Offloader {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl Offloader {
    /// Creates an offloader allowing `workers` concurrent blocking tasks.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "offloader needs at least one worker");

        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Returns the configured worker count.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `task` on a blocking worker and awaits its result.
    ///
    /// # Errors
    /// Returns `Error::Offload` if the worker panicked or the pool is gone.
    pub async fn run<F, T>(&self, label: &str, task: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Offload(format!("{}: worker pool closed", label)))?;

        trace!("[OFFLOAD] Running '{}'", label);
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        });

        handle
            .await
            .map_err(|e| Error::Offload(format!("{}: {}", label, e)))
    }

    /// Runs a fallible blocking task and flattens its result.
    ///
    /// # Errors
    /// Returns the task's own error or `Error::Offload`.
    pub async fn try_run<F, T>(&self, label: &str, task: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(label, task).await?
    }
}
