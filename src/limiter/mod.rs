//! Concurrency gates for backup and restore work.
//!
//! Two independent limits apply. The operations semaphore caps how many
//! backups and restores run on this host at once and is taken first. The
//! blocking pool caps how many OS threads are busy inside driver I/O, which
//! keeps the async runtime free for orchestration and RPC handling.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{BackupError, Result};

/// Held for the whole of one create or restore.
#[derive(Debug)]
pub struct OperationPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    operations: Option<Arc<Semaphore>>,
    max_operations: usize,
    pool: BlockingPool,
}

impl ConcurrencyLimiter {
    /// `max_operations == 0` leaves operations unbounded.
    pub fn new(max_operations: usize, native_threads: usize) -> Self {
        let operations = (max_operations > 0).then(|| Arc::new(Semaphore::new(max_operations)));
        Self {
            operations,
            max_operations,
            pool: BlockingPool::new(native_threads),
        }
    }

    pub async fn acquire(&self) -> Result<OperationPermit> {
        let Some(ref semaphore) = self.operations else {
            return Ok(OperationPermit { _permit: None });
        };

        if semaphore.available_permits() == 0 {
            debug!(
                "Waiting for one of {} backup operation slots",
                self.max_operations
            );
        }
        let permit = Arc::clone(semaphore)
            .acquire_owned()
            .await
            .map_err(|e| BackupError::Other(e.into()))?;
        Ok(OperationPermit {
            _permit: Some(permit),
        })
    }

    /// Free operation slots, `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.operations.as_ref().map(|s| s.available_permits())
    }

    pub fn pool(&self) -> &BlockingPool {
        &self.pool
    }

    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.pool.run(f).await
    }
}

/// Bounded set of OS threads for blocking driver calls.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    threads: Arc<Semaphore>,
    size: usize,
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            threads: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.threads.available_permits()
    }

    /// Run `f` on a pool thread. A panic inside `f` is resumed on the
    /// caller.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.threads)
            .acquire_owned()
            .await
            .map_err(|e| BackupError::Other(e.into()))?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });

        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(BackupError::Other(e.into())),
        }
    }
}
