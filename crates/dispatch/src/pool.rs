//! Fixed-size worker pool for pipeline runs.

use std::{future::Future, sync::Arc};

use {
    tokio::{
        sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
        task::JoinHandle,
    },
    tokio_util::task::TaskTracker,
};

use crate::{Error, Result};

/// `size` permits bound the runs executing at once; the tracker counts
/// spawned runs until they finish so shutdown can wait for them.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Reserve a worker without waiting.
    pub fn try_reserve(&self) -> Result<WorkerPermit> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(WorkerPermit {
                permit,
                tracker: self.tracker.clone(),
            }),
            Err(TryAcquireError::NoPermits) => Err(Error::PoolSaturated),
            Err(TryAcquireError::Closed) => Err(Error::PoolClosed),
        }
    }

    /// Stop handing out workers. Runs already spawned continue.
    pub fn close(&self) {
        self.permits.close();
        self.tracker.close();
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Runs spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

/// A reserved worker slot. Dropping it unused returns the slot.
pub struct WorkerPermit {
    permit: OwnedSemaphorePermit,
    tracker: TaskTracker,
}

impl WorkerPermit {
    /// Run `fut` on the runtime, holding the worker until it completes.
    pub fn spawn<F>(self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.permit;
        self.tracker.spawn(async move {
            let _permit = permit;
            fut.await
        })
    }
}
