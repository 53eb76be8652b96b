// Bounded grading capacity.
//
// At most `size` grades run at once. Up to `max_waiting` more may queue for
// a slot; beyond that callers are turned away with `Busy` instead of
// piling up.

use crate::error::GradeError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::warn;

#[derive(Clone)]
pub struct GradingPool {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    size: usize,
    max_waiting: usize,
}

/// Decrements the waiting count however the wait ends.
struct WaitingSlot(Arc<AtomicUsize>);

impl Drop for WaitingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GradingPool {
    pub fn new(size: usize, max_waiting: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            waiting: Arc::new(AtomicUsize::new(0)),
            size,
            max_waiting,
        }
    }

    /// One slot per available core.
    pub fn sized_to_host(max_waiting: usize) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cores, max_waiting)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, GradeError> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::Closed) => Err(GradeError::Busy),
            Err(TryAcquireError::NoPermits) => {
                let slot = WaitingSlot(self.waiting.clone());
                if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.max_waiting {
                    warn!(
                        size = self.size,
                        max_waiting = self.max_waiting,
                        "Grading pool saturated, rejecting"
                    );
                    return Err(GradeError::Busy);
                }
                let permit = self
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| GradeError::Busy)?;
                drop(slot);
                Ok(permit)
            }
        }
    }

    /// Wait until a slot is free without taking it. Lets a queue consumer
    /// avoid pulling work it has no room for.
    pub async fn wait_for_slot(&self) -> Result<(), GradeError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GradeError::Busy)?;
        drop(permit);
        Ok(())
    }

    /// Run `task` on its own tokio task once a slot is free.
    ///
    /// The task keeps its slot until it finishes even if the caller stops
    /// waiting, so an abandoned grade still counts against capacity.
    pub async fn run<F, T>(&self, task: F) -> Result<T, GradeError>
    where
        F: Future<Output = Result<T, GradeError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            task.await
        });

        handle
            .await
            .map_err(|e| GradeError::Infrastructure(format!("grading task failed: {}", e)))?
    }
}
