use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("no execution slot became free within {0:?}")]
    Timeout(Duration),
    #[error("cancelled while waiting for an execution slot")]
    Cancelled,
    #[error("limiter is closed")]
    Closed,
}

/// A held execution slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

/// Caps concurrent remote executions process-wide.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
        }
    }

    /// Waits for a slot until the acquire timeout, the caller's `deadline`, or
    /// cancellation, whichever comes first.
    pub async fn acquire(
        &self,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<SlotPermit, LimiterError> {
        let mut wait = self.acquire_timeout;
        if let Some(deadline) = deadline {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }
        let acquire = tokio::time::timeout(wait, Arc::clone(&self.semaphore).acquire_owned());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LimiterError::Cancelled),
            acquired = acquire => match acquired {
                Ok(Ok(permit)) => Ok(SlotPermit { _permit: permit }),
                Ok(Err(_)) => Err(LimiterError::Closed),
                Err(_) => {
                    tracing::warn!(
                        event = "limiter.timeout",
                        waited_ms = wait.as_millis() as u64,
                        capacity = self.capacity,
                    );
                    Err(LimiterError::Timeout(wait))
                }
            },
        }
    }

    pub fn release(&self, permit: SlotPermit) {
        drop(permit);
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
