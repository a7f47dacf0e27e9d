//! Admission control for function executions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ExecConfig;
use crate::utils::futures::CallOnDrop;

/// Invalid [`ExecSlotQueue`] arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecQueueError {
    #[error("max_concurrent must be a positive integer")]
    NoConcurrency,
    #[error("max_concurrent must not exceed {}", Semaphore::MAX_PERMITS)]
    TooMuchConcurrency,
}

/// One unit of the concurrency budget of an [`ExecSlotQueue`].
///
/// The unit returns to the queue when the slot is dropped, so every exit path of the holder
/// releases it exactly once.
#[derive(Debug)]
pub struct ExecSlot {
    _permit: OwnedSemaphorePermit,
}

impl ExecSlot {
    /// Returns the slot to its queue.
    pub fn release(self) {}
}

/// A counting gate bounding how many functions run at the same time.
///
/// Callers that find no free slot wait up to `timeout` in a queue of at most `max_queue`
/// callers. A `max_queue` or `timeout` of zero turns acquisition into a non-blocking attempt.
#[derive(Debug, Clone)]
pub struct ExecSlotQueue {
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_queue: usize,
    timeout: Duration,
}

impl ExecSlotQueue {
    pub fn new(
        max_concurrent: usize,
        max_queue: usize,
        timeout: Duration,
    ) -> Result<Self, ExecQueueError> {
        if max_concurrent == 0 {
            return Err(ExecQueueError::NoConcurrency);
        }
        if max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ExecQueueError::TooMuchConcurrency);
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_queue,
            timeout,
        })
    }

    pub fn from_config(config: &ExecConfig) -> Result<Self, ExecQueueError> {
        Self::new(config.max_concurrent, config.max_queue, config.timeout)
    }

    /// The number of slots that are currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// The number of callers currently waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Whether [`get_exec_slot`](Self::get_exec_slot) would currently give up without waiting.
    pub fn is_saturated(&self) -> bool {
        self.available() == 0
            && (self.max_queue == 0 || self.timeout.is_zero() || self.waiting() >= self.max_queue)
    }

    /// Acquires a slot, or returns `None` if the queue is saturated or the wait timed out.
    ///
    /// Dropping the returned future while it waits gives up the place in the queue without
    /// consuming a slot, which is also what happens when the timeout fires.
    pub async fn get_exec_slot(&self) -> Option<ExecSlot> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            metric!(counter("exec.slot") += 1, "outcome" => "granted");
            return Some(ExecSlot { _permit: permit });
        }

        if self.max_queue == 0 || self.timeout.is_zero() {
            metric!(counter("exec.slot") += 1, "outcome" => "saturated");
            return None;
        }

        let waiting = self.waiting.fetch_add(1, Ordering::AcqRel);
        let _waiting_token = {
            let counter = Arc::clone(&self.waiting);
            CallOnDrop::new(move || {
                counter.fetch_sub(1, Ordering::AcqRel);
            })
        };
        if waiting >= self.max_queue {
            metric!(counter("exec.slot") += 1, "outcome" => "queue_full");
            return None;
        }
        metric!(gauge("exec.waiting") = (waiting + 1) as u64);

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(self.timeout, acquire).await {
            Ok(Ok(permit)) => {
                metric!(counter("exec.slot") += 1, "outcome" => "granted");
                Some(ExecSlot { _permit: permit })
            }
            // the semaphore is never closed
            Ok(Err(_)) => None,
            Err(_) => {
                metric!(counter("exec.slot") += 1, "outcome" => "timeout");
                tracing::debug!(timeout = ?self.timeout, "Timed out waiting for an exec slot");
                None
            }
        }
    }

    /// Returns a slot to the queue. Equivalent to dropping it.
    pub fn release_exec_slot(&self, slot: ExecSlot) {
        slot.release();
    }
}
