//! Bounded worker pool executing queued retraining triggers.
//!
//! Triggers cross the queue as JSON. Runs that fail transiently are
//! re-dispatched with exponential countdown until the retry budget is spent.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use config::RetryPolicy;
use forecast_structs::RetrainingTrigger;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::orchestrator::{OrchestrationOutcome, RetrainingOrchestrator};

/// Triggers buffered before `submit` waits for room.
const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Could not encode trigger: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Retraining queue is closed")]
    Closed,
}

struct QueuedTask {
    payload: String,
    /// Re-dispatches so far.
    attempt: u32,
}

/// Handle for submitting triggers to the worker pool.
pub struct RetrainingQueue {
    sender: mpsc::Sender<QueuedTask>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
    dispatcher: JoinHandle<()>,
}

impl RetrainingQueue {
    /// Spawns the dispatcher. At most `capacity` runs execute at once.
    #[must_use]
    pub fn start(
        orchestrator: Arc<RetrainingOrchestrator>,
        capacity: usize,
        retry: RetryPolicy,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let pending = Arc::new(AtomicUsize::new(0));

        let workers = Arc::new(Workers {
            orchestrator,
            semaphore: Arc::new(Semaphore::new(capacity)),
            retry,
            pending: Arc::clone(&pending),
            requeue: sender.downgrade(),
        });
        let dispatcher = tokio::spawn(dispatch(workers, receiver, capacity));

        Self {
            sender,
            pending,
            capacity,
            dispatcher,
        }
    }

    /// Enqueues a trigger for execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the trigger cannot be encoded or the queue is closed.
    pub async fn submit(&self, trigger: &RetrainingTrigger) -> Result<(), QueueError> {
        let payload = trigger.to_json()?;
        self.pending.fetch_add(1, Ordering::SeqCst);

        if self.sender.send(QueuedTask { payload, attempt: 0 }).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        debug!(trigger = %trigger.id, "Trigger queued");
        Ok(())
    }

    /// Tasks queued, running or waiting to be retried.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stops accepting triggers, drains the queue and waits for running tasks.
    ///
    /// Retries still counting down are dropped.
    pub async fn close(self) {
        drop(self.sender);
        if let Err(error) = self.dispatcher.await {
            error!(%error, "Retraining dispatcher panicked");
        }
    }
}

struct Workers {
    orchestrator: Arc<RetrainingOrchestrator>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    pending: Arc<AtomicUsize>,
    requeue: mpsc::WeakSender<QueuedTask>,
}

async fn dispatch(
    workers: Arc<Workers>,
    mut receiver: mpsc::Receiver<QueuedTask>,
    capacity: usize,
) {
    while let Some(task) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&workers.semaphore).acquire_owned().await else {
            break;
        };
        let workers = Arc::clone(&workers);

        tokio::spawn(async move {
            workers.run(task).await;
            drop(permit);
        });
    }

    // Wait for in-flight runs.
    if workers.semaphore.acquire_many(capacity as u32).await.is_err() {
        warn!("Worker semaphore closed while draining");
    }
    info!("Retraining queue drained");
}

impl Workers {
    async fn run(&self, task: QueuedTask) {
        let outcome = self.orchestrator.execute_serialized(&task.payload).await;
        self.pending.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Err(error) => error!(%error, "Dropping undecodable retraining task"),
            Ok(OrchestrationOutcome::Coalesced { .. }) => {}
            Ok(OrchestrationOutcome::Completed(result)) => {
                if result.is_transient_failure() {
                    self.schedule_retry(task);
                } else {
                    let success = result.success;
                    debug!(result = %result.id, success, "Retraining task finished");
                }
            }
        }
    }

    fn schedule_retry(&self, task: QueuedTask) {
        if task.attempt >= self.retry.max_retries {
            warn!(attempts = task.attempt + 1, "Retraining retries exhausted");
            return;
        }

        let delay = self.retry.countdown(task.attempt);
        info!(
            retry = task.attempt + 1,
            delay = ?delay,
            "Re-dispatching transiently failed retraining"
        );

        self.pending.fetch_add(1, Ordering::SeqCst);
        let requeue = self.requeue.clone();
        let pending = Arc::clone(&self.pending);
        let task = QueuedTask {
            payload: task.payload,
            attempt: task.attempt + 1,
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let sent = match requeue.upgrade() {
                Some(sender) => sender.send(task).await.is_ok(),
                None => false,
            };
            if !sent {
                pending.fetch_sub(1, Ordering::SeqCst);
                warn!("Retraining queue closed, retry dropped");
            }
        });
    }
}
