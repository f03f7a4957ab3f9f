//! Single-consumer task processing loop.

use std::sync::Arc;

use shopworks_core::panic_message;
use shopworks_observability::QueueMetrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::TaskContext;
use crate::config::TaskProcessorConfig;
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::queue::PriorityTaskQueue;

/// What happened to one dequeued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Failed and was put back on its lane with one retry fewer.
    Retried,
    /// Failed with no retries left; counted in the queue's failure count.
    Dropped,
    /// Failed while shutdown was in progress; not retried.
    Interrupted,
}

/// Drains a [`PriorityTaskQueue`] until cancelled.
///
/// There is exactly one processor per queue. Each action runs on its own
/// tokio task so a panic is contained and treated like an error return.
pub struct TaskProcessor {
    queue: Arc<PriorityTaskQueue>,
    config: TaskProcessorConfig,
}

impl TaskProcessor {
    pub fn new(queue: Arc<PriorityTaskQueue>, config: TaskProcessorConfig) -> Self {
        Self { queue, config }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Run until `cancel` fires or the queue is closed and drained.
    ///
    /// Both dequeue errors end the loop; there is no error to back off from.
    pub async fn run(self, cancel: CancellationToken) {
        info!(processor = %self.config.name, "task processor started");

        loop {
            match self.queue.dequeue(&cancel).await {
                Ok(item) => {
                    self.process(item, &cancel).await;
                }
                Err(reason @ (QueueError::Cancelled | QueueError::Closed)) => {
                    debug!(processor = %self.config.name, %reason, "dequeue ended");
                    break;
                }
            }
        }

        info!(processor = %self.config.name, "task processor stopped");
    }

    /// Execute one item and apply the retry policy to its result.
    pub async fn process(&self, item: QueueItem, cancel: &CancellationToken) -> TaskOutcome {
        let metrics: &QueueMetrics = self.queue.metrics();
        let ctx = TaskContext::new(item.id(), item.priority(), item.attempt(), cancel.child_token());
        let action = item.action();

        metrics.running.increment();
        let result = match tokio::spawn(async move { action.run(ctx).await }).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(anyhow::anyhow!(
                "task panicked: {}",
                panic_message(join_err.into_panic().as_ref())
            )),
            Err(join_err) => Err(anyhow::anyhow!("task aborted: {join_err}")),
        };
        metrics.running.decrement();

        let err = match result {
            Ok(()) => {
                metrics.completed.increment();
                debug!(task_id = %item.id(), priority = %item.priority(), attempt = item.attempt(), "task completed");
                return TaskOutcome::Completed;
            }
            Err(err) => err,
        };

        if cancel.is_cancelled() {
            metrics.interrupted.increment();
            info!(
                task_id = %item.id(),
                priority = %item.priority(),
                error = %err,
                "task failed during shutdown; not retrying"
            );
            return TaskOutcome::Interrupted;
        }

        let id = item.id();
        let priority = item.priority();
        let attempt = item.attempt();
        match item.into_retry() {
            Some(retry) => {
                metrics.retried.increment();
                debug!(
                    task_id = %id,
                    priority = %priority,
                    attempt,
                    retries_left = retry.max_retries(),
                    error = %err,
                    "task failed; requeueing"
                );
                self.queue.requeue(retry);
                TaskOutcome::Retried
            }
            None => {
                metrics.failed.increment();
                warn!(
                    task_id = %id,
                    priority = %priority,
                    attempt,
                    error = %err,
                    "task dropped after exhausting retries"
                );
                TaskOutcome::Dropped
            }
        }
    }
}
