//! The unit of work executed by the processor.

use std::future::Future;

use async_trait::async_trait;
use shopworks_core::TaskId;
use tokio_util::sync::CancellationToken;

use crate::priority::Priority;

/// Execution context handed to every task attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub priority: Priority,
    /// 1 for the first execution, incremented on every in-place retry.
    pub attempt: u32,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: TaskId, priority: Priority, attempt: u32, cancellation: CancellationToken) -> Self {
        Self {
            task_id,
            priority,
            attempt,
            cancellation,
        }
    }

    /// Fires when the processor is shutting down. Long-running actions should watch it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Work that can be queued. Must tolerate being executed more than once.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskAction for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}
