//! Queue error model.

use thiserror::Error;

/// Errors surfaced by [`crate::PriorityTaskQueue`].
///
/// A full lane is not an error: `enqueue` waits for capacity instead. The
/// queue owns both ends of every lane, so a lane cannot disconnect.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed; no new work is accepted and nothing is left to drain.
    #[error("task queue is closed")]
    Closed,

    /// The caller's cancellation token fired while waiting.
    #[error("dequeue cancelled")]
    Cancelled,
}
