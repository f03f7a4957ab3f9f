//! `shopworks-tasks`: in-process priority task queue and its single consumer.
//!
//! Producers push fire-and-forget work with [`PriorityTaskQueue::enqueue`]; one
//! [`TaskProcessor`] per process drains it strictly by priority and retries
//! failed actions in place. Nothing here is durable: work that must survive a
//! crash goes through the outbox instead.

pub mod action;
pub mod config;
pub mod error;
pub mod item;
pub mod priority;
pub mod processor;
pub mod queue;

pub use action::{TaskAction, TaskContext};
pub use config::{TaskProcessorConfig, TaskQueueConfig};
pub use error::QueueError;
pub use item::QueueItem;
pub use priority::Priority;
pub use processor::{TaskOutcome, TaskProcessor};
pub use queue::{PriorityTaskQueue, QueueLengths};
