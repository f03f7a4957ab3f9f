//! Bounded three-lane priority queue.
//!
//! Each lane is a bounded tokio mpsc channel. Producers never lose work: when
//! a lane is full, `enqueue` waits for capacity (backpressure) instead of
//! dropping the item. The single consumer scans lanes in strict priority
//! order, so sustained `High` traffic can starve `Low` indefinitely.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use shopworks_core::TaskId;
use shopworks_observability::QueueMetrics;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TaskQueueConfig;
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::priority::Priority;

/// Approximate per-lane depth. The three counts are not read atomically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueLengths {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueLengths {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

/// In-memory priority task queue shared between producers and one consumer.
pub struct PriorityTaskQueue {
    senders: [mpsc::Sender<QueueItem>; 3],
    receivers: Mutex<[mpsc::Receiver<QueueItem>; 3]>,
    notify: Notify,
    closed: AtomicBool,
    config: TaskQueueConfig,
    metrics: Arc<QueueMetrics>,
}

impl PriorityTaskQueue {
    pub fn new(config: TaskQueueConfig, metrics: Arc<QueueMetrics>) -> Self {
        let capacity = config.lane_capacity.max(1);
        let (high_tx, high_rx) = mpsc::channel(capacity);
        let (normal_tx, normal_rx) = mpsc::channel(capacity);
        let (low_tx, low_rx) = mpsc::channel(capacity);

        Self {
            senders: [high_tx, normal_tx, low_tx],
            receivers: Mutex::new([high_rx, normal_rx, low_rx]),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            config,
            metrics,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TaskQueueConfig::default(), Arc::new(QueueMetrics::default()))
    }

    /// Queue an item on its priority lane.
    ///
    /// Non-blocking while the lane has room; otherwise waits until the consumer
    /// frees a slot. Fails only once the queue has been closed.
    pub async fn enqueue(&self, item: QueueItem) -> Result<TaskId, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let id = item.id();
        let priority = item.priority();
        self.push(item).await?;

        self.metrics.enqueued.increment();
        debug!(task_id = %id, priority = %priority, "task enqueued");
        Ok(id)
    }

    async fn push(&self, item: QueueItem) -> Result<(), QueueError> {
        let priority = item.priority();
        let lane = &self.senders[priority.lane()];

        match lane.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                debug!(task_id = %item.id(), priority = %priority, "lane full, waiting for capacity");
                lane.send(item).await.map_err(|_| QueueError::Closed)?;
            }
            Err(TrySendError::Closed(_)) => return Err(QueueError::Closed),
        }

        self.record_depth(priority);
        self.notify.notify_one();
        Ok(())
    }

    /// Put a failed item back on its lane without blocking the caller.
    ///
    /// Retries bypass the closed flag: they are existing work, not new work.
    /// If the lane is full the write is handed to a background task so the
    /// consumer (the only thing that frees capacity) never waits on itself.
    pub(crate) fn requeue(self: &Arc<Self>, item: QueueItem) {
        let priority = item.priority();
        match self.senders[priority.lane()].try_send(item) {
            Ok(()) => {
                self.record_depth(priority);
                self.notify.notify_one();
            }
            Err(TrySendError::Full(item)) => {
                let queue = Arc::clone(self);
                tokio::spawn(async move {
                    let id = item.id();
                    if let Err(err) = queue.push(item).await {
                        tracing::error!(task_id = %id, error = %err, "failed to requeue task");
                    }
                });
            }
            Err(TrySendError::Closed(item)) => {
                tracing::error!(task_id = %item.id(), priority = %priority, "lane disconnected; retry lost");
            }
        }
    }

    /// Wait for the next item, highest priority first.
    ///
    /// Returns `Cancelled` when `cancel` fires and `Closed` once the queue is
    /// closed and fully drained.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<QueueItem, QueueError> {
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            if let Some(item) = self.try_dequeue().await {
                return Ok(item);
            }

            if self.is_closed() {
                return Err(QueueError::Closed);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Take the highest-priority item that is available right now.
    pub async fn try_dequeue(&self) -> Option<QueueItem> {
        let mut receivers = self.receivers.lock().await;
        for priority in Priority::ALL {
            if let Ok(item) = receivers[priority.lane()].try_recv() {
                self.record_depth(priority);
                return Some(item);
            }
        }
        None
    }

    pub fn queue_lengths(&self) -> QueueLengths {
        QueueLengths {
            high: self.depth(Priority::High),
            normal: self.depth(Priority::Normal),
            low: self.depth(Priority::Low),
        }
    }

    fn depth(&self, priority: Priority) -> usize {
        let lane = &self.senders[priority.lane()];
        lane.max_capacity().saturating_sub(lane.capacity())
    }

    fn record_depth(&self, priority: Priority) {
        let depth = i64::try_from(self.depth(priority)).unwrap_or(i64::MAX);
        self.metrics.lane_depth[priority.lane()].set(depth);
    }

    /// Tasks dropped after exhausting their retries.
    pub fn failure_count(&self) -> u64 {
        self.metrics.failed.get()
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    /// Stop accepting new work. Items already queued still drain.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("task queue closed");
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PriorityTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityTaskQueue")
            .field("lengths", &self.queue_lengths())
            .field("closed", &self.is_closed())
            .field("config", &self.config)
            .finish()
    }
}
