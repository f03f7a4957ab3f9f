//! Queue items.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shopworks_core::TaskId;

use crate::action::TaskAction;
use crate::priority::Priority;

/// A queued task: the action plus its scheduling metadata.
///
/// Built with [`QueueItem::new`] and the `with_*` methods; defaults are
/// `Normal` priority, no retries and no schedule.
#[derive(Clone)]
pub struct QueueItem {
    id: TaskId,
    action: Arc<dyn TaskAction>,
    priority: Priority,
    max_retries: u32,
    scheduled_at: Option<DateTime<Utc>>,
    attempt: u32,
}

impl QueueItem {
    pub fn new(action: impl TaskAction + 'static) -> Self {
        Self::from_arc(Arc::new(action))
    }

    pub fn from_arc(action: Arc<dyn TaskAction>) -> Self {
        Self {
            id: TaskId::new(),
            action,
            priority: Priority::Normal,
            max_retries: 0,
            scheduled_at: None,
            attempt: 1,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Recorded on the item but not used to defer execution; the queue drains eagerly.
    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn action(&self) -> Arc<dyn TaskAction> {
        Arc::clone(&self.action)
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Same task, same lane, one retry fewer.
    pub(crate) fn into_retry(self) -> Option<Self> {
        let max_retries = self.max_retries.checked_sub(1)?;
        Some(Self {
            max_retries,
            attempt: self.attempt.saturating_add(1),
            ..self
        })
    }
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("scheduled_at", &self.scheduled_at)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}
