//! In-memory outbox store for tests and local development.
//!
//! A single mutex serializes every operation, which gives the same
//! observable claim semantics as a row lock with `SKIP LOCKED`: two
//! concurrent `claim_next` calls can never return the same row.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use shopworks_core::{Clock, MessageId, SystemClock};
use tokio::sync::Mutex;

use super::{OutboxStats, OutboxStore, OutboxStoreError};
use crate::message::{ClaimToken, NewOutboxMessage, OutboxMessage, OutboxStatus};

pub struct InMemoryOutboxStore {
    messages: Mutex<HashMap<MessageId, OutboxMessage>>,
    clock: Arc<dyn Clock>,
    schema_ready: AtomicBool,
    unavailable: AtomicBool,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: Mutex::new(HashMap::new()),
            clock,
            schema_ready: AtomicBool::new(true),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// A store whose table has not been created yet; every call fails with
    /// `SchemaMissing` until [`InMemoryOutboxStore::create_schema`].
    pub fn without_schema() -> Self {
        let store = Self::new();
        store.schema_ready.store(false, Ordering::SeqCst);
        store
    }

    pub fn create_schema(&self) {
        self.schema_ready.store(true, Ordering::SeqCst);
    }

    /// Simulate losing the connection to the store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert a row as-is, bypassing the `Pending` defaults.
    pub async fn put(&self, message: OutboxMessage) {
        self.messages.lock().await.insert(message.id, message);
    }

    fn check_available(&self) -> Result<(), OutboxStoreError> {
        if !self.schema_ready.load(Ordering::SeqCst) {
            return Err(OutboxStoreError::SchemaMissing(
                "relation \"outbox_messages\" does not exist".to_string(),
            ));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OutboxStoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }

    async fn settle(
        &self,
        claim: &ClaimToken,
        next: OutboxStatus,
        error: Option<&str>,
    ) -> Result<(), OutboxStoreError> {
        self.check_available()?;
        let id = claim.id;
        let mut messages = self.messages.lock().await;
        let message = messages.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        if !message.holds(claim) {
            return Err(OutboxStoreError::ClaimLost {
                id,
                attempt: claim.attempt,
            });
        }
        message
            .settle(next)
            .map_err(|t| OutboxStoreError::invalid_transition(id, t))?;
        message.last_error = error.map(str::to_string);
        Ok(())
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxStore")
            .field("schema_ready", &self.schema_ready.load(Ordering::Relaxed))
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, message: NewOutboxMessage) -> Result<OutboxMessage, OutboxStoreError> {
        self.check_available()?;
        let mut messages = self.messages.lock().await;
        if messages.contains_key(&message.id) {
            return Err(OutboxStoreError::Storage(format!(
                "duplicate outbox message id {}",
                message.id
            )));
        }
        let row = message.into_pending();
        messages.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        self.check_available()?;
        Ok(self.messages.lock().await.get(&id).cloned())
    }

    async fn claim_next(&self) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        self.check_available()?;
        let mut messages = self.messages.lock().await;

        let Some(id) = messages
            .values()
            .filter(|m| m.status.is_claimable())
            .min_by_key(|m| (m.occurred_on, m.id))
            .map(|m| m.id)
        else {
            return Ok(None);
        };

        let now = self.clock.now();
        let message = messages.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        message
            .claim(now)
            .map_err(|t| OutboxStoreError::invalid_transition(id, t))?;
        Ok(Some(message.clone()))
    }

    async fn mark_sent(&self, claim: &ClaimToken) -> Result<(), OutboxStoreError> {
        self.settle(claim, OutboxStatus::Sent, None).await
    }

    async fn mark_failed(&self, claim: &ClaimToken, error: &str) -> Result<(), OutboxStoreError> {
        self.settle(claim, OutboxStatus::Failed, Some(error)).await
    }

    async fn mark_dead_letter(&self, claim: &ClaimToken, reason: &str) -> Result<(), OutboxStoreError> {
        self.settle(claim, OutboxStatus::DeadLetter, Some(reason)).await
    }

    async fn reset_stale_claims(&self, older_than: Duration) -> Result<u64, OutboxStoreError> {
        self.check_available()?;
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| OutboxStoreError::Storage(format!("invalid claim timeout: {e}")))?;
        let cutoff = self.clock.now() - older_than;

        let mut messages = self.messages.lock().await;
        let mut reset = 0;
        for message in messages.values_mut() {
            let stale = message.status == OutboxStatus::Processing
                && message.last_attempt_at.is_none_or(|at| at < cutoff);
            if stale && message.settle(OutboxStatus::Failed).is_ok() {
                message.last_error = Some("claim expired".to_string());
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn requeue_dead_letter(&self, id: MessageId) -> Result<OutboxMessage, OutboxStoreError> {
        self.check_available()?;
        let mut messages = self.messages.lock().await;
        let message = messages.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        if message.status != OutboxStatus::DeadLetter {
            return Err(OutboxStoreError::invalid_transition(
                id,
                (message.status, OutboxStatus::Pending),
            ));
        }
        message.status = OutboxStatus::Pending;
        message.attempt_count = 0;
        message.last_error = None;
        Ok(message.clone())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        self.check_available()?;
        let messages = self.messages.lock().await;
        let mut dead: Vec<_> = messages
            .values()
            .filter(|m| m.status == OutboxStatus::DeadLetter)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.last_attempt_at.cmp(&a.last_attempt_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn counts_by_status(&self) -> Result<OutboxStats, OutboxStoreError> {
        self.check_available()?;
        let messages = self.messages.lock().await;
        let mut stats = OutboxStats::default();
        for message in messages.values() {
            stats.add(message.status, 1);
        }
        Ok(stats)
    }
}
