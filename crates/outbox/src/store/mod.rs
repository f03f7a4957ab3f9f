//! Outbox persistence contract and adapters.

mod memory;
mod postgres;

pub use memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use shopworks_core::MessageId;

use crate::message::{ClaimToken, NewOutboxMessage, OutboxMessage, OutboxStatus};

/// Durable outbox access used by dispatch workers, the reaper and operators.
///
/// `claim_next` is the correctness-critical operation: selecting the oldest
/// claimable row, marking it `Processing`, incrementing its attempt count and
/// stamping `last_attempt_at` must happen atomically, and concurrent callers
/// must never receive the same row.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Write a new `Pending` row outside any caller transaction.
    async fn insert(&self, message: NewOutboxMessage) -> Result<OutboxMessage, OutboxStoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError>;

    /// Claim the oldest `Pending`/`Failed` row, or `None` when nothing is claimable.
    async fn claim_next(&self) -> Result<Option<OutboxMessage>, OutboxStoreError>;

    /// `Processing → Sent`.
    ///
    /// The settle operations only apply while the row still carries the
    /// claim named by `claim`; otherwise they fail with `ClaimLost` and leave
    /// the row untouched.
    async fn mark_sent(&self, claim: &ClaimToken) -> Result<(), OutboxStoreError>;

    /// `Processing → Failed`, eligible for a later claim.
    async fn mark_failed(&self, claim: &ClaimToken, error: &str) -> Result<(), OutboxStoreError>;

    /// `Processing → DeadLetter`. Terminal.
    async fn mark_dead_letter(&self, claim: &ClaimToken, reason: &str) -> Result<(), OutboxStoreError>;

    /// Move rows stuck in `Processing` for longer than `older_than` back to
    /// `Failed`. Attempt counts are left as they are. Returns the number reset.
    async fn reset_stale_claims(&self, older_than: Duration) -> Result<u64, OutboxStoreError>;

    /// Operator action: `DeadLetter → Pending` with the attempt count reset to zero.
    async fn requeue_dead_letter(&self, id: MessageId) -> Result<OutboxMessage, OutboxStoreError>;

    /// Most recently attempted dead letters first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError>;

    async fn counts_by_status(&self) -> Result<OutboxStats, OutboxStoreError>;
}

/// Outbox store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxStoreError {
    /// The outbox table does not exist (yet).
    #[error("outbox schema missing: {0}")]
    SchemaMissing(String),
    /// The store cannot be reached (pool exhausted, network, I/O).
    #[error("outbox store unavailable: {0}")]
    Unavailable(String),
    #[error("outbox message not found: {0}")]
    NotFound(MessageId),
    #[error("outbox message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: MessageId,
        from: OutboxStatus,
        to: OutboxStatus,
    },
    /// The row was re-claimed (after a stale-claim reset) since this claim was taken.
    #[error("claim {attempt} on outbox message {id} is no longer held")]
    ClaimLost { id: MessageId, attempt: u32 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl OutboxStoreError {
    /// Loop-level failures that must not consume any message's attempt budget.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::SchemaMissing(_) | Self::Unavailable(_))
    }

    /// The settle did not apply to this claim's row. The message is owned by
    /// someone else now; nothing is wrong with the store.
    pub fn is_lost_claim(&self) -> bool {
        matches!(self, Self::ClaimLost { .. } | Self::NotFound(_) | Self::InvalidTransition { .. })
    }

    pub(crate) fn invalid_transition(id: MessageId, (from, to): (OutboxStatus, OutboxStatus)) -> Self {
        Self::InvalidTransition { id, from, to }
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl OutboxStats {
    pub(crate) fn add(&mut self, status: OutboxStatus, count: u64) {
        let slot = match status {
            OutboxStatus::Pending => &mut self.pending,
            OutboxStatus::Processing => &mut self.processing,
            OutboxStatus::Sent => &mut self.sent,
            OutboxStatus::Failed => &mut self.failed,
            OutboxStatus::DeadLetter => &mut self.dead_letter,
        };
        *slot += count;
    }

    /// Rows a dispatch worker could still claim.
    pub fn backlog(&self) -> u64 {
        self.pending + self.failed
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed + self.dead_letter
    }
}
