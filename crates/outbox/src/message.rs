//! Outbox rows and their status lifecycle.
//!
//! ```text
//! Pending ──claim──▶ Processing ──▶ Sent         (terminal)
//!                      │  ▲   └───▶ DeadLetter   (terminal)
//!                      ▼  │claim
//!                     Failed ─────▶ DeadLetter
//! ```
//!
//! Only `Pending` and `Failed` rows are claimable. Claiming increments
//! `attempt_count` in the same step, so the counter never decreases and
//! moves by exactly one per claim.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopworks_core::{CoreError, MessageId};

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    DeadLetter,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Sent,
        OutboxStatus::Failed,
        OutboxStatus::DeadLetter,
    ];

    /// Database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn is_claimable(self) -> bool {
        matches!(self, OutboxStatus::Pending | OutboxStatus::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::DeadLetter)
    }

    /// Transitions the dispatch machinery may perform. Operator requeue of a
    /// dead letter is deliberately not one of them.
    pub fn can_transition_to(self, next: OutboxStatus) -> bool {
        use OutboxStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Processing, DeadLetter)
                | (Failed, DeadLetter)
        )
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutboxStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::validation(format!("unknown outbox status: {s}")))
    }
}

/// A durable outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub aggregate_id: String,
    /// Routing key; doubles as the dispatch destination.
    pub message_type: String,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub attempt_count: u32,
    pub occurred_on: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    /// Take the claim: `Processing`, one more attempt, stamped `now`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), (OutboxStatus, OutboxStatus)> {
        if !self.status.can_transition_to(OutboxStatus::Processing) {
            return Err((self.status, OutboxStatus::Processing));
        }
        self.status = OutboxStatus::Processing;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// Record the result of a claim (`Sent`, `Failed` or `DeadLetter`).
    ///
    /// Returns `(from, to)` when the lifecycle forbids the change. Entering
    /// `Processing` is only possible through [`OutboxMessage::claim`].
    pub fn settle(&mut self, next: OutboxStatus) -> Result<(), (OutboxStatus, OutboxStatus)> {
        if next == OutboxStatus::Processing || !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// True once this claim is past the retry budget and must not be dispatched.
    pub fn attempts_exhausted(&self, max_attempts: u32) -> bool {
        self.attempt_count > max_attempts
    }

    /// The fence for settling the claim this row currently carries.
    pub fn claim_token(&self) -> ClaimToken {
        ClaimToken {
            id: self.id,
            attempt: self.attempt_count,
            claimed_at: self.last_attempt_at,
        }
    }

    /// Whether `token` names the claim this row carries right now.
    pub fn holds(&self, token: &ClaimToken) -> bool {
        self.id == token.id && self.attempt_count == token.attempt && self.last_attempt_at == token.claimed_at
    }
}

/// Identifies one claim of one message.
///
/// Every claim bumps `attempt_count` and restamps `last_attempt_at`, so once
/// a stale claim has been reaped and the row re-claimed, the old token no
/// longer matches and its settle is refused with `ClaimLost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimToken {
    pub id: MessageId,
    pub attempt: u32,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// A row to be written by a producer. Always starts `Pending` with zero attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxMessage {
    pub id: MessageId,
    pub aggregate_id: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub occurred_on: DateTime<Utc>,
}

impl NewOutboxMessage {
    pub fn new(aggregate_id: impl Into<String>, message_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: MessageId::new(),
            aggregate_id: aggregate_id.into(),
            message_type: message_type.into(),
            payload: payload.into(),
            occurred_on: Utc::now(),
        }
    }

    /// Serialize `payload` as JSON.
    pub fn json<T: Serialize>(
        aggregate_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(aggregate_id, message_type, serde_json::to_vec(payload)?))
    }

    pub fn with_occurred_on(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_on = at;
        self
    }

    pub fn into_pending(self) -> OutboxMessage {
        OutboxMessage {
            id: self.id,
            aggregate_id: self.aggregate_id,
            message_type: self.message_type,
            payload: self.payload,
            status: OutboxStatus::Pending,
            attempt_count: 0,
            occurred_on: self.occurred_on,
            last_attempt_at: None,
            last_error: None,
        }
    }
}
