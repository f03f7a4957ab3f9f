//! Outbox dispatch worker.
//!
//! Each iteration claims at most one row and settles it:
//!
//! | Claim result | Action | Next sleep |
//! |---|---|---|
//! | nothing claimable | | idle backoff (doubling, jittered, capped) |
//! | `attempt_count > max_attempts` | `DeadLetter` | none |
//! | dispatch succeeded | `Sent` | none |
//! | dispatch failed | `Failed` | random `failure_delay_min..=failure_delay_max` |
//! | table missing | | `schema_missing_backoff` |
//! | store unreachable | | idle backoff |
//! | claim reaped and taken by another worker | none, row left alone | none |
//!
//! Store failures are loop-level: they never touch a message's attempt count.
//! Cancellation is only observed between iterations and while sleeping, so a
//! claim that has started always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use shopworks_core::{MessageId, panic_message};
use shopworks_observability::DispatchMetrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::IdleBackoff;
use crate::config::OutboxConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::message::{ClaimToken, OutboxMessage};
use crate::store::{OutboxStore, OutboxStoreError};

/// What a single poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No claimable row.
    Idle,
    Sent(MessageId),
    Failed(MessageId),
    DeadLettered(MessageId),
    /// The settle was refused: the claim had expired and the row now
    /// belongs to another worker (or was settled by someone else).
    ClaimLost(MessageId),
    /// The outbox table does not exist yet.
    SchemaMissing,
    /// The store could not be used; no message was affected.
    StoreUnavailable,
}

/// One dispatch worker. Run several against the same store to scale out;
/// they coordinate only through the store's row locking.
pub struct OutboxDispatchLoop {
    name: String,
    store: Arc<dyn OutboxStore>,
    dispatcher: Arc<dyn Dispatcher>,
    config: OutboxConfig,
    metrics: Arc<DispatchMetrics>,
    idle: IdleBackoff,
}

impl OutboxDispatchLoop {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn OutboxStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: OutboxConfig,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        let idle = IdleBackoff::new(config.poll_interval, config.max_idle_interval, config.jitter);
        Self {
            name: name.into(),
            store,
            dispatcher,
            config,
            metrics,
            idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn idle_backoff(&self) -> &IdleBackoff {
        &self.idle
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            worker = %self.name,
            max_attempts = self.config.max_attempts,
            mode = %self.config.mode,
            "outbox dispatcher started"
        );

        while !cancel.is_cancelled() {
            let outcome = self.poll_once().await;
            let delay = self.delay_after(&outcome);

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(worker = %self.name, "outbox dispatcher stopped");
    }

    /// Claim and settle at most one message.
    pub async fn poll_once(&mut self) -> PollOutcome {
        let message = match self.store.claim_next().await {
            Ok(Some(message)) => message,
            Ok(None) => return PollOutcome::Idle,
            Err(err) => return self.store_failure("claim", &err),
        };

        self.idle.reset();
        self.metrics.claimed.increment();
        debug!(
            worker = %self.name,
            message_id = %message.id,
            message_type = %message.message_type,
            attempt = message.attempt_count,
            "claimed outbox message"
        );

        let claim = message.claim_token();
        if message.attempts_exhausted(self.config.max_attempts) {
            return self.dead_letter(&message, &claim).await;
        }

        let outcome = self.dispatch(&message).await;
        if outcome.success {
            if let Err(err) = self.store.mark_sent(&claim).await {
                // Delivered but not recorded: the reaper will return the row
                // to Failed and it will be delivered again.
                return self.settle_failure("mark_sent", &message, &err);
            }
            self.metrics.sent.increment();
            debug!(
                worker = %self.name,
                message_id = %message.id,
                status = ?outcome.status,
                "outbox message sent"
            );
            PollOutcome::Sent(message.id)
        } else {
            let error_text = outcome.error_text();
            self.metrics.failed.increment();
            warn!(
                worker = %self.name,
                message_id = %message.id,
                message_type = %message.message_type,
                attempt = message.attempt_count,
                max_attempts = self.config.max_attempts,
                status = ?outcome.status,
                error = %error_text,
                "outbox dispatch failed"
            );
            if let Err(err) = self.store.mark_failed(&claim, &error_text).await {
                return self.settle_failure("mark_failed", &message, &err);
            }
            PollOutcome::Failed(message.id)
        }
    }

    async fn dead_letter(&self, message: &OutboxMessage, claim: &ClaimToken) -> PollOutcome {
        let reason = format!(
            "exceeded {} attempts (attempt {})",
            self.config.max_attempts, message.attempt_count
        );
        if let Err(err) = self.store.mark_dead_letter(claim, &reason).await {
            return self.settle_failure("mark_dead_letter", message, &err);
        }
        self.metrics.dead_lettered.increment();
        error!(
            worker = %self.name,
            message_id = %message.id,
            message_type = %message.message_type,
            aggregate_id = %message.aggregate_id,
            attempts = message.attempt_count,
            last_error = message.last_error.as_deref().unwrap_or(""),
            "outbox message dead-lettered"
        );
        PollOutcome::DeadLettered(message.id)
    }

    /// Run the dispatcher on its own task so a panic becomes a failed outcome.
    async fn dispatch(&self, message: &OutboxMessage) -> DispatchOutcome {
        let dispatcher = Arc::clone(&self.dispatcher);
        let destination = message.message_type.clone();
        let payload = message.payload.clone();
        let content_type = self.config.content_type.clone();

        self.metrics.in_flight.increment();
        let joined = tokio::spawn(async move { dispatcher.dispatch(&destination, &payload, &content_type).await }).await;
        self.metrics.in_flight.decrement();

        match joined {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => {
                DispatchOutcome::failed(format!("dispatcher panicked: {}", panic_message(err.into_panic().as_ref())))
            }
            Err(err) => DispatchOutcome::failed(format!("dispatch task aborted: {err}")),
        }
    }

    /// A settle that did not apply. Lost claims are expected after a reap and
    /// are not store failures.
    fn settle_failure(&self, operation: &str, message: &OutboxMessage, err: &OutboxStoreError) -> PollOutcome {
        if err.is_lost_claim() {
            self.metrics.claims_lost.increment();
            warn!(
                worker = %self.name,
                operation,
                message_id = %message.id,
                attempt = message.attempt_count,
                error = %err,
                "claim lost before settle; leaving message to its current owner"
            );
            return PollOutcome::ClaimLost(message.id);
        }
        error!(worker = %self.name, operation, message_id = %message.id, error = %err, "failed to settle message");
        self.store_failure(operation, err)
    }

    fn store_failure(&self, operation: &str, err: &OutboxStoreError) -> PollOutcome {
        self.metrics.store_errors.increment();
        match err {
            OutboxStoreError::SchemaMissing(_) => {
                warn!(
                    worker = %self.name,
                    operation,
                    error = %err,
                    backoff_secs = self.config.schema_missing_backoff.as_secs(),
                    "outbox table missing; waiting for migrations"
                );
                PollOutcome::SchemaMissing
            }
            _ => {
                warn!(worker = %self.name, operation, error = %err, "outbox store unavailable");
                PollOutcome::StoreUnavailable
            }
        }
    }

    /// How long to wait before the next poll.
    pub fn delay_after(&mut self, outcome: &PollOutcome) -> Duration {
        match outcome {
            PollOutcome::Sent(_) | PollOutcome::DeadLettered(_) | PollOutcome::ClaimLost(_) => Duration::ZERO,
            PollOutcome::Failed(_) => self.failure_delay(),
            PollOutcome::SchemaMissing => self.config.schema_missing_backoff,
            PollOutcome::Idle => {
                self.metrics.idle_polls.increment();
                self.idle.next_delay(rand::random::<f64>())
            }
            PollOutcome::StoreUnavailable => self.idle.next_delay(rand::random::<f64>()),
        }
    }

    fn failure_delay(&self) -> Duration {
        let lo = self.config.failure_delay_min.min(self.config.failure_delay_max);
        let hi = self.config.failure_delay_min.max(self.config.failure_delay_max);
        let millis = rand::thread_rng().gen_range(lo.as_millis()..=hi.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

impl std::fmt::Debug for OutboxDispatchLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxDispatchLoop")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("idle", &self.idle)
            .finish_non_exhaustive()
    }
}
