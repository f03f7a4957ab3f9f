//! `shopworks-outbox`: transactional outbox dispatch.
//!
//! Producers write an [`OutboxMessage`] in the same database transaction as
//! the state change it announces. One or more [`OutboxDispatchLoop`] workers
//! then claim rows one at a time (`FOR UPDATE SKIP LOCKED`), hand the payload
//! to a [`Dispatcher`] and record the outcome. Delivery is at-least-once:
//! consumers must be idempotent.
//!
//! The attempt counter is bumped in the claim transaction itself, before any
//! dispatch, so a crash mid-dispatch still consumes an attempt and a poison
//! message eventually lands in `DeadLetter`. Rows left in `Processing` by a
//! crashed worker are returned to `Failed` by the [`StaleClaimReaper`].

pub mod backoff;
pub mod config;
pub mod dispatch_loop;
pub mod dispatcher;
pub mod message;
pub mod reaper;
pub mod store;

pub use backoff::IdleBackoff;
pub use config::{DispatchMode, OutboxConfig, WebhookConfig};
pub use dispatch_loop::{OutboxDispatchLoop, PollOutcome};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherError, LogDispatcher, WebhookDispatcher, build_dispatcher};
pub use message::{ClaimToken, NewOutboxMessage, OutboxMessage, OutboxStatus};
pub use reaper::StaleClaimReaper;
pub use store::{InMemoryOutboxStore, OutboxStats, OutboxStore, OutboxStoreError, PostgresOutboxStore};
