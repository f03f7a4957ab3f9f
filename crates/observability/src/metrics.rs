//! Counters and gauges shared between workers.
//!
//! Every instrument is registered with the global `metrics` recorder under a
//! `shopworks_*` name, so whatever exporter the binary installs (Prometheus in
//! `shopworks-worker`) sees it. Each one also keeps a local value so tests and
//! shutdown logs can read it without a recorder. Without an installed
//! recorder the `metrics` handles are no-ops.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use metrics::{counter, describe_counter, describe_gauge, gauge};
use serde::Serialize;

/// Lane labels, indexed like the task queue's lanes.
pub const LANES: [&str; 3] = ["high", "normal", "low"];

/// Monotonic counter.
pub struct Counter {
    value: AtomicU64,
    handle: metrics::Counter,
}

impl Counter {
    fn registered(handle: metrics::Counter) -> Self {
        Self {
            value: AtomicU64::new(0),
            handle,
        }
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
        self.handle.increment(n);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    /// A counter that is not exported.
    fn default() -> Self {
        Self::registered(metrics::Counter::noop())
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Value that moves up and down (e.g. in-flight work).
pub struct Gauge {
    value: AtomicI64,
    handle: metrics::Gauge,
}

impl Gauge {
    fn registered(handle: metrics::Gauge) -> Self {
        Self {
            value: AtomicI64::new(0),
            handle,
        }
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
        self.handle.increment(1.0);
    }

    pub fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
        self.handle.decrement(1.0);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
        self.handle.set(value as f64);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    /// A gauge that is not exported.
    fn default() -> Self {
        Self::registered(metrics::Gauge::noop())
    }
}

impl std::fmt::Debug for Gauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Gauge").field(&self.get()).finish()
    }
}

/// Register help text for every `shopworks_*` metric. Call once after the
/// recorder is installed.
pub fn describe() {
    describe_counter!("shopworks_tasks_enqueued_total", "Tasks accepted by the priority queue");
    describe_counter!("shopworks_tasks_completed_total", "Task executions that succeeded");
    describe_counter!("shopworks_tasks_retried_total", "Failed task executions put back on their lane");
    describe_counter!("shopworks_tasks_failed_total", "Tasks dropped after exhausting their retries");
    describe_counter!("shopworks_tasks_interrupted_total", "Tasks that failed during shutdown");
    describe_gauge!("shopworks_tasks_running", "Task actions executing right now");
    describe_gauge!("shopworks_tasks_queue_depth", "Items waiting per priority lane");

    describe_counter!("shopworks_outbox_claimed_total", "Outbox messages claimed by a dispatch worker");
    describe_counter!("shopworks_outbox_sent_total", "Outbox messages delivered");
    describe_counter!("shopworks_outbox_failed_total", "Outbox delivery attempts that failed");
    describe_counter!("shopworks_outbox_dead_lettered_total", "Outbox messages moved to dead letter");
    describe_counter!("shopworks_outbox_idle_polls_total", "Polls that found nothing to claim");
    describe_counter!("shopworks_outbox_store_errors_total", "Outbox store calls that failed");
    describe_counter!("shopworks_outbox_claims_lost_total", "Settles rejected because the claim had moved on");
    describe_counter!("shopworks_outbox_reaped_total", "Stale claims returned to failed");
    describe_gauge!("shopworks_outbox_in_flight", "Dispatches in progress");
    describe_gauge!("shopworks_outbox_backlog", "Pending and failed outbox messages");
    describe_gauge!("shopworks_outbox_dead_letters", "Outbox messages in dead letter");
}

/// Counters for the priority task queue and its processing loop.
///
/// `failed` is the queue's global failure count: tasks dropped after their
/// retry budget ran out.
#[derive(Debug)]
pub struct QueueMetrics {
    pub enqueued: Counter,
    pub completed: Counter,
    pub retried: Counter,
    pub failed: Counter,
    pub interrupted: Counter,
    pub running: Gauge,
    /// Items waiting per lane, in [`LANES`] order.
    pub lane_depth: [Gauge; 3],
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self {
            enqueued: Counter::registered(counter!("shopworks_tasks_enqueued_total")),
            completed: Counter::registered(counter!("shopworks_tasks_completed_total")),
            retried: Counter::registered(counter!("shopworks_tasks_retried_total")),
            failed: Counter::registered(counter!("shopworks_tasks_failed_total")),
            interrupted: Counter::registered(counter!("shopworks_tasks_interrupted_total")),
            running: Gauge::registered(gauge!("shopworks_tasks_running")),
            lane_depth: LANES.map(|lane| Gauge::registered(gauge!("shopworks_tasks_queue_depth", "priority" => lane))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueMetricsSnapshot {
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub interrupted: u64,
    pub running: i64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            enqueued: self.enqueued.get(),
            completed: self.completed.get(),
            retried: self.retried.get(),
            failed: self.failed.get(),
            interrupted: self.interrupted.get(),
            running: self.running.get(),
        }
    }
}

/// Counters for outbox dispatch workers and the stale-claim reaper.
#[derive(Debug)]
pub struct DispatchMetrics {
    pub claimed: Counter,
    pub sent: Counter,
    pub failed: Counter,
    pub dead_lettered: Counter,
    pub idle_polls: Counter,
    pub store_errors: Counter,
    /// Settles refused because the row was reclaimed after a stale claim.
    pub claims_lost: Counter,
    pub reaped: Counter,
    pub in_flight: Gauge,
    /// `Pending + Failed` rows, refreshed by the worker's stats task.
    pub backlog: Gauge,
    pub dead_letters: Gauge,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self {
            claimed: Counter::registered(counter!("shopworks_outbox_claimed_total")),
            sent: Counter::registered(counter!("shopworks_outbox_sent_total")),
            failed: Counter::registered(counter!("shopworks_outbox_failed_total")),
            dead_lettered: Counter::registered(counter!("shopworks_outbox_dead_lettered_total")),
            idle_polls: Counter::registered(counter!("shopworks_outbox_idle_polls_total")),
            store_errors: Counter::registered(counter!("shopworks_outbox_store_errors_total")),
            claims_lost: Counter::registered(counter!("shopworks_outbox_claims_lost_total")),
            reaped: Counter::registered(counter!("shopworks_outbox_reaped_total")),
            in_flight: Gauge::registered(gauge!("shopworks_outbox_in_flight")),
            backlog: Gauge::registered(gauge!("shopworks_outbox_backlog")),
            dead_letters: Gauge::registered(gauge!("shopworks_outbox_dead_letters")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchMetricsSnapshot {
    pub claimed: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub idle_polls: u64,
    pub store_errors: u64,
    pub claims_lost: u64,
    pub reaped: u64,
    pub in_flight: i64,
    pub backlog: i64,
    pub dead_letters: i64,
}

impl DispatchMetrics {
    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            claimed: self.claimed.get(),
            sent: self.sent.get(),
            failed: self.failed.get(),
            dead_lettered: self.dead_lettered.get(),
            idle_polls: self.idle_polls.get(),
            store_errors: self.store_errors.get(),
            claims_lost: self.claims_lost.get(),
            reaped: self.reaped.get(),
            in_flight: self.in_flight.get(),
            backlog: self.backlog.get(),
            dead_letters: self.dead_letters.get(),
        }
    }
}
