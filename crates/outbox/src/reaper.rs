//! Recovery of claims abandoned by crashed workers.
//!
//! A worker that dies between claim and settle leaves its row in
//! `Processing`, which no dispatch loop will ever claim again. The reaper
//! periodically returns such rows to `Failed` once their claim is older than
//! `claim_timeout`. The attempt that was counted at claim time stays counted,
//! so a message that keeps killing its worker still reaches `DeadLetter`.
//!
//! `claim_timeout` must comfortably exceed the longest dispatch (webhook
//! timeout included), or a slow but live delivery may be handed to a second
//! worker.

use std::sync::Arc;
use std::time::Duration;

use shopworks_observability::DispatchMetrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::store::{OutboxStore, OutboxStoreError};

pub struct StaleClaimReaper {
    store: Arc<dyn OutboxStore>,
    claim_timeout: Duration,
    interval: Duration,
    metrics: Arc<DispatchMetrics>,
}

impl StaleClaimReaper {
    pub fn new(store: Arc<dyn OutboxStore>, config: &OutboxConfig, metrics: Arc<DispatchMetrics>) -> Self {
        Self {
            store,
            claim_timeout: config.claim_timeout,
            interval: config.reap_interval,
            metrics,
        }
    }

    /// Reset every stale claim once. Returns how many rows were reset.
    pub async fn reap_once(&self) -> Result<u64, OutboxStoreError> {
        let reset = self.store.reset_stale_claims(self.claim_timeout).await?;
        self.metrics.reaped.add(reset);
        if reset > 0 {
            warn!(
                reset,
                claim_timeout_secs = self.claim_timeout.as_secs(),
                "returned stale outbox claims to failed"
            );
        } else {
            debug!("no stale outbox claims");
        }
        Ok(reset)
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Reap immediately (claims left by a previous process), then every `interval`.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            claim_timeout_secs = self.claim_timeout.as_secs(),
            "stale claim reaper started"
        );

        loop {
            if let Err(err) = self.reap_once().await {
                warn!(error = %err, "stale claim reap failed");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("stale claim reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shopworks_core::ManualClock;

    use super::*;
    use crate::message::{NewOutboxMessage, OutboxStatus};
    use crate::store::InMemoryOutboxStore;

    #[tokio::test]
    async fn only_claims_older_than_the_timeout_are_reset() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));
        let metrics = Arc::new(DispatchMetrics::default());
        let config = OutboxConfig::default().with_claim_timeout(Duration::from_secs(60));
        let reaper = StaleClaimReaper::new(store.clone(), &config, metrics.clone());

        let old = store
            .insert(NewOutboxMessage::new("a-1", "order.placed", b"{}".to_vec()))
            .await
            .unwrap();
        store.claim_next().await.unwrap().unwrap();

        clock.advance(Duration::from_secs(45));
        let fresh = store
            .insert(NewOutboxMessage::new("a-2", "order.placed", b"{}".to_vec()))
            .await
            .unwrap();
        store.claim_next().await.unwrap().unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(reaper.reap_once().await.unwrap(), 1);
        assert_eq!(metrics.reaped.get(), 1);

        let old = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, OutboxStatus::Failed);
        assert_eq!(old.attempt_count, 1);
        let fresh = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, OutboxStatus::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancellation() {
        let store = InMemoryOutboxStore::arc();
        let reaper = StaleClaimReaper::new(store, &OutboxConfig::default(), Arc::new(DispatchMetrics::default()));
        let cancel = CancellationToken::new();
        let handle = reaper.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
