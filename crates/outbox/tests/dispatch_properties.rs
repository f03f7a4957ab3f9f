//! Delivery guarantees of the dispatch loop over the in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shopworks_core::{ManualClock, MessageId};
use shopworks_observability::DispatchMetrics;
use shopworks_outbox::{
    DispatchOutcome, Dispatcher, InMemoryOutboxStore, NewOutboxMessage, OutboxConfig, OutboxDispatchLoop,
    OutboxStatus, OutboxStore, PollOutcome, StaleClaimReaper,
};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

/// Records every destination it is asked to deliver to.
#[derive(Default)]
struct Recording {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Dispatcher for Recording {
    async fn dispatch(&self, destination: &str, _payload: &[u8], _content_type: &str) -> DispatchOutcome {
        self.calls.lock().unwrap().push(destination.to_string());
        DispatchOutcome::delivered(Some(200))
    }
}

struct AlwaysFails;

#[async_trait]
impl Dispatcher for AlwaysFails {
    async fn dispatch(&self, _: &str, _: &[u8], _: &str) -> DispatchOutcome {
        DispatchOutcome::rejected(500, "internal server error")
    }
}

struct Panics;

#[async_trait]
impl Dispatcher for Panics {
    async fn dispatch(&self, _: &str, _: &[u8], _: &str) -> DispatchOutcome {
        panic!("serializer exploded")
    }
}

fn fast_config() -> OutboxConfig {
    OutboxConfig::default()
        .with_poll_interval(Duration::from_millis(5), Duration::from_millis(20))
        .with_failure_delay(Duration::from_millis(1), Duration::from_millis(2))
}

fn worker(name: &str, store: Arc<InMemoryOutboxStore>, dispatcher: Arc<dyn Dispatcher>, config: OutboxConfig) -> OutboxDispatchLoop {
    OutboxDispatchLoop::new(name, store, dispatcher, config, Arc::new(DispatchMetrics::default()))
}

fn message(n: usize) -> NewOutboxMessage {
    NewOutboxMessage::new(format!("order-{n}"), format!("order.{n}"), b"{}".to_vec())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_hand_a_single_row_to_exactly_one_worker() {
    const WORKERS: usize = 8;

    for _ in 0..20 {
        let store = InMemoryOutboxStore::arc();
        let row = store.insert(message(0)).await.unwrap();
        let barrier = Arc::new(Barrier::new(WORKERS));

        let mut handles = Vec::new();
        for _ in 0..WORKERS {
            let store = store.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store.claim_next().await.unwrap()
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(claimed) = handle.await.unwrap() {
                winners.push(claimed);
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].id, row.id);
        assert_eq!(winners[0].attempt_count, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_dispatch_each_message_once() {
    const MESSAGES: usize = 50;

    let store = InMemoryOutboxStore::arc();
    for n in 0..MESSAGES {
        store.insert(message(n)).await.unwrap();
    }

    let dispatcher = Arc::new(Recording::default());
    let cancel = CancellationToken::new();
    let handles: Vec<_> = (0..4)
        .map(|i| worker(&format!("outbox-{i}"), store.clone(), dispatcher.clone(), fast_config()).spawn(cancel.clone()))
        .collect();

    tokio::time::timeout(Duration::from_secs(10), async {
        while store.counts_by_status().await.unwrap().sent < MESSAGES as u64 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workers did not drain the outbox");

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    let calls = dispatcher.calls.lock().unwrap().clone();
    let mut per_destination: HashMap<String, usize> = HashMap::new();
    for destination in calls {
        *per_destination.entry(destination).or_default() += 1;
    }
    assert_eq!(per_destination.len(), MESSAGES);
    assert!(per_destination.values().all(|&n| n == 1));
}

#[tokio::test]
async fn always_failing_message_dead_letters_exactly_past_max_attempts() {
    const MAX_ATTEMPTS: u32 = 3;

    let store = InMemoryOutboxStore::arc();
    let row = store.insert(message(1)).await.unwrap();
    let mut worker = worker(
        "outbox-0",
        store.clone(),
        Arc::new(AlwaysFails),
        fast_config().with_max_attempts(MAX_ATTEMPTS),
    );

    for attempt in 1..=MAX_ATTEMPTS {
        assert_eq!(worker.poll_once().await, PollOutcome::Failed(row.id));
        let stored = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed, "dead-lettered early at attempt {attempt}");
        assert_eq!(stored.attempt_count, attempt);
    }

    assert_eq!(worker.poll_once().await, PollOutcome::DeadLettered(row.id));
    let stored = store.get(row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::DeadLetter);
    assert_eq!(stored.attempt_count, MAX_ATTEMPTS + 1);

    // Terminal: never claimed again.
    assert_eq!(worker.poll_once().await, PollOutcome::Idle);
    assert_eq!(store.get(row.id).await.unwrap().unwrap().attempt_count, MAX_ATTEMPTS + 1);
}

#[tokio::test]
async fn panicking_dispatcher_still_counts_exactly_one_attempt_per_claim() {
    let store = InMemoryOutboxStore::arc();
    let row = store.insert(message(1)).await.unwrap();
    let mut worker = worker("outbox-0", store.clone(), Arc::new(Panics), fast_config());

    let mut previous = 0;
    for _ in 0..3 {
        assert_eq!(worker.poll_once().await, PollOutcome::Failed(row.id));
        let stored = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, previous + 1);
        assert!(stored.last_error.unwrap().contains("serializer exploded"));
        previous = stored.attempt_count;
    }
}

#[tokio::test]
async fn store_outage_does_not_consume_attempts() {
    let store = InMemoryOutboxStore::arc();
    let row = store.insert(message(1)).await.unwrap();
    let mut worker = worker("outbox-0", store.clone(), Arc::new(Recording::default()), fast_config());

    store.set_unavailable(true);
    for _ in 0..3 {
        assert_eq!(worker.poll_once().await, PollOutcome::StoreUnavailable);
    }
    store.set_unavailable(false);

    assert_eq!(worker.poll_once().await, PollOutcome::Sent(row.id));
    assert_eq!(store.get(row.id).await.unwrap().unwrap().attempt_count, 1);
}

#[tokio::test]
async fn idle_delays_are_monotonic_bounded_and_reset_by_a_claim() {
    let config = OutboxConfig::default().with_poll_interval(Duration::from_secs(3), Duration::from_secs(60));
    let store = InMemoryOutboxStore::arc();
    let mut worker = worker("outbox-0", store.clone(), Arc::new(Recording::default()), config);

    let mut previous = Duration::ZERO;
    for _ in 0..12 {
        let outcome = worker.poll_once().await;
        assert_eq!(outcome, PollOutcome::Idle);
        let delay = worker.delay_after(&outcome);
        assert!(delay >= previous, "{delay:?} < {previous:?}");
        assert!(delay <= Duration::from_secs(60));
        previous = delay;
    }
    assert_eq!(previous, Duration::from_secs(60));

    store.insert(message(1)).await.unwrap();
    assert!(matches!(worker.poll_once().await, PollOutcome::Sent(_)));
    assert_eq!(worker.idle_backoff().current(), Duration::from_secs(3));

    let next_idle = worker.delay_after(&PollOutcome::Idle);
    assert!(next_idle >= Duration::from_secs(3) && next_idle <= Duration::from_millis(3750));
}

#[tokio::test(start_paused = true)]
async fn loop_waits_out_a_missing_schema_then_delivers() {
    let store = Arc::new(InMemoryOutboxStore::without_schema());
    let dispatcher = Arc::new(Recording::default());
    let metrics = Arc::new(DispatchMetrics::default());
    let cancel = CancellationToken::new();

    let handle = OutboxDispatchLoop::new("outbox-0", store.clone(), dispatcher.clone(), fast_config(), metrics.clone())
        .spawn(cancel.clone());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(metrics.store_errors.get(), 1, "should be sleeping out the 30s backoff");

    store.create_schema();
    store.insert(message(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(25)).await;

    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(dispatcher.calls.lock().unwrap().len(), 1);
    assert_eq!(metrics.sent.get(), 1);
}

#[tokio::test]
async fn crashed_claim_is_recovered_by_the_reaper_and_redelivered() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));
    let row = store.insert(message(1)).await.unwrap();

    // A worker claims the row and dies before settling it.
    let abandoned = store.claim_next().await.unwrap().unwrap();
    assert_eq!(abandoned.status, OutboxStatus::Processing);

    let metrics = Arc::new(DispatchMetrics::default());
    let config = fast_config().with_claim_timeout(Duration::from_secs(300));
    let reaper = StaleClaimReaper::new(store.clone(), &config, metrics.clone());
    let mut survivor = worker("outbox-1", store.clone(), Arc::new(Recording::default()), config);

    assert_eq!(survivor.poll_once().await, PollOutcome::Idle);
    assert_eq!(reaper.reap_once().await.unwrap(), 0);

    clock.advance(Duration::from_secs(301));
    assert_eq!(reaper.reap_once().await.unwrap(), 1);

    assert_eq!(survivor.poll_once().await, PollOutcome::Sent(row.id));
    let stored = store.get(row.id).await.unwrap().unwrap();
    assert_eq!(stored.attempt_count, 2);
    assert_eq!(stored.status, OutboxStatus::Sent);
}

#[tokio::test]
async fn requeued_dead_letter_gets_a_fresh_budget() {
    let store = InMemoryOutboxStore::arc();
    let row = store.insert(message(1)).await.unwrap();
    let mut failing = worker("outbox-0", store.clone(), Arc::new(AlwaysFails), fast_config().with_max_attempts(1));

    assert_eq!(failing.poll_once().await, PollOutcome::Failed(row.id));
    assert_eq!(failing.poll_once().await, PollOutcome::DeadLettered(row.id));
    assert_eq!(store.list_dead_letters(10).await.unwrap()[0].id, row.id);

    store.requeue_dead_letter(row.id).await.unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    struct Counting(Arc<AtomicUsize>);
    #[async_trait]
    impl Dispatcher for Counting {
        async fn dispatch(&self, _: &str, _: &[u8], _: &str) -> DispatchOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            DispatchOutcome::delivered(Some(204))
        }
    }
    let mut healthy = worker("outbox-1", store.clone(), Arc::new(Counting(delivered.clone())), fast_config());
    assert_eq!(healthy.poll_once().await, PollOutcome::Sent(row.id));
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(store.get(row.id).await.unwrap().unwrap().attempt_count, 1);
}

#[tokio::test]
async fn claim_order_follows_occurred_on() {
    let store = InMemoryOutboxStore::arc();
    let now = Utc::now();
    let mut expected = Vec::new();
    for n in (0..5).rev() {
        let row = store
            .insert(message(n).with_occurred_on(now - chrono::Duration::seconds(n as i64)))
            .await
            .unwrap();
        expected.push(row.id);
    }

    let mut worker = worker("outbox-0", store.clone(), Arc::new(Recording::default()), fast_config());
    let mut sent: Vec<MessageId> = Vec::new();
    while let PollOutcome::Sent(id) = worker.poll_once().await {
        sent.push(id);
    }
    assert_eq!(sent, expected);
}
