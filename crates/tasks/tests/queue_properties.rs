//! Behavioural properties of the priority queue and its processor.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use shopworks_observability::QueueMetrics;
use shopworks_tasks::{
    Priority, PriorityTaskQueue, QueueError, QueueItem, TaskContext, TaskProcessor, TaskProcessorConfig,
    TaskQueueConfig,
};
use tokio_util::sync::CancellationToken;

fn noop(priority: Priority) -> QueueItem {
    QueueItem::new(|_ctx: TaskContext| async { anyhow::Ok(()) }).with_priority(priority)
}

fn queue_with_capacity(capacity: usize) -> Arc<PriorityTaskQueue> {
    Arc::new(PriorityTaskQueue::new(
        TaskQueueConfig::default().with_lane_capacity(capacity),
        Arc::new(QueueMetrics::default()),
    ))
}

#[tokio::test]
async fn normal_high_low_arrivals_dequeue_as_high_normal_low() {
    let queue = queue_with_capacity(1000);
    let normal = queue.enqueue(noop(Priority::Normal)).await.unwrap();
    let high = queue.enqueue(noop(Priority::High)).await.unwrap();
    let low = queue.enqueue(noop(Priority::Low)).await.unwrap();

    let cancel = CancellationToken::new();
    let order: Vec<_> = vec![
        queue.dequeue(&cancel).await.unwrap().id(),
        queue.dequeue(&cancel).await.unwrap().id(),
        queue.dequeue(&cancel).await.unwrap().id(),
    ];
    assert_eq!(order, vec![high, normal, low]);
}

#[tokio::test]
async fn high_items_jump_a_full_low_backlog() {
    let queue = queue_with_capacity(1000);
    for _ in 0..1000 {
        queue.enqueue(noop(Priority::Low)).await.unwrap();
    }
    let mut high = HashSet::new();
    for _ in 0..3 {
        high.insert(queue.enqueue(noop(Priority::High)).await.unwrap());
    }
    assert_eq!(queue.queue_lengths().low, 1000);

    let cancel = CancellationToken::new();
    for _ in 0..3 {
        let item = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(item.priority(), Priority::High);
        assert!(high.remove(&item.id()));
    }
    assert!(high.is_empty());
    assert_eq!(queue.dequeue(&cancel).await.unwrap().priority(), Priority::Low);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overflowing_a_lane_loses_nothing_with_a_slow_consumer() {
    const CAPACITY: usize = 8;
    const EXTRA: usize = 40;

    let queue = queue_with_capacity(CAPACITY);

    let producer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut ids = Vec::with_capacity(CAPACITY + EXTRA);
            for _ in 0..CAPACITY + EXTRA {
                ids.push(queue.enqueue(noop(Priority::Normal)).await.unwrap());
            }
            ids
        })
    };

    let cancel = CancellationToken::new();
    let mut seen = Vec::with_capacity(CAPACITY + EXTRA);
    while seen.len() < CAPACITY + EXTRA {
        let item = tokio::time::timeout(Duration::from_secs(10), queue.dequeue(&cancel))
            .await
            .expect("consumer stalled")
            .unwrap();
        seen.push(item.id());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let produced = producer.await.unwrap();
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "an item was observed twice");
    assert_eq!(seen, produced, "single-lane FIFO order must be preserved");
    assert_eq!(queue.queue_lengths().total(), 0);
}

#[tokio::test]
async fn processor_drains_until_cancelled() {
    let queue = queue_with_capacity(100);
    let executed = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let executed = Arc::clone(&executed);
        let item = QueueItem::new(move |_ctx: TaskContext| {
            let executed = Arc::clone(&executed);
            async move {
                executed.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });
        queue.enqueue(item).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let handle = TaskProcessor::new(Arc::clone(&queue), TaskProcessorConfig::default()).spawn(cancel.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while executed.load(Ordering::SeqCst) < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("processor did not drain the queue");

    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(queue.metrics().completed.get(), 10);

    // New work is still accepted after the processor stops; it simply waits.
    queue.enqueue(noop(Priority::Low)).await.unwrap();
    assert_eq!(queue.queue_lengths().low, 1);
}

#[tokio::test]
async fn retries_stay_in_priority_order() {
    let queue = queue_with_capacity(10);
    let processor = TaskProcessor::new(Arc::clone(&queue), TaskProcessorConfig::default());
    let cancel = CancellationToken::new();

    let failing = QueueItem::new(|_ctx: TaskContext| async { Err::<(), _>(anyhow::anyhow!("nope")) })
        .with_priority(Priority::Low)
        .with_max_retries(1);
    queue.enqueue(failing).await.unwrap();
    let first = queue.dequeue(&cancel).await.unwrap();
    processor.process(first, &cancel).await;

    let high = queue.enqueue(noop(Priority::High)).await.unwrap();
    assert_eq!(queue.dequeue(&cancel).await.unwrap().id(), high);
    assert_eq!(queue.dequeue(&cancel).await.unwrap().priority(), Priority::Low);
}

#[tokio::test]
async fn closed_queue_stops_the_processor_once_drained() {
    let queue = queue_with_capacity(10);
    queue.enqueue(noop(Priority::Normal)).await.unwrap();
    queue.close();

    let processor = TaskProcessor::new(Arc::clone(&queue), TaskProcessorConfig::default());
    tokio::time::timeout(Duration::from_secs(5), processor.run(CancellationToken::new()))
        .await
        .expect("processor should exit on a closed, drained queue");

    assert_eq!(queue.metrics().completed.get(), 1);
    assert_eq!(
        queue.enqueue(noop(Priority::Normal)).await.unwrap_err(),
        QueueError::Closed
    );
}
