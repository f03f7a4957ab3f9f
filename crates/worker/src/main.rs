//! Background worker: outbox dispatch loops, the stale-claim reaper and the
//! in-process task processor, all tied to one shutdown token.

mod settings;

use std::sync::Arc;

use anyhow::Context;
use shopworks_observability::{DispatchMetrics, LogFormat, QueueMetrics};
use shopworks_outbox::{
    OutboxDispatchLoop, OutboxStore, PostgresOutboxStore, StaleClaimReaper, build_dispatcher,
};
use shopworks_tasks::{PriorityTaskQueue, Priority, QueueItem, TaskContext, TaskProcessor};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::settings::WorkerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shopworks_observability::init_with(LogFormat::from_env());

    let settings = WorkerSettings::from_env().context("invalid worker configuration")?;

    if let Some(listen) = settings.metrics_listen {
        shopworks_observability::install_prometheus(listen).context("failed to start metrics exporter")?;
        tracing::info!(%listen, "metrics listening on /metrics");
    }

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to database")?;
    let pg_store = PostgresOutboxStore::new(pool);
    if settings.bootstrap_schema {
        pg_store.ensure_schema().await.context("failed to create outbox schema")?;
    }
    let store: Arc<dyn OutboxStore> = Arc::new(pg_store);

    let dispatcher = build_dispatcher(settings.outbox.mode, &settings.webhook)
        .context("failed to build dispatcher")?;
    let dispatch_metrics = Arc::new(DispatchMetrics::default());
    let queue_metrics = Arc::new(QueueMetrics::default());
    let queue = Arc::new(PriorityTaskQueue::new(settings.queue.clone(), queue_metrics.clone()));

    let cancel = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    for i in 0..settings.outbox_workers {
        let dispatch_loop = OutboxDispatchLoop::new(
            format!("outbox-{i}"),
            store.clone(),
            dispatcher.clone(),
            settings.outbox.clone(),
            dispatch_metrics.clone(),
        );
        handles.push(dispatch_loop.spawn(cancel.clone()));
    }
    handles.push(StaleClaimReaper::new(store.clone(), &settings.outbox, dispatch_metrics.clone()).spawn(cancel.clone()));
    handles.push(TaskProcessor::new(queue.clone(), settings.processor.clone()).spawn(cancel.clone()));
    handles.push(spawn_stats_ticker(
        &settings,
        queue.clone(),
        store.clone(),
        dispatch_metrics.clone(),
        cancel.clone(),
    ));

    tracing::info!(
        outbox_workers = settings.outbox_workers,
        mode = %settings.outbox.mode,
        "worker started"
    );

    shutdown_signal().await;
    tracing::info!("shutdown requested");

    queue.close();
    cancel.cancel();
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "worker task ended abnormally");
        }
    }

    tracing::info!(
        queue = %serde_json::to_string(&queue_metrics.snapshot())?,
        outbox = %serde_json::to_string(&dispatch_metrics.snapshot())?,
        "worker stopped"
    );
    Ok(())
}

/// Periodically enqueue a low-priority task that logs outbox and queue health.
fn spawn_stats_ticker(
    settings: &WorkerSettings,
    queue: Arc<PriorityTaskQueue>,
    store: Arc<dyn OutboxStore>,
    metrics: Arc<DispatchMetrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = settings.stats_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let store = store.clone();
            let metrics = metrics.clone();
            let stats_queue = queue.clone();
            let item = QueueItem::new(move |_ctx: TaskContext| {
                let store = store.clone();
                let metrics = metrics.clone();
                let stats_queue = stats_queue.clone();
                async move {
                    let counts = store.counts_by_status().await?;
                    metrics.backlog.set(i64::try_from(counts.backlog()).unwrap_or(i64::MAX));
                    metrics.dead_letters.set(i64::try_from(counts.dead_letter).unwrap_or(i64::MAX));
                    tracing::info!(
                        outbox_backlog = counts.backlog(),
                        outbox_dead_letter = counts.dead_letter,
                        dispatch = ?metrics.snapshot(),
                        queue_lengths = ?stats_queue.queue_lengths(),
                        task_failures = stats_queue.failure_count(),
                        "worker stats"
                    );
                    Ok::<(), anyhow::Error>(())
                }
            })
            .with_priority(Priority::Low)
            .with_max_retries(1);

            if let Err(err) = queue.enqueue(item).await {
                tracing::debug!(error = %err, "stats task not enqueued");
                break;
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
