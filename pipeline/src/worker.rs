use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
#[cfg(not(test))]
use tracing::{debug, info, warn};
#[cfg(test)]
use {println as debug, println as info, println as warn};

use crate::job::{JobId, JobRecord};
use crate::queue::{JobQueue, QueueSettings};
use crate::store::JobStore;

/// What the handler decided about a job. The worker, not handler control
/// flow, owns the retry-vs-terminal policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Transient failure: retried with exponential backoff until the attempt
    /// budget runs out, then dead-lettered.
    Retry(String),
    /// Permanent failure: dead-lettered immediately, remaining attempts
    /// notwithstanding.
    Fail(String),
}

/// A claimed job handed to a handler.
#[derive(Debug, Clone)]
pub struct ActiveJob<P> {
    pub id: JobId,
    /// 1-based attempt number for this execution.
    pub attempt: u32,
    pub payload: P,
}

#[async_trait]
pub trait JobHandler<P>: Send + Sync + 'static {
    async fn handle(&self, job: &ActiveJob<P>) -> JobOutcome;
}

/// Spawns the bounded worker pool for a queue: `concurrency` claim loops
/// plus one maintenance loop (stalled reclaim, retention pruning).
pub struct WorkerPool;

impl WorkerPool {
    pub fn start<P>(queue: &JobQueue<P>, handler: Arc<dyn JobHandler<P>>) -> WorkerHandle
    where
        P: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let settings = queue.settings().clone();
        let store = queue.store();
        let name = queue.name().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::with_capacity(settings.concurrency + 1);
        for _ in 0..settings.concurrency.max(1) {
            tasks.push(tokio::spawn(worker_loop::<P>(
                name.clone(),
                Arc::clone(&store),
                settings.clone(),
                Arc::clone(&handler),
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(maintenance_loop(
            name.clone(),
            Arc::clone(&store),
            settings.clone(),
            shutdown_rx,
        )));

        info!(
            "started {} workers for '{}' queue",
            settings.concurrency.max(1),
            name
        );

        WorkerHandle {
            name,
            store,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Running pool for one queue. Dropping the handle without closing leaves
/// the workers running until their shutdown signal errors out.
pub struct WorkerHandle {
    name: String,
    store: Arc<dyn JobStore>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop claiming new jobs; in-flight jobs keep running.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn active_count(&self) -> usize {
        self.store.active_count().await.unwrap_or(0)
    }

    /// Wait up to `timeout` for in-flight jobs to finish. Returns whether
    /// the queue drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.active_count().await == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tear the pool down. Jobs still in flight are abandoned, not failed;
    /// only a durable store re-surfacing them as stalled would recover them.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn worker_loop<P>(
    queue: String,
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
    handler: Arc<dyn JobHandler<P>>,
    mut shutdown: watch::Receiver<bool>,
) where
    P: DeserializeOwned + Send + Sync + 'static,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = match store.claim_next().await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("claim failed on '{}' queue: {}", queue, e);
                None
            }
        };

        match claimed {
            Some(record) => {
                run_job(&queue, &store, &settings, handler.as_ref(), record).await;
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(settings.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("worker on '{}' queue stopped", queue);
}

async fn run_job<P>(
    queue: &str,
    store: &Arc<dyn JobStore>,
    settings: &QueueSettings,
    handler: &dyn JobHandler<P>,
    record: JobRecord,
) where
    P: DeserializeOwned + Send + Sync + 'static,
{
    let started = Instant::now();

    let payload = match serde_json::from_value::<P>(record.payload.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(
                "dead-lettering job {} on '{}' queue: undecodable payload: {}",
                record.id, queue, e
            );
            finalize(store, record.id, queue, "failed", async {
                store
                    .mark_failed(record.id, format!("payload decode error: {}", e))
                    .await
            })
            .await;
            return;
        }
    };

    let job = ActiveJob {
        id: record.id,
        attempt: record.attempts,
        payload,
    };
    debug!(
        "processing job {} on '{}' queue (attempt {}/{})",
        job.id, queue, record.attempts, record.max_attempts
    );

    // A panicking handler must not take the worker down with it.
    let outcome = AssertUnwindSafe(handler.handle(&job))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| JobOutcome::Retry("handler panicked".to_string()));

    histogram!("queue_job_duration_seconds", "queue" => queue.to_string())
        .record(started.elapsed().as_secs_f64());

    match outcome {
        JobOutcome::Completed => {
            finalize(store, job.id, queue, "completed", store.mark_completed(job.id)).await;
        }
        JobOutcome::Retry(reason) => {
            if record.attempts < record.max_attempts {
                let delay = settings.retry_delay(record.attempts);
                info!(
                    "retrying job {} on '{}' queue in {:?} (attempt {}/{}): {}",
                    job.id, queue, delay, record.attempts, record.max_attempts, reason
                );
                finalize(
                    store,
                    job.id,
                    queue,
                    "retried",
                    store.mark_delayed(job.id, delay, reason),
                )
                .await;
            } else {
                warn!(
                    "dead-lettering job {} on '{}' queue after {} attempts: {}",
                    job.id, queue, record.attempts, reason
                );
                finalize(store, job.id, queue, "failed", store.mark_failed(job.id, reason)).await;
            }
        }
        JobOutcome::Fail(reason) => {
            warn!(
                "dead-lettering job {} on '{}' queue (permanent): {}",
                job.id, queue, reason
            );
            finalize(store, job.id, queue, "failed", store.mark_failed(job.id, reason)).await;
        }
    }
}

async fn finalize<F>(_store: &Arc<dyn JobStore>, id: JobId, queue: &str, result: &str, op: F)
where
    F: std::future::Future<Output = Result<(), crate::job::QueueError>>,
{
    counter!("queue_jobs_processed_total", "queue" => queue.to_string(), "result" => result.to_string())
        .increment(1);
    if let Err(e) = op.await {
        warn!("failed to finalize job {} on '{}' queue: {}", id, queue, e);
    }
}

async fn maintenance_loop(
    queue: String,
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(settings.stall_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store
                    .reclaim_stalled(settings.stalled_after, settings.max_stalled_count)
                    .await
                {
                    Ok(sweep) if sweep.requeued > 0 || sweep.failed > 0 => {
                        warn!(
                            "stalled jobs on '{}' queue: {} requeued, {} forced failed",
                            queue, sweep.requeued, sweep.failed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("stall sweep failed on '{}' queue: {}", queue, e),
                }

                if let Err(e) = store
                    .prune(&settings.keep_completed, &settings.keep_failed)
                    .await
                {
                    warn!("retention pruning failed on '{}' queue: {}", queue, e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
