use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use common::config::ShutdownConfig;

use crate::worker::WorkerHandle;

/// Coordinates graceful drain of every queue on shutdown.
///
/// Each queue in sequence: stop claiming, read the in-flight count, wait up
/// to the per-queue grace (further bounded by the overall deadline), then
/// close regardless. Jobs that do not finish in time are abandoned - not
/// failed, not retried - and would only come back if a durable job store
/// re-surfaced them as stalled on the next start.
pub struct QueueLifecycle {
    queues: Vec<WorkerHandle>,
    job_grace: Duration,
    total_grace: Duration,
}

impl QueueLifecycle {
    pub fn new(job_grace: Duration, total_grace: Duration) -> Self {
        Self {
            queues: Vec::new(),
            job_grace,
            total_grace,
        }
    }

    pub fn from_config(config: &ShutdownConfig) -> Self {
        Self::new(
            Duration::from_millis(config.job_grace_ms),
            Duration::from_millis(config.total_grace_ms),
        )
    }

    pub fn register(&mut self, handle: WorkerHandle) -> &mut Self {
        self.queues.push(handle);
        self
    }

    pub async fn shutdown(self) {
        info!("closing {} queue(s)...", self.queues.len());
        let started = Instant::now();
        let deadline = started + self.total_grace;

        for queue in self.queues {
            queue.begin_shutdown();

            let active = queue.active_count().await;
            if active > 0 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let grace = remaining.min(self.job_grace);
                info!(
                    "waiting up to {:?} for {} active job(s) in '{}' queue",
                    grace,
                    active,
                    queue.name()
                );
                if !queue.wait_idle(grace).await {
                    warn!(
                        "grace elapsed, abandoning {} in-flight job(s) in '{}' queue",
                        queue.active_count().await,
                        queue.name()
                    );
                }
            }

            let name = queue.name().to_string();
            queue.close().await;
            info!("queue '{}' closed", name);
        }

        info!("all queues closed in {:?}", started.elapsed());
    }
}
