use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use common::config::QueueConfig;

use crate::job::{EnqueueOptions, JobId, QueueError, QueueStats};
use crate::store::{JobStore, MemoryJobStore};

/// Retention bound for finished jobs: whichever of age or count is exceeded
/// first wins, oldest discarded first.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub max_age: Duration,
    pub max_count: usize,
}

/// Tuning for one queue instance. Defaults mirror the production
/// notification queue: 3 attempts, 2s exponential backoff base, stall checks
/// every 30s with at most one tolerated stall, completed jobs kept for an
/// hour, dead-letters for a day.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// How long an idle worker sleeps before re-polling the store.
    pub poll_interval: Duration,
    pub stalled_after: Duration,
    pub stall_check_interval: Duration,
    pub max_stalled_count: u32,
    pub keep_completed: Retention,
    pub keep_failed: Retention,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_attempts: 3,
            backoff_base: Duration::from_millis(2_000),
            poll_interval: Duration::from_millis(250),
            stalled_after: Duration::from_millis(30_000),
            stall_check_interval: Duration::from_millis(30_000),
            max_stalled_count: 1,
            keep_completed: Retention {
                max_age: Duration::from_secs(3_600),
                max_count: 1_000,
            },
            keep_failed: Retention {
                max_age: Duration::from_secs(24 * 3_600),
                max_count: 5_000,
            },
        }
    }
}

impl QueueSettings {
    /// Exponential backoff: the n-th retry (1-indexed attempts made so far)
    /// is delayed `backoff_base * 2^(n-1)`, so 2s, 4s, 8s with the defaults.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(24);
        self.backoff_base * 2u32.pow(exponent)
    }
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stalled_after: Duration::from_millis(config.stalled_after_ms),
            stall_check_interval: Duration::from_millis(config.stall_check_interval_ms),
            max_stalled_count: config.max_stalled_count,
            keep_completed: Retention {
                max_age: Duration::from_secs(config.keep_completed_age_secs),
                max_count: config.keep_completed_count,
            },
            keep_failed: Retention {
                max_age: Duration::from_secs(config.keep_failed_age_secs),
                max_count: config.keep_failed_count,
            },
        }
    }
}

/// Read side of a queue's counters, object-safe so the admin surface can
/// report heterogeneous queues together.
#[async_trait]
pub trait QueueStatsSource: Send + Sync {
    fn name(&self) -> &str;
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// A durable priority queue for one payload type.
///
/// Producers enqueue through this facade; [`crate::worker::WorkerPool`]
/// consumes through the underlying store. The payload is serialized at
/// enqueue time and immutable afterwards.
pub struct JobQueue<P> {
    name: String,
    settings: QueueSettings,
    store: Arc<dyn JobStore>,
    closed: AtomicBool,
    _payload: PhantomData<fn(P)>,
}

impl<P> JobQueue<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: &str, settings: QueueSettings) -> Self {
        Self::with_store(name, settings, Arc::new(MemoryJobStore::new()))
    }

    pub fn with_store(name: &str, settings: QueueSettings, store: Arc<dyn JobStore>) -> Self {
        Self {
            name: name.to_string(),
            settings,
            store,
            closed: AtomicBool::new(false),
            _payload: PhantomData,
        }
    }

    /// Admit a job. Fails only on payload serialization or when the queue is
    /// already closed.
    pub async fn enqueue(&self, payload: &P, options: EnqueueOptions) -> Result<JobId, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let value = serde_json::to_value(payload)?;
        let id = self
            .store
            .insert(
                value,
                options.priority.value(),
                self.settings.max_attempts,
                options.delay,
            )
            .await?;

        counter!("queue_jobs_enqueued_total", "queue" => self.name.clone()).increment(1);
        debug!(
            "enqueued job {} on '{}' queue (priority {})",
            id, self.name, options.priority
        );
        Ok(id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats().await
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl<P> QueueStatsSource for JobQueue<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let settings = QueueSettings::default();
        assert_eq!(settings.retry_delay(1), Duration::from_secs(2));
        assert_eq!(settings.retry_delay(2), Duration::from_secs(4));
        assert_eq!(settings.retry_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn settings_from_config_carry_tuning() {
        let config = QueueConfig {
            concurrency: 5,
            max_attempts: 4,
            backoff_base_ms: 100,
            ..QueueConfig::default()
        };
        let settings = QueueSettings::from(&config);
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.max_attempts, 4);
        assert_eq!(settings.backoff_base, Duration::from_millis(100));
        assert_eq!(settings.keep_failed.max_count, 5_000);
    }

    #[tokio::test]
    async fn enqueue_after_close_is_rejected() {
        let queue: JobQueue<serde_json::Value> =
            JobQueue::new("test", QueueSettings::default());
        queue.close();
        let err = queue
            .enqueue(&serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
