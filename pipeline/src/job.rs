use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;
use tokio::time::Instant;

pub type JobId = i64;

/// A job is in exactly one of these states at a time.
///
/// Waiting -> Active -> Completed
/// Waiting -> Active -> Delayed -> Waiting (until max_attempts)
/// Waiting -> Active -> Failed (dead-letter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// Named priority bands. Higher dequeues first, FIFO within a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn value(self) -> i32 {
        match self {
            Priority::High => 10,
            Priority::Normal => 5,
            Priority::Low => 1,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Deferred visibility: the job stays in Delayed until the delay elapses.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            delay: None,
        }
    }

    pub fn delayed(priority: Priority, delay: Duration) -> Self {
        Self {
            priority,
            delay: Some(delay),
        }
    }
}

/// Job metadata plus its serialized payload.
///
/// The payload is immutable once enqueued and `attempts` only increases.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub state: JobState,
    /// Attempts made so far, including the current one while Active.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Insertion order, the FIFO tiebreak within a priority band.
    pub seq: u64,
    /// When a Delayed job becomes eligible again.
    pub run_at: Option<Instant>,
    /// When the current attempt was claimed; used for stall detection.
    pub claimed_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub stalled_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-queue counts by state, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to serialize job payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("queue is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bands_match_reference_values() {
        assert_eq!(Priority::High.value(), 10);
        assert_eq!(Priority::Normal.value(), 5);
        assert_eq!(Priority::Low.value(), 1);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn job_state_display_is_lowercase() {
        assert_eq!(JobState::Waiting.to_string(), "waiting");
        assert_eq!(JobState::Failed.to_string(), "failed");
    }
}
