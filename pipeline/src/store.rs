use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::job::{JobId, JobRecord, JobState, QueueError, QueueStats};
use crate::queue::Retention;

/// Result of a stalled-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallSweep {
    pub requeued: usize,
    pub failed: usize,
}

/// The queue's own store: the single synchronization point for job state
/// transitions. Every transition goes through one lock so concurrent workers
/// can never claim the same job (claim-before-process).
///
/// This port is the seam for a durable implementation; job state lives here,
/// separate from domain entities.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(
        &self,
        payload: serde_json::Value,
        priority: i32,
        max_attempts: u32,
        delay: Option<Duration>,
    ) -> Result<JobId, QueueError>;

    /// Claim the highest-priority, earliest-enqueued eligible job, marking it
    /// Active and counting the attempt. Returns None when nothing is eligible.
    async fn claim_next(&self) -> Result<Option<JobRecord>, QueueError>;

    async fn mark_completed(&self, id: JobId) -> Result<(), QueueError>;

    /// Park a failed attempt for retry; the job becomes Waiting again once
    /// the delay elapses.
    async fn mark_delayed(&self, id: JobId, delay: Duration, error: String)
        -> Result<(), QueueError>;

    /// Dead-letter the job. Never retried automatically.
    async fn mark_failed(&self, id: JobId, error: String) -> Result<(), QueueError>;

    /// Requeue Active jobs whose claim is older than `stalled_after`; a job
    /// stalled more than `max_stalled_count` times is forced to Failed.
    async fn reclaim_stalled(
        &self,
        stalled_after: Duration,
        max_stalled_count: u32,
    ) -> Result<StallSweep, QueueError>;

    /// Discard finished jobs past the retention bounds, oldest first.
    async fn prune(
        &self,
        keep_completed: &Retention,
        keep_failed: &Retention,
    ) -> Result<usize, QueueError>;

    async fn active_count(&self) -> Result<usize, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError>;
}

/// Ready-queue entry: max-heap popping the highest priority first and the
/// lowest sequence first within a band.
#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    id: JobId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Delayed-queue entry: reversed ordering so the heap pops the earliest
/// eligibility time first.
#[derive(Debug, PartialEq, Eq)]
struct DelayedEntry {
    run_at: Instant,
    id: JobId,
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.run_at.cmp(&self.run_at)
    }
}

struct StoreState {
    jobs: HashMap<JobId, JobRecord>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    /// Finished jobs in completion order, for oldest-first retention pruning.
    completed_order: VecDeque<JobId>,
    failed_order: VecDeque<JobId>,
    next_id: JobId,
    next_seq: u64,
}

impl StoreState {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            ready: BinaryHeap::new(),
            delayed: BinaryHeap::new(),
            completed_order: VecDeque::new(),
            failed_order: VecDeque::new(),
            next_id: 1,
            next_seq: 1,
        }
    }

    /// Move delayed jobs whose time has come back to the ready queue.
    fn promote_delayed(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.run_at > now {
                break;
            }
            let entry = self.delayed.pop().expect("peeked entry");
            if let Some(job) = self.jobs.get_mut(&entry.id) {
                if job.state == JobState::Delayed {
                    job.state = JobState::Waiting;
                    job.run_at = None;
                    self.ready.push(ReadyEntry {
                        priority: job.priority,
                        seq: job.seq,
                        id: job.id,
                    });
                }
            }
        }
    }

    fn push_ready(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get(&id) {
            self.ready.push(ReadyEntry {
                priority: job.priority,
                seq: job.seq,
                id,
            });
        }
    }

    fn prune_finished(
        order: &mut VecDeque<JobId>,
        jobs: &mut HashMap<JobId, JobRecord>,
        retention: &Retention,
        now: Instant,
    ) -> usize {
        let mut removed = 0;

        while order.len() > retention.max_count {
            if let Some(id) = order.pop_front() {
                jobs.remove(&id);
                removed += 1;
            }
        }

        while let Some(&id) = order.front() {
            let expired = jobs
                .get(&id)
                .and_then(|job| job.finished_at)
                .map(|at| now.duration_since(at) > retention.max_age)
                .unwrap_or(true);
            if !expired {
                break;
            }
            order.pop_front();
            jobs.remove(&id);
            removed += 1;
        }

        removed
    }
}

/// In-process implementation of [`JobStore`].
///
/// State transitions are serialized by the inner mutex; the lock is never
/// held across an await point.
pub struct MemoryJobStore {
    state: Mutex<StoreState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("job store lock poisoned")
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(
        &self,
        payload: serde_json::Value,
        priority: i32,
        max_attempts: u32,
        delay: Option<Duration>,
    ) -> Result<JobId, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();

        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;

        let (job_state, run_at) = match delay {
            Some(delay) if !delay.is_zero() => (JobState::Delayed, Some(now + delay)),
            _ => (JobState::Waiting, None),
        };

        let record = JobRecord {
            id,
            payload,
            priority,
            state: job_state,
            attempts: 0,
            max_attempts,
            seq,
            run_at,
            claimed_at: None,
            finished_at: None,
            stalled_count: 0,
            last_error: None,
            created_at: Utc::now(),
        };
        state.jobs.insert(id, record);

        match job_state {
            JobState::Delayed => state.delayed.push(DelayedEntry {
                run_at: run_at.expect("delayed job has run_at"),
                id,
            }),
            _ => state.push_ready(id),
        }

        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<JobRecord>, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.promote_delayed(now);

        while let Some(entry) = state.ready.pop() {
            // Entries can go stale when a job moved state after being queued;
            // the record is the source of truth.
            let claimable = state
                .jobs
                .get(&entry.id)
                .map(|job| job.state == JobState::Waiting)
                .unwrap_or(false);
            if !claimable {
                continue;
            }
            let job = state.jobs.get_mut(&entry.id).expect("job checked above");
            job.state = JobState::Active;
            job.attempts += 1;
            job.claimed_at = Some(now);
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn mark_completed(&self, id: JobId) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.state = JobState::Completed;
        job.claimed_at = None;
        job.finished_at = Some(now);
        state.completed_order.push_back(id);
        Ok(())
    }

    async fn mark_delayed(
        &self,
        id: JobId,
        delay: Duration,
        error: String,
    ) -> Result<(), QueueError> {
        let run_at = Instant::now() + delay;
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.state = JobState::Delayed;
        job.claimed_at = None;
        job.run_at = Some(run_at);
        job.last_error = Some(error);
        state.delayed.push(DelayedEntry { run_at, id });
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, error: String) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.state = JobState::Failed;
        job.claimed_at = None;
        job.finished_at = Some(now);
        job.last_error = Some(error);
        state.failed_order.push_back(id);
        Ok(())
    }

    async fn reclaim_stalled(
        &self,
        stalled_after: Duration,
        max_stalled_count: u32,
    ) -> Result<StallSweep, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();

        let stalled: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Active
                    && job
                        .claimed_at
                        .map(|at| now.duration_since(at) > stalled_after)
                        .unwrap_or(false)
            })
            .map(|job| job.id)
            .collect();

        let mut sweep = StallSweep::default();
        for id in stalled {
            let job = state.jobs.get_mut(&id).expect("job listed above");
            job.stalled_count += 1;
            job.claimed_at = None;
            if job.stalled_count > max_stalled_count {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.last_error = Some("job stalled too many times".to_string());
                state.failed_order.push_back(id);
                sweep.failed += 1;
            } else {
                job.state = JobState::Waiting;
                state.push_ready(id);
                sweep.requeued += 1;
            }
        }

        Ok(sweep)
    }

    async fn prune(
        &self,
        keep_completed: &Retention,
        keep_failed: &Retention,
    ) -> Result<usize, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        let state = &mut *state;
        let mut removed = StoreState::prune_finished(
            &mut state.completed_order,
            &mut state.jobs,
            keep_completed,
            now,
        );
        removed += StoreState::prune_finished(
            &mut state.failed_order,
            &mut state.jobs,
            keep_failed,
            now,
        );
        Ok(removed)
    }

    async fn active_count(&self) -> Result<usize, QueueError> {
        let state = self.lock();
        Ok(state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Active)
            .count())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.lock();
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Delayed => stats.delayed += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let state = self.lock();
        Ok(state.jobs.get(&id).cloned())
    }
}
