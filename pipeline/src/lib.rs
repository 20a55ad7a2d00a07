pub mod job;
pub mod lifecycle;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use job::{EnqueueOptions, JobId, JobRecord, JobState, Priority, QueueError, QueueStats};
pub use lifecycle::QueueLifecycle;
pub use queue::{JobQueue, QueueSettings, QueueStatsSource, Retention};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use store::{JobStore, MemoryJobStore};
pub use worker::{ActiveJob, JobHandler, JobOutcome, WorkerHandle, WorkerPool};
