use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

type TaskFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledTask {
    name: String,
    interval: Duration,
    run: TaskFn,
}

/// Registry of named periodic tasks.
///
/// Components expose plain async methods and stay unaware of scheduling; the
/// binary registers them here with their intervals. Runs of the same task
/// are serialized: a tick that lands while the previous run is still going
/// is delayed, never overlapped.
pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn every<F, Fut>(&mut self, name: &str, interval: Duration, task: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(ScheduledTask {
            name: name.to_string(),
            interval,
            run: Box::new(move || task().boxed()),
        });
        self
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.tasks.len());

        for task in self.tasks {
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(task.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // interval fires immediately; periodic tasks wait a full
                // period before their first run.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            debug!("running scheduled task '{}'", task.name);
                            (task.run)().await;
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("scheduled task '{}' stopped", task.name);
            }));
        }

        info!("scheduler started with {} task(s)", handles.len());
        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks: handles,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop ticking. A task mid-run finishes its current iteration.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn tasks_run_on_their_interval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);

        let mut scheduler = Scheduler::new();
        scheduler.every("count", Duration::from_secs(60), move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });
        let handle = scheduler.start();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        handle.shutdown().await;
        let settled = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(runs.load(Ordering::SeqCst), settled);
    }
}
