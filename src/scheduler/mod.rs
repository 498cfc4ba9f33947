use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Result;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
}

/// Trait for background tasks that run periodically on their own OS
/// thread. The hot path never waits on these threads; they observe the
/// scheduler's stop signal between iterations.
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute one iteration of the task
    fn execute(&self, ctx: Context) -> Result<()>;
}

/// Shared stop signal. Workers sleep on the condvar so shutdown wakes
/// them immediately instead of waiting out the interval; the join is
/// bounded by one poll period.
struct Shutdown {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl Shutdown {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Sleep until the interval elapses or shutdown is signalled.
    /// Returns true when the worker should exit.
    fn wait(&self, interval: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap();
        let (stopped, _) = self
            .cv
            .wait_timeout_while(stopped, interval, |stopped| !*stopped)
            .unwrap();
        *stopped
    }

    fn signal(&self) {
        *self.stopped.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Shutdown>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.workers.lock().unwrap().push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let shutdown = Arc::clone(&self.shutdown);
        let mut run_id = 0u64;

        std::thread::Builder::new()
            .name(task.name().to_string())
            .spawn(move || loop {
                if shutdown.wait(interval) {
                    tracing::info!(task = task.name(), "Task shutting down");
                    break;
                }
                run_id += 1;
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                };

                if let Err(e) = task.execute(ctx) {
                    tracing::error!(
                        task = task.name(),
                        error = %e,
                        "Task execution failed"
                    );
                }
            })
            .expect("failed to spawn background task")
    }

    /// Graceful shutdown - signal all tasks and wait for them
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.signal();
        for worker in self.workers.lock().unwrap().drain(..) {
            worker
                .join()
                .map_err(|_| crate::Error::IO("background task panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
