//! Running tasks asynchronously on pooled work threads

use crate::errors::{PoolError, PoolResult};
use crate::work_thread::{Task, ThreadPool};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Something able to run a task asynchronously.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task) -> PoolResult<()>;
}

/// Executor borrowing an idle thread from a [`ThreadPool`] per task.
///
/// # Examples
///
/// ```
/// use courier_core::{thread_pool, PoolConfiguration, PoolExecutor};
/// use std::time::Duration;
///
/// let executor = PoolExecutor::new(thread_pool("exec", PoolConfiguration::default()).unwrap());
/// let done = executor.sync_exec(Box::new(|| {}), Some(Duration::from_secs(1))).unwrap();
/// assert!(done);
/// ```
#[derive(Clone)]
pub struct PoolExecutor {
    threads: ThreadPool,
}

impl PoolExecutor {
    pub fn new(threads: ThreadPool) -> Self {
        Self { threads }
    }

    pub fn threads(&self) -> &ThreadPool {
        &self.threads
    }

    /// Run `task` and return; the thread goes back to the pool when it ends.
    pub fn exec(&self, task: Task) -> PoolResult<()> {
        let thread = self.threads.get_object()?;
        let worker = (*thread).clone();
        worker.launch_work(task, Some(Box::new(move || drop(thread))))
    }

    /// Run `task`; if it is still running after `timeout` the thread is
    /// stopped and removed from the pool.
    pub fn exec_with_timeout(&self, task: Task, timeout: Duration) -> PoolResult<()> {
        let thread = self.threads.get_object()?;
        let worker = (*thread).clone();
        worker.launch_work(task, None)?;

        thread::Builder::new()
            .name(format!("{}-watchdog", worker.name()))
            .spawn(move || {
                if worker.wait_idle(Some(timeout)) {
                    drop(thread);
                } else {
                    warn!(thread = %worker, ?timeout, "task exceeded its timeout");
                    worker.stop_request();
                    thread.release_and_remove();
                }
            })
            .map(|_| ())
            .map_err(|e| PoolError::TaskFailed(format!("cannot spawn watchdog: {e}")))
    }

    /// Run `task` and wait up to `timeout` for it; returns whether it finished.
    ///
    /// A task that misses the deadline keeps its thread, which leaves the pool.
    pub fn sync_exec(&self, task: Task, timeout: Option<Duration>) -> PoolResult<bool> {
        let thread = self.threads.get_object()?;
        let finished = thread.launch_work_and_wait(task, timeout)?;
        if !finished {
            debug!(thread = %*thread, "synchronous task timed out");
            thread.stop_request();
            thread.release_and_remove();
        }
        Ok(finished)
    }
}

impl Executor for PoolExecutor {
    fn execute(&self, task: Task) -> PoolResult<()> {
        self.exec(task)
    }
}
