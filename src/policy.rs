//! Execute policies: where a pool runs its factory calls

use crate::errors::{PoolError, PoolResult};
use crate::pool::PooledObject;
use crate::work_thread::{Task, ThreadPool, WorkThreadFactory};
use crossbeam::channel;
use std::time::Duration;
use tracing::{debug, warn};

/// Factory operation run through an [`ExecPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Allocate,
    Deallocate,
    Check,
}

/// Strategy a pool uses to run allocate/deallocate/check.
///
/// Maintenance passes (`start`, `shrink`, `check`, `close`) open a batch so a
/// policy can hold on to per-batch state, such as a pinned work thread,
/// instead of setting it up for every call.
pub trait ExecPolicy: Send + Sync + 'static {
    type Batch: Send;

    fn begin_batch(&self) -> Self::Batch;

    fn end_batch(&self, batch: Self::Batch);

    fn run<R, W>(&self, batch: Option<&mut Self::Batch>, op: Operation, work: W) -> PoolResult<R>
    where
        R: Send + 'static,
        W: FnOnce() -> R + Send + 'static;
}

/// Runs factory calls inline on the caller's thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncPolicy;

impl ExecPolicy for SyncPolicy {
    type Batch = ();

    fn begin_batch(&self) {}

    fn end_batch(&self, _batch: ()) {}

    fn run<R, W>(&self, _batch: Option<&mut ()>, _op: Operation, work: W) -> PoolResult<R>
    where
        R: Send + 'static,
        W: FnOnce() -> R + Send + 'static,
    {
        Ok(work())
    }
}

/// Runs factory calls on a borrowed work thread, bounded by a timeout.
///
/// A missed deadline becomes [`PoolError::Timeout`] and the borrowed thread
/// is stopped and removed from its pool, since it may be stuck.
pub struct AsyncPolicy {
    threads: ThreadPool,
    allocate_timeout: Option<Duration>,
    check_timeout: Option<Duration>,
}

impl AsyncPolicy {
    pub fn new(
        threads: ThreadPool,
        allocate_timeout: Option<Duration>,
        check_timeout: Option<Duration>,
    ) -> Self {
        Self {
            threads,
            allocate_timeout,
            check_timeout,
        }
    }

    pub fn threads(&self) -> &ThreadPool {
        &self.threads
    }

    fn timeout(&self, op: Operation) -> Option<Duration> {
        match op {
            Operation::Check => self.check_timeout,
            Operation::Allocate | Operation::Deallocate => self.allocate_timeout,
        }
    }

    fn timed_out(&self, op: Operation, timeout: Option<Duration>, thread: &str) -> PoolError {
        let timeout = timeout.unwrap_or_default();
        warn!(?op, ?timeout, %thread, "timeout expired on work thread");
        PoolError::Timeout(timeout)
    }
}

fn collect<R>(rx: channel::Receiver<R>, op: Operation) -> PoolResult<R> {
    rx.try_recv()
        .map_err(|_| PoolError::TaskFailed(format!("{op:?} operation panicked")))
}

impl ExecPolicy for AsyncPolicy {
    type Batch = Option<PooledObject<WorkThreadFactory>>;

    fn begin_batch(&self) -> Self::Batch {
        match self.threads.get_object() {
            Ok(thread) => Some(thread),
            Err(e) => {
                debug!(error = %e, "no thread pinned for batch");
                None
            }
        }
    }

    fn end_batch(&self, batch: Self::Batch) {
        drop(batch);
    }

    fn run<R, W>(&self, batch: Option<&mut Self::Batch>, op: Operation, work: W) -> PoolResult<R>
    where
        R: Send + 'static,
        W: FnOnce() -> R + Send + 'static,
    {
        let timeout = self.timeout(op);
        let (tx, rx) = channel::bounded(1);
        let task: Task = Box::new(move || {
            let _ = tx.send(work());
        });

        if let Some(pinned) = batch
            && let Some(thread) = pinned.as_ref()
        {
            return match thread.launch_work_and_wait(task, timeout) {
                Ok(true) => collect(rx, op),
                Ok(false) => {
                    let err = self.timed_out(op, timeout, thread.name());
                    thread.stop_request();
                    if let Some(thread) = pinned.take() {
                        thread.release_and_remove();
                    }
                    Err(err)
                }
                Err(e) => {
                    if let Some(thread) = pinned.take() {
                        thread.release_and_remove();
                    }
                    Err(e)
                }
            };
        }

        let thread = self.threads.get_object()?;
        match thread.launch_work_and_wait(task, timeout) {
            Ok(true) => {
                drop(thread);
                collect(rx, op)
            }
            Ok(false) => {
                let err = self.timed_out(op, timeout, thread.name());
                thread.stop_request();
                thread.release_and_remove();
                Err(err)
            }
            Err(e) => {
                thread.release_and_remove();
                Err(e)
            }
        }
    }
}
