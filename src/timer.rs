//! Background scheduler for maintenance and launch tasks

use crate::errors::{PoolError, PoolResult};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub type TimerTask = Arc<dyn Fn() + Send + Sync + 'static>;

/// Cancels a scheduled task. Dropping the handle leaves the task scheduled.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Scheduled {
    task: TimerTask,
    period: Option<Duration>,
    handle: TimerHandle,
}

enum Command {
    Schedule(Instant, Scheduled),
    Shutdown,
}

struct TimerShared {
    name: String,
    sender: Sender<Command>,
}

impl Drop for TimerShared {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

/// A named scheduler thread running one-shot and fixed-delay tasks.
///
/// Tasks run one at a time on the timer thread, so they should hand long
/// work off to a work thread. The thread exits when the last clone drops.
///
/// # Examples
///
/// ```
/// use courier_core::Timer;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
///
/// let timer = Timer::new("maintenance").unwrap();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&hits);
/// let handle = timer.schedule(Duration::ZERO, Arc::new(move || {
///     counter.fetch_add(1, Ordering::SeqCst);
/// }));
/// std::thread::sleep(Duration::from_millis(100));
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// assert!(!handle.is_cancelled());
/// ```
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    pub fn new(name: impl Into<String>) -> PoolResult<Self> {
        let name = name.into();
        let (sender, receiver) = channel::unbounded();
        let thread_name = name.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(&thread_name, receiver))
            .map_err(|e| PoolError::TaskFailed(format!("cannot spawn timer '{name}': {e}")))?;
        Ok(Self {
            shared: Arc::new(TimerShared { name, sender }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Run `task` once after `delay`.
    pub fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        self.submit(delay, None, task)
    }

    /// Run `task` after `delay`, then repeatedly `period` after each run ends.
    pub fn schedule_periodic(&self, delay: Duration, period: Duration, task: TimerTask) -> TimerHandle {
        self.submit(delay, Some(period), task)
    }

    fn submit(&self, delay: Duration, period: Option<Duration>, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let scheduled = Scheduled {
            task,
            period,
            handle: handle.clone(),
        };
        if self
            .shared
            .sender
            .send(Command::Schedule(Instant::now() + delay, scheduled))
            .is_err()
        {
            debug!(timer = %self.shared.name, "schedule on stopped timer");
            handle.cancel();
        }
        handle
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("name", &self.shared.name).finish()
    }
}

fn run_loop(name: &str, receiver: Receiver<Command>) {
    let mut queue: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut tasks: HashMap<u64, Scheduled> = HashMap::new();
    let mut seq = 0u64;

    loop {
        let received = match queue.peek() {
            Some(Reverse((due, _))) => receiver.recv_deadline(*due),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Command::Schedule(due, scheduled)) => {
                seq += 1;
                tasks.insert(seq, scheduled);
                queue.push(Reverse((due, seq)));
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while let Some(Reverse((due, id))) = queue.peek().copied() {
            if due > now {
                break;
            }
            queue.pop();
            let Some(scheduled) = tasks.remove(&id) else {
                continue;
            };
            if scheduled.handle.is_cancelled() {
                continue;
            }
            let task = Arc::clone(&scheduled.task);
            if panic::catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                error!(timer = %name, "timer task panicked");
            }
            if let Some(period) = scheduled.period
                && !scheduled.handle.is_cancelled()
            {
                tasks.insert(id, scheduled);
                queue.push(Reverse((Instant::now() + period, id)));
            }
        }
    }
    debug!(timer = %name, pending = tasks.len(), "timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_one_shot_runs_once() {
        let timer = Timer::new("test-timer").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        timer.schedule(Duration::from_millis(10), counter_task(&hits));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_until_cancelled() {
        let timer = Timer::new("test-timer").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = timer.schedule_periodic(Duration::ZERO, Duration::from_millis(10), counter_task(&hits));
        thread::sleep(Duration::from_millis(200));
        handle.cancel();
        thread::sleep(Duration::from_millis(50));
        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 3, "ran {seen} times");
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_cancel_before_due() {
        let timer = Timer::new("test-timer").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = timer.schedule(Duration::from_millis(50), counter_task(&hits));
        handle.cancel();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_task_does_not_stop_timer() {
        let timer = Timer::new("test-timer").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        timer.schedule(Duration::ZERO, Arc::new(|| panic!("boom")));
        timer.schedule(Duration::from_millis(20), counter_task(&hits));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
