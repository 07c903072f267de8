//! Persistent worker threads with a single-slot task handoff

use crate::config::PoolConfiguration;
use crate::errors::{BoxError, PoolError, PoolResult};
use crate::factory::ObjectFactory;
use crate::pool::ObjectPool;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub type Task = Box<dyn FnOnce() + Send + 'static>;
pub type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

const HANGING_LOG_CAPACITY: usize = 100;

#[derive(Default)]
struct Slot {
    task: Option<Task>,
    on_done: Option<DoneCallback>,
    busy: bool,
    started_at: Option<Instant>,
    stop: bool,
    alive: bool,
}

struct Shared {
    name: String,
    slot: Mutex<Slot>,
    cond: Condvar,
}

/// A persistent worker executing at most one task at a time.
///
/// There is no queue: assigning work to a busy thread is a programming error
/// and panics. Callers wanting queueing borrow idle threads from a
/// [`ThreadPool`].
///
/// # Examples
///
/// ```
/// use courier_core::WorkThread;
/// use std::time::Duration;
///
/// let worker = WorkThread::spawn("worker").unwrap();
/// let finished = worker
///     .launch_work_and_wait(Box::new(|| println!("hello")), Some(Duration::from_secs(1)))
///     .unwrap();
/// assert!(finished);
/// assert!(worker.close(Some(Duration::from_secs(1))));
/// ```
#[derive(Clone)]
pub struct WorkThread {
    shared: Arc<Shared>,
}

impl WorkThread {
    /// Start a new named worker thread.
    pub fn spawn(name: impl Into<String>) -> PoolResult<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            slot: Mutex::new(Slot {
                alive: true,
                ..Slot::default()
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(&worker))
            .map_err(|e| PoolError::TaskFailed(format!("cannot spawn thread '{name}': {e}")))?;
        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Assign `task` to this idle thread and return immediately.
    ///
    /// `on_done` runs on the worker right after the slot is cleared, so it may
    /// hand the thread back to a pool; it must not block.
    ///
    /// # Panics
    ///
    /// If a task is already assigned.
    pub fn launch_work(&self, task: Task, on_done: Option<DoneCallback>) -> PoolResult<()> {
        let mut slot = self.shared.slot.lock();
        if slot.busy {
            panic!(
                "thread {self} is trying to launch new work while old one has not been completed"
            );
        }
        if slot.stop || !slot.alive {
            return Err(PoolError::ThreadStopped(self.shared.name.clone()));
        }
        slot.task = Some(task);
        slot.on_done = on_done;
        slot.busy = true;
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Assign `task` and wait up to `timeout` (`None` waits forever).
    ///
    /// Returns whether the task finished; `false` means it may still be
    /// running and the thread must be treated as possibly stuck.
    pub fn launch_work_and_wait(&self, task: Task, timeout: Option<Duration>) -> PoolResult<bool> {
        self.launch_work(task, None)?;
        Ok(self.wait_idle(timeout))
    }

    /// Wait until no task is assigned or the thread has died.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.shared.slot.lock();
        while slot.busy && slot.alive {
            match deadline {
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                None => self.shared.cond.wait(&mut slot),
            }
        }
        !slot.busy
    }

    /// Ask the run loop to exit after the current task.
    pub fn stop_request(&self) {
        let mut slot = self.shared.slot.lock();
        slot.stop = true;
        self.shared.cond.notify_all();
    }

    /// Stop the thread, waiting up to `timeout` for the current task.
    pub fn close(&self, timeout: Option<Duration>) -> bool {
        self.stop_request();
        self.wait_idle(timeout)
    }

    /// Stop gracefully or record the thread in the global hanging thread log.
    pub fn close_or_dump(&self, timeout: Option<Duration>) -> bool {
        self.close_or_dump_into(HangingThreadLog::global(), timeout)
    }

    /// Like `close_or_dump`, recording a stuck thread in `log` instead of the global log.
    pub fn close_or_dump_into(&self, log: &HangingThreadLog, timeout: Option<Duration>) -> bool {
        let closed = self.close(timeout);
        if !closed {
            warn!(thread = %self.shared.name, "work thread did not stop in time, abandoning it");
            log.record(self.to_string());
        }
        closed
    }

    /// Whether the thread accepts work: running and not asked to stop.
    pub fn is_active(&self) -> bool {
        let slot = self.shared.slot.lock();
        slot.alive && !slot.stop
    }

    pub fn is_alive(&self) -> bool {
        self.shared.slot.lock().alive
    }

    /// Whether a task is running right now
    pub fn is_busy(&self) -> bool {
        self.shared.slot.lock().busy
    }

    /// Replace the completion callback of the running task.
    pub fn set_done_callback(&self, on_done: DoneCallback) -> bool {
        let mut slot = self.shared.slot.lock();
        if !slot.busy {
            return false;
        }
        slot.on_done = Some(on_done);
        true
    }

    /// How long the current task has been running.
    pub fn current_task_age(&self) -> Option<Duration> {
        self.shared.slot.lock().started_at.map(|t| t.elapsed())
    }
}

impl fmt::Display for WorkThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, age) = match self.shared.slot.try_lock() {
            Some(slot) => {
                let state = if !slot.alive {
                    "terminated"
                } else if slot.stop {
                    "stopping"
                } else if slot.busy {
                    "running"
                } else {
                    "idle"
                };
                (state, slot.started_at.map(|t| t.elapsed()))
            }
            None => ("locked", None),
        };
        write!(f, "'{}'; state = {}", self.shared.name, state)?;
        if let Some(age) = age {
            write!(f, "; work running for {age:?}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for WorkThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkThread({self})")
    }
}

fn run(shared: &Shared) {
    loop {
        let task = {
            let mut slot = shared.slot.lock();
            while slot.task.is_none() && !slot.stop {
                shared.cond.wait(&mut slot);
            }
            if slot.stop {
                break;
            }
            slot.started_at = Some(Instant::now());
            slot.task.take()
        };
        let Some(task) = task else { continue };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(thread = %shared.name, "work panicked");
        }

        let on_done = {
            let mut slot = shared.slot.lock();
            slot.busy = false;
            slot.started_at = None;
            shared.cond.notify_all();
            slot.on_done.take()
        };
        if let Some(on_done) = on_done
            && panic::catch_unwind(AssertUnwindSafe(on_done)).is_err()
        {
            error!(thread = %shared.name, "completion callback panicked");
        }
    }

    let mut slot = shared.slot.lock();
    slot.stop = true;
    slot.alive = false;
    slot.busy = false;
    slot.task = None;
    slot.on_done = None;
    shared.cond.notify_all();
    debug!(thread = %shared.name, "work thread exited");
}

/// Ring buffer of abandoned ("hung") work thread descriptions
///
/// # Examples
///
/// ```
/// use courier_core::HangingThreadLog;
///
/// let log = HangingThreadLog::new();
/// log.record("'worker-1'; state = running".to_string());
/// assert_eq!(log.snapshot().len(), 1);
/// assert_eq!(log.discarded_count(), 0);
/// ```
pub struct HangingThreadLog {
    inner: Mutex<HangingState>,
}

#[derive(Default)]
struct HangingState {
    entries: VecDeque<String>,
    discarded: usize,
}

impl HangingThreadLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HangingState::default()),
        }
    }

    /// Process-wide log used by [`WorkThread::close_or_dump`].
    pub fn global() -> &'static HangingThreadLog {
        static LOG: OnceLock<HangingThreadLog> = OnceLock::new();
        LOG.get_or_init(HangingThreadLog::new)
    }

    pub fn record(&self, info: String) {
        let mut state = self.inner.lock();
        if state.entries.len() >= HANGING_LOG_CAPACITY {
            state.entries.pop_front();
            state.discarded += 1;
        }
        state.entries.push_back(info);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    pub fn discarded_count(&self) -> usize {
        self.inner.lock().discarded
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.entries.clear();
        state.discarded = 0;
    }
}

impl Default for HangingThreadLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool factory of named work threads (`desc-1`, `desc-2`, ...)
pub struct WorkThreadFactory {
    desc: String,
    next_id: AtomicUsize,
    close_timeout: Duration,
}

impl WorkThreadFactory {
    pub fn new(desc: impl Into<String>) -> Self {
        Self {
            desc: desc.into(),
            next_id: AtomicUsize::new(1),
            close_timeout: Duration::from_millis(5),
        }
    }

    /// Grace period given to a thread being removed from the pool.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

impl ObjectFactory for WorkThreadFactory {
    type Object = WorkThread;

    fn allocate(&self) -> Result<WorkThread, BoxError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(WorkThread::spawn(format!("{}-{}", self.desc, id))?)
    }

    fn deallocate(&self, thread: WorkThread) {
        thread.close_or_dump(Some(self.close_timeout));
    }

    fn check(&self, thread: &WorkThread) -> Result<bool, BoxError> {
        Ok(thread.is_active() && !thread.is_busy())
    }

    fn released(&self, thread: &WorkThread) -> bool {
        thread.is_active()
    }
}

/// Pool of idle work threads
pub type ThreadPool = ObjectPool<WorkThreadFactory>;

/// Create and start a thread pool named `desc`.
pub fn thread_pool(desc: &str, config: PoolConfiguration) -> PoolResult<ThreadPool> {
    let pool = ObjectPool::new(desc, WorkThreadFactory::new(desc), config)?;
    pool.start()?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    #[test]
    fn test_launch_and_wait() {
        let worker = WorkThread::spawn("t").unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        let finished = worker
            .launch_work_and_wait(Box::new(move || f.store(true, Ordering::SeqCst)), Some(Duration::from_secs(2)))
            .unwrap();
        assert!(finished);
        assert!(flag.load(Ordering::SeqCst));
        assert!(!worker.is_busy());
        assert!(worker.is_active());
    }

    #[test]
    fn test_wait_times_out_on_slow_task() {
        let worker = WorkThread::spawn("slow").unwrap();
        let finished = worker
            .launch_work_and_wait(Box::new(|| thread::sleep(Duration::from_millis(300))), Some(Duration::from_millis(20)))
            .unwrap();
        assert!(!finished);
        assert!(worker.is_busy());
        assert!(worker.wait_idle(Some(Duration::from_secs(2))));
    }

    #[test]
    #[should_panic(expected = "trying to launch new work")]
    fn test_busy_thread_rejects_second_task() {
        let worker = WorkThread::spawn("busy").unwrap();
        worker
            .launch_work(Box::new(|| thread::sleep(Duration::from_millis(200))), None)
            .unwrap();
        let _ = worker.launch_work(Box::new(|| {}), None);
    }

    #[test]
    fn test_done_callback_sees_idle_thread() {
        let worker = WorkThread::spawn("cb").unwrap();
        let (tx, rx) = mpsc::channel();
        let observer = worker.clone();
        worker
            .launch_work(
                Box::new(|| {}),
                Some(Box::new(move || {
                    tx.send(observer.is_busy()).unwrap();
                })),
            )
            .unwrap();
        let busy_in_callback = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!busy_in_callback);
    }

    #[test]
    fn test_panicking_task_keeps_thread_alive() {
        let worker = WorkThread::spawn("panic").unwrap();
        let finished = worker
            .launch_work_and_wait(Box::new(|| panic!("boom")), Some(Duration::from_secs(2)))
            .unwrap();
        assert!(finished);
        assert!(worker.is_active());
    }

    #[test]
    fn test_stopped_thread_rejects_work() {
        let worker = WorkThread::spawn("stopped").unwrap();
        assert!(worker.close(Some(Duration::from_secs(1))));
        thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_active());
        assert!(matches!(
            worker.launch_work(Box::new(|| {}), None),
            Err(PoolError::ThreadStopped(_))
        ));
    }

    #[test]
    fn test_close_or_dump_records_hung_thread() {
        let log = HangingThreadLog::new();
        let worker = WorkThread::spawn("hung").unwrap();
        worker
            .launch_work(Box::new(|| thread::sleep(Duration::from_millis(300))), None)
            .unwrap();
        assert!(!worker.close_or_dump_into(&log, Some(Duration::from_millis(10))));
        let entries = log.snapshot();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("hung"));
    }

    #[test]
    fn test_hanging_log_ring_buffer() {
        let log = HangingThreadLog::new();
        for i in 0..105 {
            log.record(format!("thread-{i}"));
        }
        let entries = log.snapshot();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries[0], "thread-5");
        assert_eq!(log.discarded_count(), 5);
        log.clear();
        assert!(log.snapshot().is_empty());
    }
}
