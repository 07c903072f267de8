//! Producer-side buffer drained in batches by pooled workers

use crate::config::BufferConfig;
use crate::errors::{BoxError, PoolError, PoolResult};
use crate::executor::Executor;
use crate::timer::{Timer, TimerHandle, TimerTask};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Consumer of the batches drained from an [`AsyncBuffer`]
pub trait Receiver<E>: Send + Sync + 'static {
    /// Handle one batch; an error is logged and the worker moves on.
    fn handle_data(&self, part: Vec<E>) -> Result<(), BoxError>;

    /// Called once when the buffer closes.
    fn close(&self) {}
}

type Weigher<E> = Box<dyn Fn(&E) -> usize + Send + Sync + 'static>;
type CloseListener = Box<dyn FnOnce() + Send + 'static>;

struct BufferState<E> {
    data: VecDeque<E>,
    active: usize,
    weight: usize,
    closed: bool,
    launcher: Option<TimerHandle>,
}

struct Budget<E> {
    weigher: Weigher<E>,
    max_weight: usize,
}

struct BufferShared<E> {
    desc: String,
    config: BufferConfig,
    receiver: Arc<dyn Receiver<E>>,
    executor: Arc<dyn Executor>,
    timer: Option<Timer>,
    budget: Option<Budget<E>>,
    close_listener: Mutex<Option<CloseListener>>,
    state: Mutex<BufferState<E>>,
    drained: Condvar,
}

/// Unbounded buffer handing batches of up to `part_size` items to a
/// [`Receiver`] on at most `max_thread_count` concurrent workers.
///
/// Without a period, an `add` starts a drain when none is running; with one,
/// the first `add` drains at once and a timer launches a drain each period
/// while data is pending.
///
/// # Examples
///
/// ```
/// use courier_core::{thread_pool, AsyncBuffer, BoxError, BufferConfig, PoolConfiguration, PoolExecutor, Receiver};
/// use std::sync::Mutex;
///
/// struct Collect(Mutex<Vec<u32>>);
///
/// impl Receiver<u32> for Collect {
///     fn handle_data(&self, part: Vec<u32>) -> Result<(), BoxError> {
///         self.0.lock().unwrap().extend(part);
///         Ok(())
///     }
/// }
///
/// let executor = PoolExecutor::new(thread_pool("drain", PoolConfiguration::default()).unwrap());
/// let receiver = std::sync::Arc::new(Collect(Mutex::new(Vec::new())));
/// let buffer = AsyncBuffer::<u32>::new("numbers", receiver.clone(), executor, BufferConfig::new()).unwrap();
/// buffer.add_all(0..10).unwrap();
/// buffer.flush();
/// assert_eq!(receiver.0.lock().unwrap().len(), 10);
/// buffer.close();
/// ```
pub struct AsyncBuffer<E: Send + 'static> {
    shared: Arc<BufferShared<E>>,
}

impl<E: Send + 'static> AsyncBuffer<E> {
    pub fn new(
        desc: impl Into<String>,
        receiver: Arc<dyn Receiver<E>>,
        executor: impl Executor + 'static,
        config: BufferConfig,
    ) -> PoolResult<Self> {
        Self::build(desc.into(), receiver, Arc::new(executor), config, None)
    }

    /// Buffer that flushes eagerly once the summed item weight exceeds `max_weight`
    pub fn with_budget(
        desc: impl Into<String>,
        receiver: Arc<dyn Receiver<E>>,
        executor: impl Executor + 'static,
        config: BufferConfig,
        weigher: impl Fn(&E) -> usize + Send + Sync + 'static,
        max_weight: usize,
    ) -> PoolResult<Self> {
        let budget = Budget {
            weigher: Box::new(weigher),
            max_weight,
        };
        Self::build(desc.into(), receiver, Arc::new(executor), config, Some(budget))
    }

    fn build(
        desc: String,
        receiver: Arc<dyn Receiver<E>>,
        executor: Arc<dyn Executor>,
        config: BufferConfig,
        budget: Option<Budget<E>>,
    ) -> PoolResult<Self> {
        config.validate()?;
        let timer = match config.period {
            Some(_) => Some(Timer::new(format!("{desc}-timer"))?),
            None => None,
        };
        Ok(Self {
            shared: Arc::new(BufferShared {
                desc,
                config,
                receiver,
                executor,
                timer,
                budget,
                close_listener: Mutex::new(None),
                state: Mutex::new(BufferState {
                    data: VecDeque::new(),
                    active: 0,
                    weight: 0,
                    closed: false,
                    launcher: None,
                }),
                drained: Condvar::new(),
            }),
        })
    }

    /// Called once after the buffer is closed.
    pub fn set_close_listener(&self, listener: impl FnOnce() + Send + 'static) {
        *self.shared.close_listener.lock() = Some(Box::new(listener));
    }

    /// Queue one item and make sure a drain is on its way.
    pub fn add(&self, item: E) -> PoolResult<()> {
        self.add_all(std::iter::once(item))
    }

    /// Queue `items` in order; fails with [`PoolError::Closed`] after `close`.
    pub fn add_all(&self, items: impl IntoIterator<Item = E>) -> PoolResult<()> {
        let over_budget = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(PoolError::Closed(self.shared.desc.clone()));
            }
            for item in items {
                if let Some(budget) = &self.shared.budget {
                    state.weight += (budget.weigher)(&item);
                }
                state.data.push_back(item);
            }
            self.shared
                .budget
                .as_ref()
                .is_some_and(|b| state.weight > b.max_weight)
        };

        self.shared.ensure_progress();
        if over_budget {
            debug!(buffer = %self.shared.desc, "weight budget exceeded, flushing");
            self.flush();
        }
        Ok(())
    }

    /// Launch a worker if below the thread limit and data is pending.
    pub fn launch_thread(&self) -> bool {
        self.shared.launch_thread()
    }

    /// Block until nothing is pending and no worker is active.
    pub fn flush(&self) {
        self.shared.wait_drained(None);
    }

    /// Like [`flush`](Self::flush), giving up after `timeout`.
    pub fn flush_timeout(&self, timeout: Duration) -> bool {
        self.shared.wait_drained(Some(Instant::now() + timeout))
    }

    /// Flush, stop the timer, close the receiver and fire the close listener.
    ///
    /// Later adds fail with [`PoolError::Closed`].
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.flush();
        if let Some(launcher) = self.shared.state.lock().launcher.take() {
            launcher.cancel();
        }
        self.shared.receiver.close();
        let listener = self.shared.close_listener.lock().take();
        if let Some(listener) = listener {
            listener();
        }
        debug!(buffer = %self.shared.desc, "buffer closed");
    }

    /// Buffer description used in logs
    pub fn desc(&self) -> &str {
        &self.shared.desc
    }

    /// Upper bound on concurrently draining workers
    pub fn max_thread_count(&self) -> usize {
        self.shared.config.max_thread_count
    }

    /// Maximum items handed to the receiver per call
    pub fn part_size(&self) -> usize {
        self.shared.config.part_size
    }

    /// Launch period, `None` in immediate mode
    pub fn period(&self) -> Option<Duration> {
        self.shared.config.period
    }

    /// Items queued but not yet taken by a worker
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().data.len()
    }

    /// Workers currently draining
    pub fn active_workers(&self) -> usize {
        self.shared.state.lock().active
    }

    /// Summed weight of pending items, `0` without a budget
    pub fn weight(&self) -> usize {
        self.shared.state.lock().weight
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl<E: Send + 'static> Drop for AsyncBuffer<E> {
    fn drop(&mut self) {
        if let Some(launcher) = self.shared.state.lock().launcher.take() {
            launcher.cancel();
        }
    }
}

impl<E: Send + 'static> BufferShared<E> {
    fn ensure_progress(self: &Arc<Self>) {
        match (&self.timer, self.config.period) {
            (Some(timer), Some(period)) => {
                let mut state = self.state.lock();
                if state.launcher.is_some() {
                    return;
                }
                let buffer: Weak<Self> = Arc::downgrade(self);
                let task: TimerTask = Arc::new(move || {
                    if let Some(buffer) = buffer.upgrade() {
                        buffer.periodic_launch();
                    }
                });
                state.launcher = Some(timer.schedule_periodic(Duration::ZERO, period, task));
            }
            // Adds only start a drain when none is running; flush and the timer scale out.
            _ => {
                self.launch_below(1);
            }
        }
    }

    fn periodic_launch(self: &Arc<Self>) {
        if self.launch_thread() {
            return;
        }
        let mut state = self.state.lock();
        if state.data.is_empty()
            && state.active == 0
            && let Some(launcher) = state.launcher.take()
        {
            launcher.cancel();
        }
    }

    fn take_part(&self, state: &mut BufferState<E>) -> Vec<E> {
        let n = self.config.part_size.min(state.data.len());
        let part: Vec<E> = state.data.drain(..n).collect();
        if let Some(budget) = &self.budget {
            let weight: usize = part.iter().map(|e| (budget.weigher)(e)).sum();
            state.weight = state.weight.saturating_sub(weight);
        }
        part
    }

    fn launch_thread(self: &Arc<Self>) -> bool {
        self.launch_below(self.config.max_thread_count)
    }

    fn launch_below(self: &Arc<Self>, limit: usize) -> bool {
        let part = {
            let mut state = self.state.lock();
            if state.data.is_empty() || state.active >= limit.min(self.config.max_thread_count) {
                return false;
            }
            state.active += 1;
            self.take_part(&mut state)
        };

        let part = Arc::new(Mutex::new(Some(part)));
        let worker = Arc::clone(self);
        let handed = Arc::clone(&part);
        let res = self.executor.execute(Box::new(move || {
            if let Some(part) = handed.lock().take() {
                worker.drain(part);
            }
        }));

        if let Err(e) = res {
            error!(buffer = %self.desc, error = %e, "cannot launch buffer worker");
            let mut state = self.state.lock();
            if let Some(part) = part.lock().take() {
                for item in part.into_iter().rev() {
                    if let Some(budget) = &self.budget {
                        state.weight += (budget.weigher)(&item);
                    }
                    state.data.push_front(item);
                }
            }
            state.active -= 1;
            self.drained.notify_all();
            return false;
        }
        true
    }

    fn drain(&self, mut part: Vec<E>) {
        loop {
            let size = part.len();
            match panic::catch_unwind(AssertUnwindSafe(|| self.receiver.handle_data(part))) {
                Ok(Ok(())) => debug!(buffer = %self.desc, size, "part handled"),
                Ok(Err(e)) => error!(buffer = %self.desc, size, error = %e, "receiver failed to handle part"),
                Err(_) => error!(buffer = %self.desc, size, "receiver panicked"),
            }

            let mut state = self.state.lock();
            if state.data.is_empty() {
                state.active -= 1;
                self.drained.notify_all();
                return;
            }
            part = self.take_part(&mut state);
        }
    }

    fn wait_drained(self: &Arc<Self>, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.data.is_empty() && state.active == 0 {
                return true;
            }
            if !state.data.is_empty() && state.active < self.config.max_thread_count {
                let launched = MutexGuard::unlocked(&mut state, || self.launch_thread());
                if launched {
                    continue;
                }
            }
            let wait_until = match deadline {
                Some(deadline) if Instant::now() >= deadline => return false,
                Some(deadline) => deadline.min(Instant::now() + Duration::from_millis(50)),
                None => Instant::now() + Duration::from_millis(50),
            };
            self.drained.wait_until(&mut state, wait_until);
        }
    }
}

/// [`AsyncBuffer`] of row arrays with a budget on the total number of rows
pub struct ArrayAsyncWork<T: Send + 'static> {
    buffer: AsyncBuffer<Vec<T>>,
}

impl<T: Send + 'static> ArrayAsyncWork<T> {
    pub fn new(
        desc: impl Into<String>,
        receiver: Arc<dyn Receiver<Vec<T>>>,
        executor: impl Executor + 'static,
        config: BufferConfig,
        max_rows: usize,
    ) -> PoolResult<Self> {
        let buffer = AsyncBuffer::with_budget(desc, receiver, executor, config, |rows: &Vec<T>| rows.len(), max_rows)?;
        Ok(Self { buffer })
    }
}

impl<T: Send + 'static> Deref for ArrayAsyncWork<T> {
    type Target = AsyncBuffer<Vec<T>>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfiguration;
    use crate::executor::PoolExecutor;
    use crate::work_thread::thread_pool;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        parts: Mutex<Vec<Vec<usize>>>,
        closed: AtomicBool,
        fail_first: AtomicBool,
        delay: Option<Duration>,
    }

    impl Receiver<usize> for Recorder {
        fn handle_data(&self, part: Vec<usize>) -> Result<(), BoxError> {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.parts.lock().push(part);
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err("downstream refused".into());
            }
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn executor(name: &str) -> PoolExecutor {
        PoolExecutor::new(thread_pool(name, PoolConfiguration::default()).unwrap())
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn delivered(recorder: &Recorder) -> Vec<usize> {
        let mut all: Vec<usize> = recorder.parts.lock().iter().flatten().copied().collect();
        all.sort_unstable();
        all
    }

    #[test]
    fn test_batches_cover_all_items_once() {
        let recorder = Arc::new(Recorder::default());
        let buffer = AsyncBuffer::<usize>::new(
            "batches",
            recorder.clone(),
            executor("batches"),
            BufferConfig::new().with_part_size(4),
        )
        .unwrap();
        buffer.add_all(0..10).unwrap();
        buffer.flush();
        assert_eq!(recorder.parts.lock().len(), 3);
        assert_eq!(delivered(&recorder), (0..10).collect::<Vec<_>>());
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.active_workers(), 0);
    }

    #[test]
    fn test_periodic_mode_defers_later_adds() {
        let recorder = Arc::new(Recorder::default());
        let buffer = AsyncBuffer::<usize>::new(
            "periodic",
            recorder.clone(),
            executor("periodic"),
            BufferConfig::new().with_part_size(3).with_period(Duration::from_secs(60)),
        )
        .unwrap();
        buffer.add(0).unwrap();
        assert!(wait_for(|| delivered(&recorder) == vec![0] && buffer.active_workers() == 0));

        buffer.add_all(1..=6).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(buffer.pending_len(), 6);
        buffer.flush();
        assert_eq!(recorder.parts.lock().len(), 3);
        assert_eq!(delivered(&recorder), (0..=6).collect::<Vec<_>>());
    }

    #[test]
    fn test_periodic_first_drain_is_immediate() {
        let recorder = Arc::new(Recorder::default());
        let buffer = AsyncBuffer::<usize>::new(
            "first-tick",
            recorder.clone(),
            executor("first-tick"),
            BufferConfig::new().with_period(Duration::from_millis(800)),
        )
        .unwrap();
        let started = Instant::now();
        buffer.add(5).unwrap();
        assert!(wait_for(|| delivered(&recorder) == vec![5]));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_periodic_timer_drains() {
        let recorder = Arc::new(Recorder::default());
        let buffer = AsyncBuffer::<usize>::new(
            "tick",
            recorder.clone(),
            executor("tick"),
            BufferConfig::new().with_period(Duration::from_millis(20)),
        )
        .unwrap();
        buffer.add(1).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(delivered(&recorder), vec![1]);
    }

    #[test]
    fn test_worker_count_bounded() {
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(20)),
            ..Recorder::default()
        });
        let buffer = AsyncBuffer::<usize>::new(
            "bounded",
            recorder.clone(),
            executor("bounded"),
            BufferConfig::new().with_part_size(1).with_max_thread_count(2),
        )
        .unwrap();
        let peak = Arc::new(AtomicUsize::new(0));
        for i in 0..6 {
            buffer.add(i).unwrap();
            peak.fetch_max(buffer.active_workers(), Ordering::SeqCst);
        }
        buffer.flush();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(delivered(&recorder).len(), 6);
    }

    #[test]
    fn test_add_during_drain_keeps_one_worker() {
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(100)),
            ..Recorder::default()
        });
        let buffer = AsyncBuffer::<usize>::new(
            "single-drain",
            recorder.clone(),
            executor("single-drain"),
            BufferConfig::new().with_part_size(1).with_max_thread_count(3),
        )
        .unwrap();
        for i in 0..3 {
            buffer.add(i).unwrap();
        }
        assert_eq!(buffer.active_workers(), 1);
        buffer.flush();
        assert_eq!(delivered(&recorder), vec![0, 1, 2]);
        assert_eq!(buffer.active_workers(), 0);
    }

    #[test]
    fn test_receiver_error_does_not_stop_worker() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_first.store(true, Ordering::SeqCst);
        let buffer = AsyncBuffer::<usize>::new(
            "errors",
            recorder.clone(),
            executor("errors"),
            BufferConfig::new().with_part_size(2),
        )
        .unwrap();
        buffer.add_all(0..6).unwrap();
        buffer.flush();
        assert_eq!(delivered(&recorder).len(), 6);
    }

    #[test]
    fn test_close_fires_listener_and_rejects_adds() {
        let recorder = Arc::new(Recorder::default());
        let buffer = AsyncBuffer::<usize>::new("close", recorder.clone(), executor("close"), BufferConfig::new()).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        buffer.set_close_listener(move || f.store(true, Ordering::SeqCst));
        buffer.add_all(0..3).unwrap();
        buffer.close();
        buffer.close();
        assert!(fired.load(Ordering::SeqCst));
        assert!(recorder.closed.load(Ordering::SeqCst));
        assert_eq!(delivered(&recorder).len(), 3);
        assert!(matches!(buffer.add(9), Err(PoolError::Closed(_))));
    }

    #[test]
    fn test_array_work_flushes_over_budget() {
        #[derive(Default)]
        struct Rows {
            count: Mutex<usize>,
            open: AtomicBool,
        }
        impl Receiver<Vec<u8>> for Rows {
            fn handle_data(&self, part: Vec<Vec<u8>>) -> Result<(), BoxError> {
                while !self.open.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                *self.count.lock() += part.iter().map(Vec::len).sum::<usize>();
                Ok(())
            }
        }

        let rows = Arc::new(Rows::default());
        let work = ArrayAsyncWork::<u8>::new(
            "rows",
            rows.clone(),
            executor("rows"),
            BufferConfig::new().with_part_size(1),
            10,
        )
        .unwrap();
        // The first array goes straight to the (blocked) worker.
        work.add(vec![0; 6]).unwrap();
        assert_eq!(work.weight(), 0);
        work.add(vec![0; 6]).unwrap();
        assert_eq!(work.weight(), 6);
        assert_eq!(work.active_workers(), 1);

        let gate = Arc::clone(&rows);
        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            gate.open.store(true, Ordering::SeqCst);
        });
        work.add(vec![0; 6]).unwrap();
        assert_eq!(work.weight(), 0);
        assert_eq!(work.pending_len(), 0);
        assert_eq!(*rows.count.lock(), 18);
        opener.join().unwrap();
        work.close();
    }
}
