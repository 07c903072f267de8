//! Target queue drained against a lazily acquired shared resource
//!
//! An [`AsynchProcessing`] engine keeps a queue of targets and runs
//! "activities" on an [`Executor`]. Each activity acquires one resource from
//! its [`Processor`], drains chunks of targets against it and releases it when
//! the queue is empty. A periodic performance check launches one more activity
//! whenever the queue grew since the last launch, up to `max_exec`.

use crate::config::ProcessingConfig;
use crate::errors::{BoxError, PoolError, PoolResult};
use crate::executor::Executor;
use crate::timer::{Timer, TimerHandle, TimerTask};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

static NEXT_DESC: AtomicUsize = AtomicUsize::new(1);

/// What to do with a target whose processing failed on a valid resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Put the target back at the front of the queue
    Retry,
    /// Forget the target
    Drop,
}

/// Resource and target handling plugged into an [`AsynchProcessing`] engine.
pub trait Processor: Send + Sync + 'static {
    type Resource: Send + 'static;
    type Target: Send + 'static;

    /// Acquire a resource; `Ok(None)` means none is available right now.
    fn find_resource(&self, token: &CancellationToken) -> Result<Option<Self::Resource>, BoxError>;

    /// Whether the resource is still usable after a failure.
    fn is_resource_valid(&self, _resource: &Self::Resource) -> Result<bool, BoxError> {
        Ok(true)
    }

    /// Give back a resource once an activity is done with it.
    fn release_resource(&self, resource: Self::Resource);

    /// Give back the resource of a cancelled activity.
    fn release_cancelled_resource(&self, resource: Self::Resource) {
        self.release_resource(resource);
    }

    fn process(
        &self,
        resource: &mut Self::Resource,
        target: &Self::Target,
        token: &CancellationToken,
    ) -> Result<(), BoxError>;

    /// Process several targets at once; defaults to one `process` call each.
    fn process_chunk(
        &self,
        resource: &mut Self::Resource,
        targets: &[Self::Target],
        token: &CancellationToken,
    ) -> Result<(), BoxError> {
        for target in targets {
            self.process(resource, target, token)?;
        }
        Ok(())
    }

    /// Decide the fate of a target that failed on a valid resource.
    fn target_failed(&self, _target: &Self::Target, error: &BoxError) -> FailureAction {
        warn!(error = %error, "target processing failed, will retry");
        FailureAction::Retry
    }
}

/// Lifecycle of an [`AsynchProcessing`] engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Corrupted,
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessingState::Created => "CREATED",
            ProcessingState::Starting => "STARTING",
            ProcessingState::Started => "STARTED",
            ProcessingState::Stopping => "STOPPING",
            ProcessingState::Stopped => "STOPPED",
            ProcessingState::Corrupted => "CORRUPTED",
        };
        f.write_str(s)
    }
}

pub type StateListener = Arc<dyn Fn(ProcessingState) + Send + Sync + 'static>;

struct Activity<R> {
    closed: bool,
    parked: Option<R>,
    token: CancellationToken,
}

struct EngineState<P: Processor> {
    lifecycle: ProcessingState,
    targets: VecDeque<P::Target>,
    activities: HashMap<u64, Activity<P::Resource>>,
    next_activity: u64,
    exec_count: usize,
    launching: Option<u64>,
    last_size: usize,
    res_unavailable: bool,
    buffer_since: Option<Instant>,
    force_flush: bool,
    check_task: Option<TimerHandle>,
    buffer_task: Option<TimerHandle>,
    timer: Option<Timer>,
}

type Guard<'a, P> = MutexGuard<'a, EngineState<P>>;

enum Next<T> {
    Chunk(Vec<T>),
    Empty,
    Closed,
}

enum Outcome {
    Continue,
    Abandon,
    Corrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Done,
    Abandoned,
    Cancelled,
    Unavailable,
    Failed,
}

struct Engine<P: Processor> {
    desc: String,
    processor: P,
    executor: Arc<dyn Executor>,
    config: ProcessingConfig,
    token: CancellationToken,
    state: Mutex<EngineState<P>>,
    cond: Condvar,
    listeners: Mutex<Vec<StateListener>>,
}

/// Queue of targets processed by an adaptively sized set of activities.
///
/// # Examples
///
/// ```
/// use courier_core::{thread_pool, AsynchProcessing, BoxError, PoolConfiguration, PoolExecutor, Processor, ProcessingConfig};
/// use std::sync::Mutex;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// struct Printer(Mutex<Vec<String>>);
///
/// impl Processor for Printer {
///     type Resource = ();
///     type Target = String;
///
///     fn find_resource(&self, _token: &CancellationToken) -> Result<Option<()>, BoxError> {
///         Ok(Some(()))
///     }
///
///     fn release_resource(&self, _resource: ()) {}
///
///     fn process(&self, _res: &mut (), target: &String, _token: &CancellationToken) -> Result<(), BoxError> {
///         self.0.lock().unwrap().push(target.clone());
///         Ok(())
///     }
/// }
///
/// let executor = PoolExecutor::new(thread_pool("printer", PoolConfiguration::default()).unwrap());
/// let engine = AsynchProcessing::new(Printer(Mutex::new(Vec::new())), executor, ProcessingConfig::new(1)).unwrap();
/// engine.start().unwrap();
/// engine.add_target("hello".to_string(), true).unwrap();
/// std::thread::sleep(Duration::from_millis(100));
/// assert_eq!(engine.processor().0.lock().unwrap().len(), 1);
/// assert!(engine.close(Some(Duration::from_secs(2))).unwrap());
/// ```
pub struct AsynchProcessing<P: Processor> {
    shared: Arc<Engine<P>>,
}

impl<P: Processor> Clone for AsynchProcessing<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Processor> AsynchProcessing<P> {
    /// Engine named `processing-N`
    pub fn new(processor: P, executor: impl Executor + 'static, config: ProcessingConfig) -> PoolResult<Self> {
        let desc = format!("processing-{}", NEXT_DESC.fetch_add(1, Ordering::Relaxed));
        Self::named(desc, processor, executor, config)
    }

    /// Create an engine in CREATED state with a description used in logs.
    pub fn named(
        desc: impl Into<String>,
        processor: P,
        executor: impl Executor + 'static,
        config: ProcessingConfig,
    ) -> PoolResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Engine {
                desc: desc.into(),
                processor,
                executor: Arc::new(executor),
                config,
                token: CancellationToken::new(),
                state: Mutex::new(EngineState {
                    lifecycle: ProcessingState::Created,
                    targets: VecDeque::new(),
                    activities: HashMap::new(),
                    next_activity: 1,
                    exec_count: 0,
                    launching: None,
                    last_size: 0,
                    res_unavailable: false,
                    buffer_since: None,
                    force_flush: false,
                    check_task: None,
                    buffer_task: None,
                    timer: None,
                }),
                cond: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Share a timer for performance checks and buffer deadlines.
    pub fn set_timer(&self, timer: Timer) {
        self.shared.state.lock().timer = Some(timer);
    }

    /// Move to STARTED and launch an activity for queued targets.
    pub fn start(&self) -> PoolResult<()> {
        self.shared.start()
    }

    /// Queue `target`.
    ///
    /// With `process_at_once` an activity is launched (or the buffer deadline
    /// armed) when none is running; otherwise the target only waits for a
    /// running activity or the performance check to pick it up.
    pub fn add_target(&self, target: P::Target, process_at_once: bool) -> PoolResult<()> {
        self.shared.add_target(target, process_at_once)
    }

    /// Launch another activity if the queue grew since the last launch.
    pub fn check_performance(&self) {
        self.shared.check_performance();
    }

    /// Allow launches again and start draining pending targets.
    pub fn resource_available(&self) {
        let mut state = self.shared.state.lock();
        state.res_unavailable = false;
        debug!(engine = %self.shared.desc, "resource available");
        self.shared.kick(&mut state);
    }

    /// Pause new launches; queued targets are kept.
    pub fn resource_unavailable(&self) {
        self.shared.state.lock().res_unavailable = true;
        debug!(engine = %self.shared.desc, "resource unavailable");
    }

    /// Cancel every activity; resources come back through
    /// `release_cancelled_resource`.
    pub fn stop_activities(&self) {
        self.shared.stop_activities();
    }

    /// Stop all activities and wait up to `timeout` (`None` waits forever)
    /// for STOPPED; returns whether a clean stop was observed.
    pub fn close(&self, timeout: Option<Duration>) -> PoolResult<bool> {
        self.shared.close(timeout)
    }

    /// Register a lifecycle listener; it is called right away with the current state.
    pub fn add_state_listener(&self, listener: impl Fn(ProcessingState) + Send + Sync + 'static) {
        let listener: StateListener = Arc::new(listener);
        let current = {
            let mut listeners = self.shared.listeners.lock();
            listeners.push(Arc::clone(&listener));
            self.shared.state.lock().lifecycle
        };
        self.shared.call_listener(&listener, current);
    }

    /// Engine description used in logs
    pub fn desc(&self) -> &str {
        &self.shared.desc
    }

    /// The processor targets are handed to
    pub fn processor(&self) -> &P {
        &self.shared.processor
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &ProcessingConfig {
        &self.shared.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessingState {
        self.shared.state.lock().lifecycle
    }

    /// Targets queued and not yet handed to an activity
    pub fn target_count(&self) -> usize {
        self.shared.state.lock().targets.len()
    }

    /// Number of running activities
    pub fn exec_count(&self) -> usize {
        self.shared.state.lock().exec_count
    }

    /// Whether launches are currently allowed by the resource gate
    pub fn is_resource_available(&self) -> bool {
        !self.shared.state.lock().res_unavailable
    }

    /// One-line summary of state, queue and activities
    pub fn debug_string(&self) -> String {
        let state = self.shared.state.lock();
        format!(
            "{} state = {}; targets = {}; exec count = {}; launching = {}; resource unavailable = {}",
            self.shared.desc,
            state.lifecycle,
            state.targets.len(),
            state.exec_count,
            state.launching.is_some(),
            state.res_unavailable
        )
    }
}

impl<P: Processor> fmt::Debug for AsynchProcessing<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_string())
    }
}

impl<P: Processor> Engine<P> {
    fn guard<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        panic::catch_unwind(AssertUnwindSafe(f)).ok()
    }

    fn call_listener(&self, listener: &StateListener, state: ProcessingState) {
        if self.guard(|| listener(state)).is_none() {
            error!(engine = %self.desc, %state, "state listener panicked");
        }
    }

    fn fire(&self, state: ProcessingState) {
        debug!(engine = %self.desc, %state, "state changed");
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            self.call_listener(listener, state);
        }
    }

    fn buffer_deadline(&self, state: &EngineState<P>) -> Option<Instant> {
        let interval = self.config.buffer_interval?;
        state.buffer_since.map(|since| since + interval)
    }

    fn has_work(&self, state: &EngineState<P>) -> bool {
        if state.targets.is_empty() {
            return false;
        }
        if !self.config.buffering() || state.force_flush {
            return true;
        }
        state.targets.len() >= self.config.buffer_size.max(1)
            || self
                .buffer_deadline(state)
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn can_launch(&self, state: &EngineState<P>) -> bool {
        state.lifecycle == ProcessingState::Started
            && !state.res_unavailable
            && state.launching.is_none()
            && (self.config.max_exec == 0 || state.exec_count < self.config.max_exec)
    }

    fn start(self: &Arc<Self>) -> PoolResult<()> {
        let mut state = self.state.lock();
        match state.lifecycle {
            ProcessingState::Corrupted => return Err(PoolError::Corrupted(self.desc.clone())),
            ProcessingState::Starting | ProcessingState::Started => return Ok(()),
            ProcessingState::Stopping => {
                return Err(PoolError::InvalidState {
                    expected: ProcessingState::Stopped.to_string(),
                    actual: ProcessingState::Stopping.to_string(),
                });
            }
            ProcessingState::Created | ProcessingState::Stopped => {}
        }

        state.lifecycle = ProcessingState::Starting;
        MutexGuard::unlocked(&mut state, || self.fire(ProcessingState::Starting));
        if state.timer.is_none() {
            match Timer::new(format!("{}-timer", self.desc)) {
                Ok(timer) => state.timer = Some(timer),
                Err(e) => {
                    state.lifecycle = ProcessingState::Stopped;
                    drop(state);
                    self.fire(ProcessingState::Stopped);
                    return Err(e);
                }
            }
        }
        state.lifecycle = ProcessingState::Started;
        MutexGuard::unlocked(&mut state, || self.fire(ProcessingState::Started));
        self.kick(&mut state);
        Ok(())
    }

    fn add_target(self: &Arc<Self>, target: P::Target, process_at_once: bool) -> PoolResult<()> {
        let mut state = self.state.lock();
        match state.lifecycle {
            ProcessingState::Corrupted => return Err(PoolError::Corrupted(self.desc.clone())),
            ProcessingState::Stopping | ProcessingState::Stopped => {
                return Err(PoolError::Closed(self.desc.clone()));
            }
            _ => {}
        }

        if state.targets.is_empty() {
            state.buffer_since = Some(Instant::now());
        }
        state.targets.push_back(target);
        if let Some(max) = self.config.max_target_count {
            let excess = state.targets.len().saturating_sub(max);
            if excess > 0 {
                state.targets.drain(..excess);
                warn!(engine = %self.desc, dropped = excess, max, "target queue full, oldest targets dropped");
            }
        }
        self.cond.notify_all();
        if process_at_once {
            self.kick(&mut state);
        }
        Ok(())
    }

    /// Launch a first activity, or arm the buffer deadline.
    fn kick(self: &Arc<Self>, state: &mut Guard<'_, P>) {
        if state.exec_count > 0 || state.targets.is_empty() {
            return;
        }
        if self.can_launch(state) && self.has_work(state) {
            self.launch(state);
        } else if self.config.buffering() && state.lifecycle == ProcessingState::Started {
            self.arm_buffer_timer(state);
        }
    }

    fn arm_buffer_timer(self: &Arc<Self>, state: &mut Guard<'_, P>) {
        if state.buffer_task.is_some() {
            return;
        }
        let Some(timer) = state.timer.clone() else { return };
        let delay = self
            .buffer_deadline(state)
            .map_or(Duration::ZERO, |deadline| deadline.saturating_duration_since(Instant::now()));
        let engine: Weak<Self> = Arc::downgrade(self);
        let task: TimerTask = Arc::new(move || {
            if let Some(engine) = engine.upgrade() {
                let mut state = engine.state.lock();
                state.buffer_task = None;
                engine.kick(&mut state);
            }
        });
        state.buffer_task = Some(timer.schedule(delay, task));
    }

    fn schedule_check(self: &Arc<Self>, state: &mut Guard<'_, P>) {
        if state.check_task.is_some() {
            return;
        }
        let (Some(interval), Some(timer)) = (self.config.check_interval, state.timer.clone()) else {
            return;
        };
        let engine: Weak<Self> = Arc::downgrade(self);
        let task: TimerTask = Arc::new(move || {
            if let Some(engine) = engine.upgrade() {
                engine.check_performance();
            }
        });
        state.check_task = Some(timer.schedule_periodic(interval, interval, task));
    }

    fn check_performance(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let size = state.targets.len();
        if size > state.last_size && self.can_launch(&state) && self.has_work(&state) {
            debug!(
                engine = %self.desc,
                size,
                last_size = state.last_size,
                exec_count = state.exec_count,
                "queue growing, launching another activity"
            );
            self.launch(&mut state);
        }
    }

    fn launch(self: &Arc<Self>, state: &mut Guard<'_, P>) {
        let id = state.next_activity;
        state.next_activity += 1;
        let token = self.token.child_token();
        state.activities.insert(
            id,
            Activity {
                closed: false,
                parked: None,
                token: token.clone(),
            },
        );
        state.exec_count += 1;
        state.launching = Some(id);
        state.last_size = state.targets.len();
        if let Some(task) = state.buffer_task.take() {
            task.cancel();
        }
        self.schedule_check(state);
        debug!(engine = %self.desc, activity = id, exec_count = state.exec_count, "launching activity");

        let engine = Arc::clone(self);
        let res = MutexGuard::unlocked(state, || {
            self.executor
                .execute(Box::new(move || engine.run_activity(id, token)))
        });
        if let Err(e) = res {
            error!(engine = %self.desc, activity = id, error = %e, "cannot launch activity");
            state.activities.remove(&id);
            if state.launching == Some(id) {
                state.launching = None;
            }
            let stopped = self.exit_bookkeeping(state);
            if let Some(stopped) = stopped {
                MutexGuard::unlocked(state, || self.fire(stopped));
            }
        }
    }

    /// Account for a finished activity; returns a STOPPED transition to announce.
    fn exit_bookkeeping(&self, state: &mut EngineState<P>) -> Option<ProcessingState> {
        state.exec_count -= 1;
        if state.exec_count > 0 {
            return None;
        }
        if let Some(task) = state.check_task.take() {
            task.cancel();
        }
        if state.lifecycle == ProcessingState::Stopping {
            state.lifecycle = ProcessingState::Stopped;
            self.cond.notify_all();
            return Some(ProcessingState::Stopped);
        }
        None
    }

    fn run_activity(self: Arc<Self>, id: u64, token: CancellationToken) {
        let found = self.guard(|| self.processor.find_resource(&token));
        {
            let mut state = self.state.lock();
            if state.launching == Some(id) {
                state.launching = None;
            }
        }
        let resource = match found {
            None => {
                self.corrupt("resource lookup panicked");
                return self.finish(id, None, Exit::Failed);
            }
            Some(Err(e)) => {
                error!(engine = %self.desc, activity = id, error = %e, "cannot find resource");
                return self.finish(id, None, Exit::Unavailable);
            }
            Some(Ok(None)) => {
                debug!(engine = %self.desc, activity = id, "no resource available");
                return self.finish(id, None, Exit::Unavailable);
            }
            Some(Ok(Some(resource))) => resource,
        };
        self.work(id, resource, &token);
    }

    fn work(self: &Arc<Self>, id: u64, mut resource: P::Resource, token: &CancellationToken) {
        let mut idled = false;
        loop {
            let next = {
                let mut state = self.state.lock();
                self.next_chunk(&mut state, id)
            };
            match next {
                Next::Closed => return self.finish(id, Some(resource), Exit::Cancelled),
                Next::Chunk(chunk) => {
                    idled = false;
                    match self.process(&mut resource, chunk, token) {
                        Outcome::Continue => {}
                        Outcome::Abandon => return self.finish(id, Some(resource), Exit::Abandoned),
                        Outcome::Corrupted => return self.finish(id, Some(resource), Exit::Failed),
                    }
                }
                Next::Empty => {
                    let Some(sleep) = self.config.last_exec_sleep_interval else {
                        return self.finish(id, Some(resource), Exit::Done);
                    };
                    if idled || !self.resource_valid(&resource) {
                        return self.finish(id, Some(resource), Exit::Done);
                    }
                    match self.idle(id, resource, sleep) {
                        Some(back) => {
                            resource = back;
                            idled = true;
                        }
                        None => return self.finish(id, None, Exit::Cancelled),
                    }
                }
            }
        }
    }

    fn next_chunk(&self, state: &mut EngineState<P>, id: u64) -> Next<P::Target> {
        let closed = state.activities.get(&id).is_none_or(|a| a.closed);
        if closed || state.lifecycle == ProcessingState::Corrupted {
            return Next::Closed;
        }
        if !self.has_work(state) {
            return Next::Empty;
        }
        let n = self.config.chunk_size.min(state.targets.len());
        let chunk: Vec<P::Target> = state.targets.drain(..n).collect();
        if state.targets.is_empty() {
            state.buffer_since = None;
            state.force_flush = false;
        }
        Next::Chunk(chunk)
    }

    /// Park the resource while the sole activity waits for more targets.
    ///
    /// Returns `None` when a canceller took the resource.
    fn idle(&self, id: u64, resource: P::Resource, sleep: Duration) -> Option<P::Resource> {
        let mut state = self.state.lock();
        if state.exec_count != 1 || self.has_work(&state) {
            return Some(resource);
        }
        match state.activities.get_mut(&id) {
            Some(activity) if !activity.closed => activity.parked = Some(resource),
            _ => return Some(resource),
        }

        let deadline = Instant::now() + sleep;
        loop {
            let closed = state.activities.get(&id).is_none_or(|a| a.closed);
            if closed
                || self.has_work(&state)
                || state.lifecycle != ProcessingState::Started
                || Instant::now() >= deadline
            {
                break;
            }
            let wake = self
                .buffer_deadline(&state)
                .map_or(deadline, |buffered| buffered.min(deadline));
            self.cond.wait_until(&mut state, wake);
        }
        state.activities.get_mut(&id).and_then(|a| a.parked.take())
    }

    fn resource_valid(&self, resource: &P::Resource) -> bool {
        match self.guard(|| self.processor.is_resource_valid(resource)) {
            Some(Ok(valid)) => valid,
            Some(Err(e)) => {
                warn!(engine = %self.desc, error = %e, "resource validation failed");
                false
            }
            None => {
                self.corrupt("resource validation panicked");
                false
            }
        }
    }

    fn process(&self, resource: &mut P::Resource, chunk: Vec<P::Target>, token: &CancellationToken) -> Outcome {
        let res = self.guard(|| {
            if chunk.len() == 1 {
                self.processor.process(resource, &chunk[0], token)
            } else {
                self.processor.process_chunk(resource, &chunk, token)
            }
        });
        let err = match res {
            Some(Ok(())) => return Outcome::Continue,
            Some(Err(e)) => e,
            None => {
                self.corrupt("target processing panicked");
                return Outcome::Corrupted;
            }
        };

        if !self.resource_valid(resource) {
            warn!(
                engine = %self.desc,
                error = %err,
                count = chunk.len(),
                "processing failed on invalid resource, re-queueing targets"
            );
            self.requeue(chunk);
            return Outcome::Abandon;
        }

        let mut retry = Vec::with_capacity(chunk.len());
        for target in chunk {
            match self.guard(|| self.processor.target_failed(&target, &err)) {
                Some(FailureAction::Retry) => retry.push(target),
                Some(FailureAction::Drop) => debug!(engine = %self.desc, "failed target dropped"),
                None => {
                    self.corrupt("target failure handler panicked");
                    return Outcome::Corrupted;
                }
            }
        }
        self.requeue(retry);
        Outcome::Continue
    }

    fn requeue(&self, targets: Vec<P::Target>) {
        if targets.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for target in targets.into_iter().rev() {
            state.targets.push_front(target);
        }
        state.force_flush = true;
        self.cond.notify_all();
    }

    fn release(&self, resource: P::Resource, cancelled: bool) {
        let released = self.guard(|| {
            if cancelled {
                self.processor.release_cancelled_resource(resource);
            } else {
                self.processor.release_resource(resource);
            }
        });
        if released.is_none() {
            self.corrupt("resource release panicked");
        }
    }

    fn finish(self: &Arc<Self>, id: u64, resource: Option<P::Resource>, exit: Exit) {
        let closed = {
            let mut state = self.state.lock();
            if state.launching == Some(id) {
                state.launching = None;
            }
            state.activities.remove(&id).is_some_and(|a| a.closed)
        };
        if let Some(resource) = resource {
            self.release(resource, closed || exit == Exit::Cancelled);
        }

        let mut state = self.state.lock();
        let stopped = self.exit_bookkeeping(&mut state);
        debug!(
            engine = %self.desc,
            activity = id,
            ?exit,
            exec_count = state.exec_count,
            remaining = state.targets.len(),
            "activity finished"
        );
        if state.exec_count == 0 && !state.targets.is_empty() {
            match exit {
                Exit::Done | Exit::Abandoned if self.can_launch(&state) && self.has_work(&state) => {
                    self.launch(&mut state);
                }
                Exit::Done | Exit::Abandoned if self.config.buffering() => {
                    self.arm_buffer_timer(&mut state);
                }
                _ => {}
            }
        }
        drop(state);
        if let Some(stopped) = stopped {
            self.fire(stopped);
        }
    }

    fn stop_activities(&self) {
        let parked: Vec<P::Resource> = {
            let mut state = self.state.lock();
            let mut parked = Vec::new();
            for activity in state.activities.values_mut() {
                activity.closed = true;
                activity.token.cancel();
                parked.extend(activity.parked.take());
            }
            if let Some(task) = state.buffer_task.take() {
                task.cancel();
            }
            self.cond.notify_all();
            parked
        };
        debug!(engine = %self.desc, released = parked.len(), "activities stopped");
        for resource in parked {
            self.release(resource, true);
        }
    }

    fn close(&self, timeout: Option<Duration>) -> PoolResult<bool> {
        let transitions = {
            let mut state = self.state.lock();
            match state.lifecycle {
                ProcessingState::Corrupted => return Err(PoolError::Corrupted(self.desc.clone())),
                ProcessingState::Stopped => return Ok(true),
                ProcessingState::Created => {
                    state.lifecycle = ProcessingState::Stopped;
                    vec![ProcessingState::Stopped]
                }
                ProcessingState::Stopping => Vec::new(),
                ProcessingState::Starting | ProcessingState::Started => {
                    if let Some(task) = state.check_task.take() {
                        task.cancel();
                    }
                    if state.exec_count == 0 {
                        state.lifecycle = ProcessingState::Stopped;
                        vec![ProcessingState::Stopping, ProcessingState::Stopped]
                    } else {
                        state.lifecycle = ProcessingState::Stopping;
                        vec![ProcessingState::Stopping]
                    }
                }
            }
        };
        for state in transitions {
            self.fire(state);
        }
        self.stop_activities();

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.lifecycle == ProcessingState::Stopping {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        let clean = state.lifecycle == ProcessingState::Stopped;
        if !clean {
            warn!(engine = %self.desc, exec_count = state.exec_count, "engine did not stop in time");
        }
        Ok(clean)
    }

    fn corrupt(&self, reason: &str) {
        let parked: Vec<P::Resource> = {
            let mut state = self.state.lock();
            if state.lifecycle == ProcessingState::Corrupted {
                return;
            }
            state.lifecycle = ProcessingState::Corrupted;
            for task in [state.check_task.take(), state.buffer_task.take()].into_iter().flatten() {
                task.cancel();
            }
            let mut parked = Vec::new();
            for activity in state.activities.values_mut() {
                activity.closed = true;
                parked.extend(activity.parked.take());
            }
            self.cond.notify_all();
            parked
        };
        error!(engine = %self.desc, reason, "processing engine corrupted");
        self.token.cancel();
        for resource in parked {
            if self.guard(|| self.processor.release_cancelled_resource(resource)).is_none() {
                error!(engine = %self.desc, "resource release panicked");
            }
        }
        self.fire(ProcessingState::Corrupted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfiguration;
    use crate::executor::PoolExecutor;
    use crate::work_thread::thread_pool;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        next_resource: AtomicUsize,
        acquired: AtomicUsize,
        processed: Mutex<Vec<(usize, u32)>>,
        chunks: Mutex<Vec<usize>>,
        released: Mutex<Vec<usize>>,
        cancelled: Mutex<Vec<usize>>,
        failures_left: AtomicUsize,
        invalid_resource: Mutex<Option<usize>>,
        unavailable: AtomicBool,
        panic_on: Mutex<Option<u32>>,
        delay: Option<Duration>,
        running: AtomicUsize,
        peak: AtomicUsize,
        block_find: AtomicBool,
        finding: AtomicBool,
        saw_cancel: AtomicBool,
    }

    impl Processor for Arc<Recorder> {
        type Resource = usize;
        type Target = u32;

        fn find_resource(&self, token: &CancellationToken) -> Result<Option<usize>, BoxError> {
            if self.block_find.load(Ordering::SeqCst) {
                self.finding.store(true, Ordering::SeqCst);
                let deadline = Instant::now() + Duration::from_secs(2);
                while !token.is_cancelled() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(5));
                }
                self.saw_cancel.store(token.is_cancelled(), Ordering::SeqCst);
            }
            if self.unavailable.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Some(self.next_resource.fetch_add(1, Ordering::SeqCst)))
        }

        fn is_resource_valid(&self, resource: &usize) -> Result<bool, BoxError> {
            Ok(*self.invalid_resource.lock() != Some(*resource))
        }

        fn release_resource(&self, resource: usize) {
            self.released.lock().push(resource);
        }

        fn release_cancelled_resource(&self, resource: usize) {
            self.cancelled.lock().push(resource);
        }

        fn process(&self, resource: &mut usize, target: &u32, _token: &CancellationToken) -> Result<(), BoxError> {
            if *self.panic_on.lock() == Some(*target) {
                panic!("poisoned target");
            }
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            let fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(format!("target {target} failed").into());
            }
            self.processed.lock().push((*resource, *target));
            Ok(())
        }

        fn process_chunk(&self, resource: &mut usize, targets: &[u32], token: &CancellationToken) -> Result<(), BoxError> {
            self.chunks.lock().push(targets.len());
            for target in targets {
                self.process(resource, target, token)?;
            }
            Ok(())
        }
    }

    fn engine(name: &str, recorder: &Arc<Recorder>, config: ProcessingConfig) -> AsynchProcessing<Arc<Recorder>> {
        let executor = PoolExecutor::new(thread_pool(name, PoolConfiguration::default()).unwrap());
        AsynchProcessing::named(name, Arc::clone(recorder), executor, config).unwrap()
    }

    fn quick(max_exec: usize) -> ProcessingConfig {
        ProcessingConfig::new(max_exec).with_last_exec_sleep_interval(None)
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

    #[test]
    fn test_drains_queue_and_releases_resource() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine("drain", &recorder, quick(1));
        engine.start().unwrap();
        for t in 0..5 {
            engine.add_target(t, true).unwrap();
        }
        assert!(wait_for(|| recorder.processed.lock().len() == 5));
        assert!(wait_for(|| engine.exec_count() == 0));
        let acquired = recorder.acquired.load(Ordering::SeqCst);
        assert_eq!(recorder.released.lock().len(), acquired);
        assert!(engine.close(Some(Duration::from_secs(2))).unwrap());
        assert_eq!(engine.state(), ProcessingState::Stopped);
    }

    #[test]
    fn test_state_listener_replays_current_state() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine("listen", &recorder, quick(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        engine.add_state_listener(move |state| s.lock().push(state));
        engine.start().unwrap();
        engine.close(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                ProcessingState::Created,
                ProcessingState::Starting,
                ProcessingState::Started,
                ProcessingState::Stopping,
                ProcessingState::Stopped,
            ]
        );
    }

    #[test]
    fn test_failing_target_retried_on_same_resource() {
        let recorder = Arc::new(Recorder::default());
        recorder.failures_left.store(3, Ordering::SeqCst);
        let engine = engine("retry", &recorder, quick(1));
        engine.start().unwrap();
        engine.add_target(7, true).unwrap();
        assert!(wait_for(|| !recorder.processed.lock().is_empty()));
        assert_eq!(*recorder.processed.lock(), vec![(0, 7)]);
        assert_eq!(recorder.acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_resource_requeues_and_reacquires() {
        let recorder = Arc::new(Recorder::default());
        recorder.failures_left.store(1, Ordering::SeqCst);
        *recorder.invalid_resource.lock() = Some(0);
        let engine = engine("invalid", &recorder, quick(1));
        engine.start().unwrap();
        engine.add_target(3, true).unwrap();
        assert!(wait_for(|| !recorder.processed.lock().is_empty()));
        assert_eq!(*recorder.processed.lock(), vec![(1, 3)]);
        assert!(wait_for(|| recorder.released.lock().contains(&0)));
    }

    #[test]
    fn test_dropped_targets_not_retried() {
        struct Dropper(Arc<Recorder>);
        impl Processor for Dropper {
            type Resource = usize;
            type Target = u32;
            fn find_resource(&self, token: &CancellationToken) -> Result<Option<usize>, BoxError> {
                self.0.find_resource(token)
            }
            fn release_resource(&self, resource: usize) {
                self.0.release_resource(resource)
            }
            fn process(&self, resource: &mut usize, target: &u32, token: &CancellationToken) -> Result<(), BoxError> {
                self.0.process(resource, target, token)
            }
            fn target_failed(&self, _target: &u32, _error: &BoxError) -> FailureAction {
                FailureAction::Drop
            }
        }

        let recorder = Arc::new(Recorder::default());
        recorder.failures_left.store(1, Ordering::SeqCst);
        let executor = PoolExecutor::new(thread_pool("dropper", PoolConfiguration::default()).unwrap());
        let engine = AsynchProcessing::new(Dropper(Arc::clone(&recorder)), executor, quick(1)).unwrap();
        assert!(engine.desc().starts_with("processing-"));
        engine.add_target(1, true).unwrap();
        engine.add_target(2, true).unwrap();
        engine.start().unwrap();
        assert!(wait_for(|| engine.exec_count() == 0 && engine.target_count() == 0));
        assert_eq!(*recorder.processed.lock(), vec![(0, 2)]);
    }

    #[test]
    fn test_max_target_count_drops_oldest() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine("trim", &recorder, quick(1).with_max_target_count(3));
        for t in 0..5 {
            engine.add_target(t, true).unwrap();
        }
        assert_eq!(engine.target_count(), 3);
        engine.start().unwrap();
        assert!(wait_for(|| recorder.processed.lock().len() == 3));
        let targets: Vec<u32> = recorder.processed.lock().iter().map(|(_, t)| *t).collect();
        assert_eq!(targets, vec![2, 3, 4]);
    }

    #[test]
    fn test_chunks_targets() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine("chunks", &recorder, quick(1).with_chunk_size(3));
        for t in 0..7 {
            engine.add_target(t, true).unwrap();
        }
        engine.start().unwrap();
        assert!(wait_for(|| recorder.processed.lock().len() == 7));
        assert_eq!(*recorder.chunks.lock(), vec![3, 3]);
    }

    #[test]
    fn test_resource_gate_pauses_launches() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine("gate", &recorder, quick(1));
        engine.start().unwrap();
        engine.resource_unavailable();
        engine.add_target(1, true).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.target_count(), 1);
        assert_eq!(recorder.acquired.load(Ordering::SeqCst), 0);
        engine.resource_available();
        assert!(wait_for(|| recorder.processed.lock().len() == 1));
    }

    #[test]
    fn test_unavailable_resource_keeps_targets() {
        let recorder = Arc::new(Recorder::default());
        recorder.unavailable.store(true, Ordering::SeqCst);
        let engine = engine("unavailable", &recorder, quick(1));
        engine.start().unwrap();
        engine.add_target(1, true).unwrap();
        assert!(wait_for(|| engine.exec_count() == 0));
        assert_eq!(engine.target_count(), 1);
    }

    #[test]
    fn test_close_releases_idle_resource_as_cancelled() {
        let recorder = Arc::new(Recorder::default());
        let config = ProcessingConfig::new(1).with_last_exec_sleep_interval(Some(Duration::from_secs(10)));
        let engine = engine("idle", &recorder, config);
        engine.start().unwrap();
        engine.add_target(1, true).unwrap();
        assert!(wait_for(|| recorder.processed.lock().len() == 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.exec_count(), 1);

        let started = Instant::now();
        assert!(engine.close(Some(Duration::from_secs(2))).unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(*recorder.cancelled.lock(), vec![0]);
        assert!(recorder.released.lock().is_empty());
        assert!(matches!(engine.add_target(2, false), Err(PoolError::Closed(_))));
    }

    #[test]
    fn test_idle_activity_picks_up_trickle() {
        let recorder = Arc::new(Recorder::default());
        let config = ProcessingConfig::new(1).with_last_exec_sleep_interval(Some(Duration::from_secs(1)));
        let engine = engine("trickle", &recorder, config);
        engine.start().unwrap();
        engine.add_target(1, true).unwrap();
        assert!(wait_for(|| recorder.processed.lock().len() == 1));
        engine.add_target(2, false).unwrap();
        assert!(wait_for(|| recorder.processed.lock().len() == 2));
        assert_eq!(recorder.acquired.load(Ordering::SeqCst), 1);
        engine.close(Some(Duration::from_secs(2))).unwrap();
    }

    #[test]
    fn test_buffering_defers_launch() {
        let recorder = Arc::new(Recorder::default());
        let config = quick(1).with_buffering(Duration::from_millis(150), 3);
        let engine = engine("buffered", &recorder, config);
        engine.start().unwrap();
        engine.add_target(1, true).unwrap();
        engine.add_target(2, true).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(recorder.processed.lock().is_empty());
        engine.add_target(3, true).unwrap();
        assert!(wait_for(|| recorder.processed.lock().len() == 3));

        engine.add_target(4, true).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(recorder.processed.lock().len(), 3);
        assert!(wait_for(|| recorder.processed.lock().len() == 4));
    }

    #[test]
    fn test_stop_during_resource_lookup_cancels_found_resource() {
        let recorder = Arc::new(Recorder::default());
        recorder.block_find.store(true, Ordering::SeqCst);
        let engine = engine("stop-lookup", &recorder, quick(1));
        engine.start().unwrap();
        engine.add_target(1, true).unwrap();
        assert!(wait_for(|| recorder.finding.load(Ordering::SeqCst)));

        engine.stop_activities();
        assert!(wait_for(|| engine.exec_count() == 0));
        assert!(recorder.saw_cancel.load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(*recorder.cancelled.lock(), vec![0]);
        assert!(recorder.released.lock().is_empty());
        assert!(recorder.processed.lock().is_empty());
        assert_eq!(engine.target_count(), 1);
    }

    #[test]
    fn test_deferred_targets_wait_for_launch() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine("deferred", &recorder, quick(1));
        engine.start().unwrap();
        engine.add_target(1, false).unwrap();
        engine.add_target(2, false).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.exec_count(), 0);
        assert_eq!(engine.target_count(), 2);
        assert!(recorder.processed.lock().is_empty());

        engine.add_target(3, true).unwrap();
        assert!(wait_for(|| recorder.processed.lock().len() == 3));
        let targets: Vec<u32> = recorder.processed.lock().iter().map(|(_, t)| *t).collect();
        assert_eq!(targets, vec![1, 2, 3]);
    }

    #[test]
    fn test_performance_check_scales_out() {
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(15)),
            ..Recorder::default()
        });
        let config = quick(3).with_check_interval(Some(Duration::from_millis(10)));
        let engine = engine("scale", &recorder, config);
        engine.start().unwrap();
        for t in 0..40 {
            engine.add_target(t, true).unwrap();
        }
        assert!(wait_for(|| recorder.processed.lock().len() == 40));
        let peak = recorder.peak.load(Ordering::SeqCst);
        assert!((2..=3).contains(&peak), "peak concurrency {peak}");
    }

    #[test]
    fn test_panic_corrupts_engine() {
        let recorder = Arc::new(Recorder::default());
        *recorder.panic_on.lock() = Some(9);
        let engine = engine("corrupt", &recorder, quick(1));
        engine.start().unwrap();
        engine.add_target(9, true).unwrap();
        assert!(wait_for(|| engine.state() == ProcessingState::Corrupted));
        assert!(matches!(engine.add_target(1, false), Err(PoolError::Corrupted(_))));
        assert!(matches!(engine.close(None), Err(PoolError::Corrupted(_))));
        assert!(wait_for(|| recorder.cancelled.lock().len() == 1));
    }

    #[test]
    fn test_debug_string() {
        let recorder = Arc::new(Recorder::default());
        let engine = engine("dbg", &recorder, quick(1));
        engine.add_target(1, true).unwrap();
        let s = engine.debug_string();
        assert!(s.starts_with("dbg state = CREATED; targets = 1"));
    }
}
