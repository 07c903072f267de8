//! Capacity-managed object pool with background shrink, check and expiry

use crate::config::PoolConfiguration;
use crate::error_aware::ErrorAwareFactory;
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{EntryInfo, EvictionPolicy, PooledEntry};
use crate::factory::ObjectFactory;
use crate::health::HealthStatus;
use crate::metrics::{MetricsTracker, PoolMetrics};
use crate::policy::{AsyncPolicy, ExecPolicy, Operation, SyncPolicy};
use crate::timer::{Timer, TimerHandle, TimerTask};
use crate::work_thread::ThreadPool;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A checked-out pool object, returned to the pool when dropped
pub struct PooledObject<F: ObjectFactory, P: ExecPolicy = SyncPolicy> {
    value: Option<F::Object>,
    object_id: usize,
    stale: bool,
    pool: Arc<PoolShared<F, P>>,
}

impl<F: ObjectFactory, P: ExecPolicy> PooledObject<F, P> {
    /// Id of the pool entry holding this object
    pub fn id(&self) -> usize {
        self.object_id
    }

    /// Remove the object from the pool instead of recycling it on drop.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Return the object and remove it from the pool right away.
    pub fn release_and_remove(mut self) {
        self.stale = true;
        if let Some(value) = self.value.take() {
            self.pool.release(self.object_id, value, true);
        }
    }

    /// Take the object out of the pool for good; it is not deallocated.
    pub fn detach(mut self) -> F::Object {
        self.pool.forget(self.object_id);
        self.value.take().expect("Value already taken")
    }
}

impl<F: ObjectFactory, P: ExecPolicy> Deref for PooledObject<F, P> {
    type Target = F::Object;

    fn deref(&self) -> &Self::Target {
        self.value.as_ref().expect("Value already taken")
    }
}

impl<F: ObjectFactory, P: ExecPolicy> DerefMut for PooledObject<F, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut().expect("Value already taken")
    }
}

impl<F: ObjectFactory, P: ExecPolicy> Drop for PooledObject<F, P> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(self.object_id, value, self.stale);
        }
    }
}

impl<F, P> fmt::Debug for PooledObject<F, P>
where
    F: ObjectFactory,
    F::Object: fmt::Debug,
    P: ExecPolicy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledObject")
            .field("pool", &self.pool.desc)
            .field("id", &self.object_id)
            .field("value", &self.value)
            .finish()
    }
}

struct PoolState<O> {
    entries: Vec<PooledEntry<O>>,
    reserved: usize,
    started: bool,
    max_capacity: Option<usize>,
    next_id: usize,
    timer: Option<Timer>,
    tasks: Vec<TimerHandle>,
}

impl<O> PoolState<O> {
    fn room(&self) -> Option<usize> {
        self.max_capacity
            .map(|max| max.saturating_sub(self.entries.len() + self.reserved))
    }

    fn reached_max_capacity(&self) -> bool {
        self.room() == Some(0)
    }

    fn position(&self, id: usize) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

pub(crate) struct PoolShared<F: ObjectFactory, P: ExecPolicy> {
    desc: String,
    factory: Arc<F>,
    policy: P,
    config: PoolConfiguration,
    eviction: EvictionPolicy,
    state: Mutex<PoolState<F::Object>>,
    metrics: MetricsTracker,
}

/// Thread-safe pool of reusable objects created by an [`ObjectFactory`].
///
/// Handles are cheap to clone and share one pool. Objects are checked out
/// with [`get_object`](Self::get_object) and return on drop of the guard.
///
/// # Examples
///
/// ```
/// use courier_core::{FnFactory, ObjectPool, PoolConfiguration};
///
/// let pool = ObjectPool::new(
///     "numbers",
///     FnFactory::new(|| Ok(42)),
///     PoolConfiguration::new().with_capacity(1, 1, Some(2)),
/// ).unwrap();
/// pool.start().unwrap();
/// {
///     let obj = pool.get_object().unwrap();
///     assert_eq!(*obj, 42);
/// }
/// assert_eq!(pool.free_count(), 1);
/// pool.close().unwrap();
/// ```
pub struct ObjectPool<F: ObjectFactory, P: ExecPolicy = SyncPolicy> {
    shared: Arc<PoolShared<F, P>>,
}

impl<F: ObjectFactory, P: ExecPolicy> Clone for ObjectPool<F, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Pool running factory calls inline
pub type SyncObjectPool<F> = ObjectPool<F, SyncPolicy>;

/// Pool running factory calls on borrowed work threads with timeouts
pub type AsyncObjectPool<F> = ObjectPool<F, AsyncPolicy>;

impl<F: ObjectFactory> ObjectPool<F, SyncPolicy> {
    /// Create a stopped pool calling the factory inline
    pub fn new(desc: impl Into<String>, factory: F, config: PoolConfiguration) -> PoolResult<Self> {
        Self::with_policy(desc, factory, config, SyncPolicy)
    }
}

impl<F: ObjectFactory> ObjectPool<F, AsyncPolicy> {
    /// Create a stopped pool running factory calls on threads from `threads`
    pub fn new_async(
        desc: impl Into<String>,
        factory: F,
        threads: ThreadPool,
        config: PoolConfiguration,
    ) -> PoolResult<Self> {
        let policy = AsyncPolicy::new(threads, config.allocate_timeout, config.check_timeout);
        Self::with_policy(desc, factory, config, policy)
    }
}

impl<F: ObjectFactory> ObjectPool<ErrorAwareFactory<F>, SyncPolicy> {
    /// Create a stopped pool whose objects turn unusable after
    /// `config.max_error_count` consecutive errors.
    pub fn new_error_aware(desc: impl Into<String>, factory: F, config: PoolConfiguration) -> PoolResult<Self> {
        let factory = ErrorAwareFactory::from_config(factory, &config);
        Self::new(desc, factory, config)
    }
}

impl<F: ObjectFactory> ObjectPool<ErrorAwareFactory<F>, AsyncPolicy> {
    /// Async counterpart of [`new_error_aware`](ObjectPool::new_error_aware)
    pub fn new_async_error_aware(
        desc: impl Into<String>,
        factory: F,
        threads: ThreadPool,
        config: PoolConfiguration,
    ) -> PoolResult<Self> {
        let factory = ErrorAwareFactory::from_config(factory, &config);
        Self::new_async(desc, factory, threads, config)
    }
}

impl<F: ObjectFactory, P: ExecPolicy> ObjectPool<F, P> {
    /// Create a stopped pool with an explicit execute policy
    pub fn with_policy(
        desc: impl Into<String>,
        factory: F,
        config: PoolConfiguration,
        policy: P,
    ) -> PoolResult<Self> {
        config.validate()?;
        let eviction = EvictionPolicy {
            expire_period: config.expire_period,
            idle_period: config.shrink_obsolete_period,
        };
        let state = PoolState {
            entries: Vec::new(),
            reserved: 0,
            started: false,
            max_capacity: config.max_capacity,
            next_id: 0,
            timer: None,
            tasks: Vec::new(),
        };
        Ok(Self {
            shared: Arc::new(PoolShared {
                desc: desc.into(),
                factory: Arc::new(factory),
                policy,
                config,
                eviction,
                state: Mutex::new(state),
                metrics: MetricsTracker::new(),
            }),
        })
    }

    /// Use a shared timer for maintenance instead of a pool-owned one
    pub fn with_timer(self, timer: Timer) -> Self {
        self.shared.state.lock().timer = Some(timer);
        self
    }

    /// Pre-allocate the initial objects and schedule maintenance.
    ///
    /// Allocation failures are logged and skipped.
    pub fn start(&self) -> PoolResult<()> {
        self.shared.start()
    }

    /// Check out a free, unexpired, valid object, growing the pool if needed
    pub fn get_object(&self) -> PoolResult<PooledObject<F, P>> {
        self.shared.get_object()
    }

    /// Check out an object without blocking the async runtime.
    pub async fn get_object_async(&self) -> PoolResult<PooledObject<F, P>> {
        let timeout = self.shared.config.operation_timeout.unwrap_or(Duration::from_secs(30));
        let pool = self.clone();
        let task = tokio::task::spawn_blocking(move || pool.get_object());

        tokio::time::timeout(timeout, task)
            .await
            .map_err(|_| PoolError::Timeout(timeout))?
            .map_err(|_| PoolError::Cancelled)?
    }

    /// Remove idle objects and replace expired ones
    pub fn shrink(&self) -> PoolResult<()> {
        self.shared.shrink()
    }

    /// Replace free objects failing the factory's health check
    pub fn check(&self) -> PoolResult<()> {
        self.shared.check()
    }

    /// Cancel maintenance and deallocate every free object.
    ///
    /// Objects still checked out are reported and left alone; they are
    /// deallocated when their guard drops.
    pub fn close(&self) -> PoolResult<()> {
        self.shared.close();
        Ok(())
    }

    /// Pool description used in logs and metrics
    pub fn desc(&self) -> &str {
        &self.shared.desc
    }

    /// The factory creating this pool's objects
    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Number of entries, free and in use
    pub fn size(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Entries ready to be checked out
    pub fn free_count(&self) -> usize {
        self.shared.state.lock().entries.iter().filter(|e| e.is_free()).count()
    }

    /// Entries currently checked out
    pub fn in_use_count(&self) -> usize {
        self.shared.state.lock().entries.iter().filter(|e| e.in_use()).count()
    }

    /// Whether the pool is started and not closed
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Hard capacity, `None` when unbounded
    pub fn max_capacity(&self) -> Option<usize> {
        self.shared.state.lock().max_capacity
    }

    /// Change the hard capacity; existing entries above it are kept.
    pub fn set_max_capacity(&self, max: Option<usize>) {
        self.shared.state.lock().max_capacity = max;
    }

    /// Configuration the pool was built with
    pub fn config(&self) -> &PoolConfiguration {
        &self.shared.config
    }

    /// Diagnostic snapshot of every entry
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.shared.state.lock().entries.iter().map(PooledEntry::info).collect()
    }

    /// Get health status
    pub fn get_health_status(&self) -> HealthStatus {
        let state = self.shared.state.lock();
        let free = state.entries.iter().filter(|e| e.is_free()).count();
        HealthStatus::new(state.entries.len(), free, state.max_capacity, state.started)
    }

    /// Get pool metrics
    pub fn get_metrics(&self) -> PoolMetrics {
        let state = self.shared.state.lock();
        let free = state.entries.iter().filter(|e| e.is_free()).count();
        self.shared
            .metrics
            .get_metrics(state.entries.len(), free, state.max_capacity)
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.get_metrics().export()
    }

    /// Export metrics in Prometheus format
    #[cfg(feature = "metrics")]
    pub fn export_metrics_prometheus(&self, tags: Option<&HashMap<String, String>>) -> String {
        crate::metrics::MetricsExporter::export_prometheus(&self.get_metrics(), &self.shared.desc, tags)
    }
}

impl<F: ObjectFactory, P: ExecPolicy> fmt::Display for ObjectPool<F, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries();
        let free = entries.iter().filter(|e| !e.in_use).count();
        writeln!(
            f,
            "ObjectPool '{}' Size = {}; Free count = {}",
            self.shared.desc,
            entries.len(),
            free
        )?;
        for (i, e) in entries.iter().enumerate() {
            write!(f, "{i} --> id = {} age = {:?} free = {}", e.id, e.age, !e.in_use)?;
            if let Some(idle) = e.idle {
                write!(f, " idle = {idle:?}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl<F: ObjectFactory, P: ExecPolicy> PoolShared<F, P> {
    fn ensure_open(&self, state: &PoolState<F::Object>) -> PoolResult<()> {
        if state.started {
            Ok(())
        } else {
            Err(PoolError::Closed(self.desc.clone()))
        }
    }

    fn with_batch<R>(&self, f: impl FnOnce(&mut P::Batch) -> R) -> R {
        let mut batch = self.policy.begin_batch();
        let res = f(&mut batch);
        self.policy.end_batch(batch);
        res
    }

    fn allocate_object(&self, batch: Option<&mut P::Batch>) -> Option<F::Object> {
        let factory = Arc::clone(&self.factory);
        match self.policy.run(batch, Operation::Allocate, move || factory.allocate()) {
            Ok(Ok(object)) => {
                self.metrics.allocated.fetch_add(1, Ordering::Relaxed);
                Some(object)
            }
            Ok(Err(e)) => {
                self.metrics.allocation_failures.fetch_add(1, Ordering::Relaxed);
                error!(pool = %self.desc, error = %e, "error while allocating new pool object");
                None
            }
            Err(e) => {
                self.metrics.allocation_failures.fetch_add(1, Ordering::Relaxed);
                error!(pool = %self.desc, error = %e, "asynch allocation failed");
                None
            }
        }
    }

    fn deallocate_object(&self, batch: Option<&mut P::Batch>, object: F::Object) {
        debug!(pool = %self.desc, "returning object from pool");
        let factory = Arc::clone(&self.factory);
        match self.policy.run(batch, Operation::Deallocate, move || factory.deallocate(object)) {
            Ok(()) => {
                self.metrics.deallocated.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(pool = %self.desc, error = %e, "error returning object from pool");
            }
        }
    }

    /// Validate `object`; the object is lost when the check times out.
    fn check_object(&self, batch: Option<&mut P::Batch>, object: F::Object) -> (Option<F::Object>, bool) {
        let factory = Arc::clone(&self.factory);
        let res = self.policy.run(batch, Operation::Check, move || {
            let valid = factory.check(&object);
            (object, valid)
        });
        match res {
            Ok((object, Ok(true))) => (Some(object), true),
            Ok((object, Ok(false))) => {
                warn!(pool = %self.desc, "pool object failed checking");
                (Some(object), false)
            }
            Ok((object, Err(e))) => {
                warn!(pool = %self.desc, error = %e, "error while checking object");
                (Some(object), false)
            }
            Err(e) => {
                warn!(pool = %self.desc, error = %e, "object check did not complete");
                (None, false)
            }
        }
    }

    /// Allocate up to `count` objects outside the lock and add them to the pool.
    ///
    /// With `claim`, the first new object is handed back already captured so a
    /// concurrent caller cannot take it first.
    fn add_new_objects(
        &self,
        mut batch: Option<&mut P::Batch>,
        count: usize,
        claim: bool,
    ) -> (usize, Option<(usize, F::Object)>) {
        let reserved = {
            let mut state = self.state.lock();
            if !state.started {
                return (0, None);
            }
            let n = state.room().map_or(count, |room| room.min(count));
            state.reserved += n;
            n
        };

        let mut objects = Vec::with_capacity(reserved);
        for _ in 0..reserved {
            if let Some(object) = self.allocate_object(batch.as_deref_mut()) {
                objects.push(object);
            }
        }

        let added = objects.len();
        let mut claimed = None;
        let orphans = {
            let mut state = self.state.lock();
            state.reserved -= reserved;
            if state.started {
                for object in objects.drain(..) {
                    let id = state.next_id;
                    state.next_id += 1;
                    let mut entry = PooledEntry::new(id, object);
                    if claim && claimed.is_none() {
                        claimed = entry.capture().map(|object| (id, object));
                    }
                    state.entries.push(entry);
                }
            }
            objects
        };
        for object in orphans {
            self.deallocate_object(batch.as_deref_mut(), object);
        }
        debug!(pool = %self.desc, added, requested = count, claimed = claimed.is_some(), "pool added objects");
        (added, claimed)
    }

    /// Pop the first free, unexpired entry that passes the health check.
    fn find_free_object(&self) -> PoolResult<Option<(usize, F::Object)>> {
        loop {
            let (id, object) = {
                let mut state = self.state.lock();
                self.ensure_open(&state)?;
                let now = Instant::now();
                let candidate = state
                    .entries
                    .iter_mut()
                    .find(|e| e.is_free() && !e.is_expired(&self.eviction, now));
                match candidate {
                    Some(entry) => match entry.capture() {
                        Some(object) => (entry.id, object),
                        None => continue,
                    },
                    None => return Ok(None),
                }
            };

            match self.check_object(None, object) {
                (Some(object), true) => return Ok(Some((id, object))),
                (object, _) => {
                    self.metrics.validation_failures.fetch_add(1, Ordering::Relaxed);
                    self.remove_entry(id);
                    if let Some(object) = object {
                        self.deallocate_object(None, object);
                    }
                }
            }
        }
    }

    fn remove_entry(&self, id: usize) -> bool {
        let mut state = self.state.lock();
        match state.position(id) {
            Some(idx) => {
                state.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    fn checked_out(self: &Arc<Self>, id: usize, object: F::Object) -> PooledObject<F, P> {
        self.factory.acquired(&object);
        self.metrics.total_retrieved.fetch_add(1, Ordering::Relaxed);
        PooledObject {
            value: Some(object),
            object_id: id,
            stale: false,
            pool: Arc::clone(self),
        }
    }

    fn get_object(self: &Arc<Self>) -> PoolResult<PooledObject<F, P>> {
        debug!(pool = %self.desc, size = self.state.lock().entries.len(), "entering get_object");

        if let Some((id, object)) = self.find_free_object()? {
            return Ok(self.checked_out(id, object));
        }

        self.expire()?;
        if let Some((id, object)) = self.find_free_object()? {
            return Ok(self.checked_out(id, object));
        }

        self.ensure_capacity()?;
        if let (_, Some((id, object))) = self.add_new_objects(None, self.config.increment_capacity, true) {
            return Ok(self.checked_out(id, object));
        }
        if let Some((id, object)) = self.find_free_object()? {
            return Ok(self.checked_out(id, object));
        }

        self.ensure_capacity()?;
        Err(PoolError::AllocationFailed {
            pool: self.desc.clone(),
        })
    }

    fn ensure_capacity(&self) -> PoolResult<()> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        if state.reached_max_capacity() {
            self.metrics.capacity_exceeded_events.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::CapacityExceeded {
                pool: self.desc.clone(),
                max: state.max_capacity.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn release(&self, id: usize, object: F::Object, remove: bool) {
        debug!(pool = %self.desc, id, remove, "releasing object");
        let remove = remove || !self.factory.released(&object);
        let orphan = {
            let mut state = self.state.lock();
            match state.position(id) {
                Some(idx) if !remove => {
                    state.entries[idx].release(object);
                    None
                }
                Some(idx) => {
                    state.entries.remove(idx);
                    Some(object)
                }
                None => {
                    warn!(pool = %self.desc, id, "released object does not belong to the pool");
                    Some(object)
                }
            }
        };
        self.metrics.total_returned.fetch_add(1, Ordering::Relaxed);
        if let Some(object) = orphan {
            self.deallocate_object(None, object);
        }
    }

    fn forget(&self, id: usize) {
        self.remove_entry(id);
    }

    fn start(self: &Arc<Self>) -> PoolResult<()> {
        {
            let mut state = self.state.lock();
            if state.started {
                return Ok(());
            }
            state.started = true;
        }

        let added = self.with_batch(|batch| self.add_new_objects(Some(batch), self.config.initial_capacity, false).0);
        if added < self.config.initial_capacity {
            warn!(
                pool = %self.desc,
                added,
                initial = self.config.initial_capacity,
                "pool started below initial capacity"
            );
        }

        let intervals = [
            (self.config.shrink_interval, "shrink"),
            (self.config.check_interval, "check"),
        ];
        if intervals.iter().all(|(i, _)| i.is_none()) {
            return Ok(());
        }

        let timer = {
            let mut state = self.state.lock();
            match &state.timer {
                Some(timer) => timer.clone(),
                None => {
                    let timer = Timer::new(format!("{}-Timer", self.desc))?;
                    state.timer = Some(timer.clone());
                    timer
                }
            }
        };
        let mut handles = Vec::new();
        for (interval, kind) in intervals {
            let Some(interval) = interval else { continue };
            let pool: Weak<Self> = Arc::downgrade(self);
            let task: TimerTask = Arc::new(move || {
                let Some(pool) = pool.upgrade() else { return };
                let res = if kind == "shrink" { pool.shrink() } else { pool.check() };
                if let Err(e) = res {
                    debug!(pool = %pool.desc, error = %e, task = kind, "maintenance skipped");
                }
            });
            handles.push(timer.schedule_periodic(interval, interval, task));
        }
        self.state.lock().tasks.extend(handles);
        Ok(())
    }

    fn shrink(&self) -> PoolResult<()> {
        debug!(pool = %self.desc, "entering shrink");
        let removed = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            let now = Instant::now();
            let limit = self.config.shrink_capacity.unwrap_or(usize::MAX);
            let mut removed = Vec::new();
            let mut idx = 0;
            while idx < state.entries.len() && removed.len() < limit {
                if state.entries[idx].is_obsolete(&self.eviction, now) {
                    let mut entry = state.entries.remove(idx);
                    removed.extend(entry.capture());
                } else {
                    idx += 1;
                }
            }
            removed
        };

        self.metrics.shrunk.fetch_add(removed.len(), Ordering::Relaxed);
        self.with_batch(|batch| {
            debug!(pool = %self.desc, count = removed.len(), "pool returned objects");
            for object in removed {
                self.deallocate_object(Some(batch), object);
            }
            self.expire_in(batch)
        })
    }

    fn expire(&self) -> PoolResult<()> {
        if !self.eviction.expires() {
            return Ok(());
        }
        self.with_batch(|batch| self.expire_in(batch))
    }

    fn expire_in(&self, batch: &mut P::Batch) -> PoolResult<()> {
        let expired: Vec<F::Object> = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            let now = Instant::now();
            let (stale, keep): (Vec<_>, Vec<_>) = state
                .entries
                .drain(..)
                .partition(|e| e.is_free() && e.is_expired(&self.eviction, now));
            state.entries = keep;
            stale.into_iter().filter_map(|mut e| e.capture()).collect()
        };
        if expired.is_empty() {
            return Ok(());
        }

        let count = expired.len();
        debug!(pool = %self.desc, count, "expiring objects");
        self.metrics.expired.fetch_add(count, Ordering::Relaxed);
        for object in expired {
            self.deallocate_object(Some(batch), object);
        }
        self.add_new_objects(Some(batch), count, false);
        Ok(())
    }

    fn check(&self) -> PoolResult<()> {
        debug!(pool = %self.desc, "entering check");
        let ids: Vec<usize> = {
            let state = self.state.lock();
            self.ensure_open(&state)?;
            state.entries.iter().filter(|e| e.is_free()).map(|e| e.id).collect()
        };

        self.with_batch(|batch| {
            let mut removed = 0;
            for id in ids {
                let object = {
                    let mut state = self.state.lock();
                    let Some(idx) = state.position(id) else { continue };
                    match state.entries[idx].capture() {
                        Some(object) => object,
                        None => continue,
                    }
                };

                let (object, valid) = self.check_object(Some(batch), object);
                let orphan = {
                    let mut state = self.state.lock();
                    match (state.position(id), object) {
                        (Some(idx), Some(object)) if valid => {
                            state.entries[idx].restore(object);
                            None
                        }
                        (Some(idx), object) => {
                            state.entries.remove(idx);
                            removed += 1;
                            object
                        }
                        (None, object) => object,
                    }
                };
                if let Some(object) = orphan {
                    self.deallocate_object(Some(batch), object);
                }
            }
            if removed > 0 {
                self.metrics.validation_failures.fetch_add(removed, Ordering::Relaxed);
                self.add_new_objects(Some(batch), removed, false);
            }
        });
        Ok(())
    }

    fn close(&self) {
        let (free, in_use) = {
            let mut state = self.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            for task in state.tasks.drain(..) {
                task.cancel();
            }
            let mut free = Vec::new();
            let mut in_use = 0;
            for mut entry in state.entries.drain(..) {
                match entry.capture() {
                    Some(object) => free.push(object),
                    None => {
                        in_use += 1;
                        warn!(
                            pool = %self.desc,
                            id = entry.id,
                            "close cannot return object because it is in use"
                        );
                    }
                }
            }
            (free, in_use)
        };

        self.with_batch(|batch| {
            for object in free {
                self.deallocate_object(Some(batch), object);
            }
        });
        self.factory.dispose();
        debug!(pool = %self.desc, in_use, "pool closed");
    }
}

impl<F: ObjectFactory, P: ExecPolicy> Drop for PoolShared<F, P> {
    fn drop(&mut self) {
        self.close();
    }
}
