//! Single-assignment future with listener replay

use crate::errors::{PoolError, PoolResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::error;

pub type Listener<V> = Box<dyn FnOnce(&BaseFuture<V>) + Send + 'static>;

/// Identifies a registered listener for [`BaseFuture::remove_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Ready,
    Cancelled,
}

struct State<V> {
    value: Option<V>,
    status: Status,
    first: Option<(ListenerKey, Listener<V>)>,
    others: Vec<(ListenerKey, Listener<V>)>,
    wakers: Vec<Waker>,
    next_key: u64,
}

impl<V> State<V> {
    fn take_listeners(&mut self) -> Vec<Listener<V>> {
        let mut listeners = Vec::with_capacity(1 + self.others.len());
        listeners.extend(self.first.take().map(|(_, l)| l));
        listeners.extend(mem::take(&mut self.others).into_iter().map(|(_, l)| l));
        listeners
    }
}

struct Shared<V> {
    state: Mutex<State<V>>,
    cond: Condvar,
}

/// A value delivered once, with blocking waits and completion listeners.
///
/// The first `set_value` or `cancel` wins; later calls change nothing.
/// Listeners run in registration order on the completing thread, or right
/// away inside `add_listener` when the future is already done.
///
/// # Examples
///
/// ```
/// use courier_core::BaseFuture;
/// use std::time::Duration;
///
/// let future = BaseFuture::new();
/// let producer = future.clone();
/// std::thread::spawn(move || producer.set_value(42));
/// assert_eq!(future.get_timeout(Duration::from_secs(1)).unwrap(), 42);
/// ```
pub struct BaseFuture<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for BaseFuture<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: Clone + Send + 'static> BaseFuture<V> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    value: None,
                    status: Status::Pending,
                    first: None,
                    others: Vec::new(),
                    wakers: Vec::new(),
                    next_key: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// A future that is already done with `value`
    pub fn ready(value: V) -> Self {
        let future = Self::new();
        future.set_value(value);
        future
    }

    /// Complete with `value`; returns `false` if already done.
    pub fn set_value(&self, value: V) -> bool {
        self.complete(Status::Ready, Some(value))
    }

    /// Complete without a value; returns `false` if already done.
    pub fn cancel(&self) -> bool {
        self.complete(Status::Cancelled, None)
    }

    fn complete(&self, status: Status, value: Option<V>) -> bool {
        let (listeners, wakers) = {
            let mut state = self.shared.state.lock();
            if state.status != Status::Pending {
                return false;
            }
            state.status = status;
            state.value = value;
            self.shared.cond.notify_all();
            (state.take_listeners(), mem::take(&mut state.wakers))
        };
        for waker in wakers {
            waker.wake();
        }
        for listener in listeners {
            self.notify(listener);
        }
        true
    }

    fn notify(&self, listener: Listener<V>) {
        if panic::catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
            error!("future listener panicked");
        }
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().status != Status::Pending
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().status == Status::Cancelled
    }

    /// Register `listener`; it is invoked immediately when already done.
    ///
    /// Returns a key for removal, or `None` if the listener already ran.
    pub fn add_listener(&self, listener: impl FnOnce(&BaseFuture<V>) + Send + 'static) -> Option<ListenerKey> {
        let listener: Listener<V> = Box::new(listener);
        {
            let mut state = self.shared.state.lock();
            if state.status == Status::Pending {
                let key = ListenerKey(state.next_key);
                state.next_key += 1;
                if state.first.is_none() && state.others.is_empty() {
                    state.first = Some((key, listener));
                } else {
                    state.others.push((key, listener));
                }
                return Some(key);
            }
        }
        self.notify(listener);
        None
    }

    /// Unregister a pending listener; returns whether it was found.
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        let mut state = self.shared.state.lock();
        if state.first.as_ref().is_some_and(|(k, _)| *k == key) {
            state.first = None;
            return true;
        }
        let before = state.others.len();
        state.others.retain(|(k, _)| *k != key);
        state.others.len() != before
    }

    /// Wait until done; returns whether the future completed in time.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        while state.status == Status::Pending {
            match deadline {
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
        state.status != Status::Pending
    }

    /// Block until done and return the value.
    pub fn get(&self) -> PoolResult<V> {
        self.join(None);
        self.outcome().unwrap_or(Err(PoolError::Cancelled))
    }

    /// Block up to `timeout` for the value.
    pub fn get_timeout(&self, timeout: Duration) -> PoolResult<V> {
        if !self.join(Some(timeout)) {
            return Err(PoolError::Timeout(timeout));
        }
        self.outcome().unwrap_or(Err(PoolError::Cancelled))
    }

    /// The value if already set
    pub fn try_get(&self) -> Option<V> {
        self.shared.state.lock().value.clone()
    }

    fn outcome(&self) -> Option<PoolResult<V>> {
        let state = self.shared.state.lock();
        match state.status {
            Status::Pending => None,
            Status::Cancelled => Some(Err(PoolError::Cancelled)),
            Status::Ready => state.value.clone().map(Ok),
        }
    }
}

impl<V: Clone + Send + 'static> Default for BaseFuture<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + 'static> Future for BaseFuture<V> {
    type Output = PoolResult<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        match state.status {
            Status::Ready => Poll::Ready(state.value.clone().ok_or(PoolError::Cancelled)),
            Status::Cancelled => Poll::Ready(Err(PoolError::Cancelled)),
            Status::Pending => {
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<V> fmt::Debug for BaseFuture<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.shared.state.try_lock().map(|s| s.status);
        f.debug_struct("BaseFuture").field("status", &status).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_second_set_is_ignored() {
        let future = BaseFuture::new();
        assert!(future.set_value(1));
        assert!(!future.set_value(2));
        assert!(!future.cancel());
        assert_eq!(future.get().unwrap(), 1);
    }

    #[test]
    fn test_listeners_replayed_in_order() {
        let future = BaseFuture::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            assert!(future.add_listener(move |_| order.lock().push(i)).is_some());
        }
        assert!(order.lock().is_empty());
        future.set_value("done");
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_listener_after_ready_runs_inline() {
        let future = BaseFuture::ready(5);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let key = future.add_listener(move |f| {
            s.store(f.try_get().unwrap(), Ordering::SeqCst);
        });
        assert!(key.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_removed_listener_not_called() {
        let future = BaseFuture::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = Arc::clone(&hits);
        let h2 = Arc::clone(&hits);
        let first = future.add_listener(move |_| { h1.fetch_add(1, Ordering::SeqCst); }).unwrap();
        future.add_listener(move |_| { h2.fetch_add(10, Ordering::SeqCst); });
        assert!(future.remove_listener(first));
        assert!(!future.remove_listener(first));
        future.set_value(());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panicking_listener_does_not_reach_setter() {
        let future = BaseFuture::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        future.add_listener(|_| panic!("listener failure"));
        future.add_listener(move |_| { h.fetch_add(1, Ordering::SeqCst); });
        assert!(future.set_value(1u8));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_and_timeouts() {
        let future: BaseFuture<u32> = BaseFuture::new();
        assert!(matches!(
            future.get_timeout(Duration::from_millis(10)),
            Err(PoolError::Timeout(_))
        ));
        assert!(!future.join(Some(Duration::from_millis(10))));
        future.cancel();
        assert!(future.is_cancelled());
        assert!(future.join(Some(Duration::ZERO)));
        assert_eq!(future.get(), Err(PoolError::Cancelled));
    }

    #[test]
    fn test_get_blocks_until_set() {
        let future = BaseFuture::new();
        let producer = future.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.set_value(String::from("late"));
        });
        assert_eq!(future.get().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_await_future() {
        let future = BaseFuture::new();
        let producer = future.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.set_value(7);
        });
        assert_eq!(future.await.unwrap(), 7);
    }
}
