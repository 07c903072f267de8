//! Fail-fast wrapper counting consecutive object errors

use crate::config::PoolConfiguration;
use crate::errors::BoxError;
use crate::factory::ObjectFactory;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pooled object that turns unusable after too many consecutive errors
///
/// # Examples
///
/// ```
/// use courier_core::ErrorAware;
///
/// let mut conn = ErrorAware::new(0u32, 2);
/// conn.record_error();
/// assert!(conn.is_usable());
/// conn.record_error();
/// assert!(!conn.is_usable());
///
/// conn.record_success();
/// assert!(conn.is_usable());
/// ```
#[derive(Debug)]
pub struct ErrorAware<O> {
    inner: O,
    error_count: AtomicUsize,
    max_error_count: usize,
}

impl<O> ErrorAware<O> {
    pub fn new(inner: O, max_error_count: usize) -> Self {
        Self {
            inner,
            error_count: AtomicUsize::new(0),
            max_error_count,
        }
    }

    /// Record a failed operation; returns whether the object is still usable.
    pub fn record_error(&self) -> bool {
        let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        count < self.max_error_count
    }

    /// Record a successful operation, resetting the error streak.
    pub fn record_success(&self) {
        self.error_count.store(0, Ordering::Relaxed);
    }

    /// Current streak of consecutive errors
    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Whether the streak is still below the limit
    pub fn is_usable(&self) -> bool {
        self.error_count() < self.max_error_count
    }

    /// Run an operation on the inner object and record its outcome.
    pub fn call<R, E>(&mut self, op: impl FnOnce(&mut O) -> Result<R, E>) -> Result<R, E> {
        let res = op(&mut self.inner);
        if res.is_ok() {
            self.record_success();
        } else {
            self.record_error();
        }
        res
    }

    /// Unwrap the inner object
    pub fn into_inner(self) -> O {
        self.inner
    }
}

impl<O> Deref for ErrorAware<O> {
    type Target = O;

    fn deref(&self) -> &O {
        &self.inner
    }
}

impl<O> DerefMut for ErrorAware<O> {
    fn deref_mut(&mut self) -> &mut O {
        &mut self.inner
    }
}

/// Factory wrapper producing [`ErrorAware`] objects (`max-error-count`)
pub struct ErrorAwareFactory<F> {
    inner: F,
    max_error_count: usize,
}

impl<F: ObjectFactory> ErrorAwareFactory<F> {
    pub fn new(inner: F, max_error_count: usize) -> Self {
        Self {
            inner,
            max_error_count: max_error_count.max(1),
        }
    }

    /// Wrap `inner` with the configured `max-error-count`; without one,
    /// errors never make an object unusable.
    pub fn from_config(inner: F, config: &PoolConfiguration) -> Self {
        Self::new(inner, config.max_error_count.unwrap_or(usize::MAX))
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Consecutive errors after which objects turn unusable
    pub fn max_error_count(&self) -> usize {
        self.max_error_count
    }
}

impl<F: ObjectFactory> ObjectFactory for ErrorAwareFactory<F> {
    type Object = ErrorAware<F::Object>;

    fn allocate(&self) -> Result<Self::Object, BoxError> {
        Ok(ErrorAware::new(self.inner.allocate()?, self.max_error_count))
    }

    fn deallocate(&self, object: Self::Object) {
        self.inner.deallocate(object.into_inner());
    }

    fn check(&self, object: &Self::Object) -> Result<bool, BoxError> {
        if !object.is_usable() {
            return Ok(false);
        }
        self.inner.check(&object.inner)
    }

    fn acquired(&self, object: &Self::Object) {
        self.inner.acquired(&object.inner);
    }

    fn released(&self, object: &Self::Object) -> bool {
        object.is_usable() && self.inner.released(&object.inner)
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}
