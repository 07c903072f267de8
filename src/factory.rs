//! Pluggable resource factories

use crate::errors::BoxError;

/// Creates, validates and destroys the objects managed by a pool.
///
/// Calls may run on the pool's caller thread or on a borrowed work thread,
/// depending on the pool's execute policy.
pub trait ObjectFactory: Send + Sync + 'static {
    type Object: Send + 'static;

    /// Create a new object.
    fn allocate(&self) -> Result<Self::Object, BoxError>;

    /// Destroy an object removed from the pool.
    fn deallocate(&self, object: Self::Object);

    /// Health check of a free object.
    fn check(&self, _object: &Self::Object) -> Result<bool, BoxError> {
        Ok(true)
    }

    /// Called when an object is handed out.
    fn acquired(&self, _object: &Self::Object) {}

    /// Called when an object comes back; `false` removes it from the pool.
    fn released(&self, _object: &Self::Object) -> bool {
        true
    }

    /// Release factory-wide state when the pool closes.
    fn dispose(&self) {}
}

/// Factory built from an allocation closure; objects are deallocated by drop.
///
/// # Examples
///
/// ```
/// use courier_core::{FnFactory, ObjectFactory};
///
/// let factory = FnFactory::new(|| Ok(String::from("conn")));
/// assert_eq!(factory.allocate().unwrap(), "conn");
/// ```
pub struct FnFactory<F> {
    alloc: F,
}

impl<F> FnFactory<F> {
    pub fn new(alloc: F) -> Self {
        Self { alloc }
    }
}

impl<F, T> ObjectFactory for FnFactory<F>
where
    F: Fn() -> Result<T, BoxError> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Object = T;

    fn allocate(&self) -> Result<T, BoxError> {
        (self.alloc)()
    }

    fn deallocate(&self, object: T) {
        drop(object);
    }
}
