//! Named, case-insensitive registry of pools

use crate::errors::{PoolError, PoolResult};
use crate::factory::ObjectFactory;
use crate::policy::{ExecPolicy, SyncPolicy};
use crate::pool::ObjectPool;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error};

/// Registry of pools keyed by name, ignoring case.
///
/// # Examples
///
/// ```
/// use courier_core::{FnFactory, ObjectPool, PoolConfiguration, PoolRegistry};
///
/// let registry = PoolRegistry::new();
/// let pool = registry
///     .get_or_init("Buffers", || {
///         ObjectPool::new("buffers", FnFactory::new(|| Ok(Vec::<u8>::new())), PoolConfiguration::default())
///     })
///     .unwrap();
/// assert!(registry.get("BUFFERS").is_some());
/// registry.start_all();
/// assert!(pool.is_started());
/// registry.close_all();
/// ```
pub struct PoolRegistry<F: ObjectFactory, P: ExecPolicy = SyncPolicy> {
    pools: DashMap<String, ObjectPool<F, P>>,
}

impl<F: ObjectFactory, P: ExecPolicy> PoolRegistry<F, P> {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    fn key(name: &str) -> String {
        name.to_uppercase()
    }

    /// Register `pool` under `name`, refusing duplicates.
    pub fn register(&self, name: &str, pool: ObjectPool<F, P>) -> PoolResult<()> {
        match self.pools.entry(Self::key(name)) {
            Entry::Occupied(_) => Err(PoolError::InvalidConfig(format!(
                "pool '{name}' is already registered"
            ))),
            Entry::Vacant(slot) => {
                debug!(pool = %name, "pool registered");
                slot.insert(pool);
                Ok(())
            }
        }
    }

    /// Look up a registered pool by name
    pub fn get(&self, name: &str) -> Option<ObjectPool<F, P>> {
        self.pools.get(&Self::key(name)).map(|p| p.value().clone())
    }

    /// Return the pool named `name`, creating it with `init` on first use.
    ///
    /// `init` runs at most once per name even under concurrent lookups.
    pub fn get_or_init(
        &self,
        name: &str,
        init: impl FnOnce() -> PoolResult<ObjectPool<F, P>>,
    ) -> PoolResult<ObjectPool<F, P>> {
        if let Some(pool) = self.get(name) {
            return Ok(pool);
        }
        match self.pools.entry(Self::key(name)) {
            Entry::Occupied(slot) => Ok(slot.get().clone()),
            Entry::Vacant(slot) => {
                let pool = init()?;
                debug!(pool = %name, "pool created on first use");
                Ok(slot.insert(pool).value().clone())
            }
        }
    }

    /// Unregister a pool without closing it
    pub fn remove(&self, name: &str) -> Option<ObjectPool<F, P>> {
        self.pools.remove(&Self::key(name)).map(|(_, pool)| pool)
    }

    /// Names of all registered pools
    pub fn names(&self) -> Vec<String> {
        self.pools.iter().map(|p| p.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Start every registered pool, logging failures.
    pub fn start_all(&self) {
        for pool in self.snapshot() {
            if let Err(e) = pool.start() {
                error!(pool = %pool.desc(), error = %e, "pool failed to start");
            }
        }
    }

    /// Close every registered pool, logging failures.
    pub fn close_all(&self) {
        for pool in self.snapshot() {
            if let Err(e) = pool.close() {
                error!(pool = %pool.desc(), error = %e, "pool failed to close");
            }
        }
    }

    fn snapshot(&self) -> Vec<ObjectPool<F, P>> {
        self.pools.iter().map(|p| p.value().clone()).collect()
    }
}

impl<F: ObjectFactory, P: ExecPolicy> Default for PoolRegistry<F, P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfiguration;
    use crate::factory::FnFactory;
    use crate::errors::BoxError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    type IntFactory = FnFactory<fn() -> Result<u32, BoxError>>;

    fn int_pool(name: &str) -> PoolResult<ObjectPool<IntFactory>> {
        let alloc: fn() -> Result<u32, BoxError> = || Ok(1);
        ObjectPool::new(
            name,
            FnFactory::new(alloc),
            PoolConfiguration::new().with_capacity(1, 1, None),
        )
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let registry = PoolRegistry::new();
        registry.register("Conn", int_pool("conn").unwrap()).unwrap();
        assert!(registry.get("conn").is_some());
        assert!(registry.get("CONN").is_some());
        assert!(registry.register("cOnN", int_pool("dup").unwrap()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_or_init_runs_once() {
        let registry: Arc<PoolRegistry<IntFactory>> = Arc::new(PoolRegistry::new());
        let inits = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let inits = Arc::clone(&inits);
                thread::spawn(move || {
                    registry
                        .get_or_init("shared", || {
                            inits.fetch_add(1, Ordering::SeqCst);
                            int_pool("shared")
                        })
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_and_close_all() {
        let registry = PoolRegistry::new();
        registry.register("a", int_pool("a").unwrap()).unwrap();
        registry.register("b", int_pool("b").unwrap()).unwrap();
        registry.start_all();
        assert!(registry.get("a").unwrap().is_started());
        assert_eq!(registry.get("b").unwrap().size(), 1);
        registry.close_all();
        assert!(!registry.get("a").unwrap().is_started());
    }
}
