//! # courier_core
//!
//! Concurrency core of the courier data-integration server.
//!
//! ## Features
//!
//! - Object pools over a pluggable [`ObjectFactory`], with growth in
//!   increments, a hard capacity, validity checks, expiry and shrinking
//! - RAII return of pooled objects via [`PooledObject`]
//! - Pools whose factory calls run on work threads with timeouts
//!   ([`AsyncObjectPool`])
//! - Reusable single-task [`WorkThread`]s and an [`Executor`] built on a
//!   pool of them
//! - [`BaseFuture`], a single-assignment future with listener replay
//! - [`AsyncBuffer`], a batching queue drained by a bounded number of workers
//! - [`AsynchProcessing`], a target queue processed against lazily acquired
//!   resources with adaptive parallelism
//! - Health status, metrics and Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use courier_core::{FnFactory, ObjectPool, PoolConfiguration};
//!
//! let pool = ObjectPool::new(
//!     "numbers",
//!     FnFactory::new(|| Ok(7u32)),
//!     PoolConfiguration::new().with_capacity(2, 1, Some(4)),
//! )
//! .unwrap();
//! pool.start().unwrap();
//! {
//!     let obj = pool.get_object().unwrap();
//!     println!("Got: {}", *obj);
//!     // Object automatically returned when `obj` goes out of scope
//! }
//! assert_eq!(pool.free_count(), 2);
//! ```

mod buffer;
mod config;
mod error_aware;
mod errors;
mod eviction;
mod executor;
mod factory;
mod future;
mod health;
mod metrics;
mod policy;
mod pool;
mod processing;
mod registry;
mod timer;
mod work_thread;

pub use buffer::{ArrayAsyncWork, AsyncBuffer, Receiver};
#[cfg(feature = "serde")]
pub use config::PoolSettings;
pub use config::{BufferConfig, PoolConfiguration, ProcessingConfig};
pub use error_aware::{ErrorAware, ErrorAwareFactory};
pub use errors::{BoxError, PoolError, PoolResult};
pub use eviction::{EntryInfo, EvictionPolicy};
pub use executor::{Executor, PoolExecutor};
pub use factory::{FnFactory, ObjectFactory};
pub use future::{BaseFuture, Listener, ListenerKey};
pub use health::HealthStatus;
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use policy::{AsyncPolicy, ExecPolicy, Operation, SyncPolicy};
pub use pool::{AsyncObjectPool, ObjectPool, PooledObject, SyncObjectPool};
pub use processing::{AsynchProcessing, FailureAction, ProcessingState, Processor, StateListener};
pub use registry::PoolRegistry;
pub use timer::{Timer, TimerHandle, TimerTask};
pub use work_thread::{DoneCallback, HangingThreadLog, Task, ThreadPool, WorkThread, WorkThreadFactory, thread_pool};
