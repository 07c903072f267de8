//! Configuration for pools, async buffers and processing engines

use crate::errors::{PoolError, PoolResult};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for object pool behavior
///
/// # Examples
///
/// ```
/// use courier_core::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_capacity(2, 2, Some(10))
///     .with_expire_period(Duration::from_secs(3600));
///
/// assert_eq!(config.max_capacity, Some(10));
/// assert_eq!(config.increment_capacity, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfiguration {
    /// Objects allocated by `start`
    pub initial_capacity: usize,

    /// Objects allocated per expansion
    pub increment_capacity: usize,

    /// Upper bound on pool size, `None` for unbounded
    pub max_capacity: Option<usize>,

    /// Period of the shrink task
    pub shrink_interval: Option<Duration>,

    /// Maximum number of idle objects removed per shrink, `None` for all
    pub shrink_capacity: Option<usize>,

    /// Idle time after which a free object may be shrunk
    pub shrink_obsolete_period: Option<Duration>,

    /// Period of the health check task
    pub check_interval: Option<Duration>,

    /// Hard age limit of an object
    pub expire_period: Option<Duration>,

    /// Timeout of allocate/deallocate on a borrowed work thread, `None` waits forever
    pub allocate_timeout: Option<Duration>,

    /// Timeout of a health check on a borrowed work thread, `None` waits forever
    pub check_timeout: Option<Duration>,

    /// Timeout for async checkout
    pub operation_timeout: Option<Duration>,

    /// Consecutive object errors tolerated by an error aware factory
    pub max_error_count: Option<usize>,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            initial_capacity: 0,
            increment_capacity: 1,
            max_capacity: None,
            shrink_interval: None,
            shrink_capacity: None,
            shrink_obsolete_period: None,
            check_interval: None,
            expire_period: None,
            allocate_timeout: Some(Duration::from_secs(30)),
            check_timeout: Some(Duration::from_secs(10)),
            operation_timeout: Some(Duration::from_secs(30)),
            max_error_count: None,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial, increment and maximum capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_core::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_capacity(0, 2, Some(5));
    ///
    /// assert_eq!(config.initial_capacity, 0);
    /// assert_eq!(config.max_capacity, Some(5));
    /// ```
    pub fn with_capacity(mut self, initial: usize, increment: usize, max: Option<usize>) -> Self {
        self.initial_capacity = initial;
        self.increment_capacity = increment;
        self.max_capacity = max;
        self
    }

    /// Set the maximum capacity
    pub fn with_max_capacity(mut self, max: usize) -> Self {
        self.max_capacity = Some(max);
        self
    }

    /// Enable idle object reclamation
    pub fn with_shrink(
        mut self,
        interval: Duration,
        capacity: Option<usize>,
        obsolete_period: Duration,
    ) -> Self {
        self.shrink_interval = Some(interval);
        self.shrink_capacity = capacity;
        self.shrink_obsolete_period = Some(obsolete_period);
        self
    }

    /// Enable periodic health checks
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    /// Set the hard object age limit
    pub fn with_expire_period(mut self, period: Duration) -> Self {
        self.expire_period = Some(period);
        self
    }

    /// Set the timeouts used when factory calls run on a borrowed work thread
    pub fn with_timeouts(mut self, allocate: Option<Duration>, check: Option<Duration>) -> Self {
        self.allocate_timeout = allocate;
        self.check_timeout = check;
        self
    }

    /// Set async checkout timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Fail objects after `count` consecutive errors
    pub fn with_max_error_count(mut self, count: usize) -> Self {
        self.max_error_count = Some(count);
        self
    }

    pub(crate) fn validate(&self) -> PoolResult<()> {
        if self.increment_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "increment capacity must be > 0".to_string(),
            ));
        }
        for (name, value) in [
            ("shrink interval", self.shrink_interval),
            ("check interval", self.check_interval),
        ] {
            if value == Some(Duration::ZERO) {
                return Err(PoolError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

/// Pool settings as they appear in the application's structured configuration.
///
/// Periods are whole minutes, timeouts milliseconds; a value `<= 0` disables
/// the corresponding feature.
///
/// # Examples
///
/// ```
/// use courier_core::{PoolConfiguration, PoolSettings};
/// use std::time::Duration;
///
/// let settings = PoolSettings { max_capacity: 8, ..PoolSettings::default() };
/// let config = PoolConfiguration::from(settings);
///
/// assert_eq!(config.max_capacity, Some(8));
/// assert_eq!(config.shrink_interval, Some(Duration::from_secs(5 * 60)));
/// ```
#[cfg(feature = "serde")]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PoolSettings {
    pub initial_capacity: i64,
    pub increment_capacity: i64,
    pub max_capacity: i64,
    pub shrink_interval_min: i64,
    pub shrink_capacity: i64,
    pub shrink_obsolete_interval_min: i64,
    pub check_interval_min: i64,
    pub expire_period_min: i64,
    pub allocate_timeout: i64,
    pub check_timeout: i64,
    pub max_error_count: i64,
}

#[cfg(feature = "serde")]
impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            initial_capacity: 0,
            increment_capacity: 1,
            max_capacity: -1,
            shrink_interval_min: 5,
            shrink_capacity: -1,
            shrink_obsolete_interval_min: 2,
            check_interval_min: 5,
            expire_period_min: 5 * 60,
            allocate_timeout: 30 * 1000,
            check_timeout: 10 * 1000,
            max_error_count: -1,
        }
    }
}

#[cfg(feature = "serde")]
fn minutes(value: i64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value as u64 * 60))
}

#[cfg(feature = "serde")]
fn millis(value: i64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value as u64))
}

#[cfg(feature = "serde")]
fn count(value: i64) -> Option<usize> {
    (value >= 0).then_some(value as usize)
}

#[cfg(feature = "serde")]
impl From<PoolSettings> for PoolConfiguration {
    fn from(s: PoolSettings) -> Self {
        Self {
            initial_capacity: s.initial_capacity.max(0) as usize,
            increment_capacity: s.increment_capacity.max(1) as usize,
            max_capacity: count(s.max_capacity),
            shrink_interval: minutes(s.shrink_interval_min),
            shrink_capacity: count(s.shrink_capacity),
            shrink_obsolete_period: minutes(s.shrink_obsolete_interval_min),
            check_interval: minutes(s.check_interval_min),
            expire_period: minutes(s.expire_period_min),
            allocate_timeout: millis(s.allocate_timeout),
            check_timeout: millis(s.check_timeout),
            max_error_count: (s.max_error_count > 0).then_some(s.max_error_count as usize),
            ..PoolConfiguration::default()
        }
    }
}

/// Configuration of an [`AsyncBuffer`](crate::AsyncBuffer)
#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    /// Upper bound on concurrently draining workers
    pub max_thread_count: usize,

    /// Launch period; `None` drains immediately on add
    pub period: Option<Duration>,

    /// Maximum items handed to the receiver per batch
    pub part_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_thread_count: 1,
            period: None,
            part_size: 100,
        }
    }
}

impl BufferConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_thread_count(mut self, count: usize) -> Self {
        self.max_thread_count = count;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_part_size(mut self, size: usize) -> Self {
        self.part_size = size;
        self
    }

    pub(crate) fn validate(&self) -> PoolResult<()> {
        if self.max_thread_count < 1 {
            return Err(PoolError::InvalidConfig(
                "max threads count must be > 0".to_string(),
            ));
        }
        if self.part_size < 1 {
            return Err(PoolError::InvalidConfig("part size must be > 0".to_string()));
        }
        if self.period == Some(Duration::ZERO) {
            return Err(PoolError::InvalidConfig("period must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Configuration of an [`AsynchProcessing`](crate::AsynchProcessing) engine
///
/// # Examples
///
/// ```
/// use courier_core::ProcessingConfig;
/// use std::time::Duration;
///
/// let config = ProcessingConfig::new(4)
///     .with_chunk_size(10)
///     .with_buffering(Duration::from_millis(200), 50);
///
/// assert_eq!(config.max_exec, 4);
/// assert_eq!(config.buffer_size, 50);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingConfig {
    /// Upper bound on concurrent activities, `0` for unbounded
    pub max_exec: usize,

    /// Queue bound; oldest targets are dropped beyond it
    pub max_target_count: Option<usize>,

    /// Period of the performance check
    pub check_interval: Option<Duration>,

    /// Idle time of the sole activity before it gives up its resource
    pub last_exec_sleep_interval: Option<Duration>,

    /// Targets handed to one `process` call
    pub chunk_size: usize,

    /// Launch deferral window; `None` disables buffering
    pub buffer_interval: Option<Duration>,

    /// Targets that trigger a launch before the window elapses
    pub buffer_size: usize,
}

impl ProcessingConfig {
    pub fn new(max_exec: usize) -> Self {
        Self {
            max_exec,
            max_target_count: None,
            check_interval: Some(Duration::from_secs(5)),
            last_exec_sleep_interval: Some(Duration::from_secs(1)),
            chunk_size: 1,
            buffer_interval: None,
            buffer_size: 0,
        }
    }

    pub fn with_max_target_count(mut self, count: usize) -> Self {
        self.max_target_count = Some(count);
        self
    }

    pub fn with_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_last_exec_sleep_interval(mut self, interval: Option<Duration>) -> Self {
        self.last_exec_sleep_interval = interval;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_buffering(mut self, interval: Duration, size: usize) -> Self {
        self.buffer_interval = Some(interval);
        self.buffer_size = size;
        self
    }

    pub(crate) fn validate(&self) -> PoolResult<()> {
        if self.chunk_size < 1 {
            return Err(PoolError::InvalidConfig(format!(
                "invalid chunk size {}, should be > 0",
                self.chunk_size
            )));
        }
        if self.check_interval == Some(Duration::ZERO) {
            return Err(PoolError::InvalidConfig("check interval must be > 0".to_string()));
        }
        Ok(())
    }

    pub(crate) fn buffering(&self) -> bool {
        self.buffer_interval.is_some_and(|i| !i.is_zero())
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self::new(0)
    }
}
