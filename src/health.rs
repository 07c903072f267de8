//! Health monitoring for object pools

/// Health status of an object pool
///
/// # Examples
///
/// ```
/// use courier_core::{FnFactory, ObjectPool, PoolConfiguration};
///
/// let pool = ObjectPool::new(
///     "ints",
///     FnFactory::new(|| Ok(7)),
///     PoolConfiguration::new().with_capacity(3, 1, Some(10)),
/// ).unwrap();
/// pool.start().unwrap();
///
/// let health = pool.get_health_status();
/// assert!(health.is_healthy());
/// assert_eq!(health.available_objects, 3);
/// ```
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Whether the pool is started
    pub started: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Current pool utilization (0.0 to 1.0)
    pub utilization: f64,

    /// Free objects count
    pub available_objects: usize,

    /// Checked-out objects count
    pub active_objects: usize,

    /// Current pool size
    pub size: usize,

    /// Maximum capacity, `None` when unbounded
    pub max_capacity: Option<usize>,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Create a new health status
    pub fn new(size: usize, available: usize, max_capacity: Option<usize>, started: bool) -> Self {
        let active = size.saturating_sub(available);
        let capacity = max_capacity.unwrap_or(size);
        let utilization = if capacity > 0 {
            active as f64 / capacity as f64
        } else {
            0.0
        };

        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if !started {
            warnings.push("Pool is not started".to_string());
            is_healthy = false;
        }

        if max_capacity.is_some() && utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        if available == 0 && size > 0 {
            warnings.push("No free objects".to_string());
        }

        Self {
            is_healthy,
            started,
            warning_count: warnings.len(),
            utilization,
            available_objects: available,
            active_objects: active,
            size,
            max_capacity,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
