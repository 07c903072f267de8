//! Metrics collection and export for object pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Metrics data for a pool
///
/// # Examples
///
/// ```
/// use courier_core::{FnFactory, ObjectPool, PoolConfiguration};
///
/// let pool = ObjectPool::new("ints", FnFactory::new(|| Ok(1)), PoolConfiguration::default()).unwrap();
/// pool.start().unwrap();
///
/// {
///     let _obj = pool.get_object().unwrap();
///     let metrics = pool.get_metrics();
///     assert_eq!(metrics.total_retrieved, 1);
///     assert_eq!(metrics.active_objects, 1);
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    /// Total objects retrieved from pool
    pub total_retrieved: usize,

    /// Total objects returned to pool
    pub total_returned: usize,

    /// Current checked-out objects
    pub active_objects: usize,

    /// Current free objects
    pub available_objects: usize,

    /// Objects created by the factory
    pub allocated: usize,

    /// Objects handed back to the factory
    pub deallocated: usize,

    /// Failed allocations, including timeouts
    pub allocation_failures: usize,

    /// Requests refused at max capacity
    pub capacity_exceeded_events: usize,

    /// Objects failing the health check
    pub validation_failures: usize,

    /// Objects replaced after their expire period
    pub expired: usize,

    /// Idle objects removed by shrink
    pub shrunk: usize,

    /// Checked-out share of capacity (0.0 to 1.0)
    pub utilization: f64,

    /// Maximum pool capacity, `None` when unbounded
    pub max_capacity: Option<usize>,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        let counts = [
            ("total_retrieved", self.total_retrieved),
            ("total_returned", self.total_returned),
            ("active_objects", self.active_objects),
            ("available_objects", self.available_objects),
            ("allocated", self.allocated),
            ("deallocated", self.deallocated),
            ("allocation_failures", self.allocation_failures),
            ("capacity_exceeded_events", self.capacity_exceeded_events),
            ("validation_failures", self.validation_failures),
            ("expired", self.expired),
            ("shrunk", self.shrunk),
        ];
        for (name, value) in counts {
            metrics.insert(name.to_string(), value.to_string());
        }
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert(
            "max_capacity".to_string(),
            self.max_capacity
                .map_or_else(|| "unbounded".to_string(), |max| max.to_string()),
        );
        metrics
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export metrics in Prometheus text exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_core::{FnFactory, ObjectPool, PoolConfiguration};
    /// use std::collections::HashMap;
    ///
    /// let pool = ObjectPool::new("my_pool", FnFactory::new(|| Ok(1)), PoolConfiguration::default()).unwrap();
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = pool.export_metrics_prometheus(Some(&tags));
    /// assert!(output.contains("courier_pool_objects_active"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        match Self::encode(metrics, pool_name, tags) {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(pool = %pool_name, error = %e, "cannot encode pool metrics");
                String::new()
            }
        }
    }

    fn encode(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> prometheus::Result<String> {
        use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        let mut labels = tags.cloned().unwrap_or_default();
        labels.insert("pool".to_string(), pool_name.to_string());
        let registry = Registry::new_custom(Some("courier_pool".to_string()), Some(labels))?;

        let gauges = [
            ("objects_active", "Current checked-out objects", metrics.active_objects),
            ("objects_available", "Current free objects", metrics.available_objects),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(Opts::new(name, help))?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge))?;
        }

        let utilization = Gauge::with_opts(Opts::new("utilization", "Pool utilization ratio"))?;
        utilization.set(metrics.utilization);
        registry.register(Box::new(utilization))?;

        let counters = [
            ("objects_retrieved_total", "Total objects retrieved", metrics.total_retrieved),
            ("objects_returned_total", "Total objects returned", metrics.total_returned),
            ("objects_allocated_total", "Objects allocated by the factory", metrics.allocated),
            ("objects_deallocated_total", "Objects deallocated by the factory", metrics.deallocated),
            ("allocation_failures_total", "Failed allocations", metrics.allocation_failures),
            ("capacity_exceeded_total", "Requests refused at max capacity", metrics.capacity_exceeded_events),
            ("validation_failures_total", "Validation failures", metrics.validation_failures),
            ("objects_expired_total", "Objects replaced after expiry", metrics.expired),
            ("objects_shrunk_total", "Idle objects removed", metrics.shrunk),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            counter.inc_by(value as u64);
            registry.register(Box::new(counter))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Internal metrics tracker
#[derive(Debug, Default)]
pub(crate) struct MetricsTracker {
    pub total_retrieved: AtomicUsize,
    pub total_returned: AtomicUsize,
    pub allocated: AtomicUsize,
    pub deallocated: AtomicUsize,
    pub allocation_failures: AtomicUsize,
    pub capacity_exceeded_events: AtomicUsize,
    pub validation_failures: AtomicUsize,
    pub expired: AtomicUsize,
    pub shrunk: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_metrics(&self, size: usize, available: usize, max: Option<usize>) -> PoolMetrics {
        let active = size - available;
        let capacity = max.unwrap_or(size);
        let utilization = if capacity > 0 {
            active as f64 / capacity as f64
        } else {
            0.0
        };

        PoolMetrics {
            total_retrieved: self.total_retrieved.load(Ordering::Relaxed),
            total_returned: self.total_returned.load(Ordering::Relaxed),
            active_objects: active,
            available_objects: available,
            allocated: self.allocated.load(Ordering::Relaxed),
            deallocated: self.deallocated.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            capacity_exceeded_events: self.capacity_exceeded_events.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            shrunk: self.shrunk.load(Ordering::Relaxed),
            utilization,
            max_capacity: max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization_against_max() {
        let tracker = MetricsTracker::new();
        tracker.total_retrieved.fetch_add(3, Ordering::Relaxed);
        let metrics = tracker.get_metrics(4, 1, Some(6));
        assert_eq!(metrics.active_objects, 3);
        assert!((metrics.utilization - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.export()["total_retrieved"], "3");
    }

    #[test]
    fn test_unbounded_uses_size() {
        let metrics = MetricsTracker::new().get_metrics(4, 2, None);
        assert!((metrics.utilization - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.export()["max_capacity"], "unbounded");
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_output() {
        let metrics = MetricsTracker::new().get_metrics(2, 1, Some(4));
        let out = MetricsExporter::export_prometheus(&metrics, "db", None);
        assert!(out.contains("# TYPE courier_pool_objects_active gauge"));
        assert!(out.contains("courier_pool_objects_active{pool=\"db\"} 1"));
        assert!(out.contains("# TYPE courier_pool_objects_retrieved_total counter"));
    }
}
