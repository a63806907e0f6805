//! Prometheus metrics registry for DriftFS
//!
//! Provides typed, labeled counters, gauges, and histograms for the
//! observable operations of the filesystem pipeline.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Central metrics registry holding all Prometheus metrics.
pub struct MetricsRegistry {
    registry: Registry,
    /// Counter: filesystem operations by (operation, status)
    pub fs_operations_total: IntCounterVec,
    /// Counter: backend requests by (operation, status)
    pub store_requests_total: IntCounterVec,
    /// Counter: bytes moved by direction (upload, download)
    pub transfer_bytes_total: IntCounterVec,
    /// Gauge: buffer-pool occupancy by kind (cached, dirty, in_flight)
    pub buffer_pool_bytes: IntGaugeVec,
    /// Histogram: flush duration in seconds by path (small, multipart)
    pub flush_duration_seconds: HistogramVec,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with all metrics registered.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("driftfs".to_string()), None)?;

        let fs_operations_total = IntCounterVec::new(
            Opts::new("fs_operations_total", "Filesystem operations"),
            &["operation", "status"],
        )?;
        registry.register(Box::new(fs_operations_total.clone()))?;

        let store_requests_total = IntCounterVec::new(
            Opts::new("store_requests_total", "Backend requests"),
            &["operation", "status"],
        )?;
        registry.register(Box::new(store_requests_total.clone()))?;

        let transfer_bytes_total = IntCounterVec::new(
            Opts::new("transfer_bytes_total", "Bytes transferred"),
            &["direction"],
        )?;
        registry.register(Box::new(transfer_bytes_total.clone()))?;

        let buffer_pool_bytes = IntGaugeVec::new(
            Opts::new("buffer_pool_bytes", "Buffer pool occupancy"),
            &["kind"],
        )?;
        registry.register(Box::new(buffer_pool_bytes.clone()))?;

        let flush_duration_seconds = HistogramVec::new(
            HistogramOpts::new("flush_duration_seconds", "Flush duration in seconds")
                .buckets(vec![0.05, 0.25, 1.0, 5.0, 30.0, f64::INFINITY]),
            &["path"],
        )?;
        registry.register(Box::new(flush_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            fs_operations_total,
            store_requests_total,
            transfer_bytes_total,
            buffer_pool_bytes,
            flush_duration_seconds,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
