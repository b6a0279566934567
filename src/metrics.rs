use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Job lifecycle metrics
    pub static ref JOBS_SUBMITTED: IntCounter = IntCounter::new(
        "sr_jobs_submitted_total",
        "Total number of jobs accepted for dispatch"
    ).unwrap();

    pub static ref JOBS_COMPLETED: IntCounter = IntCounter::new(
        "sr_jobs_completed_total",
        "Total number of jobs that reached done"
    ).unwrap();

    pub static ref JOBS_FAILED: IntCounter = IntCounter::new(
        "sr_jobs_failed_total",
        "Total number of jobs that ended in error"
    ).unwrap();

    pub static ref JOBS_CANCELLED: IntCounter = IntCounter::new(
        "sr_jobs_cancelled_total",
        "Total number of jobs stopped because their record was deleted"
    ).unwrap();

    pub static ref JOBS_RUNNING: IntGauge = IntGauge::new(
        "sr_jobs_running",
        "Number of jobs currently owned by a worker"
    ).unwrap();

    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "sr_queue_depth",
        "Jobs enqueued but not yet accepted by a worker"
    ).unwrap();

    // Tile metrics
    pub static ref TILES_PROCESSED: IntCounter = IntCounter::new(
        "sr_tiles_processed_total",
        "Total number of tiles upscaled and stitched"
    ).unwrap();

    pub static ref TILE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "sr_tile_inference_duration_seconds",
            "Per-tile inference latency in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).unwrap();

    pub static ref FINALIZE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "sr_finalize_duration_seconds",
            "Output encode and upload latency in seconds"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
    ).unwrap();

    // Job record store metrics
    pub static ref STORE_OPERATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("sr_store_operations_total", "Job record store operations by kind"),
        &["operation"]
    ).unwrap();

    pub static ref RECORDS_EXPIRED: IntCounter = IntCounter::new(
        "sr_records_expired_total",
        "Total number of job records evicted by TTL"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(JOBS_SUBMITTED.clone()),
            Box::new(JOBS_COMPLETED.clone()),
            Box::new(JOBS_FAILED.clone()),
            Box::new(JOBS_CANCELLED.clone()),
            Box::new(JOBS_RUNNING.clone()),
            Box::new(QUEUE_DEPTH.clone()),
            Box::new(TILES_PROCESSED.clone()),
            Box::new(TILE_LATENCY.clone()),
            Box::new(FINALIZE_LATENCY.clone()),
            Box::new(STORE_OPERATIONS.clone()),
            Box::new(RECORDS_EXPIRED.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!("Failed to register collector: {}", e);
            }
        }

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

pub fn record_store_op(operation: &str) {
    STORE_OPERATIONS.with_label_values(&[operation]).inc();
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_exports() {
        init_metrics();
        init_metrics();
        TILES_PROCESSED.inc();
        record_store_op("write");
        let text = export_metrics();
        assert!(text.contains("sr_tiles_processed_total"));
        assert!(text.contains("sr_store_operations_total"));
    }
}
