//! Prometheus metrics for the readiness controller
//!
//! - Reconciliation counts and durations per watched kind
//! - Retry scheduling and dropped keys
//! - Readiness condition transitions
//! - Cloud API requests and response cache lookups

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

/// Controller metrics registry
///
/// Clone is cheap (the prometheus handles are reference counted).
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Reconciliations by kind and result (success, error)
    pub reconciliations_total: IntCounterVec,
    pub reconciliation_duration_seconds: HistogramVec,
    /// Keys re-enqueued with backoff, by kind
    pub retries_total: IntCounterVec,
    /// Keys forgotten after hitting the retry ceiling, by kind
    pub dropped_total: IntCounterVec,
    pub queue_depth: IntGaugeVec,
    /// Pods listed by more than one service
    pub ambiguous_matches_total: IntCounter,
    /// Readiness condition writes by new status
    pub readiness_transitions_total: IntCounterVec,
    /// Cloud API requests by operation and result (success, throttled, failed)
    pub cloud_requests_total: IntCounterVec,
    /// Cloud response cache lookups by operation and result (hit, miss)
    pub cloud_cache_requests_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "kube_readiness_reconciliations_total",
                "Total number of reconciliations",
            ),
            &["kind", "result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconciliation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kube_readiness_reconciliation_duration_seconds",
                "Duration of reconciliation in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["kind"],
        )?;
        registry.register(Box::new(reconciliation_duration_seconds.clone()))?;

        let retries_total = IntCounterVec::new(
            Opts::new(
                "kube_readiness_retries_total",
                "Number of keys re-enqueued with backoff",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let dropped_total = IntCounterVec::new(
            Opts::new(
                "kube_readiness_dropped_total",
                "Number of keys dropped after exceeding the retry ceiling",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(dropped_total.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("kube_readiness_queue_depth", "Keys waiting in the work queue"),
            &["kind"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let ambiguous_matches_total = IntCounter::new(
            "kube_readiness_ambiguous_matches_total",
            "Pod lookups that matched more than one service",
        )?;
        registry.register(Box::new(ambiguous_matches_total.clone()))?;

        let readiness_transitions_total = IntCounterVec::new(
            Opts::new(
                "kube_readiness_condition_writes_total",
                "Readiness condition writes by status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(readiness_transitions_total.clone()))?;

        let cloud_requests_total = IntCounterVec::new(
            Opts::new(
                "kube_readiness_cloud_requests_total",
                "Cloud API requests by operation and result",
            ),
            &["operation", "result"],
        )?;
        registry.register(Box::new(cloud_requests_total.clone()))?;

        let cloud_cache_requests_total = IntCounterVec::new(
            Opts::new(
                "kube_readiness_cloud_cache_requests_total",
                "Cloud response cache lookups by operation and result",
            ),
            &["operation", "result"],
        )?;
        registry.register(Box::new(cloud_cache_requests_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconciliation_duration_seconds,
            retries_total,
            dropped_total,
            queue_depth,
            ambiguous_matches_total,
            readiness_transitions_total,
            cloud_requests_total,
            cloud_cache_requests_total,
        })
    }

    pub fn record_reconciliation_success(&self, kind: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[kind, "success"])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    pub fn record_reconciliation_error(&self, kind: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[kind, "error"])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    pub fn record_retry(&self, kind: &str) {
        self.retries_total.with_label_values(&[kind]).inc();
    }

    pub fn record_dropped(&self, kind: &str) {
        self.dropped_total.with_label_values(&[kind]).inc();
    }

    pub fn set_queue_depth(&self, kind: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[kind])
            .set(depth as i64);
    }

    pub fn record_ambiguous_match(&self) {
        self.ambiguous_matches_total.inc();
    }

    pub fn record_condition_write(&self, status: &str) {
        self.readiness_transitions_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn record_cloud_request(&self, operation: &str, result: &str) {
        self.cloud_requests_total
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn record_cache_lookup(&self, operation: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cloud_cache_requests_total
            .with_label_values(&[operation, result])
            .inc();
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Shared metrics handle for use across the controller
pub type SharedMetrics = Arc<ControllerMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
