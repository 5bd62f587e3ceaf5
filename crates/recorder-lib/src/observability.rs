//! Observability for the recorder
//!
//! Provides:
//! - Prometheus metrics (cycle and rollup latency, rows written, aborts)
//! - Event-style structured log records on top of tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for cycle latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL_METRICS: OnceLock<RecorderMetricsInner> = OnceLock::new();

struct RecorderMetricsInner {
    cycle_latency_seconds: Histogram,
    rollup_latency_seconds: Histogram,
    cycles_completed: IntCounter,
    cycle_aborts: IntCounterVec,
    reference_rows: IntCounterVec,
    metric_rows: IntCounterVec,
    entities_skipped: IntCounter,
    tracked_counters: IntGauge,
}

impl RecorderMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "kube_recorder_cycle_latency_seconds",
                "Time spent on one recording cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            rollup_latency_seconds: register_histogram!(
                "kube_recorder_rollup_latency_seconds",
                "Time spent writing average rows",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register rollup_latency_seconds"),

            cycles_completed: register_int_counter!(
                "kube_recorder_cycles_completed_total",
                "Recording cycles that ran every phase"
            )
            .expect("Failed to register cycles_completed"),

            cycle_aborts: register_int_counter_vec!(
                "kube_recorder_cycle_aborts_total",
                "Recording cycles stopped by a failing phase",
                &["phase"]
            )
            .expect("Failed to register cycle_aborts"),

            reference_rows: register_int_counter_vec!(
                "kube_recorder_reference_rows_total",
                "Reference table rows changed by reconciliation",
                &["action"]
            )
            .expect("Failed to register reference_rows"),

            metric_rows: register_int_counter_vec!(
                "kube_recorder_metric_rows_total",
                "Rows appended to metric tables",
                &["table"]
            )
            .expect("Failed to register metric_rows"),

            entities_skipped: register_int_counter!(
                "kube_recorder_entities_skipped_total",
                "Entities left out of a cycle because a parent was unresolved"
            )
            .expect("Failed to register entities_skipped"),

            tracked_counters: register_int_gauge!(
                "kube_recorder_tracked_counters",
                "Cumulative counters with a stored baseline"
            )
            .expect("Failed to register tracked_counters"),
        }
    }
}

/// Handle to the process-wide recorder metrics; clones share them
#[derive(Clone)]
pub struct RecorderMetrics {
    _private: (),
}

impl Default for RecorderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RecorderMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RecorderMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RecorderMetricsInner {
        GLOBAL_METRICS.get_or_init(RecorderMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn observe_rollup_latency(&self, duration_secs: f64) {
        self.inner().rollup_latency_seconds.observe(duration_secs);
    }

    pub fn inc_cycles_completed(&self) {
        self.inner().cycles_completed.inc();
    }

    pub fn inc_cycle_aborts(&self, phase: &str) {
        self.inner().cycle_aborts.with_label_values(&[phase]).inc();
    }

    /// Count reference rows by action (`inserted`, `updated`, `disabled`, `revived`)
    pub fn add_reference_rows(&self, action: &str, rows: usize) {
        self.inner()
            .reference_rows
            .with_label_values(&[action])
            .inc_by(rows as u64);
    }

    pub fn add_metric_rows(&self, table: &str, rows: usize) {
        self.inner()
            .metric_rows
            .with_label_values(&[table])
            .inc_by(rows as u64);
    }

    pub fn add_entities_skipped(&self, count: usize) {
        self.inner().entities_skipped.inc_by(count as u64);
    }

    pub fn set_tracked_counters(&self, count: usize) {
        self.inner().tracked_counters.set(count as i64);
    }

    /// Everything in the default registry, in the text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Event records for significant recorder moments
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn log_startup(&self, version: &str, database: &str, tables: usize) {
        info!(
            event = "recorder_started",
            cluster = %self.cluster,
            recorder_version = %version,
            database = %database,
            schema_tables = tables,
            "Recorder started"
        );
    }

    pub fn log_cycle_completed(
        &self,
        tick: u64,
        elapsed_ms: u128,
        inserted: usize,
        disabled: usize,
        metric_rows: usize,
        skipped: usize,
    ) {
        info!(
            event = "cycle_completed",
            cluster = %self.cluster,
            tick = tick,
            elapsed_ms = elapsed_ms,
            inserted = inserted,
            disabled = disabled,
            metric_rows = metric_rows,
            skipped = skipped,
            "Recording cycle complete"
        );
    }

    pub fn log_cycle_aborted(&self, tick: u64, phase: &str, reason: &str) {
        error!(
            event = "cycle_aborted",
            cluster = %self.cluster,
            tick = tick,
            phase = %phase,
            error = %reason,
            "Recording cycle aborted, later phases skipped"
        );
    }

    pub fn log_snapshot_unavailable(&self, tick: u64, reason: &str) {
        warn!(
            event = "cycle_aborted",
            cluster = %self.cluster,
            tick = tick,
            phase = "source",
            error = %reason,
            "Snapshot unavailable, cycle skipped"
        );
    }

    pub fn log_rollup(&self, lower: i64, upper: i64, rows: usize, elapsed_ms: u128) {
        info!(
            event = "rollup_completed",
            cluster = %self.cluster,
            window_lower = lower,
            window_upper = upper,
            rows = rows,
            elapsed_ms = elapsed_ms,
            "Average rollup written"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "recorder_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Recorder shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_metrics_shared_registration() {
        let metrics = RecorderMetrics::new();
        let clone = metrics.clone();

        metrics.observe_cycle_latency(0.02);
        metrics.observe_rollup_latency(0.5);
        metrics.inc_cycles_completed();
        metrics.inc_cycle_aborts("pod");
        metrics.add_reference_rows("inserted", 3);
        clone.add_metric_rows("kubenodeperf", 2);
        clone.add_entities_skipped(1);
        clone.set_tracked_counters(4);

        // A second handle must not register the collectors again
        let _again = RecorderMetrics::new();
    }

    #[test]
    fn test_render_includes_recorder_families() {
        let metrics = RecorderMetrics::new();
        metrics.add_reference_rows("revived", 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("# TYPE kube_recorder_cycle_latency_seconds histogram"));
        assert!(text.contains("kube_recorder_reference_rows_total{action=\"revived\"}"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("prod-east");
        assert_eq!(logger.cluster, "prod-east");
        logger.log_cycle_aborted(3, "node", "no live node");
    }
}
