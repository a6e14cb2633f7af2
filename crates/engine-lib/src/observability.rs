//! Observability infrastructure for the batch engine
//!
//! Provides Prometheus metrics for monitor ticks, tier events, and batch
//! job outcomes. Metric exposition (HTTP or otherwise) is the embedding
//! application's concern; this module only registers and updates values.

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_gauge, GaugeVec,
    Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;

use crate::models::{ResourceKind, UtilizationTier};

/// Histogram buckets for job durations (in seconds). Transcodes run from
/// seconds to hours.
const JOB_DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct EngineMetricsInner {
    monitor_ticks: IntCounter,
    utilization_ratio: GaugeVec,
    warning_events: IntCounter,
    critical_events: IntCounter,
    jobs_completed: IntCounter,
    jobs_failed: IntCounter,
    job_duration_seconds: Histogram,
    devices_monitored: IntGauge,
    tracked_processes: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            monitor_ticks: register_int_counter!(
                "batch_engine_monitor_ticks_total",
                "Total number of completed resource monitor ticks"
            )
            .expect("Failed to register monitor_ticks_total"),

            utilization_ratio: register_gauge_vec!(
                "batch_engine_utilization_ratio",
                "Latest sampled utilization ratio per resource kind",
                &["kind"]
            )
            .expect("Failed to register utilization_ratio"),

            warning_events: register_int_counter!(
                "batch_engine_warning_events_total",
                "Total number of warning-tier samples observed"
            )
            .expect("Failed to register warning_events_total"),

            critical_events: register_int_counter!(
                "batch_engine_critical_events_total",
                "Total number of critical-tier samples observed"
            )
            .expect("Failed to register critical_events_total"),

            jobs_completed: register_int_counter!(
                "batch_engine_jobs_completed_total",
                "Total number of batch jobs that completed successfully"
            )
            .expect("Failed to register jobs_completed_total"),

            jobs_failed: register_int_counter!(
                "batch_engine_jobs_failed_total",
                "Total number of batch jobs that failed"
            )
            .expect("Failed to register jobs_failed_total"),

            job_duration_seconds: register_histogram!(
                "batch_engine_job_duration_seconds",
                "Wall-clock duration of individual batch jobs",
                JOB_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register job_duration_seconds"),

            devices_monitored: register_int_gauge!(
                "batch_engine_devices_monitored",
                "Number of accelerator devices enumerated at startup"
            )
            .expect("Failed to register devices_monitored"),

            tracked_processes: register_int_gauge!(
                "batch_engine_tracked_processes",
                "Number of processes currently tracked against resource limits"
            )
            .expect("Failed to register tracked_processes"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    // This is just a marker - we use the global instance
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record a completed monitor tick
    pub fn inc_monitor_ticks(&self) {
        self.inner().monitor_ticks.inc();
    }

    /// Update the latest utilization gauge for a kind and count tier events
    pub fn observe_sample(&self, kind: ResourceKind, ratio: f64, tier: UtilizationTier) {
        self.inner()
            .utilization_ratio
            .with_label_values(&[&kind.to_string()])
            .set(ratio);
        match tier {
            UtilizationTier::Warning => self.inner().warning_events.inc(),
            UtilizationTier::Critical => self.inner().critical_events.inc(),
            UtilizationTier::Normal => {}
        }
    }

    /// Record a finished job outcome
    pub fn observe_job(&self, success: bool, duration_secs: f64) {
        if success {
            self.inner().jobs_completed.inc();
        } else {
            self.inner().jobs_failed.inc();
        }
        self.inner().job_duration_seconds.observe(duration_secs);
    }

    /// Update the enumerated device count
    pub fn set_devices_monitored(&self, count: i64) {
        self.inner().devices_monitored.set(count);
    }

    /// Update the tracked process count
    pub fn set_tracked_processes(&self, count: i64) {
        self.inner().tracked_processes.set(count);
    }
}
