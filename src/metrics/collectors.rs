//! Convenience recorder over the global Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code and tests can record unconditionally.

use super::prometheus::{
    ACTIVE_RUNS, LLM_ATTEMPTS_TOTAL, QUALITY_RETRIES_TOTAL, QUALITY_SCORE, STAGE_ATTEMPTS_TOTAL,
    STAGE_DURATION, TASKS_TOTAL, TASK_DURATION,
};

/// Records pipeline metrics with consistent labels.
///
/// # Example
///
/// ```ignore
/// use styleforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_stage("code_generation", "completed", 2.4);
/// collector.record_task("completed", 31.0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished task.
    pub fn record_task(&self, status: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[status]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[status])
                .observe(duration_secs);
        }

        tracing::trace!(status, duration_secs, "Recorded task metric");
    }

    /// Record one stage attempt.
    pub fn record_stage(&self, stage: &str, status: &str, duration_secs: f64) {
        if let Some(attempts) = STAGE_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[stage, status]).inc();
        }

        if let Some(duration) = STAGE_DURATION.get() {
            duration.with_label_values(&[stage]).observe(duration_secs);
        }
    }

    /// Record a quality score. Values outside `[0, 1]` are ignored.
    pub fn record_quality(&self, score: f64) {
        if !(0.0..=1.0).contains(&score) {
            tracing::warn!(score, "Ignoring out-of-range quality score");
            return;
        }

        if let Some(histogram) = QUALITY_SCORE.get() {
            histogram.observe(score);
        }
    }

    /// Record a retry decision of the quality gate.
    pub fn record_retry(&self) {
        if let Some(retries) = QUALITY_RETRIES_TOTAL.get() {
            retries.inc();
        }
    }

    /// Record one LLM attempt: `success`, `transient` or `hard`.
    pub fn record_llm_attempt(&self, outcome: &str) {
        if let Some(attempts) = LLM_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[outcome]).inc();
        }
    }

    /// Set the number of runs currently executing.
    pub fn set_active_runs(&self, count: usize) {
        if let Some(gauge) = ACTIVE_RUNS.get() {
            gauge.set(count as f64);
        }
    }
}
