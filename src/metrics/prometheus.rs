//! Process-wide Prometheus collectors.
//!
//! Collectors live in `OnceLock` statics so the pipeline can record without
//! threading a registry handle around. Until [`init_metrics`] runs every
//! recording call in [`super::collectors`] is a no-op.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Registry that `styleforge metrics` gathers from.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of finished tasks, labeled by final status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task processing time in seconds, labeled by final status.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total stage attempts, labeled by stage and status.
pub static STAGE_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage attempt duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total retry decisions taken by the quality gate.
pub static QUALITY_RETRIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Distribution of quality scores.
pub static QUALITY_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Total LLM attempts, labeled by outcome (success, transient, hard).
pub static LLM_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of pipeline runs currently executing.
pub static ACTIVE_RUNS: OnceLock<Gauge> = OnceLock::new();

/// Builds and registers every collector.
///
/// Only the first successful call installs collectors. Later calls build a
/// throwaway registry and leave the installed one untouched.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("styleforge_tasks_total", "Total number of finished tasks"),
        &["status"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "styleforge_task_duration_seconds",
            "Task processing time in seconds",
        )
        .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["status"],
    )?;

    let stage_attempts_total = CounterVec::new(
        Opts::new("styleforge_stage_attempts_total", "Total stage attempts"),
        &["stage", "status"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "styleforge_stage_duration_seconds",
            "Stage attempt duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["stage"],
    )?;

    let quality_retries_total = Counter::new(
        "styleforge_quality_retries_total",
        "Total retry decisions taken by the quality gate",
    )?;

    let quality_score = Histogram::with_opts(
        prometheus::HistogramOpts::new("styleforge_quality_score", "Distribution of quality scores")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    let llm_attempts_total = CounterVec::new(
        Opts::new("styleforge_llm_attempts_total", "Total LLM request attempts"),
        &["outcome"],
    )?;

    let active_runs = Gauge::new(
        "styleforge_active_runs",
        "Number of pipeline runs currently executing",
    )?;

    let collectors: [Box<dyn prometheus::core::Collector>; 8] = [
        Box::new(tasks_total.clone()),
        Box::new(task_duration.clone()),
        Box::new(stage_attempts_total.clone()),
        Box::new(stage_duration.clone()),
        Box::new(quality_retries_total.clone()),
        Box::new(quality_score.clone()),
        Box::new(llm_attempts_total.clone()),
        Box::new(active_runs.clone()),
    ];
    for collector in collectors {
        registry.register(collector)?;
    }

    if REGISTRY.get().is_some() {
        tracing::debug!("Metrics already installed");
        return Ok(());
    }
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = STAGE_ATTEMPTS_TOTAL.set(stage_attempts_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = QUALITY_RETRIES_TOTAL.set(quality_retries_total);
    let _ = QUALITY_SCORE.set(quality_score);
    let _ = LLM_ATTEMPTS_TOTAL.set(llm_attempts_total);
    let _ = ACTIVE_RUNS.set(active_runs);

    tracing::info!("Metrics registry installed");

    Ok(())
}

/// Text exposition of everything recorded so far.
///
/// Problems are reported as a `#` comment line so the output always parses.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# styleforge metrics are not initialized\n".to_string();
    };

    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# metrics output is not UTF-8: {}\n", e)),
        Err(e) => format!("# failed to encode metrics: {}\n", e),
    }
}
