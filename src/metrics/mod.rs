//! Metrics module for Prometheus-based monitoring.
//!
//! Covers task outcomes, stage attempts, quality scores, LLM attempts and
//! the number of in-flight runs.
//!
//! # Example
//!
//! ```ignore
//! use styleforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_quality(0.82);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_RUNS, LLM_ATTEMPTS_TOTAL, QUALITY_RETRIES_TOTAL, QUALITY_SCORE, REGISTRY,
    STAGE_ATTEMPTS_TOTAL, STAGE_DURATION, TASKS_TOTAL, TASK_DURATION,
};
