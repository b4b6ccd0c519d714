//! Persisted record types for tasks and stage executions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status shared by tasks and stage execution records.
///
/// `Running` is the only non-terminal state; a row never leaves a terminal
/// state once it has reached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

/// Status of a single stage attempt.
pub type ExecutionStatus = TaskStatus;

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Target style for a transformation, stored as JSON in `tasks.requirements`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleRequirements {
    pub style_name: String,
    #[serde(default)]
    pub style_features: Vec<String>,
}

impl StyleRequirements {
    pub fn new(style_name: impl Into<String>) -> Self {
        Self {
            style_name: style_name.into(),
            style_features: Vec::new(),
        }
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.style_features = features.into_iter().map(Into::into).collect();
        self
    }
}

/// One pipeline run as stored in the `tasks` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTask {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub input: String,
    pub requirements: StyleRequirements,
    pub output: Option<String>,
    pub quality_score: Option<f64>,
    /// Wall-clock processing time in seconds.
    pub processing_time: Option<f64>,
    pub error_message: Option<String>,
}

/// One stage attempt as stored in the `stage_executions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub stage_name: String,
    /// Engine iteration the attempt belongs to (0 for the first pass).
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub input_summary: Option<String>,
    pub output_summary: Option<String>,
    pub error_message: Option<String>,
    pub execution_time: Option<f64>,
}

/// Patch applied by [`TaskStore::update_task`](super::TaskStore::update_task).
///
/// Only these fields can change after creation. Deserializing from an
/// arbitrary JSON object keeps the allow-listed keys and drops the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    pub fn with_processing_time(mut self, seconds: f64) -> Self {
        self.processing_time = Some(seconds);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Builds an update from a loosely-typed JSON object.
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.output.is_none()
            && self.quality_score.is_none()
            && self.processing_time.is_none()
            && self.error_message.is_none()
    }
}

/// Patch applied by
/// [`TaskStore::update_stage_execution`](super::TaskStore::update_stage_execution).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub output_summary: Option<String>,
    pub error_message: Option<String>,
    pub execution_time: Option<f64>,
}

impl StageExecutionUpdate {
    pub fn completed(output_summary: impl Into<String>, execution_time: f64) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            output_summary: Some(output_summary.into()),
            error_message: None,
            execution_time: Some(execution_time),
        }
    }

    pub fn failed(error_message: impl Into<String>, execution_time: f64) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            output_summary: None,
            error_message: Some(error_message.into()),
            execution_time: Some(execution_time),
        }
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [TaskStatus::Running, TaskStatus::Completed, TaskStatus::Failed] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_update_ignores_unknown_keys() {
        let update = TaskUpdate::from_json(serde_json::json!({
            "status": "completed",
            "quality_score": 0.85,
            "input": "overwrite attempt",
            "created_at": "1970-01-01T00:00:00Z",
        }))
        .unwrap();

        assert_eq!(update.status, Some(TaskStatus::Completed));
        assert_eq!(update.quality_score, Some(0.85));
        assert!(update.output.is_none());
        assert!(!update.is_empty());
    }

    #[test]
    fn test_task_update_builder() {
        let update = TaskUpdate::new()
            .with_status(TaskStatus::Failed)
            .with_error("boom")
            .with_processing_time(1.5);
        assert_eq!(update.error_message.as_deref(), Some("boom"));
        assert_eq!(update.processing_time, Some(1.5));
        assert!(TaskUpdate::new().is_empty());
    }

    #[test]
    fn test_style_requirements_features_default() {
        let req: StyleRequirements =
            serde_json::from_str(r#"{"style_name": "Minimal"}"#).unwrap();
        assert_eq!(req, StyleRequirements::new("Minimal"));

        let req = StyleRequirements::new("Bold").with_features(["serif", "dark"]);
        assert_eq!(req.style_features, vec!["serif", "dark"]);
    }
}
