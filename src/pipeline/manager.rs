//! Task manager: creates tasks, launches engines and answers queries.
//!
//! Creation is synchronous up to the persisted `running` row; the engine
//! then runs on its own tokio task. In-flight runs are tracked in an
//! [`ActiveRuns`] registry injected at construction, and each run removes
//! its own entry when it finishes, including when the engine panics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use super::engine::{Progress, WorkflowEngine};
use super::stage::StageName;
use crate::error::ValidationError;
use crate::metrics::MetricsCollector;
use crate::storage::{
    DatabaseError, PipelineTask, StageExecutionRecord, StyleRequirements, TaskStatus, TaskStore,
    TaskUpdate,
};

/// Largest accepted input, in bytes.
pub const MAX_CONTENT_BYTES: usize = 1024 * 1024;

/// Errors returned by [`TaskManager`] operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Task not found: {0}")]
    NotFound(Uuid),

    #[error("Task {0} already has a running engine")]
    AlreadyRunning(Uuid),

    #[error("Storage error: {0}")]
    Store(#[from] DatabaseError),
}

/// A request to style some content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub content: String,
    pub style_name: String,
    #[serde(default)]
    pub style_features: Vec<String>,
}

impl TransformRequest {
    pub fn new(content: impl Into<String>, style_name: impl Into<String>) -> Self {
        Self {
            content: content.into(),
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

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if self.content.len() > MAX_CONTENT_BYTES {
            return Err(ValidationError::ContentTooLarge {
                size: self.content.len(),
                limit: MAX_CONTENT_BYTES,
            });
        }
        if self.style_name.trim().is_empty() {
            return Err(ValidationError::EmptyStyleName);
        }
        if let Some(index) = self
            .style_features
            .iter()
            .position(|feature| feature.trim().is_empty())
        {
            return Err(ValidationError::EmptyStyleFeature { index });
        }
        Ok(())
    }

    fn requirements(&self) -> StyleRequirements {
        StyleRequirements::new(self.style_name.trim()).with_features(
            self.style_features
                .iter()
                .map(|feature| feature.trim().to_string()),
        )
    }
}

/// Reply to a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress: f64,
    /// Seconds.
    pub estimated_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress: f64,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSteps {
    pub task_id: Uuid,
    pub steps: Vec<StageExecutionRecord>,
    pub current_step: Option<String>,
    pub quality_score: Option<f64>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseHealth {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub database: DatabaseHealth,
    pub active_tasks: usize,
}

/// Registry entry for a run in flight.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub progress: watch::Receiver<Progress>,
    pub started_at: Instant,
}

/// In-flight runs keyed by task id.
pub type ActiveRuns = Arc<RwLock<HashMap<Uuid, ActiveRun>>>;

/// Creates an empty registry, scoped to whoever owns the returned handle.
pub fn new_active_runs() -> ActiveRuns {
    Arc::new(RwLock::new(HashMap::new()))
}

pub struct TaskManager {
    store: TaskStore,
    engine: Arc<WorkflowEngine>,
    active: ActiveRuns,
    estimated_time: Duration,
    metrics: MetricsCollector,
}

impl TaskManager {
    pub fn new(store: TaskStore, engine: Arc<WorkflowEngine>, active: ActiveRuns) -> Self {
        Self {
            store,
            engine,
            active,
            estimated_time: Duration::from_secs(60),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_estimated_time(mut self, estimate: Duration) -> Self {
        self.estimated_time = estimate;
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Validates and persists the request, then starts the pipeline in the
    /// background and returns immediately.
    pub async fn create_task(&self, request: TransformRequest) -> Result<TaskCreated, ManagerError> {
        request.validate()?;

        let requirements = request.requirements();
        let task_id = self.store.create_task(&request.content, &requirements).await?;
        self.launch(task_id, request.content, requirements).await?;

        tracing::info!(task_id = %task_id, style = %request.style_name, "Task created");

        Ok(TaskCreated {
            task_id,
            status: TaskStatus::Running,
            progress: 0.0,
            estimated_time: self.estimated_time.as_secs_f64(),
        })
    }

    async fn launch(
        &self,
        task_id: Uuid,
        content: String,
        requirements: StyleRequirements,
    ) -> Result<(), ManagerError> {
        // Held until the entry is inserted, so the run cannot deregister
        // before it is registered.
        let mut runs = self.active.write().await;
        if runs.contains_key(&task_id) {
            return Err(ManagerError::AlreadyRunning(task_id));
        }

        let (progress_tx, progress_rx) = watch::channel(Progress::start());
        let progress_tx = Arc::new(progress_tx);
        let engine = Arc::clone(&self.engine);
        let store = self.store.clone();
        let active = Arc::clone(&self.active);
        let metrics = self.metrics;

        tokio::spawn(async move {
            // Engine panics arrive here as a JoinError.
            let run_progress = Arc::clone(&progress_tx);
            let run = tokio::spawn(async move {
                engine
                    .execute(task_id, content, requirements, &run_progress)
                    .await
            });

            let status = match run.await {
                Ok(outcome) => {
                    if !outcome.persisted {
                        tracing::warn!(task_id = %task_id, "Run finished without a stored result");
                    }
                    outcome.status
                }
                Err(err) => {
                    tracing::error!(task_id = %task_id, error = %err, "Pipeline run panicked");
                    let update = TaskUpdate::new()
                        .with_status(TaskStatus::Failed)
                        .with_error(format!("system error: pipeline run aborted: {}", err));
                    if let Err(err) = store.update_task(task_id, &update).await {
                        tracing::error!(
                            task_id = %task_id,
                            error = %err,
                            "Failed to record aborted run"
                        );
                    }
                    metrics.record_task(TaskStatus::Failed.as_str(), 0.0);
                    TaskStatus::Failed
                }
            };
            progress_tx.send_modify(|p| {
                p.fraction = 1.0;
                p.current_stage = None;
                p.finished = true;
            });

            let mut runs = active.write().await;
            runs.remove(&task_id);
            metrics.set_active_runs(runs.len());
            tracing::debug!(task_id = %task_id, status = %status, "Run deregistered");
        });

        runs.insert(
            task_id,
            ActiveRun {
                progress: progress_rx,
                started_at: Instant::now(),
            },
        );
        self.metrics.set_active_runs(runs.len());

        Ok(())
    }

    /// Current status: live progress while the run is active, otherwise the
    /// persisted record.
    pub async fn get_status(&self, task_id: Uuid) -> Result<TaskStatusReport, ManagerError> {
        if let Some(progress) = self.live_progress(task_id).await {
            if !progress.finished {
                return Ok(TaskStatusReport {
                    task_id,
                    status: TaskStatus::Running,
                    progress: progress.fraction,
                    result: None,
                    error: None,
                });
            }
        }

        let task = self.load_task(task_id).await?;
        Ok(TaskStatusReport {
            task_id,
            status: task.status,
            progress: if task.status.is_terminal() { 1.0 } else { 0.0 },
            result: task.output,
            error: task.error_message,
        })
    }

    /// Every recorded stage attempt, in start order.
    pub async fn get_execution_steps(&self, task_id: Uuid) -> Result<ExecutionSteps, ManagerError> {
        let task = self.load_task(task_id).await?;
        let steps = self.store.list_stage_executions(task_id).await?;

        let current_step = if task.status.is_terminal() {
            None
        } else {
            match self.live_progress(task_id).await {
                Some(Progress {
                    current_stage: Some(stage),
                    ..
                }) => Some(stage.to_string()),
                _ => steps
                    .iter()
                    .rev()
                    .find(|step| step.status == TaskStatus::Running)
                    .map(|step| step.stage_name.clone()),
            }
        };

        let (quality_score, summary) = if task.status == TaskStatus::Completed {
            let summary = steps
                .iter()
                .rev()
                .find(|step| {
                    step.stage_name == StageName::QualityAssessment.as_str()
                        && step.status == TaskStatus::Completed
                })
                .and_then(|step| step.output_summary.clone());
            (task.quality_score, summary)
        } else {
            (None, None)
        };

        Ok(ExecutionSteps {
            task_id,
            steps,
            current_step,
            quality_score,
            summary,
        })
    }

    pub async fn health(&self) -> HealthReport {
        let database = match self.store.ping().await {
            Ok(()) => DatabaseHealth::Connected,
            Err(err) => {
                tracing::warn!(error = %err, "Database health check failed");
                DatabaseHealth::Disconnected
            }
        };
        HealthReport {
            status: match database {
                DatabaseHealth::Connected => HealthStatus::Healthy,
                DatabaseHealth::Disconnected => HealthStatus::Degraded,
            },
            database,
            active_tasks: self.active_task_count().await,
        }
    }

    pub async fn active_task_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Waits until the run for `task_id` has finished and returns the
    /// persisted task.
    pub async fn wait_for(&self, task_id: Uuid) -> Result<PipelineTask, ManagerError> {
        let receiver = self
            .active
            .read()
            .await
            .get(&task_id)
            .map(|run| run.progress.clone());

        if let Some(mut receiver) = receiver {
            // A closed channel means the run is gone; the store has the answer.
            let _ = receiver.wait_for(|progress| progress.finished).await;
        }

        self.load_task(task_id).await
    }

    async fn live_progress(&self, task_id: Uuid) -> Option<Progress> {
        self.active
            .read()
            .await
            .get(&task_id)
            .map(|run| *run.progress.borrow())
    }

    async fn load_task(&self, task_id: Uuid) -> Result<PipelineTask, ManagerError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(ManagerError::NotFound(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        assert_eq!(
            TransformRequest::new("", "Minimal").validate(),
            Err(ValidationError::EmptyContent)
        );
        assert_eq!(
            TransformRequest::new("  \n", "Minimal").validate(),
            Err(ValidationError::EmptyContent)
        );
        assert_eq!(
            TransformRequest::new("# Title", " ").validate(),
            Err(ValidationError::EmptyStyleName)
        );
        assert_eq!(
            TransformRequest::new("# Title", "Minimal")
                .with_features(["clean", ""])
                .validate(),
            Err(ValidationError::EmptyStyleFeature { index: 1 })
        );
        assert!(TransformRequest::new("# Title", "Minimal").validate().is_ok());
    }

    #[test]
    fn test_request_too_large() {
        let content = "a".repeat(MAX_CONTENT_BYTES + 1);
        assert!(matches!(
            TransformRequest::new(content, "Minimal").validate(),
            Err(ValidationError::ContentTooLarge { .. })
        ));
    }

    #[test]
    fn test_request_deserializes_without_features() {
        let request: TransformRequest =
            serde_json::from_str(r#"{"content": "hi", "style_name": "Minimal"}"#).unwrap();
        assert!(request.style_features.is_empty());
        assert_eq!(request.requirements(), StyleRequirements::new("Minimal"));
    }

    #[test]
    fn test_health_report_serialization() {
        let report = HealthReport {
            status: HealthStatus::Degraded,
            database: DatabaseHealth::Disconnected,
            active_tasks: 2,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["database"], "disconnected");
        assert_eq!(json["active_tasks"], 2);
    }
}
