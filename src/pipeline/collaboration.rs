//! The collaboration wrapper around every stage attempt.
//!
//! [`CollaborativeRunner::run_stage`] is the only place a stage is invoked.
//! For one attempt it:
//!
//! 1. appends a `running` execution record and snapshots the stage inputs
//!    into the collaboration context;
//! 2. checks preconditions;
//! 3. runs `execute` on a spawned tokio task so a panic or a slow LLM call
//!    never escapes into the engine;
//! 4. applies the output to a candidate state and checks postconditions;
//! 5. on success commits the candidate, stamps the checkpoint and settles
//!    the record;
//! 6. routes feedback to the stage's static downstream target.
//!
//! Stage faults become recorded issues and a failed record. Only storage
//! faults are returned as errors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use super::stage::{Stage, StageName};
use super::state::{CollaborationEntry, ExecutionLogEntry, PipelineState, QualityCheckpoint};
use crate::agents::StageError;
use crate::metrics::MetricsCollector;
use crate::storage::{DatabaseError, ExecutionStatus, StageExecutionUpdate, TaskStore};

/// Result of one stage attempt.
#[derive(Debug)]
pub enum StageOutcome {
    Completed {
        execution_id: Uuid,
        duration: Duration,
    },
    Failed {
        execution_id: Uuid,
        error: StageError,
    },
}

impl StageOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed { .. })
    }

    pub fn execution_id(&self) -> Uuid {
        match self {
            StageOutcome::Completed { execution_id, .. }
            | StageOutcome::Failed { execution_id, .. } => *execution_id,
        }
    }
}

/// Runs stages with consistent logging, persistence and feedback routing.
#[derive(Clone)]
pub struct CollaborativeRunner {
    store: TaskStore,
    metrics: MetricsCollector,
}

impl CollaborativeRunner {
    pub fn new(store: TaskStore) -> Self {
        Self {
            store,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn run_stage(
        &self,
        stage: &Arc<dyn Stage>,
        state: &mut PipelineState,
    ) -> Result<StageOutcome, DatabaseError> {
        let name = stage.name();
        let iteration = state.iteration_count;
        let clock = Instant::now();
        let started_at = Utc::now();

        let execution_id = self
            .store
            .log_stage_execution(state.task_id, name.as_str(), iteration, &state.input_summary(name))
            .await?;

        state.collaboration_context.insert(
            name,
            CollaborationEntry {
                execution_id,
                iteration,
                started_at,
                inputs: state.input_snapshot(name),
                outputs: BTreeMap::new(),
                completed_at: None,
                duration_secs: None,
            },
        );
        state.execution_log.push(ExecutionLogEntry {
            stage: name,
            iteration,
            execution_id,
            status: ExecutionStatus::Running,
            at: started_at,
            duration_secs: None,
            message: None,
        });

        tracing::info!(
            task_id = %state.task_id,
            stage = %name,
            iteration,
            execution_id = %execution_id,
            "Stage started"
        );

        if let Err(err) = stage.validate_preconditions(state) {
            return self.fail(state, name, execution_id, clock, err).await;
        }

        let output = match execute_offloaded(stage, state).await {
            Ok(output) => output,
            Err(err) => return self.fail(state, name, execution_id, clock, err).await,
        };

        if output.stage() != name {
            let err = StageError::postcondition(
                name.as_str(),
                format!("produced output for {}", output.stage()),
            );
            return self.fail(state, name, execution_id, clock, err).await;
        }

        let mut candidate = state.clone();
        candidate.apply(output);
        if let Err(err) = stage.validate_output(&candidate) {
            return self.fail(state, name, execution_id, clock, err).await;
        }
        *state = candidate;

        let duration = clock.elapsed();
        let secs = duration.as_secs_f64();
        let completed_at = Utc::now();

        state.quality_checkpoints.push(QualityCheckpoint {
            stage: name,
            iteration,
            at: completed_at,
            duration_secs: secs,
            quality_score: state.quality_score,
            issue_count: state.errors.len(),
        });
        let outputs = state.output_snapshot(name);
        if let Some(entry) = state.collaboration_context.get_mut(&name) {
            entry.outputs = outputs;
            entry.completed_at = Some(completed_at);
            entry.duration_secs = Some(secs);
        }

        self.store
            .update_stage_execution(
                execution_id,
                &StageExecutionUpdate::completed(state.output_summary(name), secs),
            )
            .await?;

        state.execution_log.push(ExecutionLogEntry {
            stage: name,
            iteration,
            execution_id,
            status: ExecutionStatus::Completed,
            at: completed_at,
            duration_secs: Some(secs),
            message: None,
        });
        self.metrics.record_stage(name.as_str(), "completed", secs);

        if let Some(target) = name.downstream() {
            if let Some(feedback) = stage.provide_feedback_to(target, state) {
                if !feedback.trim().is_empty() {
                    tracing::debug!(from = %name, to = %target, "Routing stage feedback");
                    state.add_feedback(target, feedback);
                }
            }
        }

        tracing::info!(
            task_id = %state.task_id,
            stage = %name,
            iteration,
            duration_ms = duration.as_millis() as u64,
            "Stage completed"
        );

        Ok(StageOutcome::Completed {
            execution_id,
            duration,
        })
    }

    async fn fail(
        &self,
        state: &mut PipelineState,
        name: StageName,
        execution_id: Uuid,
        clock: Instant,
        error: StageError,
    ) -> Result<StageOutcome, DatabaseError> {
        let secs = clock.elapsed().as_secs_f64();
        let message = error.to_string();
        let completed_at = Utc::now();

        tracing::warn!(
            task_id = %state.task_id,
            stage = %name,
            iteration = state.iteration_count,
            kind = error.kind(),
            error = %message,
            "Stage failed"
        );

        state.record_stage_failure(name, message.clone());
        if let Some(entry) = state.collaboration_context.get_mut(&name) {
            entry.completed_at = Some(completed_at);
            entry.duration_secs = Some(secs);
        }
        state.execution_log.push(ExecutionLogEntry {
            stage: name,
            iteration: state.iteration_count,
            execution_id,
            status: ExecutionStatus::Failed,
            at: completed_at,
            duration_secs: Some(secs),
            message: Some(message.clone()),
        });

        self.store
            .update_stage_execution(execution_id, &StageExecutionUpdate::failed(message, secs))
            .await?;
        self.metrics.record_stage(name.as_str(), "failed", secs);

        Ok(StageOutcome::Failed {
            execution_id,
            error,
        })
    }
}

/// Runs `execute` on its own tokio task; the engine's only suspension point
/// per stage is awaiting it.
async fn execute_offloaded(
    stage: &Arc<dyn Stage>,
    state: &PipelineState,
) -> Result<super::state::StageOutput, StageError> {
    let stage = Arc::clone(stage);
    let snapshot = state.clone();

    match tokio::spawn(async move { stage.execute(&snapshot).await }).await {
        Ok(result) => result,
        Err(join_err) => Err(StageError::Panicked(join_err.to_string())),
    }
}
