//! The workflow engine: sequences stages and applies the quality gate.
//!
//! ```text
//! START -> content_analysis -> style_analysis -> design_adaptation
//!       -> code_generation -> quality_assessment -> gate
//! gate: Completed | Failed | Retry (iteration += 1, back to design_adaptation)
//! ```
//!
//! The engine owns the run's only [`PipelineState`]. Stages run strictly one
//! at a time. Any error escaping the loop is caught in
//! [`WorkflowEngine::execute`] and resolves the task to `failed`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use super::artifacts::GeneratedMarkup;
use super::collaboration::CollaborativeRunner;
use super::config::{Decision, PipelineConfig, QualityPolicy};
use super::stage::{Stage, StageName};
use super::state::PipelineState;
use crate::agents;
use crate::llm::LlmProvider;
use crate::metrics::MetricsCollector;
use crate::storage::{DatabaseError, StyleRequirements, TaskStatus, TaskStore, TaskUpdate};

/// Errors that abort a run outside of any single stage.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Store(#[from] DatabaseError),

    #[error("No stage registered for {0}")]
    MissingStage(StageName),

    #[error("Stage {0} registered more than once")]
    DuplicateStage(StageName),
}

/// Live progress of a run, published through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Fraction in `[0, 1]`; only ever increases.
    pub fraction: f64,
    pub current_stage: Option<StageName>,
    pub iteration: u32,
    pub finished: bool,
}

impl Progress {
    pub fn start() -> Self {
        Self {
            fraction: 0.0,
            current_stage: None,
            iteration: 0,
            finished: false,
        }
    }
}

/// Final result of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub quality_score: Option<f64>,
    pub iterations: u32,
    pub output: Option<String>,
    pub error: Option<String>,
    pub processing_time: f64,
    /// Whether the terminal row was written. When the full update could not
    /// be stored the engine still tries to mark the row failed.
    pub persisted: bool,
}

/// Highest-scoring quality assessment seen so far in a run.
#[derive(Debug, Clone)]
struct BestAttempt {
    score: f64,
    iteration: u32,
    markup: GeneratedMarkup,
}

struct Resolution {
    status: TaskStatus,
    quality_score: Option<f64>,
    output: Option<String>,
    error: Option<String>,
}

pub struct WorkflowEngine {
    store: TaskStore,
    runner: CollaborativeRunner,
    stages: BTreeMap<StageName, Arc<dyn Stage>>,
    policy: QualityPolicy,
    metrics: MetricsCollector,
}

impl WorkflowEngine {
    /// Builds an engine from exactly one implementation per stage.
    pub fn new(
        store: TaskStore,
        stages: Vec<Arc<dyn Stage>>,
        policy: QualityPolicy,
    ) -> Result<Self, EngineError> {
        let mut registered = BTreeMap::new();
        for stage in stages {
            let name = stage.name();
            if registered.insert(name, stage).is_some() {
                return Err(EngineError::DuplicateStage(name));
            }
        }
        if let Some(missing) = StageName::ALL
            .into_iter()
            .find(|name| !registered.contains_key(name))
        {
            return Err(EngineError::MissingStage(missing));
        }

        Ok(Self {
            runner: CollaborativeRunner::new(store.clone()),
            store,
            stages: registered,
            policy,
            metrics: MetricsCollector::new(),
        })
    }

    /// Builds an engine with the five LLM-backed agents.
    pub fn with_default_stages(
        store: TaskStore,
        llm: Arc<dyn LlmProvider>,
        config: &PipelineConfig,
    ) -> Result<Self, EngineError> {
        Self::new(store, agents::default_stages(llm, config), config.quality)
    }

    pub fn policy(&self) -> &QualityPolicy {
        &self.policy
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Runs a task to a terminal state and persists the result.
    pub async fn execute(
        &self,
        task_id: Uuid,
        content: String,
        requirements: StyleRequirements,
        progress: &watch::Sender<Progress>,
    ) -> RunOutcome {
        self.execute_detailed(task_id, content, requirements, progress)
            .await
            .0
    }

    /// Like [`execute`](Self::execute), also returning the final state.
    pub async fn execute_detailed(
        &self,
        task_id: Uuid,
        content: String,
        requirements: StyleRequirements,
        progress: &watch::Sender<Progress>,
    ) -> (RunOutcome, PipelineState) {
        let clock = Instant::now();
        let mut state = PipelineState::new(task_id, content, requirements);

        tracing::info!(
            task_id = %task_id,
            style = %state.requirements.style_name,
            "Pipeline started"
        );

        let resolution = match self.run(&mut state, progress).await {
            Ok(resolution) => resolution,
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "Pipeline aborted");
                let mut message = format!("system error: {}", err);
                if let Some(issues) = state.aggregated_errors() {
                    message.push_str("; ");
                    message.push_str(&issues);
                }
                Resolution {
                    status: TaskStatus::Failed,
                    quality_score: None,
                    output: None,
                    error: Some(message),
                }
            }
        };

        let processing_time = clock.elapsed().as_secs_f64();
        let update = TaskUpdate {
            status: Some(resolution.status),
            output: resolution.output.clone(),
            quality_score: resolution.quality_score,
            processing_time: Some(processing_time),
            error_message: resolution.error.clone(),
        };
        let persisted = self.persist_final(task_id, &update).await;

        self.metrics
            .record_task(resolution.status.as_str(), processing_time);
        progress.send_modify(|p| {
            p.fraction = 1.0;
            p.current_stage = None;
            p.finished = true;
        });

        tracing::info!(
            task_id = %task_id,
            status = %resolution.status,
            score = ?resolution.quality_score,
            iterations = state.iteration_count,
            processing_time,
            "Pipeline finished"
        );

        let outcome = RunOutcome {
            task_id,
            status: resolution.status,
            quality_score: resolution.quality_score,
            iterations: state.iteration_count,
            output: resolution.output,
            error: resolution.error,
            processing_time,
            persisted,
        };
        (outcome, state)
    }

    async fn run(
        &self,
        state: &mut PipelineState,
        progress: &watch::Sender<Progress>,
    ) -> Result<Resolution, EngineError> {
        let mut best: Option<BestAttempt> = None;
        let mut pass: &[StageName] = &StageName::ALL;

        loop {
            let completed = self.run_pass(pass, state, progress, &mut best).await?;

            // A finished pass is judged on its own assessment. A halted retry
            // pass falls back to the best earlier attempt, judged as if the
            // iteration cap had been reached.
            let (gate_iteration, gate_score) = if completed {
                (state.iteration_count, state.quality_score)
            } else {
                (
                    state.iteration_count.max(self.policy.max_iterations),
                    best.as_ref().map(|b| b.score),
                )
            };
            let decision =
                self.policy
                    .decide(state.has_blocking_issue(), gate_iteration, gate_score);

            tracing::info!(
                task_id = %state.task_id,
                iteration = state.iteration_count,
                score = ?gate_score,
                pass_completed = completed,
                decision = ?decision,
                "Quality gate decision"
            );

            match decision {
                Decision::Retry => {
                    state.iteration_count += 1;
                    self.metrics.record_retry();
                    pass = &StageName::RETRY_PASS;
                }
                Decision::Completed => {
                    return Ok(match best {
                        Some(best) => {
                            tracing::debug!(
                                task_id = %state.task_id,
                                best_iteration = best.iteration,
                                "Using best-scoring attempt"
                            );
                            Resolution {
                                status: TaskStatus::Completed,
                                quality_score: Some(best.score),
                                output: Some(best.markup.html),
                                error: None,
                            }
                        }
                        None => Resolution {
                            status: TaskStatus::Failed,
                            quality_score: None,
                            output: None,
                            error: Some("no markup was generated".to_string()),
                        },
                    });
                }
                Decision::Failed => {
                    return Ok(Resolution {
                        status: TaskStatus::Failed,
                        quality_score: gate_score,
                        output: None,
                        error: Some(self.failure_message(state, gate_score)),
                    });
                }
            }
        }
    }

    /// Writes the terminal row, trying the full update twice and then a bare
    /// `failed` status so the task cannot stay `running`.
    async fn persist_final(&self, task_id: Uuid, update: &TaskUpdate) -> bool {
        for attempt in 1..=2u32 {
            match self.store.update_task(task_id, update).await {
                Ok(()) => return true,
                Err(err) => tracing::warn!(
                    task_id = %task_id,
                    attempt,
                    error = %err,
                    "Failed to persist final task state"
                ),
            }
        }

        let fallback = TaskUpdate::new()
            .with_status(TaskStatus::Failed)
            .with_error("final task state could not be persisted");
        if let Err(err) = self.store.update_task(task_id, &fallback).await {
            tracing::error!(
                task_id = %task_id,
                error = %err,
                "Task left without a terminal state"
            );
        }
        false
    }

    /// Runs `stages` in order and stops at the first failed attempt.
    /// Returns whether every stage completed.
    async fn run_pass(
        &self,
        stages: &[StageName],
        state: &mut PipelineState,
        progress: &watch::Sender<Progress>,
        best: &mut Option<BestAttempt>,
    ) -> Result<bool, EngineError> {
        for &name in stages {
            let iteration = state.iteration_count;
            progress.send_modify(|p| {
                p.current_stage = Some(name);
                p.iteration = iteration;
            });

            let stage = self
                .stages
                .get(&name)
                .ok_or(EngineError::MissingStage(name))?;
            let outcome = self.runner.run_stage(stage, state).await?;
            if !outcome.is_completed() {
                return Ok(false);
            }

            if name == StageName::QualityAssessment {
                if let (Some(score), Some(markup)) = (state.quality_score, &state.generated_markup)
                {
                    self.metrics.record_quality(score);
                    if best.as_ref().map_or(true, |b| score > b.score) {
                        *best = Some(BestAttempt {
                            score,
                            iteration,
                            markup: markup.clone(),
                        });
                    }
                }
            }

            let fraction = progress_after(name, iteration, self.policy.max_iterations);
            progress.send_modify(|p| p.fraction = p.fraction.max(fraction));
        }

        Ok(true)
    }

    fn failure_message(&self, state: &PipelineState, score: Option<f64>) -> String {
        let issues = state.aggregated_errors();
        if state.has_blocking_issue() {
            if let Some(issues) = issues {
                return issues;
            }
        }

        let mut message = match score {
            Some(score) => format!(
                "quality score {:.2} below acceptable threshold {:.2}",
                score, self.policy.acceptable_threshold
            ),
            None => "quality assessment did not produce a score".to_string(),
        };
        if let Some(issues) = issues {
            message.push_str("; ");
            message.push_str(&issues);
        }
        message
    }
}

/// Progress fraction after `stage` completes. The first pass covers 90%,
/// retries share the rest; 1.0 is reserved for a terminal state.
fn progress_after(stage: StageName, iteration: u32, max_iterations: u32) -> f64 {
    let position = stage.position() as f64;
    if iteration == 0 {
        return 0.9 * (position + 1.0) / StageName::ALL.len() as f64;
    }
    let within_pass = (position - 1.0) / StageName::RETRY_PASS.len() as f64;
    let done = (iteration - 1) as f64 + within_pass;
    (0.9 + 0.09 * done / max_iterations.max(1) as f64).min(0.99)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_monotonic() {
        let mut last = 0.0;
        for stage in StageName::ALL {
            let p = progress_after(stage, 0, 3);
            assert!(p > last);
            last = p;
        }
        assert!((last - 0.9).abs() < 1e-9);

        for iteration in 1..=3 {
            for stage in StageName::RETRY_PASS {
                let p = progress_after(stage, iteration, 3);
                assert!(p > last, "{} at {} not increasing", stage, iteration);
                assert!(p < 1.0);
                last = p;
            }
        }
    }

    #[tokio::test]
    async fn test_new_requires_every_stage_once() {
        let store = TaskStore::in_memory().await.unwrap();
        let err = WorkflowEngine::new(store, Vec::new(), QualityPolicy::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            EngineError::MissingStage(StageName::ContentAnalysis)
        ));
    }
}
