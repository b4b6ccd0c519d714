//! Per-run mutable state threaded through the stages.
//!
//! One `PipelineState` exists per run and is owned by the workflow engine.
//! Stages only ever see a snapshot; their results come back as a
//! [`StageOutput`] which the engine applies here.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifacts::{
    ContentAnalysis, DesignTokens, GeneratedMarkup, QualityReport, Severity, StyleProfile,
    StyleRule,
};
use super::stage::StageName;
use crate::storage::{ExecutionStatus, StyleRequirements};

/// A recorded problem.
///
/// Blocking issues force the quality gate to fail the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineIssue {
    pub stage: StageName,
    pub iteration: u32,
    pub message: String,
    pub blocking: bool,
}

impl fmt::Display for PipelineIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} #{}] {}", self.stage, self.iteration, self.message)
    }
}

/// Typed output of one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    ContentAnalysis(ContentAnalysis),
    StyleAnalysis(StyleProfile),
    DesignAdaptation {
        tokens: DesignTokens,
        rules: Vec<StyleRule>,
    },
    CodeGeneration(GeneratedMarkup),
    QualityAssessment(QualityReport),
}

impl StageOutput {
    /// The stage that is allowed to produce this output.
    pub fn stage(&self) -> StageName {
        match self {
            StageOutput::ContentAnalysis(_) => StageName::ContentAnalysis,
            StageOutput::StyleAnalysis(_) => StageName::StyleAnalysis,
            StageOutput::DesignAdaptation { .. } => StageName::DesignAdaptation,
            StageOutput::CodeGeneration(_) => StageName::CodeGeneration,
            StageOutput::QualityAssessment(_) => StageName::QualityAssessment,
        }
    }
}

/// Side-channel entry a stage leaves for later stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationEntry {
    pub execution_id: Uuid,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub stage: StageName,
    pub iteration: u32,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub at: DateTime<Utc>,
    pub duration_secs: Option<f64>,
    pub message: Option<String>,
}

/// Snapshot taken after every successful stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheckpoint {
    pub stage: StageName,
    pub iteration: u32,
    pub at: DateTime<Utc>,
    pub duration_secs: f64,
    pub quality_score: Option<f64>,
    pub issue_count: usize,
}

/// The single mutable aggregate for one run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub task_id: Uuid,
    pub content: String,
    pub requirements: StyleRequirements,

    // artifacts
    pub content_analysis: Option<ContentAnalysis>,
    pub style_profile: Option<StyleProfile>,
    pub design_tokens: Option<DesignTokens>,
    pub style_rules: Option<Vec<StyleRule>>,
    pub generated_markup: Option<GeneratedMarkup>,
    pub quality_score: Option<f64>,
    pub quality_report: Option<QualityReport>,

    // bookkeeping
    pub iteration_count: u32,
    pub errors: Vec<PipelineIssue>,
    pub warnings: Vec<String>,
    pub last_error: Option<String>,
    pub collaboration_context: BTreeMap<StageName, CollaborationEntry>,
    pub agent_feedback: BTreeMap<StageName, Vec<String>>,
    pub execution_log: Vec<ExecutionLogEntry>,
    pub quality_checkpoints: Vec<QualityCheckpoint>,
}

impl PipelineState {
    pub fn new(task_id: Uuid, content: impl Into<String>, requirements: StyleRequirements) -> Self {
        Self {
            task_id,
            content: content.into(),
            requirements,
            content_analysis: None,
            style_profile: None,
            design_tokens: None,
            style_rules: None,
            generated_markup: None,
            quality_score: None,
            quality_report: None,
            iteration_count: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            last_error: None,
            collaboration_context: BTreeMap::new(),
            agent_feedback: BTreeMap::new(),
            execution_log: Vec::new(),
            quality_checkpoints: Vec::new(),
        }
    }

    /// Stores a stage output. A quality report also sets `quality_score` and
    /// turns critical findings into blocking issues.
    pub fn apply(&mut self, output: StageOutput) {
        match output {
            StageOutput::ContentAnalysis(analysis) => self.content_analysis = Some(analysis),
            StageOutput::StyleAnalysis(profile) => self.style_profile = Some(profile),
            StageOutput::DesignAdaptation { tokens, rules } => {
                self.design_tokens = Some(tokens);
                self.style_rules = Some(rules);
            }
            StageOutput::CodeGeneration(markup) => self.generated_markup = Some(markup),
            StageOutput::QualityAssessment(report) => {
                for finding in &report.findings {
                    match finding.severity {
                        Severity::Critical => self.push_issue(PipelineIssue {
                            stage: StageName::QualityAssessment,
                            iteration: self.iteration_count,
                            message: format!("quality check failed: {}", finding.message),
                            blocking: true,
                        }),
                        Severity::Warning => self.warnings.push(finding.message.clone()),
                        Severity::Info => {}
                    }
                }
                self.quality_score = Some(report.score());
                self.quality_report = Some(report);
            }
        }
    }

    pub fn push_issue(&mut self, issue: PipelineIssue) {
        self.last_error = Some(issue.to_string());
        self.errors.push(issue);
    }

    /// Records a failed stage attempt.
    ///
    /// First-pass failures are blocking. On a retry pass an earlier attempt
    /// may already have passed the gate, so the failure is recorded without
    /// blocking.
    pub fn record_stage_failure(&mut self, stage: StageName, message: impl Into<String>) {
        let iteration = self.iteration_count;
        self.push_issue(PipelineIssue {
            stage,
            iteration,
            message: message.into(),
            blocking: iteration == 0,
        });
    }

    pub fn has_blocking_issue(&self) -> bool {
        self.errors.iter().any(|issue| issue.blocking)
    }

    /// All issues across iterations, oldest first, as one message.
    pub fn aggregated_errors(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn feedback_for(&self, stage: StageName) -> &[String] {
        self.agent_feedback
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn add_feedback(&mut self, target: StageName, feedback: String) {
        self.agent_feedback.entry(target).or_default().push(feedback);
    }

    /// Inputs a stage reads, summarized for the collaboration context.
    pub fn input_snapshot(&self, stage: StageName) -> BTreeMap<String, String> {
        let mut snapshot = BTreeMap::new();
        snapshot.insert("iteration".to_string(), self.iteration_count.to_string());
        match stage {
            StageName::ContentAnalysis => {
                snapshot.insert("content_chars".to_string(), self.content.chars().count().to_string());
            }
            StageName::StyleAnalysis => {
                snapshot.insert("style_name".to_string(), self.requirements.style_name.clone());
                snapshot.insert(
                    "style_features".to_string(),
                    self.requirements.style_features.join(", "),
                );
            }
            StageName::DesignAdaptation => {
                if let Some(profile) = &self.style_profile {
                    snapshot.insert("mood".to_string(), profile.mood.clone());
                    snapshot.insert("layout".to_string(), profile.layout.clone());
                }
            }
            StageName::CodeGeneration => {
                if let Some(rules) = &self.style_rules {
                    snapshot.insert("rule_count".to_string(), rules.len().to_string());
                }
            }
            StageName::QualityAssessment => {
                if let Some(markup) = &self.generated_markup {
                    snapshot.insert("markup_bytes".to_string(), markup.byte_len().to_string());
                }
            }
        }
        let feedback = self.feedback_for(stage);
        if !feedback.is_empty() {
            snapshot.insert("feedback_count".to_string(), feedback.len().to_string());
        }
        snapshot
    }

    /// Outputs a stage produced, summarized for the collaboration context.
    pub fn output_snapshot(&self, stage: StageName) -> BTreeMap<String, String> {
        let mut snapshot = BTreeMap::new();
        match stage {
            StageName::ContentAnalysis => {
                if let Some(analysis) = &self.content_analysis {
                    snapshot.insert("content_type".to_string(), analysis.content_type.clone());
                    snapshot.insert("tone".to_string(), analysis.tone.clone());
                    snapshot.insert("word_count".to_string(), analysis.word_count.to_string());
                    snapshot.insert("headings".to_string(), analysis.headings.len().to_string());
                }
            }
            StageName::StyleAnalysis => {
                if let Some(profile) = &self.style_profile {
                    snapshot.insert("primary".to_string(), profile.palette.primary.clone());
                    snapshot.insert("heading_font".to_string(), profile.typography.heading_font.clone());
                    snapshot.insert("mood".to_string(), profile.mood.clone());
                }
            }
            StageName::DesignAdaptation => {
                if let Some(tokens) = &self.design_tokens {
                    let count = tokens.colors.len() + tokens.fonts.len() + tokens.spacing.len();
                    snapshot.insert("token_count".to_string(), count.to_string());
                }
                if let Some(rules) = &self.style_rules {
                    snapshot.insert("rule_count".to_string(), rules.len().to_string());
                }
            }
            StageName::CodeGeneration => {
                if let Some(markup) = &self.generated_markup {
                    snapshot.insert("markup_bytes".to_string(), markup.byte_len().to_string());
                }
            }
            StageName::QualityAssessment => {
                if let Some(score) = self.quality_score {
                    snapshot.insert("quality_score".to_string(), format!("{:.3}", score));
                }
                if let Some(report) = &self.quality_report {
                    snapshot.insert("findings".to_string(), report.findings.len().to_string());
                }
            }
        }
        snapshot
    }

    /// One-line description of what a stage is about to consume.
    pub fn input_summary(&self, stage: StageName) -> String {
        summarize(&self.input_snapshot(stage))
    }

    /// One-line description of what a stage produced.
    pub fn output_summary(&self, stage: StageName) -> String {
        match (stage, &self.quality_report) {
            (StageName::QualityAssessment, Some(report)) if !report.summary.is_empty() => {
                format!("score={:.3}; {}", report.score(), report.summary)
            }
            _ => summarize(&self.output_snapshot(stage)),
        }
    }
}

fn summarize(snapshot: &BTreeMap<String, String>) -> String {
    snapshot
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::artifacts::QualityFinding;

    fn state() -> PipelineState {
        PipelineState::new(
            Uuid::new_v4(),
            "# Title\nBody text.",
            StyleRequirements::new("Minimal"),
        )
    }

    #[test]
    fn test_apply_quality_report_sets_score_and_blocking() {
        let mut state = state();
        let report = QualityReport::new(0.9, 0.9, None).with_findings(vec![
            QualityFinding::new(Severity::Warning, "long lines"),
            QualityFinding::new(Severity::Critical, "document has no body"),
        ]);
        state.apply(StageOutput::QualityAssessment(report));

        assert_eq!(state.quality_score, Some(0.9));
        assert!(state.has_blocking_issue());
        assert_eq!(state.warnings, vec!["long lines"]);
        assert!(state.last_error.as_deref().unwrap().contains("no body"));
    }

    #[test]
    fn test_stage_failure_blocking_depends_on_iteration() {
        let mut state = state();
        state.iteration_count = 1;
        state.record_stage_failure(StageName::CodeGeneration, "timeout");
        assert!(!state.has_blocking_issue());

        state.iteration_count = 0;
        state.record_stage_failure(StageName::ContentAnalysis, "boom");
        assert!(state.has_blocking_issue());

        let aggregated = state.aggregated_errors().unwrap();
        assert_eq!(
            aggregated,
            "[code_generation #1] timeout; [content_analysis #0] boom"
        );
    }

    #[test]
    fn test_feedback_accumulates_per_target() {
        let mut state = state();
        assert!(state.feedback_for(StageName::DesignAdaptation).is_empty());
        state.add_feedback(StageName::DesignAdaptation, "increase contrast".into());
        state.add_feedback(StageName::DesignAdaptation, "wider margins".into());
        assert_eq!(state.feedback_for(StageName::DesignAdaptation).len(), 2);
        assert_eq!(
            state.input_snapshot(StageName::DesignAdaptation)["feedback_count"],
            "2"
        );
    }

    #[test]
    fn test_output_stage_mapping() {
        let output = StageOutput::DesignAdaptation {
            tokens: DesignTokens::default(),
            rules: vec![],
        };
        assert_eq!(output.stage(), StageName::DesignAdaptation);
    }
}
