//! Quality assessment stage.
//!
//! Scores the generated document with local structural checks and the
//! LLM's review. The combined score drives the engine's quality gate;
//! critical findings become blocking issues when the report is applied.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::code_generator::strip_tags;
use super::{complete, AgentSettings, StageError};
use crate::llm::LlmProvider;
use crate::pipeline::artifacts::{
    clamp_unit, GeneratedMarkup, QualityFinding, QualityReport, Severity,
};
use crate::pipeline::{PipelineState, Stage, StageName, StageOutput};
use crate::utils::parse_json_reply;

const SYSTEM_PROMPT: &str = r#"You review generated HTML documents for visual and editorial quality.
Judge: faithfulness to the source text, readability, consistency with the requested style, semantic structure.

Respond with ONLY a JSON object:
{
  "score": <number between 0 and 1>,
  "issues": ["<problem>", ...],
  "recommendations": ["<concrete CSS or markup change>", ...],
  "summary": "<one sentence>"
}"#;

const USER_TEMPLATE: &str = r#"Requested style: {style_name} ({features})

Source document:
{content}

Generated document:
{html}"#;

const SHELL_WEIGHT: f64 = 0.3;
const HEADING_WEIGHT: f64 = 0.25;
const COVERAGE_WEIGHT: f64 = 0.3;
const TOKEN_WEIGHT: f64 = 0.15;

const STRUCTURAL_SHARE: f64 = 0.6;
const MODEL_SHARE: f64 = 0.4;

/// Coverage below this is a critical finding.
const MIN_TEXT_COVERAGE: f64 = 0.3;

const MAX_PROMPT_CHARS: usize = 16_000;

#[derive(Debug, Deserialize)]
struct ReviewReply {
    score: f64,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    summary: String,
}

/// Outcome of the local checks.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralAssessment {
    pub shell: f64,
    pub headings: f64,
    pub coverage: f64,
    pub token_usage: f64,
    pub findings: Vec<QualityFinding>,
}

impl StructuralAssessment {
    pub fn score(&self) -> f64 {
        clamp_unit(
            SHELL_WEIGHT * self.shell
                + HEADING_WEIGHT * self.headings
                + COVERAGE_WEIGHT * self.coverage
                + TOKEN_WEIGHT * self.token_usage,
        )
    }
}

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\p{L}\p{N}]{3,}").expect("word pattern is valid"))
}

fn variable_definition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(--[a-z][a-z0-9-]*)\s*:").expect("variable pattern is valid"))
}

fn words(text: &str) -> BTreeSet<String> {
    word_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn fraction(hits: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        hits as f64 / total as f64
    }
}

/// Runs the local checks against the source content and headings.
pub fn assess_structure<'a>(
    markup: &GeneratedMarkup,
    source: &str,
    headings: impl Iterator<Item = &'a str>,
) -> StructuralAssessment {
    let lower = markup.html.to_lowercase();
    let mut findings = Vec::new();

    let shell_parts = ["<!doctype html>", "<html", "<head", "<style", "<body", "</html>"];
    let present = shell_parts.iter().filter(|p| lower.contains(*p)).count();
    let shell = fraction(present, shell_parts.len());
    if !lower.contains("<body") {
        findings.push(QualityFinding::new(
            Severity::Critical,
            "document has no body",
        ));
    } else if present < shell_parts.len() {
        findings.push(QualityFinding::new(
            Severity::Warning,
            "document shell is incomplete",
        ));
    }

    let text = strip_tags(&markup.html).to_lowercase();
    let rendered_words = words(&text);

    let headings: Vec<String> = headings.map(|h| h.trim().to_lowercase()).collect();
    let kept = headings.iter().filter(|h| text.contains(h.as_str())).count();
    let heading_score = fraction(kept, headings.len());
    if kept < headings.len() {
        findings.push(QualityFinding::new(
            Severity::Warning,
            format!("{} of {} headings missing", headings.len() - kept, headings.len()),
        ));
    }

    let source_words = words(source);
    let covered = source_words.intersection(&rendered_words).count();
    let coverage = fraction(covered, source_words.len());
    if coverage < MIN_TEXT_COVERAGE {
        findings.push(QualityFinding::new(
            Severity::Critical,
            format!("only {:.0}% of the source text is present", coverage * 100.0),
        ));
    }

    let defined: BTreeSet<&str> = variable_definition_regex()
        .captures_iter(&markup.stylesheet)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let used = defined
        .iter()
        .filter(|name| markup.stylesheet.contains(&format!("var({})", name)))
        .count();
    let token_usage = if defined.is_empty() {
        0.0
    } else {
        fraction(used, defined.len())
    };
    if token_usage < 0.5 {
        findings.push(QualityFinding::new(
            Severity::Warning,
            "most design tokens are unused",
        ));
    }

    StructuralAssessment {
        shell,
        headings: heading_score,
        coverage,
        token_usage,
        findings,
    }
}

/// Maps 0-10 and 0-100 scales onto `[0, 1]`.
fn normalize_model_score(score: f64) -> f64 {
    let scaled = if score > 10.0 {
        score / 100.0
    } else if score > 1.0 {
        score / 10.0
    } else {
        score
    };
    clamp_unit(scaled)
}

pub struct QualityAssessorAgent {
    llm: Arc<dyn LlmProvider>,
    settings: AgentSettings,
}

impl QualityAssessorAgent {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: AgentSettings) -> Self {
        Self { llm, settings }
    }
}

#[async_trait]
impl Stage for QualityAssessorAgent {
    fn name(&self) -> StageName {
        StageName::QualityAssessment
    }

    fn validate_preconditions(&self, state: &PipelineState) -> Result<(), StageError> {
        if state.generated_markup.is_none() {
            return Err(StageError::precondition(
                self.name().as_str(),
                "generated markup is missing",
            ));
        }
        Ok(())
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let markup = state.generated_markup.as_ref().ok_or_else(|| {
            StageError::precondition(self.name().as_str(), "generated markup is missing")
        })?;

        let structural = match &state.content_analysis {
            Some(analysis) => assess_structure(markup, &state.content, analysis.heading_texts()),
            None => assess_structure(markup, &state.content, std::iter::empty()),
        };

        let features = if state.requirements.style_features.is_empty() {
            "no extra features".to_string()
        } else {
            state.requirements.style_features.join(", ")
        };
        let html: String = markup.html.chars().take(MAX_PROMPT_CHARS).collect();
        let prompt = USER_TEMPLATE
            .replace("{style_name}", &state.requirements.style_name)
            .replace("{features}", &features)
            .replace("{content}", &state.content)
            .replace("{html}", &html);

        let reply = complete(self.llm.as_ref(), &self.settings, SYSTEM_PROMPT, prompt).await?;
        let review: ReviewReply = parse_json_reply(&reply)?;
        if !review.score.is_finite() {
            return Err(StageError::ResponseParse(
                "Review score is not a number".to_string(),
            ));
        }

        let model_score = normalize_model_score(review.score);
        let structural_score = structural.score();
        let score = STRUCTURAL_SHARE * structural_score + MODEL_SHARE * model_score;

        tracing::debug!(
            iteration = state.iteration_count,
            structural = structural_score,
            model = model_score,
            score,
            "Quality assessed"
        );

        let mut findings = structural.findings;
        findings.extend(
            review
                .issues
                .into_iter()
                .map(|issue| issue.trim().to_string())
                .filter(|issue| !issue.is_empty())
                .map(|issue| QualityFinding::new(Severity::Info, issue)),
        );

        Ok(StageOutput::QualityAssessment(
            QualityReport::new(score, structural_score, Some(model_score))
                .with_findings(findings)
                .with_recommendations(
                    review
                        .recommendations
                        .into_iter()
                        .map(|r| r.trim().to_string())
                        .filter(|r| !r.is_empty())
                        .collect(),
                )
                .with_summary(review.summary.trim()),
        ))
    }

    fn validate_output(&self, state: &PipelineState) -> Result<(), StageError> {
        match (&state.quality_report, state.quality_score) {
            (Some(_), Some(score)) if (0.0..=1.0).contains(&score) => Ok(()),
            _ => Err(StageError::postcondition(
                self.name().as_str(),
                "no valid quality score recorded",
            )),
        }
    }

    /// Recommendations and warnings for the next design pass.
    fn get_feedback(&self, state: &PipelineState) -> Option<String> {
        let report = state.quality_report.as_ref()?;
        let mut points: Vec<String> = report.recommendations.clone();
        points.extend(
            report
                .findings
                .iter()
                .filter(|f| f.severity == Severity::Warning)
                .map(|f| f.message.clone()),
        );
        if points.is_empty() {
            return None;
        }
        Some(format!(
            "Iteration {} scored {:.2}: {}",
            state.iteration_count,
            report.score(),
            points.join("; ")
        ))
    }
}
