//! Content analysis stage.
//!
//! Builds a structural outline of the markdown locally, then asks the LLM
//! for the semantic part (content type, tone, key points).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{complete, AgentSettings, StageError};
use crate::llm::LlmProvider;
use crate::pipeline::artifacts::{ContentAnalysis, Heading};
use crate::pipeline::{PipelineState, Stage, StageName, StageOutput};
use crate::utils::parse_json_reply;

const SYSTEM_PROMPT: &str = r#"You read documents and describe them for a designer who will style them as a web page.

Respond with ONLY a JSON object:
{
  "content_type": "<article|tutorial|announcement|reference|notes|other>",
  "tone": "<one or two words>",
  "title": "<document title or null>",
  "key_points": ["<short phrase>", ...],
  "summary": "<one sentence>"
}"#;

const USER_TEMPLATE: &str = r#"Document outline:
{outline}

Full text:
{content}"#;

/// Longest slice of the input sent to the model.
const MAX_PROMPT_CHARS: usize = 12_000;

#[derive(Debug, Deserialize)]
struct AnalysisReply {
    content_type: String,
    tone: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    summary: String,
}

/// Local markdown structure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outline {
    pub headings: Vec<Heading>,
    pub paragraph_count: usize,
    pub list_item_count: usize,
    pub code_block_count: usize,
    pub word_count: usize,
}

impl Outline {
    pub fn parse(content: &str) -> Self {
        let mut outline = Outline::default();
        let mut in_code = false;
        let mut in_paragraph = false;

        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.starts_with("```") {
                if !in_code {
                    outline.code_block_count += 1;
                }
                in_code = !in_code;
                in_paragraph = false;
                continue;
            }
            if in_code {
                continue;
            }

            outline.word_count += trimmed.split_whitespace().count();

            if trimmed.is_empty() {
                in_paragraph = false;
            } else if let Some(heading) = parse_heading(trimmed) {
                outline.word_count -= 1;
                outline.headings.push(heading);
                in_paragraph = false;
            } else if is_list_item(trimmed) {
                outline.list_item_count += 1;
                in_paragraph = false;
            } else if !in_paragraph {
                outline.paragraph_count += 1;
                in_paragraph = true;
            }
        }

        outline
    }

    fn render(&self) -> String {
        let mut lines: Vec<String> = self
            .headings
            .iter()
            .map(|h| format!("{} {}", "#".repeat(h.level as usize), h.text))
            .collect();
        lines.push(format!(
            "paragraphs={} list_items={} code_blocks={} words={}",
            self.paragraph_count, self.list_item_count, self.code_block_count, self.word_count
        ));
        lines.join("\n")
    }
}

fn parse_heading(line: &str) -> Option<Heading> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(' ') {
        return None;
    }
    let text = rest.trim().trim_end_matches('#').trim();
    if text.is_empty() {
        return None;
    }
    Some(Heading {
        level: level as u8,
        text: text.to_string(),
    })
}

fn is_list_item(line: &str) -> bool {
    if line.starts_with("- ") || line.starts_with("* ") || line.starts_with("+ ") {
        return true;
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && line[digits..].starts_with(". ")
}

pub struct ContentAnalyzerAgent {
    llm: Arc<dyn LlmProvider>,
    settings: AgentSettings,
}

impl std::fmt::Debug for ContentAnalyzerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentAnalyzerAgent").finish_non_exhaustive()
    }
}

impl ContentAnalyzerAgent {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: AgentSettings) -> Self {
        Self { llm, settings }
    }
}

#[async_trait]
impl Stage for ContentAnalyzerAgent {
    fn name(&self) -> StageName {
        StageName::ContentAnalysis
    }

    fn validate_preconditions(&self, state: &PipelineState) -> Result<(), StageError> {
        if state.content.trim().is_empty() {
            return Err(StageError::precondition(
                self.name().as_str(),
                "input content is empty",
            ));
        }
        Ok(())
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let outline = Outline::parse(&state.content);
        let content: String = state.content.chars().take(MAX_PROMPT_CHARS).collect();
        let prompt = USER_TEMPLATE
            .replace("{outline}", &outline.render())
            .replace("{content}", &content);

        let reply = complete(self.llm.as_ref(), &self.settings, SYSTEM_PROMPT, prompt).await?;
        let parsed: AnalysisReply = parse_json_reply(&reply)?;

        let title = parsed
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && t != "null")
            .or_else(|| {
                outline
                    .headings
                    .iter()
                    .find(|h| h.level == 1)
                    .map(|h| h.text.clone())
            });

        Ok(StageOutput::ContentAnalysis(ContentAnalysis {
            title,
            content_type: normalize_label(&parsed.content_type, "other"),
            tone: normalize_label(&parsed.tone, "neutral"),
            headings: outline.headings,
            paragraph_count: outline.paragraph_count,
            list_item_count: outline.list_item_count,
            code_block_count: outline.code_block_count,
            word_count: outline.word_count,
            key_points: parsed
                .key_points
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            summary: parsed.summary.trim().to_string(),
        }))
    }

    fn validate_output(&self, state: &PipelineState) -> Result<(), StageError> {
        match &state.content_analysis {
            None => Err(StageError::postcondition(
                self.name().as_str(),
                "no analysis recorded",
            )),
            Some(analysis) if analysis.word_count == 0 && analysis.headings.is_empty() => Err(
                StageError::postcondition(self.name().as_str(), "content has no words"),
            ),
            Some(_) => Ok(()),
        }
    }

    fn get_feedback(&self, state: &PipelineState) -> Option<String> {
        let analysis = state.content_analysis.as_ref()?;
        Some(format!(
            "Content is a {} with a {} tone; keep all {} headings and {} list items readable.",
            analysis.content_type,
            analysis.tone,
            analysis.headings.len(),
            analysis.list_item_count
        ))
    }
}

fn normalize_label(raw: &str, fallback: &str) -> String {
    let label = raw.trim().to_lowercase();
    if label.is_empty() {
        fallback.to_string()
    } else {
        label
    }
}
