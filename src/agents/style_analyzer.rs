//! Style analysis stage: turns a style name and feature list into a
//! concrete [`StyleProfile`].

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::{complete, feedback_block, AgentSettings, StageError};
use crate::llm::LlmProvider;
use crate::pipeline::artifacts::{ColorPalette, StyleProfile, Typography};
use crate::pipeline::{PipelineState, Stage, StageName, StageOutput};
use crate::utils::parse_json_reply;

const SYSTEM_PROMPT: &str = r##"You are a visual designer. Interpret a named style for a single web page.

Respond with ONLY a JSON object:
{
  "palette": {"primary": "#hex", "secondary": "#hex", "background": "#hex", "text": "#hex", "accent": "#hex"},
  "typography": {"heading_font": "<css font stack>", "body_font": "<css font stack>", "base_size_px": 16, "line_height": 1.6},
  "layout": "<single-column|centered|wide|grid>",
  "mood": "<two or three words>"
}"##;

const USER_TEMPLATE: &str = r#"Style: {style_name}
Requested features:
{features}

Content: {content_type}, tone {tone}

Notes from earlier stages:
{feedback}"#;

const BASE_SIZE_RANGE: std::ops::RangeInclusive<u32> = 10..=32;
const LINE_HEIGHT_RANGE: std::ops::RangeInclusive<f64> = 1.0..=2.5;

#[derive(Debug, Default, Deserialize)]
struct PaletteReply {
    primary: Option<String>,
    secondary: Option<String>,
    background: Option<String>,
    text: Option<String>,
    accent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TypographyReply {
    heading_font: Option<String>,
    body_font: Option<String>,
    base_size_px: Option<f64>,
    line_height: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StyleReply {
    #[serde(default)]
    palette: PaletteReply,
    #[serde(default)]
    typography: TypographyReply,
    #[serde(default)]
    layout: String,
    #[serde(default)]
    mood: String,
}

fn color_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(#[0-9a-fA-F]{3}|#[0-9a-fA-F]{6}|#[0-9a-fA-F]{8}|(rgb|rgba|hsl|hsla)\([0-9.,%\s]+\)|[a-zA-Z]{3,20})$",
        )
        .expect("color pattern is valid")
    })
}

/// Returns the value if it is a plain CSS colour, otherwise `fallback`.
pub(crate) fn sanitize_color(value: Option<String>, fallback: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| color_regex().is_match(v))
        .unwrap_or_else(|| fallback.to_string())
}

/// Returns the value if it cannot break out of a declaration, otherwise `fallback`.
pub(crate) fn sanitize_css_value(value: Option<String>, fallback: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v.len() <= 200)
        .filter(|v| !v.chars().any(|c| matches!(c, ';' | '{' | '}' | '<' | '>' | '\n')))
        .unwrap_or_else(|| fallback.to_string())
}

fn sanitize_palette(reply: PaletteReply) -> ColorPalette {
    let defaults = ColorPalette::default();
    ColorPalette {
        primary: sanitize_color(reply.primary, &defaults.primary),
        secondary: sanitize_color(reply.secondary, &defaults.secondary),
        background: sanitize_color(reply.background, &defaults.background),
        text: sanitize_color(reply.text, &defaults.text),
        accent: sanitize_color(reply.accent, &defaults.accent),
    }
}

fn sanitize_typography(reply: TypographyReply) -> Typography {
    let defaults = Typography::default();
    let base_size_px = reply
        .base_size_px
        .filter(|v| v.is_finite())
        .map(|v| (v.round() as u32).clamp(*BASE_SIZE_RANGE.start(), *BASE_SIZE_RANGE.end()))
        .unwrap_or(defaults.base_size_px);
    let line_height = reply
        .line_height
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(*LINE_HEIGHT_RANGE.start(), *LINE_HEIGHT_RANGE.end()))
        .unwrap_or(defaults.line_height);

    Typography {
        heading_font: sanitize_css_value(reply.heading_font, &defaults.heading_font),
        body_font: sanitize_css_value(reply.body_font, &defaults.body_font),
        base_size_px,
        line_height,
    }
}

pub struct StyleAnalyzerAgent {
    llm: Arc<dyn LlmProvider>,
    settings: AgentSettings,
}

impl StyleAnalyzerAgent {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: AgentSettings) -> Self {
        Self { llm, settings }
    }

    fn build_prompt(&self, state: &PipelineState) -> String {
        let features = if state.requirements.style_features.is_empty() {
            "none".to_string()
        } else {
            state
                .requirements
                .style_features
                .iter()
                .map(|f| format!("- {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let (content_type, tone) = state
            .content_analysis
            .as_ref()
            .map(|a| (a.content_type.as_str(), a.tone.as_str()))
            .unwrap_or(("unknown", "unknown"));

        USER_TEMPLATE
            .replace("{style_name}", &state.requirements.style_name)
            .replace("{features}", &features)
            .replace("{content_type}", content_type)
            .replace("{tone}", tone)
            .replace("{feedback}", &feedback_block(state.feedback_for(self.name())))
    }
}

#[async_trait]
impl Stage for StyleAnalyzerAgent {
    fn name(&self) -> StageName {
        StageName::StyleAnalysis
    }

    fn validate_preconditions(&self, state: &PipelineState) -> Result<(), StageError> {
        if state.requirements.style_name.trim().is_empty() {
            return Err(StageError::precondition(
                self.name().as_str(),
                "style name is empty",
            ));
        }
        if state.content_analysis.is_none() {
            return Err(StageError::precondition(
                self.name().as_str(),
                "content analysis is missing",
            ));
        }
        Ok(())
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let reply = complete(
            self.llm.as_ref(),
            &self.settings,
            SYSTEM_PROMPT,
            self.build_prompt(state),
        )
        .await?;
        let parsed: StyleReply = parse_json_reply(&reply)?;

        tracing::debug!(
            style = %state.requirements.style_name,
            layout = %parsed.layout,
            "Style interpreted"
        );

        Ok(StageOutput::StyleAnalysis(StyleProfile {
            style_name: state.requirements.style_name.trim().to_string(),
            features: state.requirements.style_features.clone(),
            palette: sanitize_palette(parsed.palette),
            typography: sanitize_typography(parsed.typography),
            layout: sanitize_css_value(Some(parsed.layout.to_lowercase()), "single-column"),
            mood: sanitize_css_value(Some(parsed.mood), "neutral"),
        }))
    }

    fn validate_output(&self, state: &PipelineState) -> Result<(), StageError> {
        let profile = state.style_profile.as_ref().ok_or_else(|| {
            StageError::postcondition(self.name().as_str(), "no style profile recorded")
        })?;
        if profile.palette.background == profile.palette.text {
            return Err(StageError::postcondition(
                self.name().as_str(),
                "text colour equals background colour",
            ));
        }
        Ok(())
    }

    fn get_feedback(&self, state: &PipelineState) -> Option<String> {
        let profile = state.style_profile.as_ref()?;
        Some(format!(
            "Style '{}' reads as {}; use a {} layout and keep the accent {} for emphasis only.",
            profile.style_name, profile.mood, profile.layout, profile.palette.accent
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::MockLlmProvider;
    use crate::pipeline::artifacts::ContentAnalysis;
    use crate::storage::StyleRequirements;
    use uuid::Uuid;

    fn analyzed_state() -> PipelineState {
        let mut state = PipelineState::new(
            Uuid::new_v4(),
            "# Title\nBody text.",
            StyleRequirements::new("Minimal").with_features(vec!["airy".to_string()]),
        );
        state.content_analysis = Some(ContentAnalysis {
            title: Some("Title".into()),
            content_type: "article".into(),
            tone: "calm".into(),
            headings: vec![],
            paragraph_count: 1,
            list_item_count: 0,
            code_block_count: 0,
            word_count: 3,
            key_points: vec![],
            summary: String::new(),
        });
        state
    }

    #[test]
    fn test_sanitize_color() {
        assert_eq!(sanitize_color(Some("#ABCDEF".into()), "#000"), "#ABCDEF");
        assert_eq!(sanitize_color(Some("rgb(1, 2, 3)".into()), "#000"), "rgb(1, 2, 3)");
        assert_eq!(sanitize_color(Some("navy".into()), "#000"), "navy");
        assert_eq!(sanitize_color(Some("red; background: url(x)".into()), "#000"), "#000");
        assert_eq!(sanitize_color(None, "#000"), "#000");
    }

    #[test]
    fn test_sanitize_typography_clamps() {
        let typography = sanitize_typography(TypographyReply {
            heading_font: Some("Inter}".into()),
            body_font: Some("Inter, sans-serif".into()),
            base_size_px: Some(99.0),
            line_height: Some(0.2),
        });
        assert_eq!(typography.heading_font, Typography::default().heading_font);
        assert_eq!(typography.body_font, "Inter, sans-serif");
        assert_eq!(typography.base_size_px, 32);
        assert_eq!(typography.line_height, 1.0);
    }

    #[tokio::test]
    async fn test_execute_builds_profile_with_defaults() {
        let llm = Arc::new(MockLlmProvider::new(
            r##"{"palette": {"primary": "#222222", "accent": "not a colour!"}, "layout": "Centered", "mood": "quiet"}"##,
        ));
        let agent = StyleAnalyzerAgent::new(llm.clone(), AgentSettings::default());
        let state = analyzed_state();

        let StageOutput::StyleAnalysis(profile) = agent.execute(&state).await.unwrap() else {
            panic!("wrong output variant");
        };
        assert_eq!(profile.style_name, "Minimal");
        assert_eq!(profile.features, vec!["airy"]);
        assert_eq!(profile.palette.primary, "#222222");
        assert_eq!(profile.palette.accent, ColorPalette::default().accent);
        assert_eq!(profile.layout, "centered");
        assert_eq!(profile.typography, Typography::default());

        let prompt = llm.last_user_prompt();
        assert!(prompt.contains("Style: Minimal"));
        assert!(prompt.contains("- airy"));
        assert!(prompt.contains("article"));
    }

    #[test]
    fn test_preconditions_require_content_analysis() {
        let agent = StyleAnalyzerAgent::new(
            Arc::new(MockLlmProvider::new("{}")),
            AgentSettings::default(),
        );
        let mut state = analyzed_state();
        assert!(agent.validate_preconditions(&state).is_ok());
        state.content_analysis = None;
        assert!(matches!(
            agent.validate_preconditions(&state),
            Err(StageError::Precondition { .. })
        ));
    }

    #[test]
    fn test_output_rejects_invisible_text() {
        let agent = StyleAnalyzerAgent::new(
            Arc::new(MockLlmProvider::new("{}")),
            AgentSettings::default(),
        );
        let mut state = analyzed_state();
        let mut palette = ColorPalette::default();
        palette.text = palette.background.clone();
        state.style_profile = Some(StyleProfile {
            style_name: "Minimal".into(),
            features: vec![],
            palette,
            typography: Typography::default(),
            layout: "centered".into(),
            mood: "quiet".into(),
        });
        assert!(agent.validate_output(&state).is_err());
    }
}
