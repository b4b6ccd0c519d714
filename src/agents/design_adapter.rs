//! Design adaptation stage.
//!
//! Derives base design tokens and CSS rules from the style profile, then
//! overlays the LLM's refinements. On retries the quality assessor's
//! recommendations arrive as feedback addressed to this stage.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::style_analyzer::sanitize_css_value;
use super::{complete, feedback_block, AgentSettings, StageError};
use crate::llm::LlmProvider;
use crate::pipeline::artifacts::{DesignTokens, StyleProfile, StyleRule};
use crate::pipeline::{PipelineState, Stage, StageName, StageOutput};
use crate::utils::parse_json_reply;

const SYSTEM_PROMPT: &str = r#"You turn a style profile into CSS design tokens and rules for one HTML document.
The document uses the elements: body, main, header, h1-h4, p, ul, ol, li, a, blockquote, pre, code, hr.
Reference tokens as var(--color-NAME), var(--font-NAME), var(--space-NAME), var(--max-width).

Respond with ONLY a JSON object:
{
  "colors": {"<name>": "<css colour>"},
  "spacing": {"<name>": "<css length>"},
  "rules": [{"selector": "<css selector>", "declarations": {"<property>": "<value>"}}]
}
Only include values you want to change or add."#;

const USER_TEMPLATE: &str = r#"Style: {style_name} ({mood}, {layout} layout)
Features: {features}

Current tokens:
{tokens}

Current rules:
{rules}

Feedback to address:
{feedback}"#;

const MAX_RULES: usize = 40;

#[derive(Debug, Deserialize)]
struct RuleReply {
    selector: String,
    #[serde(default)]
    declarations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct DesignReply {
    #[serde(default)]
    colors: BTreeMap<String, String>,
    #[serde(default)]
    spacing: BTreeMap<String, String>,
    #[serde(default)]
    rules: Vec<RuleReply>,
}

fn token_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]{0,31}$").expect("token pattern is valid"))
}

fn property_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-?[a-z][a-z-]{0,40}$").expect("property pattern is valid"))
}

fn is_safe_selector(selector: &str) -> bool {
    !selector.is_empty()
        && selector.len() <= 120
        && !selector
            .chars()
            .any(|c| matches!(c, '{' | '}' | ';' | '<' | '>' | '@' | '\n'))
}

/// Base tokens derived from the profile alone.
pub fn base_tokens(profile: &StyleProfile) -> DesignTokens {
    let palette = &profile.palette;
    let colors = BTreeMap::from([
        ("primary".to_string(), palette.primary.clone()),
        ("secondary".to_string(), palette.secondary.clone()),
        ("background".to_string(), palette.background.clone()),
        ("text".to_string(), palette.text.clone()),
        ("accent".to_string(), palette.accent.clone()),
    ]);
    let fonts = BTreeMap::from([
        ("heading".to_string(), profile.typography.heading_font.clone()),
        ("body".to_string(), profile.typography.body_font.clone()),
    ]);

    let airy = profile
        .features
        .iter()
        .any(|f| matches!(f.to_lowercase().as_str(), "airy" | "spacious" | "whitespace"));
    let unit = if airy { 1.5 } else { 1.0 };
    let spacing = [("xs", 0.25), ("sm", 0.5), ("md", 1.0), ("lg", 2.0), ("xl", 3.0)]
        .into_iter()
        .map(|(name, rem)| (name.to_string(), format!("{}rem", rem * unit)))
        .collect();

    let max_width = match profile.layout.as_str() {
        "wide" => "72rem",
        "grid" => "64rem",
        "centered" => "42rem",
        _ => "46rem",
    };

    DesignTokens {
        colors,
        fonts,
        spacing,
        max_width: max_width.to_string(),
    }
}

/// Base rules; every value goes through the tokens.
pub fn base_rules(profile: &StyleProfile) -> Vec<StyleRule> {
    let typography = &profile.typography;
    vec![
        StyleRule::new("body")
            .with("margin", "0")
            .with("background", "var(--color-background)")
            .with("color", "var(--color-text)")
            .with("font-family", "var(--font-body)")
            .with("font-size", format!("{}px", typography.base_size_px))
            .with("line-height", typography.line_height.to_string()),
        StyleRule::new("main")
            .with("max-width", "var(--max-width)")
            .with("margin", "0 auto")
            .with("padding", "var(--space-lg) var(--space-md)"),
        StyleRule::new("h1, h2, h3, h4")
            .with("font-family", "var(--font-heading)")
            .with("color", "var(--color-primary)")
            .with("line-height", "1.25")
            .with("margin", "var(--space-lg) 0 var(--space-sm)"),
        StyleRule::new("p, ul, ol, blockquote, pre").with("margin", "0 0 var(--space-md)"),
        StyleRule::new("a").with("color", "var(--color-accent)"),
        StyleRule::new("blockquote")
            .with("border-left", "4px solid var(--color-accent)")
            .with("padding-left", "var(--space-md)")
            .with("color", "var(--color-secondary)"),
        StyleRule::new("pre, code")
            .with("font-family", "ui-monospace, monospace")
            .with("font-size", "0.9em"),
        StyleRule::new("pre")
            .with("padding", "var(--space-md)")
            .with("overflow-x", "auto"),
    ]
}

fn merge_tokens(target: &mut BTreeMap<String, String>, overlay: BTreeMap<String, String>) {
    for (name, value) in overlay {
        let name = name.trim().to_lowercase();
        if !token_name_regex().is_match(&name) {
            tracing::debug!(token = %name, "Dropping token with invalid name");
            continue;
        }
        let current = target.get(&name).cloned().unwrap_or_default();
        let value = sanitize_css_value(Some(value), &current);
        if !value.is_empty() {
            target.insert(name, value);
        }
    }
}

fn merge_rules(rules: &mut Vec<StyleRule>, overlay: Vec<RuleReply>) {
    for reply in overlay {
        let selector = reply.selector.trim().to_string();
        if !is_safe_selector(&selector) {
            tracing::debug!(selector = %selector, "Dropping rule with unsafe selector");
            continue;
        }
        let declarations: BTreeMap<String, String> = reply
            .declarations
            .into_iter()
            .filter_map(|(property, value)| {
                let property = property.trim().to_lowercase();
                if !property_regex().is_match(&property) {
                    return None;
                }
                let value = sanitize_css_value(Some(value), "");
                (!value.is_empty()).then_some((property, value))
            })
            .collect();
        if declarations.is_empty() {
            continue;
        }

        match rules.iter().position(|rule| rule.selector == selector) {
            Some(index) => rules[index].declarations.extend(declarations),
            None if rules.len() < MAX_RULES => rules.push(StyleRule {
                selector,
                declarations,
            }),
            None => {}
        }
    }
}

pub struct DesignAdapterAgent {
    llm: Arc<dyn LlmProvider>,
    settings: AgentSettings,
}

impl DesignAdapterAgent {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: AgentSettings) -> Self {
        Self { llm, settings }
    }
}

#[async_trait]
impl Stage for DesignAdapterAgent {
    fn name(&self) -> StageName {
        StageName::DesignAdaptation
    }

    fn validate_preconditions(&self, state: &PipelineState) -> Result<(), StageError> {
        if state.style_profile.is_none() {
            return Err(StageError::precondition(
                self.name().as_str(),
                "style profile is missing",
            ));
        }
        Ok(())
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let profile = state.style_profile.as_ref().ok_or_else(|| {
            StageError::precondition(self.name().as_str(), "style profile is missing")
        })?;

        let mut tokens = base_tokens(profile);
        let mut rules = base_rules(profile);
        let feedback = state.feedback_for(self.name());

        let features = if profile.features.is_empty() {
            "none".to_string()
        } else {
            profile.features.join(", ")
        };
        let prompt = USER_TEMPLATE
            .replace("{style_name}", &profile.style_name)
            .replace("{mood}", &profile.mood)
            .replace("{layout}", &profile.layout)
            .replace("{features}", &features)
            .replace("{tokens}", &tokens.to_css_variables())
            .replace(
                "{rules}",
                &rules
                    .iter()
                    .map(StyleRule::to_css)
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
            .replace("{feedback}", &feedback_block(feedback));

        let reply = complete(self.llm.as_ref(), &self.settings, SYSTEM_PROMPT, prompt).await?;
        let parsed: DesignReply = parse_json_reply(&reply)?;

        merge_tokens(&mut tokens.colors, parsed.colors);
        merge_tokens(&mut tokens.spacing, parsed.spacing);
        merge_rules(&mut rules, parsed.rules);

        tracing::debug!(
            iteration = state.iteration_count,
            feedback = feedback.len(),
            rules = rules.len(),
            "Design adapted"
        );

        Ok(StageOutput::DesignAdaptation { tokens, rules })
    }

    fn validate_output(&self, state: &PipelineState) -> Result<(), StageError> {
        let stage = self.name().as_str();
        let tokens = state
            .design_tokens
            .as_ref()
            .ok_or_else(|| StageError::postcondition(stage, "no design tokens recorded"))?;
        for required in ["background", "text"] {
            if !tokens.colors.contains_key(required) {
                return Err(StageError::postcondition(
                    stage,
                    format!("colour token '{}' is missing", required),
                ));
            }
        }
        if state.style_rules.as_ref().map_or(true, Vec::is_empty) {
            return Err(StageError::postcondition(stage, "no style rules recorded"));
        }
        Ok(())
    }

    fn get_feedback(&self, state: &PipelineState) -> Option<String> {
        let rules = state.style_rules.as_ref()?;
        Some(format!(
            "Stylesheet has {} rules keyed on semantic elements; wrap the content in <main> and use plain headings, lists and paragraphs.",
            rules.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::MockLlmProvider;
    use crate::pipeline::artifacts::{ColorPalette, Typography};
    use crate::storage::StyleRequirements;
    use uuid::Uuid;

    fn profile(layout: &str, features: &[&str]) -> StyleProfile {
        StyleProfile {
            style_name: "Minimal".into(),
            features: features.iter().map(|f| f.to_string()).collect(),
            palette: ColorPalette::default(),
            typography: Typography::default(),
            layout: layout.into(),
            mood: "quiet".into(),
        }
    }

    fn styled_state() -> PipelineState {
        let mut state = PipelineState::new(
            Uuid::new_v4(),
            "# Title\nBody text.",
            StyleRequirements::new("Minimal"),
        );
        state.style_profile = Some(profile("centered", &[]));
        state
    }

    #[test]
    fn test_base_tokens_follow_profile() {
        let tokens = base_tokens(&profile("wide", &["Airy"]));
        assert_eq!(tokens.max_width, "72rem");
        assert_eq!(tokens.spacing["md"], "1.5rem");
        assert_eq!(tokens.colors["accent"], ColorPalette::default().accent);
        assert_eq!(tokens.fonts.len(), 2);

        let tokens = base_tokens(&profile("single-column", &[]));
        assert_eq!(tokens.max_width, "46rem");
        assert_eq!(tokens.spacing["md"], "1rem");
    }

    #[test]
    fn test_merge_rules_sanitizes_and_merges() {
        let mut rules = vec![StyleRule::new("a").with("color", "red")];
        merge_rules(
            &mut rules,
            vec![
                RuleReply {
                    selector: "a".into(),
                    declarations: BTreeMap::from([("text-decoration".into(), "none".into())]),
                },
                RuleReply {
                    selector: "body } script {".into(),
                    declarations: BTreeMap::from([("color".into(), "red".into())]),
                },
                RuleReply {
                    selector: "hr".into(),
                    declarations: BTreeMap::from([
                        ("border".into(), "0; x: y".into()),
                        ("Bad Property".into(), "1".into()),
                    ]),
                },
            ],
        );
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].declarations.len(), 2);
    }

    #[tokio::test]
    async fn test_execute_overlays_reply_and_sends_feedback() {
        let llm = Arc::new(MockLlmProvider::new(
            r##"{"colors": {"accent": "#ff0066", "Bad Name": "#000"},
                "rules": [{"selector": "h1", "declarations": {"letter-spacing": "0.02em"}}]}"##,
        ));
        let agent = DesignAdapterAgent::new(llm.clone(), AgentSettings::default());
        let mut state = styled_state();
        state.add_feedback(StageName::DesignAdaptation, "increase heading contrast".into());

        let StageOutput::DesignAdaptation { tokens, rules } = agent.execute(&state).await.unwrap()
        else {
            panic!("wrong output variant");
        };
        assert_eq!(tokens.colors["accent"], "#ff0066");
        assert!(!tokens.colors.contains_key("bad name"));
        assert_eq!(tokens.max_width, "42rem");
        assert!(rules.iter().any(|r| r.selector == "h1"));
        assert!(llm
            .last_user_prompt()
            .contains("- increase heading contrast"));
    }

    #[test]
    fn test_validate_output_requires_core_tokens() {
        let agent = DesignAdapterAgent::new(
            Arc::new(MockLlmProvider::new("{}")),
            AgentSettings::default(),
        );
        let mut state = styled_state();
        let profile = state.style_profile.clone().unwrap();
        state.design_tokens = Some(base_tokens(&profile));
        state.style_rules = Some(base_rules(&profile));
        assert!(agent.validate_output(&state).is_ok());

        state
            .design_tokens
            .as_mut()
            .unwrap()
            .colors
            .remove("background");
        assert!(agent.validate_output(&state).is_err());
    }
}
