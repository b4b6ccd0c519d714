//! Code generation stage.
//!
//! The LLM renders the content as semantic body markup; the stylesheet is
//! assembled locally from the design tokens and rules so the model can
//! never drop them. The result is wrapped in a complete HTML document.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use super::{complete, feedback_block, AgentSettings, StageError};
use crate::llm::LlmProvider;
use crate::pipeline::artifacts::{DesignTokens, GeneratedMarkup, StyleRule};
use crate::pipeline::{PipelineState, Stage, StageName, StageOutput};
use crate::utils::extract_code_block;

const SYSTEM_PROMPT: &str = r#"You convert markdown documents into semantic HTML body markup.

Rules:
- Render ALL of the content; do not summarize, reorder or drop text.
- Wrap everything in a single <main> element.
- Use only: main, header, section, h1-h4, p, ul, ol, li, a, em, strong, blockquote, pre, code, hr.
- No inline styles, no class attributes, no <script>, no <style>.

Respond with ONLY the markup in a ```html code block."#;

const USER_TEMPLATE: &str = r#"Title: {title}
Stylesheet selectors available: {selectors}

Feedback to address:
{feedback}

Document:
{content}"#;

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("html pattern is valid"))
}

fn body_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?is)<body\b[^>]*>(.*?)</body\s*>")
}

fn unsafe_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?is)<(script|style|iframe)\b[^>]*>.*?</(script|style|iframe)\s*>")
}

fn document_shell_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?is)<!doctype[^>]*>|<head\b.*?</head\s*>|</?(html|body)\b[^>]*>")
}

fn event_handler_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r#"(?i)\son[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#)
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?s)<[^>]*>")
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Visible text of an HTML fragment with whitespace collapsed.
pub(crate) fn strip_tags(html: &str) -> String {
    let without_blocks = unsafe_block_regex().replace_all(html, " ");
    let text = tag_regex().replace_all(&without_blocks, " ");
    let decoded = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reduces model output to body markup without scripts or a document shell.
pub(crate) fn sanitize_body(markup: &str) -> String {
    let inner = body_regex()
        .captures(markup)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(markup);
    let cleaned = unsafe_block_regex().replace_all(inner, "");
    let cleaned = document_shell_regex().replace_all(&cleaned, "");
    let cleaned = event_handler_regex().replace_all(&cleaned, "");
    let body = cleaned.trim();

    if body.to_lowercase().contains("<main") {
        body.to_string()
    } else {
        format!("<main>\n{}\n</main>", body)
    }
}

pub fn build_stylesheet(tokens: &DesignTokens, rules: &[StyleRule]) -> String {
    let mut parts = Vec::with_capacity(rules.len() + 1);
    parts.push(tokens.to_css_variables());
    parts.extend(rules.iter().map(StyleRule::to_css));
    parts.join("\n")
}

pub fn wrap_document(title: &str, stylesheet: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{}</title>\n<style>\n{}\n</style>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape_html(title),
        stylesheet,
        body
    )
}

pub struct CodeGeneratorAgent {
    llm: Arc<dyn LlmProvider>,
    settings: AgentSettings,
}

impl CodeGeneratorAgent {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: AgentSettings) -> Self {
        Self { llm, settings }
    }
}

#[async_trait]
impl Stage for CodeGeneratorAgent {
    fn name(&self) -> StageName {
        StageName::CodeGeneration
    }

    fn validate_preconditions(&self, state: &PipelineState) -> Result<(), StageError> {
        let stage = self.name().as_str();
        if state.design_tokens.is_none() {
            return Err(StageError::precondition(stage, "design tokens are missing"));
        }
        if state.style_rules.is_none() {
            return Err(StageError::precondition(stage, "style rules are missing"));
        }
        Ok(())
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let stage = self.name().as_str();
        let tokens = state
            .design_tokens
            .as_ref()
            .ok_or_else(|| StageError::precondition(stage, "design tokens are missing"))?;
        let rules = state
            .style_rules
            .as_deref()
            .ok_or_else(|| StageError::precondition(stage, "style rules are missing"))?;

        let title = state
            .content_analysis
            .as_ref()
            .and_then(|a| a.title.clone())
            .unwrap_or_else(|| state.requirements.style_name.clone());
        let selectors = rules
            .iter()
            .map(|r| r.selector.as_str())
            .collect::<Vec<_>>()
            .join(" | ");

        let prompt = USER_TEMPLATE
            .replace("{title}", &title)
            .replace("{selectors}", &selectors)
            .replace("{feedback}", &feedback_block(state.feedback_for(self.name())))
            .replace("{content}", &state.content);

        let reply = complete(self.llm.as_ref(), &self.settings, SYSTEM_PROMPT, prompt).await?;
        let markup = extract_code_block(&reply, "html")
            .or_else(|| reply.contains('<').then(|| reply.clone()))
            .ok_or_else(|| StageError::ResponseParse("No HTML found in response".to_string()))?;

        let body = sanitize_body(&markup);
        if strip_tags(&body).is_empty() {
            return Err(StageError::ResponseParse(
                "Generated markup has no visible text".to_string(),
            ));
        }

        let stylesheet = build_stylesheet(tokens, rules);
        let html = wrap_document(&title, &stylesheet, &body);

        Ok(StageOutput::CodeGeneration(GeneratedMarkup { html, stylesheet }))
    }

    fn validate_output(&self, state: &PipelineState) -> Result<(), StageError> {
        let stage = self.name().as_str();
        let markup = state
            .generated_markup
            .as_ref()
            .ok_or_else(|| StageError::postcondition(stage, "no markup recorded"))?;
        let lower = markup.html.to_lowercase();
        if !lower.starts_with("<!doctype html>") || !lower.contains("<body") {
            return Err(StageError::postcondition(stage, "markup is not a complete document"));
        }
        if lower.contains("<script") {
            return Err(StageError::postcondition(stage, "markup contains a script"));
        }
        Ok(())
    }

    fn get_feedback(&self, state: &PipelineState) -> Option<String> {
        let markup = state.generated_markup.as_ref()?;
        Some(format!(
            "Document is {} bytes with a {} byte stylesheet; check that every source heading survived.",
            markup.byte_len(),
            markup.stylesheet.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::design_adapter::{base_rules, base_tokens};
    use crate::agents::test_support::MockLlmProvider;
    use crate::pipeline::artifacts::{ColorPalette, StyleProfile, Typography};
    use crate::storage::StyleRequirements;
    use uuid::Uuid;

    fn designed_state() -> PipelineState {
        let mut state = PipelineState::new(
            Uuid::new_v4(),
            "# Title\nBody text.",
            StyleRequirements::new("Minimal"),
        );
        let profile = StyleProfile {
            style_name: "Minimal".into(),
            features: vec![],
            palette: ColorPalette::default(),
            typography: Typography::default(),
            layout: "centered".into(),
            mood: "quiet".into(),
        };
        state.design_tokens = Some(base_tokens(&profile));
        state.style_rules = Some(base_rules(&profile));
        state
    }

    #[test]
    fn test_sanitize_body_removes_shell_and_scripts() {
        let raw = r#"<html><head><title>x</title></head><body onload="boom()">
<h1 onclick='x()'>Title</h1><script>alert(1)</script><p>Body text.</p></body></html>"#;
        let body = sanitize_body(raw);
        assert!(body.starts_with("<main>"));
        assert!(!body.contains("script"));
        assert!(!body.contains("onclick"));
        assert!(!body.contains("<title>"));
        assert!(body.contains("<h1>Title</h1>"));
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(
            strip_tags("<main>\n<h1>A &amp; B</h1>\n<p>one  two</p><style>p{}</style></main>"),
            "A & B one two"
        );
    }

    #[tokio::test]
    async fn test_execute_wraps_document_with_stylesheet() {
        let llm = Arc::new(MockLlmProvider::new(
            "Here you go:\n```html\n<main><h1>Title</h1><p>Body text.</p></main>\n```",
        ));
        let agent = CodeGeneratorAgent::new(llm.clone(), AgentSettings::default());
        let mut state = designed_state();

        let output = agent.execute(&state).await.unwrap();
        state.apply(output);
        let markup = state.generated_markup.as_ref().unwrap();

        assert!(markup.html.starts_with("<!DOCTYPE html>"));
        assert!(markup.html.contains("<title>Minimal</title>"));
        assert!(markup.html.contains("--color-background"));
        assert!(markup.html.contains("<main><h1>Title</h1><p>Body text.</p></main>"));
        assert!(markup.stylesheet.contains("max-width: var(--max-width)"));
        assert!(agent.validate_output(&state).is_ok());
        assert!(llm.last_user_prompt().contains("# Title\nBody text."));
    }

    #[tokio::test]
    async fn test_execute_rejects_reply_without_markup() {
        let llm = Arc::new(MockLlmProvider::new("Sorry, I cannot do that."));
        let agent = CodeGeneratorAgent::new(llm, AgentSettings::default());
        let err = agent.execute(&designed_state()).await.unwrap_err();
        assert!(matches!(err, StageError::ResponseParse(_)));
    }

    #[test]
    fn test_wrap_document_escapes_title() {
        let html = wrap_document("<Q&A>", "", "<main></main>");
        assert!(html.contains("<title>&lt;Q&amp;A&gt;</title>"));
    }
}
