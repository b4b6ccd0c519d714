//! The five LLM-backed pipeline stages.
//!
//! Each agent implements [`Stage`](crate::pipeline::Stage): it combines
//! local heuristics with one LLM call and returns a typed
//! [`StageOutput`](crate::pipeline::StageOutput).

pub mod code_generator;
pub mod content_analyzer;
pub mod design_adapter;
pub mod error;
pub mod quality_assessor;
pub mod style_analyzer;

use std::sync::Arc;

pub use code_generator::CodeGeneratorAgent;
pub use content_analyzer::ContentAnalyzerAgent;
pub use design_adapter::DesignAdapterAgent;
pub use error::StageError;
pub use quality_assessor::QualityAssessorAgent;
pub use style_analyzer::StyleAnalyzerAgent;

use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::pipeline::{PipelineConfig, Stage};

/// Generation parameters shared by all agents.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    /// Empty means the provider's default model.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.3,
            max_tokens: 4096,
        }
    }
}

impl AgentSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Builds the five stages in pipeline order.
pub fn default_stages(llm: Arc<dyn LlmProvider>, config: &PipelineConfig) -> Vec<Arc<dyn Stage>> {
    let settings = AgentSettings::from_config(config);
    vec![
        Arc::new(ContentAnalyzerAgent::new(Arc::clone(&llm), settings.clone())),
        Arc::new(StyleAnalyzerAgent::new(Arc::clone(&llm), settings.clone())),
        Arc::new(DesignAdapterAgent::new(Arc::clone(&llm), settings.clone())),
        Arc::new(CodeGeneratorAgent::new(Arc::clone(&llm), settings.clone())),
        Arc::new(QualityAssessorAgent::new(llm, settings)),
    ]
}

/// Sends a system + user prompt and returns the first non-empty completion.
pub(crate) async fn complete(
    llm: &dyn LlmProvider,
    settings: &AgentSettings,
    system: &str,
    user: String,
) -> Result<String, StageError> {
    let request = GenerationRequest::new(
        settings.model.clone(),
        vec![Message::system(system), Message::user(user)],
    )
    .with_temperature(settings.temperature)
    .with_max_tokens(settings.max_tokens);

    let response = llm.generate(request).await?;

    response
        .first_content()
        .filter(|content| !content.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| StageError::ResponseParse("Empty LLM response".to_string()))
}

/// Renders feedback strings as a prompt section, or "none".
pub(crate) fn feedback_block(feedback: &[String]) -> String {
    if feedback.is_empty() {
        "none".to_string()
    } else {
        feedback
            .iter()
            .map(|line| format!("- {}", line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MockLlmProvider;
    use super::*;
    use crate::pipeline::StageName;

    #[test]
    fn test_default_stages_cover_pipeline_in_order() {
        let llm: Arc<dyn LlmProvider> = Arc::new(MockLlmProvider::new("{}"));
        let names: Vec<StageName> = default_stages(llm, &PipelineConfig::default())
            .iter()
            .map(|stage| stage.name())
            .collect();
        assert_eq!(names, StageName::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_complete_rejects_empty_reply() {
        let llm = MockLlmProvider::new("   ");
        let err = complete(&llm, &AgentSettings::default(), "sys", "user".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::ResponseParse(_)));
    }

    #[tokio::test]
    async fn test_complete_forwards_settings() {
        let llm = MockLlmProvider::new("ok");
        let settings = AgentSettings {
            model: "test/model".to_string(),
            temperature: 0.1,
            max_tokens: 64,
        };
        let reply = complete(&llm, &settings, "sys", "hello".to_string())
            .await
            .unwrap();
        assert_eq!(reply, "ok");

        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests[0].model, "test/model");
        assert_eq!(requests[0].temperature, Some(0.1));
        assert_eq!(requests[0].max_tokens, Some(64));
        assert_eq!(requests[0].messages.len(), 2);
    }

    #[test]
    fn test_feedback_block() {
        assert_eq!(feedback_block(&[]), "none");
        assert_eq!(
            feedback_block(&["a".to_string(), "b".to_string()]),
            "- a\n- b"
        );
    }
}
