//! Integration tests against a real LLM provider.
//!
//! These tests make real API calls to OpenRouter.
//! Run with: OPENROUTER_API_KEY=your_key cargo test --test llm_integration -- --ignored

use std::sync::Arc;

use styleforge::llm::{
    GenerationRequest, LlmProvider, Message, OpenRouterProvider, RetryPolicy, RetryingProvider,
};
use styleforge::pipeline::{
    new_active_runs, PipelineConfig, TaskManager, TransformRequest, WorkflowEngine,
};
use styleforge::storage::{TaskStatus, TaskStore};

fn get_test_api_key() -> String {
    std::env::var("OPENROUTER_API_KEY")
        .expect("OPENROUTER_API_KEY environment variable must be set for integration tests")
}

fn create_test_client() -> Arc<dyn LlmProvider> {
    let provider = OpenRouterProvider::new(get_test_api_key()).expect("provider should build");
    Arc::new(RetryingProvider::new(
        Arc::new(provider),
        RetryPolicy::default(),
    ))
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_generation() {
    let client = create_test_client();

    let request = GenerationRequest::new(
        "",
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = client.generate(request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());

    let response = response.expect("Should have response");
    let content = response.first_content().expect("Should have content");
    assert!(
        content.contains('4'),
        "Response should contain '4', got: {}",
        content
    );
    assert!(response.usage.total_tokens > 0, "Should have token usage");
}

#[tokio::test]
#[ignore]
async fn test_full_pipeline_produces_document() {
    let store = TaskStore::in_memory().await.expect("store");
    store.run_migrations().await.expect("migrations");

    let config = PipelineConfig::default();
    let engine = WorkflowEngine::with_default_stages(store.clone(), create_test_client(), &config)
        .expect("engine");
    let manager = TaskManager::new(store, Arc::new(engine), new_active_runs());

    let created = manager
        .create_task(
            TransformRequest::new(
                "# Release notes\n\nVersion 2 ships a faster importer.\n\n- CSV support\n- Progress bars",
                "Minimal",
            )
            .with_features(["airy"]),
        )
        .await
        .expect("create");

    let task = manager.wait_for(created.task_id).await.expect("wait");
    assert!(task.status.is_terminal());
    if task.status == TaskStatus::Completed {
        let html = task.output.expect("completed task has output");
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("Release notes"));
        assert!(task.quality_score.expect("score") >= config.quality.acceptable_threshold);
    } else {
        assert!(task.error_message.is_some());
    }

    let steps = manager
        .get_execution_steps(created.task_id)
        .await
        .expect("steps");
    assert!(steps.steps.len() >= 5);
}
