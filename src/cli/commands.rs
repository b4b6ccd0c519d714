//! CLI command definitions for styleforge.
//!
//! Every command opens the task database, so `status` and `steps` can
//! inspect runs started by earlier invocations.

use crate::llm::{LiteLlmClient, LlmProvider, OpenRouterProvider, RetryingProvider};
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{
    new_active_runs, PipelineConfig, TaskManager, TransformRequest, WorkflowEngine,
};
use crate::storage::{TaskFilter, TaskStatus, TaskStore};
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Default number of rows listed by `tasks`.
const DEFAULT_TASK_LIMIT: i64 = 20;

/// Restyles markdown content into a complete HTML document.
#[derive(Parser)]
#[command(name = "styleforge")]
#[command(about = "Restyle documents into themed HTML with a multi-stage LLM pipeline")]
#[command(version)]
#[command(
    long_about = "styleforge runs content through five stages (content analysis, style analysis, design adaptation, code generation, quality assessment) and retries design and generation until the quality gate passes.\n\nExample usage:\n  styleforge run --file notes.md --style Minimal --feature airy --output notes.html"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite database URL.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create a task and wait for it to finish.
    Run(RunArgs),

    /// Show the status of a task.
    Status(TaskArgs),

    /// Show every recorded stage attempt of a task.
    Steps(TaskArgs),

    /// List recent tasks.
    Tasks(TasksArgs),

    /// Check database connectivity.
    Health(OutputArgs),

    /// Print the Prometheus metrics registry.
    Metrics,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Read content from this file.
    #[arg(short = 'f', long, conflicts_with = "content")]
    pub file: Option<PathBuf>,

    /// Inline content.
    #[arg(short = 'c', long)]
    pub content: Option<String>,

    /// Name of the target style.
    #[arg(short = 's', long)]
    pub style: String,

    /// Extra style feature; repeat for several.
    #[arg(long = "feature")]
    pub features: Vec<String>,

    /// Write the generated HTML here.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// LLM model to use.
    #[arg(short = 'm', long, env = "STYLEFORGE_MODEL")]
    pub model: Option<String>,

    /// OpenRouter API key; LiteLLM settings from the environment are used
    /// when absent.
    #[arg(long, env = "OPENROUTER_API_KEY")]
    pub api_key: Option<String>,

    /// Also print the execution steps.
    #[arg(long)]
    pub steps: bool,

    /// Print metrics collected during the run.
    #[arg(long)]
    pub metrics: bool,

    /// Output as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct TaskArgs {
    /// Task id.
    pub task_id: Uuid,

    /// Output as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct TasksArgs {
    /// Only tasks with this status (running, completed, failed).
    #[arg(long)]
    pub status: Option<TaskStatus>,

    /// Maximum number of tasks.
    #[arg(short = 'n', long, default_value_t = DEFAULT_TASK_LIMIT)]
    pub limit: i64,

    /// Output as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    /// Output as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(err) = init_metrics() {
        warn!(error = %err, "Metrics registry unavailable");
    }

    let mut config = PipelineConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = cli.database_url {
        config = config.with_database_url(url);
    }

    match cli.command {
        Commands::Run(args) => run_transform_command(config, args).await,
        Commands::Status(args) => run_status_command(&config, args).await,
        Commands::Steps(args) => run_steps_command(&config, args).await,
        Commands::Tasks(args) => run_tasks_command(&config, args).await,
        Commands::Health(args) => run_health_command(&config, args).await,
        Commands::Metrics => {
            print!("{}", export_metrics());
            Ok(())
        }
    }
}

async fn open_store(config: &PipelineConfig) -> anyhow::Result<TaskStore> {
    let store = TaskStore::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    store
        .run_migrations()
        .await
        .context("Failed to run database migrations")?;
    Ok(store)
}

fn build_llm_client(
    api_key: Option<String>,
    config: &PipelineConfig,
) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let resolved_api_key = api_key.or_else(|| std::env::var("LITELLM_API_KEY").ok());

    let inner: Arc<dyn LlmProvider> = if let Some(key) = resolved_api_key {
        if config.model.is_empty() {
            info!("Using OpenRouter with its default model");
            Arc::new(OpenRouterProvider::new(key)?)
        } else {
            info!(model = %config.model, "Using OpenRouter");
            Arc::new(OpenRouterProvider::with_model(key, config.model.clone())?)
        }
    } else {
        info!("Using LiteLLM client from environment");
        Arc::new(LiteLlmClient::from_env().map_err(|e| {
            anyhow::anyhow!(
                "Failed to initialize LLM client: {}. Please provide --api-key or set OPENROUTER_API_KEY/LITELLM_API_KEY env var.",
                e
            )
        })?)
    };

    Ok(Arc::new(RetryingProvider::new(inner, config.retry_policy())))
}

fn read_content(args: &RunArgs) -> anyhow::Result<String> {
    match (&args.file, &args.content) {
        (Some(path), _) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        (None, Some(content)) => Ok(content.clone()),
        (None, None) => anyhow::bail!("Provide --file or --content"),
    }
}

#[derive(Debug, Serialize)]
struct RunOutput {
    task_id: Uuid,
    status: TaskStatus,
    quality_score: Option<f64>,
    processing_time: Option<f64>,
    error: Option<String>,
    output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<Vec<StepRow>>,
}

#[derive(Debug, Serialize)]
struct StepRow {
    stage: String,
    iteration: u32,
    status: TaskStatus,
    execution_time: Option<f64>,
    detail: Option<String>,
}

async fn run_transform_command(config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    let mut config = config;
    if let Some(model) = args.model.clone() {
        config = config.with_model(model);
    }
    config.validate()?;

    let content = read_content(&args)?;
    let request = TransformRequest::new(content, args.style.clone()).with_features(args.features.clone());
    request.validate()?;

    let store = open_store(&config).await?;
    let llm = build_llm_client(args.api_key.clone(), &config)?;
    let engine = WorkflowEngine::with_default_stages(store.clone(), llm, &config)?;
    let manager = TaskManager::new(store, Arc::new(engine), new_active_runs())
        .with_estimated_time(config.estimated_time);

    let created = manager.create_task(request).await?;
    if !args.json {
        println!(
            "Task {} started (estimated {:.0}s)",
            created.task_id, created.estimated_time
        );
    }

    let task = manager.wait_for(created.task_id).await?;

    let output_path = match (&args.output, &task.output) {
        (Some(path), Some(html)) => {
            fs::write(path, html).with_context(|| format!("Failed to write {}", path.display()))?;
            Some(path.clone())
        }
        _ => None,
    };

    let steps = if args.steps {
        let steps = manager.get_execution_steps(task.id).await?;
        Some(steps.steps.into_iter().map(step_row).collect::<Vec<_>>())
    } else {
        None
    };

    let output = RunOutput {
        task_id: task.id,
        status: task.status,
        quality_score: task.quality_score,
        processing_time: task.processing_time,
        error: task.error_message.clone(),
        output_path,
        steps,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_run_output(&output, task.output.as_deref(), args.output.is_some());
    }

    if args.metrics {
        print!("{}", export_metrics());
    }

    if task.status == TaskStatus::Failed {
        anyhow::bail!("Task {} failed", task.id);
    }
    Ok(())
}

fn step_row(record: crate::storage::StageExecutionRecord) -> StepRow {
    StepRow {
        detail: record.error_message.or(record.output_summary),
        stage: record.stage_name,
        iteration: record.iteration,
        status: record.status,
        execution_time: record.execution_time,
    }
}

fn print_run_output(output: &RunOutput, html: Option<&str>, wrote_file: bool) {
    match output.status {
        TaskStatus::Completed => println!("✓ Task {} completed", output.task_id),
        _ => println!("✗ Task {} {}", output.task_id, output.status),
    }
    if let Some(score) = output.quality_score {
        println!("  Quality score:   {:.3}", score);
    }
    if let Some(secs) = output.processing_time {
        println!("  Processing time: {:.1}s", secs);
    }
    if let Some(err) = &output.error {
        println!("  Error: {}", err);
    }
    if let Some(path) = &output.output_path {
        println!("  Output: {}", path.display());
    }
    if let Some(steps) = &output.steps {
        print_steps(steps);
    }
    if !wrote_file {
        if let Some(html) = html {
            println!();
            println!("{}", html);
        }
    }
}

fn print_steps(steps: &[StepRow]) {
    println!();
    println!("  {:<20} {:>4}  {:<10} {:>8}", "STAGE", "ITER", "STATUS", "TIME");
    for step in steps {
        let time = step
            .execution_time
            .map(|t| format!("{:.2}s", t))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} {:>4}  {:<10} {:>8}",
            step.stage,
            step.iteration,
            step.status.as_str(),
            time
        );
        if let Some(detail) = &step.detail {
            println!("      {}", detail);
        }
    }
}

fn manager_for_queries(store: TaskStore, config: &PipelineConfig) -> anyhow::Result<TaskManager> {
    // Queries never run stages; the engine only needs to exist.
    let llm: Arc<dyn LlmProvider> = Arc::new(QueryOnlyProvider);
    let engine = WorkflowEngine::with_default_stages(store.clone(), llm, config)?;
    Ok(TaskManager::new(store, Arc::new(engine), new_active_runs()))
}

/// Provider for query-only commands; never asked to generate.
struct QueryOnlyProvider;

#[async_trait::async_trait]
impl LlmProvider for QueryOnlyProvider {
    async fn generate(
        &self,
        _request: crate::llm::GenerationRequest,
    ) -> Result<crate::llm::GenerationResponse, crate::error::LlmError> {
        Err(crate::error::LlmError::MissingApiKey)
    }
}

async fn run_status_command(config: &PipelineConfig, args: TaskArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let manager = manager_for_queries(store, config)?;
    let report = manager.get_status(args.task_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Task {}", report.task_id);
        println!("  Status:   {}", report.status);
        println!("  Progress: {:.0}%", report.progress * 100.0);
        if let Some(err) = &report.error {
            println!("  Error:    {}", err);
        }
        if let Some(result) = &report.result {
            println!("  Result:   {} bytes of HTML", result.len());
        }
    }
    Ok(())
}

async fn run_steps_command(config: &PipelineConfig, args: TaskArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let manager = manager_for_queries(store, config)?;
    let steps = manager.get_execution_steps(args.task_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    println!("Task {}", steps.task_id);
    if let Some(current) = &steps.current_step {
        println!("  Current step:  {}", current);
    }
    if let Some(score) = steps.quality_score {
        println!("  Quality score: {:.3}", score);
    }
    if let Some(summary) = &steps.summary {
        println!("  Summary:       {}", summary);
    }
    let rows: Vec<StepRow> = steps.steps.into_iter().map(step_row).collect();
    print_steps(&rows);
    Ok(())
}

async fn run_tasks_command(config: &PipelineConfig, args: TasksArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let mut filter = TaskFilter::new().with_limit(args.limit);
    if let Some(status) = args.status {
        filter = filter.with_status(status);
    }
    let tasks = store.list_tasks(&filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }
    println!(
        "{:<36}  {:<10} {:<20} {:>6}  CREATED",
        "ID", "STATUS", "STYLE", "SCORE"
    );
    for task in tasks {
        let score = task
            .quality_score
            .map(|s| format!("{:.3}", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<10} {:<20} {:>6}  {}",
            task.id,
            task.status.as_str(),
            task.requirements.style_name,
            score,
            task.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn run_health_command(config: &PipelineConfig, args: OutputArgs) -> anyhow::Result<()> {
    let report = match open_store(config).await {
        Ok(store) => manager_for_queries(store, config)?.health().await,
        Err(err) => {
            warn!(error = %err, "Database unavailable");
            crate::pipeline::HealthReport {
                status: crate::pipeline::HealthStatus::Degraded,
                database: crate::pipeline::DatabaseHealth::Disconnected,
                active_tasks: 0,
            }
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "status={:?} database={:?} active_tasks={}",
            report.status, report.database, report.active_tasks
        );
    }
    Ok(())
}
