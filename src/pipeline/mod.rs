//! The style transformation pipeline.
//!
//! # Architecture
//!
//! - **Stage**: one transformation step (see [`crate::agents`] for the five
//!   LLM-backed implementations)
//! - **CollaborativeRunner**: wraps every stage attempt with validation,
//!   persistence, checkpoints and feedback routing
//! - **WorkflowEngine**: runs the stages in order and applies the quality
//!   gate, looping back to design adaptation on retry
//! - **TaskManager**: accepts requests, launches background runs and
//!   answers status queries
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use styleforge::pipeline::{new_active_runs, PipelineConfig, TaskManager, TransformRequest, WorkflowEngine};
//! use styleforge::storage::TaskStore;
//!
//! let config = PipelineConfig::from_env()?;
//! let store = TaskStore::connect(&config.database_url).await?;
//! let engine = WorkflowEngine::with_default_stages(store.clone(), llm, &config)?;
//! let manager = TaskManager::new(store, Arc::new(engine), new_active_runs());
//!
//! let created = manager
//!     .create_task(TransformRequest::new("# Title\nBody text.", "Minimal"))
//!     .await?;
//! let status = manager.wait_for(created.task_id).await?;
//! println!("{}: {}", status.task_id, status.status);
//! ```

pub mod artifacts;
pub mod collaboration;
pub mod config;
pub mod engine;
pub mod manager;
pub mod stage;
pub mod state;

pub use artifacts::{
    ColorPalette, ContentAnalysis, DesignTokens, GeneratedMarkup, Heading, QualityFinding,
    QualityReport, Severity, StyleProfile, StyleRule, Typography,
};
pub use collaboration::{CollaborativeRunner, StageOutcome};
pub use config::{ConfigError, Decision, PipelineConfig, QualityPolicy};
pub use engine::{EngineError, Progress, RunOutcome, WorkflowEngine};
pub use manager::{
    new_active_runs, ActiveRun, ActiveRuns, DatabaseHealth, ExecutionSteps, HealthReport,
    HealthStatus, ManagerError, TaskCreated, TaskManager, TaskStatusReport, TransformRequest,
    MAX_CONTENT_BYTES,
};
pub use stage::{Stage, StageName};
pub use state::{
    CollaborationEntry, ExecutionLogEntry, PipelineIssue, PipelineState, QualityCheckpoint,
    StageOutput,
};
