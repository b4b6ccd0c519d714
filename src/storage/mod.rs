//! SQLite persistent storage for pipeline runs.
//!
//! The storage system consists of:
//! - **TaskStore**: one row per task and one row per stage attempt
//! - **Migrations**: schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use styleforge::storage::{StyleRequirements, TaskStore, TaskUpdate, TaskStatus};
//!
//! let store = TaskStore::connect("sqlite://styleforge.db").await?;
//! store.run_migrations().await?;
//!
//! let id = store.create_task("# Title", &StyleRequirements::new("Minimal")).await?;
//! store
//!     .update_task(id, &TaskUpdate::new().with_status(TaskStatus::Completed))
//!     .await?;
//! ```

pub mod database;
pub mod migrations;
pub mod models;
pub mod schema;

pub use database::{DatabaseError, TaskStore};
pub use migrations::{MigrationError, MigrationRunner};
pub use models::{
    ExecutionStatus, PipelineTask, StageExecutionRecord, StageExecutionUpdate, StyleRequirements,
    TaskFilter, TaskStatus, TaskUpdate,
};
