//! SQLite task store.
//!
//! Durable record of every pipeline run (`tasks`) and every stage attempt
//! within it (`stage_executions`). Each public call is one statement, so
//! callers must not assume atomicity across calls.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use super::migrations::MigrationRunner;
use super::models::{
    PipelineTask, StageExecutionRecord, StageExecutionUpdate, StyleRequirements, TaskFilter,
    TaskStatus, TaskUpdate,
};

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    /// The row already reached a terminal status and cannot change.
    #[error("Record is finalized: {0}")]
    Finalized(String),

    /// A field value violates a stored invariant.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A stored value could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Encodes a timestamp as fixed-width RFC 3339 text.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn decode_uuid(raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|e| DatabaseError::Corrupt(format!("uuid '{}': {}", raw, e)))
}

fn decode_status(raw: &str) -> Result<TaskStatus, DatabaseError> {
    raw.parse::<TaskStatus>().map_err(DatabaseError::Corrupt)
}

fn check_unit_interval(field: &str, value: Option<f64>) -> Result<(), DatabaseError> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) || v.is_nan() => Err(DatabaseError::InvalidValue(
            format!("{} must lie in [0, 1], got {}", field, v),
        )),
        _ => Ok(()),
    }
}

fn check_non_negative(field: &str, value: Option<f64>) -> Result<(), DatabaseError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(DatabaseError::InvalidValue(format!(
            "{} must be a non-negative number, got {}",
            field, v
        ))),
        _ => Ok(()),
    }
}

/// SQLite-backed task store shared by all pipeline runs.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Connects using a `sqlite:` URL, e.g. `sqlite://styleforge.db` or
    /// `sqlite::memory:`. The database file is created if missing.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
        let in_memory = database_url.contains(":memory:");
        Self::connect_with(options, in_memory).await
    }

    /// Opens (or creates) a database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::connect_with(options, false).await
    }

    /// Opens a private in-memory database.
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        in_memory: bool,
    ) -> Result<Self, DatabaseError> {
        let options = options
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // An in-memory database lives exactly as long as its one connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let options = if in_memory {
            options
        } else {
            options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    /// Round-trips a trivial query to confirm the database is reachable.
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Inserts a new `running` task and returns its freshly allocated id.
    pub async fn create_task(
        &self,
        input: &str,
        requirements: &StyleRequirements,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let requirements_json = serde_json::to_string(requirements)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, created_at, status, input, requirements)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(id.to_string())
        .bind(encode_ts(Utc::now()))
        .bind(TaskStatus::Running.as_str())
        .bind(input)
        .bind(requirements_json)
        .execute(&self.pool)
        .await?;

        tracing::debug!(task_id = %id, "Task created");
        Ok(id)
    }

    /// Applies the allow-listed fields of `update` to a running task.
    ///
    /// Fields left as `None` keep their stored value. A task that already
    /// reached a terminal status rejects every update with
    /// [`DatabaseError::Finalized`].
    pub async fn update_task(&self, id: Uuid, update: &TaskUpdate) -> Result<(), DatabaseError> {
        check_unit_interval("quality_score", update.quality_score)?;
        check_non_negative("processing_time", update.processing_time)?;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = COALESCE(?1, status),
                output = COALESCE(?2, output),
                quality_score = COALESCE(?3, quality_score),
                processing_time = COALESCE(?4, processing_time),
                error_message = COALESCE(?5, error_message)
            WHERE id = ?6 AND status = 'running'
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.output.as_deref())
        .bind(update.quality_score)
        .bind(update.processing_time)
        .bind(update.error_message.as_deref())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_task(id).await? {
                Some(task) => Err(DatabaseError::Finalized(format!(
                    "task {} is {}",
                    id, task.status
                ))),
                None => Err(DatabaseError::NotFound(format!("task {}", id))),
            };
        }

        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<PipelineTask>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, created_at, status, input, requirements, output,
                   quality_score, processing_time, error_message
            FROM tasks WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| task_from_row(&row)).transpose()
    }

    /// Lists tasks, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<PipelineTask>, DatabaseError> {
        let mut query = String::from(
            r#"
            SELECT id, created_at, status, input, requirements, output,
                   quality_score, processing_time, error_message
            FROM tasks
            "#,
        );
        if filter.status.is_some() {
            query.push_str(" WHERE status = ?1");
        }
        query.push_str(" ORDER BY created_at DESC, rowid DESC");
        if filter.limit.is_some() {
            let idx = if filter.status.is_some() { 2 } else { 1 };
            query.push_str(&format!(" LIMIT ?{}", idx));
        }

        let mut q = sqlx::query(&query);
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }
        if let Some(limit) = filter.limit {
            q = q.bind(limit);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    // =========================================================================
    // Stage Execution Operations
    // =========================================================================

    /// Appends a `running` record for one stage attempt.
    pub async fn log_stage_execution(
        &self,
        task_id: Uuid,
        stage_name: &str,
        iteration: u32,
        input_summary: &str,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO stage_executions (
                id, task_id, stage_name, iteration, started_at, status, input_data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(id.to_string())
        .bind(task_id.to_string())
        .bind(stage_name)
        .bind(i64::from(iteration))
        .bind(encode_ts(Utc::now()))
        .bind(TaskStatus::Running.as_str())
        .bind(input_summary)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Patches a running stage record.
    ///
    /// `completed_at` is stamped when the new status is terminal and the
    /// column is still unset. It never precedes `started_at`.
    pub async fn update_stage_execution(
        &self,
        id: Uuid,
        update: &StageExecutionUpdate,
    ) -> Result<(), DatabaseError> {
        check_non_negative("execution_time", update.execution_time)?;

        let result = sqlx::query(
            r#"
            UPDATE stage_executions SET
                status = COALESCE(?1, status),
                output_data = COALESCE(?2, output_data),
                error_message = COALESCE(?3, error_message),
                execution_time = COALESCE(?4, execution_time),
                completed_at = CASE
                    WHEN ?1 IN ('completed', 'failed')
                        THEN COALESCE(completed_at, MAX(started_at, ?5))
                    ELSE completed_at
                END
            WHERE id = ?6 AND status = 'running'
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.output_summary.as_deref())
        .bind(update.error_message.as_deref())
        .bind(update.execution_time)
        .bind(encode_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT status FROM stage_executions WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            return match exists {
                Some(row) => Err(DatabaseError::Finalized(format!(
                    "stage execution {} is {}",
                    id,
                    row.get::<String, _>("status")
                ))),
                None => Err(DatabaseError::NotFound(format!("stage execution {}", id))),
            };
        }

        Ok(())
    }

    /// Returns every attempt recorded for `task_id`, in start order.
    pub async fn list_stage_executions(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<StageExecutionRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, stage_name, iteration, started_at, completed_at, status,
                   input_data, output_data, error_message, execution_time
            FROM stage_executions
            WHERE task_id = ?1
            ORDER BY started_at ASC, rowid ASC
            "#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(execution_from_row).collect()
    }
}

fn task_from_row(row: &SqliteRow) -> Result<PipelineTask, DatabaseError> {
    let requirements: String = row.try_get("requirements")?;

    Ok(PipelineTask {
        id: decode_uuid(&row.try_get::<String, _>("id")?)?,
        created_at: decode_ts(&row.try_get::<String, _>("created_at")?)?,
        status: decode_status(&row.try_get::<String, _>("status")?)?,
        input: row.try_get("input")?,
        requirements: serde_json::from_str(&requirements)?,
        output: row.try_get("output")?,
        quality_score: row.try_get("quality_score")?,
        processing_time: row.try_get("processing_time")?,
        error_message: row.try_get("error_message")?,
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<StageExecutionRecord, DatabaseError> {
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let iteration: i64 = row.try_get("iteration")?;

    Ok(StageExecutionRecord {
        id: decode_uuid(&row.try_get::<String, _>("id")?)?,
        task_id: decode_uuid(&row.try_get::<String, _>("task_id")?)?,
        stage_name: row.try_get("stage_name")?,
        iteration: u32::try_from(iteration)
            .map_err(|_| DatabaseError::Corrupt(format!("iteration {}", iteration)))?,
        started_at: decode_ts(&row.try_get::<String, _>("started_at")?)?,
        completed_at: completed_at.as_deref().map(decode_ts).transpose()?,
        status: decode_status(&row.try_get::<String, _>("status")?)?,
        input_summary: row.try_get("input_data")?,
        output_summary: row.try_get("output_data")?,
        error_message: row.try_get("error_message")?,
        execution_time: row.try_get("execution_time")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TaskStore {
        let store = TaskStore::in_memory().await.expect("in-memory store");
        store.run_migrations().await.expect("migrations");
        store
    }

    #[test]
    fn test_timestamp_encoding_is_sortable() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::microseconds(1);
        assert!(encode_ts(early) < encode_ts(late));
        assert_eq!(decode_ts(&encode_ts(late)).unwrap(), late);
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let store = store().await;
        let req = StyleRequirements::new("Minimal").with_features(["clean"]);
        let id = store.create_task("# Title", &req).await.unwrap();

        let task = store.get_task(id).await.unwrap().expect("task exists");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.input, "# Title");
        assert_eq!(task.requirements, req);
        assert!(task.output.is_none());
        assert!(task.quality_score.is_none());
    }

    #[tokio::test]
    async fn test_get_unknown_task_is_none() {
        let store = store().await;
        assert!(store.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_task_rejects_updates() {
        let store = store().await;
        let id = store
            .create_task("body", &StyleRequirements::new("Minimal"))
            .await
            .unwrap();

        let finish = TaskUpdate::new()
            .with_status(TaskStatus::Completed)
            .with_quality_score(0.85)
            .with_output("<html></html>");
        store.update_task(id, &finish).await.unwrap();

        let reopen = TaskUpdate::new().with_status(TaskStatus::Running);
        let err = store.update_task(id, &reopen).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Finalized(_)));

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.quality_score, Some(0.85));
    }

    #[tokio::test]
    async fn test_update_rejects_out_of_range_score() {
        let store = store().await;
        let id = store
            .create_task("body", &StyleRequirements::new("Minimal"))
            .await
            .unwrap();
        let err = store
            .update_task(id, &TaskUpdate::new().with_quality_score(1.5))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidValue(_)));
    }

    #[tokio::test]
    async fn test_update_unknown_task_is_not_found() {
        let store = store().await;
        let err = store
            .update_task(Uuid::new_v4(), &TaskUpdate::new().with_error("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stage_execution_completion_stamped_once() {
        let store = store().await;
        let task_id = store
            .create_task("body", &StyleRequirements::new("Minimal"))
            .await
            .unwrap();
        let exec_id = store
            .log_stage_execution(task_id, "content_analysis", 0, "19 chars")
            .await
            .unwrap();

        let running = store.list_stage_executions(task_id).await.unwrap();
        assert_eq!(running.len(), 1);
        assert!(running[0].completed_at.is_none());
        assert_eq!(running[0].status, TaskStatus::Running);

        store
            .update_stage_execution(exec_id, &StageExecutionUpdate::completed("ok", 0.25))
            .await
            .unwrap();
        let err = store
            .update_stage_execution(exec_id, &StageExecutionUpdate::failed("late", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Finalized(_)));

        let records = store.list_stage_executions(task_id).await.unwrap();
        let record = &records[0];
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.output_summary.as_deref(), Some("ok"));
        assert_eq!(record.input_summary.as_deref(), Some("19 chars"));
        assert_eq!(record.execution_time, Some(0.25));
        let completed_at = record.completed_at.expect("completion stamped");
        assert!(completed_at >= record.started_at);
    }

    #[tokio::test]
    async fn test_list_stage_executions_in_start_order() {
        let store = store().await;
        let task_id = store
            .create_task("body", &StyleRequirements::new("Minimal"))
            .await
            .unwrap();
        for (iteration, stage) in [(0, "design_adaptation"), (0, "code_generation"), (1, "design_adaptation")] {
            store
                .log_stage_execution(task_id, stage, iteration, "")
                .await
                .unwrap();
        }

        let records = store.list_stage_executions(task_id).await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.stage_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["design_adaptation", "code_generation", "design_adaptation"]
        );
        assert!(records.windows(2).all(|w| w[0].started_at <= w[1].started_at));
        assert!(records.windows(2).all(|w| w[0].iteration <= w[1].iteration));
    }

    #[tokio::test]
    async fn test_list_tasks_with_filter() {
        let store = store().await;
        let req = StyleRequirements::new("Minimal");
        let a = store.create_task("a", &req).await.unwrap();
        let _b = store.create_task("b", &req).await.unwrap();
        store
            .update_task(a, &TaskUpdate::new().with_status(TaskStatus::Failed).with_error("x"))
            .await
            .unwrap();

        let all = store.list_tasks(&TaskFilter::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let failed = store
            .list_tasks(&TaskFilter::new().with_status(TaskStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a);

        let limited = store
            .list_tasks(&TaskFilter::new().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_ping() {
        let store = store().await;
        store.ping().await.unwrap();
    }

    #[test]
    fn test_database_error_display() {
        let err = DatabaseError::NotFound("task 42".to_string());
        assert!(err.to_string().contains("task 42"));
    }
}
