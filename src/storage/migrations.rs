//! Schema bootstrap.
//!
//! Each entry of [`schema::MIGRATIONS`](super::schema::MIGRATIONS) is applied
//! once, inside its own transaction, and remembered in `schema_migrations`
//! under its declared name. Position in the list plays no part in identity.

use std::collections::HashSet;

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use super::schema;

const LEDGER_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL
)
"#;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration ledger error: {0}")]
    Database(#[from] sqlx::Error),

    /// A schema statement was rejected; carries the migration name.
    #[error("Migration {name} failed: {reason}")]
    Statement { name: String, reason: String },
}

pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Applies whatever the ledger does not list yet. Safe to call on every start.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        let applied: HashSet<String> = self.list_applied_migrations().await?.into_iter().collect();

        self.apply_pending(schema::MIGRATIONS, &applied).await
    }

    async fn apply_pending(
        &self,
        migrations: &[schema::Migration],
        applied: &HashSet<String>,
    ) -> Result<(), MigrationError> {
        let mut count = 0usize;
        for migration in migrations.iter().filter(|m| !applied.contains(m.name)) {
            self.apply(migration.name, migration.sql).await?;
            count += 1;
        }
        if count > 0 {
            tracing::info!(applied = count, "Schema migrations applied");
        }
        Ok(())
    }

    async fn apply(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        if let Err(e) = sqlx::query(sql).execute(&mut *tx).await {
            return Err(MigrationError::Statement {
                name: name.to_string(),
                reason: e.to_string(),
            });
        }
        sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)")
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(migration = name, "Applied migration");
        Ok(())
    }

    /// Applied migration names in the order they ran.
    pub async fn list_applied_migrations(&self) -> Result<Vec<String>, MigrationError> {
        sqlx::query(LEDGER_DDL).execute(&self.pool).await?;

        let names = sqlx::query("SELECT name FROM schema_migrations ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite")
    }

    #[tokio::test]
    async fn test_second_run_applies_nothing() {
        let runner = MigrationRunner::new(memory_pool().await);

        runner.run_migrations().await.expect("first run");
        let first = runner.list_applied_migrations().await.expect("list");
        runner.run_migrations().await.expect("second run");
        let second = runner.list_applied_migrations().await.expect("list");

        assert_eq!(first, second);
        assert_eq!(first.len(), schema::MIGRATIONS.len());
        assert_eq!(first[0], "create_tasks");
    }

    #[tokio::test]
    async fn test_inserted_migration_leaves_existing_ones_alone() {
        let runner = MigrationRunner::new(memory_pool().await);
        runner.run_migrations().await.expect("first run");

        // A new statement lands in the middle of the list; only it is applied.
        let mut extended = schema::MIGRATIONS.to_vec();
        extended.insert(
            1,
            schema::Migration {
                name: "create_style_presets",
                sql: "CREATE TABLE style_presets (name TEXT PRIMARY KEY)",
            },
        );
        let applied: HashSet<String> = runner
            .list_applied_migrations()
            .await
            .expect("list")
            .into_iter()
            .collect();
        runner
            .apply_pending(&extended, &applied)
            .await
            .expect("extended run");

        let names = runner.list_applied_migrations().await.expect("list");
        assert_eq!(names.len(), schema::MIGRATIONS.len() + 1);
        assert_eq!(names.last().map(String::as_str), Some("create_style_presets"));
        assert_eq!(&names[..2], ["create_tasks", "create_stage_executions"]);
    }

    #[test]
    fn test_statement_error_names_the_migration() {
        let err = MigrationError::Statement {
            name: "index_tasks_status".to_string(),
            reason: "near \"TABEL\": syntax error".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("index_tasks_status"));
        assert!(text.contains("syntax error"));
    }
}
