//! Database schema constants.
//!
//! SQLite dialect. Timestamps are stored as fixed-width RFC 3339 text
//! (microsecond precision, `Z` suffix) so lexical order matches time order.

/// SQL schema for creating the tasks table.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    created_at      TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'running',
    input           TEXT NOT NULL,
    requirements    TEXT NOT NULL,
    output          TEXT,
    quality_score   REAL,
    processing_time REAL,
    error_message   TEXT
)
"#;

/// SQL schema for creating the stage_executions table.
pub const CREATE_STAGE_EXECUTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stage_executions (
    id             TEXT PRIMARY KEY,
    task_id        TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    stage_name     TEXT NOT NULL,
    iteration      INTEGER NOT NULL DEFAULT 0,
    started_at     TEXT NOT NULL,
    completed_at   TEXT,
    status         TEXT NOT NULL DEFAULT 'running',
    input_data     TEXT,
    output_data    TEXT,
    error_message  TEXT,
    execution_time REAL
)
"#;

pub const CREATE_TASKS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)";

pub const CREATE_TASKS_CREATED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)";

pub const CREATE_STAGE_EXECUTIONS_TASK_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_stage_executions_task_id ON stage_executions(task_id, started_at)";

/// A schema statement keyed by the name the migration ledger records.
/// Names are permanent: add new migrations, never rename or reorder old ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Every migration, in application order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "create_tasks",
        sql: CREATE_TASKS_TABLE,
    },
    Migration {
        name: "create_stage_executions",
        sql: CREATE_STAGE_EXECUTIONS_TABLE,
    },
    Migration {
        name: "index_tasks_status",
        sql: CREATE_TASKS_STATUS_INDEX,
    },
    Migration {
        name: "index_tasks_created_at",
        sql: CREATE_TASKS_CREATED_AT_INDEX,
    },
    Migration {
        name: "index_stage_executions_task",
        sql: CREATE_STAGE_EXECUTIONS_TASK_INDEX,
    },
];

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    MIGRATIONS.iter().map(|migration| migration.sql).collect()
}

/// Table names in the schema.
pub mod tables {
    pub const TASKS: &str = "tasks";
    pub const STAGE_EXECUTIONS: &str = "stage_executions";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 5);
        // tasks must come first, stage_executions references it
        assert!(statements[0].contains(tables::TASKS));
        assert!(statements[1].contains(tables::STAGE_EXECUTIONS));
        assert!(statements[2..]
            .iter()
            .all(|s| s.contains("CREATE INDEX IF NOT EXISTS")));
    }

    #[test]
    fn test_migration_names_are_unique() {
        let mut names: Vec<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), MIGRATIONS.len());
    }
}
