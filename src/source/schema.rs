//! SQLite schema for the durable backend

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{CapacityError, Result};

/// Stored in `PRAGMA user_version`; 0 means a fresh database
pub const SCHEMA_VERSION: i32 = 1;

/// Create the tables on a fresh database, or check an existing one is
/// a version this build understands.
pub fn init_schema(conn: &Connection) -> Result<()> {
    match schema_version(conn)? {
        0 => {
            info!(version = SCHEMA_VERSION, "Creating capacity schema");
            let tx = conn.unchecked_transaction().map_err(storage("begin schema transaction"))?;
            tx.execute_batch(CAPACITY_SCHEMA)
                .map_err(storage("create tables"))?;
            tx.execute_batch(INDEXES_SCHEMA)
                .map_err(storage("create indexes"))?;
            tx.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(storage("record schema version"))?;
            tx.commit().map_err(storage("commit schema"))?;
        }
        version if version > SCHEMA_VERSION => {
            return Err(CapacityError::Storage(format!(
                "database schema v{} is newer than supported v{}",
                version, SCHEMA_VERSION
            )));
        }
        version => debug!(version, "Capacity schema up to date"),
    }
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(storage("read schema version"))
}

fn storage(action: &'static str) -> impl Fn(rusqlite::Error) -> CapacityError {
    move |e| CapacityError::Storage(format!("failed to {}: {}", action, e))
}

/// Percentages are stored as integer basis points.
const CAPACITY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    primary_ceiling_bp INTEGER NOT NULL DEFAULT 10000,
    secondary_ceiling_bp INTEGER NOT NULL DEFAULT 2000,
    active INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'planning',
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS initiatives (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'proposed',
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS project_commitments (
    worker_id INTEGER NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    involvement_bp INTEGER NOT NULL CHECK (involvement_bp BETWEEN 0 AND 10000),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (worker_id, project_id)
);

CREATE TABLE IF NOT EXISTS initiative_commitments (
    worker_id INTEGER NOT NULL REFERENCES workers(id) ON DELETE CASCADE,
    initiative_id INTEGER NOT NULL REFERENCES initiatives(id) ON DELETE CASCADE,
    workload_bp INTEGER NOT NULL CHECK (workload_bp BETWEEN 0 AND 10000),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (worker_id, initiative_id)
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_project_commitments_project ON project_commitments(project_id);
CREATE INDEX IF NOT EXISTS idx_initiative_commitments_initiative ON initiative_commitments(initiative_id);
CREATE INDEX IF NOT EXISTS idx_workers_active ON workers(active);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i32 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('workers', 'projects', 'initiatives', 'project_commitments', 'initiative_commitments')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();

        let err = init_schema(&conn).unwrap_err();
        assert!(matches!(err, CapacityError::Storage(_)));
    }
}
