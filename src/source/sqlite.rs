//! Durable relational backend (SQLite)
//!
//! ## Tables
//!
//! - `workers` - identity, ceilings (basis points), active flag
//! - `projects` / `initiatives` - lifecycle state
//! - `project_commitments` / `initiative_commitments` - one row per
//!   (worker, target) pair, enforced by the primary key
//!
//! Activity flags on commitments are derived at read time by joining the
//! owning project or initiative.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::schema;
use super::{AllocationSource, CommitmentStore, Route};
use crate::error::{CapacityError, Result};
use crate::model::{
    Initiative, InitiativeCommitment, InitiativeId, InitiativeState, Project, ProjectCommitment,
    ProjectId, ProjectState, Worker, WorkerId,
};
use crate::percent::Percent;

const BACKEND: &str = "sqlite";

/// SQLite-backed allocation store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the database file.
    ///
    /// Failing to open the file is reported as `BackendUnavailable` so the
    /// storage layer can fall back to the degraded store.
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path).map_err(|e| CapacityError::BackendUnavailable {
            backend: BACKEND,
            reason: format!("Failed to open {}: {}", path.display(), e),
        })?;

        // WAL for concurrent readers; foreign keys for cascade on delete
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=3000;",
        )
        .map_err(map_sqlite_err)?;

        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(map_sqlite_err)?;

        let store = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| schema::init_schema(conn))
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CapacityError::Storage(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction so the write lock is taken
    /// before any read in the closure.
    fn with_write_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| CapacityError::Storage(format!("Lock poisoned: {}", e)))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(out)
    }
}

/// Transient conditions become `BackendUnavailable`; everything else is a
/// storage fault.
fn map_sqlite_err(e: rusqlite::Error) -> CapacityError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        match err.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::NotADatabase => {
                return CapacityError::BackendUnavailable {
                    backend: BACKEND,
                    reason: e.to_string(),
                };
            }
            _ => {}
        }
    }
    CapacityError::Storage(e.to_string())
}

fn percent_from_db(bp: i64) -> Result<Percent> {
    u32::try_from(bp)
        .map(Percent::from_basis_points)
        .map_err(|_| CapacityError::Storage(format!("Corrupt percentage value: {}", bp)))
}

fn id_from_db<T>(raw: i64, parse: fn(i64) -> Result<T>) -> Result<T> {
    parse(raw).map_err(|_| CapacityError::Storage(format!("Corrupt id value: {}", raw)))
}

fn ensure_row_exists(tx: &Connection, table: &str, id: i64, label: &str) -> Result<()> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?1", table);
    let found: Option<i64> = tx
        .query_row(&sql, [id], |row| row.get(0))
        .optional()
        .map_err(map_sqlite_err)?;
    match found {
        Some(_) => Ok(()),
        None => Err(CapacityError::NotFound(format!("{} {}", label, id))),
    }
}

#[async_trait]
impl AllocationSource for SqliteStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn get_worker(&self, worker_id: WorkerId) -> Result<Worker> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, primary_ceiling_bp, secondary_ceiling_bp, active
                 FROM workers WHERE id = ?1",
                [worker_id.get()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sqlite_err)
        })?;

        let (id, name, primary_bp, secondary_bp, active) =
            row.ok_or_else(|| CapacityError::NotFound(format!("worker {}", worker_id)))?;

        Ok(Worker {
            id: id_from_db(id, WorkerId::new)?,
            name,
            primary_ceiling: percent_from_db(primary_bp)?,
            secondary_ceiling: percent_from_db(secondary_bp)?,
            active,
        })
    }

    async fn list_active_workers(&self) -> Result<Vec<WorkerId>> {
        let raw_ids = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM workers WHERE active = 1 ORDER BY id")
                .map_err(map_sqlite_err)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))
                .map_err(map_sqlite_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_err)?;
            Ok(ids)
        })?;

        raw_ids
            .into_iter()
            .map(|id| id_from_db(id, WorkerId::new))
            .collect()
    }

    async fn list_project_commitments(&self, worker_id: WorkerId) -> Result<Vec<ProjectCommitment>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT pc.project_id, pc.involvement_bp, p.state
                     FROM project_commitments pc
                     JOIN projects p ON p.id = pc.project_id
                     WHERE pc.worker_id = ?1
                     ORDER BY pc.project_id",
                )
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map([worker_id.get()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(map_sqlite_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_err)?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(project_id, involvement_bp, state)| {
                let state: ProjectState = state
                    .parse()
                    .map_err(|_| CapacityError::Storage(format!("Corrupt project state: {}", state)))?;
                Ok(ProjectCommitment {
                    worker_id,
                    project_id: id_from_db(project_id, ProjectId::new)?,
                    involvement: percent_from_db(involvement_bp)?,
                    project_active: state.is_active(),
                })
            })
            .collect()
    }

    async fn list_initiative_commitments(
        &self,
        worker_id: WorkerId,
    ) -> Result<Vec<InitiativeCommitment>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT ic.initiative_id, ic.workload_bp, i.state
                     FROM initiative_commitments ic
                     JOIN initiatives i ON i.id = ic.initiative_id
                     WHERE ic.worker_id = ?1
                     ORDER BY ic.initiative_id",
                )
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map([worker_id.get()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(map_sqlite_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_sqlite_err)?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(initiative_id, workload_bp, state)| {
                let state: InitiativeState = state.parse().map_err(|_| {
                    CapacityError::Storage(format!("Corrupt initiative state: {}", state))
                })?;
                Ok(InitiativeCommitment {
                    worker_id,
                    initiative_id: id_from_db(initiative_id, InitiativeId::new)?,
                    workload: percent_from_db(workload_bp)?,
                    initiative_active: state.is_active(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl CommitmentStore for SqliteStore {
    fn route(self: Arc<Self>) -> Route {
        Route::Direct(self)
    }

    async fn put_worker(&self, worker: &Worker) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workers (id, name, primary_ceiling_bp, secondary_ceiling_bp, active)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    primary_ceiling_bp = excluded.primary_ceiling_bp,
                    secondary_ceiling_bp = excluded.secondary_ceiling_bp,
                    active = excluded.active,
                    updated_at = datetime('now')",
                params![
                    worker.id.get(),
                    worker.name,
                    worker.primary_ceiling.basis_points() as i64,
                    worker.secondary_ceiling.basis_points() as i64,
                    worker.active,
                ],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })?;
        debug!(worker_id = %worker.id, "Stored worker");
        Ok(())
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (id, name, state) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    state = excluded.state,
                    updated_at = datetime('now')",
                params![project.id.get(), project.name, project.state.as_str()],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
    }

    async fn put_initiative(&self, initiative: &Initiative) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO initiatives (id, title, state) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    state = excluded.state,
                    updated_at = datetime('now')",
                params![initiative.id.get(), initiative.title, initiative.state.as_str()],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
    }

    async fn get_project(&self, project_id: ProjectId) -> Result<Project> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT name, state FROM projects WHERE id = ?1",
                [project_id.get()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(map_sqlite_err)
        })?;

        let (name, state) =
            row.ok_or_else(|| CapacityError::NotFound(format!("project {}", project_id)))?;
        Ok(Project {
            id: project_id,
            name,
            state: state
                .parse()
                .map_err(|_| CapacityError::Storage(format!("Corrupt project state: {}", state)))?,
        })
    }

    async fn get_initiative(&self, initiative_id: InitiativeId) -> Result<Initiative> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT title, state FROM initiatives WHERE id = ?1",
                [initiative_id.get()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(map_sqlite_err)
        })?;

        let (title, state) =
            row.ok_or_else(|| CapacityError::NotFound(format!("initiative {}", initiative_id)))?;
        Ok(Initiative {
            id: initiative_id,
            title,
            state: state.parse().map_err(|_| {
                CapacityError::Storage(format!("Corrupt initiative state: {}", state))
            })?,
        })
    }

    async fn upsert_project_commitment(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        involvement: Percent,
    ) -> Result<()> {
        involvement.ensure_commitment()?;
        self.with_write_tx(|tx| {
            ensure_row_exists(tx, "workers", worker_id.get(), "worker")?;
            ensure_row_exists(tx, "projects", project_id.get(), "project")?;
            tx.execute(
                "INSERT INTO project_commitments (worker_id, project_id, involvement_bp)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(worker_id, project_id) DO UPDATE SET
                    involvement_bp = excluded.involvement_bp,
                    updated_at = datetime('now')",
                params![worker_id.get(), project_id.get(), involvement.basis_points() as i64],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })?;
        debug!(worker_id = %worker_id, project_id = %project_id, %involvement, "Stored project commitment");
        Ok(())
    }

    async fn remove_project_commitment(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
    ) -> Result<()> {
        let removed = self.with_write_tx(|tx| {
            tx.execute(
                "DELETE FROM project_commitments WHERE worker_id = ?1 AND project_id = ?2",
                params![worker_id.get(), project_id.get()],
            )
            .map_err(map_sqlite_err)
        })?;

        if removed == 0 {
            return Err(CapacityError::NotFound(format!(
                "commitment of worker {} to project {}",
                worker_id, project_id
            )));
        }
        Ok(())
    }

    async fn upsert_initiative_commitment(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
        workload: Percent,
    ) -> Result<()> {
        workload.ensure_commitment()?;
        self.with_write_tx(|tx| {
            ensure_row_exists(tx, "workers", worker_id.get(), "worker")?;
            ensure_row_exists(tx, "initiatives", initiative_id.get(), "initiative")?;
            tx.execute(
                "INSERT INTO initiative_commitments (worker_id, initiative_id, workload_bp)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(worker_id, initiative_id) DO UPDATE SET
                    workload_bp = excluded.workload_bp,
                    updated_at = datetime('now')",
                params![worker_id.get(), initiative_id.get(), workload.basis_points() as i64],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })?;
        debug!(worker_id = %worker_id, initiative_id = %initiative_id, %workload, "Stored initiative commitment");
        Ok(())
    }

    async fn remove_initiative_commitment(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
    ) -> Result<()> {
        let removed = self.with_write_tx(|tx| {
            tx.execute(
                "DELETE FROM initiative_commitments WHERE worker_id = ?1 AND initiative_id = ?2",
                params![worker_id.get(), initiative_id.get()],
            )
            .map_err(map_sqlite_err)
        })?;

        if removed == 0 {
            return Err(CapacityError::NotFound(format!(
                "commitment of worker {} to initiative {}",
                worker_id, initiative_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wid(raw: i64) -> WorkerId {
        WorkerId::new(raw).unwrap()
    }

    fn pid(raw: i64) -> ProjectId {
        ProjectId::new(raw).unwrap()
    }

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_worker(&Worker::new(wid(1), "Ada")).await.unwrap();
        store
            .put_project(&Project { id: pid(10), name: "Apollo".into(), state: ProjectState::Active })
            .await
            .unwrap();
        store
            .put_project(&Project { id: pid(11), name: "Gemini".into(), state: ProjectState::OnHold })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_get_missing_worker() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.get_worker(wid(99)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_commitment_activity_follows_project_state() {
        let store = seeded().await;
        store.upsert_project_commitment(wid(1), pid(10), Percent::whole(40)).await.unwrap();
        store.upsert_project_commitment(wid(1), pid(11), Percent::whole(30)).await.unwrap();

        let all = store.list_project_commitments(wid(1)).await.unwrap();
        assert_eq!(all.len(), 2);
        let active = store.list_active_project_commitments(wid(1)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].project_id, pid(10));

        store
            .put_project(&Project { id: pid(11), name: "Gemini".into(), state: ProjectState::Active })
            .await
            .unwrap();
        let active = store.list_active_project_commitments(wid(1)).await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_pair() {
        let store = seeded().await;
        store.upsert_project_commitment(wid(1), pid(10), Percent::whole(40)).await.unwrap();
        store.upsert_project_commitment(wid(1), pid(10), Percent::whole(70)).await.unwrap();

        let all = store.list_project_commitments(wid(1)).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].involvement, Percent::whole(70));
    }

    #[tokio::test]
    async fn test_upsert_requires_existing_project() {
        let store = seeded().await;
        let err = store
            .upsert_project_commitment(wid(1), pid(404), Percent::whole(10))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_missing_commitment() {
        let store = seeded().await;
        let err = store.remove_project_commitment(wid(1), pid(10)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_inactive_workers_not_listed() {
        let store = seeded().await;
        let mut retired = Worker::new(wid(2), "Bob");
        retired.active = false;
        store.put_worker(&retired).await.unwrap();

        assert_eq!(store.list_active_workers().await.unwrap(), vec![wid(1)]);
    }
}
