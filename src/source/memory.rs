//! Degraded fallback backend
//!
//! In-memory storage for workers and commitments, optionally mirrored to a
//! JSON file so a restart while the durable backend is down does not lose
//! accepted commitments. Used when the SQLite store is unreachable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AllocationSource, CommitmentStore, Route};
use crate::error::{CapacityError, Result};
use crate::model::{
    Initiative, InitiativeCommitment, InitiativeId, Project, ProjectCommitment, ProjectId, Worker,
    WorkerId,
};
use crate::percent::Percent;

const BACKEND: &str = "memory";

/// Everything the fallback store holds; also the on-disk file format.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryState {
    #[serde(default)]
    workers: BTreeMap<WorkerId, Worker>,
    #[serde(default)]
    projects: BTreeMap<ProjectId, Project>,
    #[serde(default)]
    initiatives: BTreeMap<InitiativeId, Initiative>,
    /// worker -> project -> involvement
    #[serde(default)]
    project_commitments: BTreeMap<WorkerId, BTreeMap<ProjectId, Percent>>,
    /// worker -> initiative -> workload
    #[serde(default)]
    initiative_commitments: BTreeMap<WorkerId, BTreeMap<InitiativeId, Percent>>,
}

/// In-memory (optionally file-backed) allocation store
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    /// Mirror file, rewritten after every mutation
    file: Option<PathBuf>,
}

impl MemoryStore {
    /// Create an empty, purely in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            file: None,
        }
    }

    /// Open a file-backed store, loading the file if it exists.
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let state: MemoryState = serde_json::from_str(&content)?;
            info!(
                path = %path.display(),
                workers = state.workers.len(),
                "Loaded fallback store"
            );
            state
        } else {
            info!(path = %path.display(), "Fallback store file not found, starting empty");
            MemoryState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            file: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|e| CapacityError::Storage(format!("Lock poisoned: {}", e)))
    }

    /// Apply a mutation and mirror the result to disk while still holding
    /// the write lock, so file contents never go backwards.
    fn mutate<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut MemoryState) -> Result<T>,
    {
        let mut state = self
            .state
            .write()
            .map_err(|e| CapacityError::Storage(format!("Lock poisoned: {}", e)))?;
        let out = f(&mut state)?;
        if let Some(path) = &self.file {
            persist(path, &state)?;
        }
        Ok(out)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Write via a sibling temp file and rename.
fn persist(path: &Path, state: &MemoryState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "Fallback store persisted");
    Ok(())
}

#[async_trait]
impl AllocationSource for MemoryStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn get_worker(&self, worker_id: WorkerId) -> Result<Worker> {
        self.read()?
            .workers
            .get(&worker_id)
            .cloned()
            .ok_or_else(|| CapacityError::NotFound(format!("worker {}", worker_id)))
    }

    async fn list_active_workers(&self) -> Result<Vec<WorkerId>> {
        Ok(self
            .read()?
            .workers
            .values()
            .filter(|w| w.active)
            .map(|w| w.id)
            .collect())
    }

    async fn list_project_commitments(&self, worker_id: WorkerId) -> Result<Vec<ProjectCommitment>> {
        let state = self.read()?;
        let Some(commitments) = state.project_commitments.get(&worker_id) else {
            return Ok(Vec::new());
        };

        Ok(commitments
            .iter()
            .map(|(project_id, involvement)| ProjectCommitment {
                worker_id,
                project_id: *project_id,
                involvement: *involvement,
                project_active: state
                    .projects
                    .get(project_id)
                    .map(|p| p.state.is_active())
                    .unwrap_or(false),
            })
            .collect())
    }

    async fn list_initiative_commitments(
        &self,
        worker_id: WorkerId,
    ) -> Result<Vec<InitiativeCommitment>> {
        let state = self.read()?;
        let Some(commitments) = state.initiative_commitments.get(&worker_id) else {
            return Ok(Vec::new());
        };

        Ok(commitments
            .iter()
            .map(|(initiative_id, workload)| InitiativeCommitment {
                worker_id,
                initiative_id: *initiative_id,
                workload: *workload,
                initiative_active: state
                    .initiatives
                    .get(initiative_id)
                    .map(|i| i.state.is_active())
                    .unwrap_or(false),
            })
            .collect())
    }
}

#[async_trait]
impl CommitmentStore for MemoryStore {
    fn route(self: Arc<Self>) -> Route {
        Route::Direct(self)
    }

    async fn put_worker(&self, worker: &Worker) -> Result<()> {
        self.mutate(|state| {
            state.workers.insert(worker.id, worker.clone());
            Ok(())
        })
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        self.mutate(|state| {
            state.projects.insert(project.id, project.clone());
            Ok(())
        })
    }

    async fn put_initiative(&self, initiative: &Initiative) -> Result<()> {
        self.mutate(|state| {
            state.initiatives.insert(initiative.id, initiative.clone());
            Ok(())
        })
    }

    async fn get_project(&self, project_id: ProjectId) -> Result<Project> {
        self.read()?
            .projects
            .get(&project_id)
            .cloned()
            .ok_or_else(|| CapacityError::NotFound(format!("project {}", project_id)))
    }

    async fn get_initiative(&self, initiative_id: InitiativeId) -> Result<Initiative> {
        self.read()?
            .initiatives
            .get(&initiative_id)
            .cloned()
            .ok_or_else(|| CapacityError::NotFound(format!("initiative {}", initiative_id)))
    }

    async fn upsert_project_commitment(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        involvement: Percent,
    ) -> Result<()> {
        involvement.ensure_commitment()?;
        self.mutate(|state| {
            if !state.workers.contains_key(&worker_id) {
                return Err(CapacityError::NotFound(format!("worker {}", worker_id)));
            }
            if !state.projects.contains_key(&project_id) {
                return Err(CapacityError::NotFound(format!("project {}", project_id)));
            }
            state
                .project_commitments
                .entry(worker_id)
                .or_default()
                .insert(project_id, involvement);
            Ok(())
        })
    }

    async fn remove_project_commitment(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
    ) -> Result<()> {
        self.mutate(|state| {
            let removed = state
                .project_commitments
                .get_mut(&worker_id)
                .and_then(|commitments| commitments.remove(&project_id));
            state.project_commitments.retain(|_, c| !c.is_empty());

            match removed {
                Some(_) => Ok(()),
                None => Err(CapacityError::NotFound(format!(
                    "commitment of worker {} to project {}",
                    worker_id, project_id
                ))),
            }
        })
    }

    async fn upsert_initiative_commitment(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
        workload: Percent,
    ) -> Result<()> {
        workload.ensure_commitment()?;
        self.mutate(|state| {
            if !state.workers.contains_key(&worker_id) {
                return Err(CapacityError::NotFound(format!("worker {}", worker_id)));
            }
            if !state.initiatives.contains_key(&initiative_id) {
                return Err(CapacityError::NotFound(format!("initiative {}", initiative_id)));
            }
            state
                .initiative_commitments
                .entry(worker_id)
                .or_default()
                .insert(initiative_id, workload);
            Ok(())
        })
    }

    async fn remove_initiative_commitment(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
    ) -> Result<()> {
        self.mutate(|state| {
            let removed = state
                .initiative_commitments
                .get_mut(&worker_id)
                .and_then(|commitments| commitments.remove(&initiative_id));
            state.initiative_commitments.retain(|_, c| !c.is_empty());

            match removed {
                Some(_) => Ok(()),
                None => Err(CapacityError::NotFound(format!(
                    "commitment of worker {} to initiative {}",
                    worker_id, initiative_id
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InitiativeState, ProjectState};
    use tempfile::TempDir;

    fn wid(raw: i64) -> WorkerId {
        WorkerId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_worker_has_no_commitments() {
        let store = MemoryStore::new();
        assert!(store.list_project_commitments(wid(5)).await.unwrap().is_empty());
        assert!(store.get_worker(wid(5)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fallback.json");
        let initiative = InitiativeId::new(3).unwrap();

        {
            let store = MemoryStore::open(&path).unwrap();
            store.put_worker(&Worker::new(wid(1), "Ada")).await.unwrap();
            store
                .put_initiative(&Initiative {
                    id: initiative,
                    title: "Mentoring".into(),
                    state: InitiativeState::Active,
                })
                .await
                .unwrap();
            store
                .upsert_initiative_commitment(wid(1), initiative, Percent::whole(15))
                .await
                .unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        let commitments = reopened.list_active_initiative_commitments(wid(1)).await.unwrap();
        assert_eq!(commitments.len(), 1);
        assert_eq!(commitments[0].workload, Percent::whole(15));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_remove_cleans_up_and_reports_missing() {
        let store = MemoryStore::new();
        let project = ProjectId::new(8).unwrap();
        store.put_worker(&Worker::new(wid(1), "Ada")).await.unwrap();
        store
            .put_project(&Project { id: project, name: "Atlas".into(), state: ProjectState::Active })
            .await
            .unwrap();
        store
            .upsert_project_commitment(wid(1), project, Percent::whole(25))
            .await
            .unwrap();

        store.remove_project_commitment(wid(1), project).await.unwrap();
        assert!(store.list_project_commitments(wid(1)).await.unwrap().is_empty());

        let err = store.remove_project_commitment(wid(1), project).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_commitment() {
        let store = MemoryStore::new();
        store.put_worker(&Worker::new(wid(1), "Ada")).await.unwrap();
        let err = store
            .upsert_project_commitment(wid(1), ProjectId::new(1).unwrap(), Percent::whole(101))
            .await
            .unwrap_err();
        assert!(matches!(err, CapacityError::InvalidArgument(_)));
    }
}
