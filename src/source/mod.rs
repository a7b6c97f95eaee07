//! Allocation sources - storage backends for workers and commitments
//!
//! ## Backends
//!
//! - [`SqliteStore`] - durable relational backend
//! - [`MemoryStore`] - degraded fallback, in-memory with optional JSON file
//! - [`FailoverStore`] - routes to the durable backend, falls back to the
//!   degraded one when it reports `BackendUnavailable`
//!
//! A check-then-write never mixes backends: the service asks the store for
//! a [`Route`] and runs the whole operation against one backend through it.
//!
//! Backends only retrieve and persist records. Filtering to active
//! commitments and all summation live in the capacity module, so the two
//! backends cannot drift apart in how they aggregate.

pub mod failover;
pub mod memory;
pub mod schema;
pub mod sqlite;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    Initiative, InitiativeCommitment, InitiativeId, Project, ProjectCommitment, ProjectId, Worker,
    WorkerId,
};
use crate::percent::Percent;

pub use failover::FailoverStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Read-only view over workers and their commitments.
#[async_trait]
pub trait AllocationSource: Send + Sync {
    /// Short backend label for logs and errors
    fn backend_name(&self) -> &'static str;

    /// Fails with `NotFound` when the worker does not exist
    async fn get_worker(&self, worker_id: WorkerId) -> Result<Worker>;

    /// Ids of all active workers, ascending
    async fn list_active_workers(&self) -> Result<Vec<WorkerId>>;

    /// Every project commitment of the worker, with `project_active` set
    /// from the project's current lifecycle state
    async fn list_project_commitments(&self, worker_id: WorkerId) -> Result<Vec<ProjectCommitment>>;

    /// Every initiative commitment of the worker, with `initiative_active` set
    async fn list_initiative_commitments(
        &self,
        worker_id: WorkerId,
    ) -> Result<Vec<InitiativeCommitment>>;

    async fn list_active_project_commitments(
        &self,
        worker_id: WorkerId,
    ) -> Result<Vec<ProjectCommitment>> {
        let mut commitments = self.list_project_commitments(worker_id).await?;
        commitments.retain(|c| c.project_active);
        Ok(commitments)
    }

    async fn list_active_initiative_commitments(
        &self,
        worker_id: WorkerId,
    ) -> Result<Vec<InitiativeCommitment>> {
        let mut commitments = self.list_initiative_commitments(worker_id).await?;
        commitments.retain(|c| c.initiative_active);
        Ok(commitments)
    }
}

/// Write side of a backend.
///
/// Upserts replace any existing commitment for the same pair, which keeps
/// the (worker, project) and (worker, initiative) uniqueness invariants.
#[async_trait]
pub trait CommitmentStore: AllocationSource {
    /// How a multi-call operation reaches this store
    fn route(self: Arc<Self>) -> Route;

    async fn put_worker(&self, worker: &Worker) -> Result<()>;

    async fn put_project(&self, project: &Project) -> Result<()>;

    async fn put_initiative(&self, initiative: &Initiative) -> Result<()>;

    async fn get_project(&self, project_id: ProjectId) -> Result<Project>;

    async fn get_initiative(&self, initiative_id: InitiativeId) -> Result<Initiative>;

    /// `NotFound` if the worker or the project does not exist
    async fn upsert_project_commitment(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        involvement: Percent,
    ) -> Result<()>;

    /// `NotFound` when the pair has no commitment
    async fn remove_project_commitment(&self, worker_id: WorkerId, project_id: ProjectId)
        -> Result<()>;

    /// `NotFound` if the worker or the initiative does not exist
    async fn upsert_initiative_commitment(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
        workload: Percent,
    ) -> Result<()>;

    async fn remove_initiative_commitment(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
    ) -> Result<()>;
}

/// Backend selection for one operation that makes several store calls.
pub enum Route {
    /// Every call goes to this backend
    Direct(Arc<dyn CommitmentStore>),
    /// The operation runs on the durable backend, or is rerun from the
    /// start on the fallback when the durable one is unreachable
    Failover(Arc<FailoverStore>),
}

impl Route {
    /// Run `operation` with a single backend for all of its calls.
    pub async fn run<T, F, Fut>(&self, name: &'static str, operation: F) -> Result<T>
    where
        F: Fn(Arc<dyn CommitmentStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self {
            Route::Direct(store) => operation(store.clone()).await,
            Route::Failover(store) => store.run_pinned(name, operation).await,
        }
    }
}
