//! Storage layer with degraded-mode fallback
//!
//! Every call goes to the durable backend first. When it reports
//! `BackendUnavailable` the same call is replayed against the fallback
//! backend and the store is marked degraded until the durable backend
//! answers again. Any other error (including `NotFound`) is returned as-is.
//!
//! Operations spanning several calls go through [`FailoverStore::run_pinned`]
//! instead, which fails over the operation as a whole so its reads and its
//! write always hit the same backend.
//!
//! Writes accepted while degraded live only in the fallback backend; they
//! are not replayed into the durable backend on recovery.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{AllocationSource, CommitmentStore, Route};
use crate::error::{CapacityError, Result};
use crate::model::{
    Initiative, InitiativeCommitment, InitiativeId, Project, ProjectCommitment, ProjectId, Worker,
    WorkerId,
};
use crate::percent::Percent;

/// Run `$call` against the primary store, then against the fallback if the
/// primary is unreachable.
macro_rules! with_failover {
    ($self:ident, $op:literal, $store:ident => $call:expr) => {{
        let result = {
            let $store = $self.primary.as_ref();
            $call.await
        };
        match result {
            Err(e) if e.is_backend_unavailable() => {
                $self.mark_degraded($op, &e);
                let $store = $self.fallback.as_ref();
                $call.await
            }
            other => {
                $self.mark_healthy();
                other
            }
        }
    }};
}

/// Durable store with a degraded fallback
pub struct FailoverStore {
    primary: Arc<dyn CommitmentStore>,
    fallback: Arc<dyn CommitmentStore>,
    degraded: AtomicBool,
}

impl FailoverStore {
    pub fn new(primary: Arc<dyn CommitmentStore>, fallback: Arc<dyn CommitmentStore>) -> Self {
        info!(
            primary = primary.backend_name(),
            fallback = fallback.backend_name(),
            "Failover store initialized"
        );
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
        }
    }

    /// True while the last primary call was unreachable
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Run a whole operation on the durable backend, rerunning it from the
    /// start on the fallback if any of its calls finds the durable backend
    /// unreachable.
    pub async fn run_pinned<T, F, Fut>(&self, operation: &'static str, run: F) -> Result<T>
    where
        F: Fn(Arc<dyn CommitmentStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match run(self.primary.clone()).await {
            Err(e) if e.is_backend_unavailable() => {
                self.mark_degraded(operation, &e);
                run(self.fallback.clone()).await
            }
            other => {
                self.mark_healthy();
                other
            }
        }
    }

    fn mark_degraded(&self, operation: &str, error: &CapacityError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                operation,
                primary = self.primary.backend_name(),
                fallback = self.fallback.backend_name(),
                error = %error,
                "Primary backend unavailable, switching to fallback"
            );
        } else {
            debug!(operation, "Serving from fallback backend");
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(
                primary = self.primary.backend_name(),
                "Primary backend reachable again"
            );
        }
    }
}

#[async_trait]
impl AllocationSource for FailoverStore {
    fn backend_name(&self) -> &'static str {
        if self.is_degraded() {
            self.fallback.backend_name()
        } else {
            self.primary.backend_name()
        }
    }

    async fn get_worker(&self, worker_id: WorkerId) -> Result<Worker> {
        with_failover!(self, "get_worker", store => store.get_worker(worker_id))
    }

    async fn list_active_workers(&self) -> Result<Vec<WorkerId>> {
        with_failover!(self, "list_active_workers", store => store.list_active_workers())
    }

    async fn list_project_commitments(&self, worker_id: WorkerId) -> Result<Vec<ProjectCommitment>> {
        with_failover!(self, "list_project_commitments", store => store.list_project_commitments(worker_id))
    }

    async fn list_initiative_commitments(
        &self,
        worker_id: WorkerId,
    ) -> Result<Vec<InitiativeCommitment>> {
        with_failover!(self, "list_initiative_commitments", store => store.list_initiative_commitments(worker_id))
    }
}

#[async_trait]
impl CommitmentStore for FailoverStore {
    fn route(self: Arc<Self>) -> Route {
        Route::Failover(self)
    }

    async fn put_worker(&self, worker: &Worker) -> Result<()> {
        with_failover!(self, "put_worker", store => store.put_worker(worker))
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        with_failover!(self, "put_project", store => store.put_project(project))
    }

    async fn put_initiative(&self, initiative: &Initiative) -> Result<()> {
        with_failover!(self, "put_initiative", store => store.put_initiative(initiative))
    }

    async fn get_project(&self, project_id: ProjectId) -> Result<Project> {
        with_failover!(self, "get_project", store => store.get_project(project_id))
    }

    async fn get_initiative(&self, initiative_id: InitiativeId) -> Result<Initiative> {
        with_failover!(self, "get_initiative", store => store.get_initiative(initiative_id))
    }

    async fn upsert_project_commitment(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        involvement: Percent,
    ) -> Result<()> {
        with_failover!(self, "upsert_project_commitment", store =>
            store.upsert_project_commitment(worker_id, project_id, involvement))
    }

    async fn remove_project_commitment(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
    ) -> Result<()> {
        with_failover!(self, "remove_project_commitment", store =>
            store.remove_project_commitment(worker_id, project_id))
    }

    async fn upsert_initiative_commitment(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
        workload: Percent,
    ) -> Result<()> {
        with_failover!(self, "upsert_initiative_commitment", store =>
            store.upsert_initiative_commitment(worker_id, initiative_id, workload))
    }

    async fn remove_initiative_commitment(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
    ) -> Result<()> {
        with_failover!(self, "remove_initiative_commitment", store =>
            store.remove_initiative_commitment(worker_id, initiative_id))
    }
}
