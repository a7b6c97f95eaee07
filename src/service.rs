//! Workload service - mutations and dashboard reads
//!
//! Every mutation that can raise a worker's totals runs its admission check
//! and its write under that worker's lock, so two writers for one worker
//! cannot both pass the check against the same pre-write state. The reads
//! and the write of one mutation all go to the same backend through a
//! [`Route`]. Successful mutations invalidate the affected cache tags;
//! rejected admissions write nothing and invalidate nothing.
//!
//! Dashboard reads go through the [`TaggedCache`]. Admission checks never
//! do.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::cache::keys::{workload_key, workload_tags, worker_tag, FLEET_OVERVIEW_KEY, FLEET_TAG};
use crate::cache::TaggedCache;
use crate::capacity::{AdmissionDecision, AssignmentValidator, CapacityAggregator, WorkloadSnapshot};
use crate::config::EngineConfig;
use crate::error::{CapacityError, Result};
use crate::model::{
    Initiative, InitiativeId, InitiativeState, Project, ProjectId, ProjectState, Worker, WorkerId,
};
use crate::percent::Percent;
use crate::source::{AllocationSource, CommitmentStore, Route};

/// Fleet-wide dashboard figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetOverview {
    /// One snapshot per active worker, ordered by worker id
    pub snapshots: Vec<WorkloadSnapshot>,
    pub worker_count: usize,
    pub overloaded_count: usize,
    pub computed_at: DateTime<Utc>,
}

impl FleetOverview {
    pub fn overloaded(&self) -> impl Iterator<Item = &WorkloadSnapshot> {
        self.snapshots.iter().filter(|s| s.is_overloaded)
    }
}

/// Values held by the dashboard cache
#[derive(Debug, Clone)]
pub enum DashboardEntry {
    Workload(WorkloadSnapshot),
    Fleet(FleetOverview),
}

fn unexpected_entry(key: &str) -> CapacityError {
    CapacityError::Storage(format!("cache entry under {} has the wrong kind", key))
}

pub struct WorkloadService {
    store: Arc<dyn CommitmentStore>,
    aggregator: CapacityAggregator,
    validator: AssignmentValidator,
    cache: Arc<TaggedCache<DashboardEntry>>,
    cache_ttl: Duration,
    worker_locks: DashMap<WorkerId, Arc<Mutex<()>>>,
}

impl WorkloadService {
    pub fn new<S>(store: Arc<S>, cache: Arc<TaggedCache<DashboardEntry>>, config: &EngineConfig) -> Self
    where
        S: CommitmentStore + 'static,
    {
        let source: Arc<dyn AllocationSource> = store.clone();
        Self {
            store,
            aggregator: CapacityAggregator::new(source.clone()),
            validator: AssignmentValidator::new(source),
            cache,
            cache_ttl: config.cache_ttl,
            worker_locks: DashMap::new(),
        }
    }

    pub fn aggregator(&self) -> &CapacityAggregator {
        &self.aggregator
    }

    pub fn validator(&self) -> &AssignmentValidator {
        &self.validator
    }

    pub fn cache(&self) -> &Arc<TaggedCache<DashboardEntry>> {
        &self.cache
    }

    async fn lock_worker(&self, worker_id: WorkerId) -> OwnedMutexGuard<()> {
        let lock = self
            .worker_locks
            .entry(worker_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn route(&self) -> Route {
        self.store.clone().route()
    }

    fn invalidate_worker(&self, worker_id: WorkerId) {
        self.cache
            .invalidate_by_tags(&[worker_tag(worker_id), FLEET_TAG.to_string()]);
    }

    fn invalidate_fleet(&self) {
        self.cache.invalidate_by_tags(&[FLEET_TAG]);
    }

    // =========================================================================
    // Project commitments
    // =========================================================================

    /// Assign a worker to a project if the involvement fits.
    ///
    /// Returns the admission decision either way; `Conflict` if the worker is
    /// already assigned to the project.
    pub async fn assign_to_project(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        involvement: Percent,
    ) -> Result<AdmissionDecision> {
        involvement.ensure_commitment()?;
        let _guard = self.lock_worker(worker_id).await;

        let decision = self
            .route()
            .run("assign_to_project", move |store| async move {
                store.get_project(project_id).await?;
                let existing = store.list_project_commitments(worker_id).await?;
                if existing.iter().any(|c| c.project_id == project_id) {
                    return Err(CapacityError::Conflict(format!(
                        "worker {} is already assigned to project {}",
                        worker_id, project_id
                    )));
                }

                let decision =
                    AssignmentValidator::check_project(&*store, worker_id, involvement, None).await?;
                if decision.can_admit {
                    store
                        .upsert_project_commitment(worker_id, project_id, involvement)
                        .await?;
                }
                Ok(decision)
            })
            .await?;

        if !decision.can_admit {
            info!(
                worker_id = %worker_id,
                project_id = %project_id,
                proposed = %involvement,
                current = %decision.current_workload,
                "Assignment rejected: over capacity"
            );
            return Ok(decision);
        }
        self.invalidate_worker(worker_id);

        info!(
            worker_id = %worker_id,
            project_id = %project_id,
            involvement = %involvement,
            "Worker assigned to project"
        );
        Ok(decision)
    }

    /// Revise an existing project involvement. The current value of the
    /// commitment being revised is excluded from the check.
    pub async fn update_involvement(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        involvement: Percent,
    ) -> Result<AdmissionDecision> {
        involvement.ensure_commitment()?;
        let _guard = self.lock_worker(worker_id).await;

        let decision = self
            .route()
            .run("update_involvement", move |store| async move {
                let existing = store.list_project_commitments(worker_id).await?;
                if !existing.iter().any(|c| c.project_id == project_id) {
                    return Err(CapacityError::NotFound(format!(
                        "commitment of worker {} to project {}",
                        worker_id, project_id
                    )));
                }

                let decision = AssignmentValidator::check_project(
                    &*store,
                    worker_id,
                    involvement,
                    Some(project_id),
                )
                .await?;
                if decision.can_admit {
                    store
                        .upsert_project_commitment(worker_id, project_id, involvement)
                        .await?;
                }
                Ok(decision)
            })
            .await?;

        if !decision.can_admit {
            info!(
                worker_id = %worker_id,
                project_id = %project_id,
                proposed = %involvement,
                "Involvement change rejected: over capacity"
            );
            return Ok(decision);
        }
        self.invalidate_worker(worker_id);

        debug!(worker_id = %worker_id, project_id = %project_id, involvement = %involvement, "Involvement updated");
        Ok(decision)
    }

    pub async fn unassign(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<()> {
        let _guard = self.lock_worker(worker_id).await;
        self.store
            .remove_project_commitment(worker_id, project_id)
            .await?;
        self.invalidate_worker(worker_id);

        info!(worker_id = %worker_id, project_id = %project_id, "Worker unassigned from project");
        Ok(())
    }

    // =========================================================================
    // Initiative commitments
    // =========================================================================

    pub async fn commit_to_initiative(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
        workload: Percent,
    ) -> Result<AdmissionDecision> {
        workload.ensure_commitment()?;
        let _guard = self.lock_worker(worker_id).await;

        let decision = self
            .route()
            .run("commit_to_initiative", move |store| async move {
                store.get_initiative(initiative_id).await?;
                let existing = store.list_initiative_commitments(worker_id).await?;
                if existing.iter().any(|c| c.initiative_id == initiative_id) {
                    return Err(CapacityError::Conflict(format!(
                        "worker {} is already committed to initiative {}",
                        worker_id, initiative_id
                    )));
                }

                let decision =
                    AssignmentValidator::check_initiative(&*store, worker_id, workload, None)
                        .await?;
                if decision.can_admit {
                    store
                        .upsert_initiative_commitment(worker_id, initiative_id, workload)
                        .await?;
                }
                Ok(decision)
            })
            .await?;

        if !decision.can_admit {
            info!(
                worker_id = %worker_id,
                initiative_id = %initiative_id,
                proposed = %workload,
                "Initiative commitment rejected: over secondary limit"
            );
            return Ok(decision);
        }
        self.invalidate_worker(worker_id);

        info!(
            worker_id = %worker_id,
            initiative_id = %initiative_id,
            workload = %workload,
            "Worker committed to initiative"
        );
        Ok(decision)
    }

    pub async fn update_initiative_workload(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
        workload: Percent,
    ) -> Result<AdmissionDecision> {
        workload.ensure_commitment()?;
        let _guard = self.lock_worker(worker_id).await;

        let decision = self
            .route()
            .run("update_initiative_workload", move |store| async move {
                let existing = store.list_initiative_commitments(worker_id).await?;
                if !existing.iter().any(|c| c.initiative_id == initiative_id) {
                    return Err(CapacityError::NotFound(format!(
                        "commitment of worker {} to initiative {}",
                        worker_id, initiative_id
                    )));
                }

                let decision = AssignmentValidator::check_initiative(
                    &*store,
                    worker_id,
                    workload,
                    Some(initiative_id),
                )
                .await?;
                if decision.can_admit {
                    store
                        .upsert_initiative_commitment(worker_id, initiative_id, workload)
                        .await?;
                }
                Ok(decision)
            })
            .await?;

        if decision.can_admit {
            self.invalidate_worker(worker_id);
        }
        Ok(decision)
    }

    pub async fn cancel_initiative_commitment(
        &self,
        worker_id: WorkerId,
        initiative_id: InitiativeId,
    ) -> Result<()> {
        let _guard = self.lock_worker(worker_id).await;
        self.store
            .remove_initiative_commitment(worker_id, initiative_id)
            .await?;
        self.invalidate_worker(worker_id);

        info!(worker_id = %worker_id, initiative_id = %initiative_id, "Initiative commitment cancelled");
        Ok(())
    }

    // =========================================================================
    // Lifecycle and profile changes
    // =========================================================================

    /// Create or replace a project record.
    pub async fn save_project(&self, project: &Project) -> Result<()> {
        self.store.put_project(project).await?;
        self.invalidate_fleet();
        Ok(())
    }

    pub async fn save_initiative(&self, initiative: &Initiative) -> Result<()> {
        self.store.put_initiative(initiative).await?;
        self.invalidate_fleet();
        Ok(())
    }

    /// Move a project through its lifecycle. Reactivating a project is not
    /// an admission and may leave workers above their ceiling.
    pub async fn set_project_state(&self, project_id: ProjectId, state: ProjectState) -> Result<()> {
        let previous = self
            .route()
            .run("set_project_state", move |store| async move {
                let mut project = store.get_project(project_id).await?;
                let previous = project.state;
                project.state = state;
                store.put_project(&project).await?;
                Ok(previous)
            })
            .await?;
        self.invalidate_fleet();

        info!(
            project_id = %project_id,
            from = previous.as_str(),
            to = state.as_str(),
            "Project state changed"
        );
        Ok(())
    }

    pub async fn set_initiative_state(
        &self,
        initiative_id: InitiativeId,
        state: InitiativeState,
    ) -> Result<()> {
        let previous = self
            .route()
            .run("set_initiative_state", move |store| async move {
                let mut initiative = store.get_initiative(initiative_id).await?;
                let previous = initiative.state;
                initiative.state = state;
                store.put_initiative(&initiative).await?;
                Ok(previous)
            })
            .await?;
        self.invalidate_fleet();

        info!(
            initiative_id = %initiative_id,
            from = previous.as_str(),
            to = state.as_str(),
            "Initiative state changed"
        );
        Ok(())
    }

    /// Create or replace a worker, including ceilings and active flag.
    ///
    /// Ceilings have no upper bound: one above 100% allows overtime. Lowering
    /// a ceiling is not an admission and may leave the worker overloaded.
    pub async fn update_worker(&self, worker: &Worker) -> Result<()> {
        let _guard = self.lock_worker(worker.id).await;
        self.store.put_worker(worker).await?;
        self.invalidate_worker(worker.id);

        debug!(worker_id = %worker.id, active = worker.active, "Worker updated");
        Ok(())
    }

    // =========================================================================
    // Dashboard reads
    // =========================================================================

    /// Cached snapshot for dashboards. May be up to one TTL old when a
    /// change bypassed this service.
    pub async fn workload(&self, worker_id: WorkerId) -> Result<WorkloadSnapshot> {
        let key = workload_key(worker_id);
        let entry = self
            .cache
            .wrap(&key, self.cache_ttl, &workload_tags(worker_id), move || async move {
                self.aggregator
                    .compute_snapshot(worker_id)
                    .await
                    .map(DashboardEntry::Workload)
            })
            .await?;

        match entry {
            DashboardEntry::Workload(snapshot) => Ok(snapshot),
            DashboardEntry::Fleet(_) => Err(unexpected_entry(&key)),
        }
    }

    /// Uncached snapshot straight from the source
    pub async fn live_workload(&self, worker_id: WorkerId) -> Result<WorkloadSnapshot> {
        self.aggregator.compute_snapshot(worker_id).await
    }

    /// Snapshots of all active workers. Workers removed between listing and
    /// computing are skipped.
    pub async fn fleet_overview(&self) -> Result<FleetOverview> {
        let entry = self
            .cache
            .wrap(FLEET_OVERVIEW_KEY, self.cache_ttl, &[FLEET_TAG], move || async move {
                self.compute_fleet_overview().await.map(DashboardEntry::Fleet)
            })
            .await?;

        match entry {
            DashboardEntry::Fleet(overview) => Ok(overview),
            DashboardEntry::Workload(_) => Err(unexpected_entry(FLEET_OVERVIEW_KEY)),
        }
    }

    async fn compute_fleet_overview(&self) -> Result<FleetOverview> {
        let workers = self.store.list_active_workers().await?;

        let mut snapshots = Vec::with_capacity(workers.len());
        for worker_id in workers {
            match self.workload(worker_id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) if e.is_not_found() => {
                    warn!(worker_id = %worker_id, error = %e, "Worker vanished during fleet overview");
                }
                Err(e) => return Err(e),
            }
        }
        snapshots.sort_by_key(|s| s.worker_id);

        let overloaded_count = snapshots.iter().filter(|s| s.is_overloaded).count();
        debug!(
            workers = snapshots.len(),
            overloaded = overloaded_count,
            "Computed fleet overview"
        );

        Ok(FleetOverview {
            worker_count: snapshots.len(),
            overloaded_count,
            snapshots,
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryStore;

    fn wid(raw: i64) -> WorkerId {
        WorkerId::new(raw).unwrap()
    }

    fn pid(raw: i64) -> ProjectId {
        ProjectId::new(raw).unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, WorkloadService) {
        let store = Arc::new(MemoryStore::new());
        store.put_worker(&Worker::new(wid(1), "Ada")).await.unwrap();
        for id in 1..=3 {
            store
                .put_project(&Project {
                    id: pid(id),
                    name: format!("project-{}", id),
                    state: ProjectState::Active,
                })
                .await
                .unwrap();
        }
        let service = WorkloadService::new(
            store.clone(),
            Arc::new(TaggedCache::new()),
            &EngineConfig::default(),
        );
        (store, service)
    }

    #[tokio::test]
    async fn test_rejected_assignment_writes_nothing() {
        let (store, service) = setup().await;
        service.assign_to_project(wid(1), pid(1), Percent::whole(60)).await.unwrap();

        let decision = service
            .assign_to_project(wid(1), pid(2), Percent::whole(50))
            .await
            .unwrap();
        assert!(!decision.can_admit);
        assert_eq!(decision.current_workload, Percent::whole(60));
        assert_eq!(decision.new_total_workload, Percent::whole(110));
        assert_eq!(decision.available_capacity, Percent::whole(40));
        assert_eq!(store.list_project_commitments(wid(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_assignment_conflicts() {
        let (_store, service) = setup().await;
        service.assign_to_project(wid(1), pid(1), Percent::whole(20)).await.unwrap();

        let err = service
            .assign_to_project(wid(1), pid(1), Percent::whole(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CapacityError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_excludes_current_value() {
        let (_store, service) = setup().await;
        service.assign_to_project(wid(1), pid(1), Percent::whole(70)).await.unwrap();
        service.assign_to_project(wid(1), pid(2), Percent::whole(30)).await.unwrap();

        let decision = service
            .update_involvement(wid(1), pid(1), Percent::whole(70))
            .await
            .unwrap();
        assert!(decision.can_admit);

        let decision = service
            .update_involvement(wid(1), pid(1), Percent::whole(71))
            .await
            .unwrap();
        assert!(!decision.can_admit);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cached_workload() {
        let (_store, service) = setup().await;
        assert_eq!(service.workload(wid(1)).await.unwrap().primary_total, Percent::ZERO);

        service.assign_to_project(wid(1), pid(1), Percent::whole(40)).await.unwrap();
        assert_eq!(
            service.workload(wid(1)).await.unwrap().primary_total,
            Percent::whole(40)
        );

        service.set_project_state(pid(1), ProjectState::OnHold).await.unwrap();
        assert_eq!(service.workload(wid(1)).await.unwrap().primary_total, Percent::ZERO);
    }

    #[tokio::test]
    async fn test_ceiling_above_full_time_is_accepted() {
        let (_store, service) = setup().await;
        let ada = Worker::new(wid(1), "Ada").with_ceilings(Percent::whole(120), Percent::whole(150));
        service.update_worker(&ada).await.unwrap();

        service.assign_to_project(wid(1), pid(1), Percent::whole(60)).await.unwrap();
        let decision = service
            .assign_to_project(wid(1), pid(2), Percent::whole(50))
            .await
            .unwrap();
        assert!(decision.can_admit);
        assert_eq!(decision.available_capacity, Percent::whole(60));

        let snapshot = service.workload(wid(1)).await.unwrap();
        assert_eq!(snapshot.primary_total, Percent::whole(110));
        assert!(!snapshot.is_overloaded);
    }

    #[tokio::test]
    async fn test_fleet_overview_counts_overloaded() {
        let (store, service) = setup().await;
        let mut bob = Worker::new(wid(2), "Bob");
        bob.primary_ceiling = Percent::whole(50);
        service.update_worker(&bob).await.unwrap();
        store
            .upsert_project_commitment(wid(2), pid(3), Percent::whole(80))
            .await
            .unwrap();

        let mut idle = Worker::new(wid(3), "Idle");
        idle.active = false;
        service.update_worker(&idle).await.unwrap();

        let overview = service.fleet_overview().await.unwrap();
        assert_eq!(overview.worker_count, 2);
        assert_eq!(overview.overloaded_count, 1);
        assert_eq!(overview.overloaded().next().map(|s| s.worker_id), Some(wid(2)));
    }
}
