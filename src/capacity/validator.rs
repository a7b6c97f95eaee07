//! Admission checks for new and revised commitments
//!
//! Always evaluated against live source data. Callers must never feed this
//! from the dashboard cache: a stale "capacity available" answer admits
//! over-allocation that nothing downstream corrects.
//!
//! The validator only advises. Serializing the check with the write that
//! follows it is the job of [`WorkloadService`](crate::service::WorkloadService).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::aggregator::HIGH_INVOLVEMENT_THRESHOLD;
use crate::error::Result;
use crate::model::{InitiativeId, ProjectId, WorkerId};
use crate::percent::Percent;
use crate::source::AllocationSource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionWarning {
    HighInvolvement { proposed: Percent },
    ExceedsCapacity { new_total: Percent, ceiling: Percent },
}

impl fmt::Display for AdmissionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionWarning::HighInvolvement { proposed } => {
                write!(f, "High involvement: {} on a single commitment", proposed)
            }
            AdmissionWarning::ExceedsCapacity { new_total, ceiling } => {
                write!(f, "Would exceed capacity: {} > {}", new_total, ceiling)
            }
        }
    }
}

/// Advisory result of an admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub can_admit: bool,
    /// Current total, excluding the commitment being revised
    pub current_workload: Percent,
    pub new_total_workload: Percent,
    pub available_capacity: Percent,
    pub warnings: Vec<AdmissionWarning>,
}

/// Pure admission rule: admit while `current + proposed <= ceiling`.
pub fn decide(current: Percent, proposed: Percent, ceiling: Percent) -> AdmissionDecision {
    let new_total = current + proposed;
    let can_admit = new_total <= ceiling;

    let mut warnings = Vec::new();
    if proposed > HIGH_INVOLVEMENT_THRESHOLD {
        warnings.push(AdmissionWarning::HighInvolvement { proposed });
    }
    if !can_admit {
        warnings.push(AdmissionWarning::ExceedsCapacity { new_total, ceiling });
    }

    AdmissionDecision {
        can_admit,
        current_workload: current,
        new_total_workload: new_total,
        available_capacity: ceiling.saturating_sub(current),
        warnings,
    }
}

#[derive(Clone)]
pub struct AssignmentValidator {
    source: Arc<dyn AllocationSource>,
}

impl AssignmentValidator {
    pub fn new(source: Arc<dyn AllocationSource>) -> Self {
        Self { source }
    }

    /// Check a proposed project involvement against the primary ceiling.
    ///
    /// `exclude_project` names the commitment being revised so its current
    /// value is not counted twice.
    pub async fn validate(
        &self,
        worker_id: WorkerId,
        proposed: Percent,
        exclude_project: Option<ProjectId>,
    ) -> Result<AdmissionDecision> {
        Self::check_project(self.source.as_ref(), worker_id, proposed, exclude_project).await
    }

    /// Secondary-pool counterpart of [`validate`](Self::validate).
    pub async fn validate_initiative(
        &self,
        worker_id: WorkerId,
        proposed: Percent,
        exclude_initiative: Option<InitiativeId>,
    ) -> Result<AdmissionDecision> {
        Self::check_initiative(self.source.as_ref(), worker_id, proposed, exclude_initiative).await
    }

    /// [`validate`](Self::validate) against an explicit source, for callers
    /// that must read from the same backend they are about to write to.
    pub async fn check_project<S>(
        source: &S,
        worker_id: WorkerId,
        proposed: Percent,
        exclude_project: Option<ProjectId>,
    ) -> Result<AdmissionDecision>
    where
        S: AllocationSource + ?Sized,
    {
        let subject = format!("worker {}", worker_id);
        proposed
            .ensure_commitment()
            .map_err(|e| e.context("validate", &subject))?;

        let worker = source
            .get_worker(worker_id)
            .await
            .map_err(|e| e.context("validate", &subject))?;
        let current: Percent = source
            .list_active_project_commitments(worker_id)
            .await
            .map_err(|e| e.context("validate", &subject))?
            .iter()
            .filter(|c| Some(c.project_id) != exclude_project)
            .map(|c| c.involvement)
            .sum();

        let decision = decide(current, proposed, worker.primary_ceiling);
        debug!(
            worker_id = %worker_id,
            current = %current,
            proposed = %proposed,
            excluded = ?exclude_project.map(|p| p.get()),
            can_admit = decision.can_admit,
            "Validated project admission"
        );
        Ok(decision)
    }

    pub async fn check_initiative<S>(
        source: &S,
        worker_id: WorkerId,
        proposed: Percent,
        exclude_initiative: Option<InitiativeId>,
    ) -> Result<AdmissionDecision>
    where
        S: AllocationSource + ?Sized,
    {
        let subject = format!("worker {}", worker_id);
        proposed
            .ensure_commitment()
            .map_err(|e| e.context("validate_initiative", &subject))?;

        let worker = source
            .get_worker(worker_id)
            .await
            .map_err(|e| e.context("validate_initiative", &subject))?;
        let current: Percent = source
            .list_active_initiative_commitments(worker_id)
            .await
            .map_err(|e| e.context("validate_initiative", &subject))?
            .iter()
            .filter(|c| Some(c.initiative_id) != exclude_initiative)
            .map(|c| c.workload)
            .sum();

        let decision = decide(current, proposed, worker.secondary_ceiling);
        debug!(
            worker_id = %worker_id,
            current = %current,
            proposed = %proposed,
            can_admit = decision.can_admit,
            "Validated initiative admission"
        );
        Ok(decision)
    }
}
