//! Workload aggregation
//!
//! One implementation over [`AllocationSource`]; backends only supply rows.
//! [`summarize`] is the pure core and is what makes snapshots identical
//! across backends: commitments are filtered to active ones and ordered by
//! id before anything is summed or warned about.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::model::{InitiativeCommitment, ProjectCommitment, ProjectId, Worker, WorkerId};
use crate::percent::Percent;
use crate::source::AllocationSource;

/// Single-project involvement above this raises a warning
pub const HIGH_INVOLVEMENT_THRESHOLD: Percent = Percent::whole(50);

/// Informational findings attached to a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadWarning {
    HighProjectInvolvement {
        project_id: ProjectId,
        involvement: Percent,
    },
    /// Combined primary + secondary load is above the primary ceiling
    PrimaryOverload {
        combined_total: Percent,
        ceiling: Percent,
    },
    SecondaryOverload {
        secondary_total: Percent,
        ceiling: Percent,
    },
}

impl fmt::Display for WorkloadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadWarning::HighProjectInvolvement { project_id, involvement } => write!(
                f,
                "High single-project involvement: {} on project {}",
                involvement, project_id
            ),
            WorkloadWarning::PrimaryOverload { combined_total, ceiling } => write!(
                f,
                "Overloaded: combined workload {} exceeds capacity {}",
                combined_total, ceiling
            ),
            WorkloadWarning::SecondaryOverload { secondary_total, ceiling } => write!(
                f,
                "Over & beyond workload {} exceeds limit {}",
                secondary_total, ceiling
            ),
        }
    }
}

/// Point-in-time aggregate of a worker's commitments. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSnapshot {
    pub worker_id: WorkerId,
    pub primary_total: Percent,
    pub secondary_total: Percent,
    pub combined_total: Percent,
    pub primary_available: Percent,
    pub secondary_available: Percent,
    pub is_overloaded: bool,
    pub warnings: Vec<WorkloadWarning>,
    pub computed_at: DateTime<Utc>,
}

impl WorkloadSnapshot {
    /// Equality ignoring `computed_at`
    pub fn same_aggregate(&self, other: &WorkloadSnapshot) -> bool {
        self.worker_id == other.worker_id
            && self.primary_total == other.primary_total
            && self.secondary_total == other.secondary_total
            && self.combined_total == other.combined_total
            && self.primary_available == other.primary_available
            && self.secondary_available == other.secondary_available
            && self.is_overloaded == other.is_overloaded
            && self.warnings == other.warnings
    }

    pub fn exceeds_secondary(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, WorkloadWarning::SecondaryOverload { .. }))
    }
}

/// Aggregate commitment rows for one worker.
pub fn summarize(
    worker: &Worker,
    projects: &[ProjectCommitment],
    initiatives: &[InitiativeCommitment],
    computed_at: DateTime<Utc>,
) -> WorkloadSnapshot {
    let mut active_projects: Vec<&ProjectCommitment> =
        projects.iter().filter(|c| c.project_active).collect();
    active_projects.sort_by_key(|c| c.project_id);

    let primary_total: Percent = active_projects.iter().map(|c| c.involvement).sum();
    let secondary_total: Percent = initiatives
        .iter()
        .filter(|c| c.initiative_active)
        .map(|c| c.workload)
        .sum();
    let combined_total = primary_total + secondary_total;

    let mut warnings: Vec<WorkloadWarning> = active_projects
        .iter()
        .filter(|c| c.involvement > HIGH_INVOLVEMENT_THRESHOLD)
        .map(|c| WorkloadWarning::HighProjectInvolvement {
            project_id: c.project_id,
            involvement: c.involvement,
        })
        .collect();

    if combined_total > worker.primary_ceiling {
        warnings.push(WorkloadWarning::PrimaryOverload {
            combined_total,
            ceiling: worker.primary_ceiling,
        });
    }
    if secondary_total > worker.secondary_ceiling {
        warnings.push(WorkloadWarning::SecondaryOverload {
            secondary_total,
            ceiling: worker.secondary_ceiling,
        });
    }

    WorkloadSnapshot {
        worker_id: worker.id,
        primary_total,
        secondary_total,
        combined_total,
        primary_available: worker.primary_ceiling.saturating_sub(primary_total),
        secondary_available: worker.secondary_ceiling.saturating_sub(secondary_total),
        is_overloaded: primary_total > worker.primary_ceiling
            || secondary_total > worker.secondary_ceiling,
        warnings,
        computed_at,
    }
}

/// Computes snapshots from live source data. Side-effect free.
#[derive(Clone)]
pub struct CapacityAggregator {
    source: Arc<dyn AllocationSource>,
}

impl CapacityAggregator {
    pub fn new(source: Arc<dyn AllocationSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn AllocationSource> {
        &self.source
    }

    /// Fails with `NotFound` if the worker does not exist.
    pub async fn compute_snapshot(&self, worker_id: WorkerId) -> Result<WorkloadSnapshot> {
        let subject = format!("worker {}", worker_id);

        let worker = self
            .source
            .get_worker(worker_id)
            .await
            .map_err(|e| e.context("compute_snapshot", &subject))?;
        let projects = self
            .source
            .list_project_commitments(worker_id)
            .await
            .map_err(|e| e.context("compute_snapshot", &subject))?;
        let initiatives = self
            .source
            .list_initiative_commitments(worker_id)
            .await
            .map_err(|e| e.context("compute_snapshot", &subject))?;

        let snapshot = summarize(&worker, &projects, &initiatives, Utc::now());

        debug!(
            worker_id = %worker_id,
            backend = self.source.backend_name(),
            primary = %snapshot.primary_total,
            secondary = %snapshot.secondary_total,
            overloaded = snapshot.is_overloaded,
            "Computed workload snapshot"
        );
        Ok(snapshot)
    }
}
