//! Records owned by the storage layer
//!
//! The capacity engine only reads these; mutation happens through
//! [`CommitmentStore`](crate::source::CommitmentStore).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CapacityError, Result};
use crate::percent::Percent;

/// Default primary-pool ceiling (project work)
pub const DEFAULT_PRIMARY_CEILING: Percent = Percent::whole(100);

/// Default secondary-pool ceiling ("over & beyond" initiatives)
pub const DEFAULT_SECONDARY_CEILING: Percent = Percent::whole(20);

macro_rules! entity_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Identifiers are positive integers.
            pub fn new(raw: i64) -> Result<Self> {
                if raw <= 0 {
                    return Err(CapacityError::InvalidArgument(format!(
                        "{} id must be positive, got {}",
                        $label, raw
                    )));
                }
                Ok(Self(raw))
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = CapacityError;

            fn from_str(s: &str) -> Result<Self> {
                let raw = s.trim().parse::<i64>().map_err(|_| {
                    CapacityError::InvalidArgument(format!("malformed {} id: {:?}", $label, s))
                })?;
                Self::new(raw)
            }
        }
    };
}

entity_id!(WorkerId, "worker");
entity_id!(ProjectId, "project");
entity_id!(InitiativeId, "initiative");

// ============================================================================
// Worker
// ============================================================================

/// A worker and their configured capacity ceilings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    #[serde(default = "default_primary_ceiling")]
    pub primary_ceiling: Percent,
    #[serde(default = "default_secondary_ceiling")]
    pub secondary_ceiling: Percent,
    /// Inactive workers are skipped by fleet views and alerting
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_primary_ceiling() -> Percent {
    DEFAULT_PRIMARY_CEILING
}

fn default_secondary_ceiling() -> Percent {
    DEFAULT_SECONDARY_CEILING
}

fn default_true() -> bool {
    true
}

impl Worker {
    pub fn new(id: WorkerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            primary_ceiling: DEFAULT_PRIMARY_CEILING,
            secondary_ceiling: DEFAULT_SECONDARY_CEILING,
            active: true,
        }
    }

    pub fn with_ceilings(mut self, primary: Percent, secondary: Percent) -> Self {
        self.primary_ceiling = primary;
        self.secondary_ceiling = secondary;
        self
    }
}

// ============================================================================
// Projects & Initiatives
// ============================================================================

/// Project lifecycle; only `Active` projects count toward capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Planning,
    Active,
    OnHold,
    Completed,
    Cancelled,
}

impl ProjectState {
    pub fn is_active(self) -> bool {
        self == ProjectState::Active
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectState::Planning => "planning",
            ProjectState::Active => "active",
            ProjectState::OnHold => "on_hold",
            ProjectState::Completed => "completed",
            ProjectState::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ProjectState {
    type Err = CapacityError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "planning" => Ok(ProjectState::Planning),
            "active" => Ok(ProjectState::Active),
            "on_hold" => Ok(ProjectState::OnHold),
            "completed" => Ok(ProjectState::Completed),
            "cancelled" => Ok(ProjectState::Cancelled),
            other => Err(CapacityError::InvalidArgument(format!(
                "unknown project state: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub state: ProjectState,
}

/// Initiative lifecycle; only `Active` initiatives count toward capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiativeState {
    Proposed,
    Active,
    Completed,
    Cancelled,
}

impl InitiativeState {
    pub fn is_active(self) -> bool {
        self == InitiativeState::Active
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InitiativeState::Proposed => "proposed",
            InitiativeState::Active => "active",
            InitiativeState::Completed => "completed",
            InitiativeState::Cancelled => "cancelled",
        }
    }
}

impl FromStr for InitiativeState {
    type Err = CapacityError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "proposed" => Ok(InitiativeState::Proposed),
            "active" => Ok(InitiativeState::Active),
            "completed" => Ok(InitiativeState::Completed),
            "cancelled" => Ok(InitiativeState::Cancelled),
            other => Err(CapacityError::InvalidArgument(format!(
                "unknown initiative state: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiative {
    pub id: InitiativeId,
    pub title: String,
    pub state: InitiativeState,
}

// ============================================================================
// Commitments
// ============================================================================

/// A worker's involvement in one project (primary pool)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCommitment {
    pub worker_id: WorkerId,
    pub project_id: ProjectId,
    pub involvement: Percent,
    /// Derived from the project's lifecycle state at read time
    pub project_active: bool,
}

/// A worker's workload on one initiative (secondary pool)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeCommitment {
    pub worker_id: WorkerId,
    pub initiative_id: InitiativeId,
    pub workload: Percent,
    pub initiative_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_parsing() {
        assert_eq!("7".parse::<WorkerId>().unwrap().get(), 7);
        assert!(" 12 ".parse::<ProjectId>().is_ok());
        assert!(matches!(
            "abc".parse::<WorkerId>(),
            Err(CapacityError::InvalidArgument(_))
        ));
        assert!(matches!(WorkerId::new(0), Err(CapacityError::InvalidArgument(_))));
        assert!("-3".parse::<InitiativeId>().is_err());
    }

    #[test]
    fn test_worker_defaults() {
        let worker = Worker::new(WorkerId::new(1).unwrap(), "Ada");
        assert_eq!(worker.primary_ceiling, Percent::whole(100));
        assert_eq!(worker.secondary_ceiling, Percent::whole(20));
        assert!(worker.active);
    }

    #[test]
    fn test_worker_deserialize_defaults() {
        let worker: Worker = serde_json::from_str(r#"{"id": 4, "name": "Grace"}"#).unwrap();
        assert_eq!(worker.primary_ceiling, DEFAULT_PRIMARY_CEILING);
        assert_eq!(worker.secondary_ceiling, DEFAULT_SECONDARY_CEILING);
        assert!(worker.active);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ProjectState::Planning,
            ProjectState::Active,
            ProjectState::OnHold,
            ProjectState::Completed,
            ProjectState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<ProjectState>().unwrap(), state);
        }
        assert!(ProjectState::Active.is_active());
        assert!(!InitiativeState::Proposed.is_active());
        assert!("paused".parse::<InitiativeState>().is_err());
    }
}
