//! Capacity computation
//!
//! - [`CapacityAggregator`] - workload snapshots over an allocation source
//! - [`AssignmentValidator`] - admission decisions against live data

pub mod aggregator;
pub mod validator;

pub use aggregator::{
    summarize, CapacityAggregator, WorkloadSnapshot, WorkloadWarning,
    HIGH_INVOLVEMENT_THRESHOLD,
};
pub use validator::{decide, AdmissionDecision, AdmissionWarning, AssignmentValidator};
