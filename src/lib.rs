//! Capacity Engine - workload capacity for a project/workforce backend
//!
//! Aggregates how much of each worker's time is committed across project
//! assignments (primary pool) and "over & beyond" initiatives (secondary
//! pool), decides whether a new commitment fits under the worker's ceilings,
//! and serves aggregates cheaply to dashboards and periodic alerting.
//!
//! ## Components
//!
//! - **Source**: storage backends (SQLite, in-memory/JSON fallback, failover)
//! - **Capacity**: snapshot aggregation and admission decisions
//! - **Cache**: tagged TTL cache for dashboard reads
//! - **Service**: serialized mutations with cache invalidation
//! - **Alerts**: periodic overload detection

pub mod alerts;
pub mod cache;
pub mod capacity;
pub mod config;
pub mod error;
pub mod model;
pub mod percent;
pub mod service;
pub mod source;

pub use alerts::{AlertCondition, CapacityAlert, CapacityAlertEvaluator};
pub use cache::TaggedCache;
pub use capacity::{AdmissionDecision, AssignmentValidator, CapacityAggregator, WorkloadSnapshot};
pub use config::{Args, EngineConfig};
pub use error::{CapacityError, Result};
pub use percent::Percent;
pub use service::{DashboardEntry, FleetOverview, WorkloadService};
