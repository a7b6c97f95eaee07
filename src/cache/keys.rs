//! Cache key and tag naming
//!
//! Every dashboard value carries the `fleet` tag, so lifecycle changes to a
//! project or initiative (which can move any worker's totals) invalidate by
//! `fleet` alone. Commitment changes invalidate the worker's own tag plus
//! `fleet`.

use crate::model::WorkerId;

pub const FLEET_TAG: &str = "fleet";
pub const FLEET_OVERVIEW_KEY: &str = "fleet:overview";

pub fn worker_tag(worker_id: WorkerId) -> String {
    format!("worker:{}", worker_id)
}

pub fn workload_key(worker_id: WorkerId) -> String {
    format!("workload:{}", worker_id)
}

/// Tags for a worker's cached snapshot
pub fn workload_tags(worker_id: WorkerId) -> [String; 2] {
    [worker_tag(worker_id), FLEET_TAG.to_string()]
}
