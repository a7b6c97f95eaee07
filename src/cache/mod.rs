//! Dashboard caching
//!
//! - [`TaggedCache`] - generic TTL cache with tag invalidation and coalescing
//! - [`keys`] - key and tag names used by the workload service

pub mod keys;
pub mod tagged;

pub use tagged::{CacheStats, CacheStatsSnapshot, CacheSweeper, TaggedCache};
