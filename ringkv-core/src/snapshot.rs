//! # Snapshot
//!
//! The only wire-visible surface of the core: a JSON document consumed by
//! external inspector/tooling, versioned and owned externally.
//!
//! Built on `serde`/`serde_json`, reused here for a point-in-time aggregate
//! view instead of a per-message wire codec.

use serde::Serialize;

/// Aggregate, point-in-time view over a cache's shards.
///
/// Exact schema versioning is the consumer's responsibility; this struct is
/// intentionally minimal.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Total live (non-TEST) entries across all shards.
    pub items: u64,
    /// Total weight currently charged against capacity, summed over shards.
    pub arena_bytes: i64,
    pub hits_total: u64,
    pub misses_total: u64,
    pub evictions_total: u64,
    /// Total generation-ring rotations observed, included as a useful
    /// operational signal beyond the documented minimum field set.
    pub rotations_total: u64,
    pub shard_count: usize,
}
