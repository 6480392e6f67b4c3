//! In-process key/value cache built from bulk-freeable generational arenas
//! and a per-shard CLOCK-Pro replacement policy.
//!
//! See [`Cache`] for the public entry point.

pub mod arena;
pub mod cache;
pub mod clock;
pub mod entry;
pub mod generation;
pub mod loader;
pub mod metrics;
pub mod options;
pub mod shard;
pub mod snapshot;

pub use cache::Cache;
pub use loader::Context;
pub use metrics::{CountingMetrics, MetricsSink, NoopMetrics};
pub use options::{CacheOptions, EjectCallback, EjectReason, NoopLog, SlowPathLog, TracingLog, WeightFn};
pub use snapshot::Snapshot;

pub use ringkv_common::{CacheError, CacheResult};
