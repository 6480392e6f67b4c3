//! # Metrics Sink
//!
//! The counter/gauge interface the core calls from its hot paths. The
//! backend (Prometheus, statsd, whatever) is an external collaborator;
//! this module only defines the interface plus a no-op default.
//!
//! Shaped as a concurrency-safe counter sink: atomic counters under
//! `Ordering::Relaxed`, read out as a point-in-time snapshot.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters and gauges the cache core updates from its hot paths.
///
/// Implementations must be safe for concurrent invocation: every method may
/// be called from any shard's lock-free or lock-held hot path at once.
pub trait MetricsSink: Send + Sync {
    /// A `get` found a live, non-expired entry.
    fn inc_hit(&self, shard: usize);
    /// A `get` found nothing (or an expired/TEST entry).
    fn inc_miss(&self, shard: usize);
    /// CLOCK-Pro evicted an entry for capacity.
    fn inc_evict(&self, shard: usize);
    /// A shard's generation ring rotated.
    fn inc_rotation(&self, shard: usize);
    /// Arena byte usage changed by `delta` (may be negative).
    fn add_arena_bytes(&self, shard: usize, delta: i64);
    /// Arena byte usage is now exactly `value`.
    fn set_arena_bytes(&self, shard: usize, value: i64);
}

/// Default metrics sink: every call is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_hit(&self, _shard: usize) {}
    fn inc_miss(&self, _shard: usize) {}
    fn inc_evict(&self, _shard: usize) {}
    fn inc_rotation(&self, _shard: usize) {}
    fn add_arena_bytes(&self, _shard: usize, _delta: i64) {}
    fn set_arena_bytes(&self, _shard: usize, _value: i64) {}
}

/// A simple in-process counter sink, useful for tests and for embedding
/// behind a real exporter without re-deriving the atomics every time.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rotations: AtomicU64,
    arena_bytes: AtomicI64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    pub fn arena_bytes(&self) -> i64 {
        self.arena_bytes.load(Ordering::Relaxed)
    }
}

impl MetricsSink for CountingMetrics {
    fn inc_hit(&self, _shard: usize) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_miss(&self, _shard: usize) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_evict(&self, _shard: usize) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_rotation(&self, _shard: usize) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    fn add_arena_bytes(&self, _shard: usize, delta: i64) {
        self.arena_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    fn set_arena_bytes(&self, _shard: usize, value: i64) {
        self.arena_bytes.store(value, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_metrics_accumulate() {
        let m = CountingMetrics::new();
        m.inc_hit(0);
        m.inc_hit(0);
        m.inc_miss(0);
        m.add_arena_bytes(0, 100);
        m.add_arena_bytes(0, -20);
        assert_eq!(m.hits(), 2);
        assert_eq!(m.misses(), 1);
        assert_eq!(m.arena_bytes(), 80);
    }

    #[test]
    fn noop_metrics_does_nothing_observable() {
        let m = NoopMetrics;
        m.inc_hit(0);
        m.inc_miss(0);
        m.inc_evict(0);
        m.inc_rotation(0);
        m.add_arena_bytes(0, 10);
        m.set_arena_bytes(0, 10);
    }
}
