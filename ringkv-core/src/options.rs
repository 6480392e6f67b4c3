//! # Options
//!
//! Construction-time configuration surface: metrics sink, slow-path
//! logger, weight function, and eject callback.

use std::sync::Arc;

use crate::metrics::{MetricsSink, NoopMetrics};

/// Why an entry was ejected; passed to the user's eject callback.
///
/// TTL expirations do not invoke the callback on their own: only
/// capacity-driven CLOCK-Pro evictions and generation-freed transitions do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EjectReason {
    /// CLOCK-Pro displaced the entry under capacity pressure.
    Capacity,
    /// The generation holding the entry's value was freed by rotation.
    Generation,
}

/// User hook invoked on capacity- or generation-driven evictions.
///
/// Must not block and must not re-enter the cache; fired outside any shard
/// lock.
pub type EjectCallback<K, V> = Arc<dyn Fn(K, V, EjectReason) + Send + Sync>;

/// User-supplied cost function. Default is `1` per value; a real
/// deployment typically approximates `size_of_val`.
pub type WeightFn<V> = Arc<dyn Fn(&V) -> i64 + Send + Sync>;

/// Slow-path logging hook: invoked only on the internal-invariant-violation
/// recovery path and on loader failures, never from the hot get/put path.
/// Unrelated to the ambient
/// `tracing` instrumentation threaded through the rest of the core, which
/// always runs regardless of this option.
pub trait SlowPathLog: Send + Sync {
    fn warn(&self, message: &str);
}

/// Default: drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLog;

impl SlowPathLog for NoopLog {
    fn warn(&self, _message: &str) {}
}

/// Forwards slow-path warnings to `tracing::warn!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl SlowPathLog for TracingLog {
    fn warn(&self, message: &str) {
        tracing::warn!(target: "ringkv_core::slow_path", "{message}");
    }
}

/// Builder for [`crate::cache::Cache`] construction options.
pub struct CacheOptions<K, V> {
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) logger: Arc<dyn SlowPathLog>,
    pub(crate) weight_fn: WeightFn<V>,
    pub(crate) eject_callback: Option<EjectCallback<K, V>>,
    pub(crate) generations: usize,
}

impl<K, V> Default for CacheOptions<K, V> {
    fn default() -> Self {
        CacheOptions {
            metrics: Arc::new(NoopMetrics),
            logger: Arc::new(TracingLog),
            weight_fn: Arc::new(|_: &V| 1),
            eject_callback: None,
            generations: 4,
        }
    }
}

impl<K, V> CacheOptions<K, V> {
    /// Creates the default option set: no-op metrics, `tracing`-backed
    /// slow-path logging, weight 1 per value, no eject callback, 4
    /// generations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an external counter/gauge sink.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Attaches a slow-path logger. Default forwards to `tracing`; pass
    /// [`NoopLog`] to silence it entirely.
    pub fn with_logger(mut self, logger: Arc<dyn SlowPathLog>) -> Self {
        self.logger = logger;
        self
    }

    /// Sets a custom per-value cost function. Values below 1 are clamped
    /// up to 1.
    pub fn with_weight_fn(mut self, weight_fn: WeightFn<V>) -> Self {
        self.weight_fn = weight_fn;
        self
    }

    /// Registers a callback invoked on capacity- or generation-driven
    /// evictions only (never on TTL-style generation expiry that
    /// coincides with no entries, and never for ghost-to-removed
    /// transitions).
    pub fn with_eject_callback(mut self, callback: EjectCallback<K, V>) -> Self {
        self.eject_callback = Some(callback);
        self
    }

    /// Overrides the ring's generation count, a tuning parameter valid for
    /// any value `>= 2`. Values below 2 are clamped up to 2.
    pub fn with_generations(mut self, generations: usize) -> Self {
        self.generations = generations.max(2);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weight_fn_is_one() {
        let opts: CacheOptions<String, String> = CacheOptions::new();
        assert_eq!((opts.weight_fn)(&"hello".to_string()), 1);
    }

    #[test]
    fn generations_clamped_to_two() {
        let opts: CacheOptions<String, String> = CacheOptions::new().with_generations(1);
        assert_eq!(opts.generations, 2);
    }
}
