//! # Cache Facade
//!
//! The public entry point: shard selection, lifecycle, and the background
//! rotation scheduler.
//!
//! Power-of-two shard normalization and a single background task driving
//! periodic housekeeping across all shards, generalized from one OS thread
//! per engine to a single `tokio` task that round-robins shards rather than
//! spawning one task per shard: a task per cache, not per shard.

use std::future::Future;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;

use ringkv_common::{CacheError, CacheResult};

use crate::loader::{Context, LoaderCoordinator};
use crate::options::{CacheOptions, EjectReason};
use crate::shard::{EjectRecord, Shard};
use crate::snapshot::Snapshot;

/// In-process key/value cache: sharded index, generational arenas,
/// CLOCK-Pro replacement, and a singleflight loader coordinator.
pub struct Cache<K, V> {
    shards: Arc<Vec<Shard<K, V>>>,
    loader: Arc<LoaderCoordinator<K, V>>,
    options: CacheOptions<K, V>,
    shard_selector: RandomState,
    closed: Arc<AtomicBool>,
    rotation_task: Option<tokio::task::JoinHandle<()>>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Constructs a cache with `cap_bytes` total weight budget, split
    /// evenly across `shards` shards, a TTL driving the background
    /// generation-rotation cadence, and the given options.
    ///
    /// Validates `cap_bytes > 0`, `ttl > 0`, and `shards > 0` and a power of
    /// two; returns a typed error otherwise with no partial state retained.
    pub fn new(
        cap_bytes: i64,
        ttl: Duration,
        shards: u8,
        options: CacheOptions<K, V>,
    ) -> CacheResult<Self> {
        if cap_bytes <= 0 {
            return Err(CacheError::InvalidCapacity);
        }
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        if shards == 0 || !shards.is_power_of_two() {
            return Err(CacheError::InvalidShardCount);
        }

        let shard_count = shards as usize;
        let per_shard_cap = cap_bytes / shard_count as i64;
        let mut shard_vec = Vec::with_capacity(shard_count);
        for i in 0..shard_count {
            let seed = 0x9E37_79B9_u64.wrapping_mul(i as u64 + 1);
            shard_vec.push(Shard::new(
                per_shard_cap,
                options.generations,
                seed,
                options.logger.clone(),
            ));
        }
        let shards = Arc::new(shard_vec);
        let closed = Arc::new(AtomicBool::new(false));

        let tick = (ttl / options.generations as u32).max(Duration::from_millis(1));
        let rotation_task = Some(tokio::spawn(Self::run_rotation_scheduler(
            shards.clone(),
            tick,
            closed.clone(),
            options.metrics.clone(),
            options.eject_callback.clone(),
        )));

        Ok(Cache {
            shards,
            loader: Arc::new(LoaderCoordinator::new()),
            options,
            shard_selector: RandomState::new(),
            closed,
            rotation_task,
        })
    }

    async fn run_rotation_scheduler(
        shards: Arc<Vec<Shard<K, V>>>,
        tick: Duration,
        closed: Arc<AtomicBool>,
        metrics: Arc<dyn crate::metrics::MetricsSink>,
        eject_callback: Option<crate::options::EjectCallback<K, V>>,
    ) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut next_shard = 0usize;
        loop {
            interval.tick().await;
            if closed.load(Ordering::Acquire) {
                return;
            }
            if shards.is_empty() {
                return;
            }
            let idx = next_shard % shards.len();
            let evicted = shards[idx].rotate();
            metrics.inc_rotation(idx);
            metrics.set_arena_bytes(idx, shards[idx].size_bytes());
            Self::deliver(evicted, idx, &metrics, &eject_callback);
            next_shard = (next_shard + 1) % shards.len();
        }
    }

    fn deliver(
        evicted: Vec<EjectRecord<K, V>>,
        shard_idx: usize,
        metrics: &Arc<dyn crate::metrics::MetricsSink>,
        eject_callback: &Option<crate::options::EjectCallback<K, V>>,
    ) {
        for (key, value, reason) in evicted {
            if reason == EjectReason::Capacity {
                metrics.inc_evict(shard_idx);
            }
            if let Some(callback) = eject_callback {
                callback(key, value, reason);
            }
        }
    }

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = self.shard_selector.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.shards.len() - 1)
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    /// Looks up `key`. Returns `Ok(None)` on a miss; never allocates on the
    /// hot path beyond the value copy itself.
    pub fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.ensure_open()?;
        let idx = self.shard_index(key);
        let result = self.shards[idx].get(key);
        match &result {
            Some(_) => self.options.metrics.inc_hit(idx),
            None => self.options.metrics.inc_miss(idx),
        }
        Ok(result)
    }

    /// Inserts or updates `key`. The value's weight is derived from the
    /// configured weight function and clamped to at least 1.
    pub fn put(&self, key: K, value: V) -> CacheResult<()> {
        self.ensure_open()?;
        let weight = ((self.options.weight_fn)(&value)).max(1) as u32;
        let idx = self.shard_index(&key);
        let before = self.shards[idx].size_bytes();
        let evicted = self.shards[idx].put(key, value, weight);
        let delta = self.shards[idx].size_bytes() - before;
        if delta != 0 {
            self.options.metrics.add_arena_bytes(idx, delta);
        }
        Self::deliver(evicted, idx, &self.options.metrics, &self.options.eject_callback);
        Ok(())
    }

    /// Removes `key`, returning whether it was present. The underlying
    /// arena memory is not reclaimed until its generation rotates out.
    pub fn delete(&self, key: &K) -> CacheResult<bool> {
        self.ensure_open()?;
        let idx = self.shard_index(key);
        let before = self.shards[idx].size_bytes();
        let removed = self.shards[idx].delete(key);
        let delta = self.shards[idx].size_bytes() - before;
        if delta != 0 {
            self.options.metrics.add_arena_bytes(idx, delta);
        }
        Ok(removed)
    }

    /// Returns the cached value for `key`, loading it via `loader` on a
    /// miss. Concurrent callers for the same key share one execution of
    /// `loader`. Cancelling `ctx` returns `CacheError::Cancelled` to this
    /// call only; the loader keeps running for every other waiter on the
    /// same key. Must be called from a multi-threaded `tokio` runtime; see
    /// [`LoaderCoordinator::load`].
    pub fn get_or_load<F>(&self, ctx: &Context, key: K, loader: F) -> CacheResult<V>
    where
        F: FnOnce(Context) -> CacheResult<V> + Send + 'static,
    {
        self.ensure_open()?;
        if let Some(value) = self.get(&key)? {
            return Ok(value);
        }
        let (value, shared) = self.loader.load(ctx, key.clone(), loader)?;
        if !shared {
            // Only the caller that initiated the loader stores the result;
            // followers would otherwise all re-insert the same value and
            // needlessly churn CLOCK-Pro.
            self.put(key, value.clone())?;
        }
        Ok(value)
    }

    /// Async counterpart of [`Cache::get_or_load`].
    pub async fn get_or_load_async<F, Fut>(&self, ctx: &Context, key: K, loader: F) -> CacheResult<V>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        self.ensure_open()?;
        if let Some(value) = self.get(&key)? {
            return Ok(value);
        }
        let (value, shared) = self.loader.load_async(ctx, key.clone(), loader).await?;
        if !shared {
            self.put(key, value.clone())?;
        }
        Ok(value)
    }

    /// Total live (non-TEST) entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weight currently charged against capacity across all shards.
    pub fn size_bytes(&self) -> i64 {
        self.shards.iter().map(|s| s.size_bytes()).sum()
    }

    /// A point-in-time aggregate view for external inspector tooling.
    pub fn snapshot(&self) -> Snapshot {
        let mut hits = 0;
        let mut misses = 0;
        let mut evictions = 0;
        let mut rotations = 0;
        let mut arena_bytes = 0;
        let mut items = 0;
        for shard in self.shards.iter() {
            hits += shard.hits();
            misses += shard.misses();
            evictions += shard.evictions();
            rotations += shard.rotations();
            arena_bytes += shard.size_bytes();
            items += shard.len() as u64;
        }
        Snapshot {
            items,
            arena_bytes,
            hits_total: hits,
            misses_total: misses,
            evictions_total: evictions,
            rotations_total: rotations,
            shard_count: self.shards.len(),
        }
    }

    /// Marks the cache closed, joins the background rotation task, then
    /// frees every shard's arenas and drops all entry metadata. Subsequent
    /// `get`/`put`/`delete`/`get_or_load` calls return `CacheError::Closed`.
    pub async fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.rotation_task.take() {
            let _ = handle.await;
        }
        for shard in self.shards.iter() {
            shard.close();
        }
    }
}

impl<K, V> Drop for Cache<K, V> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.rotation_task.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CacheOptions;

    fn opts() -> CacheOptions<String, String> {
        CacheOptions::new().with_generations(2)
    }

    #[tokio::test]
    async fn new_rejects_invalid_capacity() {
        let result = Cache::<String, String>::new(0, Duration::from_secs(1), 4, opts());
        assert_eq!(result.err(), Some(CacheError::InvalidCapacity));
    }

    #[tokio::test]
    async fn new_rejects_invalid_ttl() {
        let result = Cache::<String, String>::new(1024, Duration::ZERO, 4, opts());
        assert_eq!(result.err(), Some(CacheError::InvalidTtl));
    }

    #[tokio::test]
    async fn new_rejects_non_power_of_two_shards() {
        let result = Cache::<String, String>::new(1024, Duration::from_secs(1), 3, opts());
        assert_eq!(result.err(), Some(CacheError::InvalidShardCount));
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = Cache::<String, String>::new(4096, Duration::from_secs(60), 4, opts()).unwrap();
        cache.put("a".to_string(), "1".to_string()).unwrap();
        assert_eq!(cache.get(&"a".to_string()).unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn closed_cache_rejects_operations() {
        let mut cache =
            Cache::<String, String>::new(4096, Duration::from_secs(60), 4, opts()).unwrap();
        cache.close().await;
        assert_eq!(
            cache.get(&"a".to_string()).err(),
            Some(CacheError::Closed)
        );
    }

    #[tokio::test]
    async fn close_frees_shard_arenas_and_metadata() {
        let mut cache =
            Cache::<String, String>::new(4096, Duration::from_secs(60), 4, opts()).unwrap();
        cache.put("a".to_string(), "1".to_string()).unwrap();
        assert_eq!(cache.len(), 1);
        cache.close().await;
        for shard in cache.shards.iter() {
            assert_eq!(shard.len(), 0);
            assert_eq!(shard.size_bytes(), 0);
        }
    }

    #[tokio::test]
    async fn get_or_load_populates_the_cache_on_a_miss() {
        let cache = Cache::<String, u32>::new(
            4096,
            Duration::from_secs(60),
            4,
            CacheOptions::new().with_generations(2),
        )
        .unwrap();
        let value = cache
            .get_or_load_async(&Context::new(), "k".to_string(), |_ctx| async { Ok(99u32) })
            .await
            .unwrap();
        assert_eq!(value, 99);
        assert_eq!(cache.get(&"k".to_string()).unwrap(), Some(99));
    }
}
