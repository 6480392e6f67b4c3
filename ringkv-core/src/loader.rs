//! # Loader Coordinator
//!
//! At-most-one concurrent load per key (singleflight), with both sync and
//! async delivery and caller-scoped cancellation.
//!
//! `tokio::sync` primitives are the idiomatic async-Rust way to fan a
//! single execution out to many waiters. The first caller for a given key
//! becomes that key's initiator: its loader runs as its own spawned task,
//! decoupled from the initiator's own call, so every caller (initiator
//! included) waits on the load the same way a follower would and can cancel
//! its own wait without affecting anyone else's.

use std::future::Future;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::hash_map::Entry as MapEntry;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use ringkv_common::{CacheError, CacheResult};

/// Caller-supplied cancellation handle for a single [`crate::cache::Cache::get_or_load`]
/// call. Cancelling one caller's context returns `CacheError::Cancelled` to
/// that caller only; the loader keeps running to completion and every other
/// waiter on the same key still receives its result.
pub struct Context {
    tx: Arc<watch::Sender<bool>>,
}

impl Context {
    /// Creates a fresh, not-yet-cancelled context.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Context { tx: Arc::new(tx) }
    }

    /// Requests cancellation. Idempotent; safe to call after the associated
    /// call has already finished.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once this context is cancelled. A fresh subscription is
    /// taken on every call, so a cancellation that raced ahead of the
    /// subscription is still observed rather than missed.
    async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Context { tx: self.tx.clone() }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

struct Flight<V> {
    sender: broadcast::Sender<Result<V, String>>,
}

type FlightMap<K, V> = Mutex<HashMap<K, Flight<V>, RandomState>>;

/// De-duplicates concurrent loads for the same key. One instance is shared
/// by all shards of a [`crate::cache::Cache`].
pub struct LoaderCoordinator<K, V> {
    in_flight: Arc<FlightMap<K, V>>,
}

impl<K, V> LoaderCoordinator<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        LoaderCoordinator {
            in_flight: Arc::new(Mutex::new(HashMap::with_hasher(RandomState::new()))),
        }
    }

    /// Runs `loader` for `key` if no load is already in flight; otherwise
    /// waits on the in-flight one. The returned `bool` is `true` for a
    /// follower that joined someone else's execution and `false` for the
    /// caller that initiated it. Cancelling `ctx` returns
    /// `CacheError::Cancelled` to this call only; the loader itself, once
    /// started, always runs to completion.
    ///
    /// Must be called from inside a multi-threaded `tokio` runtime: both the
    /// initiator and a follower park via `block_in_place` + `Handle::block_on`,
    /// which panics on a current-thread runtime.
    pub fn load<F>(&self, ctx: &Context, key: K, loader: F) -> CacheResult<(V, bool)>
    where
        F: FnOnce(Context) -> CacheResult<V> + Send + 'static,
    {
        let (rx, shared) = match self.join_or_start(&key) {
            JoinOutcome::Initiator { loader_ctx, rx } => {
                let in_flight = self.in_flight.clone();
                let finish_key = key.clone();
                tokio::task::spawn_blocking(move || {
                    let result = loader(loader_ctx);
                    Self::finish(&in_flight, &finish_key, result.map_err(|e| e.to_string()));
                });
                (rx, false)
            }
            JoinOutcome::Follower(rx) => (rx, true),
        };

        let ctx = ctx.clone();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(Self::race(ctx, rx, shared))
        })
    }

    /// Async entry point: identical de-duplication and cancellation
    /// semantics as [`LoaderCoordinator::load`], but never blocks the
    /// executor thread.
    pub async fn load_async<F, Fut>(&self, ctx: &Context, key: K, loader: F) -> CacheResult<(V, bool)>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let (rx, shared) = match self.join_or_start(&key) {
            JoinOutcome::Initiator { loader_ctx, rx } => {
                let in_flight = self.in_flight.clone();
                let finish_key = key.clone();
                tokio::spawn(async move {
                    let result = loader(loader_ctx).await;
                    Self::finish(&in_flight, &finish_key, result.map_err(|e| e.to_string()));
                });
                (rx, false)
            }
            JoinOutcome::Follower(rx) => (rx, true),
        };

        Self::race(ctx.clone(), rx, shared).await
    }

    /// Races `ctx`'s cancellation against the broadcast result shared by the
    /// key's initiator and every follower.
    async fn race(
        ctx: Context,
        mut rx: broadcast::Receiver<Result<V, String>>,
        shared: bool,
    ) -> CacheResult<(V, bool)> {
        tokio::select! {
            _ = ctx.cancelled() => Err(CacheError::Cancelled),
            received = rx.recv() => match received {
                Ok(Ok(value)) => Ok((value, shared)),
                Ok(Err(message)) => Err(CacheError::Loader(message)),
                Err(_) => Err(CacheError::Cancelled),
            },
        }
    }

    fn join_or_start(&self, key: &K) -> JoinOutcome<V> {
        let mut in_flight = self.in_flight.lock();
        match in_flight.entry(key.clone()) {
            MapEntry::Occupied(occupied) => {
                JoinOutcome::Follower(occupied.get().sender.subscribe())
            }
            MapEntry::Vacant(vacant) => {
                let (sender, _receiver) = broadcast::channel(1);
                let rx = sender.subscribe();
                vacant.insert(Flight { sender });
                JoinOutcome::Initiator {
                    loader_ctx: Context::new(),
                    rx,
                }
            }
        }
    }

    fn finish(in_flight: &FlightMap<K, V>, key: &K, result: Result<V, String>) {
        if let Some(flight) = in_flight.lock().remove(key) {
            let _ = flight.sender.send(result);
        }
    }
}

impl<K, V> Default for LoaderCoordinator<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

enum JoinOutcome<V> {
    Initiator {
        loader_ctx: Context,
        rx: broadcast::Receiver<Result<V, String>>,
    },
    Follower(broadcast::Receiver<Result<V, String>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_loads_for_the_same_key_run_once() {
        let coordinator: Arc<LoaderCoordinator<String, u32>> = Arc::new(LoaderCoordinator::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let coordinator = coordinator.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .load_async(&Context::new(), "k".to_string(), |_ctx| {
                        let executions = executions.clone();
                        async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            Ok(42u32)
                        }
                    })
                    .await
            }));
        }

        let mut shared_count = 0;
        for handle in handles {
            let (value, shared) = handle.await.unwrap().unwrap();
            assert_eq!(value, 42);
            if shared {
                shared_count += 1;
            }
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(shared_count, 99);
    }

    #[tokio::test]
    async fn cancelling_the_initiators_context_returns_cancelled_while_a_follower_still_succeeds() {
        let coordinator: Arc<LoaderCoordinator<String, u32>> = Arc::new(LoaderCoordinator::new());
        let initiator_ctx = Context::new();
        let cancel_handle = initiator_ctx.clone();

        let leader_coordinator = coordinator.clone();
        let leader = tokio::spawn(async move {
            leader_coordinator
                .load_async(&initiator_ctx, "k".to_string(), |_loader_ctx| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                    Ok(7u32)
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let follower_coordinator = coordinator.clone();
        let follower = tokio::spawn(async move {
            follower_coordinator
                .load_async(&Context::new(), "k".to_string(), |_ctx| async { Ok(0u32) })
                .await
        });

        cancel_handle.cancel();

        assert!(matches!(leader.await.unwrap(), Err(CacheError::Cancelled)));
        assert_eq!(follower.await.unwrap().unwrap().0, 7);
    }

    #[tokio::test]
    async fn distinct_keys_load_independently() {
        let coordinator: LoaderCoordinator<String, u32> = LoaderCoordinator::new();
        let ctx_a = Context::new();
        let ctx_b = Context::new();
        let a = coordinator.load_async(&ctx_a, "a".to_string(), |_| async { Ok(1u32) });
        let b = coordinator.load_async(&ctx_b, "b".to_string(), |_| async { Ok(2u32) });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap().0, 1);
        assert_eq!(b.unwrap().0, 2);
    }

    #[tokio::test]
    async fn loader_failure_is_surfaced_to_every_waiter() {
        let coordinator: Arc<LoaderCoordinator<String, u32>> = Arc::new(LoaderCoordinator::new());
        let leader_coordinator = coordinator.clone();
        let leader = tokio::spawn(async move {
            leader_coordinator
                .load_async(&Context::new(), "k".to_string(), |_ctx| async {
                    Err::<u32, _>(CacheError::from_loader("boom"))
                })
                .await
        });
        let result = leader.await.unwrap();
        assert!(matches!(result, Err(CacheError::Loader(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sync_load_blocks_a_follower_until_the_leader_finishes() {
        let coordinator: Arc<LoaderCoordinator<String, u32>> = Arc::new(LoaderCoordinator::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let leader_coordinator = coordinator.clone();
        let leader_executions = executions.clone();
        let leader = tokio::task::spawn_blocking(move || {
            leader_coordinator.load(&Context::new(), "k".to_string(), move |_ctx| {
                leader_executions.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                Ok(9u32)
            })
        });

        std::thread::sleep(std::time::Duration::from_millis(5));

        let follower_coordinator = coordinator.clone();
        let follower_executions = executions.clone();
        let follower = tokio::task::spawn_blocking(move || {
            follower_coordinator.load(&Context::new(), "k".to_string(), move |_ctx| {
                follower_executions.fetch_add(1, Ordering::SeqCst);
                Ok(0u32)
            })
        });

        assert_eq!(leader.await.unwrap().unwrap().0, 9);
        assert_eq!(follower.await.unwrap().unwrap().0, 9);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }
}
