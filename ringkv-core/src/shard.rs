//! # Shard
//!
//! Bundles {index, generation ring, CLOCK-Pro} behind a reader-writer lock;
//! provides `get`/`put`/`delete`/`rotate`. Hash seed is per-shard.
//!
//! Built on the `RwLock<ShardInner>` wrapper around a `HashMap` index plus
//! a dense node slab with a free-list and an intrusive doubly-linked ring,
//! generalized from a two-state LRU list to the three-state CLOCK-Pro ring
//! and from one arena to a [`crate::generation::GenerationRing`]. `put`
//! always needs the writer lock: CLOCK-Pro admission and generation-ring
//! allocation both mutate shared structures, so there is no atomics-only
//! fast path for inserts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::clock::{step, HandAction};
use crate::entry::{ClockState, Entry};
use crate::generation::GenerationRing;
use crate::options::{EjectReason, SlowPathLog};

/// One eviction record produced inside a shard's write lock and reported to
/// the caller for out-of-lock callback delivery (no user code ever runs
/// while a shard lock is held).
pub type EjectRecord<K, V> = (K, V, EjectReason);

struct ShardInner<K, V> {
    index: HashMap<K, usize, RandomState>,
    slab: Vec<Option<Entry<K>>>,
    free_slots: Vec<usize>,
    /// CLOCK hand: the next node the sweep will visit. `None` means the ring
    /// is empty. New entries are linked immediately before this position
    /// ("just before the hand"), so they are visited last.
    hand: Option<usize>,
    ring: GenerationRing<V>,
    cap_weight: i64,
    used_weight: i64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rotations: AtomicU64,
    logger: Arc<dyn SlowPathLog>,
}

impl<K, V> ShardInner<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn link_before_hand(&mut self, slot: usize) {
        match self.hand {
            None => {
                let e = self.slab[slot].as_mut().expect("slot just allocated");
                e.prev = Some(slot);
                e.next = Some(slot);
                self.hand = Some(slot);
            }
            Some(hand) => {
                let prev_of_hand = self.slab[hand]
                    .as_ref()
                    .expect("hand always occupied")
                    .prev
                    .expect("ring nodes always linked");
                self.slab[prev_of_hand].as_mut().unwrap().next = Some(slot);
                self.slab[hand].as_mut().unwrap().prev = Some(slot);
                let e = self.slab[slot].as_mut().unwrap();
                e.prev = Some(prev_of_hand);
                e.next = Some(hand);
            }
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let e = self.slab[slot].as_ref().expect("slot occupied");
            (e.prev, e.next)
        };
        if prev == Some(slot) && next == Some(slot) {
            self.hand = None;
        } else {
            if let Some(p) = prev {
                self.slab[p].as_mut().unwrap().next = next;
            }
            if let Some(n) = next {
                self.slab[n].as_mut().unwrap().prev = prev;
            }
            if self.hand == Some(slot) {
                self.hand = next;
            }
        }
    }

    fn advance_hand(&mut self) {
        if let Some(h) = self.hand {
            self.hand = self.slab[h].as_ref().unwrap().next;
        }
    }

    fn free_slab_slot(&mut self, slot: usize) {
        self.slab[slot] = None;
        self.free_slots.push(slot);
    }

    fn insert_new(&mut self, fingerprint: u64, key: K, weight: u32, generation_id: u32, arena_slot: usize) -> usize {
        let entry = Entry::new(fingerprint, key.clone(), weight, generation_id, arena_slot, ClockState::Cold);
        let slot = if let Some(slot) = self.free_slots.pop() {
            self.slab[slot] = Some(entry);
            slot
        } else {
            self.slab.push(Some(entry));
            self.slab.len() - 1
        };
        self.link_before_hand(slot);
        self.index.insert(key, slot);
        self.used_weight += weight as i64;
        slot
    }

    /// Runs the CLOCK-Pro hand sweep until `used_weight <= cap_weight` or
    /// the ring is exhausted.
    fn evict_to_capacity(&mut self) -> Vec<EjectRecord<K, V>> {
        let mut evicted = Vec::new();
        while self.used_weight > self.cap_weight {
            let Some(h) = self.hand else { break };
            let (state, referenced) = {
                let e = self.slab[h].as_ref().unwrap();
                (e.state(), e.referenced())
            };
            match step(state, referenced) {
                HandAction::KeepHot => {
                    self.slab[h].as_ref().unwrap().clear_referenced();
                    self.advance_hand();
                }
                HandAction::Demote => {
                    self.slab[h].as_ref().unwrap().set_state(ClockState::Cold);
                    self.advance_hand();
                }
                HandAction::Promote => {
                    self.slab[h].as_ref().unwrap().set_state_clear_ref(ClockState::Hot);
                    self.advance_hand();
                }
                HandAction::EvictToTest => {
                    let (generation_id, arena_slot, weight, key) = {
                        let e = self.slab[h].as_ref().unwrap();
                        (e.generation_id, e.arena_slot, e.weight, e.key.clone())
                    };
                    let value = self.ring.take(generation_id, arena_slot, weight);
                    self.slab[h].as_ref().unwrap().set_state_clear_ref(ClockState::Test);
                    self.used_weight -= weight as i64;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    self.advance_hand();
                    if let Some(value) = value {
                        evicted.push((key, value, EjectReason::Capacity));
                    }
                }
                HandAction::Remove => {
                    let key = self.slab[h].as_ref().unwrap().key.clone();
                    self.index.remove(&key);
                    self.unlink(h);
                    self.free_slab_slot(h);
                }
            }
        }
        evicted
    }

    /// Drains every live (non-TEST) entry pointing at `about_to_free` and
    /// transitions it to TEST, reporting `Generation` ejections. Must run
    /// before the ring actually rotates: the generation's arena is bulk-
    /// dropped by `rotate()`, so values have to be extracted first or they
    /// are unrecoverable. Already-ghost entries are left untouched; their
    /// value was already gone, so nothing new is evicted for them.
    fn drain_generation(&mut self, about_to_free: u32) -> Vec<EjectRecord<K, V>> {
        let mut evicted = Vec::new();
        let affected: Vec<usize> = self
            .slab
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| {
                let e = e.as_ref()?;
                if e.generation_id == about_to_free && e.state() != ClockState::Test {
                    Some(slot)
                } else {
                    None
                }
            })
            .collect();

        for slot in affected {
            let (weight, key, generation_id, arena_slot) = {
                let e = self.slab[slot].as_ref().unwrap();
                (e.weight, e.key.clone(), e.generation_id, e.arena_slot)
            };
            let value = self.ring.take(generation_id, arena_slot, weight);
            self.slab[slot]
                .as_ref()
                .unwrap()
                .set_state_clear_ref(ClockState::Test);
            self.used_weight -= weight as i64;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            if let Some(value) = value {
                evicted.push((key, value, EjectReason::Generation));
            }
        }
        evicted
    }

    /// Rotates the generation ring, draining live values out of the
    /// generation about to be overwritten first. Shared by the background
    /// rotation tick and by capacity-triggered rotation inside `put`.
    fn rotate_locked(&mut self) -> Vec<EjectRecord<K, V>> {
        self.rotations.fetch_add(1, Ordering::Relaxed);
        let Some(about_to_free) = self.ring.peek_next_to_free() else {
            self.ring.rotate();
            return Vec::new();
        };
        let evicted = self.drain_generation(about_to_free);
        self.ring.rotate();
        evicted
    }

    /// Frees every generation's arena and drops all entry metadata. Used by
    /// `Cache::close` to reclaim memory immediately rather than waiting for
    /// the last clone of the shard's containing `Arc` to drop.
    fn close(&mut self) {
        self.ring.clear();
        self.index.clear();
        self.slab.clear();
        self.free_slots.clear();
        self.hand = None;
        self.used_weight = 0;
    }
}

/// One shard: an index, a generation ring, and a CLOCK-Pro ring, guarded by
/// a single reader-writer lock.
pub struct Shard<K, V> {
    inner: RwLock<ShardInner<K, V>>,
}

impl<K, V> Shard<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a shard with the given capacity (in weight units), generation
    /// count, per-shard hash seed, and slow-path logger.
    pub fn new(cap_weight: i64, generations: usize, seed: u64, logger: Arc<dyn SlowPathLog>) -> Self {
        Shard {
            inner: RwLock::new(ShardInner {
                index: HashMap::with_hasher(RandomState::with_seed(seed as usize)),
                slab: Vec::new(),
                free_slots: Vec::new(),
                hand: None,
                ring: GenerationRing::new(generations, cap_weight),
                cap_weight,
                used_weight: 0,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                rotations: AtomicU64::new(0),
                logger,
            }),
        }
    }

    /// Looks up `key`, marking the reference bit on a hit. Returns a copy of
    /// the value; never hands back a reference into the arena. Takes only a
    /// reader lock: the reference bit and the hit/miss/eviction counters are
    /// all updated through interior mutability, so concurrent reads never
    /// serialize against each other.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let inner = self.inner.read();
            let Some(&slot) = inner.index.get(key) else {
                return None;
            };
            let entry = inner.slab[slot].as_ref().expect("indexed slot occupied");
            if entry.state() == ClockState::Test {
                inner.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            let (generation_id, arena_slot) = (entry.generation_id, entry.arena_slot);
            if let Some(value) = inner.ring.get(generation_id, arena_slot).cloned() {
                entry.mark_referenced();
                inner.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }
        // Rare path: a non-TEST entry whose generation no longer holds a
        // value (the hand has not reconciled it yet). Reconcile under the
        // writer lock and log the inconsistency via the slow-path logger.
        self.reconcile_missing_value(key)
    }

    fn reconcile_missing_value(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.write();
        if let Some(&slot) = inner.index.get(key) {
            let still_missing = {
                let e = inner.slab[slot].as_ref().expect("indexed slot occupied");
                e.state() != ClockState::Test
                    && inner.ring.get(e.generation_id, e.arena_slot).is_none()
            };
            if still_missing {
                inner.logger.warn(
                    "shard inconsistency: live entry has no resident value in its generation; \
                     dropping from index and treating as a miss",
                );
                inner.index.remove(key);
                inner.unlink(slot);
                inner.free_slab_slot(slot);
            }
        }
        inner.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Inserts or updates `key`. Always takes the writer lock: a fast-path
    /// update still allocates a new value in the active generation's arena.
    pub fn put(&self, key: K, value: V, weight: u32) -> Vec<EjectRecord<K, V>> {
        let mut inner = self.inner.write();
        let weight = weight.max(1);

        if let Some(&slot) = inner.index.get(&key) {
            let (generation_id, arena_slot) = inner.ring.alloc_in_active(value, weight);
            let (old_weight, was_ghost) = {
                let e = inner.slab[slot].as_mut().unwrap();
                let old_weight = e.weight;
                let was_ghost = e.state() == ClockState::Test;
                e.weight = weight;
                e.generation_id = generation_id;
                e.arena_slot = arena_slot;
                (old_weight, was_ghost)
            };
            // A ghost re-admitted by a fresh put is live again: I1 requires
            // its state not remain TEST once its value is resident.
            if was_ghost {
                inner.slab[slot]
                    .as_ref()
                    .unwrap()
                    .set_state_clear_ref(ClockState::Cold);
            }
            inner.slab[slot].as_ref().unwrap().mark_referenced();
            let weight_delta = if was_ghost {
                weight as i64
            } else {
                weight as i64 - old_weight as i64
            };
            inner.used_weight += weight_delta;
        } else {
            let fingerprint = {
                use std::hash::{BuildHasher, Hash, Hasher};
                let mut hasher = inner.index.hasher().build_hasher();
                key.hash(&mut hasher);
                hasher.finish()
            };
            let (generation_id, arena_slot) = inner.ring.alloc_in_active(value, weight);
            inner.insert_new(fingerprint, key, weight, generation_id, arena_slot);
        }

        let mut evicted = Vec::new();
        if inner.ring.check_rotation_needed(0) {
            evicted.extend(inner.rotate_locked());
        }
        evicted.extend(inner.evict_to_capacity());
        evicted
    }

    /// Removes `key` from the index and CLOCK-Pro ring. The value itself is
    /// not reclaimed until its generation rotates out.
    pub fn delete(&self, key: &K) -> bool {
        let mut inner = self.inner.write();
        let Some(slot) = inner.index.remove(key) else {
            return false;
        };
        let (weight, state) = {
            let e = inner.slab[slot].as_ref().unwrap();
            (e.weight, e.state())
        };
        if state != ClockState::Test {
            inner.used_weight -= weight as i64;
        }
        inner.unlink(slot);
        inner.free_slab_slot(slot);
        inner.evictions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Rotates this shard's generation ring. Live entries pointing at the
    /// generation about to be overwritten are drained first so their
    /// values can still be reported to the eject callback; the ring itself
    /// then drops that generation's (now-empty) arena in one shot.
    pub fn rotate(&self) -> Vec<EjectRecord<K, V>> {
        let mut inner = self.inner.write();
        inner.rotate_locked()
    }

    /// Number of live (non-TEST) entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner
            .slab
            .iter()
            .flatten()
            .filter(|e| e.state() != ClockState::Test)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of weights over non-TEST entries.
    pub fn size_bytes(&self) -> i64 {
        self.inner.read().used_weight
    }

    pub fn hits(&self) -> u64 {
        self.inner.read().hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.inner.read().misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.inner.read().evictions.load(Ordering::Relaxed)
    }

    pub fn rotations(&self) -> u64 {
        self.inner.read().rotations.load(Ordering::Relaxed)
    }

    /// Frees this shard's arenas and drops all entry metadata. Called from
    /// [`crate::cache::Cache::close`]; any `get`/`put`/`delete` called on a
    /// closed shard afterward behaves as if the shard were freshly empty.
    pub fn close(&self) {
        self.inner.write().close();
    }
}
