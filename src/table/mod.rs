//! # PAIR Table
//!
//! Index of every cached PAIR, plus the checkpoint-pending list.
//!
//! ## Layout
//!
//! ```text
//! buckets: [Option<u32>; 2^n]          head slot index of each hash chain
//!
//! slots:   Vec<Slot>
//!          +-----------+-----------+-----------+
//!          | gen 3     | gen 1     | gen 7     |
//!          | pair: A   | (free)    | pair: B   |
//!          | hash_next |           | hash_next |
//!          | pending_* |           | pending_* |
//!          +-----------+-----------+-----------+
//! ```
//!
//! Slots form a generational arena: a [`PairId`] is `(index, generation)`
//! and goes stale as soon as the slot is reused. The hash chains and the
//! pending list are threaded through the slots by index, so there are no
//! owning links between PAIRs and no unsafe code.
//!
//! The client-supplied hash selects a bucket by masking. When the average
//! chain length exceeds [`MAX_BUCKET_LOAD`] the bucket array doubles and
//! every live slot is relinked.
//!
//! ## Pending List
//!
//! `begin_checkpoint` links every dirty PAIR of a participating cachefile
//! into a doubly linked list. The checkpointer drains it from the head;
//! pinners and `unpin_and_remove` unlink from the middle. A PAIR is on the
//! list exactly when its `checkpoint_pending` flag is set; both change
//! together under the table write lock and the PAIR's state mutex.
//!
//! ## Concurrency
//!
//! The table itself is not synchronized. The cachetable keeps it under one
//! `parking_lot::RwLock`: lookups take it shared, insert, remove and every
//! pending-list change take it exclusive.

mod pending;

use std::sync::Arc;

use smallvec::SmallVec;

use crate::cachefile::CachefileId;
use crate::config::MAX_BUCKET_LOAD;
use crate::pair::entry::Pair;
use crate::pair::BlockKey;

/// Stable handle to a slot in the PAIR table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairId {
    index: u32,
    generation: u32,
}

impl PairId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<V: Send + Sync + 'static> {
    generation: u32,
    pair: Option<Arc<Pair<V>>>,
    hash_next: Option<u32>,
    pending_prev: Option<u32>,
    pending_next: Option<u32>,
    on_pending: bool,
}

impl<V: Send + Sync + 'static> Slot<V> {
    fn vacant() -> Self {
        Self {
            generation: 0,
            pair: None,
            hash_next: None,
            pending_prev: None,
            pending_next: None,
            on_pending: false,
        }
    }
}

pub(crate) struct PairTable<V: Send + Sync + 'static> {
    slots: Vec<Slot<V>>,
    free: Vec<u32>,
    buckets: Vec<Option<u32>>,
    len: usize,
    pending_head: Option<u32>,
    pending_tail: Option<u32>,
    pending_len: usize,
}

impl<V: Send + Sync + 'static> PairTable<V> {
    pub fn with_buckets(count: usize) -> Self {
        let count = count.max(1).next_power_of_two();
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![None; count],
            len: 0,
            pending_head: None,
            pending_tail: None,
            pending_len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    fn live(&self, index: u32) -> &Arc<Pair<V>> {
        self.slots[index as usize]
            .pair
            .as_ref()
            .expect("INVARIANT: chained slot holds a PAIR")
    }

    pub fn find(&self, cachefile: CachefileId, key: BlockKey, hash: u32) -> Option<Arc<Pair<V>>> {
        let mut cursor = self.buckets[self.bucket_of(hash)];
        while let Some(index) = cursor {
            let pair = self.live(index);
            if pair.hash == hash && pair.key == key && pair.cachefile.id() == cachefile {
                return Some(Arc::clone(pair));
            }
            cursor = self.slots[index as usize].hash_next;
        }
        None
    }

    pub fn get(&self, id: PairId) -> Option<&Arc<Pair<V>>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.pair.as_ref()
    }

    /// Inserts the PAIR produced by `build`, which receives the id the PAIR
    /// will live under.
    ///
    /// # Panics
    ///
    /// Panics if a PAIR with the same identity is already present.
    pub fn insert<F>(&mut self, build: F) -> Arc<Pair<V>>
    where
        F: FnOnce(PairId) -> Pair<V>,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::vacant());
                (self.slots.len() - 1) as u32
            }
        };
        let id = PairId {
            index,
            generation: self.slots[index as usize].generation,
        };
        let pair = Arc::new(build(id));
        assert!(
            self.find(pair.cachefile.id(), pair.key, pair.hash).is_none(),
            "PAIR ({}, {}) inserted twice",
            pair.cachefile.id(),
            pair.key
        );

        let bucket = self.bucket_of(pair.hash);
        let slot = &mut self.slots[index as usize];
        slot.pair = Some(Arc::clone(&pair));
        slot.hash_next = self.buckets[bucket];
        self.buckets[bucket] = Some(index);
        self.len += 1;

        if self.len > self.buckets.len() * MAX_BUCKET_LOAD {
            self.grow();
        }
        pair
    }

    /// Unlinks the PAIR from its hash chain and frees its slot.
    ///
    /// # Panics
    ///
    /// Panics if the PAIR is still on the pending list.
    pub fn remove(&mut self, id: PairId) -> Option<Arc<Pair<V>>> {
        let hash = self.get(id)?.hash;
        assert!(
            !self.slots[id.index as usize].on_pending,
            "removing checkpoint-pending PAIR {:?}",
            id
        );

        let bucket = self.bucket_of(hash);
        let next = self.slots[id.index as usize].hash_next;
        if self.buckets[bucket] == Some(id.index) {
            self.buckets[bucket] = next;
        } else {
            let mut cursor = self.buckets[bucket];
            while let Some(index) = cursor {
                let slot = &mut self.slots[index as usize];
                if slot.hash_next == Some(id.index) {
                    slot.hash_next = next;
                    break;
                }
                cursor = slot.hash_next;
            }
        }

        let slot = &mut self.slots[id.index as usize];
        let pair = slot.pair.take();
        slot.hash_next = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        pair
    }

    fn grow(&mut self) {
        let count = self.buckets.len() * 2;
        self.buckets = vec![None; count];
        for index in 0..self.slots.len() {
            let Some(pair) = self.slots[index].pair.as_ref() else {
                continue;
            };
            let bucket = pair.hash as usize & (count - 1);
            self.slots[index].hash_next = self.buckets[bucket];
            self.buckets[bucket] = Some(index as u32);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pair<V>>> + '_ {
        self.slots.iter().filter_map(|slot| slot.pair.as_ref())
    }

    pub fn pairs_of(&self, cachefile: CachefileId) -> Vec<Arc<Pair<V>>> {
        self.iter()
            .filter(|pair| pair.cachefile.id() == cachefile)
            .cloned()
            .collect()
    }

    /// Collects up to `count` live PAIRs starting at slot `*hand`, advancing
    /// the hand past the last slot visited.
    pub fn sample(&self, hand: &mut usize, count: usize) -> SmallVec<[Arc<Pair<V>>; 8]> {
        let mut out = SmallVec::new();
        let total = self.slots.len();
        if total == 0 {
            return out;
        }
        let mut position = *hand % total;
        for _ in 0..total {
            if let Some(pair) = self.slots[position].pair.as_ref() {
                out.push(Arc::clone(pair));
            }
            position = (position + 1) % total;
            if out.len() == count {
                break;
            }
        }
        *hand = position;
        out
    }
}
