//! Eviction policies.
//!
//! A policy only orders candidates. The evictor decides whether a candidate
//! can actually go (it must be unpinned, not pending and not being written)
//! and calls [`EvictionPolicy::forget`] once it is gone, so a policy never
//! sees pin state.
//!
//! ## SIEVE
//!
//! Each entry carries a visited bit set on access. The hand sweeps the
//! entries in insertion order: a visited entry has its bit cleared and is
//! passed over, the first unvisited entry is the candidate. A scan that
//! touches each PAIR once leaves them all unvisited, so scans do not flush
//! out the working set.
//!
//! ## LRU
//!
//! Strict recency order by access tick. A candidate handed out is rotated to
//! the most recent position so a PAIR the evictor had to skip does not block
//! the ones behind it.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::table::PairId;

pub trait EvictionPolicy: Send {
    fn name(&self) -> &'static str;

    fn admit(&mut self, id: PairId);

    fn touch(&mut self, id: PairId);

    fn forget(&mut self, id: PairId);

    /// Next PAIR the policy would evict. Successive calls without an
    /// intervening `forget` move on to other PAIRs.
    fn next_candidate(&mut self) -> Option<PairId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Built-in policies selectable from the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicyKind {
    #[default]
    Sieve,
    Lru,
}

impl EvictionPolicyKind {
    pub fn build(self) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionPolicyKind::Sieve => Box::new(SievePolicy::new()),
            EvictionPolicyKind::Lru => Box::new(LruPolicy::new()),
        }
    }
}

struct SieveEntry {
    id: PairId,
    visited: bool,
}

#[derive(Default)]
pub struct SievePolicy {
    entries: Vec<SieveEntry>,
    index: HashMap<PairId, usize>,
    hand: usize,
}

impl SievePolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for SievePolicy {
    fn name(&self) -> &'static str {
        "sieve"
    }

    fn admit(&mut self, id: PairId) {
        if self.index.contains_key(&id) {
            return;
        }
        self.index.insert(id, self.entries.len());
        self.entries.push(SieveEntry { id, visited: false });
    }

    fn touch(&mut self, id: PairId) {
        if let Some(&idx) = self.index.get(&id) {
            self.entries[idx].visited = true;
        }
    }

    fn forget(&mut self, id: PairId) {
        let Some(idx) = self.index.remove(&id) else {
            return;
        };
        self.entries.swap_remove(idx);
        if idx < self.entries.len() {
            let moved = self.entries[idx].id;
            self.index.insert(moved, idx);
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
    }

    fn next_candidate(&mut self) -> Option<PairId> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }
        // Two laps at most: the first clears every visited bit.
        for _ in 0..len * 2 {
            let idx = self.hand;
            self.hand = (idx + 1) % len;
            let entry = &mut self.entries[idx];
            if entry.visited {
                entry.visited = false;
                continue;
            }
            return Some(entry.id);
        }
        None
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Default)]
pub struct LruPolicy {
    ticks: HashMap<PairId, u64>,
    order: BTreeMap<u64, PairId>,
    clock: u64,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self, id: PairId) {
        self.clock += 1;
        if let Some(old) = self.ticks.insert(id, self.clock) {
            self.order.remove(&old);
        }
        self.order.insert(self.clock, id);
    }
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn admit(&mut self, id: PairId) {
        self.bump(id);
    }

    fn touch(&mut self, id: PairId) {
        if self.ticks.contains_key(&id) {
            self.bump(id);
        }
    }

    fn forget(&mut self, id: PairId) {
        if let Some(tick) = self.ticks.remove(&id) {
            self.order.remove(&tick);
        }
    }

    fn next_candidate(&mut self) -> Option<PairId> {
        let (_, &id) = self.order.iter().next()?;
        self.bump(id);
        Some(id)
    }

    fn len(&self) -> usize {
        self.ticks.len()
    }
}
