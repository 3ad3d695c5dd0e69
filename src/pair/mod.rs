//! # PAIRs
//!
//! A PAIR is one cached block: the value produced by a client callback plus
//! the bookkeeping the cache needs to pin, write, checkpoint and evict it.
//!
//! ## Identity
//!
//! A PAIR is identified by `(CachefileId, BlockKey)`. The client also
//! supplies a 32-bit hash of that identity with every lookup; the cache
//! never computes it on its own, so the same hash must be passed for the
//! lifetime of the PAIR. [`key_hash`] is provided for clients that have no
//! hash of their own.
//!
//! ## Lock Layout
//!
//! ```text
//! Pair<V>
//! +-- value: Arc<RwLock<Option<V>>>   pin lock, held for the whole pin
//! +-- state: Mutex<PairState>         dirty, pending, disk_busy, attr, pins
//! +-- disk_idle: Condvar              signalled when a write of the PAIR ends
//! ```
//!
//! The value lock is the only lock a client holds across calls. The state
//! mutex is held for a handful of instructions at a time and never across a
//! callback.
//!
//! ## Size Accounting
//!
//! [`PairAttr`] carries the sizes reported by fetch, flush and clone
//! callbacks. The cache adds them to its [`CacheBudget`](crate::memory::CacheBudget)
//! and replaces them whenever a callback reports a new attribute.

mod attr;
mod callbacks;
pub(crate) mod entry;

pub use attr::PairAttr;
pub use callbacks::{ClonedValue, Fetched, FlushParams, PairCallbacks};

use std::fmt;

use crate::cachefile::CachefileId;

/// Block number of a PAIR inside its cachefile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockKey(pub u64);

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockKey {
    fn from(value: u64) -> Self {
        BlockKey(value)
    }
}

/// Mixes a cachefile id and block key into a 32-bit PAIR hash.
pub fn key_hash(cachefile: CachefileId, key: BlockKey) -> u32 {
    let mut h = key.0 ^ ((cachefile.0 as u64) << 32 | cachefile.0 as u64);
    h = (h ^ (h >> 33)).wrapping_mul(0xff51_afd7_ed55_8ccd);
    h = (h ^ (h >> 33)).wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    (h ^ (h >> 32)) as u32
}
