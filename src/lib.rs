//! # TurDB Cachetable - Concurrent Page Cache with Consistent Checkpoints
//!
//! The cachetable sits between a tree layer and disk. It caches client
//! values ("PAIRs") keyed by `(cachefile, block)`, lets many threads pin
//! them concurrently, writes dirty ones back on eviction, and produces
//! checkpoints that capture every dirty PAIR exactly as it was when the
//! checkpoint began, while clients keep working.
//!
//! - **Client-defined values**: the cache never looks inside a value; all
//!   I/O goes through [`PairCallbacks`]
//! - **Non-blocking checkpoints**: a writer that hits a pending PAIR clones
//!   it and lets a background thread write the clone
//! - **Soft capacity**: PAIRs are always admitted; an evictor thread and
//!   client back-pressure keep the total near the configured capacity
//!
//! ## Quick Start
//!
//! ```ignore
//! use turdb_cachetable::{
//!     key_hash, BlockKey, Cachetable, CachetableBuilder, Lsn, NoopCachefileCallbacks,
//!     PairCallbacks, PinMode,
//! };
//!
//! let table: Cachetable<Node> = CachetableBuilder::new()
//!     .capacity(64 * 1024 * 1024)
//!     .build()?;
//! let cf = table.open_cachefile("users.tbd", Arc::new(NoopCachefileCallbacks))?;
//! let callbacks: Arc<dyn PairCallbacks<Node>> = Arc::new(NodeIo::new(file));
//!
//! let hash = key_hash(cf.id(), BlockKey(7));
//! let mut node = table.get_and_pin(&cf, BlockKey(7), hash, &callbacks, PinMode::WriteCheap)?;
//! node.insert(b"key", b"value");
//! node.unpin(true, None);
//!
//! table.checkpoint(Lsn(42))?;
//! table.close_cachefile(&cf)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │      Cachetable API (pin, put, checkpoint)    │
//! ├───────────────┬───────────────┬──────────────┤
//! │  Checkpointer │    Evictor    │   Cleaner    │
//! ├───────────────┴───────────────┴──────────────┤
//! │   PAIR table (hash chains + pending list)     │
//! ├──────────────────────────────────────────────┤
//! │  PAIRs: value lock, state, client callbacks   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`cachetable`]: public API, pin guards, builder, statistics
//! - [`checkpoint`]: begin/end checkpoint and pending-PAIR writes
//! - [`evictor`]: eviction thread, watermarks, eviction policies
//! - `cleaner`: background thread feeding PAIRs to the cleaner callback
//! - [`table`]: PAIR index and pending list
//! - [`pair`]: PAIR identity, attributes, client callbacks
//! - [`cachefile`]: per-file state and hooks
//! - [`memory`]: size budget and watermarks
//! - [`config`]: tunables

pub mod cachefile;
pub mod cachetable;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod evictor;
pub mod memory;
pub mod pair;
pub mod table;

mod background;
mod cleaner;

#[cfg(test)]
mod test_support;

pub use cachefile::{Cachefile, CachefileCallbacks, CachefileId, Lsn, NoopCachefileCallbacks};
pub use cachetable::{
    Cachetable, CachetableBuilder, DependentPair, KeyState, MultiOperationGuard, PairGuard,
    PinMode, StatsSnapshot,
};
pub use checkpoint::CheckpointInfo;
pub use error::{CachetableError, Result};
pub use evictor::{EvictionPolicy, EvictionPolicyKind, LruPolicy, SievePolicy};
pub use memory::BudgetStats;
pub use pair::{key_hash, BlockKey, ClonedValue, Fetched, FlushParams, PairAttr, PairCallbacks};
pub use table::PairId;
