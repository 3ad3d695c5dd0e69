//! # Cachetable
//!
//! The public face of the crate: a concurrent cache of client-defined
//! values keyed by `(cachefile, block)`, with pin/unpin access and
//! checkpoint-consistent write-out.
//!
//! ## Architecture
//!
//! ```text
//! Cachetable<V>
//! +-- Arc<Shared<V>>
//! |   +-- table: RwLock<PairTable<V>>      PAIRs, hash chains, pending list
//! |   +-- budget: CacheBudget              size accounting and watermarks
//! |   +-- policy: Mutex<dyn EvictionPolicy>
//! |   +-- checkpointer: Checkpointer       round state, pending and multi-op locks
//! |   +-- evictor: Evictor                 wakeups and client back-pressure
//! |   +-- cleaner: Cleaner                 period, iterations, sampling hand
//! |   +-- cachefiles: RwLock<HashMap<CachefileId, Arc<Cachefile>>>
//! |   +-- stats: CachetableStats
//! +-- workers: evictor thread, cleaner thread
//! ```
//!
//! Every handle the crate gives out (pin guards, background jobs, worker
//! threads) holds an `Arc<Shared<V>>`, so the shared state outlives the
//! `Cachetable` value while any of them is alive.
//!
//! ## Operations
//!
//! | Operation | Blocks on | Module |
//! |-----------|-----------|--------|
//! | `get_and_pin`, `get_and_pin_with_dep_pairs` | pinners, memory, checkpoint write | `pin` |
//! | `get_and_pin_nonblocking` | nothing (TryAgain) | `pin` |
//! | `maybe_get_and_pin`, `maybe_get_and_pin_clean` | nothing (None) | `pin` |
//! | `put`, `put_with_dep_pairs` | memory | `pin` |
//! | `prefetch` | nothing | `pin` |
//! | `unpin_and_remove`, `pf_pinned_pair` | PAIR disk | `pin` |
//! | `begin_checkpoint`, `end_checkpoint` | multi-op lock, PAIR locks | `checkpoint` |
//! | `open_cachefile`, `close_cachefile`, `flush_cachefile` | checkpoint round, PAIR locks | here |
//!
//! ## Shutdown
//!
//! Dropping a `Cachetable` stops and joins the evictor and cleaner, then
//! closes any cachefile still open, writing its dirty PAIRs. It panics if a
//! PAIR is still cached afterwards, e.g. because a guard outlived the table.

mod builder;
mod guard;
mod pin;
mod stats;

pub use builder::CachetableBuilder;
pub use guard::{PairGuard, PinMode};
pub use pin::DependentPair;
pub use stats::{CachetableStats, StatsSnapshot};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::cachefile::{Cachefile, CachefileCallbacks, CachefileId, Lsn};
use crate::checkpoint::{CheckpointInfo, Checkpointer};
use crate::cleaner::{self, Cleaner};
use crate::error::{CachetableError, Result};
use crate::evictor::{self, EvictionPolicy, Evictor};
use crate::memory::{BudgetStats, CacheBudget};
use crate::pair::{BlockKey, FlushParams, PairAttr};
use crate::table::PairTable;

use builder::BuiltConfig;

pub(crate) struct Shared<V: Send + Sync + 'static> {
    pub table: RwLock<PairTable<V>>,
    pub budget: CacheBudget,
    pub policy: Mutex<Box<dyn EvictionPolicy>>,
    pub checkpointer: Checkpointer,
    pub evictor: Evictor,
    pub cleaner: Cleaner,
    pub cachefiles: RwLock<HashMap<CachefileId, Arc<Cachefile>>>,
    pub stats: CachetableStats,
    next_cachefile: AtomicU32,
    shutdown: AtomicBool,
}

impl<V: Send + Sync + 'static> Shared<V> {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn wake_evictor_if_needed(&self) {
        if self.budget.should_wake_evictor() {
            self.evictor.signal();
        }
    }
}

/// Snapshot of one PAIR's bookkeeping, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyState {
    pub dirty: bool,
    pub pin_count: u32,
    pub checkpoint_pending: bool,
    /// A checkpoint or eviction write of the PAIR is in flight.
    pub write_in_flight: bool,
    pub attr: PairAttr,
}

impl KeyState {
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

/// Shared hold on the multi-operation lock. No checkpoint can begin while
/// any is alive.
pub type MultiOperationGuard<'a> = RwLockReadGuard<'a, ()>;

pub struct Cachetable<V: Send + Sync + 'static> {
    shared: Arc<Shared<V>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<V: Send + Sync + 'static> Cachetable<V> {
    /// Starts a cachetable with default settings.
    pub fn new() -> Result<Self> {
        CachetableBuilder::new().build()
    }

    pub(crate) fn start(config: BuiltConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            table: RwLock::new(PairTable::with_buckets(config.initial_buckets)),
            budget: config.budget,
            policy: Mutex::new(config.policy),
            checkpointer: Checkpointer::new(),
            evictor: Evictor::new(config.evictor_period),
            cleaner: Cleaner::new(config.cleaner_period, config.cleaner_iterations),
            cachefiles: RwLock::new(HashMap::new()),
            stats: CachetableStats::default(),
            next_cachefile: AtomicU32::new(1),
            shutdown: AtomicBool::new(false),
        });

        let table = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(2)),
        };
        let evictor_shared = Arc::clone(&table.shared);
        table.spawn_worker("cachetable-evictor", move || Evictor::run(evictor_shared))?;
        let cleaner_shared = Arc::clone(&table.shared);
        table.spawn_worker("cachetable-cleaner", move || Cleaner::run(cleaner_shared))?;

        info!(
            capacity = table.shared.budget.limit(),
            policy = table.shared.policy.lock().name(),
            "cachetable started"
        );
        Ok(table)
    }

    fn spawn_worker<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(body)?;
        self.workers.lock().push(handle);
        Ok(())
    }

    pub fn open_cachefile(
        &self,
        name: impl Into<String>,
        callbacks: Arc<dyn CachefileCallbacks>,
    ) -> Result<Arc<Cachefile>> {
        if self.shared.is_shutting_down() {
            return Err(CachetableError::ShuttingDown);
        }
        let id = CachefileId(self.shared.next_cachefile.fetch_add(1, Ordering::AcqRel));
        let cachefile = Arc::new(Cachefile::new(id, name.into(), callbacks));
        self.shared
            .cachefiles
            .write()
            .insert(id, Arc::clone(&cachefile));
        debug!(cachefile = %id, name = cachefile.name(), "cachefile opened");
        Ok(cachefile)
    }

    pub fn cachefile(&self, id: CachefileId) -> Option<Arc<Cachefile>> {
        self.shared.cachefiles.read().get(&id).cloned()
    }

    pub fn cachefile_count(&self) -> usize {
        self.shared.cachefiles.read().len()
    }

    /// Writes every dirty PAIR of the cachefile and keeps them cached.
    ///
    /// # Errors
    ///
    /// `PinnedPairs` if any PAIR of the file is pinned, or the first failed
    /// write.
    pub fn flush_cachefile(&self, cachefile: &Arc<Cachefile>) -> Result<()> {
        if cachefile.is_closing() {
            return Err(CachetableError::CachefileClosed(cachefile.id()));
        }
        self.write_out(cachefile, false)
    }

    /// Waits for any checkpoint round using the file, writes and drops its
    /// PAIRs, runs the close callback and forgets the file.
    ///
    /// If a PAIR is pinned or cannot be written the file stays open and the
    /// error is returned.
    pub fn close_cachefile(&self, cachefile: &Arc<Cachefile>) -> Result<()> {
        if !self.shared.cachefiles.read().contains_key(&cachefile.id()) {
            return Err(CachetableError::CachefileClosed(cachefile.id()));
        }
        self.shared.checkpointer.exclude_from_rounds(cachefile);
        cachefile.jobs().wait_idle();

        if let Err(err) = self.write_out(cachefile, true) {
            cachefile.set_closing(false);
            return Err(err);
        }

        self.shared.cachefiles.write().remove(&cachefile.id());
        let closed = cachefile.callbacks().close(cachefile);
        info!(cachefile = %cachefile.id(), name = cachefile.name(), "cachefile closed");
        closed.map_err(|cause| CachetableError::CachefileClose {
            cachefile: cachefile.id(),
            cause,
        })
    }

    fn write_out(&self, cachefile: &Arc<Cachefile>, evict: bool) -> Result<()> {
        let pairs = self.shared.table.read().pairs_of(cachefile.id());
        let pinned = pairs.iter().filter(|pair| pair.state().pin_count > 0).count();
        if pinned > 0 {
            return Err(CachetableError::PinnedPairs {
                cachefile: cachefile.id(),
                count: pinned,
            });
        }

        let params = if evict {
            FlushParams::close()
        } else {
            FlushParams::write_back()
        };
        for pair in pairs {
            let lock = pair.write_lock();
            let Some(value) = (*lock).as_ref() else {
                continue;
            };
            let (dirty, attr) = {
                let mut state = pair.acquire_disk();
                if state.removed {
                    pair.release_disk(&mut state);
                    continue;
                }
                (state.dirty, state.attr)
            };

            if dirty {
                match pair.flush(value, attr, params) {
                    Ok(new_attr) => {
                        let mut state = pair.state();
                        self.shared.budget.replace(&state.attr, &new_attr);
                        state.attr = new_attr;
                        state.dirty = false;
                    }
                    Err(err) => {
                        pair.release_disk(&mut pair.state());
                        return Err(err);
                    }
                }
            }

            if evict {
                let mut table = self.shared.table.write();
                let mut state = pair.state();
                pair.release_disk(&mut state);
                debug_assert!(!state.checkpoint_pending, "closing cachefile with pending PAIR");
                state.removed = true;
                self.shared.budget.remove(&state.attr);
                table.remove(pair.id);
                drop(state);
                drop(table);
                self.shared.policy.lock().forget(pair.id);
            } else {
                pair.release_disk(&mut pair.state());
            }
        }
        Ok(())
    }

    /// Starts a checkpoint round at `lsn`. Returns the number of PAIRs
    /// marked pending.
    pub fn begin_checkpoint(&self, lsn: Lsn) -> Result<usize> {
        self.shared.checkpointer.begin(&self.shared, lsn)
    }

    /// Writes every PAIR still pending and finishes the round.
    /// `user_checkpoint` runs after all PAIRs and per-file checkpoint hooks,
    /// `user_end` after the per-file end hooks.
    pub fn end_checkpoint<C, E>(&self, user_checkpoint: C, user_end: E) -> Result<CheckpointInfo>
    where
        C: FnOnce(),
        E: FnOnce(),
    {
        self.shared.checkpointer.end(&self.shared, user_checkpoint, user_end)
    }

    /// Runs a whole round with no user callbacks.
    pub fn checkpoint(&self, lsn: Lsn) -> Result<CheckpointInfo> {
        self.begin_checkpoint(lsn)?;
        self.end_checkpoint(|| {}, || {})
    }

    pub fn checkpoint_in_progress(&self) -> bool {
        self.shared.checkpointer.in_progress()
    }

    pub fn checkpoints_completed(&self) -> u64 {
        self.shared.checkpointer.rounds()
    }

    /// Holds off `begin_checkpoint` while several pins make one logical
    /// change.
    pub fn multi_operation_lock(&self) -> MultiOperationGuard<'_> {
        self.shared.checkpointer.multi_operation_read()
    }

    pub fn key_state(&self, cachefile: &Cachefile, key: BlockKey, hash: u32) -> Option<KeyState> {
        let pair = self.shared.table.read().find(cachefile.id(), key, hash)?;
        let state = pair.state();
        Some(KeyState {
            dirty: state.dirty,
            pin_count: state.pin_count,
            checkpoint_pending: state.checkpoint_pending,
            write_in_flight: state.disk_busy,
            attr: state.attr,
        })
    }

    pub fn contains(&self, cachefile: &Cachefile, key: BlockKey, hash: u32) -> bool {
        self.shared
            .table
            .read()
            .find(cachefile.id(), key, hash)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.shared.table.read().pending_len()
    }

    pub fn budget(&self) -> BudgetStats {
        self.shared.budget.stats()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn capacity(&self) -> usize {
        self.shared.budget.limit()
    }

    pub fn set_capacity(&self, bytes: usize) {
        self.shared.budget.set_limit(bytes);
        self.shared.wake_evictor_if_needed();
    }

    pub fn cleaner_period(&self) -> Duration {
        self.shared.cleaner.period()
    }

    pub fn set_cleaner_period(&self, period: Duration) {
        self.shared.cleaner.set_period(period);
    }

    pub fn cleaner_iterations(&self) -> usize {
        self.shared.cleaner.iterations()
    }

    pub fn set_cleaner_iterations(&self, iterations: usize) {
        self.shared.cleaner.set_iterations(iterations);
    }

    /// Runs one cleaner round on the calling thread. Returns true if a
    /// cleaner callback was invoked.
    pub fn run_cleaner_once(&self) -> bool {
        cleaner::run_once(&self.shared)
    }

    /// Runs one eviction pass on the calling thread. Returns the bytes
    /// freed.
    pub fn run_eviction_pass(&self) -> usize {
        evictor::run_pass(&self.shared)
    }

    pub fn eviction_passes(&self) -> u64 {
        self.shared.evictor.passes()
    }
}

impl<V: Send + Sync + 'static> Drop for Cachetable<V> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.evictor.notify_shutdown();
        self.shared.cleaner.poke();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("cachetable worker thread panicked");
            }
        }

        let open: Vec<Arc<Cachefile>> = self.shared.cachefiles.read().values().cloned().collect();
        for cachefile in open {
            warn!(cachefile = %cachefile.id(), name = cachefile.name(), "closing cachefile left open at shutdown");
            if let Err(err) = self.close_cachefile(&cachefile) {
                warn!(cachefile = %cachefile.id(), error = %err, "close at shutdown failed");
            }
        }

        let remaining = self.shared.table.read().len();
        if remaining > 0 {
            warn!(remaining, "cachetable dropped with PAIRs still cached");
        }
        // A second panic while unwinding would abort.
        assert!(
            remaining == 0 || thread::panicking(),
            "cachetable dropped with {remaining} PAIRs still cached"
        );
        debug!("cachetable stopped");
    }
}

impl<V: Send + Sync + 'static> std::fmt::Debug for Cachetable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cachetable")
            .field("pairs", &self.len())
            .field("cachefiles", &self.cachefile_count())
            .field("budget", &self.budget())
            .finish()
    }
}
