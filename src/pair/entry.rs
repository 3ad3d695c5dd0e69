use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, MutexGuard, RawRwLock, RwLock};

use crate::cachefile::Cachefile;
use crate::error::{CachetableError, Result};
use crate::pair::{BlockKey, FlushParams, PairAttr, PairCallbacks};
use crate::table::PairId;

pub(crate) type ValueLock<V> = RwLock<Option<V>>;
pub(crate) type ReadLock<V> = ArcRwLockReadGuard<RawRwLock, Option<V>>;
pub(crate) type WriteLock<V> = ArcRwLockWriteGuard<RawRwLock, Option<V>>;

/// Mutable bookkeeping of a PAIR, guarded by [`Pair::state`].
///
/// `checkpoint_pending` is only changed while the table lock is also held
/// for writing, so it always agrees with the table's pending list.
#[derive(Debug, Default)]
pub(crate) struct PairState {
    pub attr: PairAttr,
    pub dirty: bool,
    pub checkpoint_pending: bool,
    /// A write of this PAIR (inline or of a clone) is in flight.
    pub disk_busy: bool,
    /// The PAIR left the table. Threads that were waiting on its value lock
    /// must look it up again.
    pub removed: bool,
    pub pin_count: u32,
}

pub(crate) struct Pair<V: Send + Sync + 'static> {
    pub id: PairId,
    pub cachefile: Arc<Cachefile>,
    pub key: BlockKey,
    pub hash: u32,
    pub callbacks: Arc<dyn PairCallbacks<V>>,
    /// `None` while the value is being fetched.
    pub value: Arc<ValueLock<V>>,
    state: Mutex<PairState>,
    disk_idle: Condvar,
}

impl<V: Send + Sync + 'static> Pair<V> {
    pub fn new(
        id: PairId,
        cachefile: Arc<Cachefile>,
        key: BlockKey,
        hash: u32,
        callbacks: Arc<dyn PairCallbacks<V>>,
        value: Option<V>,
        state: PairState,
    ) -> Self {
        Self {
            id,
            cachefile,
            key,
            hash,
            callbacks,
            value: Arc::new(RwLock::new(value)),
            state: Mutex::new(state),
            disk_idle: Condvar::new(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, PairState> {
        self.state.lock()
    }

    pub fn read_lock(&self) -> ReadLock<V> {
        self.value.read_arc()
    }

    pub fn write_lock(&self) -> WriteLock<V> {
        self.value.write_arc()
    }

    pub fn try_read_lock(&self) -> Option<ReadLock<V>> {
        self.value.try_read_arc()
    }

    pub fn try_write_lock(&self) -> Option<WriteLock<V>> {
        self.value.try_write_arc()
    }

    pub fn wait_for_disk(&self, state: &mut MutexGuard<'_, PairState>) {
        while state.disk_busy {
            self.disk_idle.wait(state);
        }
    }

    /// Waits for any in-flight write of the PAIR, then claims the disk.
    pub fn acquire_disk(&self) -> MutexGuard<'_, PairState> {
        let mut state = self.state.lock();
        self.wait_for_disk(&mut state);
        state.disk_busy = true;
        state
    }

    pub fn release_disk(&self, state: &mut MutexGuard<'_, PairState>) {
        debug_assert!(state.disk_busy, "releasing disk of PAIR {:?} that is idle", self.key);
        state.disk_busy = false;
        self.disk_idle.notify_all();
    }

    pub fn flush(&self, value: &V, attr: PairAttr, params: FlushParams) -> Result<PairAttr> {
        self.callbacks
            .flush(&self.cachefile, self.key, value, attr, params)
            .map_err(|cause| CachetableError::Flush {
                cachefile: self.cachefile.id(),
                key: self.key,
                cause,
            })
    }
}

impl<V: Send + Sync + 'static> std::fmt::Debug for Pair<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pair")
            .field("id", &self.id)
            .field("cachefile", &self.cachefile.id())
            .field("key", &self.key)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}
