//! Pin, put, prefetch and remove.
//!
//! ## Get-and-Pin Flow
//!
//! ```text
//! lookup (table read lock)
//!   |-- miss --> wait for space --> insert placeholder (table write lock,
//!   |            value write-locked) --> fetch callback --> fill or discard
//!   |            --> partial fetch if the fetched value needs one
//!   |
//!   +-- hit ---> lock value in requested mode (blocking or try)
//!                  |-- PAIR removed while waiting --> start over
//!                  |-- partial fetch required --> upgrade, partial fetch, downgrade
//!                  +-- write pin --> pending lock (shared):
//!                                      PAIR pending --> write or clone it first
//!                                      dependent PAIRs --> write pending ones, set dirty
//! ```
//!
//! Read pins never look at the pending flag: a read cannot change the value
//! the checkpoint is going to write.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::background::spawn_job;
use crate::cachefile::Cachefile;
use crate::checkpoint::{clear_pending, write_pending_for_pinner};
use crate::error::{CachetableError, Result};
use crate::pair::entry::{Pair, PairState, WriteLock};
use crate::pair::{BlockKey, PairAttr, PairCallbacks};

use super::guard::Held;
use super::{Cachetable, PairGuard, PinMode, Shared};

/// A PAIR the caller already holds write-pinned, passed to the
/// `*_with_dep_pairs` operations.
///
/// If the dependent PAIR is checkpoint-pending it is written before the
/// operation returns, and if `dirty` is set its dirty bit is set while the
/// pending lock is still held, so a checkpoint either sees both the new
/// PAIR and the dirtied dependents or neither.
pub struct DependentPair<'a, V: Send + Sync + 'static> {
    pub guard: &'a mut PairGuard<V>,
    pub dirty: bool,
}

impl<'a, V: Send + Sync + 'static> DependentPair<'a, V> {
    pub fn new(guard: &'a mut PairGuard<V>, dirty: bool) -> Self {
        Self { guard, dirty }
    }
}

fn lock_value<V: Send + Sync + 'static>(pair: &Pair<V>, mode: PinMode, wait: bool) -> Option<Held<V>> {
    match (mode.is_write(), wait) {
        (false, true) => Some(Held::Read(pair.read_lock())),
        (false, false) => pair.try_read_lock().map(Held::Read),
        (true, true) => Some(Held::Write(pair.write_lock())),
        (true, false) => pair.try_write_lock().map(Held::Write),
    }
}

fn try_again<V: Send + Sync + 'static, T>(shared: &Shared<V>) -> Result<T> {
    shared.stats.try_again.fetch_add(1, Ordering::Relaxed);
    Err(CachetableError::TryAgain)
}

/// Inserts an empty PAIR and returns it write-locked. Returns `None` if the
/// key appeared in the meantime.
fn insert_placeholder<V: Send + Sync + 'static>(
    shared: &Shared<V>,
    cachefile: &Arc<Cachefile>,
    key: BlockKey,
    hash: u32,
    callbacks: &Arc<dyn PairCallbacks<V>>,
) -> Option<(Arc<Pair<V>>, WriteLock<V>)> {
    let (pair, lock) = {
        let mut table = shared.table.write();
        if table.find(cachefile.id(), key, hash).is_some() {
            return None;
        }
        let pair = table.insert(|id| {
            Pair::new(
                id,
                Arc::clone(cachefile),
                key,
                hash,
                Arc::clone(callbacks),
                None,
                PairState::default(),
            )
        });
        let lock = pair
            .try_write_lock()
            .expect("INVARIANT: a PAIR nobody else has seen is unlocked");
        (pair, lock)
    };
    shared.policy.lock().admit(pair.id);
    Some((pair, lock))
}

fn discard_placeholder<V: Send + Sync + 'static>(shared: &Shared<V>, pair: &Pair<V>) {
    {
        let mut table = shared.table.write();
        let mut state = pair.state();
        state.removed = true;
        table.remove(pair.id);
    }
    shared.policy.lock().forget(pair.id);
}

/// Runs the fetch callback into a write-locked placeholder. On failure the
/// placeholder is removed again.
fn fill_placeholder<V: Send + Sync + 'static>(
    shared: &Shared<V>,
    pair: &Pair<V>,
    lock: &mut WriteLock<V>,
) -> Result<()> {
    shared.stats.misses.fetch_add(1, Ordering::Relaxed);
    match pair.callbacks.fetch(&pair.cachefile, pair.key, pair.hash) {
        Ok(fetched) => {
            **lock = Some(fetched.value);
            {
                let mut state = pair.state();
                state.attr = fetched.attr;
                state.dirty = fetched.dirty;
            }
            shared.budget.add(&fetched.attr);
            shared.wake_evictor_if_needed();
            Ok(())
        }
        Err(cause) => {
            shared.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
            discard_placeholder(shared, pair);
            Err(CachetableError::Fetch {
                cachefile: pair.cachefile.id(),
                key: pair.key,
                cause,
            })
        }
    }
}

/// Runs the PAIR's partial fetch callback under a write lock.
fn partial_fetch_locked<V: Send + Sync + 'static>(
    shared: &Shared<V>,
    pair: &Pair<V>,
    lock: &mut WriteLock<V>,
    wait: bool,
) -> Result<()> {
    let attr = {
        let mut state = pair.state();
        if state.disk_busy {
            if !wait {
                drop(state);
                return try_again(shared);
            }
            pair.wait_for_disk(&mut state);
        }
        state.attr
    };
    let value = (**lock)
        .as_mut()
        .expect("INVARIANT: a loaded PAIR holds a value");
    let new_attr = pair
        .callbacks
        .partial_fetch(&pair.cachefile, pair.key, value, attr)
        .map_err(|cause| CachetableError::PartialFetch {
            cachefile: pair.cachefile.id(),
            key: pair.key,
            cause,
        })?;

    let mut state = pair.state();
    shared.budget.replace(&state.attr, &new_attr);
    state.attr = new_attr;
    shared.stats.partial_fetches.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Makes sure the locked value is fully fetched. Returns `None` if the PAIR
/// was removed while the lock was being upgraded.
fn ensure_full<V: Send + Sync + 'static>(
    shared: &Shared<V>,
    pair: &Pair<V>,
    held: Held<V>,
    wait: bool,
) -> Result<Option<Held<V>>> {
    let required = held
        .value()
        .is_some_and(|value| pair.callbacks.partial_fetch_required(value));
    if !required {
        return Ok(Some(held));
    }

    match held {
        Held::Write(mut lock) => {
            partial_fetch_locked(shared, pair, &mut lock, wait)?;
            Ok(Some(Held::Write(lock)))
        }
        Held::Read(read) => {
            drop(read);
            let mut lock = if wait {
                pair.write_lock()
            } else {
                match pair.try_write_lock() {
                    Some(lock) => lock,
                    None => return try_again(shared),
                }
            };
            if pair.state().removed {
                return Ok(None);
            }
            let still_required = (*lock)
                .as_ref()
                .is_some_and(|value| pair.callbacks.partial_fetch_required(value));
            if still_required {
                partial_fetch_locked(shared, pair, &mut lock, wait)?;
            }
            Ok(Some(Held::Read(WriteLock::downgrade(lock))))
        }
    }
}

impl<V: Send + Sync + 'static> Cachetable<V> {
    fn check_open(&self, cachefile: &Cachefile) -> Result<()> {
        if self.shared.is_shutting_down() {
            return Err(CachetableError::ShuttingDown);
        }
        if cachefile.is_closing() {
            return Err(CachetableError::CachefileClosed(cachefile.id()));
        }
        Ok(())
    }

    fn pin(
        &self,
        cachefile: &Arc<Cachefile>,
        key: BlockKey,
        hash: u32,
        callbacks: &Arc<dyn PairCallbacks<V>>,
        mode: PinMode,
        wait: bool,
    ) -> Result<PairGuard<V>> {
        self.check_open(cachefile)?;
        let shared = &self.shared;
        loop {
            let found = shared.table.read().find(cachefile.id(), key, hash);
            let Some(pair) = found else {
                if wait {
                    shared.evictor.wait_for_space(shared);
                } else if shared.budget.should_stall_clients() {
                    return try_again(shared);
                }
                let Some((pair, mut lock)) = insert_placeholder(shared, cachefile, key, hash, callbacks)
                else {
                    continue;
                };
                fill_placeholder(shared, &pair, &mut lock)?;
                let required = (*lock)
                    .as_ref()
                    .is_some_and(|value| pair.callbacks.partial_fetch_required(value));
                if required {
                    partial_fetch_locked(shared, &pair, &mut lock, wait)?;
                }
                pair.state().pin_count += 1;
                let held = if mode.is_write() {
                    Held::Write(lock)
                } else {
                    Held::Read(WriteLock::downgrade(lock))
                };
                return Ok(PairGuard::new(Arc::clone(shared), pair, mode, held));
            };

            let Some(held) = lock_value(&pair, mode, wait) else {
                return try_again(shared);
            };
            if pair.state().removed {
                // Fetch failed or the PAIR was removed while we waited.
                continue;
            }
            let Some(held) = ensure_full(shared, &pair, held, wait)? else {
                continue;
            };

            {
                let mut state = pair.state();
                let stalls = match mode {
                    PinMode::Read => false,
                    PinMode::WriteCheap => {
                        state.checkpoint_pending
                            && (!pair.callbacks.supports_clone() || state.disk_busy)
                    }
                    PinMode::WriteExpensive => state.checkpoint_pending || state.disk_busy,
                };
                if !wait && stalls {
                    drop(state);
                    return try_again(shared);
                }
                state.pin_count += 1;
            }
            shared.stats.hits.fetch_add(1, Ordering::Relaxed);
            shared.policy.lock().touch(pair.id);
            return Ok(PairGuard::new(Arc::clone(shared), pair, mode, held));
        }
    }

    /// Writes the pinned PAIR first if it is checkpoint-pending, then does
    /// the same for every dependent PAIR and sets their dirty bits.
    fn settle_checkpoint(
        &self,
        guard: &mut PairGuard<V>,
        dependents: &mut [DependentPair<'_, V>],
    ) -> Result<()> {
        if !guard.mode().is_write() && dependents.is_empty() {
            return Ok(());
        }
        let _pending = self.shared.checkpointer.pending_read();
        if guard.mode().is_write() {
            let pair = Arc::clone(guard.pair());
            let mode = guard.mode();
            write_pending_for_pinner(&self.shared, &pair, &mut **guard, mode)?;
        }
        self.checkpoint_dependents(dependents)
    }

    /// Caller holds the pending lock shared.
    fn checkpoint_dependents(&self, dependents: &mut [DependentPair<'_, V>]) -> Result<()> {
        for dep in dependents.iter_mut() {
            assert!(
                dep.guard.mode().is_write(),
                "dependent PAIR {} must be write-pinned",
                dep.guard.key()
            );
            let pair = Arc::clone(dep.guard.pair());
            let mode = dep.guard.mode();
            write_pending_for_pinner(&self.shared, &pair, &mut **dep.guard, mode)?;
            if dep.dirty {
                dep.guard.mark_dirty_now();
            }
        }
        Ok(())
    }

    /// Pins the PAIR for `(cachefile, key)`, fetching it on a miss. Blocks
    /// on other pinners, on memory pressure and, for write pins of a
    /// checkpoint-pending PAIR, on the checkpoint write of its old value.
    /// A [`PinMode::WriteExpensive`] pin also waits for a background clone
    /// write of the PAIR to finish.
    pub fn get_and_pin(
        &self,
        cachefile: &Arc<Cachefile>,
        key: BlockKey,
        hash: u32,
        callbacks: &Arc<dyn PairCallbacks<V>>,
        mode: PinMode,
    ) -> Result<PairGuard<V>> {
        self.get_and_pin_with_dep_pairs(cachefile, key, hash, callbacks, mode, &mut [])
    }

    pub fn get_and_pin_with_dep_pairs(
        &self,
        cachefile: &Arc<Cachefile>,
        key: BlockKey,
        hash: u32,
        callbacks: &Arc<dyn PairCallbacks<V>>,
        mode: PinMode,
        dependents: &mut [DependentPair<'_, V>],
    ) -> Result<PairGuard<V>> {
        let mut guard = self.pin(cachefile, key, hash, callbacks, mode, true)?;
        self.settle_checkpoint(&mut guard, dependents)?;
        Ok(guard)
    }

    /// Like [`get_and_pin`](Self::get_and_pin) but returns
    /// `CachetableError::TryAgain` instead of waiting for another pinner,
    /// for memory, or for an inline checkpoint write. An expensive write pin
    /// of a checkpoint-pending PAIR, or of one whose write is in flight, is
    /// refused the same way. A miss still fetches on the calling thread.
    pub fn get_and_pin_nonblocking(
        &self,
        cachefile: &Arc<Cachefile>,
        key: BlockKey,
        hash: u32,
        callbacks: &Arc<dyn PairCallbacks<V>>,
        mode: PinMode,
    ) -> Result<PairGuard<V>> {
        let mut guard = self.pin(cachefile, key, hash, callbacks, mode, false)?;
        self.settle_checkpoint(&mut guard, &mut [])?;
        Ok(guard)
    }

    fn try_pin_cached(
        &self,
        cachefile: &Cachefile,
        key: BlockKey,
        hash: u32,
        mode: PinMode,
        want_dirty: bool,
    ) -> Option<PairGuard<V>> {
        if self.check_open(cachefile).is_err() {
            return None;
        }
        let pair = self.shared.table.read().find(cachefile.id(), key, hash)?;
        let held = lock_value(&pair, mode, false)?;
        {
            let mut state = pair.state();
            if state.removed
                || state.pin_count > 0
                || state.dirty != want_dirty
                || state.checkpoint_pending
                || held.value().is_none()
            {
                return None;
            }
            state.pin_count += 1;
        }
        self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
        self.shared.policy.lock().touch(pair.id);
        Some(PairGuard::new(Arc::clone(&self.shared), pair, mode, held))
    }

    /// Pins the PAIR only if it is cached, dirty, unpinned, not
    /// checkpoint-pending and its lock is free. Never blocks or fetches.
    pub fn maybe_get_and_pin(
        &self,
        cachefile: &Cachefile,
        key: BlockKey,
        hash: u32,
        mode: PinMode,
    ) -> Option<PairGuard<V>> {
        self.try_pin_cached(cachefile, key, hash, mode, true)
    }

    /// Pins the PAIR only if it is cached, clean, unpinned and its lock is
    /// free. Never blocks or fetches.
    pub fn maybe_get_and_pin_clean(
        &self,
        cachefile: &Cachefile,
        key: BlockKey,
        hash: u32,
        mode: PinMode,
    ) -> Option<PairGuard<V>> {
        self.try_pin_cached(cachefile, key, hash, mode, false)
    }

    fn insert_new(
        &self,
        cachefile: &Arc<Cachefile>,
        key: BlockKey,
        hash: u32,
        value: V,
        attr: PairAttr,
        callbacks: &Arc<dyn PairCallbacks<V>>,
    ) -> PairGuard<V> {
        let shared = &self.shared;
        let (pair, lock) = {
            let mut table = shared.table.write();
            let pair = table.insert(|id| {
                Pair::new(
                    id,
                    Arc::clone(cachefile),
                    key,
                    hash,
                    Arc::clone(callbacks),
                    Some(value),
                    PairState {
                        attr,
                        dirty: true,
                        pin_count: 1,
                        ..PairState::default()
                    },
                )
            });
            let lock = pair
                .try_write_lock()
                .expect("INVARIANT: a PAIR nobody else has seen is unlocked");
            (pair, lock)
        };
        shared.policy.lock().admit(pair.id);
        shared.budget.add(&attr);
        shared.stats.puts.fetch_add(1, Ordering::Relaxed);
        shared.wake_evictor_if_needed();
        PairGuard::from_write(Arc::clone(shared), pair, PinMode::WriteCheap, lock)
    }

    /// Adds a freshly built value under a new key. The PAIR starts dirty and
    /// is returned write-pinned.
    ///
    /// # Panics
    ///
    /// Panics if the key is already cached.
    pub fn put(
        &self,
        cachefile: &Arc<Cachefile>,
        key: BlockKey,
        hash: u32,
        value: V,
        attr: PairAttr,
        callbacks: &Arc<dyn PairCallbacks<V>>,
    ) -> Result<PairGuard<V>> {
        self.check_open(cachefile)?;
        self.shared.evictor.wait_for_space(&self.shared);
        Ok(self.insert_new(cachefile, key, hash, value, attr, callbacks))
    }

    /// Adds a new PAIR whose key is allocated by `allocate_key` while the
    /// pending lock is held, then settles the dependent PAIRs.
    ///
    /// Allocating under the pending lock means a checkpoint cannot begin
    /// between the allocation and the parents recording the new key.
    pub fn put_with_dep_pairs<F>(
        &self,
        cachefile: &Arc<Cachefile>,
        allocate_key: F,
        value: V,
        attr: PairAttr,
        callbacks: &Arc<dyn PairCallbacks<V>>,
        dependents: &mut [DependentPair<'_, V>],
    ) -> Result<PairGuard<V>>
    where
        F: FnOnce() -> (BlockKey, u32),
    {
        self.check_open(cachefile)?;
        self.shared.evictor.wait_for_space(&self.shared);
        let _pending = self.shared.checkpointer.pending_read();
        let (key, hash) = allocate_key();
        let guard = self.insert_new(cachefile, key, hash, value, attr, callbacks);
        self.checkpoint_dependents(dependents)?;
        Ok(guard)
    }

    /// Unpins a write-pinned PAIR and drops it from the cache. `remove_key`
    /// is told whether the PAIR was still checkpoint-pending, in which case
    /// the checkpoint in progress must also forget the block.
    ///
    /// # Panics
    ///
    /// Panics if the guard is a read pin.
    pub fn unpin_and_remove<F>(&self, guard: PairGuard<V>, remove_key: F)
    where
        F: FnOnce(&Cachefile, BlockKey, bool),
    {
        let (pair, lock) = guard.disarm();
        {
            let mut state = pair.state();
            pair.wait_for_disk(&mut state);
        }

        let for_checkpoint = {
            let mut table = self.shared.table.write();
            let mut state = pair.state();
            debug_assert_eq!(state.pin_count, 1, "removing PAIR {} pinned elsewhere", pair.key);
            let was_pending = clear_pending(&mut table, &pair, &mut state);
            state.removed = true;
            state.pin_count -= 1;
            self.shared.budget.remove(&state.attr);
            table.remove(pair.id);
            was_pending
        };
        self.shared.policy.lock().forget(pair.id);
        self.shared.stats.removals.fetch_add(1, Ordering::Relaxed);
        trace!(key = %pair.key, for_checkpoint, "PAIR removed");

        remove_key(&pair.cachefile, pair.key, for_checkpoint);
        drop(lock);
    }

    /// Starts loading the PAIR in the background. Returns true if a fetch or
    /// partial fetch was started. Never blocks the caller.
    pub fn prefetch(
        &self,
        cachefile: &Arc<Cachefile>,
        key: BlockKey,
        hash: u32,
        callbacks: &Arc<dyn PairCallbacks<V>>,
    ) -> Result<bool> {
        self.check_open(cachefile)?;
        let shared = &self.shared;

        let existing = shared.table.read().find(cachefile.id(), key, hash);
        if let Some(pair) = existing {
            return self.prefetch_partial(pair);
        }
        if shared.budget.should_stall_clients() {
            return Ok(false);
        }
        let Some((pair, lock)) = insert_placeholder(shared, cachefile, key, hash, callbacks) else {
            return Ok(false);
        };
        shared.stats.prefetches.fetch_add(1, Ordering::Relaxed);

        let job_shared = Arc::clone(shared);
        let job_pair = Arc::clone(&pair);
        let (job_lock_tx, job_lock_rx) = std::sync::mpsc::channel();
        let spawned = spawn_job(
            format!("cachetable-prefetch-{key}"),
            cachefile.jobs().add(),
            move || {
                let Ok(mut lock) = job_lock_rx.recv() else {
                    return;
                };
                if let Err(err) = fill_placeholder(&job_shared, &job_pair, &mut lock) {
                    warn!(key = %job_pair.key, error = %err, "prefetch failed");
                }
            },
        );
        match spawned {
            Ok(()) => {
                let _ = job_lock_tx.send(lock);
                Ok(true)
            }
            Err(err) => {
                discard_placeholder(shared, &pair);
                drop(lock);
                Err(err.into())
            }
        }
    }

    fn prefetch_partial(&self, pair: Arc<Pair<V>>) -> Result<bool> {
        let Some(lock) = pair.try_write_lock() else {
            return Ok(false);
        };
        let required = (*lock)
            .as_ref()
            .is_some_and(|value| pair.callbacks.partial_fetch_required(value));
        {
            let state = pair.state();
            if !required || state.removed || state.disk_busy {
                return Ok(false);
            }
        }
        self.shared.stats.prefetches.fetch_add(1, Ordering::Relaxed);

        let job_shared = Arc::clone(&self.shared);
        let job_pair = Arc::clone(&pair);
        let (job_lock_tx, job_lock_rx) = std::sync::mpsc::channel();
        spawn_job(
            format!("cachetable-partial-{}", pair.key),
            pair.cachefile.jobs().add(),
            move || {
                let Ok(mut lock) = job_lock_rx.recv() else {
                    return;
                };
                if let Err(err) = partial_fetch_locked(&job_shared, &job_pair, &mut lock, true) {
                    warn!(key = %job_pair.key, error = %err, "background partial fetch failed");
                }
            },
        )?;
        let _ = job_lock_tx.send(lock);
        Ok(true)
    }

    /// Runs a partial fetch on a PAIR the caller already holds write-pinned.
    ///
    /// # Panics
    ///
    /// Panics if the guard is a read pin.
    pub fn pf_pinned_pair<F>(&self, guard: &mut PairGuard<V>, partial_fetch: F) -> Result<()>
    where
        F: FnOnce(&Cachefile, BlockKey, &mut V, PairAttr) -> eyre::Result<PairAttr>,
    {
        assert!(
            guard.mode().is_write(),
            "partial fetch of PAIR {} requires a write pin",
            guard.key()
        );
        let pair = Arc::clone(guard.pair());
        let attr = {
            let mut state = pair.state();
            pair.wait_for_disk(&mut state);
            state.attr
        };
        let new_attr = partial_fetch(&pair.cachefile, pair.key, &mut **guard, attr).map_err(|cause| {
            CachetableError::PartialFetch {
                cachefile: pair.cachefile.id(),
                key: pair.key,
                cause,
            }
        })?;

        let mut state = pair.state();
        self.shared.budget.replace(&state.attr, &new_attr);
        state.attr = new_attr;
        self.shared.stats.partial_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
