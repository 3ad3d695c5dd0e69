//! Writing checkpoint-pending PAIRs.
//!
//! Both the checkpointer and write pinners end up here. Whoever gets the
//! PAIR's value lock first while it is still pending writes it; the other
//! finds the pending flag cleared and moves on.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::background::spawn_job;
use crate::cachetable::{PinMode, Shared};
use crate::error::{CachetableError, Result};
use crate::pair::entry::Pair;
use crate::pair::{ClonedValue, FlushParams, PairAttr};

use super::clear_pending;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnFailure {
    /// The pinner gives up its pin; the checkpointer retries the PAIR.
    KeepPending,
    /// The checkpointer moves on; the PAIR stays dirty for the next round.
    Unlink,
}

/// Claims the disk of a pending PAIR. Returns `(dirty, attr)`, or `None` if
/// the PAIR is no longer pending. Caller holds the PAIR's value lock.
fn claim_pending<V: Send + Sync + 'static>(pair: &Pair<V>) -> Option<(bool, PairAttr)> {
    let mut state = pair.state();
    if !state.checkpoint_pending {
        return None;
    }
    pair.wait_for_disk(&mut state);
    state.disk_busy = true;
    Some((state.dirty, state.attr))
}

fn clone_for_checkpoint<V: Send + Sync + 'static>(
    shared: &Shared<V>,
    pair: &Pair<V>,
    value: &mut V,
) -> Option<ClonedValue<V>> {
    match pair.callbacks.clone_value(value, true) {
        Ok(clone) => {
            shared.budget.add(&clone.attr);
            let mut table = shared.table.write();
            let mut state = pair.state();
            state.dirty = false;
            clear_pending(&mut table, pair, &mut state);
            Some(clone)
        }
        Err(cause) => {
            warn!(
                cachefile = %pair.cachefile.id(),
                key = %pair.key,
                error = %cause,
                "clone for checkpoint failed, writing in place"
            );
            None
        }
    }
}

/// Writes a clone and releases the PAIR's disk. Runs on the checkpointer
/// thread or on a background job thread.
fn write_clone<V: Send + Sync + 'static>(shared: &Shared<V>, pair: &Pair<V>, clone: ClonedValue<V>) {
    let result = pair.flush(&clone.value, clone.attr, FlushParams::checkpoint_clone());
    shared.budget.remove(&clone.attr);
    drop(clone);

    let mut state = pair.state();
    let failed = match result {
        Ok(_) => {
            shared.stats.checkpoint_writes.fetch_add(1, Ordering::Relaxed);
            None
        }
        Err(err) => {
            state.dirty = true;
            Some(err)
        }
    };
    pair.release_disk(&mut state);
    drop(state);

    if let Some(err) = failed {
        warn!(
            cachefile = %pair.cachefile.id(),
            key = %pair.key,
            error = %err,
            "checkpoint write of clone failed"
        );
        shared.checkpointer.record_failure(err);
    }
}

/// Writes the live value in place and releases the PAIR's disk.
fn write_in_place<V: Send + Sync + 'static>(
    shared: &Shared<V>,
    pair: &Pair<V>,
    value: &V,
    attr: PairAttr,
    dirty: bool,
    on_failure: OnFailure,
) -> Result<()> {
    let result = pair.flush(value, attr, FlushParams::checkpoint(dirty));

    let mut table = shared.table.write();
    let mut state = pair.state();
    let outcome = match result {
        Ok(new_attr) => {
            shared.budget.replace(&state.attr, &new_attr);
            state.attr = new_attr;
            state.dirty = false;
            clear_pending(&mut table, pair, &mut state);
            if dirty {
                shared.stats.checkpoint_writes.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }
        Err(err) => {
            if on_failure == OnFailure::Unlink {
                clear_pending(&mut table, pair, &mut state);
            }
            Err(err)
        }
    };
    pair.release_disk(&mut state);
    outcome
}

/// Checkpointer side: writes the PAIR if it is still pending. Returns true if
/// this call handled it.
pub(super) fn write_pending_for_checkpointer<V: Send + Sync + 'static>(
    shared: &Arc<Shared<V>>,
    pair: &Arc<Pair<V>>,
) -> bool {
    let result = if pair.callbacks.supports_clone() {
        let mut lock = pair.write_lock();
        let Some((dirty, attr)) = claim_pending(pair) else {
            return false;
        };
        let value = (*lock)
            .as_mut()
            .expect("INVARIANT: checkpoint-pending PAIR holds a value");
        if dirty {
            if let Some(clone) = clone_for_checkpoint(shared, pair, value) {
                drop(lock);
                shared.stats.clone_writes.fetch_add(1, Ordering::Relaxed);
                write_clone(shared, pair, clone);
                return true;
            }
        }
        write_in_place(shared, pair, value, attr, dirty, OnFailure::Unlink)
    } else {
        // Shared lock: readers keep going while the PAIR is written.
        let lock = pair.read_lock();
        let Some((dirty, attr)) = claim_pending(pair) else {
            return false;
        };
        let value = (*lock)
            .as_ref()
            .expect("INVARIANT: checkpoint-pending PAIR holds a value");
        write_in_place(shared, pair, value, attr, dirty, OnFailure::Unlink)
    };

    if let Err(err) = result {
        warn!(
            cachefile = %pair.cachefile.id(),
            key = %pair.key,
            error = %err,
            "checkpoint write failed, PAIR stays dirty"
        );
        shared.checkpointer.record_failure(err);
    }
    true
}

/// Pinner side: called with the PAIR write-locked and the pending lock held
/// shared. Gets the begin-time value written before the caller may modify
/// it.
///
/// Only a [`PinMode::WriteCheap`] pin may hand a clone to a background
/// writer. A [`PinMode::WriteExpensive`] pin first waits out any write of
/// the PAIR still in flight, then writes a pending value in place.
pub(crate) fn write_pending_for_pinner<V: Send + Sync + 'static>(
    shared: &Arc<Shared<V>>,
    pair: &Arc<Pair<V>>,
    value: &mut V,
    mode: PinMode,
) -> Result<()> {
    if !mode.may_clone() {
        let mut state = pair.state();
        pair.wait_for_disk(&mut state);
    }
    let Some((dirty, attr)) = claim_pending(pair) else {
        return Ok(());
    };

    if dirty && mode.may_clone() && pair.callbacks.supports_clone() {
        if let Some(clone) = clone_for_checkpoint(shared, pair, value) {
            shared.stats.clone_writes.fetch_add(1, Ordering::Relaxed);
            trace!(key = %pair.key, "writing checkpoint clone in background");
            let job_shared = Arc::clone(shared);
            let job_pair = Arc::clone(pair);
            let spawned = spawn_job(
                format!("cachetable-clone-{}", pair.key),
                pair.cachefile.jobs().add(),
                move || write_clone(&job_shared, &job_pair, clone),
            );
            if let Err(err) = spawned {
                // The clone went down with the closure; the round has lost
                // this PAIR.
                let mut state = pair.state();
                state.dirty = true;
                pair.release_disk(&mut state);
                drop(state);
                let err = CachetableError::from(err);
                shared.checkpointer.record_failure(CachetableError::Clone {
                    cachefile: pair.cachefile.id(),
                    key: pair.key,
                    cause: eyre::eyre!("background writer not started: {err}"),
                });
                return Err(err);
            }
            return Ok(());
        }
    }

    write_in_place(shared, pair, value, attr, dirty, OnFailure::KeepPending)
}
