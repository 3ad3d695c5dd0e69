//! # Checkpointer
//!
//! Produces a point-in-time image of every dirty PAIR without stopping
//! clients for the duration of the write-out.
//!
//! ## Round Lifecycle
//!
//! ```text
//!  begin_checkpoint(lsn)                        end_checkpoint()
//!  +-----------------------------------+        +------------------------------------+
//!  | multi-operation lock (exclusive)  |        | drain pending list:                |
//!  | per cachefile: note_pin,          |        |   lock PAIR, write it or a clone,  |
//!  |   for_checkpoint, log_fassociate, |        |   mark clean, unlink               |
//!  |   begin_checkpoint(lsn)           |        | wait for background clone writes   |
//!  | pending lock + table (exclusive): |        | per cachefile: checkpoint          |
//!  |   every dirty PAIR -> pending     |        | user checkpoint callback           |
//!  +-----------------------------------+        | per cachefile: end_checkpoint,     |
//!                                               |   clear for_checkpoint, note_unpin |
//!                                               | user end callback                  |
//!                                               +------------------------------------+
//! ```
//!
//! ## Snapshot Rule
//!
//! Between begin and end, a PAIR that is still pending holds exactly the
//! value it had at begin. Read pins cannot change that. A write pin of a
//! pending PAIR first gets the begin-time value written (or cloned, then
//! written in the background) and only then proceeds. The checkpointer
//! takes the PAIR's value lock before writing, so it never writes a value a
//! client is halfway through mutating.
//!
//! ## Locks
//!
//! | Lock | Exclusive holder | Shared holders |
//! |------|------------------|----------------|
//! | multi-operation | `begin_checkpoint` | clients grouping several pins into one logical change |
//! | pending | `begin_checkpoint` while marking | write pinners checking pending, dependent-pair writes, `put_with_dep_pairs` |
//!
//! Lock order for the whole crate: PAIR value lock, then pending lock, then
//! table lock, then PAIR state mutex.
//!
//! ## Failures
//!
//! A failed write leaves the PAIR dirty and removes it from the pending
//! list. `end_checkpoint` still completes the round (so the next one can
//! begin) but skips the per-cachefile and user checkpoint callbacks and
//! reports [`CachetableError::CheckpointIncomplete`].

mod write;

pub(crate) use write::write_pending_for_pinner;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::cachefile::{Cachefile, Lsn};
use crate::cachetable::Shared;
use crate::error::{CachetableError, Result};
use crate::pair::entry::{Pair, PairState};
use crate::table::PairTable;

/// Summary of a completed checkpoint round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub lsn: Lsn,
    pub cachefiles: usize,
    /// PAIRs marked pending by `begin_checkpoint`.
    pub pairs_pending: usize,
    /// Pending PAIRs written by the checkpointer itself. The rest were
    /// written by write pinners or removed before the checkpointer got to
    /// them.
    pub pairs_written: usize,
    pub duration: Duration,
}

struct Round {
    lsn: Lsn,
    cachefiles: SmallVec<[Arc<Cachefile>; 8]>,
    pairs_pending: usize,
    started: Instant,
}

enum Phase {
    Idle,
    Begun(Round),
    Ending,
}

#[derive(Default)]
struct RoundFailures {
    count: usize,
    first: Option<CachetableError>,
}

pub(crate) struct Checkpointer {
    phase: Mutex<Phase>,
    round_done: Condvar,
    pending_lock: RwLock<()>,
    multi_operation: RwLock<()>,
    failures: Mutex<RoundFailures>,
    rounds: AtomicU64,
}

impl Checkpointer {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
            round_done: Condvar::new(),
            pending_lock: RwLock::new(()),
            multi_operation: RwLock::new(()),
            failures: Mutex::new(RoundFailures::default()),
            rounds: AtomicU64::new(0),
        }
    }

    pub fn in_progress(&self) -> bool {
        !matches!(*self.phase.lock(), Phase::Idle)
    }

    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Acquire)
    }

    pub fn pending_read(&self) -> RwLockReadGuard<'_, ()> {
        self.pending_lock.read()
    }

    /// Fails while a round is marking PAIRs pending or waiting to.
    pub fn try_pending_read(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.pending_lock.try_read()
    }

    pub fn multi_operation_read(&self) -> RwLockReadGuard<'_, ()> {
        self.multi_operation.read()
    }

    /// Fails while a checkpoint is beginning or waiting to begin.
    pub fn try_multi_operation_read(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.multi_operation.try_read()
    }

    pub fn record_failure(&self, err: CachetableError) {
        let mut failures = self.failures.lock();
        failures.count += 1;
        if failures.first.is_none() {
            failures.first = Some(err);
        }
    }

    /// Marks the cachefile as closing once no round is using it. Rounds
    /// begun afterwards skip it.
    pub fn exclude_from_rounds(&self, cachefile: &Cachefile) {
        let mut phase = self.phase.lock();
        while cachefile.for_checkpoint() {
            self.round_done.wait(&mut phase);
        }
        cachefile.set_closing(true);
    }

    pub fn begin<V: Send + Sync + 'static>(&self, shared: &Shared<V>, lsn: Lsn) -> Result<usize> {
        let _multi_operation = self.multi_operation.write();
        let mut phase = self.phase.lock();
        if !matches!(*phase, Phase::Idle) {
            return Err(CachetableError::CheckpointInProgress);
        }

        let cachefiles: SmallVec<[Arc<Cachefile>; 8]> = shared
            .cachefiles
            .read()
            .values()
            .filter(|cf| !cf.is_closing())
            .cloned()
            .collect();
        for cf in &cachefiles {
            cf.callbacks().note_pin(cf);
            cf.set_for_checkpoint(true);
            cf.callbacks().log_fassociate(cf);
            cf.callbacks().begin_checkpoint(cf, lsn);
        }

        let pairs_pending = {
            let _pending = self.pending_lock.write();
            let mut table = shared.table.write();
            assert_eq!(
                table.pending_len(),
                0,
                "pending list not drained by previous round"
            );
            let dirty: Vec<Arc<Pair<V>>> = table
                .iter()
                .filter(|pair| pair.cachefile.for_checkpoint())
                .cloned()
                .collect();
            let mut marked = 0;
            for pair in dirty {
                let mut state = pair.state();
                if state.dirty && !state.removed {
                    state.checkpoint_pending = true;
                    table.link_pending(pair.id);
                    marked += 1;
                }
            }
            marked
        };

        *self.failures.lock() = RoundFailures::default();
        *phase = Phase::Begun(Round {
            lsn,
            cachefiles,
            pairs_pending,
            started: Instant::now(),
        });
        debug!(lsn = %lsn, pairs_pending, "checkpoint begun");
        Ok(pairs_pending)
    }

    pub fn end<V, C, E>(
        &self,
        shared: &Arc<Shared<V>>,
        user_checkpoint: C,
        user_end: E,
    ) -> Result<CheckpointInfo>
    where
        V: Send + Sync + 'static,
        C: FnOnce(),
        E: FnOnce(),
    {
        let round = {
            let mut phase = self.phase.lock();
            match std::mem::replace(&mut *phase, Phase::Ending) {
                Phase::Begun(round) => round,
                other => {
                    *phase = other;
                    return Err(CachetableError::NoCheckpointInProgress);
                }
            }
        };

        let mut pairs_written = 0;
        loop {
            let next = {
                let table = shared.table.read();
                table.pending_head().and_then(|id| table.get(id).cloned())
            };
            let Some(pair) = next else {
                break;
            };
            if write::write_pending_for_checkpointer(shared, &pair) {
                pairs_written += 1;
            }
        }

        for cf in &round.cachefiles {
            cf.jobs().wait_idle();
        }

        let failures = std::mem::take(&mut *self.failures.lock());
        if failures.count == 0 {
            for cf in &round.cachefiles {
                cf.callbacks().checkpoint(cf);
            }
            user_checkpoint();
        } else {
            warn!(
                lsn = %round.lsn,
                failed = failures.count,
                "checkpoint writes failed, skipping checkpoint callbacks"
            );
        }

        for cf in &round.cachefiles {
            cf.callbacks().end_checkpoint(cf);
            cf.set_for_checkpoint(false);
            cf.callbacks().note_unpin(cf);
        }
        user_end();

        let info = CheckpointInfo {
            lsn: round.lsn,
            cachefiles: round.cachefiles.len(),
            pairs_pending: round.pairs_pending,
            pairs_written,
            duration: round.started.elapsed(),
        };
        {
            let mut phase = self.phase.lock();
            *phase = Phase::Idle;
            self.rounds.fetch_add(1, Ordering::AcqRel);
            self.round_done.notify_all();
        }

        match failures.first {
            Some(first) => Err(CachetableError::CheckpointIncomplete {
                failed: failures.count,
                cause: Box::new(first),
            }),
            None => {
                info!(
                    lsn = %info.lsn,
                    cachefiles = info.cachefiles,
                    pairs_pending = info.pairs_pending,
                    pairs_written = info.pairs_written,
                    duration_ms = info.duration.as_millis() as u64,
                    "checkpoint complete"
                );
                Ok(info)
            }
        }
    }
}

/// Takes the PAIR off the pending list. Caller holds the table write lock
/// and the PAIR's state mutex. Returns whether it was pending.
pub(crate) fn clear_pending<V: Send + Sync + 'static>(
    table: &mut PairTable<V>,
    pair: &Pair<V>,
    state: &mut PairState,
) -> bool {
    if !state.checkpoint_pending {
        return false;
    }
    state.checkpoint_pending = false;
    let unlinked = table.unlink_pending(pair.id);
    debug_assert!(unlinked, "pending flag set on PAIR missing from pending list");
    true
}
