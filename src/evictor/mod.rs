//! # Evictor
//!
//! Background thread that keeps the cache near its capacity.
//!
//! ## Watermarks
//!
//! ```text
//!   size
//!    ^
//!    |  150% high            clients adding weight stall above this
//!    |  125% high hysteresis stalled clients resume at or below this
//!    |  110% low hysteresis  unpins and inserts wake the evictor above this
//!    |  100% low             the evictor works until size falls to this
//!    +------------------------------------------------------------------
//! ```
//!
//! ## Pass
//!
//! A pass asks the [`EvictionPolicy`] for candidates until the size is at or
//! below the low watermark, or it has examined `EVICTOR_SWEEP_FACTOR` times
//! the number of cached PAIRs. A candidate is only taken if its value lock
//! can be write-locked without waiting and it is unpinned, not
//! checkpoint-pending and not being written. Dirty candidates are flushed
//! with `keep_me == false` before removal; a failed flush leaves the PAIR
//! cached and dirty. The checkpoint pending lock is held shared from the
//! candidate check to the removal, so a round cannot begin and mark a victim
//! pending halfway through.
//!
//! ## Back-Pressure
//!
//! [`Evictor::wait_for_space`] blocks a client until the cache is back under
//! the high hysteresis, or until a pass completes without freeing anything.
//! The second exit keeps clients moving when every PAIR is pinned, at the
//! cost of temporarily exceeding the high watermark.

mod policy;

pub use policy::{EvictionPolicy, EvictionPolicyKind, LruPolicy, SievePolicy};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::cachetable::Shared;
use crate::config::EVICTOR_SWEEP_FACTOR;
use crate::pair::entry::Pair;
use crate::pair::FlushParams;

#[derive(Debug, Default)]
struct EvictorSignal {
    wake: bool,
    passes: u64,
    last_pass_freed: usize,
}

pub(crate) struct Evictor {
    signal: Mutex<EvictorSignal>,
    wakeup: Condvar,
    pass_done: Condvar,
    period: Duration,
}

impl Evictor {
    pub fn new(period: Duration) -> Self {
        Self {
            signal: Mutex::new(EvictorSignal::default()),
            wakeup: Condvar::new(),
            pass_done: Condvar::new(),
            period,
        }
    }

    pub fn signal(&self) {
        let mut signal = self.signal.lock();
        signal.wake = true;
        self.wakeup.notify_one();
    }

    pub fn notify_shutdown(&self) {
        let _signal = self.signal.lock();
        self.wakeup.notify_all();
        self.pass_done.notify_all();
    }

    pub fn passes(&self) -> u64 {
        self.signal.lock().passes
    }

    pub fn wait_for_space<V: Send + Sync + 'static>(&self, shared: &Shared<V>) {
        if !shared.budget.should_stall_clients() {
            return;
        }
        shared.stats.client_stalls.fetch_add(1, Ordering::Relaxed);
        debug!(
            current = shared.budget.current(),
            limit = shared.budget.limit(),
            "client stalled on cache pressure"
        );

        let mut signal = self.signal.lock();
        loop {
            if shared.budget.clients_may_resume() || shared.is_shutting_down() {
                return;
            }
            signal.wake = true;
            self.wakeup.notify_one();

            let seen = signal.passes;
            self.pass_done.wait_for(&mut signal, self.period);
            if signal.passes > seen && signal.last_pass_freed == 0 {
                trace!("evictor made no progress, releasing stalled client");
                return;
            }
        }
    }

    /// Body of the evictor thread.
    pub fn run<V: Send + Sync + 'static>(shared: Arc<Shared<V>>) {
        debug!("evictor started");
        let evictor = &shared.evictor;
        let mut idle = true;
        loop {
            {
                let mut signal = evictor.signal.lock();
                let pressure = shared.budget.needs_eviction() && !idle;
                if !signal.wake && !pressure && !shared.is_shutting_down() {
                    evictor.wakeup.wait_for(&mut signal, evictor.period);
                }
                signal.wake = false;
            }
            if shared.is_shutting_down() {
                break;
            }

            let freed = if shared.budget.needs_eviction() {
                run_pass(&shared)
            } else {
                0
            };
            idle = freed == 0;

            let mut signal = evictor.signal.lock();
            signal.passes += 1;
            signal.last_pass_freed = freed;
            evictor.pass_done.notify_all();
        }
        debug!("evictor stopped");
    }
}

/// Evicts until the budget is at or below the low watermark. Returns the
/// number of bytes freed.
pub(crate) fn run_pass<V: Send + Sync + 'static>(shared: &Shared<V>) -> usize {
    let limit = shared.table.read().len() * EVICTOR_SWEEP_FACTOR;
    let mut freed = 0;
    let mut evicted = 0;

    for _ in 0..limit {
        if !shared.budget.needs_eviction() {
            break;
        }
        let Some(id) = shared.policy.lock().next_candidate() else {
            break;
        };
        let pair = shared.table.read().get(id).cloned();
        let Some(pair) = pair else {
            shared.policy.lock().forget(id);
            continue;
        };
        if let Some(bytes) = try_evict(shared, &pair) {
            freed += bytes;
            evicted += 1;
        }
    }

    if evicted > 0 {
        debug!(
            evicted,
            freed,
            current = shared.budget.current(),
            "eviction pass complete"
        );
    }
    freed
}

fn try_evict<V: Send + Sync + 'static>(shared: &Shared<V>, pair: &Arc<Pair<V>>) -> Option<usize> {
    let lock = pair.try_write_lock()?;
    let value = (*lock).as_ref()?;
    let _pending = shared.checkpointer.try_pending_read()?;

    let (dirty, attr) = {
        let mut state = pair.state();
        if state.removed || state.checkpoint_pending || state.disk_busy || state.pin_count > 0 {
            return None;
        }
        state.disk_busy = true;
        (state.dirty, state.attr)
    };

    if dirty {
        match pair.flush(value, attr, FlushParams::evict(true)) {
            Ok(new_attr) => {
                let mut state = pair.state();
                shared.budget.replace(&state.attr, &new_attr);
                state.attr = new_attr;
                state.dirty = false;
            }
            Err(err) => {
                warn!(
                    cachefile = %pair.cachefile.id(),
                    key = %pair.key,
                    error = %err,
                    "eviction write failed, keeping PAIR"
                );
                pair.release_disk(&mut pair.state());
                return None;
            }
        }
    }

    let mut table = shared.table.write();
    let mut state = pair.state();
    pair.release_disk(&mut state);
    debug_assert!(!state.checkpoint_pending, "evicting checkpoint-pending PAIR {:?}", pair.key);
    state.removed = true;
    let bytes = state.attr.size;
    shared.budget.remove(&state.attr);
    table.remove(pair.id);
    drop(state);
    drop(table);

    shared.policy.lock().forget(pair.id);
    shared.stats.evictions.fetch_add(1, Ordering::Relaxed);
    if dirty {
        shared.stats.eviction_writes.fetch_add(1, Ordering::Relaxed);
    }
    drop(lock);
    Some(bytes)
}
