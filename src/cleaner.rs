//! Cleaner thread.
//!
//! Every `cleaner_period` the cleaner runs `cleaner_iterations` rounds. Each
//! round samples up to [`CLEANER_CANDIDATES`] PAIRs from a rotating hand,
//! picks the one with the largest `cache_pressure_size` that is neither
//! pinned nor checkpoint-pending, write-locks it without waiting and hands
//! the pinned PAIR to the client's cleaner callback.
//!
//! A period of zero disables the cleaner until the period is changed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::cachetable::{PairGuard, PinMode, Shared};
use crate::config::CLEANER_CANDIDATES;

pub(crate) struct Cleaner {
    period_ms: AtomicU64,
    iterations: AtomicUsize,
    hand: Mutex<usize>,
    wake: Mutex<bool>,
    wakeup: Condvar,
}

impl Cleaner {
    pub fn new(period: Duration, iterations: usize) -> Self {
        Self {
            period_ms: AtomicU64::new(period.as_millis() as u64),
            iterations: AtomicUsize::new(iterations),
            hand: Mutex::new(0),
            wake: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.load(Ordering::Acquire))
    }

    pub fn set_period(&self, period: Duration) {
        self.period_ms.store(period.as_millis() as u64, Ordering::Release);
        self.poke();
    }

    pub fn iterations(&self) -> usize {
        self.iterations.load(Ordering::Acquire)
    }

    pub fn set_iterations(&self, iterations: usize) {
        self.iterations.store(iterations, Ordering::Release);
    }

    pub fn poke(&self) {
        let mut wake = self.wake.lock();
        *wake = true;
        self.wakeup.notify_all();
    }

    /// Body of the cleaner thread.
    pub fn run<V: Send + Sync + 'static>(shared: Arc<Shared<V>>) {
        debug!("cleaner started");
        let cleaner = &shared.cleaner;
        loop {
            {
                let mut wake = cleaner.wake.lock();
                if !*wake && !shared.is_shutting_down() {
                    let period = cleaner.period();
                    if period.is_zero() {
                        cleaner.wakeup.wait(&mut wake);
                    } else {
                        cleaner.wakeup.wait_for(&mut wake, period);
                    }
                }
                *wake = false;
            }
            if shared.is_shutting_down() {
                break;
            }
            if cleaner.period().is_zero() {
                continue;
            }
            for _ in 0..cleaner.iterations() {
                if shared.is_shutting_down() {
                    break;
                }
                run_once(&shared);
            }
        }
        debug!("cleaner stopped");
    }
}

/// One cleaner round. Returns true if the callback was invoked.
pub(crate) fn run_once<V: Send + Sync + 'static>(shared: &Arc<Shared<V>>) -> bool {
    let candidates = {
        let table = shared.table.read();
        let mut hand = shared.cleaner.hand.lock();
        table.sample(&mut hand, CLEANER_CANDIDATES)
    };

    let best = candidates
        .into_iter()
        .filter_map(|pair| {
            let state = pair.state();
            let eligible = !state.checkpoint_pending
                && !state.removed
                && state.pin_count == 0
                && state.attr.cache_pressure_size > 0;
            let score = state.attr.cache_pressure_size;
            drop(state);
            eligible.then_some((score, pair))
        })
        .max_by_key(|(score, _)| *score);

    let Some((score, pair)) = best else {
        return false;
    };
    // Held across the callback so no round can mark the PAIR pending while
    // the client is changing it.
    let Some(_multi_operation) = shared.checkpointer.try_multi_operation_read() else {
        trace!("checkpoint beginning, cleaner backs off");
        return false;
    };
    let Some(lock) = pair.try_write_lock() else {
        trace!(key = %pair.key, "cleaner candidate busy");
        return false;
    };
    {
        let mut state = pair.state();
        // Re-check under the lock: a checkpoint may have started, or the
        // PAIR may be gone or still being fetched.
        if state.checkpoint_pending || state.removed || lock.is_none() {
            return false;
        }
        state.pin_count += 1;
    }

    shared.stats.cleaner_runs.fetch_add(1, Ordering::Relaxed);
    trace!(
        cachefile = %pair.cachefile.id(),
        key = %pair.key,
        cache_pressure = score,
        "cleaner selected PAIR"
    );
    let callbacks = Arc::clone(&pair.callbacks);
    let cachefile = pair.cachefile.id();
    let key = pair.key;
    let guard = PairGuard::from_write(Arc::clone(shared), pair, PinMode::WriteExpensive, lock);
    if let Err(err) = callbacks.cleaner(guard) {
        warn!(cachefile = %cachefile, key = %key, error = %err, "cleaner callback failed");
    }
    true
}
