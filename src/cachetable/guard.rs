//! Pin guards.
//!
//! A [`PairGuard`] is a pinned PAIR: it holds the PAIR's value lock (shared
//! for [`PinMode::Read`], exclusive otherwise) and counts as one pin until
//! it is unpinned or dropped. Dropping a guard is an unpin that leaves the
//! PAIR's dirty bit and attribute as they were.
//!
//! ```ignore
//! let mut node = table.get_and_pin(&cf, key, hash, &callbacks, PinMode::WriteCheap)?;
//! node.children.push(child);
//! node.unpin(true, Some(PairAttr::nonleaf(new_size, pressure)));
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::cachefile::Cachefile;
use crate::pair::entry::{Pair, ReadLock, WriteLock};
use crate::pair::{BlockKey, PairAttr};

use super::Shared;

/// Lock mode requested by a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// Shared pin. The value cannot be modified and checkpoint-pending state
    /// is ignored.
    Read,
    /// Exclusive pin for a short modification. A checkpoint-pending value
    /// is cloned and written in the background when the callbacks support it.
    WriteCheap,
    /// Exclusive pin that may be held for a long time, e.g. across I/O.
    /// Never takes the clone shortcut: it stalls behind any checkpoint write
    /// of the PAIR and writes a pending value in place.
    WriteExpensive,
}

impl PinMode {
    pub fn is_write(self) -> bool {
        !matches!(self, PinMode::Read)
    }

    pub(crate) fn may_clone(self) -> bool {
        matches!(self, PinMode::WriteCheap)
    }
}

pub(crate) enum Held<V> {
    Read(ReadLock<V>),
    Write(WriteLock<V>),
}

impl<V> Held<V> {
    pub fn value(&self) -> Option<&V> {
        match self {
            Held::Read(lock) => (**lock).as_ref(),
            Held::Write(lock) => (**lock).as_ref(),
        }
    }
}

pub struct PairGuard<V: Send + Sync + 'static> {
    shared: Arc<Shared<V>>,
    pair: Arc<Pair<V>>,
    mode: PinMode,
    held: Option<Held<V>>,
    dirty: bool,
    new_attr: Option<PairAttr>,
}

impl<V: Send + Sync + 'static> PairGuard<V> {
    /// Wraps a lock whose pin has already been counted.
    pub(crate) fn new(shared: Arc<Shared<V>>, pair: Arc<Pair<V>>, mode: PinMode, held: Held<V>) -> Self {
        debug_assert_eq!(mode.is_write(), matches!(held, Held::Write(_)));
        Self {
            shared,
            pair,
            mode,
            held: Some(held),
            dirty: false,
            new_attr: None,
        }
    }

    pub(crate) fn from_write(
        shared: Arc<Shared<V>>,
        pair: Arc<Pair<V>>,
        mode: PinMode,
        lock: WriteLock<V>,
    ) -> Self {
        Self::new(shared, pair, mode, Held::Write(lock))
    }

    pub fn key(&self) -> BlockKey {
        self.pair.key
    }

    pub fn hash(&self) -> u32 {
        self.pair.hash
    }

    pub fn cachefile(&self) -> &Arc<Cachefile> {
        &self.pair.cachefile
    }

    pub fn mode(&self) -> PinMode {
        self.mode
    }

    pub fn attr(&self) -> PairAttr {
        self.new_attr.unwrap_or_else(|| self.pair.state().attr)
    }

    /// Whether the PAIR is dirty, counting a dirty unpin this guard has
    /// already committed to.
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.pair.state().dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn set_attr(&mut self, attr: PairAttr) {
        self.new_attr = Some(attr);
    }

    /// Releases the pin, marking the PAIR dirty if `dirty` and replacing its
    /// attribute if `new_attr` is given.
    pub fn unpin(mut self, dirty: bool, new_attr: Option<PairAttr>) {
        self.dirty |= dirty;
        if new_attr.is_some() {
            self.new_attr = new_attr;
        }
        self.release();
    }

    pub(crate) fn pair(&self) -> &Arc<Pair<V>> {
        &self.pair
    }

    /// Sets the PAIR's dirty bit now rather than at unpin.
    pub(crate) fn mark_dirty_now(&mut self) {
        self.dirty = true;
        self.pair.state().dirty = true;
    }

    /// Takes the lock out of the guard without unpinning. The caller owns
    /// the pin from here on.
    pub(crate) fn disarm(mut self) -> (Arc<Pair<V>>, WriteLock<V>) {
        match self.held.take() {
            Some(Held::Write(lock)) => (Arc::clone(&self.pair), lock),
            _ => panic!("PAIR {} is not write-pinned", self.pair.key),
        }
    }

    fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        {
            let mut state = self.pair.state();
            if self.dirty {
                state.dirty = true;
            }
            if let Some(attr) = self.new_attr.take() {
                self.shared.budget.replace(&state.attr, &attr);
                state.attr = attr;
            }
            debug_assert!(state.pin_count > 0, "unpinning PAIR {} with no pins", self.pair.key);
            state.pin_count -= 1;
        }
        drop(held);
        if self.shared.budget.should_wake_evictor() {
            self.shared.evictor.signal();
        }
    }
}

impl<V: Send + Sync + 'static> Deref for PairGuard<V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.held
            .as_ref()
            .and_then(Held::value)
            .expect("INVARIANT: a pinned PAIR holds a value")
    }
}

impl<V: Send + Sync + 'static> DerefMut for PairGuard<V> {
    /// # Panics
    ///
    /// Panics if the PAIR is pinned with [`PinMode::Read`].
    fn deref_mut(&mut self) -> &mut V {
        let key = self.pair.key;
        match self.held.as_mut() {
            Some(Held::Write(lock)) => (**lock)
                .as_mut()
                .expect("INVARIANT: a pinned PAIR holds a value"),
            _ => panic!("PAIR {key} is pinned for read and cannot be modified"),
        }
    }
}

impl<V: Send + Sync + 'static> Drop for PairGuard<V> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<V: Send + Sync + 'static> std::fmt::Debug for PairGuard<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairGuard")
            .field("cachefile", &self.pair.cachefile.id())
            .field("key", &self.pair.key)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
