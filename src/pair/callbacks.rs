//! Client callbacks attached to every PAIR.
//!
//! The cache never interprets a value. Everything it needs to do with one,
//! reading it from disk, writing it back, cloning it for a checkpoint or
//! shrinking it, goes through [`PairCallbacks`]. The callbacks object is
//! captured by the PAIR when it is created, so any extra arguments the
//! client wants passed along (write-extra, fetch-extra) live inside it.

use crate::cachefile::Cachefile;
use crate::cachetable::PairGuard;
use crate::pair::{BlockKey, PairAttr};

/// Result of a successful fetch.
#[derive(Debug)]
pub struct Fetched<V> {
    pub value: V,
    pub attr: PairAttr,
    /// A fetch may produce a value that already differs from disk, for
    /// example after replaying buffered messages.
    pub dirty: bool,
}

impl<V> Fetched<V> {
    pub fn clean(value: V, attr: PairAttr) -> Self {
        Self {
            value,
            attr,
            dirty: false,
        }
    }
}

/// Independent copy of a PAIR's value taken for a checkpoint write.
#[derive(Debug)]
pub struct ClonedValue<V> {
    pub value: V,
    pub attr: PairAttr,
}

/// How a flush callback is being invoked.
///
/// | Caller | write_me | keep_me | for_checkpoint | is_clone |
/// |--------|----------|---------|----------------|----------|
/// | Evictor | dirty | false | false | false |
/// | Checkpoint write of the live value | dirty | true | true | false |
/// | Checkpoint write of a clone | true | false | true | true |
/// | Cachefile close | true | false | false | false |
/// | Cachefile flush | true | true | false | false |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushParams {
    /// Persist the value. When false the call only lets the client do
    /// bookkeeping for a clean PAIR.
    pub write_me: bool,
    /// The value stays cached after the call.
    pub keep_me: bool,
    pub for_checkpoint: bool,
    /// The value is a clone produced by [`PairCallbacks::clone_value`].
    pub is_clone: bool,
}

impl FlushParams {
    pub(crate) fn evict(dirty: bool) -> Self {
        Self {
            write_me: dirty,
            keep_me: false,
            for_checkpoint: false,
            is_clone: false,
        }
    }

    pub(crate) fn checkpoint(dirty: bool) -> Self {
        Self {
            write_me: dirty,
            keep_me: true,
            for_checkpoint: true,
            is_clone: false,
        }
    }

    pub(crate) fn checkpoint_clone() -> Self {
        Self {
            write_me: true,
            keep_me: false,
            for_checkpoint: true,
            is_clone: true,
        }
    }

    pub(crate) fn close() -> Self {
        Self {
            write_me: true,
            keep_me: false,
            for_checkpoint: false,
            is_clone: false,
        }
    }

    pub(crate) fn write_back() -> Self {
        Self {
            write_me: true,
            keep_me: true,
            for_checkpoint: false,
            is_clone: false,
        }
    }
}

pub trait PairCallbacks<V: Send + Sync + 'static>: Send + Sync {
    /// Reads the block from disk. Called with the PAIR write-locked and no
    /// other cache lock held.
    fn fetch(&self, cachefile: &Cachefile, key: BlockKey, hash: u32) -> eyre::Result<Fetched<V>>;

    /// Writes (or, with `write_me == false`, just accounts for) the value.
    /// Returns the attribute of the value after the call.
    fn flush(
        &self,
        cachefile: &Cachefile,
        key: BlockKey,
        value: &V,
        attr: PairAttr,
        params: FlushParams,
    ) -> eyre::Result<PairAttr>;

    /// Whether [`clone_value`](Self::clone_value) is implemented. When it
    /// is, a write pin of a checkpoint-pending PAIR clones the value and
    /// writes the clone in the background instead of writing inline.
    fn supports_clone(&self) -> bool {
        false
    }

    /// Produces an independent copy of the value for a checkpoint write.
    /// May update `value`, e.g. to clear its own dirty bookkeeping.
    fn clone_value(&self, value: &mut V, for_checkpoint: bool) -> eyre::Result<ClonedValue<V>> {
        let _ = (value, for_checkpoint);
        eyre::bail!("clone_value called on callbacks without clone support")
    }

    fn partial_fetch_required(&self, value: &V) -> bool {
        let _ = value;
        false
    }

    /// Brings a partially evicted value back to full form. Returns the new
    /// attribute.
    fn partial_fetch(
        &self,
        cachefile: &Cachefile,
        key: BlockKey,
        value: &mut V,
        attr: PairAttr,
    ) -> eyre::Result<PairAttr> {
        let _ = (cachefile, key, value);
        Ok(attr)
    }

    /// Background maintenance on a PAIR chosen by the cleaner. The PAIR is
    /// write-pinned; dropping or unpinning the guard releases it.
    ///
    /// Runs with the multi-operation lock held shared, so no checkpoint can
    /// begin until it returns. The callback must not take that lock again.
    fn cleaner(&self, pair: PairGuard<V>) -> eyre::Result<()> {
        drop(pair);
        Ok(())
    }
}
