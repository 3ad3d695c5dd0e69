//! Cachefiles: the per-file half of the cache.
//!
//! A [`Cachefile`] names one open file whose blocks live in the cache. It
//! owns the client's per-file callbacks and the checkpoint participation
//! flag, and tracks background jobs (clone writes, prefetches) still running
//! against its PAIRs.
//!
//! ## Checkpoint Hooks
//!
//! ```text
//! begin_checkpoint:  note_pin -> log_fassociate -> begin_checkpoint(lsn)
//! end_checkpoint:    ...PAIRs written... -> checkpoint -> end_checkpoint -> note_unpin
//! close_cachefile:   ...PAIRs written and dropped... -> close
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::background::BackgroundJobs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CachefileId(pub u32);

impl fmt::Display for CachefileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log sequence number a checkpoint round begins at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-file hooks. All default to no-ops.
pub trait CachefileCallbacks: Send + Sync {
    /// Records the file's association in the log at checkpoint begin.
    fn log_fassociate(&self, cachefile: &Cachefile) {
        let _ = cachefile;
    }

    fn begin_checkpoint(&self, cachefile: &Cachefile, lsn: Lsn) {
        let _ = (cachefile, lsn);
    }

    /// Called once per round after every pending PAIR of the file has been
    /// written. Typically writes the file header.
    fn checkpoint(&self, cachefile: &Cachefile) {
        let _ = cachefile;
    }

    fn end_checkpoint(&self, cachefile: &Cachefile) {
        let _ = cachefile;
    }

    /// Keeps the file open for the duration of a checkpoint round.
    fn note_pin(&self, cachefile: &Cachefile) {
        let _ = cachefile;
    }

    fn note_unpin(&self, cachefile: &Cachefile) {
        let _ = cachefile;
    }

    fn close(&self, cachefile: &Cachefile) -> eyre::Result<()> {
        let _ = cachefile;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCachefileCallbacks;

impl CachefileCallbacks for NoopCachefileCallbacks {}

pub struct Cachefile {
    id: CachefileId,
    name: String,
    callbacks: Arc<dyn CachefileCallbacks>,
    for_checkpoint: AtomicBool,
    closing: AtomicBool,
    jobs: Arc<BackgroundJobs>,
}

impl Cachefile {
    pub(crate) fn new(id: CachefileId, name: String, callbacks: Arc<dyn CachefileCallbacks>) -> Self {
        Self {
            id,
            name,
            callbacks,
            for_checkpoint: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            jobs: BackgroundJobs::new(),
        }
    }

    pub fn id(&self) -> CachefileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the file participates in the checkpoint round in progress.
    pub fn for_checkpoint(&self) -> bool {
        self.for_checkpoint.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn background_jobs(&self) -> usize {
        self.jobs.outstanding()
    }

    pub(crate) fn callbacks(&self) -> &dyn CachefileCallbacks {
        self.callbacks.as_ref()
    }

    pub(crate) fn set_for_checkpoint(&self, value: bool) {
        self.for_checkpoint.store(value, Ordering::Release);
    }

    pub(crate) fn set_closing(&self, value: bool) {
        self.closing.store(value, Ordering::Release);
    }

    pub(crate) fn jobs(&self) -> &Arc<BackgroundJobs> {
        &self.jobs
    }
}

impl fmt::Debug for Cachefile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cachefile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("for_checkpoint", &self.for_checkpoint())
            .field("closing", &self.is_closing())
            .finish()
    }
}
