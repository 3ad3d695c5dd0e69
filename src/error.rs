//! Error types for the cachetable.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Retryable contention | `TryAgain` | Caller releases its own locks and retries later |
//! | Client callback failure | `Fetch`, `Flush`, `PartialFetch`, `Clone`, `CachefileClose` | Operation aborted, cache state intact |
//! | Checkpoint round failure | `CheckpointIncomplete` | Failed PAIRs stay dirty for the next round |
//! | Protocol misuse | `CheckpointInProgress`, `NoCheckpointInProgress`, `CachefileClosed`, `PinnedPairs` | Reported, nothing changed |
//! | Resource exhaustion | `Io` | Background thread could not be spawned |
//! | Configuration | `Config` | Builder rejected its input |
//!
//! Violations of the cache's own invariants (evicting a pinned or pending
//! PAIR, marking a PAIR pending twice, mutating through a read pin) are not
//! represented here. They panic, since the cache state is already broken.
//!
//! Client callbacks report failures as `eyre::Report`. The report is carried
//! as `cause` rather than `#[source]` because `eyre::Report` does not
//! implement `std::error::Error`.

use thiserror::Error;

use crate::cachefile::CachefileId;
use crate::pair::BlockKey;

#[derive(Debug, Error)]
pub enum CachetableError {
    /// A nonblocking pin would have had to wait on another pinner or on a
    /// checkpoint write of the PAIR.
    #[error("try again: PAIR is busy")]
    TryAgain,

    #[error("fetch of block {key} in cachefile {cachefile} failed: {cause}")]
    Fetch {
        cachefile: CachefileId,
        key: BlockKey,
        cause: eyre::Report,
    },

    #[error("flush of block {key} in cachefile {cachefile} failed: {cause}")]
    Flush {
        cachefile: CachefileId,
        key: BlockKey,
        cause: eyre::Report,
    },

    #[error("partial fetch of block {key} in cachefile {cachefile} failed: {cause}")]
    PartialFetch {
        cachefile: CachefileId,
        key: BlockKey,
        cause: eyre::Report,
    },

    #[error("clone of block {key} in cachefile {cachefile} failed: {cause}")]
    Clone {
        cachefile: CachefileId,
        key: BlockKey,
        cause: eyre::Report,
    },

    /// One or more PAIRs could not be written during `end_checkpoint`. They
    /// remain dirty; `cause` is the first failure observed.
    #[error("checkpoint incomplete: {failed} PAIR write(s) failed, first: {cause}")]
    CheckpointIncomplete { failed: usize, cause: Box<CachetableError> },

    #[error("a checkpoint round is already in progress")]
    CheckpointInProgress,

    #[error("no checkpoint round is in progress")]
    NoCheckpointInProgress,

    #[error("close callback of cachefile {cachefile} failed: {cause}")]
    CachefileClose {
        cachefile: CachefileId,
        cause: eyre::Report,
    },

    #[error("cachefile {0} is closed or closing")]
    CachefileClosed(CachefileId),

    #[error("cachefile {cachefile} still has {count} pinned PAIR(s)")]
    PinnedPairs { cachefile: CachefileId, count: usize },

    #[error("cachetable is shutting down")]
    ShuttingDown,

    #[error("invalid cachetable configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CachetableError {
    pub fn is_try_again(&self) -> bool {
        matches!(self, CachetableError::TryAgain)
    }
}

pub type Result<T, E = CachetableError> = std::result::Result<T, E>;
