//! # Cachetable Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! capacity (bytes, from builder or DEFAULT_BUDGET_PERCENT of RAM)
//!       │
//!       ├─> LOW_WATERMARK        (capacity * 1.00)  evictor runs above this
//!       ├─> LOW_HYSTERESIS       (capacity * 1.10)  evictor is woken above this
//!       ├─> HIGH_HYSTERESIS      (capacity * 1.25)  stalled clients resume below this
//!       └─> HIGH_WATERMARK       (capacity * 1.50)  clients stall above this
//!
//! INITIAL_BUCKET_COUNT (power of two)
//!       │
//!       └─> MAX_BUCKET_LOAD  table doubles its buckets past this many PAIRs per bucket
//!
//! DEFAULT_CLEANER_PERIOD / DEFAULT_CLEANER_ITERATIONS
//!       │
//!       └─> CLEANER_CANDIDATES  PAIRs examined per iteration
//! ```
//!
//! ## Critical Invariants
//!
//! 1. Watermarks are strictly ordered: low < low hysteresis < high hysteresis < high.
//!    Clients stalled above the high watermark can only be released once the
//!    evictor (which keeps running above the low watermark) has made progress.
//! 2. `INITIAL_BUCKET_COUNT` is a power of two so bucket selection is a mask.

use std::time::Duration;

// ============================================================================
// MEMORY BUDGET CONFIGURATION
// ============================================================================

/// Default capacity as percentage of system RAM when the builder is given none.
pub const DEFAULT_BUDGET_PERCENT: usize = 25;

/// Minimum capacity floor in bytes (4MB).
pub const MIN_CAPACITY_FLOOR: usize = 4 * 1024 * 1024;

/// Watermarks are expressed as `capacity * NUMERATOR / WATERMARK_DENOMINATOR`.
pub const WATERMARK_DENOMINATOR: usize = 100;

/// The evictor runs while the cache is above this fraction of capacity.
pub const LOW_WATERMARK_PERCENT: usize = 100;

/// The evictor thread is signalled once the cache grows past this.
pub const LOW_HYSTERESIS_PERCENT: usize = 110;

/// Clients stalled on memory pressure resume once the cache shrinks below this.
pub const HIGH_HYSTERESIS_PERCENT: usize = 125;

/// Clients about to add a PAIR stall while the cache is above this.
pub const HIGH_WATERMARK_PERCENT: usize = 150;

const _: () = assert!(
    LOW_WATERMARK_PERCENT < LOW_HYSTERESIS_PERCENT
        && LOW_HYSTERESIS_PERCENT < HIGH_HYSTERESIS_PERCENT
        && HIGH_HYSTERESIS_PERCENT < HIGH_WATERMARK_PERCENT,
    "cachetable watermarks must be strictly increasing"
);

// ============================================================================
// PAIR TABLE CONFIGURATION
// ============================================================================

/// Hash bucket count of a fresh PairTable.
pub const INITIAL_BUCKET_COUNT: usize = 1024;

/// Average chain length that triggers doubling the bucket array.
pub const MAX_BUCKET_LOAD: usize = 2;

const _: () = assert!(
    INITIAL_BUCKET_COUNT.is_power_of_two(),
    "INITIAL_BUCKET_COUNT must be a power of two"
);

// ============================================================================
// BACKGROUND THREADS
// ============================================================================

/// Default interval between cleaner passes. Zero disables the cleaner.
pub const DEFAULT_CLEANER_PERIOD: Duration = Duration::from_secs(1);

/// Number of PAIRs the cleaner acts on per pass.
pub const DEFAULT_CLEANER_ITERATIONS: usize = 1;

/// PAIRs sampled per cleaner iteration; the one with the largest
/// cache-pressure weight is chosen.
pub const CLEANER_CANDIDATES: usize = 8;

/// How long the evictor sleeps when nobody signals it.
pub const DEFAULT_EVICTOR_PERIOD: Duration = Duration::from_millis(100);

/// Upper bound on eviction candidates examined in one pass, as a multiple of
/// the number of PAIRs in the table. Bounds a pass where everything is pinned.
pub const EVICTOR_SWEEP_FACTOR: usize = 2;
