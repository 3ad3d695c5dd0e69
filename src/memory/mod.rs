//! # Cache Size Budget
//!
//! This module tracks how much weight the cachetable currently holds and
//! decides when memory pressure requires eviction or client back-pressure.
//!
//! ## Architecture
//!
//! Every PAIR carries a [`PairAttr`](crate::pair::PairAttr): a total size plus
//! sub-weights that describe what kind of memory it is. The budget keeps a
//! running sum of each component:
//!
//! ```text
//! +----------------------------------------------------------+
//! |                 capacity (size limit)                     |
//! +----------------------------------------------------------+
//! |  current = Σ attr.size                                    |
//! |  +----------+ +----------+ +----------+ +---------------+ |
//! |  | nonleaf  | | leaf     | | rollback | | cache pressure| |
//! |  +----------+ +----------+ +----------+ +---------------+ |
//! +----------------------------------------------------------+
//! ```
//!
//! ## Enforcement Model
//!
//! Unlike a hard allocator limit, the cachetable budget is soft: PAIRs are
//! always admitted, then the evictor brings the total back under the low
//! watermark. Clients that would add weight while the cache is above the high
//! watermark stall until the evictor catches up (see `Evictor::wait_for_space`).

mod budget;

pub use budget::{BudgetStats, CacheBudget, SizeClass};
