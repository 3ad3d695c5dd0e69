//! # Cache Budget Implementation
//!
//! Atomic size accounting and watermark queries.
//!
//! ## Watermarks
//!
//! | Query                  | Threshold          | Consumer              |
//! |------------------------|--------------------|-----------------------|
//! | `needs_eviction`       | > low watermark    | evictor pass loop     |
//! | `should_wake_evictor`  | > low hysteresis   | PAIR insertion        |
//! | `should_stall_clients` | > high watermark   | get_and_pin / put     |
//! | `clients_may_resume`   | <= high hysteresis | stalled clients       |
//!
//! Updates use plain `fetch_add`/`fetch_sub`. A resize is applied as add-new
//! then subtract-old, so readers may briefly observe the sum of both; this only
//! ever over-counts and errs toward evicting early.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use sysinfo::System;

use crate::config::{
    DEFAULT_BUDGET_PERCENT, HIGH_HYSTERESIS_PERCENT, HIGH_WATERMARK_PERCENT,
    LOW_HYSTERESIS_PERCENT, LOW_WATERMARK_PERCENT, MIN_CAPACITY_FLOOR, WATERMARK_DENOMINATOR,
};
use crate::pair::PairAttr;

static SYSTEM_TOTAL_MEMORY: OnceLock<usize> = OnceLock::new();

/// Sub-weight categories carried by a [`PairAttr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    NonLeaf,
    Leaf,
    Rollback,
    CachePressure,
}

impl SizeClass {
    pub fn name(&self) -> &'static str {
        match self {
            SizeClass::NonLeaf => "nonleaf",
            SizeClass::Leaf => "leaf",
            SizeClass::Rollback => "rollback",
            SizeClass::CachePressure => "cache_pressure",
        }
    }

    fn of(&self, attr: &PairAttr) -> usize {
        match self {
            SizeClass::NonLeaf => attr.nonleaf_size,
            SizeClass::Leaf => attr.leaf_size,
            SizeClass::Rollback => attr.rollback_size,
            SizeClass::CachePressure => attr.cache_pressure_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BudgetStats {
    pub limit: usize,
    pub current: usize,
    pub nonleaf: usize,
    pub leaf: usize,
    pub rollback: usize,
    pub cache_pressure: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

impl BudgetStats {
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.current)
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        (self.current as f64 / self.limit as f64) * 100.0
    }
}

impl std::fmt::Display for BudgetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "size:{}/{},nonleaf:{},leaf:{},rollback:{},cache_pressure:{},watermarks:{}..{}",
            self.current,
            self.limit,
            self.nonleaf,
            self.leaf,
            self.rollback,
            self.cache_pressure,
            self.low_watermark,
            self.high_watermark
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Watermarks {
    low: usize,
    low_hysteresis: usize,
    high_hysteresis: usize,
    high: usize,
}

impl Watermarks {
    fn for_limit(limit: usize) -> Self {
        let scaled = |percent: usize| limit.saturating_mul(percent) / WATERMARK_DENOMINATOR;
        Self {
            low: scaled(LOW_WATERMARK_PERCENT),
            low_hysteresis: scaled(LOW_HYSTERESIS_PERCENT),
            high_hysteresis: scaled(HIGH_HYSTERESIS_PERCENT),
            high: scaled(HIGH_WATERMARK_PERCENT),
        }
    }
}

#[derive(Debug)]
pub struct CacheBudget {
    limit: AtomicUsize,
    current: AtomicUsize,
    nonleaf: AtomicUsize,
    leaf: AtomicUsize,
    rollback: AtomicUsize,
    cache_pressure: AtomicUsize,
    watermarks: parking_lot::RwLock<Watermarks>,
}

impl CacheBudget {
    pub fn auto_detect() -> Self {
        let total_memory = *SYSTEM_TOTAL_MEMORY.get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory() as usize
        });

        let limit = (total_memory * DEFAULT_BUDGET_PERCENT) / 100;
        Self::with_limit(limit.max(MIN_CAPACITY_FLOOR))
    }

    /// Unlike `auto_detect`, an explicit limit is taken as given: tests run
    /// tiny caches to force eviction.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            current: AtomicUsize::new(0),
            nonleaf: AtomicUsize::new(0),
            leaf: AtomicUsize::new(0),
            rollback: AtomicUsize::new(0),
            cache_pressure: AtomicUsize::new(0),
            watermarks: parking_lot::RwLock::new(Watermarks::for_limit(limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: usize) {
        let mut marks = self.watermarks.write();
        self.limit.store(limit, Ordering::Release);
        *marks = Watermarks::for_limit(limit);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn used(&self, class: SizeClass) -> usize {
        self.counter(class).load(Ordering::Acquire)
    }

    fn counter(&self, class: SizeClass) -> &AtomicUsize {
        match class {
            SizeClass::NonLeaf => &self.nonleaf,
            SizeClass::Leaf => &self.leaf,
            SizeClass::Rollback => &self.rollback,
            SizeClass::CachePressure => &self.cache_pressure,
        }
    }

    const CLASSES: [SizeClass; 4] = [
        SizeClass::NonLeaf,
        SizeClass::Leaf,
        SizeClass::Rollback,
        SizeClass::CachePressure,
    ];

    pub fn add(&self, attr: &PairAttr) {
        self.current.fetch_add(attr.size, Ordering::AcqRel);
        for class in Self::CLASSES {
            let bytes = class.of(attr);
            if bytes > 0 {
                self.counter(class).fetch_add(bytes, Ordering::AcqRel);
            }
        }
    }

    pub fn remove(&self, attr: &PairAttr) {
        Self::saturating_release(&self.current, attr.size);
        for class in Self::CLASSES {
            Self::saturating_release(self.counter(class), class.of(attr));
        }
    }

    pub fn replace(&self, old: &PairAttr, new: &PairAttr) {
        if old == new {
            return;
        }
        self.add(new);
        self.remove(old);
    }

    fn saturating_release(counter: &AtomicUsize, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_sub(bytes))
        });
    }

    pub fn needs_eviction(&self) -> bool {
        self.current() > self.watermarks.read().low
    }

    pub fn should_wake_evictor(&self) -> bool {
        self.current() > self.watermarks.read().low_hysteresis
    }

    pub fn should_stall_clients(&self) -> bool {
        self.current() > self.watermarks.read().high
    }

    pub fn clients_may_resume(&self) -> bool {
        self.current() <= self.watermarks.read().high_hysteresis
    }

    pub fn stats(&self) -> BudgetStats {
        let marks = *self.watermarks.read();
        BudgetStats {
            limit: self.limit(),
            current: self.current(),
            nonleaf: self.used(SizeClass::NonLeaf),
            leaf: self.used(SizeClass::Leaf),
            rollback: self.used(SizeClass::Rollback),
            cache_pressure: self.used(SizeClass::CachePressure),
            low_watermark: marks.low,
            high_watermark: marks.high,
        }
    }
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self::auto_detect()
    }
}
