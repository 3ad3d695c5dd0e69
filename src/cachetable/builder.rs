//! # Cachetable Builder
//!
//! `CachetableBuilder` configures and starts a [`Cachetable`]. Settings are
//! chained before calling `build()`, which validates them, creates the
//! shared state and spawns the evictor and cleaner threads.
//!
//! ## Configuration Options
//!
//! | Option             | Default              | Description                                |
//! |--------------------|----------------------|--------------------------------------------|
//! | capacity           | 25% of RAM (4MB+)    | Size limit the watermarks are derived from |
//! | eviction_policy    | SIEVE                | Order in which the evictor tries PAIRs     |
//! | evictor_period     | 100ms                | Evictor poll interval when not signalled   |
//! | cleaner_period     | 1s                   | Cleaner interval; zero disables it         |
//! | cleaner_iterations | 1                    | Cleaner rounds per interval                |
//! | initial_buckets    | 1024                 | Hash buckets before the first resize       |
//!
//! ## Usage Examples
//!
//! ```ignore
//! let table: Cachetable<Node> = CachetableBuilder::new()
//!     .capacity(64 * 1024 * 1024)
//!     .eviction_policy(EvictionPolicyKind::Lru)
//!     .cleaner_period(Duration::ZERO)
//!     .build()?;
//! ```
//!
//! ## Thread Safety
//!
//! `CachetableBuilder` is meant to be used from a single thread. Once
//! `build()` returns, the resulting `Cachetable` is `Send + Sync`.

use std::time::Duration;

use crate::config::{
    DEFAULT_CLEANER_ITERATIONS, DEFAULT_CLEANER_PERIOD, DEFAULT_EVICTOR_PERIOD,
    INITIAL_BUCKET_COUNT,
};
use crate::error::{CachetableError, Result};
use crate::evictor::{EvictionPolicy, EvictionPolicyKind};
use crate::memory::CacheBudget;

use super::Cachetable;

/// Builder for configuring and starting a cachetable.
pub struct CachetableBuilder {
    capacity: Option<usize>,
    policy: Option<Box<dyn EvictionPolicy>>,
    policy_kind: EvictionPolicyKind,
    evictor_period: Duration,
    cleaner_period: Duration,
    cleaner_iterations: usize,
    initial_buckets: usize,
}

pub(crate) struct BuiltConfig {
    pub budget: CacheBudget,
    pub policy: Box<dyn EvictionPolicy>,
    pub evictor_period: Duration,
    pub cleaner_period: Duration,
    pub cleaner_iterations: usize,
    pub initial_buckets: usize,
}

impl Default for CachetableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CachetableBuilder {
    pub fn new() -> Self {
        Self {
            capacity: None,
            policy: None,
            policy_kind: EvictionPolicyKind::default(),
            evictor_period: DEFAULT_EVICTOR_PERIOD,
            cleaner_period: DEFAULT_CLEANER_PERIOD,
            cleaner_iterations: DEFAULT_CLEANER_ITERATIONS,
            initial_buckets: INITIAL_BUCKET_COUNT,
        }
    }

    /// Sets the size limit in bytes.
    ///
    /// If not specified, defaults to 25% of system RAM with a minimum of 4MB.
    /// An explicit capacity is used as given, so tests can run tiny caches.
    pub fn capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn eviction_policy(mut self, kind: EvictionPolicyKind) -> Self {
        self.policy_kind = kind;
        self.policy = None;
        self
    }

    /// Installs a client-provided eviction policy instead of a built-in one.
    pub fn custom_policy(mut self, policy: Box<dyn EvictionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn evictor_period(mut self, period: Duration) -> Self {
        self.evictor_period = period;
        self
    }

    /// Sets how often the cleaner runs. `Duration::ZERO` disables it until
    /// [`Cachetable::set_cleaner_period`] is called.
    pub fn cleaner_period(mut self, period: Duration) -> Self {
        self.cleaner_period = period;
        self
    }

    pub fn cleaner_iterations(mut self, iterations: usize) -> Self {
        self.cleaner_iterations = iterations;
        self
    }

    pub fn initial_buckets(mut self, buckets: usize) -> Self {
        self.initial_buckets = buckets;
        self
    }

    pub(crate) fn validate(self) -> Result<BuiltConfig> {
        if self.capacity == Some(0) {
            return Err(CachetableError::Config("capacity must be non-zero".into()));
        }
        if self.evictor_period.is_zero() {
            return Err(CachetableError::Config(
                "evictor period must be non-zero".into(),
            ));
        }
        if self.initial_buckets == 0 {
            return Err(CachetableError::Config(
                "initial bucket count must be non-zero".into(),
            ));
        }

        let budget = match self.capacity {
            Some(bytes) => CacheBudget::with_limit(bytes),
            None => CacheBudget::auto_detect(),
        };
        let policy = self.policy.unwrap_or_else(|| self.policy_kind.build());
        Ok(BuiltConfig {
            budget,
            policy,
            evictor_period: self.evictor_period,
            cleaner_period: self.cleaner_period,
            cleaner_iterations: self.cleaner_iterations,
            initial_buckets: self.initial_buckets,
        })
    }

    /// Validates the configuration and starts the cachetable.
    ///
    /// # Errors
    ///
    /// Returns `CachetableError::Config` for a zero capacity, evictor period
    /// or bucket count, and `CachetableError::Io` if a background thread
    /// cannot be spawned.
    pub fn build<V: Send + Sync + 'static>(self) -> Result<Cachetable<V>> {
        Cachetable::start(self.validate()?)
    }
}
