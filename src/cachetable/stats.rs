use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters, updated with relaxed atomics on the hot paths.
#[derive(Debug, Default)]
pub struct CachetableStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub puts: AtomicU64,
    pub prefetches: AtomicU64,
    pub partial_fetches: AtomicU64,
    pub removals: AtomicU64,
    pub evictions: AtomicU64,
    /// Evictions that had to write a dirty PAIR first.
    pub eviction_writes: AtomicU64,
    /// Checkpoint writes of dirty PAIRs, in place or of a clone.
    pub checkpoint_writes: AtomicU64,
    pub clone_writes: AtomicU64,
    pub cleaner_runs: AtomicU64,
    pub try_again: AtomicU64,
    pub client_stalls: AtomicU64,
}

impl CachetableStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            hits: load(&self.hits),
            misses: load(&self.misses),
            fetch_failures: load(&self.fetch_failures),
            puts: load(&self.puts),
            prefetches: load(&self.prefetches),
            partial_fetches: load(&self.partial_fetches),
            removals: load(&self.removals),
            evictions: load(&self.evictions),
            eviction_writes: load(&self.eviction_writes),
            checkpoint_writes: load(&self.checkpoint_writes),
            clone_writes: load(&self.clone_writes),
            cleaner_runs: load(&self.cleaner_runs),
            try_again: load(&self.try_again),
            client_stalls: load(&self.client_stalls),
        }
    }
}

/// Point-in-time copy of [`CachetableStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fetch_failures: u64,
    pub puts: u64,
    pub prefetches: u64,
    pub partial_fetches: u64,
    pub removals: u64,
    pub evictions: u64,
    pub eviction_writes: u64,
    pub checkpoint_writes: u64,
    pub clone_writes: u64,
    pub cleaner_runs: u64,
    pub try_again: u64,
    pub client_stalls: u64,
}

impl StatsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_counters() {
        let stats = CachetableStats::default();
        stats.hits.fetch_add(3, Ordering::Relaxed);
        stats.misses.fetch_add(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.misses, 1);
        assert!((snap.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_ratio_without_lookups() {
        assert_eq!(StatsSnapshot::default().hit_ratio(), 0.0);
    }
}
