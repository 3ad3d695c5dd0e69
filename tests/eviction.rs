//! # Eviction Tests
//!
//! The evictor keeps the cache near its capacity, writes dirty victims
//! before dropping them, and never touches pinned, checkpoint-pending or
//! busy PAIRs.

mod common;

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{eventually, Block, Harness, BLOCK_SIZE};
use turdb_cachetable::{BlockKey, CachetableBuilder, EvictionPolicyKind, Lsn, PinMode};

const SETTLE: Duration = Duration::from_secs(5);

fn harness_with_capacity(capacity: usize, policy: EvictionPolicyKind) -> Harness {
    let table = CachetableBuilder::new()
        .capacity(capacity)
        .eviction_policy(policy)
        .evictor_period(Duration::from_millis(10))
        .cleaner_period(Duration::ZERO)
        .build()
        .expect("Failed to build cachetable");
    Harness::with_table(table, false, false)
}

#[test]
fn test_cache_stays_near_capacity_and_values_survive_eviction() {
    const KEYS: u64 = 100;
    let capacity = 10 * BLOCK_SIZE;
    let h = harness_with_capacity(capacity, EvictionPolicyKind::Sieve);

    for key in 0..KEYS {
        h.put(key, key as i64);
    }
    assert!(eventually(SETTLE, || {
        h.table.run_eviction_pass();
        h.table.budget().current <= capacity
    }));

    for key in 0..KEYS {
        assert_eq!(h.pin(key, PinMode::Read).value, key as i64, "key {key}");
    }
    let stats = h.table.stats();
    assert!(stats.evictions > 0);
    assert!(stats.eviction_writes > 0);
}

#[test]
fn test_dirty_victims_are_written_without_keep() {
    let h = harness_with_capacity(BLOCK_SIZE, EvictionPolicyKind::Sieve);
    h.put(1, 11);
    h.put(2, 22);

    assert!(eventually(SETTLE, || {
        h.table.run_eviction_pass();
        h.table.budget().current <= BLOCK_SIZE
    }));

    let evicted: Vec<_> = h
        .disk
        .flushes
        .lock()
        .iter()
        .filter(|f| !f.params.keep_me)
        .copied()
        .collect();
    assert!(!evicted.is_empty());
    for flush in &evicted {
        assert!(flush.params.write_me);
        assert!(!flush.params.for_checkpoint);
        assert!(!h.table.contains(&h.cf, BlockKey(flush.key), h.hash(flush.key)));
    }
    assert_eq!(h.pin(1, PinMode::Read).value, 11);
    assert_eq!(h.pin(2, PinMode::Read).value, 22);
}

#[test]
fn test_pinned_pairs_are_not_evicted() {
    let h = harness_with_capacity(BLOCK_SIZE, EvictionPolicyKind::Sieve);
    let guard = h
        .table
        .put(&h.cf, BlockKey(1), h.hash(1), Block::new(1), Block::new(1).attr(), &h.io)
        .unwrap();
    h.put(2, 2);

    assert!(eventually(SETTLE, || {
        h.table.run_eviction_pass();
        !h.table.contains(&h.cf, BlockKey(2), h.hash(2))
    }));
    assert!(h.table.contains(&h.cf, BlockKey(1), h.hash(1)));
    assert_eq!(h.table.run_eviction_pass(), 0);
    drop(guard);
}

#[test]
fn test_checkpoint_pending_pairs_are_not_evicted() {
    let h = harness_with_capacity(1 << 30, EvictionPolicyKind::Sieve);
    for key in 0..4 {
        h.put(key, key as i64);
    }
    h.table.begin_checkpoint(Lsn(1)).unwrap();
    h.table.set_capacity(BLOCK_SIZE);

    assert_eq!(h.table.run_eviction_pass(), 0);
    assert_eq!(h.table.len(), 4);
    assert_eq!(h.disk.flush_count(), 0);

    h.table.end_checkpoint(|| {}, || {}).unwrap();
    assert!(eventually(SETTLE, || {
        h.table.run_eviction_pass();
        h.table.budget().current <= BLOCK_SIZE
    }));
    // Checkpointed PAIRs are clean, so eviction wrote nothing more.
    assert_eq!(h.disk.flush_count(), 4);
    assert_eq!(h.table.stats().eviction_writes, 0);
}

#[test]
fn test_failed_eviction_write_keeps_pair() {
    let h = harness_with_capacity(BLOCK_SIZE, EvictionPolicyKind::Sieve);
    h.disk.fail_flush.store(true, Ordering::SeqCst);
    h.put(1, 1);
    h.put(2, 2);

    assert_eq!(h.table.run_eviction_pass(), 0);
    assert_eq!(h.table.len(), 2);
    assert!(h.state(1).dirty);
    assert!(h.state(2).dirty);

    h.disk.fail_flush.store(false, Ordering::SeqCst);
    assert!(eventually(SETTLE, || {
        h.table.run_eviction_pass();
        h.table.budget().current <= BLOCK_SIZE
    }));
}

#[test]
fn test_victim_follows_policy_order() {
    for policy in [EvictionPolicyKind::Sieve, EvictionPolicyKind::Lru] {
        let h = harness_with_capacity(3 * BLOCK_SIZE, policy);
        for key in 1..=3 {
            h.put(key, key as i64);
        }
        drop(h.pin(1, PinMode::Read));

        // Only the evictor thread evicts here, so the policy alone picks
        // the victim.
        h.put(4, 4);
        assert!(
            eventually(SETTLE, || h.table.budget().current <= 3 * BLOCK_SIZE),
            "{policy:?}"
        );
        assert!(!h.table.contains(&h.cf, BlockKey(2), h.hash(2)), "{policy:?}");
        for key in [1, 3, 4] {
            assert!(h.table.contains(&h.cf, BlockKey(key), h.hash(key)), "{policy:?} key {key}");
        }
    }
}

#[test]
fn test_stalled_client_is_released_when_nothing_can_be_evicted() {
    let h = Arc::new(harness_with_capacity(BLOCK_SIZE, EvictionPolicyKind::Sieve));
    let first = h
        .table
        .put(&h.cf, BlockKey(1), h.hash(1), Block::new(1), Block::new(1).attr(), &h.io)
        .unwrap();
    let second = h
        .table
        .put(&h.cf, BlockKey(2), h.hash(2), Block::new(2), Block::new(2).attr(), &h.io)
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let client = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            h.put(3, 3);
            tx.send(()).unwrap();
        })
    };
    rx.recv_timeout(SETTLE)
        .expect("stalled client was never released");
    client.join().unwrap();

    assert!(h.table.stats().client_stalls >= 1);
    assert!(h.table.eviction_passes() >= 1);
    assert!(h.table.contains(&h.cf, BlockKey(1), h.hash(1)));
    assert!(h.table.contains(&h.cf, BlockKey(2), h.hash(2)));
    drop(first);
    drop(second);
}

#[test]
fn test_nonblocking_miss_under_pressure_is_try_again() {
    let h = harness_with_capacity(BLOCK_SIZE, EvictionPolicyKind::Sieve);
    let _first = h
        .table
        .put(&h.cf, BlockKey(1), h.hash(1), Block::new(1), Block::new(1).attr(), &h.io)
        .unwrap();
    let _second = h
        .table
        .put(&h.cf, BlockKey(2), h.hash(2), Block::new(2), Block::new(2).attr(), &h.io)
        .unwrap();

    let err = h
        .table
        .get_and_pin_nonblocking(&h.cf, BlockKey(3), h.hash(3), &h.io, PinMode::Read)
        .unwrap_err();
    assert!(err.is_try_again());
    assert_eq!(h.disk.fetches.load(Ordering::SeqCst), 0);
}

#[test]
fn test_checkpoint_begin_waits_for_eviction_write() {
    let h = Arc::new(harness_with_capacity(1 << 30, EvictionPolicyKind::Sieve));
    h.put(1, 1);
    h.disk.evict_gate.close();
    h.table.set_capacity(1);
    assert!(eventually(SETTLE, || h.disk.evict_writes.load(Ordering::SeqCst) > 0));

    let (tx, rx) = mpsc::channel();
    let beginner = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            let marked = h.table.begin_checkpoint(Lsn(1)).unwrap();
            tx.send(marked).unwrap();
        })
    };
    assert!(matches!(
        rx.recv_timeout(Duration::from_millis(100)),
        Err(mpsc::RecvTimeoutError::Timeout)
    ));

    h.disk.evict_gate.open();
    assert_eq!(rx.recv_timeout(SETTLE).unwrap(), 0);
    beginner.join().unwrap();
    assert!(!h.table.contains(&h.cf, BlockKey(1), h.hash(1)));
    assert_eq!(h.disk.blocks.lock().get(&1), Some(&1));

    let info = h.table.end_checkpoint(|| {}, || {}).unwrap();
    assert_eq!(info.pairs_written, 0);
    h.table.set_capacity(1 << 30);
}
