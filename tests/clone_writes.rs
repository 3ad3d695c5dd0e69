//! # Clone Write Tests
//!
//! PAIRs whose callbacks support cloning are written to the checkpoint from
//! a clone, so a writer hitting a checkpoint-pending PAIR only pays for the
//! clone and the write happens in the background.
//!
//! The test disk can hold clone writes at a gate, which makes the
//! background write observable.

mod common;

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::Harness;
use turdb_cachetable::{BlockKey, CachetableError, Lsn, PinMode};

const BLOCKED: Duration = Duration::from_millis(100);
const DONE: Duration = Duration::from_secs(5);

#[test]
fn test_write_pin_does_not_wait_for_clone_write() {
    let h = Arc::new(Harness::new(true));
    h.put(1, 1);
    h.disk.close_clone_gate();
    h.table.begin_checkpoint(Lsn(1)).unwrap();

    let (tx, rx) = mpsc::channel();
    let writer = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            let mut block = h.pin(1, PinMode::WriteCheap);
            block.value = 2;
            block.unpin(true, None);
            tx.send(()).unwrap();
        })
    };
    rx.recv_timeout(DONE).expect("write pin blocked on the clone write");
    writer.join().unwrap();

    let state = h.state(1);
    assert!(state.write_in_flight);
    assert!(state.dirty);
    assert!(!state.checkpoint_pending);
    assert!(h.disk.checkpoint_writes_of(1).is_empty());
    assert_eq!(h.cf.background_jobs(), 1);

    h.disk.open_clone_gate();
    h.table.end_checkpoint(|| {}, || {}).unwrap();
    let writes = h.disk.checkpoint_writes_of(1);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].value, 1);
    assert!(writes[0].params.is_clone);
    assert!(!writes[0].params.keep_me);
    assert!(!h.state(1).write_in_flight);
    assert_eq!(h.table.stats().clone_writes, 1);
}

#[test]
fn test_end_checkpoint_waits_for_background_clone_write() {
    let h = Arc::new(Harness::new(true));
    h.put(1, 1);
    h.disk.close_clone_gate();
    h.table.begin_checkpoint(Lsn(1)).unwrap();
    h.pin(1, PinMode::WriteCheap).unpin(true, None);

    let (tx, rx) = mpsc::channel();
    let ender = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            let result = h.table.end_checkpoint(|| {}, || {});
            tx.send(result.is_ok()).unwrap();
        })
    };
    assert!(matches!(
        rx.recv_timeout(BLOCKED),
        Err(mpsc::RecvTimeoutError::Timeout)
    ));
    assert!(h.table.checkpoint_in_progress());

    h.disk.open_clone_gate();
    assert!(rx.recv_timeout(DONE).unwrap());
    ender.join().unwrap();
    assert_eq!(h.disk.checkpoint_writes_of(1).len(), 1);
}

#[test]
fn test_partial_fetch_of_pinned_pair_waits_for_clone_write() {
    let h = Arc::new(Harness::new(true));
    h.put(1, 1);
    h.disk.close_clone_gate();
    h.table.begin_checkpoint(Lsn(1)).unwrap();
    let mut block = h.pin(1, PinMode::WriteCheap);
    assert!(h.state(1).write_in_flight);

    let (tx, rx) = mpsc::channel();
    let fetcher = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            h.table
                .pf_pinned_pair(&mut block, |_, _, value, attr| {
                    value.value += 1;
                    Ok(attr)
                })
                .unwrap();
            tx.send(block.value).unwrap();
        })
    };
    assert!(matches!(
        rx.recv_timeout(BLOCKED),
        Err(mpsc::RecvTimeoutError::Timeout)
    ));

    h.disk.open_clone_gate();
    assert_eq!(rx.recv_timeout(DONE).unwrap(), 2);
    fetcher.join().unwrap();
    h.table.end_checkpoint(|| {}, || {}).unwrap();
    assert_eq!(h.disk.checkpoint_writes_of(1)[0].value, 1);
}

#[test]
fn test_checkpointer_clones_unpinned_pairs() {
    let h = Harness::new(true);
    h.put(1, 1);
    h.put(2, 2);

    let info = h.table.checkpoint(Lsn(1)).unwrap();
    assert_eq!(info.pairs_written, 2);
    assert!(h.disk.checkpoint_writes().iter().all(|w| w.params.is_clone));
    assert!(!h.state(1).dirty);
    assert_eq!(h.table.stats().clone_writes, 2);
    assert_eq!(h.table.budget().current, 2 * common::BLOCK_SIZE);
}

#[test]
fn test_clone_failure_falls_back_to_write_in_place() {
    let h = Harness::new(true);
    h.put(1, 1);
    h.disk.fail_clone.store(true, Ordering::SeqCst);
    h.table.begin_checkpoint(Lsn(1)).unwrap();

    let mut block = h.pin(1, PinMode::WriteCheap);
    let writes = h.disk.checkpoint_writes_of(1);
    assert_eq!(writes.len(), 1);
    assert!(!writes[0].params.is_clone);
    assert!(writes[0].params.keep_me);
    block.value = 5;
    block.unpin(true, None);

    h.table.end_checkpoint(|| {}, || {}).unwrap();
    assert_eq!(h.disk.checkpoint_writes_of(1)[0].value, 1);
    assert_eq!(h.table.stats().clone_writes, 0);
}

#[test]
fn test_failed_clone_write_fails_round_and_redirties_pair() {
    let h = Harness::new(true);
    h.put(1, 1);
    h.table.begin_checkpoint(Lsn(1)).unwrap();
    h.disk.fail_flush.store(true, Ordering::SeqCst);
    h.pin(1, PinMode::WriteCheap).unpin(false, None);

    let err = h.table.end_checkpoint(|| {}, || {}).unwrap_err();
    assert!(matches!(
        err,
        CachetableError::CheckpointIncomplete { failed: 1, .. }
    ));
    assert!(h.state(1).dirty);
    assert!(!h.state(1).write_in_flight);

    h.disk.fail_flush.store(false, Ordering::SeqCst);
    h.table.checkpoint(Lsn(2)).unwrap();
    assert_eq!(h.disk.checkpoint_writes_of(1)[0].value, 1);
    assert!(h
        .table
        .maybe_get_and_pin_clean(&h.cf, BlockKey(1), h.hash(1), PinMode::Read)
        .is_some());
}

#[test]
fn test_expensive_write_pin_writes_pending_pair_in_place() {
    let h = Harness::new(true);
    h.put(1, 1);
    h.disk.close_clone_gate();
    h.table.begin_checkpoint(Lsn(1)).unwrap();

    let mut block = h.pin(1, PinMode::WriteExpensive);
    let state = h.state(1);
    assert!(!state.write_in_flight);
    assert!(!state.checkpoint_pending);
    let writes = h.disk.checkpoint_writes_of(1);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].value, 1);
    assert!(!writes[0].params.is_clone);
    block.value = 2;
    block.unpin(true, None);

    h.disk.open_clone_gate();
    h.table.end_checkpoint(|| {}, || {}).unwrap();
    assert_eq!(h.disk.image.lock().get(&1), Some(&1));
    assert_eq!(h.table.stats().clone_writes, 0);
    assert_eq!(h.cf.background_jobs(), 0);
}

#[test]
fn test_expensive_write_pin_blocks_behind_clone_write() {
    let h = Arc::new(Harness::new(true));
    h.put(1, 1);
    h.disk.close_clone_gate();
    h.table.begin_checkpoint(Lsn(1)).unwrap();
    let mut block = h.pin(1, PinMode::WriteCheap);
    block.value = 2;
    block.unpin(true, None);
    assert!(h.state(1).write_in_flight);

    let (tx, rx) = mpsc::channel();
    let writer = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            let mut block = h.pin(1, PinMode::WriteExpensive);
            block.value = 3;
            block.unpin(true, None);
            tx.send(()).unwrap();
        })
    };
    assert!(matches!(
        rx.recv_timeout(BLOCKED),
        Err(mpsc::RecvTimeoutError::Timeout)
    ));

    h.disk.open_clone_gate();
    rx.recv_timeout(DONE).expect("expensive pin stayed blocked after the clone write");
    writer.join().unwrap();
    h.table.end_checkpoint(|| {}, || {}).unwrap();

    let writes = h.disk.checkpoint_writes_of(1);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].value, 1);
    assert!(writes[0].params.is_clone);
    assert_eq!(h.pin(1, PinMode::Read).value, 3);
}

#[test]
fn test_nonblocking_expensive_pin_refuses_checkpoint_io() {
    let h = Harness::new(true);
    h.put(1, 1);
    h.disk.close_clone_gate();
    h.table.begin_checkpoint(Lsn(1)).unwrap();

    let pin_expensive = || {
        h.table
            .get_and_pin_nonblocking(&h.cf, BlockKey(1), h.hash(1), &h.io, PinMode::WriteExpensive)
    };
    assert!(matches!(pin_expensive(), Err(CachetableError::TryAgain)));

    // A cheap pin clones; the clone write then holds the disk.
    h.table
        .get_and_pin_nonblocking(&h.cf, BlockKey(1), h.hash(1), &h.io, PinMode::WriteCheap)
        .unwrap()
        .unpin(true, None);
    assert!(h.state(1).write_in_flight);
    assert!(matches!(pin_expensive(), Err(CachetableError::TryAgain)));

    h.disk.open_clone_gate();
    h.table.end_checkpoint(|| {}, || {}).unwrap();
    pin_expensive().unwrap().unpin(false, None);
}
