//! Shared test client: an in-memory "disk" plus PAIR and cachefile callbacks
//! that record every call the cachetable makes.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use turdb_cachetable::{
    key_hash, BlockKey, Cachefile, CachefileCallbacks, Cachetable, CachetableBuilder,
    ClonedValue, Fetched, FlushParams, Lsn, PairAttr, PairCallbacks, PairGuard,
};

pub const BLOCK_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub value: i64,
    pub complete: bool,
    pub pressure: usize,
}

impl Block {
    pub fn new(value: i64) -> Self {
        Self {
            value,
            complete: true,
            pressure: 0,
        }
    }

    pub fn attr(&self) -> PairAttr {
        PairAttr {
            size: BLOCK_SIZE,
            leaf_size: BLOCK_SIZE,
            cache_pressure_size: self.pressure,
            ..PairAttr::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlushRecord {
    pub key: u64,
    pub value: i64,
    pub params: FlushParams,
}

#[derive(Default)]
pub struct Disk {
    pub blocks: Mutex<HashMap<u64, i64>>,
    /// Values as of the last checkpoint write of each block.
    pub image: Mutex<HashMap<u64, i64>>,
    pub flushes: Mutex<Vec<FlushRecord>>,
    pub cleaned: Mutex<Vec<u64>>,
    pub fetches: AtomicUsize,
    pub partial_fetches: AtomicUsize,
    pub fail_fetch: AtomicBool,
    pub fail_flush: AtomicBool,
    pub fail_clone: AtomicBool,
    /// Added to the value by the cleaner callback.
    pub cleaner_delta: AtomicI64,
    /// Holds the cleaner callback after it records the key.
    pub cleaner_gate: Gate,
    /// Writes with `keep_me == false` that are not for a checkpoint.
    pub evict_writes: AtomicUsize,
    pub evict_gate: Gate,
    clone_gate: Gate,
}

/// A latch that blocks `wait` while closed.
#[derive(Default)]
pub struct Gate {
    closed: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn close(&self) {
        *self.closed.lock() = true;
    }

    pub fn open(&self) {
        *self.closed.lock() = false;
        self.opened.notify_all();
    }

    pub fn wait(&self) {
        let mut closed = self.closed.lock();
        while *closed {
            self.opened.wait(&mut closed);
        }
    }
}

impl Disk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().len()
    }

    pub fn checkpoint_writes(&self) -> Vec<FlushRecord> {
        self.flushes
            .lock()
            .iter()
            .filter(|r| r.params.for_checkpoint && r.params.write_me)
            .copied()
            .collect()
    }

    pub fn checkpoint_writes_of(&self, key: u64) -> Vec<FlushRecord> {
        self.checkpoint_writes()
            .into_iter()
            .filter(|r| r.key == key)
            .collect()
    }

    pub fn store(&self, key: u64, value: i64) {
        self.blocks.lock().insert(key, value);
    }

    /// Blocks clone writes until `open_clone_gate`.
    pub fn close_clone_gate(&self) {
        self.clone_gate.close();
    }

    pub fn open_clone_gate(&self) {
        self.clone_gate.open();
    }

    fn wait_clone_gate(&self) {
        self.clone_gate.wait();
    }
}

pub struct BlockIo {
    pub disk: Arc<Disk>,
    pub clone: bool,
    /// Fetch returns blocks that need a partial fetch before use.
    pub partial: bool,
}

impl PairCallbacks<Block> for BlockIo {
    fn fetch(&self, _cachefile: &Cachefile, key: BlockKey, _hash: u32) -> eyre::Result<Fetched<Block>> {
        self.disk.fetches.fetch_add(1, Ordering::SeqCst);
        if self.disk.fail_fetch.load(Ordering::SeqCst) {
            eyre::bail!("injected fetch failure for block {key}");
        }
        let value = self.disk.blocks.lock().get(&key.0).copied().unwrap_or(0);
        let block = Block {
            value,
            complete: !self.partial,
            pressure: 0,
        };
        let attr = block.attr();
        Ok(Fetched::clean(block, attr))
    }

    fn flush(
        &self,
        _cachefile: &Cachefile,
        key: BlockKey,
        value: &Block,
        _attr: PairAttr,
        params: FlushParams,
    ) -> eyre::Result<PairAttr> {
        if params.is_clone {
            self.disk.wait_clone_gate();
        }
        if !params.keep_me && !params.for_checkpoint {
            self.disk.evict_writes.fetch_add(1, Ordering::SeqCst);
            self.disk.evict_gate.wait();
        }
        if self.disk.fail_flush.load(Ordering::SeqCst) {
            eyre::bail!("injected flush failure for block {key}");
        }
        self.disk.flushes.lock().push(FlushRecord {
            key: key.0,
            value: value.value,
            params,
        });
        if params.write_me {
            self.disk.store(key.0, value.value);
            if params.for_checkpoint {
                self.disk.image.lock().insert(key.0, value.value);
            }
        }
        Ok(value.attr())
    }

    fn supports_clone(&self) -> bool {
        self.clone
    }

    fn clone_value(&self, value: &mut Block, _for_checkpoint: bool) -> eyre::Result<ClonedValue<Block>> {
        if self.disk.fail_clone.load(Ordering::SeqCst) {
            eyre::bail!("injected clone failure");
        }
        Ok(ClonedValue {
            value: value.clone(),
            attr: value.attr(),
        })
    }

    fn partial_fetch_required(&self, value: &Block) -> bool {
        !value.complete
    }

    fn partial_fetch(
        &self,
        _cachefile: &Cachefile,
        _key: BlockKey,
        value: &mut Block,
        _attr: PairAttr,
    ) -> eyre::Result<PairAttr> {
        self.disk.partial_fetches.fetch_add(1, Ordering::SeqCst);
        value.complete = true;
        Ok(value.attr())
    }

    fn cleaner(&self, mut pair: PairGuard<Block>) -> eyre::Result<()> {
        self.disk.cleaned.lock().push(pair.key().0);
        self.disk.cleaner_gate.wait();
        pair.value += self.disk.cleaner_delta.load(Ordering::SeqCst);
        pair.pressure = 0;
        let attr = pair.attr();
        pair.unpin(
            true,
            Some(PairAttr {
                cache_pressure_size: 0,
                ..attr
            }),
        );
        Ok(())
    }
}

/// Cachefile hooks that append to a shared event log.
#[derive(Default)]
pub struct HookLog {
    pub events: Mutex<Vec<String>>,
}

impl HookLog {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

pub struct RecordingHooks(pub Arc<HookLog>);

impl CachefileCallbacks for RecordingHooks {
    fn log_fassociate(&self, _cachefile: &Cachefile) {
        self.0.push("log_fassociate");
    }

    fn begin_checkpoint(&self, _cachefile: &Cachefile, lsn: Lsn) {
        self.0.push(format!("begin_checkpoint:{lsn}"));
    }

    fn checkpoint(&self, _cachefile: &Cachefile) {
        self.0.push("checkpoint");
    }

    fn end_checkpoint(&self, _cachefile: &Cachefile) {
        self.0.push("end_checkpoint");
    }

    fn note_pin(&self, _cachefile: &Cachefile) {
        self.0.push("note_pin");
    }

    fn note_unpin(&self, _cachefile: &Cachefile) {
        self.0.push("note_unpin");
    }

    fn close(&self, _cachefile: &Cachefile) -> eyre::Result<()> {
        self.0.push("close");
        Ok(())
    }
}

pub struct Harness {
    pub table: Cachetable<Block>,
    pub cf: Arc<Cachefile>,
    pub disk: Arc<Disk>,
    pub io: Arc<dyn PairCallbacks<Block>>,
    pub hooks: Arc<HookLog>,
}

impl Harness {
    pub fn new(clone: bool) -> Self {
        Self::with_table(
            CachetableBuilder::new()
                .capacity(1 << 30)
                .cleaner_period(Duration::ZERO)
                .build()
                .expect("Failed to build cachetable"),
            clone,
            false,
        )
    }

    pub fn with_table(table: Cachetable<Block>, clone: bool, partial: bool) -> Self {
        init_tracing();
        let hooks = Arc::new(HookLog::default());
        let cf = table
            .open_cachefile("test.tbd", Arc::new(RecordingHooks(Arc::clone(&hooks))))
            .expect("Failed to open cachefile");
        let disk = Disk::new();
        let io: Arc<dyn PairCallbacks<Block>> = Arc::new(BlockIo {
            disk: Arc::clone(&disk),
            clone,
            partial,
        });
        Self {
            table,
            cf,
            disk,
            io,
            hooks,
        }
    }

    pub fn hash(&self, key: u64) -> u32 {
        key_hash(self.cf.id(), BlockKey(key))
    }

    /// Puts a dirty PAIR and unpins it.
    pub fn put(&self, key: u64, value: i64) {
        self.put_block(key, Block::new(value));
    }

    pub fn put_block(&self, key: u64, block: Block) {
        let attr = block.attr();
        let guard = self
            .table
            .put(&self.cf, BlockKey(key), self.hash(key), block, attr, &self.io)
            .expect("Failed to put PAIR");
        guard.unpin(true, None);
    }

    pub fn pin(&self, key: u64, mode: turdb_cachetable::PinMode) -> PairGuard<Block> {
        self.table
            .get_and_pin(&self.cf, BlockKey(key), self.hash(key), &self.io, mode)
            .expect("Failed to pin PAIR")
    }

    pub fn state(&self, key: u64) -> turdb_cachetable::KeyState {
        self.table
            .key_state(&self.cf, BlockKey(key), self.hash(key))
            .expect("PAIR not cached")
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
