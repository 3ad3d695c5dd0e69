use std::sync::Arc;

use crate::cachefile::{Cachefile, CachefileId, NoopCachefileCallbacks};
use crate::pair::entry::{Pair, PairState};
use crate::pair::{key_hash, BlockKey, FlushParams, Fetched, PairAttr, PairCallbacks};
use crate::table::PairId;

pub(crate) struct NullCallbacks;

impl PairCallbacks<u64> for NullCallbacks {
    fn fetch(&self, _cachefile: &Cachefile, key: BlockKey, _hash: u32) -> eyre::Result<Fetched<u64>> {
        Ok(Fetched::clean(key.0, PairAttr::with_size(1)))
    }

    fn flush(
        &self,
        _cachefile: &Cachefile,
        _key: BlockKey,
        _value: &u64,
        attr: PairAttr,
        _params: FlushParams,
    ) -> eyre::Result<PairAttr> {
        Ok(attr)
    }
}

pub(crate) fn test_cachefile(id: u32) -> Arc<Cachefile> {
    Arc::new(Cachefile::new(
        CachefileId(id),
        format!("test-{id}"),
        Arc::new(NoopCachefileCallbacks),
    ))
}

pub(crate) fn test_pair(id: PairId, cachefile: &Arc<Cachefile>, key: u64, size: usize) -> Pair<u64> {
    let key = BlockKey(key);
    Pair::new(
        id,
        Arc::clone(cachefile),
        key,
        key_hash(cachefile.id(), key),
        Arc::new(NullCallbacks),
        Some(key.0),
        PairState {
            attr: PairAttr::with_size(size),
            ..PairState::default()
        },
    )
}
