use std::ops::Add;

/// Sizes the client reports for a PAIR.
///
/// `size` is the total charged against the cache capacity. The remaining
/// fields break it down for statistics, and `cache_pressure_size` is the
/// score the cleaner uses to pick which PAIR to hand to its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairAttr {
    pub size: usize,
    pub nonleaf_size: usize,
    pub leaf_size: usize,
    pub rollback_size: usize,
    pub cache_pressure_size: usize,
}

impl PairAttr {
    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn leaf(size: usize) -> Self {
        Self {
            size,
            leaf_size: size,
            ..Self::default()
        }
    }

    pub fn nonleaf(size: usize, cache_pressure_size: usize) -> Self {
        Self {
            size,
            nonleaf_size: size,
            cache_pressure_size,
            ..Self::default()
        }
    }
}

impl Add for PairAttr {
    type Output = PairAttr;

    fn add(self, rhs: PairAttr) -> PairAttr {
        PairAttr {
            size: self.size + rhs.size,
            nonleaf_size: self.nonleaf_size + rhs.nonleaf_size,
            leaf_size: self.leaf_size + rhs.leaf_size,
            rollback_size: self.rollback_size + rhs.rollback_size,
            cache_pressure_size: self.cache_pressure_size + rhs.cache_pressure_size,
        }
    }
}
