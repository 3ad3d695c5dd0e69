use super::{PairId, PairTable};

impl<V: Send + Sync + 'static> PairTable<V> {
    pub fn pending_len(&self) -> usize {
        self.pending_len
    }

    pub fn pending_head(&self) -> Option<PairId> {
        let index = self.pending_head?;
        Some(PairId {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    pub fn is_pending(&self, id: PairId) -> bool {
        self.get(id).is_some() && self.slots[id.index as usize].on_pending
    }

    /// Appends the PAIR to the pending list.
    ///
    /// # Panics
    ///
    /// Panics if the id is stale or the PAIR is already pending.
    pub fn link_pending(&mut self, id: PairId) {
        assert!(self.get(id).is_some(), "marking stale PAIR {:?} pending", id);
        let tail = self.pending_tail;
        let slot = &mut self.slots[id.index as usize];
        assert!(!slot.on_pending, "PAIR {:?} marked checkpoint-pending twice", id);
        slot.on_pending = true;
        slot.pending_prev = tail;
        slot.pending_next = None;

        match tail {
            Some(tail) => self.slots[tail as usize].pending_next = Some(id.index),
            None => self.pending_head = Some(id.index),
        }
        self.pending_tail = Some(id.index);
        self.pending_len += 1;
    }

    /// Removes the PAIR from the pending list. Returns false if it was not
    /// on it.
    pub fn unlink_pending(&mut self, id: PairId) -> bool {
        if !self.is_pending(id) {
            return false;
        }
        let slot = &mut self.slots[id.index as usize];
        let prev = slot.pending_prev.take();
        let next = slot.pending_next.take();
        slot.on_pending = false;

        match prev {
            Some(prev) => self.slots[prev as usize].pending_next = next,
            None => self.pending_head = next,
        }
        match next {
            Some(next) => self.slots[next as usize].pending_prev = prev,
            None => self.pending_tail = prev,
        }
        self.pending_len -= 1;
        true
    }

    #[cfg(test)]
    pub fn pending_ids(&self) -> impl Iterator<Item = PairId> + '_ {
        let mut cursor = self.pending_head;
        std::iter::from_fn(move || {
            let index = cursor?;
            let slot = &self.slots[index as usize];
            cursor = slot.pending_next;
            Some(PairId {
                index,
                generation: slot.generation,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_cachefile, test_pair};

    #[test]
    fn test_pending_list_is_fifo() {
        let cf = test_cachefile(1);
        let mut table = PairTable::<u64>::with_buckets(4);
        let ids: Vec<_> = (0..3)
            .map(|k| table.insert(|id| test_pair(id, &cf, k, 1)).id)
            .collect();
        for id in &ids {
            table.link_pending(*id);
        }

        assert_eq!(table.pending_len(), 3);
        assert_eq!(table.pending_head(), Some(ids[0]));
        assert_eq!(table.pending_ids().collect::<Vec<_>>(), ids);
    }

    #[test]
    fn test_unlink_from_middle_keeps_order() {
        let cf = test_cachefile(1);
        let mut table = PairTable::<u64>::with_buckets(4);
        let ids: Vec<_> = (0..4)
            .map(|k| table.insert(|id| test_pair(id, &cf, k, 1)).id)
            .collect();
        for id in &ids {
            table.link_pending(*id);
        }

        assert!(table.unlink_pending(ids[1]));
        assert!(table.unlink_pending(ids[3]));
        assert!(!table.unlink_pending(ids[3]));

        assert_eq!(table.pending_ids().collect::<Vec<_>>(), vec![ids[0], ids[2]]);
        assert!(table.unlink_pending(ids[0]));
        assert_eq!(table.pending_head(), Some(ids[2]));
        assert!(table.unlink_pending(ids[2]));
        assert_eq!(table.pending_head(), None);
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn test_double_pending_panics() {
        let cf = test_cachefile(1);
        let mut table = PairTable::<u64>::with_buckets(4);
        let id = table.insert(|id| test_pair(id, &cf, 1, 1)).id;
        table.link_pending(id);
        table.link_pending(id);
    }

    #[test]
    #[should_panic(expected = "checkpoint-pending")]
    fn test_remove_pending_pair_panics() {
        let cf = test_cachefile(1);
        let mut table = PairTable::<u64>::with_buckets(4);
        let id = table.insert(|id| test_pair(id, &cf, 1, 1)).id;
        table.link_pending(id);
        table.remove(id);
    }
}
