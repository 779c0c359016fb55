/// Page table - partitioned hash map from PageId to resident frames.
///
/// Invariants: every Loading/Resident/MarkedForEviction/LockedExclusive
/// frame is present; Evicted frames are absent. The table is split into a
/// power-of-two number of partitions so writers only serialize against
/// their own bucket group; the partition is chosen by mixing the packed
/// id bits, which keeps sequential page indices spread out.

use crate::buffer::frame::Frame;
use crate::buffer::page_id::PageId;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Partition = RwLock<HashMap<PageId, Arc<Frame>>>;

pub struct PageTable {
    partitions: Box<[Partition]>,

    /// `partitions.len() - 1`; the count is rounded up to a power of two
    index_mask: usize,

    // Lookup counters
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PageTable {
    pub fn new(num_partitions: usize, capacity_hint: usize) -> Self {
        let count = num_partitions.max(1).next_power_of_two();
        let partitions: Box<[Partition]> = (0..count)
            .map(|_| RwLock::new(HashMap::with_capacity(capacity_hint)))
            .collect();
        Self {
            index_mask: count - 1,
            partitions,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    fn partition(&self, page_id: PageId) -> &Partition {
        // Splitmix-style bit mix before masking; the raw id's low bits
        // alone would funnel one size class into adjacent partitions
        let raw = page_id.to_raw();
        let mixed = (raw ^ (raw >> 29)).wrapping_mul(0xd1b5_4a32_d192_ed03);
        &self.partitions[(mixed >> 32) as usize & self.index_mask]
    }

    /// Look up the frame holding `page_id`, if resident
    #[inline]
    pub fn find(&self, page_id: PageId) -> Option<Arc<Frame>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.partition(page_id).read().get(&page_id).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Insert `frame` unless the page is already present.
    ///
    /// Returns the winning frame: the inserted one, or the incumbent a
    /// concurrent loader installed first. The bool reports whether the
    /// caller's frame won.
    pub fn insert_if_absent(&self, page_id: PageId, frame: Arc<Frame>) -> (Arc<Frame>, bool) {
        match self.partition(page_id).write().entry(page_id) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                entry.insert(frame.clone());
                (frame, true)
            }
        }
    }

    /// Remove the entry for `page_id`
    #[inline]
    pub fn erase(&self, page_id: PageId) -> Option<Arc<Frame>> {
        self.partition(page_id).write().remove(&page_id)
    }

    /// Snapshot of all current frames, partition by partition.
    ///
    /// Used by flush_all and shutdown; not a hot path.
    #[cold]
    pub fn collect_frames(&self) -> Vec<Arc<Frame>> {
        let mut frames = Vec::new();
        for partition in self.partitions.iter() {
            frames.extend(partition.read().values().cloned());
        }
        frames
    }

    /// Fraction of lookups that found their page
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let total = self.lookups.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.hits.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Get statistics: (lookups, hits, misses)
    #[cold]
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.lookups.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Resident entries summed across every partition
    #[cold]
    pub fn len(&self) -> usize {
        let mut total = 0;
        for partition in self.partitions.iter() {
            total += partition.read().len();
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::frame::FrameState;
    use crate::buffer::page_id::PageSizeType;

    fn page(index: u64) -> PageId {
        PageId::new(PageSizeType::KiB4, index)
    }

    fn frame(index: u64) -> Arc<Frame> {
        Arc::new(Frame::new(page(index), FrameState::Loading))
    }

    #[test]
    fn test_find_insert_erase() {
        let table = PageTable::new(4, 10);

        let (f1, won) = table.insert_if_absent(page(1), frame(1));
        assert!(won);
        assert!(Arc::ptr_eq(&table.find(page(1)).unwrap(), &f1));
        assert!(table.find(page(3)).is_none());

        table.erase(page(1));
        assert!(table.find(page(1)).is_none());
    }

    #[test]
    fn test_insert_if_absent_keeps_incumbent() {
        let table = PageTable::new(4, 10);

        let (winner, won) = table.insert_if_absent(page(1), frame(1));
        assert!(won);

        let loser = frame(1);
        let (resolved, won_again) = table.insert_if_absent(page(1), loser.clone());
        assert!(!won_again);
        assert!(Arc::ptr_eq(&resolved, &winner));
        assert!(!Arc::ptr_eq(&resolved, &loser));
    }

    #[test]
    fn test_lookup_stats() {
        let table = PageTable::new(4, 10);
        table.insert_if_absent(page(1), frame(1));

        assert!(table.find(page(1)).is_some());
        assert!(table.find(page(2)).is_none());

        let (lookups, hits, misses) = table.stats();
        assert_eq!(lookups, 2);
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
        assert!((table.hit_rate() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_partition_count_rounds_up() {
        // A non-power-of-two request still addresses every entry
        let table = PageTable::new(3, 4);
        for i in 0..64 {
            table.insert_if_absent(page(i), frame(i));
        }
        assert_eq!(table.len(), 64);
        for i in 0..64 {
            assert!(table.find(page(i)).is_some());
        }
    }
}
