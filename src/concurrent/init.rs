//! Partitioning of the mark-bit and card-table initialization done at kickoff.
//!
//! Every heap region contributes a mark-bit range, and concurrently collectible regions also
//! a card-table range. Threads claim fixed-size pieces of a range by advancing its cursor with
//! a compare-and-set, so any number of mutators can share the work.

use crate::util::mark_bitmap::{MarkBitmap, HEAP_BYTES_PER_BITMAP_BYTE};
use crate::util::Address;
use crate::vm::{HeapRegion, SubspaceId};
use std::collections::TryReserveError;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Heap bytes covered by one card.
pub const CARD_SIZE: usize = 512;

/// What to initialize in a range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InitType {
    /// Clear the mark bits of a collectible range, or set them for a range the cycle must not
    /// trace into.
    MarkBits,
    /// Clear the cards of a collectible range.
    CardTable,
}

impl InitType {
    /// Heap bytes described by one byte of this metadata.
    fn heap_bytes_per_unit(self) -> usize {
        match self {
            InitType::MarkBits => HEAP_BYTES_PER_BITMAP_BYTE,
            InitType::CardTable => CARD_SIZE,
        }
    }
}

struct InitRange {
    base: Address,
    top: Address,
    subspace: SubspaceId,
    concurrent_collectible: bool,
    init_type: InitType,
    /// Heap bytes handed out per claim.
    chunk_size: usize,
    /// The lowest unclaimed address. Only moves forward, except when the range is rewound
    /// with exclusive access held.
    current: AtomicUsize,
}

impl InitRange {
    fn rewind(&self) {
        self.current.store(self.base.as_usize(), Ordering::SeqCst);
    }

    fn exhaust(&self) {
        self.current.store(self.top.as_usize(), Ordering::SeqCst);
    }

    fn work(&self, base: Address, top: Address) -> usize {
        (top - base).div_ceil(self.init_type.heap_bytes_per_unit())
    }
}

/// A piece of a range claimed by one thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ClaimedRange {
    pub base: Address,
    pub top: Address,
    pub subspace: SubspaceId,
    pub concurrent_collectible: bool,
    pub init_type: InitType,
    /// Bytes of metadata initialized by processing this piece.
    pub work: usize,
}

impl ClaimedRange {
    /// Initialize the metadata of this piece. Card ranges are handed to `clear_cards`.
    pub fn process(&self, marks: &MarkBitmap, clear_cards: impl FnOnce(Address, Address)) {
        match self.init_type {
            InitType::MarkBits if self.concurrent_collectible => {
                marks.clear_range(self.base, self.top)
            }
            InitType::MarkBits => marks.set_range(self.base, self.top),
            InitType::CardTable => clear_cards(self.base, self.top),
        }
    }
}

pub(crate) struct InitScheduler {
    ranges: spin::RwLock<Vec<InitRange>>,
    /// Index of the first range that may still have unclaimed pieces.
    next_range: AtomicUsize,
    /// Bytes of metadata per claim.
    init_chunk_size: usize,
}

impl InitScheduler {
    pub fn new(init_chunk_size: usize) -> Self {
        Self {
            ranges: spin::RwLock::new(Vec::new()),
            next_range: AtomicUsize::new(0),
            init_chunk_size,
        }
    }

    /// Rebuild the ranges from the heap regions. Returns the total bytes of metadata to
    /// initialize at kickoff. Must be called with exclusive access held.
    ///
    /// On failure the old table is kept and the caller must not start a cycle.
    pub fn build_init_ranges(&self, regions: &[HeapRegion]) -> Result<usize, TryReserveError> {
        let needed = regions.len() + regions.iter().filter(|r| r.concurrent_collectible).count();
        let mut table: Vec<InitRange> = Vec::new();
        table.try_reserve_exact(needed)?;

        for region in regions {
            let mut push = |init_type: InitType| {
                table.push(InitRange {
                    base: region.base,
                    top: region.top,
                    subspace: region.subspace,
                    concurrent_collectible: region.concurrent_collectible,
                    init_type,
                    chunk_size: self.init_chunk_size * init_type.heap_bytes_per_unit(),
                    current: AtomicUsize::new(region.base.as_usize()),
                });
            };
            push(InitType::MarkBits);
            if region.concurrent_collectible {
                push(InitType::CardTable);
            }
        }
        debug_assert_eq!(table.len(), needed);

        let total = table.iter().map(|r| r.work(r.base, r.top)).sum();
        trace!(
            "Built {} init ranges for {} heap regions, {} bytes of init work",
            table.len(),
            regions.len(),
            total
        );
        *self.ranges.write() = table;
        self.next_range.store(0, Ordering::SeqCst);
        Ok(total)
    }

    /// Claim the next unclaimed piece of any range.
    pub fn claim_next_range(&self) -> Option<ClaimedRange> {
        let ranges = self.ranges.read();
        loop {
            let index = self.next_range.load(Ordering::SeqCst);
            let range = ranges.get(index)?;
            let current = range.current.load(Ordering::SeqCst);
            let top = range.top.as_usize();
            if current >= top {
                // Someone else may have moved on already. Either way the index is past this range.
                let _ = self.next_range.compare_exchange(
                    index,
                    index + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            let new_current = usize::min(current + range.chunk_size, top);
            if range
                .current
                .compare_exchange(current, new_current, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let base = unsafe { Address::from_usize(current) };
                let top = unsafe { Address::from_usize(new_current) };
                return Some(ClaimedRange {
                    base,
                    top,
                    subspace: range.subspace,
                    concurrent_collectible: range.concurrent_collectible,
                    init_type: range.init_type,
                    work: range.work(base, top),
                });
            }
        }
    }

    /// Has every piece of every range been handed out?
    pub fn all_ranges_claimed(&self) -> bool {
        let ranges = self.ranges.read();
        ranges
            .iter()
            .all(|r| r.current.load(Ordering::SeqCst) >= r.top.as_usize())
    }

    /// Rewind every range for a new concurrent cycle.
    pub fn reset_for_kickoff(&self) {
        let ranges = self.ranges.read();
        for range in ranges.iter() {
            range.rewind();
        }
        self.next_range.store(0, Ordering::SeqCst);
    }

    /// Rewind only the mark-bit ranges of regions that are not concurrently collectible.
    /// Their bits were set for the concurrent cycle and must be reset for the stop-the-world
    /// collection.
    pub fn reset_for_stop_the_world(&self) {
        let ranges = self.ranges.read();
        for range in ranges.iter() {
            if range.init_type == InitType::MarkBits && !range.concurrent_collectible {
                range.rewind();
            } else {
                range.exhaust();
            }
        }
        self.next_range.store(0, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn range_count(&self) -> usize {
        self.ranges.read().len()
    }
}
