//! Sweep chunks: the unit of sweep work.

use crate::util::mark_bitmap::MarkBitmap;
use crate::util::Address;
use crate::vm::{HeapRegion, ObjectModel, PoolId, SubspaceId};
use atomic::Atomic;
use atomic_refcell::{AtomicRef, AtomicRefCell, AtomicRefMut};
use bytemuck::NoUninit;
use std::collections::TryReserveError;
use std::sync::atomic::Ordering;

/// The state of a chunk in the current sweep. A chunk only ever moves forward.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, NoUninit, strum_macros::Display)]
pub enum ChunkState {
    Unprocessed,
    BusySweep,
    Swept,
    BusyConnect,
    Connected,
}

/// A range of free memory found by the sweep.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeRun {
    pub base: Address,
    pub size: usize,
}

impl FreeRun {
    pub fn new(base: Address, top: Address) -> Self {
        debug_assert!(top >= base);
        Self {
            base,
            size: top - base,
        }
    }

    pub fn top(&self) -> Address {
        self.base + self.size
    }
}

/// What sweeping a chunk found. Connecting the chunk turns this into free entries.
#[derive(Debug, Default)]
pub struct SweepResult {
    /// Free memory from the base of the chunk to the first live object, or the whole chunk if
    /// no object starts in it. It may still be covered by an object of the previous chunk.
    pub leading: Option<FreeRun>,
    /// Free memory from the end of the last live object to the top of the chunk.
    pub trailing: Option<FreeRun>,
    /// Bytes of the next chunk covered by the last live object of this one.
    pub projection: usize,
    /// Free runs between live objects that are large enough to be free entries.
    pub entries: Vec<FreeRun>,
    /// Free runs between live objects that are too small to be free entries.
    pub dark_matter: Vec<FreeRun>,
    pub live_found: bool,
}

pub struct SweepChunk {
    pub base: Address,
    pub top: Address,
    pub pool: PoolId,
    pub subspace: SubspaceId,
    /// The previous chunk of the same pool, in address order.
    pub prev_in_pool: Option<usize>,
    /// The next chunk of the same pool, in address order.
    pub next_in_pool: Option<usize>,
    state: Atomic<ChunkState>,
    result: AtomicRefCell<SweepResult>,
}

impl SweepChunk {
    fn new(base: Address, top: Address, region: &HeapRegion) -> Self {
        Self {
            base,
            top,
            pool: region.pool,
            subspace: region.subspace,
            prev_in_pool: None,
            next_in_pool: None,
            state: Atomic::new(ChunkState::Unprocessed),
            result: AtomicRefCell::new(SweepResult::default()),
        }
    }

    pub fn size(&self) -> usize {
        self.top - self.base
    }

    pub fn state(&self) -> ChunkState {
        self.state.load(Ordering::SeqCst)
    }

    fn transition(&self, from: ChunkState, to: ChunkState) -> bool {
        debug_assert!(to > from);
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Take ownership of sweeping this chunk. Returns false if another thread has it.
    pub fn try_claim(&self) -> bool {
        self.transition(ChunkState::Unprocessed, ChunkState::BusySweep)
    }

    /// Take ownership of connecting this chunk. Returns false if it is not swept yet or is
    /// already connected.
    pub fn try_start_connect(&self) -> bool {
        self.transition(ChunkState::Swept, ChunkState::BusyConnect)
    }

    pub fn finish_connect(&self) {
        let done = self.transition(ChunkState::BusyConnect, ChunkState::Connected);
        debug_assert!(done, "chunk {}..{} was not being connected", self.base, self.top);
    }

    /// Does the chunk start right where `other` ends?
    pub fn follows(&self, other: &SweepChunk) -> bool {
        other.top == self.base
    }

    /// Forget the last sweep. Called with exclusive access held.
    pub fn reset(&self) {
        self.state.store(ChunkState::Unprocessed, Ordering::SeqCst);
        *self.result.borrow_mut() = SweepResult::default();
    }

    pub fn result(&self) -> AtomicRef<'_, SweepResult> {
        self.result.borrow()
    }

    pub fn result_mut(&self) -> AtomicRefMut<'_, SweepResult> {
        self.result.borrow_mut()
    }

    /// Sweep a chunk this thread has claimed. Returns true if a live object starts in it.
    pub fn sweep(
        &self,
        marks: &MarkBitmap,
        model: &impl ObjectModel,
        min_free_entry_size: usize,
    ) -> bool {
        debug_assert_eq!(self.state(), ChunkState::BusySweep);
        let mut result = self.result.borrow_mut();
        *result = SweepResult::default();

        // End of the last live object seen.
        let mut live_end: Option<Address> = None;
        for object in marks.iter_marked(self.base, self.top) {
            let start = object.to_raw_address();
            match live_end {
                None if start > self.base => {
                    result.leading = Some(FreeRun::new(self.base, start));
                }
                Some(end) if start > end => {
                    let run = FreeRun::new(end, start);
                    if run.size >= min_free_entry_size {
                        result.entries.push(run);
                    } else {
                        result.dark_matter.push(run);
                    }
                }
                _ => {}
            }
            let end = start + model.object_size(object);
            live_end = Some(live_end.map_or(end, |e| Address::max(e, end)));
        }

        match live_end {
            None => result.leading = Some(FreeRun::new(self.base, self.top)),
            Some(end) if end > self.top => result.projection = end - self.top,
            Some(end) if end < self.top => result.trailing = Some(FreeRun::new(end, self.top)),
            Some(_) => {}
        }
        result.live_found = live_end.is_some();
        #[cfg(feature = "extreme_assertions")]
        for run in result.entries.iter().chain(result.trailing.iter()) {
            assert!(
                marks.next_marked(run.base, run.top()).is_none(),
                "free run {}..{} contains a live object",
                run.base,
                run.top()
            );
        }
        let live_found = result.live_found;
        drop(result);

        let swept = self.transition(ChunkState::BusySweep, ChunkState::Swept);
        debug_assert!(swept);
        live_found
    }

    /// Cut the collectible regions into chunks of at most `chunk_size` bytes and link the
    /// chunks of each pool in address order. `regions` must be in address order.
    pub fn build_table(
        regions: &[HeapRegion],
        chunk_size: usize,
        pool_count: usize,
    ) -> Result<Vec<SweepChunk>, TryReserveError> {
        let collectible = || regions.iter().filter(|r| r.concurrent_collectible);
        let needed = collectible().map(|r| r.size().div_ceil(chunk_size)).sum();
        let mut table: Vec<SweepChunk> = Vec::new();
        table.try_reserve_exact(needed)?;

        let mut last_in_pool: Vec<Option<usize>> = vec![None; pool_count];
        for region in collectible() {
            let mut base = region.base;
            while base < region.top {
                let top = Address::min(base + chunk_size, region.top);
                let index = table.len();
                let mut chunk = SweepChunk::new(base, top, region);
                if let Some(prev) = last_in_pool[region.pool] {
                    chunk.prev_in_pool = Some(prev);
                    table[prev].next_in_pool = Some(index);
                }
                last_in_pool[region.pool] = Some(index);
                table.push(chunk);
                base = top;
            }
        }
        debug_assert_eq!(table.len(), needed);
        Ok(table)
    }
}
