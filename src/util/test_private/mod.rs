//! This module exposes private items of gencon for testing and benchmarking. They must not be
//! used in production.
//!
//! # Notes on inlining
//!
//! We refrain from inserting inlining hints manually elsewhere. But we use `#[inline(always)]`
//! in this module explicitly because the functions here are simple wrappers of private
//! functions, and the compiler usually fails to make the right decision given that those
//! functions are not used often.

use crate::concurrent::tax::AllocationTax;
use crate::global_state::CollectorState;
use crate::sweep::chunk::SweepChunk;
use crate::util::mark_bitmap::MarkBitmap;
use crate::util::options::Options;
use crate::vm::{HeapRegion, ObjectModel};

/// An allocation tax tuned to a heap, with its own collector state.
pub struct TunedTax {
    tax: AllocationTax,
    state: CollectorState,
}

impl TunedTax {
    /// Tune a tax for a collectible heap of `heap_size` bytes, as at startup.
    pub fn new(options: &Options, heap_size: usize) -> Self {
        let tax = AllocationTax::new(options);
        let state = CollectorState::new();
        tax.tune_to_heap(heap_size, 0, &state, false, false);
        Self { tax, state }
    }

    pub fn kickoff_threshold(&self) -> usize {
        self.state.kickoff_threshold()
    }

    /// Expose `AllocationTax::trace_size_for` when running `cargo bench`.
    #[inline(always)]
    pub fn trace_size_for(&self, tax_size: usize, remaining_free: usize) -> usize {
        self.tax
            .trace_size_for(tax_size, remaining_free, &self.state, false)
    }
}

/// Build the sweep chunks of `regions` and sweep each of them. Returns the number of chunks in
/// which a live object starts.
#[inline(always)]
pub fn sweep_regions(
    regions: &[HeapRegion],
    chunk_size: usize,
    pool_count: usize,
    marks: &MarkBitmap,
    model: &impl ObjectModel,
    min_free_entry_size: usize,
) -> usize {
    let Ok(chunks) = SweepChunk::build_table(regions, chunk_size, pool_count) else {
        return 0;
    };
    chunks
        .iter()
        .filter(|chunk| chunk.try_claim() && chunk.sweep(marks, model, min_free_entry_size))
        .count()
}
