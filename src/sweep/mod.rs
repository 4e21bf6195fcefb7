//! The concurrent sweep scheduler.
//!
//! After a collection the collectible part of the heap is cut into chunks. Mutators sweep
//! chunks as an allocation tax and connect them to the free lists of their pools when an
//! allocation fails. Sweeping reads only mark bits and object sizes, so it can run in any order
//! and on any thread. Connecting appends to a pool's free list and must go in address order,
//! one thread per pool at a time.

pub(crate) mod chunk;
pub(crate) mod pool_state;
pub(crate) mod scheme;

pub use self::scheme::ConcurrentSweepScheme;

use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Why the remaining sweep work was completed with the world stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum SweepCompletionReason {
    /// A collection is about to reuse the mark bits.
    AboutToCollect,
    /// Concurrent sweeping is disabled.
    NoConcurrentSweep,
    /// The runtime asked for it.
    Requested,
}

/// What the sweeper is doing. Only statistics and the completion protocol depend on this.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, strum_macros::Display)]
pub enum SweepMode {
    Off,
    /// Chunks are swept and connected as tax.
    On,
    /// Some thread is sweeping every remaining chunk before a concurrent cycle starts.
    CompletingSweepConcurrently,
    /// Every chunk is swept. Connecting may still be in progress.
    CompletedSweepConcurrently,
    StwCompleteSweep,
    /// Sweeping right after a collection until an allocation can be satisfied.
    StwFindMinimumFreeSize,
}

/// Counters of one sweep.
pub(crate) struct SweepCounters {
    pub mode: Atomic<SweepMode>,
    pub total_chunk_count: AtomicUsize,
    pub total_chunk_swept_count: AtomicUsize,
    pub concurrent_complete_sweep_bytes_swept: AtomicUsize,
    pub complete_sweep_phase_bytes_swept: AtomicUsize,
    pub complete_connect_phase_bytes_connected: AtomicUsize,
    pub minimum_free_entry_bytes_connected: AtomicUsize,
}

/// A snapshot of [`SweepCounters`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SweepStats {
    pub mode: SweepMode,
    pub total_chunk_count: usize,
    pub total_chunk_swept_count: usize,
    /// Bytes swept while completing the sweep concurrently before a kickoff.
    pub concurrent_complete_sweep_bytes_swept: usize,
    /// Bytes swept with the world stopped by `complete_sweep`.
    pub complete_sweep_phase_bytes_swept: usize,
    /// Bytes connected with the world stopped by `complete_sweep`.
    pub complete_connect_phase_bytes_connected: usize,
    /// Bytes connected while looking for a free entry after an allocation failure.
    pub minimum_free_entry_bytes_connected: usize,
}

impl SweepCounters {
    pub fn new() -> Self {
        Self {
            mode: Atomic::new(SweepMode::Off),
            total_chunk_count: AtomicUsize::new(0),
            total_chunk_swept_count: AtomicUsize::new(0),
            concurrent_complete_sweep_bytes_swept: AtomicUsize::new(0),
            complete_sweep_phase_bytes_swept: AtomicUsize::new(0),
            complete_connect_phase_bytes_connected: AtomicUsize::new(0),
            minimum_free_entry_bytes_connected: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> SweepMode {
        self.mode.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: SweepMode) {
        let old = self.mode.swap(mode, Ordering::SeqCst);
        if old != mode {
            trace!("Sweep mode {} -> {}", old, mode);
        }
    }

    /// Switch from `from` to `to`. Returns false if the mode was not `from`.
    pub fn switch_mode(&self, from: SweepMode, to: SweepMode) -> bool {
        let switched = self
            .mode
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if switched {
            trace!("Sweep mode {} -> {}", from, to);
        }
        switched
    }

    /// Reset the counters for a new sweep. The mode is left alone.
    pub fn clear(&self) {
        for counter in [
            &self.total_chunk_count,
            &self.total_chunk_swept_count,
            &self.concurrent_complete_sweep_bytes_swept,
            &self.complete_sweep_phase_bytes_swept,
            &self.complete_connect_phase_bytes_connected,
            &self.minimum_free_entry_bytes_connected,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> SweepStats {
        SweepStats {
            mode: self.mode(),
            total_chunk_count: self.total_chunk_count.load(Ordering::SeqCst),
            total_chunk_swept_count: self.total_chunk_swept_count.load(Ordering::SeqCst),
            concurrent_complete_sweep_bytes_swept: self
                .concurrent_complete_sweep_bytes_swept
                .load(Ordering::SeqCst),
            complete_sweep_phase_bytes_swept: self
                .complete_sweep_phase_bytes_swept
                .load(Ordering::SeqCst),
            complete_connect_phase_bytes_connected: self
                .complete_connect_phase_bytes_connected
                .load(Ordering::SeqCst),
            minimum_free_entry_bytes_connected: self
                .minimum_free_entry_bytes_connected
                .load(Ordering::SeqCst),
        }
    }
}
