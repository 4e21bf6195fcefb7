//! Per-pool sweep cursors and connection state.

use super::chunk::{FreeRun, SweepChunk};
use crate::util::math::weighted_average;
use crate::util::options::Options;
use crate::util::Address;
use crate::vm::{MemoryPool, PoolId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

struct SweepCursors {
    /// The lowest chunk that may still be unprocessed.
    next_sweep: Option<usize>,
    /// The highest chunk that may still be unprocessed. Only used while the world is stopped.
    next_sweep_reverse: Option<usize>,
}

/// Everything about a pool that changes as chunks are connected. Held under the pool's
/// connect lock, which makes one thread at a time the writer of the pool's free list.
pub(crate) struct ConnectState {
    /// The next chunk to connect.
    pub next_connect: Option<usize>,
    /// A free run that reaches the top of the last connected chunk and may continue into the
    /// next one.
    pending: Option<FreeRun>,
    /// Free bytes and entries created by the current connection.
    sweep_free_bytes: usize,
    sweep_free_holes: usize,
    pub largest_free_entry: usize,
    pub heap_size_to_connect: usize,
    pub heap_size_connected: usize,
    pub free_memory_connected: usize,
    previous_free_ratio: f32,
    history_weight: f32,
    sweep_count: usize,
}

impl ConnectState {
    pub fn remaining_to_connect(&self) -> usize {
        debug_assert!(self.heap_size_to_connect >= self.heap_size_connected);
        self.heap_size_to_connect - self.heap_size_connected
    }
}

pub(crate) struct PoolSweepState {
    pub pool: PoolId,
    pub first_chunk: Option<usize>,
    pub last_chunk: Option<usize>,
    cursors: Mutex<SweepCursors>,
    connect: Mutex<ConnectState>,
    /// The last chunk of the pool has been connected and the pending run flushed.
    final_flushed: AtomicBool,
}

impl PoolSweepState {
    pub fn new(pool: PoolId, chunks: &[SweepChunk], options: &Options) -> Self {
        let first_chunk = chunks
            .iter()
            .position(|c| c.pool == pool && c.prev_in_pool.is_none());
        let mut last_chunk = first_chunk;
        while let Some(next) = last_chunk.and_then(|i| chunks[i].next_in_pool) {
            last_chunk = Some(next);
        }
        Self {
            pool,
            first_chunk,
            last_chunk,
            cursors: Mutex::new(SweepCursors {
                next_sweep: first_chunk,
                next_sweep_reverse: last_chunk,
            }),
            connect: Mutex::new(ConnectState {
                next_connect: first_chunk,
                pending: None,
                sweep_free_bytes: 0,
                sweep_free_holes: 0,
                largest_free_entry: 0,
                heap_size_to_connect: 0,
                heap_size_connected: 0,
                free_memory_connected: 0,
                previous_free_ratio: options.previous_free_ratio_initial,
                history_weight: options.free_history_weight_startup,
                sweep_count: 0,
            }),
            final_flushed: AtomicBool::new(false),
        }
    }

    /// Carry the free-ratio history over from a previous table of the same pool.
    pub fn inherit_history(&self, old: &PoolSweepState) {
        let old = old.connect.lock().unwrap();
        let mut connect = self.connect.lock().unwrap();
        connect.previous_free_ratio = old.previous_free_ratio;
        connect.history_weight = old.history_weight;
        connect.sweep_count = old.sweep_count;
        connect.free_memory_connected = old.free_memory_connected;
        connect.heap_size_connected = old.heap_size_connected;
    }

    pub fn lock_connect(&self) -> MutexGuard<'_, ConnectState> {
        self.connect.lock().unwrap()
    }

    pub fn is_final_flushed(&self) -> bool {
        self.final_flushed.load(Ordering::SeqCst)
    }

    /// Prepare for a new sweep. Folds the free ratio found by the last sweep into the history
    /// and rewinds the cursors. Called with exclusive access held, after the chunks are reset.
    pub fn initialize_for_sweep(&self, chunks: &[SweepChunk], options: &Options) {
        let mut connect = self.connect.lock().unwrap();
        connect.sweep_count += 1;
        if connect.sweep_count > 1 {
            if connect.sweep_count == options.startup_sweep_count {
                connect.history_weight = options.free_history_weight_running;
            }
            let new_ratio = if connect.free_memory_connected == 0 {
                0.0
            } else {
                connect.free_memory_connected as f32 / connect.heap_size_connected as f32
            };
            connect.previous_free_ratio =
                weighted_average(connect.previous_free_ratio, new_ratio, connect.history_weight);
        }

        connect.next_connect = self.first_chunk;
        connect.pending = None;
        connect.sweep_free_bytes = 0;
        connect.sweep_free_holes = 0;
        connect.largest_free_entry = 0;
        connect.heap_size_to_connect = self.chunks(chunks).map(|c| c.size()).sum();
        connect.heap_size_connected = 0;
        connect.free_memory_connected = 0;
        drop(connect);

        let mut cursors = self.cursors.lock().unwrap();
        cursors.next_sweep = self.first_chunk;
        cursors.next_sweep_reverse = self.last_chunk;
        self.final_flushed.store(false, Ordering::SeqCst);
    }

    /// The chunks of this pool in address order.
    pub fn chunks<'a>(&self, chunks: &'a [SweepChunk]) -> impl Iterator<Item = &'a SweepChunk> {
        std::iter::successors(self.first_chunk, |&i| chunks[i].next_in_pool).map(|i| &chunks[i])
    }

    /// Claim the lowest unprocessed chunk for sweeping.
    pub fn claim_next(&self, chunks: &[SweepChunk]) -> Option<usize> {
        let mut cursors = self.cursors.lock().unwrap();
        let mut index = cursors.next_sweep;
        while let Some(i) = index {
            if chunks[i].try_claim() {
                cursors.next_sweep = chunks[i].next_in_pool;
                return Some(i);
            }
            index = chunks[i].next_in_pool;
        }
        cursors.next_sweep = None;
        None
    }

    /// Claim the highest unprocessed chunk for sweeping. Once this meets a chunk claimed from
    /// the other end, every lower chunk is claimed too.
    pub fn claim_previous(&self, chunks: &[SweepChunk]) -> Option<usize> {
        let mut cursors = self.cursors.lock().unwrap();
        let index = cursors.next_sweep_reverse?;
        if chunks[index].try_claim() {
            cursors.next_sweep_reverse = chunks[index].prev_in_pool;
            Some(index)
        } else {
            cursors.next_sweep_reverse = None;
            None
        }
    }

    /// The chunk the reverse cursor will claim next.
    pub fn next_sweep_reverse(&self) -> Option<usize> {
        self.cursors.lock().unwrap().next_sweep_reverse
    }

    /// Update the pool's estimate of free memory still to come from unconnected chunks.
    pub fn calculate_approximate_free(&self, connect: &ConnectState, pool: &impl MemoryPool) {
        let remaining = connect.remaining_to_connect();
        let estimate = (connect.previous_free_ratio as f64 * remaining as f64) as usize;
        let estimate = usize::min(
            estimate.next_multiple_of(std::mem::size_of::<usize>()),
            remaining,
        );
        pool.set_approximate_free_memory(estimate);
    }

    /// Connect the swept chunk `index` to the free list of `pool`. The chunk must be the next
    /// chunk to connect and be in `BusyConnect`.
    pub fn connect_chunk(
        &self,
        connect: &mut ConnectState,
        chunks: &[SweepChunk],
        index: usize,
        pool: &impl MemoryPool,
        min_free_entry_size: usize,
    ) {
        let chunk = &chunks[index];
        debug_assert_eq!(connect.next_connect, Some(index));
        connect.sweep_free_bytes = 0;
        connect.sweep_free_holes = 0;

        // A live object of the previous chunk may cover the start of this one.
        let projection = match chunk.prev_in_pool {
            Some(prev) if chunk.follows(&chunks[prev]) => chunks[prev].result().projection,
            _ => 0,
        };

        let mut result = chunk.result_mut();
        let mut leading = result.leading;
        if projection > 0 {
            if projection >= chunk.size() {
                debug_assert!(!result.live_found);
                result.projection = projection - chunk.size();
                leading = None;
            } else if let Some(run) = leading {
                debug_assert_eq!(run.base, chunk.base);
                debug_assert!(run.size >= projection);
                leading = (run.size > projection)
                    .then(|| FreeRun::new(run.base + projection, run.top()));
            }
        }

        let runs = leading
            .into_iter()
            .chain(result.entries.iter().copied())
            .chain(result.trailing);
        for run in runs {
            match connect.pending {
                Some(pending) if pending.top() == run.base => {
                    connect.pending = Some(FreeRun {
                        base: pending.base,
                        size: pending.size + run.size,
                    });
                }
                Some(pending) => {
                    Self::emit(connect, pending, pool, min_free_entry_size);
                    connect.pending = Some(run);
                }
                None => connect.pending = Some(run),
            }
        }
        // Only a run reaching the top can continue into the next chunk.
        if connect.pending.is_some_and(|p| p.top() != chunk.top) {
            Self::flush(connect, pool, min_free_entry_size);
        }
        for run in result.dark_matter.iter() {
            pool.abandon_heap_chunk(run.base, run.top());
        }
        drop(result);

        connect.next_connect = chunk.next_in_pool;
        match chunk.next_in_pool {
            None => {
                Self::flush(connect, pool, min_free_entry_size);
                self.final_flushed.store(true, Ordering::SeqCst);
            }
            // The pool's ranges are not contiguous here. Nothing can merge with the run.
            Some(next) if !chunks[next].follows(chunk) => {
                Self::flush(connect, pool, min_free_entry_size)
            }
            Some(_) => {}
        }

        connect.heap_size_connected += chunk.size();
        self.calculate_approximate_free(connect, pool);
        connect.free_memory_connected += connect.sweep_free_bytes;
        pool.set_largest_free_entry(connect.largest_free_entry);
        trace!(
            "Connected chunk {}..{} to pool {}: {} bytes in {} entries",
            chunk.base,
            chunk.top,
            self.pool,
            connect.sweep_free_bytes,
            connect.sweep_free_holes
        );
    }

    fn flush(connect: &mut ConnectState, pool: &impl MemoryPool, min_free_entry_size: usize) {
        if let Some(pending) = connect.pending.take() {
            Self::emit(connect, pending, pool, min_free_entry_size);
        }
    }

    fn emit(
        connect: &mut ConnectState,
        run: FreeRun,
        pool: &impl MemoryPool,
        min_free_entry_size: usize,
    ) {
        let top: Address = run.top();
        if run.size >= min_free_entry_size {
            pool.create_free_entry(run.base, top);
            connect.sweep_free_bytes += run.size;
            connect.sweep_free_holes += 1;
            connect.largest_free_entry = usize::max(connect.largest_free_entry, run.size);
        } else if run.size > 0 {
            pool.abandon_heap_chunk(run.base, top);
        }
    }
}
