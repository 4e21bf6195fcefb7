use super::chunk::{ChunkState, SweepChunk};
use super::pool_state::{ConnectState, PoolSweepState};
use super::{SweepCompletionReason, SweepCounters, SweepMode, SweepStats};
use crate::util::mark_bitmap::MarkBitmap;
use crate::util::options::Options;
use crate::vm::{EventHooks, Heap, MemoryPool, PoolId, VMBinding};
use itertools::Itertools;
use std::collections::TryReserveError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

struct SweepTable {
    chunks: Vec<SweepChunk>,
    /// Indexed by pool id. Pools that are not concurrently collectible have no chunks.
    pools: Vec<PoolSweepState>,
}

/// Schedules the sweep of the collectible heap after a collection.
///
/// The chunk table is rebuilt with exclusive access held and only read otherwise. Claiming a
/// chunk for sweeping goes through the pool's cursor lock, connecting through the pool's
/// connect lock.
pub struct ConcurrentSweepScheme {
    options: Options,
    table: spin::RwLock<SweepTable>,
    counters: SweepCounters,
    /// Threads currently sweeping concurrently.
    sweeping_threads: Mutex<usize>,
    sweeping_completed: Condvar,
    /// Heap ranges were added or removed since the table was built.
    heap_changed: AtomicBool,
}

impl ConcurrentSweepScheme {
    pub fn new(options: &Options) -> Self {
        Self {
            options: options.clone(),
            table: spin::RwLock::new(SweepTable {
                chunks: Vec::new(),
                pools: Vec::new(),
            }),
            counters: SweepCounters::new(),
            sweeping_threads: Mutex::new(0),
            sweeping_completed: Condvar::new(),
            heap_changed: AtomicBool::new(false),
        }
    }

    /// Rebuild the chunk table from the heap regions. Returns the number of chunks. Must be
    /// called with exclusive access held and no sweep in progress.
    pub fn rebuild_chunks<H: Heap>(&self, heap: &H) -> Result<usize, TryReserveError> {
        let pool_count = heap.pools().len();
        let chunks =
            SweepChunk::build_table(&heap.regions(), self.options.sweep_chunk_size, pool_count)?;
        let mut pools = Vec::new();
        pools.try_reserve_exact(pool_count)?;
        pools.extend((0..pool_count).map(|id| PoolSweepState::new(id, &chunks, &self.options)));

        let mut table = self.table.write();
        for (new, old) in pools.iter().zip(table.pools.iter()) {
            new.inherit_history(old);
        }
        let count = chunks.len();
        *table = SweepTable { chunks, pools };
        self.heap_changed.store(false, Ordering::SeqCst);
        debug!("Built {} sweep chunks for {} pools", count, pool_count);
        Ok(count)
    }

    /// The chunk table no longer matches the heap. It is rebuilt before the next sweep.
    pub fn mark_heap_changed(&self) {
        self.heap_changed.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.counters.mode() != SweepMode::Off
    }

    pub fn stats(&self) -> SweepStats {
        self.counters.snapshot()
    }

    /// Reset the chunks and the free lists of the collectible pools for a new sweep. Returns
    /// false if the chunk table could not be rebuilt, in which case nothing is swept.
    fn prepare<VM: VMBinding>(&self, vm: &VM) -> bool {
        if self.heap_changed.load(Ordering::SeqCst) {
            if let Err(e) = self.rebuild_chunks(vm.heap()) {
                error!("Cannot rebuild the sweep chunk table: {}. Skipping the sweep.", e);
                return false;
            }
        }
        self.counters.clear();

        let table = self.table.read();
        self.counters
            .total_chunk_count
            .store(table.chunks.len(), Ordering::SeqCst);
        for chunk in table.chunks.iter() {
            chunk.reset();
        }
        let heap = vm.heap();
        for state in table.pools.iter() {
            let pool = heap.pool(state.pool);
            if !pool.concurrent_collectible() {
                continue;
            }
            pool.reset_free_list();
            pool.set_largest_free_entry(0);
            state.initialize_for_sweep(&table.chunks, &self.options);
            state.calculate_approximate_free(&state.lock_connect(), pool);
        }
        true
    }

    /// Start a concurrent sweep after a collection. Called with exclusive access held.
    pub fn setup_for_sweep<VM: VMBinding>(&self, vm: &VM) {
        debug_assert_eq!(self.counters.mode(), SweepMode::Off);
        if self.prepare(vm) {
            self.counters.set_mode(SweepMode::On);
        }
    }

    fn sweep_chunk<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        chunks: &[SweepChunk],
        index: usize,
    ) -> bool {
        let live_found =
            chunks[index].sweep(marks, vm.object_model(), self.options.min_free_entry_size);
        self.counters
            .total_chunk_swept_count
            .fetch_add(1, Ordering::SeqCst);
        live_found
    }

    /// Sweep the lowest unprocessed chunk of a pool. Returns false if there is none.
    fn sweep_next_available<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        chunks: &[SweepChunk],
        state: &PoolSweepState,
    ) -> bool {
        let Some(index) = state.claim_next(chunks) else {
            return false;
        };
        self.sweep_chunk(vm, marks, chunks, index);
        let size = chunks[index].size();
        match self.counters.mode() {
            SweepMode::CompletingSweepConcurrently => {
                self.counters
                    .concurrent_complete_sweep_bytes_swept
                    .fetch_add(size, Ordering::SeqCst);
            }
            SweepMode::StwCompleteSweep => {
                self.counters
                    .complete_sweep_phase_bytes_swept
                    .fetch_add(size, Ordering::SeqCst);
            }
            _ => {}
        }
        true
    }

    /// Sweep the next chunk as a mutator, counted as an active sweeper.
    fn concurrent_sweep_next_available<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        chunks: &[SweepChunk],
        state: &PoolSweepState,
    ) -> bool {
        self.increase_active_sweeping_thread_count(false);
        let swept = self.sweep_next_available(vm, marks, chunks, state);
        self.decrease_active_sweeping_thread_count(false);
        swept
    }

    /// Register a sweeping thread. With `complete_sweeping`, the thread means to sweep every
    /// remaining chunk. Returns false if that is already done.
    fn increase_active_sweeping_thread_count(&self, complete_sweeping: bool) -> bool {
        let mut threads = self.sweeping_threads.lock().unwrap();
        if complete_sweeping {
            match self.counters.mode() {
                SweepMode::On => {
                    self.counters.switch_mode(
                        SweepMode::On,
                        SweepMode::CompletingSweepConcurrently,
                    );
                }
                SweepMode::CompletingSweepConcurrently => {}
                _ => return false,
            }
        }
        *threads += 1;
        true
    }

    /// Deregister a sweeping thread. The last thread to leave while the sweep is being completed
    /// flags completion. Other threads completing the sweep wait for it.
    fn decrease_active_sweeping_thread_count(&self, complete_sweeping: bool) {
        let mut threads = self.sweeping_threads.lock().unwrap();
        *threads -= 1;
        if self.counters.mode() != SweepMode::CompletingSweepConcurrently {
            return;
        }
        if *threads == 0 {
            self.counters.switch_mode(
                SweepMode::CompletingSweepConcurrently,
                SweepMode::CompletedSweepConcurrently,
            );
            debug!(
                "Sweep completed concurrently: {} bytes swept",
                self.counters
                    .concurrent_complete_sweep_bytes_swept
                    .load(Ordering::SeqCst)
            );
            self.sweeping_completed.notify_all();
        } else if complete_sweeping {
            while self.counters.mode() == SweepMode::CompletingSweepConcurrently {
                threads = self.sweeping_completed.wait(threads).unwrap();
            }
        }
    }

    /// Sweep chunks worth an allocation of `tax_size` bytes: first from the pool being
    /// allocated from, then from the other pools of its sub-space.
    pub fn pay_allocation_tax<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        pool: PoolId,
        tax_size: usize,
        kickoff_threshold: usize,
    ) {
        if !self.is_active() {
            return;
        }
        let mut chunk_tax = self.calculate_tax(vm, tax_size, kickoff_threshold);
        let table = self.table.read();
        if let Some(state) = table.pools.get(pool) {
            chunk_tax -= self.sweep_pool(vm, marks, &table.chunks, state, chunk_tax);
        }
        let subspace = vm.heap().pool(pool).subspace();
        for state in table.pools.iter() {
            if chunk_tax == 0 {
                break;
            }
            if state.pool == pool || vm.heap().pool(state.pool).subspace() != subspace {
                continue;
            }
            chunk_tax -= self.sweep_pool(vm, marks, &table.chunks, state, chunk_tax);
        }
    }

    /// The number of chunks to sweep for an allocation of `size` bytes: the unswept chunks
    /// scaled by the share of the remaining free memory the allocation takes, at least one.
    fn calculate_tax<VM: VMBinding>(&self, vm: &VM, size: usize, kickoff_threshold: usize) -> usize {
        let total = self.counters.total_chunk_count.load(Ordering::SeqCst);
        let swept = self.counters.total_chunk_swept_count.load(Ordering::SeqCst);
        debug_assert!(total >= swept);

        let mut remaining_free = vm.heap().approximate_free_memory();
        if self.options.concurrent_kickoff_enabled {
            // Another thread may already have pushed free memory below the threshold.
            remaining_free = remaining_free.saturating_sub(kickoff_threshold);
        }
        let share = if remaining_free == 0 {
            1.0
        } else {
            f64::min(1.0, size as f64 / remaining_free as f64)
        };
        let chunk_tax = (total.saturating_sub(swept) as f64 * share) as usize;
        usize::max(chunk_tax, 1)
    }

    /// Sweep up to `chunk_tax` chunks of a pool. Returns the number swept.
    fn sweep_pool<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        chunks: &[SweepChunk],
        state: &PoolSweepState,
        chunk_tax: usize,
    ) -> usize {
        if state.is_final_flushed() {
            return 0;
        }
        let mut paid = 0;
        while paid < chunk_tax && self.concurrent_sweep_next_available(vm, marks, chunks, state) {
            paid += 1;
        }
        paid
    }

    /// Connect chunks of `pool`, sweeping them first if needed, until the pool has a free entry
    /// of at least `size` bytes. Returns false if every chunk is connected without finding one.
    pub fn replenish_pool_for_allocate<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        pool: PoolId,
        size: usize,
    ) -> bool {
        if !self.is_active() {
            return false;
        }
        let table = self.table.read();
        self.replenish(vm, marks, &table, pool, size)
    }

    fn replenish<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        table: &SweepTable,
        pool: PoolId,
        size: usize,
    ) -> bool {
        let Some(state) = table.pools.get(pool) else {
            return false;
        };
        let memory_pool = vm.heap().pool(pool);
        let mut connect = state.lock_connect();
        while let Some(index) = connect.next_connect {
            let chunk = &table.chunks[index];
            while chunk.state() < ChunkState::Swept {
                // Somebody else is sweeping it. Move other work along meanwhile.
                if !self.concurrent_sweep_next_available(vm, marks, &table.chunks, state) {
                    std::thread::yield_now();
                }
            }
            if !chunk.try_start_connect() {
                debug_assert!(false, "chunk {} connected out of order", index);
                connect.next_connect = chunk.next_in_pool;
                continue;
            }
            state.connect_chunk(
                &mut connect,
                &table.chunks,
                index,
                memory_pool,
                self.options.min_free_entry_size,
            );
            chunk.finish_connect();
            if self.counters.mode() == SweepMode::StwFindMinimumFreeSize {
                self.counters
                    .minimum_free_entry_bytes_connected
                    .fetch_add(chunk.size(), Ordering::SeqCst);
            }
            if connect.largest_free_entry >= size {
                return true;
            }
        }
        false
    }

    /// Connect the chunks of a pool from the connect cursor on, as long as they are swept.
    /// Returns the heap bytes connected.
    fn connect_swept_chunks(
        &self,
        table: &SweepTable,
        state: &PoolSweepState,
        connect: &mut ConnectState,
        pool: &impl MemoryPool,
    ) -> usize {
        let mut connected = 0;
        while let Some(index) = connect.next_connect {
            let chunk = &table.chunks[index];
            if !chunk.try_start_connect() {
                break;
            }
            state.connect_chunk(
                connect,
                &table.chunks,
                index,
                pool,
                self.options.min_free_entry_size,
            );
            chunk.finish_connect();
            connected += chunk.size();
        }
        connected
    }

    /// Sweep every remaining chunk before the mark bits are reused by a concurrent cycle.
    /// Any number of threads may join. Every thread returns only once all chunks are swept,
    /// and connects what it can on the way out.
    pub fn complete_sweeping_concurrently<VM: VMBinding>(&self, vm: &VM, marks: &MarkBitmap) {
        if !matches!(
            self.counters.mode(),
            SweepMode::On | SweepMode::CompletingSweepConcurrently
        ) {
            return;
        }
        if !self.increase_active_sweeping_thread_count(true) {
            return;
        }
        {
            let table = self.table.read();
            for state in table.pools.iter() {
                while self.sweep_next_available(vm, marks, &table.chunks, state) {}
            }
        }
        self.decrease_active_sweeping_thread_count(true);

        let table = self.table.read();
        let heap = vm.heap();
        for state in table.pools.iter() {
            let mut connect = state.lock_connect();
            self.connect_swept_chunks(&table, state, &mut connect, heap.pool(state.pool));
        }
    }

    /// Sweep and connect every remaining chunk with the world stopped, using `sweep_threads`
    /// threads for the sweep.
    pub fn complete_sweep<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        reason: SweepCompletionReason,
    ) {
        if !self.is_active() {
            return;
        }
        self.counters.set_mode(SweepMode::StwCompleteSweep);

        let table = self.table.read();
        let table: &SweepTable = &table;
        let sweep_all = || {
            for state in table.pools.iter() {
                while self.sweep_next_available(vm, marks, &table.chunks, state) {}
            }
        };
        std::thread::scope(|s| {
            for _ in 1..self.options.sweep_threads {
                s.spawn(sweep_all);
            }
            sweep_all();
        });

        let heap = vm.heap();
        for state in table.pools.iter() {
            let mut connect = state.lock_connect();
            let connected =
                self.connect_swept_chunks(table, state, &mut connect, heap.pool(state.pool));
            self.counters
                .complete_connect_phase_bytes_connected
                .fetch_add(connected, Ordering::SeqCst);
            debug_assert!(
                connect.next_connect.is_none(),
                "pool {} has unconnected chunks",
                state.pool
            );
            debug_assert!(state.first_chunk.is_none() || state.is_final_flushed());
        }

        let stats = self.counters.snapshot();
        info!(
            "Sweep completed ({}): {} bytes swept, {} bytes connected",
            reason, stats.complete_sweep_phase_bytes_swept, stats.complete_connect_phase_bytes_connected
        );
        probe!(
            gencon,
            sweep_completed,
            stats.complete_sweep_phase_bytes_swept,
            stats.complete_connect_phase_bytes_connected
        );
        vm.hooks().on_sweep_completed(reason);
        self.counters.set_mode(SweepMode::Off);
    }

    /// Start a sweep with the world stopped and sweep until pool `pool` has a free entry of
    /// `minimum_free_size` bytes. Chunks at the boundaries between the pools of a sub-space are
    /// swept first so that each pool can later be connected on its own. Returns true if the
    /// entry was found.
    pub fn sweep_for_minimum_size<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        pool: Option<PoolId>,
        minimum_free_size: usize,
    ) -> bool {
        let switched = self
            .counters
            .switch_mode(SweepMode::Off, SweepMode::StwFindMinimumFreeSize);
        debug_assert!(switched, "sweep still active");
        if !self.prepare(vm) {
            self.counters.set_mode(SweepMode::Off);
            return false;
        }

        let heap = vm.heap();
        let table = self.table.read();
        let table: &SweepTable = &table;
        let collectible = table
            .pools
            .iter()
            .filter(|s| heap.pool(s.pool).concurrent_collectible());
        for (_, group) in &collectible.chunk_by(|s| heap.pool(s.pool).subspace()) {
            let group: Vec<&PoolSweepState> = group.collect();
            if let Some((_, lower)) = group.split_last() {
                for state in lower {
                    self.sweep_pool_boundary(vm, marks, &table.chunks, state);
                }
            }
        }

        let mut found = false;
        if minimum_free_size > 0 {
            if let Some(state) = pool.and_then(|p| table.pools.get(p)) {
                let done = AtomicBool::new(false);
                std::thread::scope(|s| {
                    for _ in 1..self.options.sweep_threads {
                        s.spawn(|| {
                            while !done.load(Ordering::SeqCst)
                                && self.sweep_next_available(vm, marks, &table.chunks, state)
                            {}
                        });
                    }
                    found = self.replenish(vm, marks, table, state.pool, minimum_free_size);
                    done.store(true, Ordering::SeqCst);
                });
            }
        }

        for state in table.pools.iter() {
            let memory_pool = heap.pool(state.pool);
            if memory_pool.concurrent_collectible() {
                state.calculate_approximate_free(&state.lock_connect(), memory_pool);
            }
        }
        self.counters.switch_mode(SweepMode::StwFindMinimumFreeSize, SweepMode::On);
        debug!(
            "Swept for a {} byte entry: found {}, {} bytes connected",
            minimum_free_size,
            found,
            self.counters
                .minimum_free_entry_bytes_connected
                .load(Ordering::SeqCst)
        );
        found
    }

    /// Sweep a pool from its top down to the first live object, then make the projections of
    /// its last chunks known and split dead space that runs into the next pool.
    fn sweep_pool_boundary<VM: VMBinding>(
        &self,
        vm: &VM,
        marks: &MarkBitmap,
        chunks: &[SweepChunk],
        state: &PoolSweepState,
    ) {
        let mut live_found = false;
        while !live_found {
            match state.claim_previous(chunks) {
                Some(index) => live_found = self.sweep_chunk(vm, marks, chunks, index),
                None => break,
            }
        }

        let pool = vm.heap().pool(state.pool);
        let reverse = state.next_sweep_reverse();
        if live_found {
            // The chunk with the live object is the last one swept.
            let start = match reverse {
                Some(r) => chunks[r].next_in_pool,
                None => state.first_chunk,
            };
            if let Some(start) = start {
                propagate_chunk_projections(chunks, start);
                abandon_overlapped_chunks(chunks, marks, pool, start, reverse.is_none());
            }
        } else if let Some(first) = state.first_chunk {
            abandon_overlapped_chunks(chunks, marks, pool, first, true);
        }
    }
}

/// Carry projections larger than a chunk forward through the chunks of a pool, starting at
/// `start`.
fn propagate_chunk_projections(chunks: &[SweepChunk], start: usize) {
    let mut previous = start;
    while let Some(current) = chunks[previous].next_in_pool {
        let chunk = &chunks[current];
        debug_assert!(chunk.state() >= ChunkState::Swept);
        if chunk.follows(&chunks[previous]) {
            let projection = chunks[previous].result().projection;
            if projection > chunk.size() {
                chunk.result_mut().projection = projection - chunk.size();
            }
        }
        previous = current;
    }
}

/// Walk the chunks of a pool from `start` and abandon dead space that runs over the top of a
/// chunk, in two halves split at the chunk boundary. Afterwards the next chunk, possibly of
/// another pool, can be walked from its base.
fn abandon_overlapped_chunks(
    chunks: &[SweepChunk],
    marks: &MarkBitmap,
    pool: &impl MemoryPool,
    start: usize,
    first_in_pool: bool,
) {
    let mut processed = false;
    let mut index = Some(start);
    while let Some(current) = index {
        let chunk = &chunks[current];
        index = chunk.next_in_pool;

        let result = chunk.result();
        if result.projection != 0 {
            // The next chunk starts where the projection ends.
            processed = true;
            continue;
        }
        let walk_start = match (result.trailing, result.leading) {
            (Some(trailing), _) => trailing.base,
            (None, Some(leading)) if leading.top() == chunk.top => {
                if first_in_pool && current == start {
                    leading.base
                } else if processed {
                    let projection = chunk
                        .prev_in_pool
                        .filter(|&p| chunk.follows(&chunks[p]))
                        .map_or(0, |p| chunks[p].result().projection);
                    chunk.base + projection
                } else {
                    // A chunk above the live object has not been reached yet.
                    continue;
                }
            }
            // A live object ends exactly at the top.
            _ => {
                processed = true;
                continue;
            }
        };
        processed = true;
        drop(result);

        // Dead space continues into the chunk that follows in the address space.
        let Some(next) = chunks.get(current + 1).filter(|n| n.follows(chunk)) else {
            continue;
        };
        let dead_end = marks
            .next_marked(chunk.top, next.top)
            .map_or(next.top, |o| o.to_raw_address());
        if walk_start < chunk.top && dead_end > chunk.top {
            trace!(
                "Abandoning {}..{} and {}..{}",
                walk_start,
                chunk.top,
                chunk.top,
                dead_end
            );
            pool.abandon_heap_chunk(walk_start, chunk.top);
            pool.abandon_heap_chunk(chunk.top, dead_end);
        }
    }
}
