//! The execution-mode controller: what a mutator does for its allocation tax in each mode,
//! when a cycle starts, and how it ends with a stop-the-world collection.

use super::init::InitType;
use super::tracing::Tracer;
use super::{AbortReason, ConcurrentGC, ExecutionMode, InitSync};
use crate::concurrent::helpers::HelperRequest;
use crate::concurrent::mode::MAX_ROOT_TRACING_PHASES;
use crate::global_state::{CardCleaningReason, KickoffReason};
use crate::sweep::SweepCompletionReason;
use crate::util::{Address, ObjectReference};
use crate::vm::{
    Collection, CollectionReason, EventHooks, Heap, HeapRegion, MemoryPool, ObjectModel, PoolId,
    Scanning, VMBinding,
};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::MutexGuard;

/// An allocation about to be made by a mutator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Bytes requested from the pool.
    pub bytes: usize,
    /// Bytes the tax is computed on. Usually `bytes`, but a thread-local cache refill is
    /// taxed for the whole cache.
    pub tax_size: usize,
    pub pool: PoolId,
    /// Nursery allocations pay the marking tax but no sweep tax.
    pub nursery: bool,
    /// Can the thread block for exclusive access? A thread that cannot asks for a barrier
    /// callback instead.
    pub at_safepoint: bool,
}

impl AllocationRequest {
    pub fn new(bytes: usize, pool: PoolId) -> Self {
        Self {
            bytes,
            tax_size: bytes,
            pool,
            nursery: false,
            at_safepoint: true,
        }
    }

    pub fn with_tax_size(mut self, tax_size: usize) -> Self {
        self.tax_size = tax_size;
        self
    }

    pub fn in_nursery(mut self) -> Self {
        self.nursery = true;
        self
    }

    pub fn not_at_safepoint(mut self) -> Self {
        self.at_safepoint = false;
        self
    }
}

/// An allocation could not be satisfied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// Still no room after a stop-the-world collection.
    OutOfMemory { bytes: usize },
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocationError::OutOfMemory { bytes } => {
                write!(f, "out of memory allocating {} bytes", bytes)
            }
        }
    }
}

impl std::error::Error for AllocationError {}

impl<VM: VMBinding> ConcurrentGC<VM> {
    /// Pay for an allocation. Depending on the mode this starts a cycle, initializes mark bits,
    /// activates the write barrier, traces roots or objects, finishes the cycle, or sweeps.
    pub fn pay_allocation_tax(&self, request: &AllocationRequest) {
        if self.state.mode() == ExecutionMode::Off && !self.time_to_kickoff() {
            if !request.nursery {
                self.sweep.pay_allocation_tax(
                    &self.vm,
                    &self.marks,
                    request.pool,
                    request.tax_size,
                    self.state.kickoff_threshold(),
                );
            }
            return;
        }
        self.concurrent_mark(request);
    }

    /// Start a cycle if free memory fell below the kickoff threshold or a kickoff was forced.
    /// Exactly one thread switches the mode. Every thread that sees the condition returns true.
    pub(crate) fn time_to_kickoff(&self) -> bool {
        if !self.options.concurrent_kickoff_enabled {
            return false;
        }
        // The init ranges no longer describe the heap. Wait for the rebuild.
        if self.rebuild_init_work.load(Ordering::SeqCst) {
            return false;
        }

        let free = self.vm.heap().approximate_free_memory();
        if free == 0 {
            return false;
        }
        let threshold = self.state.kickoff_threshold();
        if free >= threshold && !self.is_kickoff_forced() {
            return false;
        }

        // Mark bits are about to be cleared, so the sweep must not need them any more.
        self.sweep.complete_sweeping_concurrently(&self.vm, &self.marks);

        if self.switch_mode(ExecutionMode::Off, ExecutionMode::InitRunning) {
            self.state.remaining_free.store(free, Ordering::SeqCst);
            let _ = self.state.kickoff_reason.compare_exchange(
                KickoffReason::NoKickoff,
                KickoffReason::ThresholdReached,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            let stats = self.state.snapshot();
            info!(
                "Concurrent kickoff ({}): {} bytes free, threshold {}, {} bytes to trace",
                stats.kickoff_reason, free, threshold, stats.trace_size_target
            );
            probe!(gencon, concurrent_kickoff, free, threshold);
            self.vm.hooks().on_kickoff(&stats);
        }
        true
    }

    fn concurrent_mark(&self, request: &AllocationRequest) {
        let collection = self.vm.collection();
        loop {
            if collection.is_exclusive_access_requested() {
                return;
            }
            match self.state.mode() {
                ExecutionMode::Off | ExecutionMode::FinalCollection => return,
                ExecutionMode::InitRunning => {
                    let to_do = self.tax.init_size_for(request.tax_size);
                    if self.do_concurrent_initialization(to_do) >= to_do / 2 {
                        return;
                    }
                }
                ExecutionMode::InitComplete => {
                    if request.at_safepoint {
                        self.signal_threads_to_dirty_cards();
                    } else {
                        collection.request_barrier_callback();
                        return;
                    }
                }
                ExecutionMode::RootTracing(phase) => {
                    if !self.trace_roots(phase) {
                        return;
                    }
                }
                ExecutionMode::TraceOnly | ExecutionMode::CleanTrace => {
                    self.do_concurrent_trace(request);
                    return;
                }
                ExecutionMode::Exhausted => {
                    if request.at_safepoint {
                        self.final_collection();
                    }
                    return;
                }
            }
        }
    }

    /// Initialize up to `to_do` bytes of metadata. Returns the bytes initialized.
    ///
    /// A thread that finds every range claimed while others are still initializing waits
    /// until they are done, unless it has already paid half of its tax.
    fn do_concurrent_initialization(&self, to_do: usize) -> usize {
        {
            let mut sync = self.init_sync.lock().unwrap();
            if self.state.mode() != ExecutionMode::InitRunning {
                return to_do;
            }
            if !sync.setup_done {
                self.packets.reset();
                sync.setup_done = true;
            }
            sync.initializers += 1;
        }

        let scanning = self.vm.scanning();
        let collection = self.vm.collection();
        let mut done = 0;
        while done < to_do {
            if collection.is_exclusive_access_requested() {
                break;
            }
            match self.init.claim_next_range() {
                Some(range) => {
                    range.process(&self.marks, |base, top| scanning.clear_cards(base, top));
                    done += range.work;
                }
                None => break,
            }
        }

        let mut sync = self.init_sync.lock().unwrap();
        sync.initializers -= 1;
        if self.init.all_ranges_claimed() {
            if sync.initializers == 0 {
                self.finish_initialization(&mut sync);
            } else if done < to_do / 2 {
                let epoch = sync.epoch;
                while sync.epoch == epoch {
                    sync = self.init_complete.wait(sync).unwrap();
                }
            }
        } else if sync.initializers == 0 {
            // We stopped for exclusive access. Nobody is left to finish, so release the waiters
            // to let them reach their safepoints.
            sync.epoch += 1;
            self.init_complete.notify_all();
        }
        done
    }

    fn finish_initialization(&self, sync: &mut MutexGuard<InitSync>) {
        if self.switch_mode(ExecutionMode::InitRunning, ExecutionMode::InitComplete) {
            debug!(
                "Concurrent initialization complete: {} bytes",
                self.state.init_work_required()
            );
        }
        sync.epoch += 1;
        self.init_complete.notify_all();
    }

    /// Forget the initializers of the last cycle. Called with exclusive access held.
    pub(crate) fn reset_init_monitor(&self) {
        let mut sync = self.init_sync.lock().unwrap();
        debug_assert_eq!(sync.initializers, 0);
        sync.setup_done = false;
    }

    fn root_tracing_phases(&self) -> u8 {
        u8::min(
            self.vm.scanning().root_tracing_phases(),
            MAX_ROOT_TRACING_PHASES,
        )
    }

    fn next_tracing_mode(&self, phase: u8) -> ExecutionMode {
        if phase < self.root_tracing_phases() {
            ExecutionMode::RootTracing(phase + 1)
        } else {
            ExecutionMode::TraceOnly
        }
    }

    /// Run root-tracing phase `phase` if this thread wins it. Returns true if the caller should
    /// go on paying its tax in the new mode.
    fn trace_roots(&self, phase: u8) -> bool {
        let next = self.next_tracing_mode(phase);
        if !self.switch_mode(ExecutionMode::RootTracing(phase), next) {
            return true;
        }

        if phase == 0 {
            self.vm.collection().signal_threads_to_trace_stacks();
            if next == ExecutionMode::TraceOnly {
                self.state.root_tracing_complete.store(true, Ordering::SeqCst);
            }
            return true;
        }

        let mut tracer = self.tracer();
        let found = self
            .vm
            .scanning()
            .scan_roots(phase, &mut |root| tracer.mark_and_push(root));
        tracer.flush();
        drop(tracer);
        if found {
            self.helpers.resume();
        }
        if next == ExecutionMode::TraceOnly {
            self.state.root_tracing_complete.store(true, Ordering::SeqCst);
        }
        trace!("Root tracing phase {} done, roots found: {}", phase, found);
        false
    }

    /// Report the stack roots of the calling thread. Returns false if no cycle is tracing, in
    /// which case the roots are scanned by the final collection.
    pub fn trace_thread_roots(&self, roots: impl IntoIterator<Item = ObjectReference>) -> bool {
        let mode = self.state.mode();
        if mode < ExecutionMode::RootTracing(0) || mode >= ExecutionMode::Exhausted {
            return false;
        }
        let mut tracer = self.tracer();
        for root in roots {
            tracer.mark_and_push(root);
        }
        tracer.flush();
        drop(tracer);
        self.state.threads_scanned.fetch_add(1, Ordering::SeqCst);
        self.helpers.resume();
        true
    }

    fn do_concurrent_trace(&self, request: &AllocationRequest) {
        let free = self.vm.heap().approximate_free_memory();
        if self.tax.periodical_tuning_needed(free) {
            self.tax
                .periodical_tuning(free, &self.state, self.helpers.started() > 0);
        }
        if self.state.mode() == ExecutionMode::TraceOnly
            && free < self.state.card_cleaning_threshold()
        {
            self.kickoff_card_cleaning(CardCleaningReason::ThresholdReached);
        }

        let size =
            self.tax
                .trace_size_for(request.tax_size, free, &self.state, self.is_kickoff_forced());
        if size == 0 {
            return;
        }

        let collection = self.vm.collection();
        let mut tracer = self.tracer();
        let mut traced = 0;
        while traced < size {
            let previously = traced;
            let marked = self.local_mark(&mut tracer, size - traced, true);
            if marked > 0 {
                self.state
                    .trace_size_count
                    .fetch_add(marked, Ordering::SeqCst);
                traced += marked;
            }
            if traced >= size || collection.is_exclusive_access_requested() {
                break;
            }

            match self.state.mode() {
                ExecutionMode::TraceOnly => {
                    if self.packets.tracing_exhausted() && self.state.is_root_tracing_complete() {
                        self.kickoff_card_cleaning(CardCleaningReason::TracingCompleted);
                        continue;
                    }
                }
                ExecutionMode::CleanTrace => {
                    if !self.state.is_card_cleaning_complete() {
                        let cleaned = self.clean_cards(&mut tracer, size - traced);
                        self.state
                            .card_clean_count
                            .fetch_add(cleaned, Ordering::SeqCst);
                        traced += cleaned;
                    } else if self.packets.tracing_exhausted() {
                        break;
                    }
                }
                _ => break,
            }

            if traced == previously {
                break;
            }
        }
        tracer.flush();
        drop(tracer);

        let mode = self.state.mode();
        if mode == ExecutionMode::CleanTrace
            && self.state.is_card_cleaning_complete()
            && self.state.is_root_tracing_complete()
            && self.packets.tracing_exhausted()
            && self.switch_mode(ExecutionMode::CleanTrace, ExecutionMode::Exhausted)
        {
            let stats = self.state.snapshot();
            info!(
                "Concurrent tracing exhausted: {} bytes traced, {} bytes cleaned",
                stats.trace_size_count + stats.helper_trace_size_count,
                stats.card_clean_count + stats.helper_card_clean_count
            );
            return;
        }
        if !self.packets.is_empty()
            || (mode == ExecutionMode::CleanTrace && !self.state.is_card_cleaning_complete())
        {
            self.helpers.resume();
        }
    }

    /// Pop and scan objects until `budget` bytes are scanned or no work is left. With
    /// `check_exclusive`, also stops as soon as exclusive access is requested.
    pub(crate) fn local_mark(&self, tracer: &mut Tracer, budget: usize, check_exclusive: bool) -> usize {
        let scanning = self.vm.scanning();
        let collection = self.vm.collection();
        let mut traced = 0;
        while traced < budget {
            if check_exclusive && collection.is_exclusive_access_requested() {
                self.helpers
                    .switch_request(HelperRequest::Mark, HelperRequest::Wait);
                break;
            }
            let Some(object) = tracer.pop() else {
                break;
            };
            traced += scanning.scan_object(object, &mut |child| tracer.mark_and_push(child));
        }
        tracer.flush();
        traced
    }

    /// Clean up to `budget` bytes of dirty cards. Returns the bytes cleaned.
    pub(crate) fn clean_cards(&self, tracer: &mut Tracer, budget: usize) -> usize {
        let progress = self
            .vm
            .scanning()
            .clean_cards(budget, &mut |object| tracer.mark_and_push(object));
        if progress.complete {
            self.state
                .card_cleaning_complete
                .store(true, Ordering::SeqCst);
        }
        progress.bytes_cleaned
    }

    fn kickoff_card_cleaning(&self, reason: CardCleaningReason) -> bool {
        if !self.switch_mode(ExecutionMode::TraceOnly, ExecutionMode::CleanTrace) {
            return false;
        }
        self.state
            .card_cleaning_reason
            .store(reason, Ordering::SeqCst);
        debug!("Card cleaning started: {}", reason);
        self.helpers.resume();
        true
    }

    /// Finish an exhausted cycle with a stop-the-world collection. Only the thread that wins
    /// `Exhausted -> FinalCollection` collects.
    fn final_collection(&self) {
        if !self.switch_mode(ExecutionMode::Exhausted, ExecutionMode::FinalCollection) {
            return;
        }
        let collection = self.vm.collection();
        collection.acquire_exclusive_access();
        // Another thread may have collected while we waited.
        if self.state.mode() == ExecutionMode::FinalCollection {
            let stats = self.state.snapshot();
            self.vm.hooks().on_final_collection(&stats);
            info!(
                "Final collection of concurrent cycle: {} bytes traced concurrently",
                self.state.concurrent_work_done()
            );
            self.collect(CollectionReason::ConcurrentFinal);
        }
        collection.release_exclusive_access();
    }

    /// Run a stop-the-world collection. The caller must hold exclusive access.
    pub fn collect(&self, reason: CollectionReason) {
        self.collect_for(reason, None);
    }

    /// Collect, then sweep until an entry of `allocation.1` bytes is connected to pool
    /// `allocation.0`, if one is given.
    fn collect_for(&self, reason: CollectionReason, allocation: Option<(PoolId, usize)>) {
        debug!("Stop-the-world collection: {}", reason);
        let usable = self.pre_collect();
        self.stop_the_world_mark(usable);
        self.vm.collection().collect_garbage(reason);
        self.post_collect(reason == CollectionReason::Explicit, allocation);
    }

    /// Bring a concurrent cycle to a state the stop-the-world phase can finish. Returns false
    /// if there was no cycle or it had to be aborted.
    fn pre_collect(&self) -> bool {
        self.sweep
            .complete_sweep(&self.vm, &self.marks, SweepCompletionReason::AboutToCollect);
        self.collection_in_progress.store(true, Ordering::SeqCst);

        let mode = self.state.mode();
        self.state.set_mode_at_gc(mode);
        self.helpers.quiesce();

        if mode == ExecutionMode::Off {
            return false;
        }
        if self.remembered_set_overflow.load(Ordering::SeqCst) {
            self.abort(AbortReason::RememberedSetOverflow);
            return false;
        }
        if mode < ExecutionMode::TraceOnly {
            self.abort(AbortReason::InsufficientProgress);
            return false;
        }

        let switched = self.switch_mode(mode, ExecutionMode::Off);
        debug_assert!(switched, "mode changed under exclusive access");

        if mode < ExecutionMode::FinalCollection && !self.packets.tracing_exhausted() {
            self.complete_tracing();
        }

        self.final_clean_cards();

        // Mark bits of regions the cycle did not trace were set. Clear them for the full mark.
        if self.rebuild_init_work.load(Ordering::SeqCst) {
            self.rebuild_init_ranges();
        }
        self.init.reset_for_stop_the_world();
        while let Some(range) = self.init.claim_next_range() {
            self.marks.clear_range(range.base, range.top);
        }
        true
    }

    /// Drain whatever concurrent tracing left behind.
    fn complete_tracing(&self) {
        let mut tracer = Tracer::unbounded(&self.packets, &self.marks, &self.state);
        let traced = self.local_mark(&mut tracer, usize::MAX, false);
        self.state
            .completed_tracing_count
            .fetch_add(traced, Ordering::SeqCst);
        trace!("Completed tracing: {} bytes", traced);
    }

    /// Clean the remaining dirty cards and trace from them, repeating once more if the work
    /// stack overflowed during the cycle.
    fn final_clean_cards(&self) {
        let scanning = self.vm.scanning();
        let mut tracer = Tracer::unbounded(&self.packets, &self.marks, &self.state);
        loop {
            let cleaned = scanning.final_clean_cards(&mut |object| tracer.mark_and_push(object));
            self.state
                .final_card_clean_count
                .fetch_add(cleaned, Ordering::SeqCst);
            let traced = self.local_mark(&mut tracer, usize::MAX, false);
            self.state
                .final_trace_count
                .fetch_add(traced, Ordering::SeqCst);

            if !self.packets.take_overflow() {
                break;
            }
            debug!("Work stack overflowed. Rescanning marked objects.");
            self.rescan_marked_objects(&mut tracer);
        }
    }

    /// Scan every marked object of the collectible regions again. References dropped by an
    /// overflowing push belong to marked objects, so this finds them.
    fn rescan_marked_objects(&self, tracer: &mut Tracer) {
        let scanning = self.vm.scanning();
        let mut rescanned = 0;
        for region in self.collectible_regions() {
            for object in self.marks.iter_marked(region.base, region.top) {
                rescanned += scanning.scan_object(object, &mut |child| tracer.mark_and_push(child));
            }
            rescanned += self.local_mark(tracer, usize::MAX, false);
        }
        self.state
            .final_trace_count
            .fetch_add(rescanned, Ordering::SeqCst);
    }

    /// Mark from the roots with the world stopped. If the concurrent cycle is not usable, the
    /// mark bits are reset first and everything is traced here.
    fn stop_the_world_mark(&self, usable: bool) {
        if !usable {
            self.packets.reset();
            if self.rebuild_init_work.load(Ordering::SeqCst) {
                self.rebuild_init_ranges();
            }
            self.init.reset_for_kickoff();
            while let Some(range) = self.init.claim_next_range() {
                if range.init_type == InitType::MarkBits {
                    self.marks.clear_range(range.base, range.top);
                }
            }
            self.init.reset_for_kickoff();
        }

        let scanning = self.vm.scanning();
        let mut tracer = Tracer::unbounded(&self.packets, &self.marks, &self.state);
        scanning.scan_thread_roots(&mut |root| tracer.mark_and_push(root));
        for phase in 1..=self.root_tracing_phases() {
            scanning.scan_roots(phase, &mut |root| tracer.mark_and_push(root));
        }
        let traced = self.local_mark(&mut tracer, usize::MAX, false);
        self.state
            .final_trace_count
            .fetch_add(traced, Ordering::SeqCst);
        debug_assert!(self.packets.tracing_exhausted());
    }

    fn post_collect(&self, explicit: bool, allocation: Option<(PoolId, usize)>) {
        let mode_at_gc = self.state.mode_at_gc();
        let heap_size = self.vm.heap().active_memory_size();

        if mode_at_gc >= ExecutionMode::TraceOnly {
            self.tax
                .update_tuning_statistics(heap_size, self.live_bytes(), &self.state);
            self.state.completed_cycles.fetch_add(1, Ordering::SeqCst);
        }
        self.packets.take_overflow();
        self.remembered_set_overflow.store(false, Ordering::SeqCst);

        let rebuilt =
            self.rebuild_init_work.load(Ordering::SeqCst) && self.rebuild_init_ranges();
        if !rebuilt {
            self.init.reset_for_kickoff();
        }

        let retune = self.retune_after_heap_resize.swap(false, Ordering::SeqCst);
        if retune || mode_at_gc > ExecutionMode::Off {
            self.tax.tune_to_heap(
                heap_size,
                self.state.init_work_required(),
                &self.state,
                retune,
                explicit,
            );
            debug!(
                "Tuned to {} byte heap: kickoff at {} free, {} bytes to trace",
                heap_size,
                self.state.kickoff_threshold(),
                self.state.trace_size_target()
            );
        }

        self.reset_init_monitor();
        self.forced_kickoff.store(false, Ordering::SeqCst);
        self.state
            .kickoff_reason
            .store(KickoffReason::NoKickoff, Ordering::SeqCst);
        self.deactivate_write_barrier();
        self.collection_in_progress.store(false, Ordering::SeqCst);

        match allocation {
            Some((pool, bytes)) => {
                self.sweep
                    .sweep_for_minimum_size(&self.vm, &self.marks, Some(pool), bytes);
            }
            None => self.sweep.setup_for_sweep(&self.vm),
        }
        if !self.options.concurrent_sweep {
            self.sweep.complete_sweep(
                &self.vm,
                &self.marks,
                SweepCompletionReason::NoConcurrentSweep,
            );
        }
    }

    fn collectible_regions(&self) -> impl Iterator<Item = HeapRegion> {
        self.vm
            .heap()
            .regions()
            .into_iter()
            .filter(|r| r.concurrent_collectible)
    }

    /// Bytes of marked objects in the collectible regions.
    fn live_bytes(&self) -> usize {
        let model = self.vm.object_model();
        self.collectible_regions()
            .map(|region| {
                self.marks
                    .iter_marked(region.base, region.top)
                    .map(|object| model.object_size(object))
                    .sum::<usize>()
            })
            .sum()
    }

    /// Rebuild the init ranges from the current heap regions. On failure the old table is
    /// kept and the rebuild stays pending.
    fn rebuild_init_ranges(&self) -> bool {
        match self.init.build_init_ranges(&self.vm.heap().regions()) {
            Ok(work) => {
                self.state.init_work_required.store(work, Ordering::SeqCst);
                self.rebuild_init_work.store(false, Ordering::SeqCst);
                true
            }
            Err(e) => {
                error!("Cannot rebuild the init ranges: {}. Kickoff is suspended.", e);
                false
            }
        }
    }

    /// The binding committed `region`. Called with exclusive access held.
    pub fn heap_add_range(&self, region: &HeapRegion) {
        self.rebuild_init_work.store(true, Ordering::SeqCst);
        if region.concurrent_collectible {
            self.retune_after_heap_resize.store(true, Ordering::SeqCst);
        }
        // Initialization may already have passed this part of the heap.
        if self.state.mode() > ExecutionMode::Off {
            if region.concurrent_collectible {
                self.marks.clear_range(region.base, region.top);
                self.vm.scanning().clear_cards(region.base, region.top);
            } else {
                self.marks.set_range(region.base, region.top);
            }
        }
        self.sweep.mark_heap_changed();
        debug!("Heap range added: {}..{} ({} bytes)", region.base, region.top, region.size());
    }

    /// The binding is about to decommit `region`. Called with exclusive access held.
    pub fn heap_remove_range(&self, region: &HeapRegion) {
        self.rebuild_init_work.store(true, Ordering::SeqCst);
        if region.concurrent_collectible {
            self.retune_after_heap_resize.store(true, Ordering::SeqCst);
        }
        self.sweep.mark_heap_changed();
        debug!(
            "Heap range removed: {}..{} ({} bytes)",
            region.base,
            region.top,
            region.size()
        );
    }

    /// The binding finished adding or removing ranges. Outside a collection, rebuild the init
    /// ranges now and retune. A collection does this itself in `post_collect`.
    pub fn heap_reconfigured(&self) {
        if self.collection_in_progress.load(Ordering::SeqCst)
            || !self.rebuild_init_work.load(Ordering::SeqCst)
        {
            return;
        }
        if !self.rebuild_init_ranges() {
            return;
        }
        let heap_size = self.vm.heap().active_memory_size();
        if self.state.mode() < ExecutionMode::InitComplete {
            let retune = self.retune_after_heap_resize.swap(false, Ordering::SeqCst);
            self.tax.tune_to_heap(
                heap_size,
                self.state.init_work_required(),
                &self.state,
                retune,
                false,
            );
        } else {
            self.tax.adjust_trace_target(heap_size, &self.state);
        }
    }

    /// Pay the tax, then allocate. If the pool is empty, connect more swept memory, and as a
    /// last resort collect.
    pub fn allocate(&self, request: &AllocationRequest) -> Result<Address, AllocationError> {
        self.pay_allocation_tax(request);

        let pool = self.vm.heap().pool(request.pool);
        if let Some(address) = pool.allocate(request.bytes) {
            return Ok(address);
        }
        if self
            .sweep
            .replenish_pool_for_allocate(&self.vm, &self.marks, request.pool, request.bytes)
        {
            if let Some(address) = pool.allocate(request.bytes) {
                return Ok(address);
            }
        }

        let collection = self.vm.collection();
        collection.acquire_exclusive_access();
        let result = pool.allocate(request.bytes).or_else(|| {
            self.collect_for(
                CollectionReason::AllocationFailure,
                Some((request.pool, request.bytes)),
            );
            pool.allocate(request.bytes).or_else(|| {
                self.sweep
                    .replenish_pool_for_allocate(&self.vm, &self.marks, request.pool, request.bytes)
                    .then(|| pool.allocate(request.bytes))
                    .flatten()
            })
        });
        collection.release_exclusive_access();

        result.ok_or_else(|| {
            warn!(
                "Out of memory: {} bytes from pool {} after a collection",
                request.bytes, request.pool
            );
            collection.out_of_memory(request.bytes);
            AllocationError::OutOfMemory {
                bytes: request.bytes,
            }
        })
    }
}
