//! The concurrent marking scheduler.
//!
//! Mutators pay for their allocations by initializing mark bits, tracing and cleaning cards.
//! The amount is set by the allocation tax so that tracing completes just before the heap fills
//! up, at which point a short stop-the-world collection finishes the cycle.

pub(crate) mod abort;
pub(crate) mod barrier;
pub(crate) mod controller;
pub(crate) mod helpers;
pub(crate) mod init;
pub mod mode;
pub(crate) mod tax;
pub(crate) mod tracing;

pub use self::abort::AbortReason;
pub use self::controller::{AllocationError, AllocationRequest};
pub use self::helpers::{HelperRequest, HelperStartError, HelperThreadContext};
pub use self::mode::ExecutionMode;

use self::barrier::WriteBarrierActivator;
use self::helpers::HelperPool;
use self::init::InitScheduler;
use self::tax::AllocationTax;
use self::tracing::{Tracer, WorkPackets};
use crate::global_state::{CollectorState, CollectorStats};
use crate::sweep::ConcurrentSweepScheme;
use crate::util::mark_bitmap::MarkBitmap;
use crate::util::options::Options;
use crate::vm::{EventHooks, Heap, VMBinding};
use std::collections::TryReserveError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// The collector could not be created.
#[derive(Debug)]
pub enum InitError {
    /// The table of init ranges could not be allocated.
    InitRanges(TryReserveError),
    /// The table of sweep chunks could not be allocated.
    SweepChunks(TryReserveError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InitError::InitRanges(e) => write!(f, "cannot allocate the init range table: {}", e),
            InitError::SweepChunks(e) => write!(f, "cannot allocate the sweep chunk table: {}", e),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::InitRanges(e) | InitError::SweepChunks(e) => Some(e),
        }
    }
}

/// The monitor of concurrent initialization.
struct InitSync {
    /// Threads currently initializing ranges.
    initializers: usize,
    /// Has the first initializer of this cycle reset the work packets?
    setup_done: bool,
    /// Bumped every time waiting initializers are released.
    epoch: usize,
}

/// A concurrent mark-and-sweep collector for one runtime instance.
///
/// Every mutator, helper thread and the thread running stop-the-world collections shares one
/// instance by reference. All state that is changed concurrently is atomic or behind a lock.
pub struct ConcurrentGC<VM: VMBinding> {
    pub(crate) vm: VM,
    pub(crate) options: Options,
    pub(crate) state: CollectorState,
    pub(crate) tax: AllocationTax,
    pub(crate) init: InitScheduler,
    init_sync: Mutex<InitSync>,
    init_complete: Condvar,
    pub(crate) packets: WorkPackets,
    pub(crate) marks: MarkBitmap,
    pub(crate) helpers: HelperPool,
    pub(crate) barrier: WriteBarrierActivator,
    pub(crate) sweep: ConcurrentSweepScheme,
    /// The runtime asked for a cycle to start at the next allocation.
    forced_kickoff: AtomicBool,
    /// The heap changed shape since the init ranges were built.
    rebuild_init_work: AtomicBool,
    /// A collectible range was added or removed. Retune from the heap size after the next
    /// collection.
    retune_after_heap_resize: AtomicBool,
    /// The runtime's remembered set overflowed. The cycle is aborted at the next collection.
    remembered_set_overflow: AtomicBool,
    /// Set between `pre_collect` and `post_collect`.
    collection_in_progress: AtomicBool,
}

impl<VM: VMBinding> ConcurrentGC<VM> {
    pub fn new(vm: VM, options: Options) -> Result<Self, InitError> {
        info!("{}", *crate::build_info::GENCON_BUILD_DESCRIPTION);
        #[cfg(feature = "extreme_assertions")]
        warn!("The feature 'extreme_assertions' is enabled. Sweeping runs expensive checks.");
        let (start, end) = vm.heap().heap_bounds();
        let regions = vm.heap().regions();

        let gc = ConcurrentGC {
            state: CollectorState::new(),
            tax: AllocationTax::new(&options),
            init: InitScheduler::new(options.init_chunk_size),
            init_sync: Mutex::new(InitSync {
                initializers: 0,
                setup_done: false,
                epoch: 0,
            }),
            init_complete: Condvar::new(),
            packets: WorkPackets::new(options.work_packet_capacity),
            marks: MarkBitmap::new(start, end),
            helpers: HelperPool::new(),
            barrier: WriteBarrierActivator::new(),
            sweep: ConcurrentSweepScheme::new(&options),
            forced_kickoff: AtomicBool::new(false),
            rebuild_init_work: AtomicBool::new(false),
            retune_after_heap_resize: AtomicBool::new(false),
            remembered_set_overflow: AtomicBool::new(false),
            collection_in_progress: AtomicBool::new(false),
            vm,
            options,
        };

        let init_work = gc
            .init
            .build_init_ranges(&regions)
            .map_err(InitError::InitRanges)?;
        gc.state
            .init_work_required
            .store(init_work, Ordering::SeqCst);
        gc.sweep
            .rebuild_chunks(gc.vm.heap())
            .map_err(InitError::SweepChunks)?;
        gc.tax.tune_to_heap(
            gc.vm.heap().active_memory_size(),
            init_work,
            &gc.state,
            false,
            false,
        );
        info!(
            "Concurrent collector for heap {}..{}: {} regions, kickoff at {} bytes free",
            start,
            end,
            regions.len(),
            gc.state.kickoff_threshold()
        );
        Ok(gc)
    }

    pub fn vm(&self) -> &VM {
        &self.vm
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn mode(&self) -> ExecutionMode {
        self.state.mode()
    }

    pub fn stats(&self) -> CollectorStats {
        self.state.snapshot()
    }

    /// Switch the execution mode and report the transition. Returns false if the mode was not
    /// `from`, i.e. another thread won the switch.
    pub(crate) fn switch_mode(&self, from: ExecutionMode, to: ExecutionMode) -> bool {
        if self.state.mode.try_switch(from, to) {
            debug!("Execution mode {} -> {}", from, to);
            self.vm.hooks().on_mode_switch(from, to);
            true
        } else {
            false
        }
    }

    pub(crate) fn tracer(&self) -> Tracer<'_> {
        Tracer::new(
            &self.packets,
            &self.marks,
            &self.state,
            self.options.local_buffer_size,
        )
    }

    /// Ask for a concurrent cycle to start at the next allocation, regardless of the free
    /// memory left. Returns false if kickoff is disabled.
    pub fn force_kickoff(&self) -> bool {
        if !self.options.concurrent_kickoff_enabled {
            return false;
        }
        self.state.kickoff_reason.store(
            crate::global_state::KickoffReason::Forced,
            Ordering::SeqCst,
        );
        self.forced_kickoff.store(true, Ordering::SeqCst);
        debug!("Concurrent kickoff forced");
        true
    }

    pub(crate) fn is_kickoff_forced(&self) -> bool {
        self.forced_kickoff.load(Ordering::SeqCst)
    }

    /// The runtime's remembered set overflowed. The current cycle cannot be finished and is
    /// aborted by the next collection.
    pub fn remembered_set_overflow(&self) {
        self.remembered_set_overflow.store(true, Ordering::SeqCst);
        warn!("Remembered set overflow. The concurrent cycle will be aborted.");
    }
}
