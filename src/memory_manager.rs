//! Runtime-to-collector interface.
//!
//! This module is the API a runtime uses to drive the concurrent collector. We expect a binding
//! to call these functions from its allocation slow path, its safepoint handling and its heap
//! management code, and to wrap them for native callers if necessary.
//!
//! A collector is created once with [`gencon_init`] and shared by every mutator thread, usually
//! through an `Arc` or a `static`.

use crate::concurrent::{
    AbortReason, AllocationError, AllocationRequest, ConcurrentGC, HelperStartError, InitError,
};
use crate::global_state::CollectorStats;
use crate::sweep::{SweepCompletionReason, SweepStats};
use crate::util::options::Options;
use crate::util::{Address, ObjectReference};
use crate::vm::{CollectionReason, HeapRegion, VMBinding};
use std::sync::Arc;

/// Create a collector for the runtime `vm`.
///
/// This attempts to initialize a logger first. If the runtime would like to use its own logger,
/// it should install it before calling this function.
///
/// Arguments:
/// * `vm`: The binding of the runtime. Its heap must already be reserved and its initial
///   regions committed.
/// * `options`: The collector options, usually `Options::default()`, which reads `GENCON_*`
///   environment variables.
pub fn gencon_init<VM: VMBinding>(vm: VM, options: Options) -> Result<Arc<ConcurrentGC<VM>>, InitError> {
    match crate::util::logger::try_init() {
        Ok(_) => debug!("gencon initialized the logger."),
        Err(_) => debug!(
            "gencon failed to initialize the logger. Possibly a logger has been initialized by user."
        ),
    }
    ConcurrentGC::new(vm, options).map(Arc::new)
}

/// Start the concurrent helper threads through [`crate::vm::Collection::spawn_helper_thread`].
/// A binding should call this once its thread system is ready. If no helper can be started,
/// mutators do all the concurrent work and an error is returned for the binding to report.
pub fn start_helpers<VM: VMBinding>(gc: &Arc<ConcurrentGC<VM>>) -> Result<usize, HelperStartError> {
    gc.start_helpers()
}

/// Ask every helper thread to exit. Helpers finish the work they hold first.
pub fn shutdown_helpers<VM: VMBinding>(gc: &ConcurrentGC<VM>) {
    gc.shutdown_helpers()
}

/// Pay the allocation tax of `request` without allocating. Bindings with thread-local
/// allocation buffers call this when a buffer is refilled.
///
/// Arguments:
/// * `gc`: The collector.
/// * `request`: The allocation being paid for.
pub fn pay_allocation_tax<VM: VMBinding>(gc: &ConcurrentGC<VM>, request: &AllocationRequest) {
    gc.pay_allocation_tax(request)
}

/// Pay the allocation tax, then allocate `request.bytes` from the pool. If the pool is empty,
/// swept memory is connected to it, and as a last resort a stop-the-world collection runs.
/// Must be called at a safepoint, because it may block for exclusive access.
///
/// Arguments:
/// * `gc`: The collector.
/// * `request`: The allocation.
pub fn allocate<VM: VMBinding>(
    gc: &ConcurrentGC<VM>,
    request: &AllocationRequest,
) -> Result<Address, AllocationError> {
    gc.allocate(request)
}

/// Run a stop-the-world collection. The caller must hold exclusive access.
pub fn collect<VM: VMBinding>(gc: &ConcurrentGC<VM>, reason: CollectionReason) {
    gc.collect(reason)
}

/// Start a concurrent cycle at the next allocation, regardless of free memory. Returns false if
/// concurrent cycles are disabled.
pub fn force_kickoff<VM: VMBinding>(gc: &ConcurrentGC<VM>) -> bool {
    gc.force_kickoff()
}

/// Abandon the current concurrent cycle. The caller must hold exclusive access.
pub fn abort<VM: VMBinding>(gc: &ConcurrentGC<VM>, reason: AbortReason) {
    gc.abort(reason)
}

/// Tell the collector that the runtime's remembered set overflowed. The current cycle is
/// aborted by the next collection.
pub fn remembered_set_overflow<VM: VMBinding>(gc: &ConcurrentGC<VM>) {
    gc.remembered_set_overflow()
}

/// Report the stack roots of the calling thread, after the collector asked for them with
/// [`crate::vm::Collection::signal_threads_to_trace_stacks`]. Returns false if no cycle is
/// tracing. The roots are then scanned by the next collection instead.
pub fn trace_thread_roots<VM: VMBinding>(
    gc: &ConcurrentGC<VM>,
    roots: impl IntoIterator<Item = ObjectReference>,
) -> bool {
    gc.trace_thread_roots(roots)
}

/// Called at the safepoint of a thread that asked for a barrier callback with
/// [`crate::vm::Collection::request_barrier_callback`].
pub fn barrier_callback<VM: VMBinding>(gc: &ConcurrentGC<VM>) {
    gc.barrier_callback()
}

/// The runtime committed a range of the heap. Must be called with exclusive access held, after
/// the region is visible through [`crate::vm::Heap::regions`]. Call
/// [`heap_reconfigured`] after the last range of a batch.
pub fn heap_add_range<VM: VMBinding>(gc: &ConcurrentGC<VM>, region: &HeapRegion) {
    gc.heap_add_range(region)
}

/// The runtime is about to decommit a range of the heap. Must be called with exclusive access
/// held.
pub fn heap_remove_range<VM: VMBinding>(gc: &ConcurrentGC<VM>, region: &HeapRegion) {
    gc.heap_remove_range(region)
}

/// The runtime finished adding or removing heap ranges.
pub fn heap_reconfigured<VM: VMBinding>(gc: &ConcurrentGC<VM>) {
    gc.heap_reconfigured()
}

/// Sweep and connect everything that is left of the current sweep. The caller must hold
/// exclusive access.
pub fn complete_sweep<VM: VMBinding>(gc: &ConcurrentGC<VM>) {
    gc.sweep
        .complete_sweep(&gc.vm, &gc.marks, SweepCompletionReason::Requested)
}

pub fn collector_stats<VM: VMBinding>(gc: &ConcurrentGC<VM>) -> CollectorStats {
    gc.stats()
}

pub fn sweep_stats<VM: VMBinding>(gc: &ConcurrentGC<VM>) -> SweepStats {
    gc.sweep.stats()
}
