use crate::concurrent::helpers::HelperThreadContext;
use crate::vm::VMBinding;

/// Why a stop-the-world collection runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum CollectionReason {
    /// A concurrent cycle finished tracing and needs the final stop-the-world phase.
    ConcurrentFinal,
    /// An allocation could not be satisfied even after replenishing the pool.
    AllocationFailure,
    /// The runtime asked for a collection.
    Explicit,
}

/// Thread and synchronization services of the runtime.
pub trait Collection<VM: VMBinding>: Send + Sync {
    /// Is some thread waiting for, or holding, exclusive access? Tracing loops poll this and
    /// return early when it is set.
    fn is_exclusive_access_requested(&self) -> bool;

    /// Stop every mutator at a safepoint. Blocks until granted.
    fn acquire_exclusive_access(&self);

    fn release_exclusive_access(&self);

    /// Make every mutator start recording reference writes. Called with exclusive access held.
    fn activate_write_barrier(&self);

    /// Called with exclusive access held, after a collection.
    fn deactivate_write_barrier(&self);

    /// Ask every mutator to report its stack roots at its next safepoint, through
    /// [`crate::memory_manager::trace_thread_roots`].
    fn signal_threads_to_trace_stacks(&self) {}

    /// A thread that could not activate the write barrier asks to be called back at its next
    /// safepoint. The runtime then calls [`crate::memory_manager::barrier_callback`].
    fn request_barrier_callback(&self) {}

    fn cancel_barrier_callbacks(&self) {}

    /// Runtime-specific work of a stop-the-world collection. Called after marking completed
    /// and before the sweep is set up, with exclusive access held.
    fn collect_garbage(&self, _reason: CollectionReason) {}

    /// Start a concurrent helper thread. The new thread must call `ctx.run()`.
    /// The default implementation uses a plain Rust thread.
    fn spawn_helper_thread(&self, ctx: HelperThreadContext<VM>) -> std::io::Result<()> {
        std::thread::Builder::new()
            .name(format!("gencon-helper-{}", ctx.ordinal()))
            .spawn(move || ctx.run())
            .map(|_| ())
    }

    /// Called when an allocation of `size` bytes fails after a collection, just before
    /// [`crate::memory_manager::allocate`] returns an error.
    fn out_of_memory(&self, _size: usize) {}
}
