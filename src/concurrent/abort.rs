//! Unwinding a concurrent cycle back to `Off`.

use super::{ConcurrentGC, ExecutionMode};
use crate::vm::{EventHooks, VMBinding};
use std::sync::atomic::Ordering;

/// Why a concurrent cycle was abandoned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum AbortReason {
    /// A collection was needed before tracing started.
    InsufficientProgress,
    /// The runtime's remembered set overflowed.
    RememberedSetOverflow,
    /// The runtime asked for the cycle to be abandoned.
    Requested,
}

impl<VM: VMBinding> ConcurrentGC<VM> {
    /// Abandon the current cycle. All marking done so far is dropped, and the next cycle starts
    /// from scratch. Does nothing if no cycle is active.
    ///
    /// The caller must hold exclusive access, so no mutator is tracing. Helpers are parked
    /// before the work packets are emptied.
    pub fn abort(&self, reason: AbortReason) {
        let mode = self.state.mode();
        if mode == ExecutionMode::Off {
            debug_assert!(self.packets.is_empty());
            return;
        }

        let stats = self.state.snapshot();
        info!("Concurrent cycle aborted in {}: {}", mode, reason);
        probe!(gencon, concurrent_abort, stats.trace_size_count, stats.helper_trace_size_count);
        self.vm.hooks().on_abort(reason, &stats);

        self.helpers.quiesce();
        self.packets.reset();

        // Exclusive access is held, but a mutator that checked the mode just before may still be
        // racing us on a forward transition. Retry until `Off` sticks.
        loop {
            let current = self.state.mode();
            if current == ExecutionMode::Off || self.switch_mode(current, ExecutionMode::Off) {
                break;
            }
        }

        self.init.reset_for_kickoff();
        self.reset_init_monitor();
        self.remembered_set_overflow.store(false, Ordering::SeqCst);
        self.forced_kickoff.store(false, Ordering::SeqCst);
        self.state.root_tracing_complete.store(false, Ordering::SeqCst);
        self.state.card_cleaning_complete.store(false, Ordering::SeqCst);
        self.deactivate_write_barrier();
        self.state.aborted_cycles.fetch_add(1, Ordering::SeqCst);

        debug_assert_eq!(self.state.mode(), ExecutionMode::Off);
        debug_assert!(self.packets.is_empty());
    }
}
