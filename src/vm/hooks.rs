use crate::concurrent::mode::ExecutionMode;
use crate::concurrent::AbortReason;
use crate::global_state::CollectorStats;
use crate::sweep::SweepCompletionReason;

/// Observability call-outs. Every method is fire-and-forget and runs on the thread that caused
/// the event, possibly while holding collector locks: implementations must not call back into
/// the collector.
pub trait EventHooks: Send + Sync {
    fn on_kickoff(&self, _stats: &CollectorStats) {}

    fn on_mode_switch(&self, _from: ExecutionMode, _to: ExecutionMode) {}

    fn on_abort(&self, _reason: AbortReason, _stats: &CollectorStats) {}

    fn on_helper_activated(&self, _ordinal: usize) {}

    /// `traced` is the number of bytes the helper traced while it was active.
    fn on_helper_deactivated(&self, _ordinal: usize, _traced: usize) {}

    fn on_final_collection(&self, _stats: &CollectorStats) {}

    fn on_sweep_completed(&self, _reason: SweepCompletionReason) {}
}
