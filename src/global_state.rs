use crate::concurrent::mode::{ExecutionMode, ModeCell};
use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Why the current concurrent cycle started.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, strum_macros::Display)]
pub enum KickoffReason {
    NoKickoff,
    /// Free memory fell below the kickoff threshold.
    ThresholdReached,
    /// The runtime asked for a cycle.
    Forced,
}

/// Why card cleaning started.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, strum_macros::Display)]
pub enum CardCleaningReason {
    NotStarted,
    /// Free memory fell below the card-cleaning threshold.
    ThresholdReached,
    /// Tracing ran out of work with root tracing complete.
    TracingCompleted,
}

/// The state of one concurrent collector, shared by reference with every mutator paying tax
/// and every helper thread.
///
/// The thresholds are written while tuning (with exclusive access held) and read by any
/// thread. The counters are added to by tracing threads and reset when a cycle is tuned.
pub struct CollectorState {
    /// The current execution mode. Only changed through `try_switch`.
    pub(crate) mode: ModeCell,
    /// The mode observed when the last stop-the-world collection started.
    pub(crate) mode_at_gc: Mutex<ExecutionMode>,
    /// A cycle starts when the taxable free memory falls below this many bytes.
    pub(crate) kickoff_threshold: AtomicUsize,
    /// Card cleaning starts when the taxable free memory falls below this many bytes.
    pub(crate) card_cleaning_threshold: AtomicUsize,
    /// The taxable free memory seen by the thread that kicked off the current cycle.
    pub(crate) remaining_free: AtomicUsize,
    /// Bytes of tracing and card cleaning expected for the current cycle.
    pub(crate) trace_size_target: AtomicUsize,
    /// Bytes of mark bits and cards to initialize at kickoff.
    pub(crate) init_work_required: AtomicUsize,
    /// Bytes traced by mutators paying tax.
    pub(crate) trace_size_count: AtomicUsize,
    /// Bytes traced by helper threads.
    pub(crate) helper_trace_size_count: AtomicUsize,
    /// Bytes of dirty cards cleaned by mutators.
    pub(crate) card_clean_count: AtomicUsize,
    /// Bytes of dirty cards cleaned by helper threads.
    pub(crate) helper_card_clean_count: AtomicUsize,
    /// Bytes traced when the remaining work was drained at the start of a collection.
    pub(crate) completed_tracing_count: AtomicUsize,
    /// Bytes traced in the stop-the-world phase.
    pub(crate) final_trace_count: AtomicUsize,
    /// Bytes of cards cleaned in the stop-the-world phase.
    pub(crate) final_card_clean_count: AtomicUsize,
    /// How often a push to the full work-packet stack was dropped.
    pub(crate) work_stack_overflow_count: AtomicUsize,
    /// Mutator stacks reported since the cycle started.
    pub(crate) threads_scanned: AtomicUsize,
    pub(crate) kickoff_reason: Atomic<KickoffReason>,
    pub(crate) card_cleaning_reason: Atomic<CardCleaningReason>,
    /// Have all root-tracing phases been claimed and run?
    pub(crate) root_tracing_complete: AtomicBool,
    /// Has the binding reported that no dirty cards are left?
    pub(crate) card_cleaning_complete: AtomicBool,
    /// Concurrent cycles that reached the stop-the-world phase without being aborted.
    pub(crate) completed_cycles: AtomicUsize,
    pub(crate) aborted_cycles: AtomicUsize,
}

/// A copy of the collector state handed to event hooks and to the runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CollectorStats {
    pub mode: ExecutionMode,
    pub kickoff_threshold: usize,
    pub card_cleaning_threshold: usize,
    pub remaining_free: usize,
    pub trace_size_target: usize,
    pub init_work_required: usize,
    pub trace_size_count: usize,
    pub helper_trace_size_count: usize,
    pub card_clean_count: usize,
    pub helper_card_clean_count: usize,
    pub completed_tracing_count: usize,
    pub final_trace_count: usize,
    pub work_stack_overflow_count: usize,
    pub threads_scanned: usize,
    pub kickoff_reason: KickoffReason,
    pub card_cleaning_reason: CardCleaningReason,
    pub completed_cycles: usize,
    pub aborted_cycles: usize,
}

impl CollectorState {
    pub fn new() -> Self {
        Self {
            mode: ModeCell::new(),
            mode_at_gc: Mutex::new(ExecutionMode::Off),
            kickoff_threshold: AtomicUsize::new(0),
            card_cleaning_threshold: AtomicUsize::new(0),
            remaining_free: AtomicUsize::new(0),
            trace_size_target: AtomicUsize::new(0),
            init_work_required: AtomicUsize::new(0),
            trace_size_count: AtomicUsize::new(0),
            helper_trace_size_count: AtomicUsize::new(0),
            card_clean_count: AtomicUsize::new(0),
            helper_card_clean_count: AtomicUsize::new(0),
            completed_tracing_count: AtomicUsize::new(0),
            final_trace_count: AtomicUsize::new(0),
            final_card_clean_count: AtomicUsize::new(0),
            work_stack_overflow_count: AtomicUsize::new(0),
            threads_scanned: AtomicUsize::new(0),
            kickoff_reason: Atomic::new(KickoffReason::NoKickoff),
            card_cleaning_reason: Atomic::new(CardCleaningReason::NotStarted),
            root_tracing_complete: AtomicBool::new(false),
            card_cleaning_complete: AtomicBool::new(false),
            completed_cycles: AtomicUsize::new(0),
            aborted_cycles: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode.load()
    }

    pub fn mode_at_gc(&self) -> ExecutionMode {
        *self.mode_at_gc.lock().unwrap()
    }

    pub(crate) fn set_mode_at_gc(&self, mode: ExecutionMode) {
        *self.mode_at_gc.lock().unwrap() = mode;
    }

    pub fn kickoff_threshold(&self) -> usize {
        self.kickoff_threshold.load(Ordering::SeqCst)
    }

    pub fn card_cleaning_threshold(&self) -> usize {
        self.card_cleaning_threshold.load(Ordering::SeqCst)
    }

    pub fn trace_size_target(&self) -> usize {
        self.trace_size_target.load(Ordering::SeqCst)
    }

    pub fn init_work_required(&self) -> usize {
        self.init_work_required.load(Ordering::SeqCst)
    }

    /// All tracing and card cleaning done concurrently so far in this cycle.
    pub fn concurrent_work_done(&self) -> usize {
        self.trace_size_count.load(Ordering::SeqCst)
            + self.card_clean_count.load(Ordering::SeqCst)
            + self.helper_trace_size_count.load(Ordering::SeqCst)
            + self.helper_card_clean_count.load(Ordering::SeqCst)
    }

    pub(crate) fn is_root_tracing_complete(&self) -> bool {
        self.root_tracing_complete.load(Ordering::SeqCst)
    }

    pub(crate) fn is_card_cleaning_complete(&self) -> bool {
        self.card_cleaning_complete.load(Ordering::SeqCst)
    }

    /// Reset the per-cycle counters. The thresholds are kept.
    pub(crate) fn reset(&self) {
        for counter in [
            &self.trace_size_count,
            &self.helper_trace_size_count,
            &self.card_clean_count,
            &self.helper_card_clean_count,
            &self.completed_tracing_count,
            &self.final_trace_count,
            &self.final_card_clean_count,
            &self.work_stack_overflow_count,
            &self.threads_scanned,
            &self.remaining_free,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        self.kickoff_reason
            .store(KickoffReason::NoKickoff, Ordering::SeqCst);
        self.card_cleaning_reason
            .store(CardCleaningReason::NotStarted, Ordering::SeqCst);
        self.root_tracing_complete.store(false, Ordering::SeqCst);
        self.card_cleaning_complete.store(false, Ordering::SeqCst);
        self.set_mode_at_gc(ExecutionMode::Off);
    }

    pub fn snapshot(&self) -> CollectorStats {
        CollectorStats {
            mode: self.mode(),
            kickoff_threshold: self.kickoff_threshold(),
            card_cleaning_threshold: self.card_cleaning_threshold(),
            remaining_free: self.remaining_free.load(Ordering::SeqCst),
            trace_size_target: self.trace_size_target(),
            init_work_required: self.init_work_required(),
            trace_size_count: self.trace_size_count.load(Ordering::SeqCst),
            helper_trace_size_count: self.helper_trace_size_count.load(Ordering::SeqCst),
            card_clean_count: self.card_clean_count.load(Ordering::SeqCst),
            helper_card_clean_count: self.helper_card_clean_count.load(Ordering::SeqCst),
            completed_tracing_count: self.completed_tracing_count.load(Ordering::SeqCst),
            final_trace_count: self.final_trace_count.load(Ordering::SeqCst),
            work_stack_overflow_count: self.work_stack_overflow_count.load(Ordering::SeqCst),
            threads_scanned: self.threads_scanned.load(Ordering::SeqCst),
            kickoff_reason: self.kickoff_reason.load(Ordering::SeqCst),
            card_cleaning_reason: self.card_cleaning_reason.load(Ordering::SeqCst),
            completed_cycles: self.completed_cycles.load(Ordering::SeqCst),
            aborted_cycles: self.aborted_cycles.load(Ordering::SeqCst),
        }
    }
}

impl Default for CollectorState {
    fn default() -> Self {
        Self::new()
    }
}
