//! The execution mode of a concurrent cycle.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// The maximum number of root-tracing phases a binding may ask for.
pub const MAX_ROOT_TRACING_PHASES: u8 = 64;

const RAW_OFF: u8 = 0;
const RAW_INIT_RUNNING: u8 = 1;
const RAW_INIT_COMPLETE: u8 = 2;
const RAW_ROOT_TRACING: u8 = 3;
const RAW_TRACE_ONLY: u8 = 250;
const RAW_CLEAN_TRACE: u8 = 251;
const RAW_EXHAUSTED: u8 = 252;
const RAW_FINAL_COLLECTION: u8 = 253;

static_assertions::const_assert!(
    (RAW_ROOT_TRACING as u32) + (MAX_ROOT_TRACING_PHASES as u32) < RAW_TRACE_ONLY as u32
);

/// The phases of a concurrent cycle, in the order a cycle moves through them.
///
/// `RootTracing(0)` is the entry phase in which stack scanning is signalled. Phases `1..=N`
/// are the binding's root-tracing phases. The derived ordering follows the cycle, so
/// `mode < ExecutionMode::TraceOnly` means "tracing has not started yet".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionMode {
    Off,
    InitRunning,
    InitComplete,
    RootTracing(u8),
    TraceOnly,
    CleanTrace,
    Exhausted,
    FinalCollection,
}

impl ExecutionMode {
    fn to_raw(self) -> u8 {
        match self {
            ExecutionMode::Off => RAW_OFF,
            ExecutionMode::InitRunning => RAW_INIT_RUNNING,
            ExecutionMode::InitComplete => RAW_INIT_COMPLETE,
            ExecutionMode::RootTracing(phase) => {
                debug_assert!(phase <= MAX_ROOT_TRACING_PHASES);
                RAW_ROOT_TRACING + phase
            }
            ExecutionMode::TraceOnly => RAW_TRACE_ONLY,
            ExecutionMode::CleanTrace => RAW_CLEAN_TRACE,
            ExecutionMode::Exhausted => RAW_EXHAUSTED,
            ExecutionMode::FinalCollection => RAW_FINAL_COLLECTION,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            RAW_OFF => ExecutionMode::Off,
            RAW_INIT_RUNNING => ExecutionMode::InitRunning,
            RAW_INIT_COMPLETE => ExecutionMode::InitComplete,
            RAW_TRACE_ONLY => ExecutionMode::TraceOnly,
            RAW_CLEAN_TRACE => ExecutionMode::CleanTrace,
            RAW_EXHAUSTED => ExecutionMode::Exhausted,
            RAW_FINAL_COLLECTION => ExecutionMode::FinalCollection,
            r if (RAW_ROOT_TRACING..=RAW_ROOT_TRACING + MAX_ROOT_TRACING_PHASES).contains(&r) => {
                ExecutionMode::RootTracing(r - RAW_ROOT_TRACING)
            }
            r => unreachable!("Invalid execution mode {}", r),
        }
    }

    /// Is a concurrent cycle in progress?
    pub fn is_active(self) -> bool {
        self != ExecutionMode::Off
    }

    /// Is this one of the phases between barrier activation and tracing?
    pub fn is_root_tracing(self) -> bool {
        matches!(self, ExecutionMode::RootTracing(_))
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionMode::Off => write!(f, "OFF"),
            ExecutionMode::InitRunning => write!(f, "INIT_RUNNING"),
            ExecutionMode::InitComplete => write!(f, "INIT_COMPLETE"),
            ExecutionMode::RootTracing(phase) => write!(f, "ROOT_TRACING({})", phase),
            ExecutionMode::TraceOnly => write!(f, "TRACE_ONLY"),
            ExecutionMode::CleanTrace => write!(f, "CLEAN_TRACE"),
            ExecutionMode::Exhausted => write!(f, "EXHAUSTED"),
            ExecutionMode::FinalCollection => write!(f, "FINAL_COLLECTION"),
        }
    }
}

/// The shared execution mode. It can only change through a compare-and-set from an expected
/// mode, so every transition has exactly one winner.
pub(crate) struct ModeCell {
    raw: AtomicU8,
}

impl ModeCell {
    pub fn new() -> Self {
        Self {
            raw: AtomicU8::new(RAW_OFF),
        }
    }

    pub fn load(&self) -> ExecutionMode {
        ExecutionMode::from_raw(self.raw.load(Ordering::SeqCst))
    }

    /// Switch from `from` to `to`. Returns false and changes nothing if the mode is not `from`.
    pub fn try_switch(&self, from: ExecutionMode, to: ExecutionMode) -> bool {
        self.raw
            .compare_exchange(from.to_raw(), to.to_raw(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
