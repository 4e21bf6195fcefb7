//! gencon schedules the concurrent work of a generational mark-and-sweep collector.
//!
//! Marking of the old generation runs concurrently with the mutators. Every allocation pays a
//! tax of mark-bit initialization, tracing or card cleaning, sized so that tracing finishes
//! just before the heap is full. A short stop-the-world collection then completes the cycle.
//! After the collection the heap is swept lazily: mutators sweep chunks as they allocate, and
//! swept chunks are connected to the free lists of the memory pools in address order.
//!
//! The collector does not own the heap. A runtime plugs in through the traits of [`vm`] and
//! drives the collector through [`memory_manager`]. The main types are:
//! * [`ConcurrentGC`]: one collector instance, shared by reference between all threads.
//! * [`ExecutionMode`]: the phase of the current concurrent cycle.
//! * [`sweep::ConcurrentSweepScheme`]: the lazy sweep of the collectible heap.
//! * [`util::options::Options`]: the policy knobs, also settable via `GENCON_*` variables.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate probe;

pub(crate) mod build_info;
pub mod concurrent;
pub mod global_state;
pub mod memory_manager;
pub mod sweep;
pub mod util;
pub mod vm;

pub use crate::concurrent::{
    AbortReason, AllocationError, AllocationRequest, ConcurrentGC, ExecutionMode, InitError,
};
pub use crate::global_state::{CollectorStats, KickoffReason};
pub use crate::sweep::{SweepCompletionReason, SweepMode, SweepStats};
