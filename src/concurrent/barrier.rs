//! Activation of the write barrier at the start of root tracing.

use super::{ConcurrentGC, ExecutionMode};
use crate::vm::{Collection, VMBinding};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Identifies one concurrent cycle, from barrier activation to the collection that ends it.
#[derive(Copy, Clone, Debug)]
pub(crate) struct CycleContext {
    pub id: usize,
    pub started: Instant,
}

pub(crate) struct WriteBarrierActivator {
    cycle: Mutex<Option<CycleContext>>,
    next_cycle_id: AtomicUsize,
    active: AtomicBool,
}

impl WriteBarrierActivator {
    pub fn new() -> Self {
        Self {
            cycle: Mutex::new(None),
            next_cycle_id: AtomicUsize::new(0),
            active: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn current_cycle(&self) -> Option<CycleContext> {
        *self.cycle.lock().unwrap()
    }

    fn begin_cycle(&self) -> CycleContext {
        let ctx = CycleContext {
            id: self.next_cycle_id.fetch_add(1, Ordering::SeqCst),
            started: Instant::now(),
        };
        *self.cycle.lock().unwrap() = Some(ctx);
        self.active.store(true, Ordering::SeqCst);
        ctx
    }

    /// End the cycle. Returns the cycle if the barrier was active.
    fn end_cycle(&self) -> Option<CycleContext> {
        self.active.store(false, Ordering::SeqCst);
        self.cycle.lock().unwrap().take()
    }
}

impl<VM: VMBinding> ConcurrentGC<VM> {
    /// Stop the world once, activate the write barrier of every mutator and move on to root
    /// tracing. Threads that lose the race find the mode already changed and return.
    pub(crate) fn signal_threads_to_dirty_cards(&self) {
        let collection = self.vm.collection();
        while self.state.mode() == ExecutionMode::InitComplete {
            collection.acquire_exclusive_access();
            if self.state.mode() == ExecutionMode::InitComplete {
                let ctx = self.barrier.begin_cycle();
                collection.activate_write_barrier();
                self.switch_mode(ExecutionMode::InitComplete, ExecutionMode::RootTracing(0));
                collection.cancel_barrier_callbacks();
                debug!("Write barrier activated for cycle {}", ctx.id);
            }
            collection.release_exclusive_access();
        }
    }

    /// Called by the runtime at the safepoint of a thread that asked for a barrier callback.
    pub fn barrier_callback(&self) {
        if self.state.mode() == ExecutionMode::InitComplete {
            self.signal_threads_to_dirty_cards();
        }
    }

    /// Deactivate the barrier after a collection. Called with exclusive access held.
    pub(crate) fn deactivate_write_barrier(&self) {
        let collection = self.vm.collection();
        if let Some(ctx) = self.barrier.end_cycle() {
            collection.deactivate_write_barrier();
            debug!(
                "Write barrier deactivated after cycle {} ({:?})",
                ctx.id,
                ctx.started.elapsed()
            );
        }
        collection.cancel_barrier_callbacks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_are_numbered() {
        let barrier = WriteBarrierActivator::new();
        assert!(!barrier.is_active());
        let first = barrier.begin_cycle();
        assert!(barrier.is_active());
        assert_eq!(barrier.current_cycle().map(|c| c.id), Some(first.id));
        assert_eq!(barrier.end_cycle().map(|c| c.id), Some(first.id));
        assert!(barrier.end_cycle().is_none());
        assert_eq!(barrier.begin_cycle().id, first.id + 1);
    }
}
