//! The shared gray stack and the per-thread tracer that feeds it.

use crate::global_state::CollectorState;
use crate::util::mark_bitmap::MarkBitmap;
use crate::util::ObjectReference;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A bounded multi-producer multi-consumer stack of marked but unscanned objects.
///
/// A push to a full stack drops the reference and records an overflow. The object is already
/// marked, so it is found again by the linear rescan done when the cycle completes.
pub(crate) struct WorkPackets {
    queue: ArrayQueue<ObjectReference>,
    overflow: AtomicBool,
    /// Tracers that hold references which are not on the shared stack.
    active_tracers: AtomicUsize,
}

impl WorkPackets {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow: AtomicBool::new(false),
            active_tracers: AtomicUsize::new(0),
        }
    }

    /// Returns false if the stack was full and the reference was dropped.
    fn push(&self, object: ObjectReference) -> bool {
        if self.queue.push(object).is_err() {
            self.overflow.store(true, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    fn pop(&self) -> Option<ObjectReference> {
        self.queue.pop()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// No references are left anywhere: not on the shared stack and not held by any tracer.
    pub fn tracing_exhausted(&self) -> bool {
        self.active_tracers.load(Ordering::SeqCst) == 0 && self.queue.is_empty()
    }

    #[cfg(test)]
    pub fn overflow_occurred(&self) -> bool {
        self.overflow.load(Ordering::SeqCst)
    }

    /// Clear the overflow flag and return whether it was set.
    pub fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::SeqCst)
    }

    /// Drop every reference on the stack and forget overflows. Only called when no tracer is
    /// active.
    pub fn reset(&self) {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        self.overflow.store(false, Ordering::SeqCst);
        if dropped > 0 {
            debug!("Dropped {} references from the work packets", dropped);
        }
    }
}

/// A thread's view of the gray stack. References discovered while scanning go into a local
/// buffer first, and half of it spills to the shared stack when it grows past its limit.
///
/// While the buffer is non-empty, or an object popped from the shared stack is being scanned,
/// the tracer counts as active and tracing cannot be considered exhausted.
pub(crate) struct Tracer<'a> {
    packets: &'a WorkPackets,
    marks: &'a MarkBitmap,
    state: &'a CollectorState,
    local: Vec<ObjectReference>,
    limit: usize,
    active: bool,
}

impl<'a> Tracer<'a> {
    pub fn new(
        packets: &'a WorkPackets,
        marks: &'a MarkBitmap,
        state: &'a CollectorState,
        limit: usize,
    ) -> Self {
        Self {
            packets,
            marks,
            state,
            local: Vec::new(),
            limit,
            active: false,
        }
    }

    /// A tracer that never spills to the shared stack. Used while the world is stopped.
    pub fn unbounded(packets: &'a WorkPackets, marks: &'a MarkBitmap, state: &'a CollectorState) -> Self {
        Self::new(packets, marks, state, usize::MAX)
    }

    fn activate(&mut self) {
        if !self.active {
            self.active = true;
            self.packets.active_tracers.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn deactivate(&mut self) {
        if self.active {
            self.active = false;
            self.packets.active_tracers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Mark `object` and queue it for scanning if this call marked it.
    pub fn mark_and_push(&mut self, object: ObjectReference) {
        if self.marks.mark(object) {
            self.push(object);
        }
    }

    /// Queue an object that is already marked, e.g. one found by a linear rescan.
    pub fn push(&mut self, object: ObjectReference) {
        self.activate();
        self.local.push(object);
        if self.local.len() > self.limit {
            let keep = self.local.len() / 2;
            let spilled: Vec<_> = self.local.drain(keep..).collect();
            for object in spilled {
                self.spill(object);
            }
        }
    }

    fn spill(&self, object: ObjectReference) {
        if !self.packets.push(object) {
            self.state
                .work_stack_overflow_count
                .fetch_add(1, Ordering::SeqCst);
            trace!("Work stack overflow, dropped {}", object);
        }
    }

    pub fn pop(&mut self) -> Option<ObjectReference> {
        if let Some(object) = self.local.pop() {
            return Some(object);
        }
        // Count as active before taking from the shared stack, so that the popped reference is
        // always accounted for.
        self.activate();
        let object = self.packets.pop();
        if object.is_none() {
            self.deactivate();
        }
        object
    }

    /// Is there anything to trace, locally or on the shared stack?
    pub fn has_work(&self) -> bool {
        !self.local.is_empty() || !self.packets.is_empty()
    }

    /// Move the local buffer to the shared stack.
    pub fn flush(&mut self) {
        for object in std::mem::take(&mut self.local) {
            self.spill(object);
        }
        self.deactivate();
    }
}

impl Drop for Tracer<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}
