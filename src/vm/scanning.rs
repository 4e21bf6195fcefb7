use crate::util::{Address, ObjectReference};

/// Callback trait of scanning functions. The collector marks and queues each visited object.
pub trait ObjectVisitor {
    fn visit_object(&mut self, object: ObjectReference);
}

/// This lets us use closures as ObjectVisitor.
impl<F: FnMut(ObjectReference)> ObjectVisitor for F {
    fn visit_object(&mut self, object: ObjectReference) {
        self(object)
    }
}

/// The result of one call to [`Scanning::clean_cards`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CardCleaningProgress {
    /// Bytes of objects rescanned. Counted towards the allocation tax.
    pub bytes_cleaned: usize,
    /// Set once no dirty cards are left for this cycle.
    pub complete: bool,
}

/// Root enumeration, object scanning and the card table of the write barrier.
pub trait Scanning: Send + Sync {
    /// The number of root-tracing phases run between initialization and tracing. Each phase is
    /// claimed by one thread, which calls `scan_roots` with the phase number (1-based).
    fn root_tracing_phases(&self) -> u8 {
        0
    }

    /// Report the roots of `phase`. Returns true if any roots were reported.
    fn scan_roots<V: ObjectVisitor>(&self, phase: u8, visitor: &mut V) -> bool;

    /// Report the roots held by all mutator stacks. Only called while the world is stopped.
    fn scan_thread_roots<V: ObjectVisitor>(&self, visitor: &mut V);

    /// Report every reference held by `object` and return the number of bytes scanned.
    fn scan_object<V: ObjectVisitor>(&self, object: ObjectReference, visitor: &mut V) -> usize;

    /// Reset the cards covering `[base, top)`. Called while initializing a concurrent cycle.
    fn clear_cards(&self, _base: Address, _top: Address) {}

    /// Rescan objects on dirty cards, up to roughly `budget` bytes.
    fn clean_cards<V: ObjectVisitor>(&self, _budget: usize, _visitor: &mut V) -> CardCleaningProgress {
        CardCleaningProgress {
            bytes_cleaned: 0,
            complete: true,
        }
    }

    /// Rescan every remaining dirty card. Only called while the world is stopped. Returns the
    /// bytes rescanned.
    fn final_clean_cards<V: ObjectVisitor>(&self, _visitor: &mut V) -> usize {
        0
    }
}
