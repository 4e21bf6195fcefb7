//! The binding interface of the collector.
//!
//! A runtime embeds the collector by implementing [`VMBinding`]. The binding owns the heap
//! layout, the free-list memory pools, object layout and scanning, the write barrier and the
//! mutator threads. The collector drives them through the traits in this module.

mod collection;
mod heap;
mod hooks;
mod object_model;
mod scanning;

pub use self::collection::Collection;
pub use self::collection::CollectionReason;
pub use self::heap::Heap;
pub use self::heap::HeapRegion;
pub use self::heap::MemoryPool;
pub use self::heap::PoolId;
pub use self::heap::SubspaceId;
pub use self::hooks::EventHooks;
pub use self::object_model::ObjectModel;
pub use self::scanning::CardCleaningProgress;
pub use self::scanning::ObjectVisitor;
pub use self::scanning::Scanning;

/// Default minimum alignment of objects, in bytes.
pub const DEFAULT_OBJECT_ALIGNMENT: usize = crate::util::mark_bitmap::MIN_OBJECT_ALIGNMENT;

/// The `VMBinding` trait associates each binding interface with the type that implements it
/// for a particular runtime. A collector instance owns one value of the binding and reaches
/// each interface through the accessor methods.
pub trait VMBinding
where
    Self: Sized + Send + Sync + 'static,
{
    /// The heap layout and the memory pools.
    type VMHeap: Heap;
    /// Object sizes.
    type VMObjectModel: ObjectModel;
    /// Roots, object scanning and the card table.
    type VMScanning: Scanning;
    /// Exclusive access, the write barrier and thread management.
    type VMCollection: Collection<Self>;
    /// Observability call-outs.
    type VMHooks: EventHooks;

    fn heap(&self) -> &Self::VMHeap;
    fn object_model(&self) -> &Self::VMObjectModel;
    fn scanning(&self) -> &Self::VMScanning;
    fn collection(&self) -> &Self::VMCollection;
    fn hooks(&self) -> &Self::VMHooks;
}

#[cfg(test)]
mod tests;
