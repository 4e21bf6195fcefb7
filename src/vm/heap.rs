use crate::util::Address;

/// Index of a memory pool in [`Heap::pools`].
pub type PoolId = usize;
/// Identifies a memory sub-space. Pools with the same sub-space are adjacent in address order.
pub type SubspaceId = usize;

/// A contiguous range of the heap owned by one memory pool. Objects never cross the boundary
/// of a region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapRegion {
    pub base: Address,
    pub top: Address,
    /// The pool that manages the free memory of this range.
    pub pool: PoolId,
    pub subspace: SubspaceId,
    /// Is this range traced by the concurrent collector? Mark bits of other ranges are set
    /// during a cycle so that tracing never enters them.
    pub concurrent_collectible: bool,
}

impl HeapRegion {
    pub fn size(&self) -> usize {
        self.top - self.base
    }
}

/// A free-list memory pool. The pool owns its free entries and their accounting; the sweeper
/// only tells it which ranges are free.
pub trait MemoryPool: Send + Sync {
    fn subspace(&self) -> SubspaceId;

    /// Does this pool take part in concurrent marking and sweeping?
    fn concurrent_collectible(&self) -> bool;

    /// Allocate `size` bytes from the free list.
    fn allocate(&self, size: usize) -> Option<Address>;

    /// The pool's estimate of its free memory, including memory that is not connected yet.
    fn approximate_free_memory(&self) -> usize;

    /// Set the estimate of free memory that the sweep has not connected yet.
    fn set_approximate_free_memory(&self, bytes: usize);

    /// Bytes currently on the free list.
    fn actual_free_memory(&self) -> usize;

    /// Drop every free entry. Called before a sweep rebuilds the free list.
    fn reset_free_list(&self);

    /// Append the free entry `[base, top)`. Entries arrive in address order. The pool adds
    /// the entry to its actual free memory.
    fn create_free_entry(&self, base: Address, top: Address);

    /// Give up `[base, top)`: it is too small to be a free entry, or it overlaps dead space
    /// that cannot be reached from a chunk boundary. The pool may format it as a filler.
    fn abandon_heap_chunk(&self, base: Address, top: Address);

    /// Record the size of the largest free entry connected by the last sweep.
    fn set_largest_free_entry(&self, _size: usize) {}
}

/// The heap as seen by the collector.
pub trait Heap: Send + Sync {
    type Pool: MemoryPool;

    /// The reserved address range of the heap. Every region, including those added later
    /// with `heap_add_range`, lies inside it.
    fn heap_bounds(&self) -> (Address, Address);

    /// The committed regions of the heap in address order.
    fn regions(&self) -> Vec<HeapRegion>;

    /// All pools, in address order, grouped by sub-space.
    fn pools(&self) -> &[Self::Pool];

    fn pool(&self, id: PoolId) -> &Self::Pool {
        &self.pools()[id]
    }

    /// Size of the concurrently collectible part of the heap.
    fn active_memory_size(&self) -> usize {
        self.regions()
            .iter()
            .filter(|r| r.concurrent_collectible)
            .map(|r| r.size())
            .sum()
    }

    /// Approximate free memory of the concurrently collectible part of the heap. The
    /// allocation tax is computed against this value.
    fn approximate_free_memory(&self) -> usize {
        self.pools()
            .iter()
            .filter(|p| p.concurrent_collectible())
            .map(|p| p.approximate_free_memory())
            .sum()
    }
}
