use super::mock_test_prelude::*;
use crate::{AllocationError, SweepMode};

const HEAP_SIZE: usize = 64 * 1024;

fn options() -> crate::util::options::Options {
    let mut options = test_options();
    options.concurrent_kickoff_enabled = false;
    options
}

#[test]
pub fn allocation_failure_collects_and_sweeps() {
    let gc = mock_gc(HEAP_SIZE, options());
    let vm = gc.vm();

    // Fill the heap with 1 KiB objects. Keep every fourth one alive.
    let mut allocated = vec![];
    while let Some(address) = vm.heap.pools()[0].allocate(1024) {
        allocated.push(address);
    }
    assert_eq!(allocated.len(), HEAP_SIZE / 1024);
    let live: Vec<_> = (0..allocated.len())
        .step_by(4)
        .map(|i| vm.object(i * 1024, 1024))
        .collect();
    vm.objects.set_thread_roots(live.clone());

    let address = memory_manager::allocate(&gc, &AllocationRequest::new(2048, 0)).unwrap();

    assert_eq!(
        *vm.collection.collections.lock().unwrap(),
        vec![CollectionReason::AllocationFailure]
    );
    assert!(!vm.collection.is_exclusive_access_held());
    // The first gap between live objects is 3 KiB.
    assert_eq!(address, mock_address(1024));
    assert!(live.iter().all(|o| gc.marks.is_marked(*o)));

    // The rest of the heap is swept lazily.
    let stats = memory_manager::sweep_stats(&gc);
    assert_eq!(stats.mode, SweepMode::On);
    assert!(stats.minimum_free_entry_bytes_connected > 0);
    assert!(stats.total_chunk_swept_count < stats.total_chunk_count);
}

#[test]
pub fn allocation_replenishes_from_the_sweep() {
    let gc = mock_gc(HEAP_SIZE, options());
    let vm = gc.vm();
    let root = vm.object(0, 1024);
    vm.objects.set_thread_roots(vec![root]);
    vm.with_exclusive_access(|| memory_manager::collect(&gc, CollectionReason::Explicit));

    // The sweep rebuilt an empty free list.
    assert_eq!(vm.heap.pools()[0].actual_free_memory(), 0);
    assert!(vm.heap.pools()[0].approximate_free_memory() > 0);

    let address = memory_manager::allocate(&gc, &AllocationRequest::new(4096, 0)).unwrap();
    assert_eq!(address, mock_address(1024));
    assert_eq!(
        *vm.collection.collections.lock().unwrap(),
        vec![CollectionReason::Explicit]
    );
}

#[test]
pub fn out_of_memory_after_collection() {
    let gc = mock_gc(HEAP_SIZE, options());
    let vm = gc.vm();

    let result = memory_manager::allocate(&gc, &AllocationRequest::new(2 * HEAP_SIZE, 0));
    assert_eq!(
        result,
        Err(AllocationError::OutOfMemory {
            bytes: 2 * HEAP_SIZE
        })
    );
    assert_eq!(vm.collection.out_of_memory_calls.load(Ordering::SeqCst), 1);
    assert!(!vm.collection.is_exclusive_access_held());
}

#[test]
pub fn sweep_tax_is_paid_outside_the_nursery() {
    let gc = mock_gc(HEAP_SIZE, options());
    let vm = gc.vm();
    vm.with_exclusive_access(|| memory_manager::collect(&gc, CollectionReason::Explicit));
    assert_eq!(memory_manager::sweep_stats(&gc).total_chunk_swept_count, 0);

    memory_manager::pay_allocation_tax(&gc, &AllocationRequest::new(1024, 0).in_nursery());
    assert_eq!(memory_manager::sweep_stats(&gc).total_chunk_swept_count, 0);

    memory_manager::pay_allocation_tax(&gc, &AllocationRequest::new(1024, 0));
    assert!(memory_manager::sweep_stats(&gc).total_chunk_swept_count >= 1);
}
