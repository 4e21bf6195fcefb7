use super::mock_test_prelude::*;
use crate::ConcurrentGC;

const RESERVED: usize = 1 << 20;
const COMMITTED: usize = 256 * 1024;

fn region(base: usize, size: usize, collectible: bool) -> HeapRegion {
    HeapRegion {
        base: mock_address(base),
        top: mock_address(base + size),
        pool: if collectible { 0 } else { 1 },
        subspace: if collectible { 0 } else { 1 },
        concurrent_collectible: collectible,
    }
}

fn resizable_gc() -> ConcurrentGC<MockVM> {
    let heap = MockHeap::new(
        RESERVED,
        vec![region(0, COMMITTED, true)],
        vec![MockPool::new(0, true), MockPool::new(1, false)],
    );
    heap.pools()[0].create_free_entry(mock_address(0), mock_address(COMMITTED));
    ConcurrentGC::new(MockVM::new(heap), test_options()).unwrap()
}

fn grow(gc: &ConcurrentGC<MockVM>, added: HeapRegion) {
    gc.vm().with_exclusive_access(|| {
        gc.vm().heap.add_region(added);
        memory_manager::heap_add_range(gc, &added);
    });
    memory_manager::heap_reconfigured(gc);
}

#[test]
pub fn growing_the_heap_retunes() {
    let gc = resizable_gc();
    let before = gc.stats();

    grow(&gc, region(COMMITTED, COMMITTED, true));

    let after = gc.stats();
    assert!(after.init_work_required > before.init_work_required);
    assert!(after.trace_size_target > before.trace_size_target);
    assert!(after.kickoff_threshold > before.kickoff_threshold);
}

#[test]
pub fn range_added_mid_cycle_is_initialized() {
    let gc = resizable_gc();
    gc.force_kickoff();
    assert!(gc.time_to_kickoff());

    let collectible = region(COMMITTED, 64 * 1024, true);
    let other = region(RESERVED - 64 * 1024, 64 * 1024, false);
    // Stale bits from an earlier use of the range.
    gc.marks.set_range(collectible.base, collectible.top);

    for added in [collectible, other] {
        gc.vm().with_exclusive_access(|| {
            gc.vm().heap.add_region(added);
            memory_manager::heap_add_range(&gc, &added);
        });
    }
    memory_manager::heap_reconfigured(&gc);

    assert!(gc.marks.next_marked(collectible.base, collectible.top).is_none());
    assert!(gc.marks.is_marked(mock_object(RESERVED - 64 * 1024)));
    assert!(gc.vm().objects.cleared_card_bytes.load(Ordering::SeqCst) >= 64 * 1024);
    // The cycle goes on with the new ranges.
    assert_eq!(gc.mode(), ExecutionMode::InitRunning);
}

#[test]
pub fn sweep_covers_added_ranges() {
    let gc = resizable_gc();
    grow(&gc, region(COMMITTED, COMMITTED, true));

    gc.vm()
        .with_exclusive_access(|| memory_manager::collect(&gc, CollectionReason::Explicit));
    gc.vm()
        .with_exclusive_access(|| memory_manager::complete_sweep(&gc));

    let stats = memory_manager::sweep_stats(&gc);
    assert_eq!(stats.total_chunk_count, 2 * COMMITTED / 4096);
    assert_eq!(stats.total_chunk_swept_count, stats.total_chunk_count);
    assert_eq!(
        gc.vm().heap.pools()[0].free_entries(),
        vec![(mock_address(0), mock_address(2 * COMMITTED))]
    );
}

#[test]
pub fn shrinking_the_heap_rebuilds_the_sweep() {
    let gc = resizable_gc();
    let removed = region(COMMITTED / 2, COMMITTED / 2, true);
    gc.vm().with_exclusive_access(|| {
        memory_manager::heap_remove_range(&gc, &removed);
        gc.vm().heap.remove_region(mock_address(0));
        gc.vm().heap.add_region(region(0, COMMITTED / 2, true));
    });
    memory_manager::heap_reconfigured(&gc);

    gc.vm()
        .with_exclusive_access(|| memory_manager::collect(&gc, CollectionReason::Explicit));
    gc.vm()
        .with_exclusive_access(|| memory_manager::complete_sweep(&gc));

    assert_eq!(
        memory_manager::sweep_stats(&gc).total_chunk_count,
        COMMITTED / 2 / 4096
    );
    assert_eq!(
        gc.vm().heap.pools()[0].actual_free_memory(),
        COMMITTED / 2
    );
}
