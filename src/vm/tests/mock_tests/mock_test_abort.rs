use super::mock_test_prelude::*;
use crate::ConcurrentGC;

const HEAP_SIZE: usize = 1 << 20;

fn gc_in_trace_only() -> ConcurrentGC<MockVM> {
    let gc = mock_gc(HEAP_SIZE, test_options());
    let vm = gc.vm();
    let roots: Vec<_> = (0..64).map(|i| vm.object(i * 256, 64)).collect();
    vm.objects.set_phase_roots(vec![roots]);
    gc.force_kickoff();
    let request = AllocationRequest::new(256, 0);
    while gc.mode() < ExecutionMode::TraceOnly {
        gc.pay_allocation_tax(&request);
    }
    gc
}

#[test]
pub fn abort_empties_the_work_packets() {
    let gc = gc_in_trace_only();
    assert!(!gc.packets.is_empty());
    assert!(gc.vm().collection.barrier_active.load(Ordering::SeqCst));

    gc.vm()
        .with_exclusive_access(|| memory_manager::abort(&gc, AbortReason::Requested));

    assert_eq!(gc.mode(), ExecutionMode::Off);
    assert!(gc.packets.is_empty());
    assert!(!gc.vm().collection.barrier_active.load(Ordering::SeqCst));
    assert_eq!(gc.stats().aborted_cycles, 1);
    assert_eq!(
        gc.vm().hooks.count(HookEvent::Abort(AbortReason::Requested)),
        1
    );
    assert_eq!(gc.vm().hooks.modes().last(), Some(&ExecutionMode::Off));

    // A second abort has nothing to do.
    gc.vm()
        .with_exclusive_access(|| memory_manager::abort(&gc, AbortReason::Requested));
    assert_eq!(gc.stats().aborted_cycles, 1);
}

#[test]
pub fn collection_before_tracing_aborts() {
    let gc = mock_gc(HEAP_SIZE, test_options());
    let root = gc.vm().object(0, 64);
    gc.vm().objects.set_phase_roots(vec![vec![root]]);
    gc.force_kickoff();
    assert!(gc.time_to_kickoff());
    assert_eq!(gc.mode(), ExecutionMode::InitRunning);

    gc.vm()
        .with_exclusive_access(|| memory_manager::collect(&gc, CollectionReason::Explicit));

    assert_eq!(gc.mode(), ExecutionMode::Off);
    assert_eq!(
        gc.vm()
            .hooks
            .count(HookEvent::Abort(AbortReason::InsufficientProgress)),
        1
    );
    // The full stop-the-world mark still found the root.
    assert!(gc.marks.is_marked(root));
    assert_eq!(gc.stats().completed_cycles, 0);
}

#[test]
pub fn remembered_set_overflow_aborts_at_the_next_collection() {
    let gc = gc_in_trace_only();
    memory_manager::remembered_set_overflow(&gc);
    assert_eq!(gc.mode(), ExecutionMode::TraceOnly);

    gc.vm()
        .with_exclusive_access(|| memory_manager::collect(&gc, CollectionReason::Explicit));

    assert_eq!(gc.mode(), ExecutionMode::Off);
    assert!(gc.packets.is_empty());
    assert_eq!(
        gc.vm()
            .hooks
            .count(HookEvent::Abort(AbortReason::RememberedSetOverflow)),
        1
    );
    // Every root is live after the full mark.
    for i in 0..64 {
        assert!(gc.marks.is_marked(mock_object(i * 256)));
    }
}
