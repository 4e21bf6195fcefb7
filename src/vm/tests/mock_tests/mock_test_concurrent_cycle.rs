use super::mock_test_prelude::*;
use crate::ConcurrentGC;

const HEAP_SIZE: usize = 1 << 20;
const MAX_ALLOCATIONS: usize = 100_000;

/// A root at the start of the heap referring to a chain of objects, plus an unreachable one.
fn build_graph(vm: &MockVM) -> Vec<crate::util::ObjectReference> {
    let mut chain = vec![vm.object(0, 64)];
    for i in 1..32 {
        let object = vm.object(i * 1024, 128);
        vm.objects.add_reference(chain[i - 1], object);
        chain.push(object);
    }
    vm.object(64 * 1024, 256);
    vm.objects.set_phase_roots(vec![vec![chain[0]]]);
    chain
}

/// Pay tax for small allocations until a concurrent cycle has been completed.
fn run_cycle(gc: &ConcurrentGC<MockVM>) {
    let request = AllocationRequest::new(1024, 0);
    for _ in 0..MAX_ALLOCATIONS {
        memory_manager::pay_allocation_tax(gc, &request);
        if gc.stats().completed_cycles > 0 {
            return;
        }
    }
    panic!("cycle did not complete, stuck in {}", gc.mode());
}

#[test]
pub fn cycle_goes_through_every_mode() {
    let gc = mock_gc(HEAP_SIZE, test_options());
    let chain = build_graph(gc.vm());
    assert!(gc.force_kickoff());
    run_cycle(&gc);

    assert_eq!(
        gc.vm().hooks.modes(),
        vec![
            ExecutionMode::InitRunning,
            ExecutionMode::InitComplete,
            ExecutionMode::RootTracing(0),
            ExecutionMode::RootTracing(1),
            ExecutionMode::TraceOnly,
            ExecutionMode::CleanTrace,
            ExecutionMode::Exhausted,
            ExecutionMode::FinalCollection,
            ExecutionMode::Off,
        ]
    );
    assert_eq!(gc.mode(), ExecutionMode::Off);

    let vm = gc.vm();
    assert_eq!(vm.collection.barrier_activations.load(Ordering::SeqCst), 1);
    assert!(!vm.collection.barrier_active.load(Ordering::SeqCst));
    assert_eq!(vm.collection.stack_scan_requests.load(Ordering::SeqCst), 1);
    assert_eq!(
        *vm.collection.collections.lock().unwrap(),
        vec![CollectionReason::ConcurrentFinal]
    );
    assert_eq!(vm.hooks.count(HookEvent::FinalCollection), 1);

    // The chain was traced concurrently, the unreachable object was not.
    assert!(chain.iter().all(|o| gc.marks.is_marked(*o)));
    assert!(!gc.marks.is_marked(mock_object(64 * 1024)));
    let traced = vm.hooks.final_collection_stats().unwrap();
    assert!(traced.trace_size_count >= 64 + 31 * 128);
    // Per-cycle counters start over after the final collection.
    let stats = gc.stats();
    assert_eq!(stats.trace_size_count, 0);
    assert_eq!(stats.completed_cycles, 1);
    assert_eq!(stats.aborted_cycles, 0);
}

#[test]
pub fn overflowed_work_stack_is_recovered_by_rescan() {
    let mut options = test_options();
    options.work_packet_capacity = 1;
    options.local_buffer_size = 1;
    let gc = mock_gc(HEAP_SIZE, options);
    let vm = gc.vm();

    let root = vm.object(0, 64);
    let mut reachable = vec![root];
    for i in 0..100 {
        let child = vm.object(4096 + i * 2048, 64);
        let grandchild = vm.object(4096 + i * 2048 + 1024, 64);
        vm.objects.add_reference(root, child);
        vm.objects.add_reference(child, grandchild);
        reachable.push(child);
        reachable.push(grandchild);
    }
    vm.objects.set_phase_roots(vec![vec![root]]);

    assert!(gc.force_kickoff());
    run_cycle(&gc);

    let stats = vm.hooks.final_collection_stats().unwrap();
    assert!(stats.work_stack_overflow_count > 0);
    assert!(reachable.iter().all(|o| gc.marks.is_marked(*o)));
}

#[test]
pub fn collection_clears_a_pending_kickoff_reason() {
    let gc = mock_gc(HEAP_SIZE, test_options());
    assert!(gc.force_kickoff());
    assert_eq!(gc.stats().kickoff_reason, crate::KickoffReason::Forced);

    // The world is stopped before the forced cycle starts.
    gc.vm()
        .with_exclusive_access(|| memory_manager::collect(&gc, CollectionReason::Explicit));
    assert_eq!(gc.mode(), ExecutionMode::Off);
    assert_eq!(gc.stats().kickoff_reason, crate::KickoffReason::NoKickoff);
}

#[test]
pub fn mode_sequence_follows_the_cycle_order() {
    let gc = mock_gc(HEAP_SIZE, test_options());
    build_graph(gc.vm());
    gc.force_kickoff();
    run_cycle(&gc);

    let modes = gc.vm().hooks.modes();
    // Every switch moves forward, except the final return to Off.
    let (last, forward) = modes.split_last().unwrap();
    assert_eq!(*last, ExecutionMode::Off);
    assert!(forward.windows(2).all(|w| w[0] < w[1]));
}

#[test]
pub fn write_barrier_records_are_cleaned() {
    let gc = mock_gc(HEAP_SIZE, test_options());
    let chain = build_graph(gc.vm());
    gc.force_kickoff();

    let request = AllocationRequest::new(1024, 0);
    while gc.mode() < ExecutionMode::TraceOnly {
        gc.pay_allocation_tax(&request);
    }
    // Trace everything reachable so far without leaving TraceOnly.
    let mut tracer = gc.tracer();
    gc.local_mark(&mut tracer, usize::MAX, true);
    drop(tracer);
    assert!(gc.packets.tracing_exhausted());
    assert_eq!(gc.mode(), ExecutionMode::TraceOnly);

    // A mutator hides an object behind a scanned one while the barrier is active. Only card
    // cleaning can find it.
    let hidden = gc.vm().object(128 * 1024, 512);
    gc.vm().objects.write_reference(chain[31], hidden);
    run_cycle(&gc);

    assert!(gc.marks.is_marked(hidden));
    assert_eq!(gc.vm().objects.dirty_cards(), 0);
}

#[test]
pub fn allocations_off_safepoint_ask_for_barrier_callback() {
    let gc = mock_gc(HEAP_SIZE, test_options());
    build_graph(gc.vm());
    gc.force_kickoff();

    let request = AllocationRequest::new(1024, 0).not_at_safepoint();
    let mut iterations = 0;
    while gc.mode() < ExecutionMode::InitComplete {
        gc.pay_allocation_tax(&request);
        iterations += 1;
        assert!(iterations < MAX_ALLOCATIONS);
    }
    gc.pay_allocation_tax(&request);
    assert_eq!(gc.mode(), ExecutionMode::InitComplete);
    assert!(
        gc.vm()
            .collection
            .barrier_callback_requests
            .load(Ordering::SeqCst)
            > 0
    );

    memory_manager::barrier_callback(&gc);
    assert_eq!(gc.mode(), ExecutionMode::RootTracing(0));
    assert!(gc.vm().collection.barrier_active.load(Ordering::SeqCst));
}

#[test]
pub fn thread_roots_are_traced_during_root_tracing() {
    let gc = mock_gc(HEAP_SIZE, test_options());
    build_graph(gc.vm());
    let stack_object = gc.vm().object(256 * 1024, 64);

    assert!(!memory_manager::trace_thread_roots(&gc, [stack_object]));
    assert!(!gc.marks.is_marked(stack_object));

    gc.force_kickoff();
    let request = AllocationRequest::new(1024, 0);
    while gc.mode() < ExecutionMode::RootTracing(0) {
        gc.pay_allocation_tax(&request);
    }
    assert!(memory_manager::trace_thread_roots(&gc, [stack_object]));
    assert!(gc.marks.is_marked(stack_object));
    assert_eq!(gc.stats().threads_scanned, 1);
}
