use super::mock_test_prelude::*;
use crate::concurrent::HelperRequest;
use std::sync::Arc;

const HEAP_SIZE: usize = 1 << 20;
const TIMEOUT_MILLIS: u64 = 10_000;

fn options(helpers: usize) -> crate::util::options::Options {
    let mut options = test_options();
    options.concurrent_helper_threads = helpers;
    options
}

#[test]
pub fn helpers_start_and_shut_down() {
    panic_after(TIMEOUT_MILLIS, || {
        let gc = memory_manager::gencon_init(
            MockVM::new(MockHeap::single_pool(HEAP_SIZE)),
            options(2),
        )
        .unwrap();
        assert_eq!(memory_manager::start_helpers(&gc).unwrap(), 2);
        assert_eq!(gc.helpers.started(), 2);

        memory_manager::shutdown_helpers(&gc);
        assert_eq!(gc.helpers.request(), HelperRequest::Shutdown);
    });
}

#[test]
pub fn failing_spawn_leaves_work_to_mutators() {
    let gc = Arc::new(mock_gc(HEAP_SIZE, options(2)));
    gc.vm()
        .collection
        .fail_helper_spawn
        .store(true, Ordering::SeqCst);

    let error = memory_manager::start_helpers(&gc).unwrap_err();
    assert_eq!(error.requested, 2);
    assert_eq!(gc.helpers.started(), 0);

    // Nobody is woken up for work.
    gc.helpers.resume();
    assert_eq!(gc.helpers.request(), HelperRequest::Wait);
    memory_manager::shutdown_helpers(&gc);
}

#[test]
pub fn helpers_trace_during_a_cycle() {
    panic_after(TIMEOUT_MILLIS, || {
        let gc = Arc::new(mock_gc(HEAP_SIZE, options(2)));
        let vm = gc.vm();
        let mut chain = vec![vm.object(0, 64)];
        for i in 1..256 {
            let object = vm.object(i * 1024, 256);
            vm.objects.add_reference(chain[i - 1], object);
            chain.push(object);
        }
        vm.objects.set_phase_roots(vec![chain[..1].to_vec()]);
        assert_eq!(gc.start_helpers().unwrap(), 2);

        gc.force_kickoff();
        let request = AllocationRequest::new(64, 0);
        while gc.stats().completed_cycles == 0 {
            memory_manager::pay_allocation_tax(&gc, &request);
        }
        memory_manager::shutdown_helpers(&gc);

        assert!(chain.iter().all(|o| gc.marks.is_marked(*o)));
        // Every helper that went to work parked again.
        let events = gc.vm().hooks.events();
        let activated = events
            .iter()
            .filter(|e| matches!(e, HookEvent::HelperActivated(_)))
            .count();
        let deactivated = events
            .iter()
            .filter(|e| matches!(e, HookEvent::HelperDeactivated(_)))
            .count();
        assert_eq!(activated, deactivated);
    });
}
