use super::mock_test_prelude::*;

const HEAP_SIZE: usize = 1 << 20;

fn free_down_to(gc: &crate::ConcurrentGC<MockVM>, free: usize) {
    let pool = &gc.vm().heap.pools()[0];
    pool.consume(pool.actual_free_memory() - free);
}

#[test]
pub fn kickoff_below_threshold() {
    let gc = mock_gc(HEAP_SIZE, test_options());
    gc.state.kickoff_threshold.store(100_000, Ordering::SeqCst);

    free_down_to(&gc, 1_000_000);
    assert!(!gc.time_to_kickoff());
    assert_eq!(gc.mode(), ExecutionMode::Off);

    free_down_to(&gc, 90_000);
    assert!(gc.time_to_kickoff());
    assert_eq!(gc.mode(), ExecutionMode::InitRunning);
    let stats = gc.stats();
    assert_eq!(stats.remaining_free, 90_000);
    assert_eq!(stats.kickoff_reason, crate::KickoffReason::ThresholdReached);

    // Later callers see the condition but do not switch again.
    free_down_to(&gc, 80_000);
    assert!(gc.time_to_kickoff());
    assert_eq!(gc.stats().remaining_free, 90_000);
    assert_eq!(gc.vm().hooks.count(HookEvent::Kickoff), 1);
    assert_eq!(
        gc.vm().hooks.modes(),
        vec![ExecutionMode::InitRunning]
    );
}

#[test]
pub fn no_kickoff_when_disabled_or_heap_full() {
    let mut options = test_options();
    options.concurrent_kickoff_enabled = false;
    let gc = mock_gc(HEAP_SIZE, options);
    gc.state.kickoff_threshold.store(100_000, Ordering::SeqCst);
    free_down_to(&gc, 50_000);
    assert!(!gc.time_to_kickoff());
    assert!(!gc.force_kickoff());

    let gc = mock_gc(HEAP_SIZE, test_options());
    gc.state.kickoff_threshold.store(100_000, Ordering::SeqCst);
    free_down_to(&gc, 0);
    assert!(!gc.time_to_kickoff());
    assert_eq!(gc.mode(), ExecutionMode::Off);
}

#[test]
pub fn forced_kickoff_ignores_threshold() {
    let gc = mock_gc(HEAP_SIZE, test_options());
    assert!(gc.stats().kickoff_threshold < HEAP_SIZE);
    assert!(memory_manager::force_kickoff(&gc));
    assert!(gc.time_to_kickoff());
    assert_eq!(gc.mode(), ExecutionMode::InitRunning);
    assert_eq!(gc.stats().kickoff_reason, crate::KickoffReason::Forced);
}

#[test]
pub fn one_winner_in_kickoff_race() {
    const THREADS: usize = 8;
    let gc = mock_gc(HEAP_SIZE, test_options());
    gc.state.kickoff_threshold.store(100_000, Ordering::SeqCst);
    free_down_to(&gc, 90_000);

    let barrier = std::sync::Barrier::new(THREADS);
    let results: Vec<bool> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    gc.time_to_kickoff()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(results.into_iter().all(|kicked| kicked));
    assert_eq!(gc.mode(), ExecutionMode::InitRunning);
    assert_eq!(gc.vm().hooks.count(HookEvent::Kickoff), 1);
    assert_eq!(
        gc.vm().hooks.count(HookEvent::ModeSwitch(
            ExecutionMode::Off,
            ExecutionMode::InitRunning
        )),
        1
    );
}
