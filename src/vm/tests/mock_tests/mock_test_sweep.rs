use super::mock_test_prelude::*;
use crate::sweep::{SweepCompletionReason, SweepMode};
use crate::util::Address;
use crate::ConcurrentGC;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const CHUNK: usize = 4096;

/// Mark an object of `size` bytes at `offset` as live.
fn live(gc: &ConcurrentGC<MockVM>, offset: usize, size: usize) {
    let object = gc.vm().object(offset, size);
    gc.marks.mark(object);
}

fn entries(gc: &ConcurrentGC<MockVM>, pool: usize) -> Vec<(Address, Address)> {
    gc.vm().heap.pools()[pool].free_entries()
}

fn range(base: usize, top: usize) -> (Address, Address) {
    (mock_address(base), mock_address(top))
}

fn sweep_to_the_end(gc: &ConcurrentGC<MockVM>) {
    gc.sweep.setup_for_sweep(gc.vm());
    gc.vm()
        .with_exclusive_access(|| memory_manager::complete_sweep(gc));
}

#[test]
pub fn empty_heap_is_one_free_entry() {
    let gc = mock_gc(16 * CHUNK, test_options());
    gc.sweep.setup_for_sweep(gc.vm());
    assert_eq!(gc.sweep.stats().mode, SweepMode::On);
    assert_eq!(entries(&gc, 0), vec![]);

    gc.sweep.complete_sweeping_concurrently(gc.vm(), &gc.marks);

    let stats = gc.sweep.stats();
    assert_eq!(stats.mode, SweepMode::CompletedSweepConcurrently);
    assert_eq!(stats.total_chunk_count, 16);
    assert_eq!(stats.total_chunk_swept_count, 16);
    assert_eq!(stats.concurrent_complete_sweep_bytes_swept, 16 * CHUNK);

    let pool = &gc.vm().heap.pools()[0];
    assert_eq!(entries(&gc, 0), vec![range(0, 16 * CHUNK)]);
    assert_eq!(pool.actual_free_memory(), 16 * CHUNK);
    assert_eq!(pool.approximate_free_memory(), pool.actual_free_memory());
    assert_eq!(pool.largest_free_entry(), 16 * CHUNK);
    // Nothing completes the sweep twice.
    gc.sweep.complete_sweeping_concurrently(gc.vm(), &gc.marks);
    assert_eq!(gc.sweep.stats().total_chunk_swept_count, 16);
}

#[test]
pub fn object_straddling_a_chunk_boundary() {
    let gc = mock_gc(2 * CHUNK, test_options());
    live(&gc, CHUNK - 24, 64);
    sweep_to_the_end(&gc);

    assert_eq!(
        entries(&gc, 0),
        vec![range(0, CHUNK - 24), range(CHUNK + 40, 2 * CHUNK)]
    );
    let stats = gc.sweep.stats();
    assert_eq!(stats.mode, SweepMode::Off);
    assert_eq!(stats.complete_sweep_phase_bytes_swept, 2 * CHUNK);
    assert_eq!(stats.complete_connect_phase_bytes_connected, 2 * CHUNK);
    assert_eq!(
        gc.vm()
            .hooks
            .count(HookEvent::SweepCompleted(SweepCompletionReason::Requested)),
        1
    );
}

#[test]
pub fn object_spanning_a_whole_chunk() {
    let gc = mock_gc(3 * CHUNK, test_options());
    live(&gc, CHUNK - 24, CHUNK + 64);
    sweep_to_the_end(&gc);

    assert_eq!(
        entries(&gc, 0),
        vec![range(0, CHUNK - 24), range(2 * CHUNK + 40, 3 * CHUNK)]
    );
    assert_eq!(
        gc.vm().heap.pools()[0].actual_free_memory(),
        3 * CHUNK - (CHUNK + 64)
    );
}

#[test]
pub fn small_gaps_are_abandoned() {
    let gc = mock_gc(CHUNK, test_options());
    live(&gc, 0, 64);
    live(&gc, 96, 64); // 32 byte gap
    live(&gc, 1024, 64);
    sweep_to_the_end(&gc);

    let pool = &gc.vm().heap.pools()[0];
    assert_eq!(entries(&gc, 0), vec![range(160, 1024), range(1088, CHUNK)]);
    assert_eq!(pool.abandoned_bytes.load(Ordering::SeqCst), 32);
}

fn random_heap_accounting(sweep_threads: usize) {
    const HEAP: usize = 64 * CHUNK;
    let mut options = test_options();
    options.sweep_threads = sweep_threads;
    let gc = mock_gc(HEAP, options);

    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut objects = vec![];
    let mut offset = 0;
    loop {
        offset += rng.random_range(0..64) * 16;
        let size = rng.random_range(1..256) * 16;
        if offset + size > HEAP {
            break;
        }
        if rng.random_bool(0.5) {
            live(&gc, offset, size);
            objects.push((offset, offset + size));
        }
        offset += size;
    }
    sweep_to_the_end(&gc);

    let pool = &gc.vm().heap.pools()[0];
    let live_bytes: usize = objects.iter().map(|(b, t)| t - b).sum();
    assert_eq!(
        live_bytes + pool.actual_free_memory() + pool.abandoned_bytes.load(Ordering::SeqCst),
        HEAP
    );
    assert_eq!(gc.sweep.stats().total_chunk_swept_count, 64);

    let free = entries(&gc, 0);
    assert!(free.windows(2).all(|w| w[0].1 < w[1].0));
    assert!(free.iter().all(|(b, t)| *t - *b >= 64));
    for (base, top) in free.iter() {
        assert!(gc.marks.next_marked(*base, *top).is_none());
        for (object_base, object_top) in objects.iter() {
            assert!(
                mock_address(*object_top) <= *base || mock_address(*object_base) >= *top,
                "free entry {}..{} overlaps object at {}",
                base,
                top,
                object_base
            );
        }
    }
}

#[test]
pub fn random_heap_accounting_single_thread() {
    random_heap_accounting(1);
}

#[test]
pub fn random_heap_accounting_parallel() {
    random_heap_accounting(4);
}

#[test]
pub fn minimum_free_size_connects_only_what_is_needed() {
    let gc = mock_gc(16 * CHUNK, test_options());
    live(&gc, 0, 1024);
    live(&gc, 2 * CHUNK, 1024);

    // The gap between the two objects is the first entry that fits.
    assert!(gc
        .sweep
        .sweep_for_minimum_size(gc.vm(), &gc.marks, Some(0), CHUNK));
    let stats = gc.sweep.stats();
    assert_eq!(stats.mode, SweepMode::On);
    assert_eq!(stats.minimum_free_entry_bytes_connected, 3 * CHUNK);
    assert_eq!(stats.total_chunk_swept_count, 3);
    assert_eq!(entries(&gc, 0), vec![range(1024, 2 * CHUNK)]);
    assert!(gc.vm().heap.pools()[0].allocate(CHUNK).is_some());

    // The rest comes from allocation.
    assert!(gc
        .sweep
        .replenish_pool_for_allocate(gc.vm(), &gc.marks, 0, 8 * CHUNK));
    assert_eq!(
        entries(&gc, 0).last(),
        Some(&range(2 * CHUNK + 1024, 16 * CHUNK))
    );
}

#[test]
pub fn minimum_free_size_not_found() {
    let gc = mock_gc(4 * CHUNK, test_options());
    live(&gc, CHUNK, 64);
    assert!(!gc
        .sweep
        .sweep_for_minimum_size(gc.vm(), &gc.marks, Some(0), 8 * CHUNK));
    assert_eq!(gc.sweep.stats().total_chunk_swept_count, 4);
    assert_eq!(entries(&gc, 0), vec![range(0, CHUNK), range(CHUNK + 64, 4 * CHUNK)]);
}

#[test]
pub fn pools_of_a_subspace_connect_separately() {
    const HALF: usize = 8 * CHUNK;
    let region = |base: usize, pool: usize| HeapRegion {
        base: mock_address(base),
        top: mock_address(base + HALF),
        pool,
        subspace: 0,
        concurrent_collectible: true,
    };
    let heap = MockHeap::new(
        2 * HALF,
        vec![region(0, 0), region(HALF, 1)],
        vec![MockPool::new(0, true), MockPool::new(1, true)],
    );
    let gc = ConcurrentGC::new(MockVM::new(heap), test_options()).unwrap();
    live(&gc, 1024, 64);

    assert!(gc
        .sweep
        .sweep_for_minimum_size(gc.vm(), &gc.marks, Some(1), CHUNK));
    assert_eq!(entries(&gc, 1), vec![range(HALF, 2 * HALF)]);
    assert_eq!(entries(&gc, 0), vec![]);

    gc.vm()
        .with_exclusive_access(|| memory_manager::complete_sweep(&gc));
    assert_eq!(entries(&gc, 0), vec![range(0, 1024), range(1088, HALF)]);
    assert_eq!(entries(&gc, 1), vec![range(HALF, 2 * HALF)]);
}

#[test]
pub fn sweep_tax_sweeps_without_connecting() {
    let gc = mock_gc(16 * CHUNK, test_options());
    gc.sweep.setup_for_sweep(gc.vm());
    let kickoff_threshold = gc.stats().kickoff_threshold;

    gc.sweep
        .pay_allocation_tax(gc.vm(), &gc.marks, 0, 2 * CHUNK, kickoff_threshold);
    let swept = gc.sweep.stats().total_chunk_swept_count;
    assert!(swept >= 1);
    assert_eq!(entries(&gc, 0), vec![]);

    // Completing concurrently picks up the rest and connects everything.
    gc.sweep.complete_sweeping_concurrently(gc.vm(), &gc.marks);
    let stats = gc.sweep.stats();
    assert_eq!(stats.total_chunk_swept_count, 16);
    assert_eq!(
        stats.concurrent_complete_sweep_bytes_swept,
        (16 - swept) * CHUNK
    );
    assert_eq!(entries(&gc, 0), vec![range(0, 16 * CHUNK)]);
}
