//! Benchmarks for the allocation tax while a concurrent cycle is running.

use criterion::{BatchSize, Criterion};
use gencon::memory_manager;
use gencon::util::test_util::mock_vm::*;
use gencon::util::ObjectReference;
use gencon::{AllocationRequest, ConcurrentGC};
use std::sync::Arc;

const HEAP_SIZE: usize = 16 << 20;
const OBJECTS: usize = 4096;

/// A collector whose heap holds a tree of `OBJECTS` objects, reachable from one root.
fn gc_with_tree() -> Arc<ConcurrentGC<MockVM>> {
    let gc = memory_manager::gencon_init(MockVM::new(MockHeap::single_pool(HEAP_SIZE)), test_options())
        .unwrap();
    let vm = gc.vm();
    let objects: Vec<ObjectReference> = (0..OBJECTS).map(|i| vm.object(i * 256, 128)).collect();
    for (i, object) in objects.iter().enumerate().skip(1) {
        vm.objects.add_reference(objects[(i - 1) / 2], *object);
    }
    vm.objects.set_phase_roots(vec![vec![objects[0]]]);
    gc
}

pub fn bench(c: &mut Criterion) {
    c.bench_function("concurrent_cycle", |b| {
        b.iter_batched(
            gc_with_tree,
            |gc| {
                memory_manager::force_kickoff(&gc);
                let request = AllocationRequest::new(256, 0);
                while memory_manager::collector_stats(&gc).completed_cycles == 0 {
                    memory_manager::pay_allocation_tax(&gc, &request);
                }
                gc
            },
            BatchSize::SmallInput,
        )
    });

    let gc = gc_with_tree();
    let request = AllocationRequest::new(256, 0);
    c.bench_function("pay_allocation_tax_idle", |b| {
        b.iter(|| memory_manager::pay_allocation_tax(&gc, &request))
    });
}
