use criterion::Criterion;

use gencon::memory_manager;
use gencon::util::test_util::mock_vm::*;
use gencon::AllocationRequest;

pub fn bench(c: &mut Criterion) {
    let mut options = test_options();
    // Only the allocation path itself: no concurrent cycle ever starts.
    options.concurrent_kickoff_enabled = false;
    let gc = memory_manager::gencon_init(MockVM::new(MockHeap::single_pool(1 << 30)), options)
        .unwrap();
    let request = AllocationRequest::new(8, 0);

    c.bench_function("alloc", |b| {
        b.iter(|| {
            let _addr = memory_manager::allocate(&gc, &request);
        })
    });
}
