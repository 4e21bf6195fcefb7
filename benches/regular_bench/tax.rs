use criterion::Criterion;
use gencon::util::options::Options;
use gencon::util::test_private::TunedTax;
use std::hint::black_box;

const HEAP_SIZE: usize = 256 << 20;

pub fn bench(c: &mut Criterion) {
    let tax = TunedTax::new(&Options::default(), HEAP_SIZE);
    let threshold = tax.kickoff_threshold();
    // Sample the whole range in which a cycle runs.
    let remaining: Vec<usize> = (1..=64).map(|i| threshold / 64 * i).collect();

    c.bench_function("trace_size_for", |b| {
        b.iter(|| {
            let mut total = 0usize;
            for free in remaining.iter() {
                total = total.wrapping_add(tax.trace_size_for(black_box(4096), *free));
            }
            black_box(total)
        })
    });
}
