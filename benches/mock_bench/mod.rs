pub mod alloc;
pub mod cycle;

pub use criterion::Criterion;

pub fn bench(c: &mut Criterion) {
    alloc::bench(c);
    cycle::bench(c);
}
