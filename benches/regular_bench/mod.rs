pub mod sweep;
pub mod tax;

pub use criterion::Criterion;

pub fn bench(c: &mut Criterion) {
    sweep::bench(c);
    tax::bench(c);
}
