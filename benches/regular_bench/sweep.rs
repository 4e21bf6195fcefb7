//! Benchmarks for sweeping chunks over mark bitmaps of different densities.

use criterion::Criterion;
use gencon::util::mark_bitmap::MarkBitmap;
use gencon::util::test_private::sweep_regions;
use gencon::util::{Address, ObjectReference};
use gencon::vm::{HeapRegion, ObjectModel};
use std::hint::black_box;

const HEAP_START: usize = 0x4000_0000;
const HEAP_SIZE: usize = 64 << 20;
const CHUNK_SIZE: usize = 256 << 10;
const OBJECT_SIZE: usize = 64;

struct FixedSize;

impl ObjectModel for FixedSize {
    fn object_size(&self, _object: ObjectReference) -> usize {
        OBJECT_SIZE
    }
}

/// Mark every `stride`th object of a heap filled with fixed-size objects.
fn marks_with_stride(stride: usize) -> MarkBitmap {
    let start = unsafe { Address::from_usize(HEAP_START) };
    let marks = MarkBitmap::new(start, start + HEAP_SIZE);
    for offset in (0..HEAP_SIZE).step_by(OBJECT_SIZE * stride) {
        if let Some(object) = ObjectReference::from_raw_address(start + offset) {
            marks.mark(object);
        }
    }
    marks
}

pub fn bench(c: &mut Criterion) {
    let start = unsafe { Address::from_usize(HEAP_START) };
    let regions = [HeapRegion {
        base: start,
        top: start + HEAP_SIZE,
        pool: 0,
        subspace: 0,
        concurrent_collectible: true,
    }];

    for (name, stride) in [("sweep_dense", 1), ("sweep_sparse", 64), ("sweep_empty", 0)] {
        let marks = if stride == 0 {
            MarkBitmap::new(start, start + HEAP_SIZE)
        } else {
            marks_with_stride(stride)
        };
        c.bench_function(name, |b| {
            b.iter(|| {
                black_box(sweep_regions(
                    &regions,
                    CHUNK_SIZE,
                    1,
                    &marks,
                    &FixedSize,
                    512,
                ))
            })
        });
    }
}
