//! A side bitmap with one mark bit per minimum-aligned granule of the heap.

use crate::util::address::{Address, ByteSize, ObjectReference};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Objects are aligned to at least this many bytes (log2).
pub const LOG_MIN_OBJECT_ALIGNMENT: usize = 3;
/// Objects are aligned to at least this many bytes.
pub const MIN_OBJECT_ALIGNMENT: usize = 1 << LOG_MIN_OBJECT_ALIGNMENT;

const BITS_IN_WORD: usize = usize::BITS as usize;
const LOG_BITS_IN_WORD: usize = BITS_IN_WORD.trailing_zeros() as usize;
const LOG_BITS_IN_BYTE: usize = 3;

/// Heap bytes covered by one byte of mark bits.
pub const HEAP_BYTES_PER_BITMAP_BYTE: usize = MIN_OBJECT_ALIGNMENT << LOG_BITS_IN_BYTE;

/// The mark bits of the whole heap reservation. Marking is a single atomic `fetch_or`, so any
/// number of tracers can mark concurrently. Range updates are not atomic as a whole and are only
/// done on ranges no tracer can reach yet (initialization) or while the world is stopped.
pub struct MarkBitmap {
    start: Address,
    end: Address,
    words: Vec<AtomicUsize>,
}

impl MarkBitmap {
    /// Create a bitmap covering `[start, end)`. Both must be aligned to the word coverage of the
    /// bitmap, i.e. `MIN_OBJECT_ALIGNMENT * usize::BITS` bytes.
    pub fn new(start: Address, end: Address) -> Self {
        let coverage = MIN_OBJECT_ALIGNMENT * BITS_IN_WORD;
        assert!(
            start.is_aligned_to(coverage) && end.is_aligned_to(coverage),
            "Heap bounds {}..{} are not aligned to {} bytes",
            start,
            end,
            coverage
        );
        let n_words = (end - start) / coverage;
        let mut words = Vec::with_capacity(n_words);
        words.resize_with(n_words, || AtomicUsize::new(0));
        Self { start, end, words }
    }

    /// The number of bitmap bytes that describe `size` bytes of heap.
    pub fn bitmap_bytes_for(size: ByteSize) -> usize {
        size.div_ceil(HEAP_BYTES_PER_BITMAP_BYTE)
    }

    pub fn covers(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    fn bit_index(&self, addr: Address) -> usize {
        (addr - self.start) >> LOG_MIN_OBJECT_ALIGNMENT
    }

    fn address_of(&self, bit: usize) -> Address {
        self.start + (bit << LOG_MIN_OBJECT_ALIGNMENT)
    }

    /// Atomically set the mark bit of `object`. Returns true if this call marked it, false if it
    /// was already marked or lies outside the heap.
    pub fn mark(&self, object: ObjectReference) -> bool {
        let addr = object.to_raw_address();
        if !self.covers(addr) {
            return false;
        }
        let bit = self.bit_index(addr);
        let mask = 1usize << (bit & (BITS_IN_WORD - 1));
        let old = self.words[bit >> LOG_BITS_IN_WORD].fetch_or(mask, Ordering::SeqCst);
        old & mask == 0
    }

    pub fn is_marked(&self, object: ObjectReference) -> bool {
        let addr = object.to_raw_address();
        if !self.covers(addr) {
            return false;
        }
        let bit = self.bit_index(addr);
        let mask = 1usize << (bit & (BITS_IN_WORD - 1));
        self.words[bit >> LOG_BITS_IN_WORD].load(Ordering::SeqCst) & mask != 0
    }

    /// Clear the bits of `[base, top)`.
    pub fn clear_range(&self, base: Address, top: Address) {
        self.update_range(base, top, false);
    }

    /// Set the bits of `[base, top)`. Objects in a range with all bits set look marked, so
    /// tracing never enters them.
    pub fn set_range(&self, base: Address, top: Address) {
        self.update_range(base, top, true);
    }

    fn update_range(&self, base: Address, top: Address, set: bool) {
        debug_assert!(base <= top);
        debug_assert!(base >= self.start && top <= self.end, "{}..{} is outside the bitmap", base, top);
        let first = self.bit_index(base);
        let last = self.bit_index(top);
        let mut bit = first;
        while bit < last {
            let word = bit >> LOG_BITS_IN_WORD;
            let shift = bit & (BITS_IN_WORD - 1);
            let n = usize::min(BITS_IN_WORD - shift, last - bit);
            let mask = if n == BITS_IN_WORD {
                usize::MAX
            } else {
                ((1usize << n) - 1) << shift
            };
            if set {
                self.words[word].fetch_or(mask, Ordering::SeqCst);
            } else {
                self.words[word].fetch_and(!mask, Ordering::SeqCst);
            }
            bit += n;
        }
    }

    /// Find the lowest marked object in `[from, to)`.
    pub fn next_marked(&self, from: Address, to: Address) -> Option<ObjectReference> {
        let to = Address::min(to, self.end);
        if from >= to {
            return None;
        }
        let last = self.bit_index(to.align_up(MIN_OBJECT_ALIGNMENT));
        let mut bit = self.bit_index(from.align_up(MIN_OBJECT_ALIGNMENT));
        while bit < last {
            let word_index = bit >> LOG_BITS_IN_WORD;
            let shift = bit & (BITS_IN_WORD - 1);
            let word = self.words[word_index].load(Ordering::SeqCst) >> shift;
            if word != 0 {
                let found = bit + word.trailing_zeros() as usize;
                if found >= last {
                    return None;
                }
                return ObjectReference::from_raw_address(self.address_of(found));
            }
            bit += BITS_IN_WORD - shift;
        }
        None
    }

    /// Iterate over the marked objects in `[from, to)` in address order.
    pub fn iter_marked(&self, from: Address, to: Address) -> impl Iterator<Item = ObjectReference> + '_ {
        let mut cursor = from;
        std::iter::from_fn(move || {
            let found = self.next_marked(cursor, to)?;
            cursor = found.to_raw_address() + MIN_OBJECT_ALIGNMENT;
            Some(found)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: usize = 0x1000_0000;

    fn addr(offset: usize) -> Address {
        unsafe { Address::from_usize(START + offset) }
    }

    fn obj(offset: usize) -> ObjectReference {
        ObjectReference::from_raw_address(addr(offset)).unwrap()
    }

    fn bitmap() -> MarkBitmap {
        MarkBitmap::new(addr(0), addr(64 * 1024))
    }

    #[test]
    fn mark_once() {
        let bitmap = bitmap();
        assert!(!bitmap.is_marked(obj(64)));
        assert!(bitmap.mark(obj(64)));
        assert!(!bitmap.mark(obj(64)));
        assert!(bitmap.is_marked(obj(64)));
        assert!(!bitmap.is_marked(obj(72)));
    }

    #[test]
    fn outside_heap_is_never_marked() {
        let bitmap = bitmap();
        let outside = ObjectReference::from_raw_address(addr(64 * 1024)).unwrap();
        assert!(!bitmap.mark(outside));
        assert!(!bitmap.is_marked(outside));
    }

    #[test]
    fn set_and_clear_unaligned_ranges() {
        let bitmap = bitmap();
        bitmap.set_range(addr(8), addr(8 * 100));
        assert!(!bitmap.is_marked(obj(0)));
        assert!(bitmap.is_marked(obj(8)));
        assert!(bitmap.is_marked(obj(8 * 99)));
        assert!(!bitmap.is_marked(obj(8 * 100)));

        bitmap.clear_range(addr(8 * 10), addr(8 * 70));
        assert!(bitmap.is_marked(obj(8 * 9)));
        assert!(!bitmap.is_marked(obj(8 * 10)));
        assert!(!bitmap.is_marked(obj(8 * 69)));
        assert!(bitmap.is_marked(obj(8 * 70)));
    }

    #[test]
    fn next_marked_in_range() {
        let bitmap = bitmap();
        bitmap.mark(obj(4096));
        bitmap.mark(obj(8192));
        assert_eq!(bitmap.next_marked(addr(0), addr(64 * 1024)), Some(obj(4096)));
        assert_eq!(bitmap.next_marked(addr(4096), addr(64 * 1024)), Some(obj(4096)));
        assert_eq!(bitmap.next_marked(addr(4104), addr(64 * 1024)), Some(obj(8192)));
        assert_eq!(bitmap.next_marked(addr(4104), addr(8192)), None);
        assert_eq!(bitmap.next_marked(addr(8200), addr(64 * 1024)), None);
    }

    #[test]
    fn iterate_marked() {
        let bitmap = bitmap();
        let offsets = [0, 8, 512, 520, 4096, 60000];
        for o in offsets {
            bitmap.mark(obj(o));
        }
        let found: Vec<_> = bitmap.iter_marked(addr(0), addr(64 * 1024)).collect();
        let expected: Vec<_> = offsets.iter().map(|o| obj(*o)).collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn bitmap_bytes() {
        assert_eq!(MarkBitmap::bitmap_bytes_for(64), 1);
        assert_eq!(MarkBitmap::bitmap_bytes_for(65), 2);
        assert_eq!(MarkBitmap::bitmap_bytes_for(4096), 64);
    }

    #[test]
    fn concurrent_marking_marks_each_object_once() {
        let bitmap = bitmap();
        let winners = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 0..1024 {
                        if bitmap.mark(obj(i * 8)) {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        assert_eq!(winners.load(Ordering::SeqCst), 1024);
    }
}
