//! An in-memory runtime for tests and benchmarks.
//!
//! The heap is never touched: objects are addresses with a size and a list of references kept
//! in a table, and free lists are ordered lists of ranges. This is enough to drive every
//! scheduling decision of the collector.

use crate::concurrent::{AbortReason, ConcurrentGC, ExecutionMode, HelperThreadContext};
use crate::global_state::CollectorStats;
use crate::sweep::SweepCompletionReason;
use crate::util::options::Options;
use crate::util::{Address, ObjectReference};
use crate::vm::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

/// Start of the reserved range of every mock heap. Aligned to what the mark bitmap requires.
pub const MOCK_HEAP_START: usize = 0x1000_0000;

pub fn mock_address(offset: usize) -> Address {
    unsafe { Address::from_usize(MOCK_HEAP_START + offset) }
}

pub fn mock_object(offset: usize) -> ObjectReference {
    ObjectReference::from_raw_address(mock_address(offset)).unwrap()
}

struct FreeList {
    entries: VecDeque<(Address, Address)>,
    actual: usize,
}

/// A first-fit free list.
pub struct MockPool {
    subspace: SubspaceId,
    collectible: bool,
    free: Mutex<FreeList>,
    /// Free memory the sweep has not connected yet.
    unconnected: AtomicUsize,
    largest_free_entry: AtomicUsize,
    pub abandoned_bytes: AtomicUsize,
    pub entries_created: AtomicUsize,
}

impl MockPool {
    pub fn new(subspace: SubspaceId, collectible: bool) -> Self {
        Self {
            subspace,
            collectible,
            free: Mutex::new(FreeList {
                entries: VecDeque::new(),
                actual: 0,
            }),
            unconnected: AtomicUsize::new(0),
            largest_free_entry: AtomicUsize::new(0),
            abandoned_bytes: AtomicUsize::new(0),
            entries_created: AtomicUsize::new(0),
        }
    }

    pub fn free_entries(&self) -> Vec<(Address, Address)> {
        self.free.lock().unwrap().entries.iter().copied().collect()
    }

    pub fn largest_free_entry(&self) -> usize {
        self.largest_free_entry.load(Ordering::SeqCst)
    }

    /// Pretend `bytes` of the pool were allocated by somebody else.
    pub fn consume(&self, bytes: usize) {
        let mut free = self.free.lock().unwrap();
        let mut left = bytes;
        while left > 0 {
            let Some((base, top)) = free.entries.pop_front() else {
                break;
            };
            let taken = usize::min(left, top - base);
            if base + taken < top {
                free.entries.push_front((base + taken, top));
            }
            free.actual -= taken;
            left -= taken;
        }
    }
}

impl MemoryPool for MockPool {
    fn subspace(&self) -> SubspaceId {
        self.subspace
    }

    fn concurrent_collectible(&self) -> bool {
        self.collectible
    }

    fn allocate(&self, size: usize) -> Option<Address> {
        let mut free = self.free.lock().unwrap();
        let index = free.entries.iter().position(|(b, t)| *t - *b >= size)?;
        let (base, top) = free.entries[index];
        if top - base == size {
            free.entries.remove(index);
        } else {
            free.entries[index] = (base + size, top);
        }
        free.actual -= size;
        Some(base)
    }

    fn approximate_free_memory(&self) -> usize {
        self.actual_free_memory() + self.unconnected.load(Ordering::SeqCst)
    }

    fn set_approximate_free_memory(&self, bytes: usize) {
        self.unconnected.store(bytes, Ordering::SeqCst);
    }

    fn actual_free_memory(&self) -> usize {
        self.free.lock().unwrap().actual
    }

    fn reset_free_list(&self) {
        let mut free = self.free.lock().unwrap();
        free.entries.clear();
        free.actual = 0;
    }

    fn create_free_entry(&self, base: Address, top: Address) {
        let mut free = self.free.lock().unwrap();
        if let Some(&(_, last_top)) = free.entries.back() {
            assert!(last_top <= base, "free entry {}..{} out of order", base, top);
        }
        free.entries.push_back((base, top));
        free.actual += top - base;
        self.entries_created.fetch_add(1, Ordering::SeqCst);
    }

    fn abandon_heap_chunk(&self, base: Address, top: Address) {
        self.abandoned_bytes.fetch_add(top - base, Ordering::SeqCst);
    }

    fn set_largest_free_entry(&self, size: usize) {
        self.largest_free_entry.store(size, Ordering::SeqCst);
    }
}

pub struct MockHeap {
    bounds: (Address, Address),
    regions: RwLock<Vec<HeapRegion>>,
    pools: Vec<MockPool>,
}

impl MockHeap {
    /// A heap of `reserved` bytes with the given regions. Every region's pool must be in
    /// `pools`. Free lists start empty.
    pub fn new(reserved: usize, regions: Vec<HeapRegion>, pools: Vec<MockPool>) -> Self {
        Self {
            bounds: (mock_address(0), mock_address(reserved)),
            regions: RwLock::new(regions),
            pools,
        }
    }

    /// One collectible region of `size` bytes owned by pool 0, entirely free.
    pub fn single_pool(size: usize) -> Self {
        let heap = Self::new(
            size,
            vec![HeapRegion {
                base: mock_address(0),
                top: mock_address(size),
                pool: 0,
                subspace: 0,
                concurrent_collectible: true,
            }],
            vec![MockPool::new(0, true)],
        );
        heap.pools[0].create_free_entry(mock_address(0), mock_address(size));
        heap
    }

    pub fn add_region(&self, region: HeapRegion) {
        let mut regions = self.regions.write().unwrap();
        regions.push(region);
        regions.sort_by_key(|r| r.base);
    }

    pub fn remove_region(&self, base: Address) {
        self.regions.write().unwrap().retain(|r| r.base != base);
    }
}

impl Heap for MockHeap {
    type Pool = MockPool;

    fn heap_bounds(&self) -> (Address, Address) {
        self.bounds
    }

    fn regions(&self) -> Vec<HeapRegion> {
        self.regions.read().unwrap().clone()
    }

    fn pools(&self) -> &[MockPool] {
        &self.pools
    }
}

/// The object table, the roots and the card table of the mock runtime.
#[derive(Default)]
pub struct MockObjects {
    sizes: RwLock<HashMap<ObjectReference, usize>>,
    references: RwLock<HashMap<ObjectReference, Vec<ObjectReference>>>,
    /// Roots reported by each root-tracing phase, phase 1 first.
    phase_roots: RwLock<Vec<Vec<ObjectReference>>>,
    thread_roots: RwLock<Vec<ObjectReference>>,
    /// Objects written to while the barrier was active.
    dirty: Mutex<Vec<ObjectReference>>,
    pub cleared_card_bytes: AtomicUsize,
}

impl MockObjects {
    pub fn add_object(&self, object: ObjectReference, size: usize) {
        self.sizes.write().unwrap().insert(object, size);
    }

    pub fn add_reference(&self, from: ObjectReference, to: ObjectReference) {
        self.references
            .write()
            .unwrap()
            .entry(from)
            .or_default()
            .push(to);
    }

    /// A reference store seen by the write barrier: record it and dirty the card.
    pub fn write_reference(&self, from: ObjectReference, to: ObjectReference) {
        self.add_reference(from, to);
        self.dirty.lock().unwrap().push(from);
    }

    pub fn set_phase_roots(&self, phases: Vec<Vec<ObjectReference>>) {
        *self.phase_roots.write().unwrap() = phases;
    }

    pub fn set_thread_roots(&self, roots: Vec<ObjectReference>) {
        *self.thread_roots.write().unwrap() = roots;
    }

    pub fn thread_roots(&self) -> Vec<ObjectReference> {
        self.thread_roots.read().unwrap().clone()
    }

    pub fn dirty_cards(&self) -> usize {
        self.dirty.lock().unwrap().len()
    }

    fn size_of(&self, object: ObjectReference) -> usize {
        self.sizes
            .read()
            .unwrap()
            .get(&object)
            .copied()
            .unwrap_or(DEFAULT_OBJECT_ALIGNMENT)
    }
}

impl ObjectModel for MockObjects {
    fn object_size(&self, object: ObjectReference) -> usize {
        self.size_of(object)
    }
}

impl Scanning for MockObjects {
    fn root_tracing_phases(&self) -> u8 {
        self.phase_roots.read().unwrap().len() as u8
    }

    fn scan_roots<V: ObjectVisitor>(&self, phase: u8, visitor: &mut V) -> bool {
        let phases = self.phase_roots.read().unwrap();
        let roots = &phases[phase as usize - 1];
        for root in roots.iter() {
            visitor.visit_object(*root);
        }
        !roots.is_empty()
    }

    fn scan_thread_roots<V: ObjectVisitor>(&self, visitor: &mut V) {
        for root in self.thread_roots.read().unwrap().iter() {
            visitor.visit_object(*root);
        }
    }

    fn scan_object<V: ObjectVisitor>(&self, object: ObjectReference, visitor: &mut V) -> usize {
        let references = self.references.read().unwrap();
        for child in references.get(&object).into_iter().flatten() {
            visitor.visit_object(*child);
        }
        self.size_of(object)
    }

    fn clear_cards(&self, base: Address, top: Address) {
        self.cleared_card_bytes.fetch_add(top - base, Ordering::SeqCst);
    }

    fn clean_cards<V: ObjectVisitor>(&self, budget: usize, visitor: &mut V) -> CardCleaningProgress {
        let mut cleaned = 0;
        loop {
            let next = {
                let mut dirty = self.dirty.lock().unwrap();
                if cleaned >= budget {
                    break;
                }
                dirty.pop()
            };
            let Some(object) = next else {
                break;
            };
            cleaned += self.scan_object(object, visitor);
        }
        CardCleaningProgress {
            bytes_cleaned: cleaned,
            complete: self.dirty.lock().unwrap().is_empty(),
        }
    }

    fn final_clean_cards<V: ObjectVisitor>(&self, visitor: &mut V) -> usize {
        let dirty: Vec<_> = self.dirty.lock().unwrap().drain(..).collect();
        dirty
            .into_iter()
            .map(|object| self.scan_object(object, visitor))
            .sum()
    }
}

#[derive(Default)]
struct ExclusiveAccess {
    held: bool,
    waiting: usize,
}

#[derive(Default)]
pub struct MockCollection {
    exclusive: Mutex<ExclusiveAccess>,
    released: Condvar,
    pub barrier_active: AtomicBool,
    pub barrier_activations: AtomicUsize,
    pub stack_scan_requests: AtomicUsize,
    pub barrier_callback_requests: AtomicUsize,
    pub out_of_memory_calls: AtomicUsize,
    pub collections: Mutex<Vec<CollectionReason>>,
    /// Make `spawn_helper_thread` fail.
    pub fail_helper_spawn: AtomicBool,
}

impl MockCollection {
    pub fn is_exclusive_access_held(&self) -> bool {
        self.exclusive.lock().unwrap().held
    }
}

impl Collection<MockVM> for MockCollection {
    fn is_exclusive_access_requested(&self) -> bool {
        let exclusive = self.exclusive.lock().unwrap();
        exclusive.held || exclusive.waiting > 0
    }

    fn acquire_exclusive_access(&self) {
        let mut exclusive = self.exclusive.lock().unwrap();
        exclusive.waiting += 1;
        while exclusive.held {
            exclusive = self.released.wait(exclusive).unwrap();
        }
        exclusive.waiting -= 1;
        exclusive.held = true;
    }

    fn release_exclusive_access(&self) {
        let mut exclusive = self.exclusive.lock().unwrap();
        assert!(exclusive.held, "exclusive access is not held");
        exclusive.held = false;
        self.released.notify_all();
    }

    fn activate_write_barrier(&self) {
        assert!(self.is_exclusive_access_held());
        self.barrier_active.store(true, Ordering::SeqCst);
        self.barrier_activations.fetch_add(1, Ordering::SeqCst);
    }

    fn deactivate_write_barrier(&self) {
        self.barrier_active.store(false, Ordering::SeqCst);
    }

    fn signal_threads_to_trace_stacks(&self) {
        self.stack_scan_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn request_barrier_callback(&self) {
        self.barrier_callback_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn collect_garbage(&self, reason: CollectionReason) {
        self.collections.lock().unwrap().push(reason);
    }

    fn spawn_helper_thread(&self, ctx: HelperThreadContext<MockVM>) -> std::io::Result<()> {
        if self.fail_helper_spawn.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "helper threads disabled",
            ));
        }
        std::thread::Builder::new()
            .name(format!("mock-helper-{}", ctx.ordinal()))
            .spawn(move || ctx.run())
            .map(|_| ())
    }

    fn out_of_memory(&self, _size: usize) {
        self.out_of_memory_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// An event reported to [`MockHooks`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Kickoff,
    ModeSwitch(ExecutionMode, ExecutionMode),
    Abort(AbortReason),
    HelperActivated(usize),
    HelperDeactivated(usize),
    FinalCollection,
    SweepCompleted(SweepCompletionReason),
}

#[derive(Default)]
pub struct MockHooks {
    events: Mutex<Vec<HookEvent>>,
    final_collection_stats: Mutex<Option<CollectorStats>>,
}

impl MockHooks {
    /// The statistics reported at the last final collection. The per-cycle counters are reset
    /// once the collection completes, so this is where a test can still read them.
    pub fn final_collection_stats(&self) -> Option<CollectorStats> {
        *self.final_collection_stats.lock().unwrap()
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    /// The execution modes entered so far, in order.
    pub fn modes(&self) -> Vec<ExecutionMode> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HookEvent::ModeSwitch(_, to) => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: HookEvent) -> usize {
        self.events().into_iter().filter(|e| *e == event).count()
    }

    fn record(&self, event: HookEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl EventHooks for MockHooks {
    fn on_kickoff(&self, _stats: &CollectorStats) {
        self.record(HookEvent::Kickoff);
    }

    fn on_mode_switch(&self, from: ExecutionMode, to: ExecutionMode) {
        self.record(HookEvent::ModeSwitch(from, to));
    }

    fn on_abort(&self, reason: AbortReason, _stats: &CollectorStats) {
        self.record(HookEvent::Abort(reason));
    }

    fn on_helper_activated(&self, ordinal: usize) {
        self.record(HookEvent::HelperActivated(ordinal));
    }

    fn on_helper_deactivated(&self, ordinal: usize, _traced: usize) {
        self.record(HookEvent::HelperDeactivated(ordinal));
    }

    fn on_final_collection(&self, stats: &CollectorStats) {
        *self.final_collection_stats.lock().unwrap() = Some(*stats);
        self.record(HookEvent::FinalCollection);
    }

    fn on_sweep_completed(&self, reason: SweepCompletionReason) {
        self.record(HookEvent::SweepCompleted(reason));
    }
}

pub struct MockVM {
    pub heap: MockHeap,
    pub objects: MockObjects,
    pub collection: MockCollection,
    pub hooks: MockHooks,
}

impl MockVM {
    pub fn new(heap: MockHeap) -> Self {
        Self {
            heap,
            objects: MockObjects::default(),
            collection: MockCollection::default(),
            hooks: MockHooks::default(),
        }
    }

    /// Register an object of `size` bytes at `offset` from the heap start.
    pub fn object(&self, offset: usize, size: usize) -> ObjectReference {
        let object = mock_object(offset);
        self.objects.add_object(object, size);
        object
    }

    /// Run `f` with exclusive access held.
    pub fn with_exclusive_access<R>(&self, f: impl FnOnce() -> R) -> R {
        self.collection.acquire_exclusive_access();
        let result = f();
        self.collection.release_exclusive_access();
        result
    }
}

impl VMBinding for MockVM {
    type VMHeap = MockHeap;
    type VMObjectModel = MockObjects;
    type VMScanning = MockObjects;
    type VMCollection = MockCollection;
    type VMHooks = MockHooks;

    fn heap(&self) -> &MockHeap {
        &self.heap
    }

    fn object_model(&self) -> &MockObjects {
        &self.objects
    }

    fn scanning(&self) -> &MockObjects {
        &self.objects
    }

    fn collection(&self) -> &MockCollection {
        &self.collection
    }

    fn hooks(&self) -> &MockHooks {
        &self.hooks
    }
}

/// Options for deterministic tests: no helper threads, a single sweep thread, small chunks.
pub fn test_options() -> Options {
    let mut options = Options::default();
    options.concurrent_helper_threads = 0;
    options.sweep_threads = 1;
    options.sweep_chunk_size = 4096;
    options.min_free_entry_size = 64;
    options.init_chunk_size = 1024;
    options
}

/// A collector over a single collectible pool of `heap_size` bytes.
pub fn mock_gc(heap_size: usize, options: Options) -> ConcurrentGC<MockVM> {
    ConcurrentGC::new(MockVM::new(MockHeap::single_pool(heap_size)), options).unwrap()
}
