//! Heap behavior over arbitrary operation sequences and many threads

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use typthon_thunks::arch::Untagged;
use typthon_thunks::{
    BlockSource, InMemoryProvider, RegionArrangement, ThunkAddress, ThunkData, ThunkError,
    ThunkHeap, ThunkLayout,
};

type TestHeap = ThunkHeap<InMemoryProvider<Untagged>>;

const N: usize = 8;

fn heap_with(blocks: usize, arrangement: RegionArrangement, budget: Option<usize>) -> TestHeap {
    let layout = ThunkLayout::new(16, N, blocks, arrangement).unwrap();
    let mut provider = InMemoryProvider::<Untagged>::with_tag(layout);
    if let Some(mappings) = budget {
        provider = provider.with_budget(mappings);
    }
    ThunkHeap::with_source(Arc::new(BlockSource::new(provider)), 0x5EED).unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    /// Free the live thunk at this index (modulo the live count)
    Free(usize),
    Set(usize, usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Free),
        2 => (any::<usize>(), any::<usize>(), any::<usize>()).prop_map(|(i, c, t)| Op::Set(i, c, t)),
    ]
}

proptest! {
    #[test]
    fn matches_lifo_model(
        ops in prop::collection::vec(op(), 1..200),
        interleaved in any::<bool>(),
    ) {
        let arrangement = if interleaved {
            RegionArrangement::Interleaved
        } else {
            RegionArrangement::Split
        };
        let heap = heap_with(2, arrangement, None);

        let mut live: Vec<ThunkAddress> = Vec::new();
        let mut data: HashMap<ThunkAddress, ThunkData> = HashMap::new();
        let mut freed: Vec<ThunkAddress> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate => {
                    let thunk = heap.allocate().unwrap();
                    prop_assert!(!live.contains(&thunk), "{:?} handed out twice", thunk);
                    prop_assert!(heap.is_thunk_in_heap(thunk));
                    if let Some(expected) = freed.pop() {
                        prop_assert_eq!(thunk, expected);
                    }
                    live.push(thunk);
                }
                Op::Free(index) if !live.is_empty() => {
                    let thunk = live.swap_remove(index % live.len());
                    data.remove(&thunk);
                    unsafe { heap.free_thunk(thunk) };
                    freed.push(thunk);
                }
                Op::Set(index, context, target) if !live.is_empty() => {
                    let thunk = live[index % live.len()];
                    unsafe { heap.set_thunk_data(thunk, context, target) };
                    data.insert(thunk, ThunkData { context, target });
                }
                _ => {}
            }
        }

        for (thunk, expected) in &data {
            prop_assert_eq!(heap.try_get_thunk_data(*thunk), Some(*expected));
        }

        let stats = heap.stats();
        prop_assert_eq!(stats.allocated, live.len());
        prop_assert_eq!(stats.capacity, stats.blocks * N);
        prop_assert!(stats.capacity >= live.len());
    }

    #[test]
    fn grows_only_when_exhausted(count in 1usize..(6 * N)) {
        let heap = heap_with(3, RegionArrangement::Split, None);
        for _ in 0..count {
            heap.allocate().unwrap();
        }
        prop_assert_eq!(heap.stats().blocks, (count + N - 1) / N);
    }

    #[test]
    fn foreign_addresses_are_rejected(offset in 1usize..4096, raw in 1usize..=usize::MAX) {
        let heap = heap_with(1, RegionArrangement::Split, None);
        let other = heap_with(1, RegionArrangement::Split, None);
        let thunk = heap.allocate().unwrap();

        prop_assert!(!other.is_thunk_in_heap(thunk));
        prop_assert_eq!(other.try_get_thunk_data(thunk), None);

        // Anything that is not one of this heap's stub slots reads as foreign
        let shifted = ThunkAddress::from_raw(thunk.as_usize().wrapping_add(offset)).unwrap();
        let in_span = shifted.as_usize() % 16 == 0
            && shifted.as_usize() & !(heap.layout().page_size() - 1)
                == thunk.as_usize() & !(heap.layout().page_size() - 1)
            && (shifted.as_usize() & (heap.layout().page_size() - 1)) < heap.layout().block_code_span();
        if !in_span {
            prop_assert_eq!(heap.try_get_thunk_data(shifted), None);
        }

        let arbitrary = ThunkAddress::from_raw(raw).unwrap();
        if !heap.is_thunk_in_heap(arbitrary) {
            prop_assert_eq!(heap.try_get_thunk_data(arbitrary), None);
        }
    }
}

const THREADS: usize = 8;
const CYCLES: usize = 500;

/// Allocate/free churn for one worker, ending with `id % 4` thunks still held
///
/// Every address handed out is recorded in `outstanding` until it is freed.
fn churn(
    heap: &TestHeap,
    id: usize,
    outstanding: &Mutex<HashSet<ThunkAddress>>,
) -> Vec<(ThunkAddress, ThunkData)> {
    let mut held = Vec::new();
    for cycle in 0..CYCLES {
        let thunk = heap.allocate().unwrap();
        assert!(outstanding.lock().insert(thunk), "{:?} handed out twice", thunk);
        unsafe { heap.set_thunk_data(thunk, id, cycle) };
        held.push((thunk, cycle));

        // Hold a few at a time so threads contend on growth too
        if held.len() == 3 {
            for (thunk, cycle) in held.drain(..) {
                assert_eq!(
                    heap.try_get_thunk_data(thunk),
                    Some(ThunkData { context: id, target: cycle })
                );
                outstanding.lock().remove(&thunk);
                unsafe { heap.free_thunk(thunk) };
            }
        }
    }
    for (thunk, _) in held {
        outstanding.lock().remove(&thunk);
        unsafe { heap.free_thunk(thunk) };
    }

    (0..id % 4)
        .map(|k| {
            let thunk = heap.allocate().unwrap();
            assert!(outstanding.lock().insert(thunk), "{:?} handed out twice", thunk);
            let data = ThunkData { context: id, target: CYCLES + k };
            unsafe { heap.set_thunk_data(thunk, data.context, data.target) };
            (thunk, data)
        })
        .collect()
}

#[test]
fn concurrent_churn_matches_sequential_run() {
    let heap = heap_with(4, RegionArrangement::Interleaved, None);
    let outstanding = Mutex::new(HashSet::new());
    let kept = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for id in 0..THREADS {
            let heap = &heap;
            let outstanding = &outstanding;
            let kept = &kept;
            scope.spawn(move || {
                let mine = churn(heap, id, outstanding);
                kept.lock().extend(mine);
            });
        }
    });

    // Same workers, one after another
    let reference = heap_with(4, RegionArrangement::Interleaved, None);
    let reference_outstanding = Mutex::new(HashSet::new());
    let reference_kept: Vec<_> = (0..THREADS)
        .flat_map(|id| churn(&reference, id, &reference_outstanding))
        .collect();

    let kept = kept.into_inner();
    let outstanding = outstanding.into_inner();
    assert_eq!(kept.len(), reference_kept.len());
    assert_eq!(outstanding.len(), kept.len());
    assert_eq!(reference_outstanding.into_inner().len(), reference_kept.len());

    let stats = heap.stats();
    assert_eq!(stats.allocated, kept.len());
    assert_eq!(stats.allocated, reference.stats().allocated);
    assert_eq!(stats.free, stats.capacity - kept.len());

    for (thunk, data) in &kept {
        assert!(outstanding.contains(thunk));
        assert!(heap.is_thunk_in_heap(*thunk));
        assert_eq!(heap.try_get_thunk_data(*thunk), Some(*data));
    }

    let mut by_worker: Vec<_> = kept.iter().map(|(_, d)| (d.context, d.target)).collect();
    let mut expected: Vec<_> = reference_kept.iter().map(|(_, d)| (d.context, d.target)).collect();
    by_worker.sort_unstable();
    expected.sort_unstable();
    assert_eq!(by_worker, expected);

    // At most three thunks per worker are ever held at once
    assert!(stats.capacity <= (THREADS * 3).div_ceil(N) * N + N);
}

#[test]
fn concurrent_heaps_share_one_source() {
    let layout = ThunkLayout::new(16, N, 4, RegionArrangement::Split).unwrap();
    let source = Arc::new(BlockSource::new(InMemoryProvider::<Untagged>::with_tag(layout)));
    let all = Mutex::new(HashSet::new());

    std::thread::scope(|scope| {
        for _ in 0..6 {
            let source = Arc::clone(&source);
            let all = &all;
            scope.spawn(move || {
                let heap = ThunkHeap::with_source(source, 0x5EED).unwrap();
                for _ in 0..3 * N {
                    let thunk = heap.allocate().unwrap();
                    assert!(all.lock().insert(thunk.as_usize()));
                }
            });
        }
    });

    assert_eq!(all.lock().len(), 6 * 3 * N);
    assert_eq!(source.blocks_issued(), 6 * 3);
}

#[test]
fn out_of_memory_surfaces_from_allocate() {
    // One mapping of one block pair, then nothing
    let heap = heap_with(1, RegionArrangement::Split, Some(1));
    for _ in 0..N {
        heap.allocate().unwrap();
    }
    assert_eq!(heap.allocate(), Err(ThunkError::OutOfMemory));
    assert_eq!(heap.stats().allocated, N);
}
