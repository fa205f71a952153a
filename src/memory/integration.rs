//! Cross-module integration tests: whole-heap workloads exercising the
//! block layout, free list, region growth, and accounting together.

use super::heap::{Heap, HeapConfig};
use super::region::GROWTH_CHUNK;
use super::stats;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn stress_heap() -> Heap {
    Heap::with_config(HeapConfig {
        reserved_limit: GROWTH_CHUNK * 256,
        initial_size: GROWTH_CHUNK,
    })
    .unwrap()
}

fn assert_consistent(heap: &Heap) {
    let span = heap.heap_end() as usize - heap.heap_start() as usize;
    assert_eq!(
        heap.allocated_bytes() + heap.free_bytes() + heap.overhead_bytes(),
        span,
        "stats identity violated"
    );
}

// Fill an allocation with a byte derived from its slot index so later
// verification catches any cross-allocation scribbling.
fn pattern(slot: usize) -> u8 {
    (slot.wrapping_mul(31) ^ 0x5A) as u8
}

#[test]
fn test_randomized_alloc_free_stress() {
    let _guard = crate::memory::TEST_MUTEX.read().unwrap();
    let mut rng = StdRng::seed_from_u64(0x6EAD_1E7);
    let mut heap = stress_heap();
    let mut live: Vec<(usize, *mut u8, usize)> = Vec::new();

    for round in 0..4_000 {
        let do_alloc = live.is_empty() || rng.gen_range(0..100) < 60;
        if do_alloc {
            let size = match rng.gen_range(0..10) {
                0 => 0,
                1..=6 => rng.gen_range(1..256),
                7..=8 => rng.gen_range(256..4096),
                _ => rng.gen_range(4096..32 * 1024),
            };
            let ptr = heap.alloc(size).unwrap().as_ptr();
            assert!((ptr as usize).is_multiple_of(8));
            // Safety: Test code; `size` bytes are ours.
            unsafe { std::ptr::write_bytes(ptr, pattern(round), size) };
            live.push((round, ptr, size));
        } else {
            let idx = rng.gen_range(0..live.len());
            let (slot, ptr, size) = live.swap_remove(idx);
            // Safety: Test code; the allocation is live and untouched by
            // anything else.
            unsafe {
                for off in 0..size {
                    assert_eq!(
                        ptr.add(off).read(),
                        pattern(slot),
                        "payload of slot {slot} corrupted at offset {off}"
                    );
                }
                heap.free(ptr);
            }
        }
        if round % 256 == 0 {
            assert_consistent(&heap);
            // Allocated capacity covers every live request; the excess is
            // bounded by per-block rounding and no-split slack.
            let live_sum: usize = live.iter().map(|&(_, _, size)| size).sum();
            assert!(heap.allocated_bytes() >= live_sum);
            assert!(heap.allocated_bytes() <= live_sum + live.len() * 64);
        }
    }

    for (slot, ptr, size) in live {
        // Safety: Test code.
        unsafe {
            for off in 0..size {
                assert_eq!(ptr.add(off).read(), pattern(slot));
            }
            heap.free(ptr);
        }
    }
    assert_eq!(heap.allocated_bytes(), 0);
    assert_consistent(&heap);
}

#[test]
fn test_live_allocations_never_overlap() {
    let _guard = crate::memory::TEST_MUTEX.read().unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let mut heap = stress_heap();
    let mut live: Vec<(usize, usize)> = Vec::new(); // (start, end)

    for _ in 0..512 {
        let size = rng.gen_range(1..2048);
        let start = heap.alloc(size).unwrap().as_ptr() as usize;
        let end = start + size;
        for &(s, e) in &live {
            assert!(
                end <= s || start >= e,
                "allocations [{start:#x}, {end:#x}) and [{s:#x}, {e:#x}) overlap"
            );
        }
        assert!(start >= heap.heap_start() as usize && end <= heap.heap_end() as usize);
        live.push((start, end));
    }

    for (start, _) in live {
        // Safety: Test code.
        unsafe { heap.free(start as *mut u8) };
    }
    assert_eq!(heap.allocated_bytes(), 0);
}

#[test]
fn test_fragmentation_then_full_coalesce() {
    let _guard = crate::memory::TEST_MUTEX.read().unwrap();
    let mut heap = stress_heap();

    // Checkerboard: allocate a row of equal blocks, free every other one,
    // then free the rest. Everything must coalesce back into the single
    // heap-spanning block regardless of free order.
    let ptrs: Vec<_> = (0..64).map(|_| heap.alloc(512).unwrap()).collect();
    assert_consistent(&heap);

    // Safety: Test code.
    unsafe {
        for p in ptrs.iter().step_by(2) {
            heap.free(p.as_ptr());
        }
        assert_consistent(&heap);
        for p in ptrs.iter().skip(1).step_by(2) {
            heap.free(p.as_ptr());
        }
    }

    assert_eq!(heap.allocated_bytes(), 0);
    assert_eq!(
        heap.overhead_bytes(),
        super::block::BLOCK_OVERHEAD,
        "heap must coalesce back to a single block"
    );
    assert_consistent(&heap);
}

#[test]
fn test_growth_under_sustained_load() {
    let _guard = crate::memory::TEST_MUTEX.read().unwrap();
    let mut heap = Heap::with_config(HeapConfig {
        reserved_limit: GROWTH_CHUNK * 1024,
        initial_size: GROWTH_CHUNK,
    })
    .unwrap();
    let start = heap.heap_start();

    // Hold many large allocations at once to force repeated growth.
    let ptrs: Vec<_> = (0..64)
        .map(|i| {
            let ptr = heap.alloc(GROWTH_CHUNK / 2).unwrap();
            // Safety: Test code.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), i as u8, GROWTH_CHUNK / 2) };
            ptr
        })
        .collect();
    assert_eq!(heap.heap_start(), start, "growth must not move the heap");
    assert_consistent(&heap);

    for (i, ptr) in ptrs.iter().enumerate() {
        // Safety: Test code.
        unsafe {
            assert_eq!(ptr.as_ptr().read(), i as u8);
            assert_eq!(ptr.as_ptr().add(GROWTH_CHUNK / 2 - 1).read(), i as u8);
            heap.free(ptr.as_ptr());
        }
    }
    assert_eq!(heap.allocated_bytes(), 0);
    assert_consistent(&heap);
}

#[test]
fn test_heap_drop_returns_vm_accounting() {
    let _guard = crate::memory::TEST_MUTEX.write().unwrap();
    let reserved_before = stats::TOTAL_RESERVED.get();
    let committed_before = stats::TOTAL_COMMITTED.get();

    {
        let mut heap = stress_heap();
        let ptr = heap.alloc(GROWTH_CHUNK * 2).unwrap();
        assert!(stats::TOTAL_COMMITTED.get() > committed_before);
        // Safety: Test code.
        unsafe { heap.free(ptr.as_ptr()) };
    }

    assert_eq!(stats::TOTAL_RESERVED.get(), reserved_before);
    assert_eq!(stats::TOTAL_COMMITTED.get(), committed_before);
}

#[test]
fn test_global_heap_shared_across_threads() {
    use super::heap::GlobalHeap;

    let _guard = crate::memory::TEST_MUTEX.read().unwrap();
    GlobalHeap::init();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                for _ in 0..200 {
                    let size = rng.gen_range(1..1024);
                    let ptr = GlobalHeap::alloc(size).unwrap();
                    // Safety: Test code; this thread owns the allocation.
                    unsafe {
                        std::ptr::write_bytes(ptr.as_ptr(), t as u8, size);
                        assert_eq!(ptr.as_ptr().add(size - 1).read(), t as u8);
                        GlobalHeap::free(ptr.as_ptr());
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = GlobalHeap::stats().expect("global heap is initialized");
    assert_eq!(
        stats.allocated_bytes + stats.free_bytes + stats.overhead_bytes,
        stats.committed_bytes,
        "global stats identity violated"
    );
}
