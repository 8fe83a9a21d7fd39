//! Integration tests for SlotAllocator.

use std::sync::Arc;
use std::thread;

use kvserve::core::prefix_cache::FifoPrefixCache;
use kvserve::core::slot_allocator::SlotAllocator;
use kvserve::Error;

#[test]
fn test_deterministic_reuse() {
    let allocator = SlotAllocator::new(10);
    assert_eq!(allocator.alloc(4).unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(allocator.alloc(3).unwrap(), vec![4, 5, 6]);
    allocator.free(&[4, 5]).unwrap();
    assert_eq!(allocator.alloc(2).unwrap(), vec![4, 5]);
}

#[test]
fn test_out_of_slots_allocates_nothing() {
    let allocator = SlotAllocator::new(4);
    allocator.alloc(3).unwrap();
    let err = allocator.alloc(2).unwrap_err();
    assert!(matches!(err, Error::OutOfSlots { requested: 2, available: 1 }));
    assert_eq!(allocator.num_free(), 1);
    assert!(allocator.can_allocate(1));
    assert!(!allocator.can_allocate(2));
}

#[test]
fn test_double_free_leaves_pool_unchanged() {
    let allocator = SlotAllocator::new(8);
    let slots = allocator.alloc(3).unwrap();
    allocator.free(&slots[..1]).unwrap();
    let err = allocator.free(&slots).unwrap_err();
    assert!(matches!(err, Error::DoubleFree(0)));
    assert_eq!(allocator.num_allocated(), 2);
}

#[test]
fn test_conservation_under_mixed_traffic() {
    let allocator = SlotAllocator::new(64);
    let mut held = Vec::new();
    for round in 0..20 {
        let n = 1 + round % 5;
        if allocator.can_allocate(n) {
            held.push(allocator.alloc(n).unwrap());
        }
        if round % 3 == 0 && !held.is_empty() {
            let slots = held.remove(0);
            allocator.free(&slots).unwrap();
        }
        let live: usize = held.iter().map(Vec::len).sum();
        assert_eq!(allocator.num_allocated(), live);
        assert_eq!(allocator.num_free() + allocator.num_allocated(), 64);
    }
}

#[test]
fn test_eviction_makes_room() {
    let allocator = SlotAllocator::with_prefix_cache(6, Box::new(FifoPrefixCache::new()));
    let slots = allocator.alloc(4).unwrap();
    allocator.retain_in_prefix_cache(&[1, 2, 3, 4], slots).unwrap();
    assert_eq!(allocator.num_free(), 2);

    assert_eq!(allocator.alloc(5).unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(allocator.num_free(), 1);
}

#[test]
fn test_eviction_insufficient_fails_whole_request() {
    let allocator = SlotAllocator::with_prefix_cache(6, Box::new(FifoPrefixCache::new()));
    let held = allocator.alloc(3).unwrap();
    let cached = allocator.alloc(2).unwrap();
    allocator.retain_in_prefix_cache(&[1, 2], cached).unwrap();

    let err = allocator.alloc(4).unwrap_err();
    assert!(matches!(err, Error::OutOfSlots { requested: 4, .. }));
    allocator.free(&held).unwrap();
    assert_eq!(allocator.alloc(4).unwrap().len(), 4);
}

#[test]
fn test_concurrent_alloc_free() {
    let allocator = Arc::new(SlotAllocator::new(256));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                for _ in 0..100 {
                    let slots = allocator.alloc(8).unwrap();
                    allocator.free(&slots).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(allocator.num_free(), 256);
}

#[test]
fn test_free_all_resets() {
    let allocator = SlotAllocator::new(8);
    allocator.alloc(5).unwrap();
    allocator.free_all();
    assert_eq!(allocator.num_free(), 8);
    assert_eq!(allocator.alloc(2).unwrap(), vec![0, 1]);
}
