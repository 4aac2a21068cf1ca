//! Stress tests for the reference-counted pointers.
//!
//! Handles to one control block are cloned, upgraded and dropped from many
//! threads at once; the counting allocator then proves every block came back.
//!
//! Run with: `cargo test -p tau-mem --test refcount -- --nocapture`

mod common;

use common::DropCounter;
use std::sync::Barrier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tau_mem::alloc::{CountingAllocator, GuardedAllocator, HeapAllocator};
use tau_mem::rc::Rcp;
use tau_mem::sw::{StrongRcp, WeakRcp};

const THREADS: usize = 8;
const ROUNDS: usize = 10_000;

// ============================================================================
// Rcp
// ============================================================================

#[test]
fn test_rcp_clone_drop_race() {
    static ALLOC: CountingAllocator = CountingAllocator::new();
    let counter = DropCounter::new();
    let root = Rcp::new_in(counter.track(42u32), &ALLOC).unwrap();
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let handle = root.clone();
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                let mut held = Vec::with_capacity(16);
                for i in 0..ROUNDS {
                    held.push(handle.clone());
                    if i % 16 == 15 {
                        held.clear();
                    }
                }
                assert_eq!(handle.get().map(|t| t.value), Some(42));
            });
        }
    });

    assert_eq!(root.ref_count(), 1);
    assert_eq!(counter.drops(), 0);
    drop(root);
    assert_eq!(counter.drops(), 1);
    assert_eq!(ALLOC.live(), 0);
}

// ============================================================================
// StrongRcp / WeakRcp
// ============================================================================

#[test]
fn test_upgrade_races_with_last_drop() {
    static ALLOC: CountingAllocator = CountingAllocator::new();

    for round in 0..200 {
        let counter = DropCounter::new();
        let strong = StrongRcp::new_in(counter.track(round), &ALLOC).unwrap();
        let weak = strong.downgrade();
        let barrier = Barrier::new(THREADS + 1);

        thread::scope(|scope| {
            for _ in 0..THREADS {
                let weak = weak.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        // Either the payload is intact or the upgrade fails.
                        if let Some(up) = weak.upgrade() {
                            assert_eq!(up.get().map(|t| t.value), Some(round));
                        }
                    }
                });
            }
            barrier.wait();
            drop(strong);
        });

        assert_eq!(counter.drops(), 1);
        assert!(weak.is_expired());
        assert!(weak.upgrade().is_none());
        assert_eq!(weak.strong_ref_count(), 0);
        drop(weak);
        assert_eq!(ALLOC.live(), 0);
    }
}

#[test]
fn test_weak_keeps_block_not_payload() {
    static ALLOC: CountingAllocator = CountingAllocator::new();
    let counter = DropCounter::new();

    let strong = StrongRcp::new_in(counter.track("payload"), &ALLOC).unwrap();
    let weak: WeakRcp<_> = WeakRcp::from(&strong);
    let second = weak.upgrade().unwrap();
    assert_eq!(strong.strong_ref_count(), 2);
    assert_eq!(strong.weak_ref_count(), 1);
    assert!(second == weak);

    drop(strong);
    drop(second);
    assert_eq!(counter.drops(), 1);
    assert_eq!(ALLOC.live(), 1);

    drop(weak);
    assert_eq!(ALLOC.live(), 0);
}

#[test]
fn test_get_mut_excludes_upgraded_handles() {
    #[derive(Default)]
    struct Payload {
        readers: AtomicUsize,
        writes: usize,
    }

    for _ in 0..500 {
        let mut strong = StrongRcp::new(Payload::default()).unwrap();
        let weak = strong.downgrade();
        let barrier = Barrier::new(2);

        thread::scope(|scope| {
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                let upgraded = weak.upgrade();
                drop(weak);
                if let Some(up) = upgraded {
                    let payload = up.get().unwrap();
                    payload.readers.fetch_add(1, Ordering::SeqCst);
                    for _ in 0..100 {
                        std::hint::spin_loop();
                    }
                    payload.readers.fetch_sub(1, Ordering::SeqCst);
                }
            });

            barrier.wait();
            for _ in 0..200 {
                if let Some(payload) = strong.get_mut() {
                    assert_eq!(payload.readers.load(Ordering::SeqCst), 0);
                    payload.writes += 1;
                }
            }
        });

        // Every handle but this one is gone.
        assert!(strong.get_mut().is_some());
        assert_eq!(strong.weak_ref_count(), 0);
    }
}

// ============================================================================
// Allocators under the pointers
// ============================================================================

#[test]
fn test_guarded_allocator_balances() {
    static ALLOC: GuardedAllocator = GuardedAllocator::new();
    {
        let values: Vec<_> = (0..64).map(|i| Rcp::new_in(i, &ALLOC).unwrap()).collect();
        let copies = values.clone();
        assert_eq!(ALLOC.live_allocations(), Some(64));
        drop(values);
        assert_eq!(ALLOC.live_allocations(), Some(64));
        drop(copies);
    }
    assert_eq!(ALLOC.live_allocations(), Some(0));
}
