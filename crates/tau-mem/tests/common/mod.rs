// Common test utilities for integration tests
//
// Seeded randomness and drop observers shared by the tree, array and
// reference-counting tests.

#![allow(dead_code)]

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed seed so failures reproduce.
pub const SEED: u64 = 0x5EED_0A71;

/// Deterministic generator for `salt`.
pub fn rng(salt: u64) -> StdRng {
    StdRng::seed_from_u64(SEED ^ salt)
}

/// `0..n` in a seeded random order.
pub fn shuffled(n: u32, salt: u64) -> Vec<u32> {
    let mut values: Vec<u32> = (0..n).collect();
    values.shuffle(&mut rng(salt));
    values
}

/// Upper bound on AVL height for `n` nodes: `ceil(1.44 * log2(n + 1))`.
pub fn avl_height_bound(n: usize) -> usize {
    (1.44 * ((n + 1) as f64).log2()).ceil() as usize
}

/// Counts how many times values sharing it were dropped.
#[derive(Debug, Clone, Default)]
pub struct DropCounter(Arc<AtomicUsize>);

impl DropCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A value reporting to this counter.
    pub fn track<T>(&self, value: T) -> Tracked<T> {
        Tracked {
            value,
            counter: self.clone(),
        }
    }

    pub fn drops(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A value that bumps its [`DropCounter`] when dropped.
#[derive(Debug, Clone)]
pub struct Tracked<T> {
    pub value: T,
    counter: DropCounter,
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.counter.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl<T: PartialEq> PartialEq for Tracked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: Eq> Eq for Tracked<T> {}

impl<T: Ord> PartialOrd for Tracked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for Tracked<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}
