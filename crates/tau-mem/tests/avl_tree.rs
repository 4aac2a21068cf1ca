//! Property tests for the streamed AVL tree.
//!
//! Random insert/remove sequences are checked against a `BTreeMap` model and
//! the tree shape is validated after every step.
//!
//! Run with: `cargo test -p tau-mem --test avl_tree`

mod common;

use common::{DropCounter, avl_height_bound, rng, shuffled};
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tau_mem::alloc::CountingAllocator;
use tau_mem::avl::{
    AvlConfig, AvlTree, Greater, InsertPolicy, Lesser, NodeHeight, NodeIndex, NodeRef, Replace,
    StreamedAvlTree,
};

/// Validates balance, stored heights and ordering; returns the height.
fn validate<T: Ord, I: NodeIndex, H: NodeHeight, P: InsertPolicy>(
    tree: &StreamedAvlTree<T, I, H, P>,
    node: I,
) -> usize {
    if node == I::INVALID {
        return 0;
    }
    let left = tree.left_of(node).unwrap_or(I::INVALID);
    let right = tree.right_of(node).unwrap_or(I::INVALID);
    let lh = validate(tree, left);
    let rh = validate(tree, right);
    assert!(lh.abs_diff(rh) <= 1, "node {node:?} out of balance");
    let height = lh.max(rh) + 1;
    assert_eq!(tree.height_of(node), Some(height));
    height
}

/// Same checks for the pointer-linked tree.
fn validate_linked<T: Ord>(node: Option<NodeRef<'_, T>>) -> usize {
    let Some(node) = node else {
        return 0;
    };
    let lh = validate_linked(node.left());
    let rh = validate_linked(node.right());
    assert!(lh.abs_diff(rh) <= 1, "linked node out of balance");
    if let Some(left) = node.left() {
        assert!(left.value() <= node.value());
    }
    if let Some(right) = node.right() {
        assert!(right.value() >= node.value());
    }
    let height = lh.max(rh) + 1;
    assert_eq!(node.height(), height);
    height
}

/// Ordered by `key` only; `tag` tells duplicates apart.
#[derive(Debug, Clone, Copy)]
struct Tagged {
    key: u32,
    tag: u32,
}

impl PartialEq for Tagged {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Tagged {}

impl PartialOrd for Tagged {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tagged {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Expected in-order `(key, tag)` sequence under `Lesser`: keys ascending,
/// equal keys newest first.
fn lesser_order(model: &BTreeMap<u32, Vec<u32>>) -> Vec<(u32, u32)> {
    model
        .iter()
        .flat_map(|(&key, tags)| tags.iter().rev().map(move |&tag| (key, tag)))
        .collect()
}

fn assert_sorted<T: Ord + std::fmt::Debug>(values: &[&T]) {
    for pair in values.windows(2) {
        assert!(pair[0] <= pair[1], "{:?} before {:?}", pair[0], pair[1]);
    }
}

// ============================================================================
// Scenario: 1000 shuffled keys
// ============================================================================

#[test]
fn test_thousand_shuffled_keys() {
    let mut tree = StreamedAvlTree::<u32>::new(1_000).unwrap();
    for v in shuffled(1_000, 1) {
        assert_eq!(tree.insert(v), Ok(None));
    }
    assert_eq!(tree.len(), 1_000);
    let height = validate(&tree, tree.root());
    assert_eq!(height, tree.height());
    assert!(height <= avl_height_bound(1_000), "height {height}");
    assert!(tree.iter().copied().eq(0..1_000));

    for v in shuffled(1_000, 2) {
        assert_eq!(tree.remove(&v), Some(v));
        assert_eq!(tree.find(&v), None);
    }
    assert!(tree.is_empty());
    assert_eq!(tree.root(), u32::INVALID);
    let stats = tree.stats();
    assert_eq!(stats.live_len, 0);
    assert!(stats.high_water == 0 || stats.free_len == stats.high_water);
}

#[test]
fn test_narrow_widths_hold_the_same_tree() {
    let mut tree = StreamedAvlTree::<u32, u16, u8>::with_config(
        4_000,
        AvlConfig { alloc_pages: 1 },
    )
    .unwrap();
    for v in shuffled(4_000, 3) {
        tree.insert(v).unwrap();
    }
    assert!(tree.height() <= avl_height_bound(4_000));
    validate(&tree, tree.root());
    for v in 0..4_000 {
        assert_eq!(tree.find_index(&v).and_then(|i| tree.value_at(i)), Some(&v));
    }
}

// ============================================================================
// Random operation sequences
// ============================================================================

#[test]
fn test_random_operations_match_model() {
    let mut rng = rng(4);
    let mut tree = StreamedAvlTree::<u32>::new(512).unwrap();
    let mut model = BTreeSet::new();

    for step in 0..5_000 {
        let key = rng.gen_range(0..600);
        if rng.gen_bool(0.55) && model.len() < 512 {
            let displaced = tree.insert(key).unwrap();
            assert_eq!(displaced.is_some(), !model.insert(key), "step {step}");
        } else {
            assert_eq!(tree.remove(&key).is_some(), model.remove(&key), "step {step}");
        }

        if step % 97 == 0 {
            validate(&tree, tree.root());
            assert!(tree.iter().eq(model.iter()));
        }
    }
    assert_eq!(tree.len(), model.len());
    assert_eq!(tree.stats().live_len, model.len());
}

#[test]
fn test_closest_matches_against_model() {
    let mut rng = rng(5);
    let mut tree = StreamedAvlTree::<u32>::new(256).unwrap();
    let mut model = BTreeSet::new();
    for _ in 0..200 {
        let v = rng.gen_range(0..10_000);
        tree.insert(v).unwrap();
        model.insert(v);
    }

    for _ in 0..1_000 {
        let target = rng.gen_range(0..10_100);
        assert_eq!(tree.find_closest_above(&target), model.range(target..).next());
        assert_eq!(
            tree.find_closest_below(&target),
            model.range(..=target).next_back()
        );
    }
}

#[test]
fn test_duplicates_stay_grouped() {
    let mut rng = rng(6);
    let mut tree = StreamedAvlTree::<u32, u32, u8, Greater>::new(2_000).unwrap();
    for _ in 0..2_000 {
        tree.insert(rng.gen_range(0..50)).unwrap();
    }
    assert_eq!(tree.len(), 2_000);
    validate(&tree, tree.root());
    let values: Vec<&u32> = tree.iter().collect();
    assert_sorted(&values);

    // Remove every node by index, in slot order.
    for index in 0..2_000u32 {
        assert!(tree.remove_index(index).is_some(), "slot {index}");
        if index % 250 == 0 {
            validate(&tree, tree.root());
        }
    }
    assert!(tree.is_empty());
}

// ============================================================================
// Ownership
// ============================================================================

#[test]
fn test_values_dropped_exactly_once() {
    let counter = DropCounter::new();
    {
        let mut tree = StreamedAvlTree::<_, u32, u8, Replace>::new(128).unwrap();
        for v in shuffled(100, 7) {
            assert!(tree.insert(counter.track(v)).unwrap().is_none());
        }
        // Replacing hands the old value back.
        let old = tree.insert(counter.track(5)).unwrap();
        assert!(old.is_some());
        drop(old);
        assert_eq!(counter.drops(), 1);

        for v in 0..10 {
            let removed = tree.find_index_by(|t| t.value.cmp(&v)).unwrap();
            drop(tree.remove_index(removed));
        }
        assert_eq!(counter.drops(), 11);
    }
    assert_eq!(counter.drops(), 101);
}

// ============================================================================
// Lesser duplicates
// ============================================================================

#[test]
fn test_lesser_duplicates_match_model() {
    let mut rng = rng(8);
    let mut tree = StreamedAvlTree::<Tagged, u32, u8, Lesser>::new(1_500).unwrap();
    let mut model: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

    for tag in 0..1_500 {
        let key = rng.gen_range(0..40);
        assert!(tree.insert(Tagged { key, tag }).unwrap().is_none());
        model.entry(key).or_default().push(tag);
    }
    validate(&tree, tree.root());
    let seen: Vec<_> = tree.iter().map(|t| (t.key, t.tag)).collect();
    assert_eq!(seen, lesser_order(&model));

    for (step, slot) in shuffled(1_500, 9).into_iter().enumerate() {
        let removed = tree.remove_index(slot).expect("every slot is live");
        let tags = model.get_mut(&removed.key).unwrap();
        let at = tags.iter().position(|&t| t == removed.tag).unwrap();
        tags.remove(at);
        if tags.is_empty() {
            model.remove(&removed.key);
        }

        if step % 150 == 0 {
            validate(&tree, tree.root());
            let seen: Vec<_> = tree.iter().map(|t| (t.key, t.tag)).collect();
            assert_eq!(seen, lesser_order(&model));
        }
    }
    assert!(tree.is_empty());
    assert!(model.is_empty());
}

// ============================================================================
// Pointer-linked tree
// ============================================================================

#[test]
fn test_linked_random_operations_match_model() {
    static ALLOC: CountingAllocator = CountingAllocator::new();
    let mut rng = rng(10);
    let mut tree = AvlTree::<u32>::new_in(&ALLOC);
    let mut model = BTreeSet::new();

    for step in 0..5_000 {
        let key = rng.gen_range(0..600);
        if rng.gen_bool(0.55) {
            let displaced = tree.insert(key).unwrap();
            assert_eq!(displaced.is_some(), !model.insert(key), "step {step}");
        } else {
            assert_eq!(tree.remove(&key).is_some(), model.remove(&key), "step {step}");
        }

        if step % 97 == 0 {
            assert_eq!(validate_linked(tree.root()), tree.height());
            assert!(tree.iter().eq(model.iter()));
            assert_eq!(ALLOC.live(), model.len() as isize);
        }
    }
    assert_eq!(tree.len(), model.len());
    assert!(tree.height() <= avl_height_bound(model.len()));

    for _ in 0..500 {
        let target = rng.gen_range(0..650);
        assert_eq!(tree.find_closest_above(&target), model.range(target..).next());
        assert_eq!(
            tree.find_closest_below(&target),
            model.range(..=target).next_back()
        );
    }

    tree.dispose_tree();
    assert!(tree.is_empty());
    assert_eq!(ALLOC.live(), 0);
}

#[test]
fn test_linked_lesser_duplicates_match_model() {
    let mut rng = rng(12);
    let mut tree = AvlTree::<Tagged, Lesser>::new();
    let mut model: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

    for tag in 0..1_000 {
        let key = rng.gen_range(0..25);
        assert!(tree.insert(Tagged { key, tag }).unwrap().is_none());
        model.entry(key).or_default().push(tag);
    }
    validate_linked(tree.root());
    let seen: Vec<_> = tree.iter().map(|t| (t.key, t.tag)).collect();
    assert_eq!(seen, lesser_order(&model));

    for (step, tag) in shuffled(1_000, 13).into_iter().enumerate() {
        let key = model
            .iter()
            .find(|(_, tags)| tags.contains(&tag))
            .map(|(&key, _)| key)
            .unwrap();
        let target = Tagged { key, tag };
        let removed = tree.remove_if(&target, |t| t.tag == tag).unwrap();
        assert_eq!((removed.key, removed.tag), (key, tag));

        let tags = model.get_mut(&key).unwrap();
        tags.retain(|&t| t != tag);
        if tags.is_empty() {
            model.remove(&key);
        }
        if step % 100 == 0 {
            validate_linked(tree.root());
            let seen: Vec<_> = tree.iter().map(|t| (t.key, t.tag)).collect();
            assert_eq!(seen, lesser_order(&model));
        }
    }
    assert!(tree.is_empty());
}

#[test]
fn test_linked_values_dropped_exactly_once() {
    let counter = DropCounter::new();
    {
        let mut tree = AvlTree::<_, Replace>::new();
        for v in shuffled(100, 14) {
            assert!(tree.insert(counter.track(v)).unwrap().is_none());
        }
        drop(tree.insert(counter.track(5)).unwrap());
        assert_eq!(counter.drops(), 1);

        for v in 0..10 {
            let target = counter.track(v);
            drop(tree.remove(&target));
        }
        // Ten removed values plus ten lookup keys.
        assert_eq!(counter.drops(), 21);
    }
    assert_eq!(counter.drops(), 111);
}
