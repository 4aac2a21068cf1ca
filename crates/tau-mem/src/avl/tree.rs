use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;

use super::arena::{ArenaStats, TreeArena};
use super::{AvlConfig, Collision, Ignore, InsertPolicy, NodeHeight, NodeIndex};
use crate::error::Result;

/// Self-balancing search tree whose nodes live in a [`TreeArena`].
///
/// `I` is the node index width, `H` the stored height width and `P` the
/// [`InsertPolicy`] for equal keys. Children are addressed by index, and
/// [`NodeIndex::INVALID`] marks an absent child or an empty tree.
///
/// Search methods take either a borrowed key (`find`, `find_closest_above`,
/// ...) or a comparator returning how a stored value orders relative to the
/// target (`find_by`, ...), the same convention as
/// [`slice::binary_search_by`].
///
/// Not internally synchronized.
pub struct StreamedAvlTree<T, I: NodeIndex = u32, H: NodeHeight = u8, P: InsertPolicy = Ignore> {
    arena: TreeArena<T, I, H>,
    root: I,
    len: usize,
    _policy: PhantomData<P>,
}

impl<T, I: NodeIndex, H: NodeHeight, P: InsertPolicy> StreamedAvlTree<T, I, H, P> {
    /// Reserves storage for `max_elements` nodes with the default commit run.
    pub fn new(max_elements: usize) -> Result<Self> {
        Self::with_config(max_elements, AvlConfig::default())
    }

    /// Reserves storage for `max_elements` nodes.
    pub fn with_config(max_elements: usize, config: AvlConfig) -> Result<Self> {
        Ok(StreamedAvlTree {
            arena: TreeArena::new(max_elements, config)?,
            root: I::INVALID,
            len: 0,
            _policy: PhantomData,
        })
    }

    /// Number of stored values.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Root node, or [`NodeIndex::INVALID`] when empty.
    #[inline]
    pub fn root(&self) -> I {
        self.root
    }

    /// Height of the tree; 0 when empty, 1 for a single node.
    pub fn height(&self) -> usize {
        self.arena.height(self.root)
    }

    /// The backing arena.
    pub fn arena(&self) -> &TreeArena<T, I, H> {
        &self.arena
    }

    /// Arena occupancy.
    pub fn stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    /// Left child of a live node.
    pub fn left_of(&self, node: I) -> Option<I> {
        self.arena
            .is_live(node)
            .then(|| self.arena.left(node))
            .filter(|&child| child != I::INVALID)
    }

    /// Right child of a live node.
    pub fn right_of(&self, node: I) -> Option<I> {
        self.arena
            .is_live(node)
            .then(|| self.arena.right(node))
            .filter(|&child| child != I::INVALID)
    }

    /// Height of the subtree rooted at a live node.
    pub fn height_of(&self, node: I) -> Option<usize> {
        self.arena
            .is_live(node)
            .then(|| self.arena.height(node))
    }

    /// Value stored at a live node.
    pub fn value_at(&self, node: I) -> Option<&T> {
        self.arena.get(node)
    }

    /// Node holding a value that orders equal under `f`.
    pub fn find_index_by<F>(&self, mut f: F) -> Option<I>
    where
        F: FnMut(&T) -> Ordering,
    {
        let mut node = self.root;
        while node != I::INVALID {
            node = match f(self.arena.value(node)) {
                Ordering::Equal => return Some(node),
                Ordering::Less => self.arena.right(node),
                Ordering::Greater => self.arena.left(node),
            };
        }
        None
    }

    /// Value that orders equal under `f`.
    pub fn find_by<F>(&self, f: F) -> Option<&T>
    where
        F: FnMut(&T) -> Ordering,
    {
        self.find_index_by(f).map(|node| self.arena.value(node))
    }

    /// Node holding a value equal to `key`.
    pub fn find_index<Q>(&self, key: &Q) -> Option<I>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find_index_by(|value| <T as Borrow<Q>>::borrow(value).cmp(key))
    }

    /// Value equal to `key`.
    pub fn find<Q>(&self, key: &Q) -> Option<&T>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find_by(|value| <T as Borrow<Q>>::borrow(value).cmp(key))
    }

    /// Smallest value not ordered below the target.
    pub fn find_closest_above_by<F>(&self, mut f: F) -> Option<&T>
    where
        F: FnMut(&T) -> Ordering,
    {
        let mut best = None;
        let mut node = self.root;
        while node != I::INVALID {
            let value = self.arena.value(node);
            node = match f(value) {
                Ordering::Equal => return Some(value),
                Ordering::Less => self.arena.right(node),
                Ordering::Greater => {
                    best = Some(value);
                    self.arena.left(node)
                }
            };
        }
        best
    }

    /// Largest value not ordered above the target.
    pub fn find_closest_below_by<F>(&self, mut f: F) -> Option<&T>
    where
        F: FnMut(&T) -> Ordering,
    {
        let mut best = None;
        let mut node = self.root;
        while node != I::INVALID {
            let value = self.arena.value(node);
            node = match f(value) {
                Ordering::Equal => return Some(value),
                Ordering::Greater => self.arena.left(node),
                Ordering::Less => {
                    best = Some(value);
                    self.arena.right(node)
                }
            };
        }
        best
    }

    /// Smallest value `>= key`.
    pub fn find_closest_above<Q>(&self, key: &Q) -> Option<&T>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find_closest_above_by(|value| <T as Borrow<Q>>::borrow(value).cmp(key))
    }

    /// Largest value `<= key`.
    pub fn find_closest_below<Q>(&self, key: &Q) -> Option<&T>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find_closest_below_by(|value| <T as Borrow<Q>>::borrow(value).cmp(key))
    }

    /// Values in ascending order.
    pub fn iter(&self) -> Iter<'_, T, I, H> {
        let mut iter = Iter {
            arena: &self.arena,
            stack: Vec::with_capacity(self.height()),
            remaining: self.len,
        };
        iter.push_left(self.root);
        iter
    }

    /// Frees every node, children before parents.
    pub fn dispose_tree(&mut self) {
        let root = std::mem::replace(&mut self.root, I::INVALID);
        self.dispose(root);
        self.len = 0;
    }

    /// Same as [`StreamedAvlTree::dispose_tree`].
    pub fn clear(&mut self) {
        self.dispose_tree();
    }

    fn dispose(&mut self, tree: I) {
        if tree == I::INVALID {
            return;
        }
        self.dispose(self.arena.left(tree));
        self.dispose(self.arena.right(tree));
        drop(self.arena.deallocate(tree));
    }

    fn balance(&self, tree: I) -> isize {
        if tree == I::INVALID {
            return 0;
        }
        self.arena.height(self.arena.left(tree)) as isize
            - self.arena.height(self.arena.right(tree)) as isize
    }

    fn update_height(&mut self, tree: I) {
        let height = self
            .arena
            .height(self.arena.left(tree))
            .max(self.arena.height(self.arena.right(tree)))
            + 1;
        self.arena.set_height(tree, height);
    }

    fn rotate_right(&mut self, pivot: I) -> I {
        let new_root = self.arena.left(pivot);
        let transfer = self.arena.right(new_root);
        self.arena.set_right(new_root, pivot);
        self.arena.set_left(pivot, transfer);
        self.update_height(pivot);
        self.update_height(new_root);
        new_root
    }

    fn rotate_left(&mut self, pivot: I) -> I {
        let new_root = self.arena.right(pivot);
        let transfer = self.arena.left(new_root);
        self.arena.set_left(new_root, pivot);
        self.arena.set_right(pivot, transfer);
        self.update_height(pivot);
        self.update_height(new_root);
        new_root
    }

    /// Refreshes the height of `tree` and rotates if it is out of balance.
    /// Returns the subtree's new root.
    fn rebalance(&mut self, tree: I) -> I {
        self.update_height(tree);
        let balance = self.balance(tree);
        if balance > 1 {
            let left = self.arena.left(tree);
            if self.balance(left) < 0 {
                let left = self.rotate_left(left);
                self.arena.set_left(tree, left);
            }
            return self.rotate_right(tree);
        }
        if balance < -1 {
            let right = self.arena.right(tree);
            if self.balance(right) > 0 {
                let right = self.rotate_right(right);
                self.arena.set_right(tree, right);
            }
            return self.rotate_left(tree);
        }
        tree
    }

    /// Detaches the leftmost node under `tree`.
    /// Returns the rebalanced remainder and the detached node.
    fn detach_min(&mut self, tree: I) -> (I, I) {
        let left = self.arena.left(tree);
        if left == I::INVALID {
            return (self.arena.right(tree), tree);
        }
        let (rest, min) = self.detach_min(left);
        self.arena.set_left(tree, rest);
        (self.rebalance(tree), min)
    }

    /// Removes `tree` from its position and frees it.
    /// Returns the subtree that takes its place.
    fn unlink(&mut self, tree: I, removed: &mut Option<T>) -> I {
        let left = self.arena.left(tree);
        let right = self.arena.right(tree);
        let replacement = if left == I::INVALID {
            right
        } else if right == I::INVALID {
            left
        } else {
            let (rest, successor) = self.detach_min(right);
            self.arena.set_left(successor, left);
            self.arena.set_right(successor, rest);
            self.rebalance(successor)
        };
        *removed = self.arena.deallocate(tree);
        replacement
    }
}

impl<T: Ord, I: NodeIndex, H: NodeHeight, P: InsertPolicy> StreamedAvlTree<T, I, H, P> {
    /// Inserts `value`, resolving an equal key with the policy `P`.
    ///
    /// Returns the value that did not end up in the tree: the rejected new
    /// value under [`Ignore`], the previous value under
    /// [`Replace`](super::Replace), `None` otherwise.
    ///
    /// Fails with [`Error::CapacityExceeded`](crate::Error::CapacityExceeded)
    /// when the arena is full. The slot is taken before the search, so a full
    /// arena rejects even an insert whose key is already present.
    pub fn insert(&mut self, value: T) -> Result<Option<T>> {
        let node = self.arena.allocate(value)?;
        let mut displaced = None;
        self.root = self.insert_at(self.root, node, &mut displaced);
        if displaced.is_none() {
            self.len += 1;
        }
        Ok(displaced)
    }

    fn insert_at(&mut self, tree: I, node: I, displaced: &mut Option<T>) -> I {
        if tree == I::INVALID {
            return node;
        }
        let ordering = self.arena.value(node).cmp(self.arena.value(tree));
        match (ordering, P::COLLISION) {
            (Ordering::Less, _) | (Ordering::Equal, Collision::Lesser) => {
                let left = self.insert_at(self.arena.left(tree), node, displaced);
                self.arena.set_left(tree, left);
            }
            (Ordering::Greater, _) | (Ordering::Equal, Collision::Greater) => {
                let right = self.insert_at(self.arena.right(tree), node, displaced);
                self.arena.set_right(tree, right);
            }
            (Ordering::Equal, Collision::Ignore) => {
                *displaced = self.arena.deallocate(node);
                return tree;
            }
            (Ordering::Equal, Collision::Replace) => {
                let (left, right, height) = (
                    self.arena.left(tree),
                    self.arena.right(tree),
                    self.arena.height(tree),
                );
                self.arena.set_left(node, left);
                self.arena.set_right(node, right);
                self.arena.set_height(node, height);
                *displaced = self.arena.deallocate(tree);
                return node;
            }
        }
        self.rebalance(tree)
    }

    /// Removes one value equal to `key`.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<T>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut removed = None;
        self.root = self.remove_at(self.root, key, &mut removed);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_at<Q>(&mut self, tree: I, key: &Q, removed: &mut Option<T>) -> I
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        if tree == I::INVALID {
            return tree;
        }
        match key.cmp(<T as Borrow<Q>>::borrow(self.arena.value(tree))) {
            Ordering::Less => {
                let left = self.remove_at(self.arena.left(tree), key, removed);
                self.arena.set_left(tree, left);
            }
            Ordering::Greater => {
                let right = self.remove_at(self.arena.right(tree), key, removed);
                self.arena.set_right(tree, right);
            }
            Ordering::Equal => return self.unlink(tree, removed),
        }
        self.rebalance(tree)
    }

    /// Removes the node at `index`, which need not hold a unique key.
    ///
    /// Returns `None` if `index` is not a live node.
    pub fn remove_index(&mut self, index: I) -> Option<T> {
        if !self.arena.is_live(index) {
            return None;
        }
        let mut removed = None;
        self.root = self.remove_node(self.root, index, &mut removed);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_node(&mut self, tree: I, target: I, removed: &mut Option<T>) -> I {
        if tree == I::INVALID {
            return tree;
        }
        if tree == target {
            return self.unlink(tree, removed);
        }
        match self.arena.value(target).cmp(self.arena.value(tree)) {
            Ordering::Less => {
                let left = self.remove_node(self.arena.left(tree), target, removed);
                self.arena.set_left(tree, left);
            }
            Ordering::Greater => {
                let right = self.remove_node(self.arena.right(tree), target, removed);
                self.arena.set_right(tree, right);
            }
            // Rotations can move duplicates to either side; try the side
            // the policy chains to first.
            Ordering::Equal => {
                if P::COLLISION == Collision::Lesser {
                    self.remove_node_left(tree, target, removed);
                    if removed.is_none() {
                        self.remove_node_right(tree, target, removed);
                    }
                } else {
                    self.remove_node_right(tree, target, removed);
                    if removed.is_none() {
                        self.remove_node_left(tree, target, removed);
                    }
                }
            }
        }
        self.rebalance(tree)
    }

    fn remove_node_left(&mut self, tree: I, target: I, removed: &mut Option<T>) {
        let left = self.remove_node(self.arena.left(tree), target, removed);
        self.arena.set_left(tree, left);
    }

    fn remove_node_right(&mut self, tree: I, target: I, removed: &mut Option<T>) {
        let right = self.remove_node(self.arena.right(tree), target, removed);
        self.arena.set_right(tree, right);
    }
}

impl<T, I: NodeIndex, H: NodeHeight, P: InsertPolicy> Drop for StreamedAvlTree<T, I, H, P> {
    fn drop(&mut self) {
        self.dispose_tree();
    }
}

impl<'a, T, I: NodeIndex, H: NodeHeight, P: InsertPolicy> IntoIterator
    for &'a StreamedAvlTree<T, I, H, P>
{
    type Item = &'a T;
    type IntoIter = Iter<'a, T, I, H>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: fmt::Debug, I: NodeIndex, H: NodeHeight, P: InsertPolicy> fmt::Debug
    for StreamedAvlTree<T, I, H, P>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// In-order iterator over a [`StreamedAvlTree`].
pub struct Iter<'a, T, I: NodeIndex, H: NodeHeight> {
    arena: &'a TreeArena<T, I, H>,
    stack: Vec<I>,
    remaining: usize,
}

impl<T, I: NodeIndex, H: NodeHeight> Iter<'_, T, I, H> {
    fn push_left(&mut self, mut node: I) {
        while node != I::INVALID {
            self.stack.push(node);
            node = self.arena.left(node);
        }
    }
}

impl<'a, T, I: NodeIndex, H: NodeHeight> Iterator for Iter<'a, T, I, H> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let arena = self.arena;
        let node = self.stack.pop()?;
        self.push_left(arena.right(node));
        self.remaining -= 1;
        Some(arena.value(node))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T, I: NodeIndex, H: NodeHeight> ExactSizeIterator for Iter<'_, T, I, H> {}
