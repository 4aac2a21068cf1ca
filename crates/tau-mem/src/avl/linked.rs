use std::alloc::Layout;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use super::{Collision, Ignore, InsertPolicy, NodeHeight};
use crate::alloc::{HeapAllocator, allocate_value, deallocate_value, default_allocator};
use crate::error::Result;

type Link<T> = Option<NonNull<AvlNode<T>>>;

struct AvlNode<T> {
    left: Link<T>,
    right: Link<T>,
    height: u8,
    value: T,
}

/// Self-balancing search tree with one heap block per node.
///
/// Nodes come from a [`HeapAllocator`] (the default allocator unless one is
/// given to [`AvlTree::new_in`]) and link to each other directly. There is no
/// capacity limit; every insert costs one allocation and every removal one
/// deallocation. Searching, collision policies and the `_by` comparator
/// convention match [`StreamedAvlTree`](super::StreamedAvlTree).
pub struct AvlTree<T, P: InsertPolicy = Ignore> {
    root: Link<T>,
    len: usize,
    allocator: &'static dyn HeapAllocator,
    _owns: PhantomData<(AvlNode<T>, P)>,
}

// SAFETY: the tree owns its nodes exclusively, like a `Box` tree; the
// allocator is `Send + Sync`.
unsafe impl<T: Send, P: InsertPolicy> Send for AvlTree<T, P> {}
// SAFETY: shared access only reads nodes.
unsafe impl<T: Sync, P: InsertPolicy> Sync for AvlTree<T, P> {}

// Every link reachable from `root` points at a live node owned by the tree.
// The helpers below rely on that.

#[inline]
fn node<'a, T>(ptr: NonNull<AvlNode<T>>) -> &'a AvlNode<T> {
    // SAFETY: `ptr` is reachable from the root, so it is live.
    unsafe { &*ptr.as_ptr() }
}

#[inline]
fn node_mut<'a, T>(ptr: NonNull<AvlNode<T>>) -> &'a mut AvlNode<T> {
    // SAFETY: `ptr` is live, and callers hold the tree mutably.
    unsafe { &mut *ptr.as_ptr() }
}

#[inline]
fn height<T>(link: Link<T>) -> usize {
    link.map_or(0, |n| node(n).height as usize)
}

fn balance<T>(link: Link<T>) -> isize {
    link.map_or(0, |n| {
        height(node(n).left) as isize - height(node(n).right) as isize
    })
}

fn update_height<T>(tree: NonNull<AvlNode<T>>) {
    let n = node_mut(tree);
    n.height = <u8 as NodeHeight>::from_usize(height(n.left).max(height(n.right)) + 1);
}

fn rotate_right<T>(pivot: NonNull<AvlNode<T>>) -> NonNull<AvlNode<T>> {
    let Some(new_root) = node(pivot).left else {
        return pivot;
    };
    node_mut(pivot).left = node(new_root).right;
    node_mut(new_root).right = Some(pivot);
    update_height(pivot);
    update_height(new_root);
    new_root
}

fn rotate_left<T>(pivot: NonNull<AvlNode<T>>) -> NonNull<AvlNode<T>> {
    let Some(new_root) = node(pivot).right else {
        return pivot;
    };
    node_mut(pivot).right = node(new_root).left;
    node_mut(new_root).left = Some(pivot);
    update_height(pivot);
    update_height(new_root);
    new_root
}

/// Refreshes the height of `tree` and rotates if it is out of balance.
fn rebalance<T>(tree: NonNull<AvlNode<T>>) -> NonNull<AvlNode<T>> {
    update_height(tree);
    let factor = balance(Some(tree));
    if factor > 1 {
        if balance(node(tree).left) < 0 {
            node_mut(tree).left = node(tree).left.map(rotate_left);
        }
        return rotate_right(tree);
    }
    if factor < -1 {
        if balance(node(tree).right) > 0 {
            node_mut(tree).right = node(tree).right.map(rotate_right);
        }
        return rotate_left(tree);
    }
    tree
}

/// Detaches the leftmost node under `tree`.
/// Returns the rebalanced remainder and the detached node.
fn detach_min<T>(tree: NonNull<AvlNode<T>>) -> (Link<T>, NonNull<AvlNode<T>>) {
    match node(tree).left {
        None => (node(tree).right, tree),
        Some(left) => {
            let (rest, min) = detach_min(left);
            node_mut(tree).left = rest;
            (Some(rebalance(tree)), min)
        }
    }
}

impl<T, P: InsertPolicy> AvlTree<T, P> {
    /// Empty tree on the default allocator.
    pub fn new() -> Self {
        Self::new_in(default_allocator())
    }

    /// Empty tree whose nodes come from `allocator`.
    pub fn new_in(allocator: &'static dyn HeapAllocator) -> Self {
        AvlTree {
            root: None,
            len: 0,
            allocator,
            _owns: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Height of the tree; 0 when empty, 1 for a single node.
    pub fn height(&self) -> usize {
        height(self.root)
    }

    /// The allocator nodes come from.
    pub fn allocator(&self) -> &'static dyn HeapAllocator {
        self.allocator
    }

    /// The root node.
    pub fn root(&self) -> Option<NodeRef<'_, T>> {
        self.root.map(NodeRef::new)
    }

    /// Node holding a value that orders equal under `f`.
    pub fn find_node_by<F>(&self, mut f: F) -> Option<NodeRef<'_, T>>
    where
        F: FnMut(&T) -> Ordering,
    {
        let mut link = self.root;
        while let Some(n) = link {
            link = match f(&node(n).value) {
                Ordering::Equal => return Some(NodeRef::new(n)),
                Ordering::Less => node(n).right,
                Ordering::Greater => node(n).left,
            };
        }
        None
    }

    /// Value that orders equal under `f`.
    pub fn find_by<F>(&self, f: F) -> Option<&T>
    where
        F: FnMut(&T) -> Ordering,
    {
        self.find_node_by(f).map(NodeRef::value)
    }

    /// Node holding a value equal to `key`.
    pub fn find_node<Q>(&self, key: &Q) -> Option<NodeRef<'_, T>>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find_node_by(|value| <T as Borrow<Q>>::borrow(value).cmp(key))
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
        let mut link = self.root;
        while let Some(n) = link {
            let n = node(n);
            link = match f(&n.value) {
                Ordering::Equal => return Some(&n.value),
                Ordering::Less => n.right,
                Ordering::Greater => {
                    best = Some(&n.value);
                    n.left
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
        let mut link = self.root;
        while let Some(n) = link {
            let n = node(n);
            link = match f(&n.value) {
                Ordering::Equal => return Some(&n.value),
                Ordering::Greater => n.left,
                Ordering::Less => {
                    best = Some(&n.value);
                    n.right
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
    pub fn iter(&self) -> LinkedIter<'_, T> {
        let mut iter = LinkedIter {
            stack: Vec::with_capacity(self.height()),
            remaining: self.len,
            _tree: PhantomData,
        };
        iter.push_left(self.root);
        iter
    }

    /// Frees every node, children before parents.
    pub fn dispose_tree(&mut self) {
        let root = self.root.take();
        self.dispose(root);
        self.len = 0;
    }

    /// Same as [`AvlTree::dispose_tree`].
    pub fn clear(&mut self) {
        self.dispose_tree();
    }

    fn dispose(&mut self, link: Link<T>) {
        let Some(n) = link else {
            return;
        };
        self.dispose(node(n).left);
        self.dispose(node(n).right);
        // SAFETY: `n` came from `allocate_value` on this allocator and is
        // no longer linked.
        unsafe { deallocate_value(self.allocator, n) };
    }

    /// Returns the block of an unlinked node and hands back its value.
    fn free_node(&mut self, n: NonNull<AvlNode<T>>) -> T {
        // SAFETY: `n` is unlinked and owned by this tree; the value is moved
        // out before the block goes back without dropping it.
        unsafe {
            let owned = n.as_ptr().read();
            self.allocator
                .deallocate(n.cast(), Layout::new::<AvlNode<T>>());
            owned.value
        }
    }

    /// Removes `tree` from its position and frees it.
    /// Returns the subtree that takes its place.
    fn unlink(&mut self, tree: NonNull<AvlNode<T>>, removed: &mut Option<T>) -> Link<T> {
        let (left, right) = (node(tree).left, node(tree).right);
        let replacement = match (left, right) {
            (None, other) | (other, None) => other,
            (Some(_), Some(right)) => {
                let (rest, successor) = detach_min(right);
                let s = node_mut(successor);
                s.left = left;
                s.right = rest;
                Some(rebalance(successor))
            }
        };
        *removed = Some(self.free_node(tree));
        replacement
    }
}

impl<T: Ord, P: InsertPolicy> AvlTree<T, P> {
    /// Inserts `value`, resolving an equal key with the policy `P`.
    ///
    /// Returns the value that did not end up in the tree: the rejected new
    /// value under [`Ignore`], the previous value under
    /// [`Replace`](super::Replace), `None` otherwise.
    ///
    /// The node is allocated before the search, so an allocation failure is
    /// reported even when the key is already present.
    pub fn insert(&mut self, value: T) -> Result<Option<T>> {
        let fresh = allocate_value(
            self.allocator,
            AvlNode {
                left: None,
                right: None,
                height: 1,
                value,
            },
        )?;
        let mut displaced = None;
        self.root = Some(self.insert_at(self.root, fresh, &mut displaced));
        if displaced.is_none() {
            self.len += 1;
        }
        Ok(displaced)
    }

    fn insert_at(
        &mut self,
        link: Link<T>,
        fresh: NonNull<AvlNode<T>>,
        displaced: &mut Option<T>,
    ) -> NonNull<AvlNode<T>> {
        let Some(tree) = link else {
            return fresh;
        };
        match (node(fresh).value.cmp(&node(tree).value), P::COLLISION) {
            (Ordering::Less, _) | (Ordering::Equal, Collision::Lesser) => {
                let left = self.insert_at(node(tree).left, fresh, displaced);
                node_mut(tree).left = Some(left);
            }
            (Ordering::Greater, _) | (Ordering::Equal, Collision::Greater) => {
                let right = self.insert_at(node(tree).right, fresh, displaced);
                node_mut(tree).right = Some(right);
            }
            (Ordering::Equal, Collision::Ignore) => {
                *displaced = Some(self.free_node(fresh));
                return tree;
            }
            (Ordering::Equal, Collision::Replace) => {
                mem::swap(&mut node_mut(tree).value, &mut node_mut(fresh).value);
                *displaced = Some(self.free_node(fresh));
                return tree;
            }
        }
        rebalance(tree)
    }

    /// Removes one value equal to `key`.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<T>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.remove_if(key, |_| true)
    }

    /// Removes the first value equal to `key` that satisfies `pred`.
    ///
    /// With a duplicate policy this picks one node out of a run of equal keys.
    pub fn remove_if<Q, F>(&mut self, key: &Q, mut pred: F) -> Option<T>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnMut(&T) -> bool,
    {
        let mut removed = None;
        self.root = self.remove_at(self.root, key, &mut pred, &mut removed);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_at<Q, F>(
        &mut self,
        link: Link<T>,
        key: &Q,
        pred: &mut F,
        removed: &mut Option<T>,
    ) -> Link<T>
    where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnMut(&T) -> bool,
    {
        let tree = link?;
        match key.cmp(<T as Borrow<Q>>::borrow(&node(tree).value)) {
            Ordering::Less => self.remove_left(tree, key, pred, removed),
            Ordering::Greater => self.remove_right(tree, key, pred, removed),
            Ordering::Equal if pred(&node(tree).value) => return self.unlink(tree, removed),
            // Rotations can move duplicates to either side; try the side
            // the policy chains to first.
            Ordering::Equal => {
                if P::COLLISION == Collision::Lesser {
                    self.remove_left(tree, key, pred, removed);
                    if removed.is_none() {
                        self.remove_right(tree, key, pred, removed);
                    }
                } else {
                    self.remove_right(tree, key, pred, removed);
                    if removed.is_none() {
                        self.remove_left(tree, key, pred, removed);
                    }
                }
            }
        }
        Some(rebalance(tree))
    }

    fn remove_left<Q, F>(
        &mut self,
        tree: NonNull<AvlNode<T>>,
        key: &Q,
        pred: &mut F,
        removed: &mut Option<T>,
    ) where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnMut(&T) -> bool,
    {
        let left = self.remove_at(node(tree).left, key, pred, removed);
        node_mut(tree).left = left;
    }

    fn remove_right<Q, F>(
        &mut self,
        tree: NonNull<AvlNode<T>>,
        key: &Q,
        pred: &mut F,
        removed: &mut Option<T>,
    ) where
        T: Borrow<Q>,
        Q: Ord + ?Sized,
        F: FnMut(&T) -> bool,
    {
        let right = self.remove_at(node(tree).right, key, pred, removed);
        node_mut(tree).right = right;
    }
}

impl<T, P: InsertPolicy> Default for AvlTree<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P: InsertPolicy> Drop for AvlTree<T, P> {
    fn drop(&mut self) {
        self.dispose_tree();
    }
}

impl<'a, T, P: InsertPolicy> IntoIterator for &'a AvlTree<T, P> {
    type Item = &'a T;
    type IntoIter = LinkedIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: fmt::Debug, P: InsertPolicy> fmt::Debug for AvlTree<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Borrowed view of one node of an [`AvlTree`].
pub struct NodeRef<'a, T> {
    ptr: NonNull<AvlNode<T>>,
    _tree: PhantomData<&'a AvlNode<T>>,
}

impl<'a, T> NodeRef<'a, T> {
    fn new(ptr: NonNull<AvlNode<T>>) -> Self {
        NodeRef {
            ptr,
            _tree: PhantomData,
        }
    }

    /// The stored value.
    pub fn value(self) -> &'a T {
        &node(self.ptr).value
    }

    pub fn left(self) -> Option<NodeRef<'a, T>> {
        node(self.ptr).left.map(NodeRef::new)
    }

    pub fn right(self) -> Option<NodeRef<'a, T>> {
        node(self.ptr).right.map(NodeRef::new)
    }

    /// Height of the subtree rooted here; 1 for a leaf.
    pub fn height(self) -> usize {
        node(self.ptr).height as usize
    }
}

impl<T> Clone for NodeRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodeRef<'_, T> {}

impl<T: fmt::Debug> fmt::Debug for NodeRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("value", self.value())
            .field("height", &self.height())
            .finish()
    }
}

/// In-order iterator over an [`AvlTree`].
pub struct LinkedIter<'a, T> {
    stack: Vec<NonNull<AvlNode<T>>>,
    remaining: usize,
    _tree: PhantomData<&'a AvlNode<T>>,
}

impl<T> LinkedIter<'_, T> {
    fn push_left(&mut self, mut link: Link<T>) {
        while let Some(n) = link {
            self.stack.push(n);
            link = node(n).left;
        }
    }
}

impl<'a, T> Iterator for LinkedIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let n = self.stack.pop()?;
        self.push_left(node(n).right);
        self.remaining -= 1;
        Some(&node(n).value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for LinkedIter<'_, T> {}
