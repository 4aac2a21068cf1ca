//! AVL trees: index-addressed over page-committed storage, or pointer-linked
//! over a heap allocator.
//!
//! [`StreamedAvlTree`] keeps its nodes in a [`TreeArena`]: four parallel
//! columns (left child, right child, height, value), each an independent
//! page reservation that is committed in fixed runs as the arena's
//! high-water index advances and decommitted as it falls back. Nodes are
//! named by an unsigned integer index; the all-bits-set value of the index
//! type means "no node".
//!
//! The index and height widths are type parameters, so a tree of at most
//! 60 000 elements can use `u16` links and `u8` heights.
//!
//! [`AvlTree`] has the same search and collision behavior without a capacity
//! limit: each node is its own block from a
//! [`HeapAllocator`](crate::alloc::HeapAllocator), linked by pointer.
//!
//! # Collisions
//!
//! What happens when an inserted value compares equal to a stored one is
//! chosen at compile time with an [`InsertPolicy`]:
//!
//! | Policy      | Effect                                                   |
//! |-------------|----------------------------------------------------------|
//! | [`Ignore`]  | the new value is dropped from the tree and handed back   |
//! | [`Replace`] | the new value takes the old node's place; the old value is handed back |
//! | [`Greater`] | the new value goes into the right subtree                |
//! | [`Lesser`]  | the new value goes into the left subtree                 |
//!
//! # Example
//!
//! ```
//! use tau_mem::avl::StreamedAvlTree;
//!
//! let mut tree = StreamedAvlTree::<u32>::new(1_000).unwrap();
//! for v in [40, 10, 30, 20] {
//!     tree.insert(v).unwrap();
//! }
//! assert_eq!(tree.find(&30), Some(&30));
//! assert_eq!(tree.find_closest_above(&25), Some(&30));
//! assert_eq!(tree.find_closest_below(&25), Some(&20));
//! assert_eq!(tree.iter().copied().collect::<Vec<_>>(), [10, 20, 30, 40]);
//! ```

mod arena;
mod linked;
mod tree;

pub use arena::{ArenaStats, TreeArena};
pub use linked::{AvlTree, LinkedIter, NodeRef};
pub use tree::{Iter, StreamedAvlTree};

use std::fmt::Debug;
use std::hash::Hash;

/// Unsigned integer type used to link tree nodes.
///
/// [`NodeIndex::INVALID`] (all bits set) is never a valid node, so an index
/// type can address at most `INVALID` nodes.
pub trait NodeIndex: Copy + Eq + Ord + Hash + Debug + Send + Sync + 'static {
    /// "No node".
    const INVALID: Self;
    /// Written into the branches of freed slots in debug builds.
    const POISON: Self;

    /// Converts a slot number. The caller keeps `index` below `INVALID`.
    fn from_usize(index: usize) -> Self;

    /// Slot number of this index.
    fn to_usize(self) -> usize;

    /// Largest node count the type can address.
    fn capacity() -> usize {
        Self::INVALID.to_usize()
    }
}

/// Unsigned integer type used to store subtree heights.
pub trait NodeHeight: Copy + Eq + Ord + Debug + Send + Sync + 'static {
    /// Converts a height; saturates if the type is too narrow.
    fn from_usize(height: usize) -> Self;

    /// Height as a `usize`.
    fn to_usize(self) -> usize;
}

macro_rules! impl_node_int {
    ($($ty:ty),*) => {$(
        impl NodeIndex for $ty {
            const INVALID: Self = <$ty>::MAX;
            const POISON: Self = <$ty>::MAX / 0xFF * 0xCC;

            #[inline]
            fn from_usize(index: usize) -> Self {
                debug_assert!(index <= <$ty>::MAX as usize);
                index as $ty
            }

            #[inline]
            fn to_usize(self) -> usize {
                self as usize
            }
        }

        impl NodeHeight for $ty {
            #[inline]
            fn from_usize(height: usize) -> Self {
                <$ty>::try_from(height).unwrap_or(<$ty>::MAX)
            }

            #[inline]
            fn to_usize(self) -> usize {
                self as usize
            }
        }
    )*};
}

impl_node_int!(u8, u16, u32, usize);

#[cfg(target_pointer_width = "64")]
impl_node_int!(u64);

/// What an equal key does on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collision {
    /// Keep the stored value.
    Ignore,
    /// Swap in the new value.
    Replace,
    /// Chain the new value to the right.
    Greater,
    /// Chain the new value to the left.
    Lesser,
}

/// Compile-time collision policy for [`StreamedAvlTree`] and [`AvlTree`].
pub trait InsertPolicy {
    /// Behavior on an equal key.
    const COLLISION: Collision;
}

/// Keeps the first value inserted for a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ignore;

/// Keeps the last value inserted for a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Replace;

/// Keeps duplicates, later ones ordered after earlier ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greater;

/// Keeps duplicates, later ones ordered before earlier ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lesser;

impl InsertPolicy for Ignore {
    const COLLISION: Collision = Collision::Ignore;
}

impl InsertPolicy for Replace {
    const COLLISION: Collision = Collision::Replace;
}

impl InsertPolicy for Greater {
    const COLLISION: Collision = Collision::Greater;
}

impl InsertPolicy for Lesser {
    const COLLISION: Collision = Collision::Lesser;
}

/// Arena tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvlConfig {
    /// Pages committed or decommitted at once per column. Rounded up to a
    /// power of two.
    pub alloc_pages: usize,
}

impl AvlConfig {
    /// Default commit run.
    pub const DEFAULT_ALLOC_PAGES: usize = 4;

    /// Effective commit run: `alloc_pages` rounded up to a power of two.
    pub fn run_pages(&self) -> usize {
        self.alloc_pages.max(1).next_power_of_two()
    }
}

impl Default for AvlConfig {
    fn default() -> Self {
        AvlConfig {
            alloc_pages: Self::DEFAULT_ALLOC_PAGES,
        }
    }
}
