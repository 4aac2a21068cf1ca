//! Slot storage for [`StreamedAvlTree`](super::StreamedAvlTree).
//!
//! Four columns share one slot numbering. Each column reserves enough pages
//! for the maximum element count (rounded up to whole commit runs) and
//! commits one run at a time as the high-water slot grows into it.
//!
//! Slot lifecycle:
//!
//! - `allocate` takes the oldest recycled slot from the free list, or the
//!   next slot above the high-water mark.
//! - `deallocate` moves the value out and zeroes the height. Freeing the
//!   topmost slot lowers the high-water mark and may decommit trailing runs;
//!   any other slot is appended to the free list, which is linked through
//!   the left-child column.
//!
//! A live slot always has a height of at least 1, so liveness is a single
//! load.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use tau_log::trace;

use super::{AvlConfig, NodeHeight, NodeIndex};
use crate::error::{Error, Result};
use crate::page::{PageAllocator, PageRegion};

/// Arena occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    /// Slots below the high-water mark.
    pub high_water: usize,
    /// Recycled slots waiting on the free list.
    pub free_len: usize,
    /// Slots holding a value.
    pub live_len: usize,
    /// Pages committed across all four columns.
    pub committed_pages: usize,
}

/// One page-backed array of `X`.
struct Column<X> {
    region: PageRegion,
    _slot: PhantomData<X>,
}

impl<X> Column<X> {
    fn reserve(slots: usize, run: usize) -> Result<Self> {
        let pages = PageAllocator::pages_for(slots.saturating_mul(mem::size_of::<X>()))
            .max(1)
            .next_multiple_of(run);
        Ok(Column {
            region: PageRegion::reserve(pages)?,
            _slot: PhantomData,
        })
    }

    #[inline]
    fn ptr(&self) -> *mut X {
        self.region.as_ptr().cast()
    }

    /// Commits runs until `slots` slots are backed.
    fn ensure(&mut self, slots: usize, run: usize) -> Result<()> {
        let needed = slots * mem::size_of::<X>();
        while needed > self.region.committed_bytes() {
            let pages = run.min(self.region.reserved_pages() - self.region.committed_pages());
            if pages == 0 {
                return Err(Error::CapacityExceeded {
                    capacity: self.region.reserved_bytes() / mem::size_of::<X>().max(1),
                });
            }
            self.region.grow(pages)?;
        }
        Ok(())
    }

    /// Decommits whole runs while two runs of slack sit past `slots`.
    fn release(&mut self, slots: usize, run: usize) {
        let needed = PageAllocator::pages_for(slots * mem::size_of::<X>());
        while self.region.committed_pages() >= needed + 2 * run {
            self.region.shrink(run);
        }
    }

    #[inline]
    fn committed_pages(&self) -> usize {
        self.region.committed_pages()
    }
}

/// Page-committed slot allocator holding tree nodes.
pub struct TreeArena<T, I: NodeIndex = u32, H: NodeHeight = u8> {
    left: Column<I>,
    right: Column<I>,
    height: Column<H>,
    value: Column<T>,
    run: usize,
    max_elements: usize,
    alloc_index: usize,
    first_free: I,
    last_free: I,
    free_len: usize,
    poison: bool,
}

impl<T, I: NodeIndex, H: NodeHeight> TreeArena<T, I, H> {
    /// Reserves columns for `max_elements` slots.
    ///
    /// Fails with [`Error::IndexWidthTooSmall`] if `I` cannot name that many
    /// slots, and with [`Error::InvalidAlignment`] if `T` needs more than
    /// page alignment.
    pub fn new(max_elements: usize, config: AvlConfig) -> Result<Self> {
        if max_elements > I::capacity() {
            return Err(Error::IndexWidthTooSmall { max_elements });
        }
        if mem::align_of::<T>() > PageAllocator::page_size() {
            return Err(Error::InvalidAlignment {
                alignment: mem::align_of::<T>(),
            });
        }
        let run = config.run_pages();
        Ok(TreeArena {
            left: Column::reserve(max_elements, run)?,
            right: Column::reserve(max_elements, run)?,
            height: Column::reserve(max_elements, run)?,
            value: Column::reserve(max_elements, run)?,
            run,
            max_elements,
            alloc_index: 0,
            first_free: I::INVALID,
            last_free: I::INVALID,
            free_len: 0,
            // Poison must not collide with a real slot.
            poison: cfg!(debug_assertions) && I::POISON.to_usize() >= max_elements,
        })
    }

    /// Stores `value` in a free slot as a childless leaf.
    pub fn allocate(&mut self, value: T) -> Result<I> {
        let slot = if self.first_free != I::INVALID {
            let slot = self.first_free.to_usize();
            if self.first_free == self.last_free {
                self.first_free = I::INVALID;
                self.last_free = I::INVALID;
            } else {
                // SAFETY: free slots lie below the high-water mark.
                self.first_free = unsafe { *self.left.ptr().add(slot) };
            }
            self.free_len -= 1;
            slot
        } else {
            if self.alloc_index == self.max_elements {
                return Err(Error::CapacityExceeded {
                    capacity: self.max_elements,
                });
            }
            self.grow_to(self.alloc_index + 1)?;
            self.alloc_index += 1;
            self.alloc_index - 1
        };

        // SAFETY: `slot` is below the high-water mark, so every column has it
        // committed, and the slot holds no value.
        unsafe {
            self.left.ptr().add(slot).write(I::INVALID);
            self.right.ptr().add(slot).write(I::INVALID);
            self.height.ptr().add(slot).write(H::from_usize(1));
            self.value.ptr().add(slot).write(value);
        }
        Ok(I::from_usize(slot))
    }

    fn grow_to(&mut self, slots: usize) -> Result<()> {
        let before = self.committed_pages();
        self.left.ensure(slots, self.run)?;
        self.right.ensure(slots, self.run)?;
        self.height.ensure(slots, self.run)?;
        self.value.ensure(slots, self.run)?;
        if self.committed_pages() != before {
            trace!("tree arena grew to {} pages", self.committed_pages());
        }
        Ok(())
    }

    /// Moves the value out of `index` and recycles the slot.
    ///
    /// Returns `None` if `index` is not a live slot.
    pub fn deallocate(&mut self, index: I) -> Option<T> {
        if !self.is_live(index) {
            return None;
        }
        let slot = index.to_usize();
        // SAFETY: live slot, so every column has it committed and the value
        // is initialized; the zero height marks it vacant before anything
        // else can observe it.
        let value = unsafe {
            self.height.ptr().add(slot).write(H::from_usize(0));
            if self.poison {
                self.left.ptr().add(slot).write(I::POISON);
                self.right.ptr().add(slot).write(I::POISON);
            }
            self.value.ptr().add(slot).read()
        };

        if slot + 1 == self.alloc_index {
            self.alloc_index -= 1;
            self.attempt_release();
        } else {
            if self.last_free != I::INVALID {
                // SAFETY: the previous tail is a free slot below the mark.
                unsafe { self.left.ptr().add(self.last_free.to_usize()).write(index) };
            } else {
                self.first_free = index;
            }
            self.last_free = index;
            self.free_len += 1;
        }
        Some(value)
    }

    fn attempt_release(&mut self) {
        let before = self.committed_pages();
        self.left.release(self.alloc_index, self.run);
        self.right.release(self.alloc_index, self.run);
        self.height.release(self.alloc_index, self.run);
        self.value.release(self.alloc_index, self.run);
        if self.committed_pages() != before {
            trace!("tree arena shrank to {} pages", self.committed_pages());
        }
    }

    /// Returns true if `index` holds a value.
    #[inline]
    pub fn is_live(&self, index: I) -> bool {
        let slot = index.to_usize();
        // SAFETY: slots below the high-water mark are committed.
        index != I::INVALID
            && slot < self.alloc_index
            && unsafe { (*self.height.ptr().add(slot)).to_usize() } != 0
    }

    /// The value at a live slot.
    pub fn get(&self, index: I) -> Option<&T> {
        // SAFETY: live slots hold an initialized value.
        self.is_live(index)
            .then(|| unsafe { &*self.value.ptr().add(index.to_usize()) })
    }

    /// The value at a live slot, mutably.
    ///
    /// Changing the value's ordering while it sits in a tree breaks the tree.
    pub fn get_mut(&mut self, index: I) -> Option<&mut T> {
        // SAFETY: live slots hold an initialized value; `&mut self` is
        // exclusive.
        self.is_live(index)
            .then(|| unsafe { &mut *self.value.ptr().add(index.to_usize()) })
    }

    #[inline]
    fn live_slot(&self, index: I) -> usize {
        assert!(self.is_live(index), "tree slot {index:?} is not live");
        index.to_usize()
    }

    #[inline]
    fn checked_child(&self, child: I) -> I {
        debug_assert!(
            !self.poison || child != I::POISON,
            "walked into a freed branch"
        );
        child
    }

    /// The value at a live slot; panics otherwise.
    #[inline]
    pub(super) fn value(&self, index: I) -> &T {
        let slot = self.live_slot(index);
        // SAFETY: live slot.
        unsafe { &*self.value.ptr().add(slot) }
    }

    #[inline]
    pub(super) fn left(&self, index: I) -> I {
        let slot = self.live_slot(index);
        // SAFETY: live slot.
        self.checked_child(unsafe { *self.left.ptr().add(slot) })
    }

    #[inline]
    pub(super) fn right(&self, index: I) -> I {
        let slot = self.live_slot(index);
        // SAFETY: live slot.
        self.checked_child(unsafe { *self.right.ptr().add(slot) })
    }

    /// Height of the subtree at `index`; 0 for [`NodeIndex::INVALID`].
    #[inline]
    pub(super) fn height(&self, index: I) -> usize {
        if index == I::INVALID {
            return 0;
        }
        let slot = self.live_slot(index);
        // SAFETY: live slot.
        unsafe { (*self.height.ptr().add(slot)).to_usize() }
    }

    #[inline]
    pub(super) fn set_left(&mut self, index: I, child: I) {
        let slot = self.live_slot(index);
        // SAFETY: live slot.
        unsafe { self.left.ptr().add(slot).write(child) };
    }

    #[inline]
    pub(super) fn set_right(&mut self, index: I, child: I) {
        let slot = self.live_slot(index);
        // SAFETY: live slot.
        unsafe { self.right.ptr().add(slot).write(child) };
    }

    #[inline]
    pub(super) fn set_height(&mut self, index: I, height: usize) {
        debug_assert!(height > 0);
        let slot = self.live_slot(index);
        // SAFETY: live slot.
        unsafe { self.height.ptr().add(slot).write(H::from_usize(height)) };
    }

    /// Slots ever handed out and not returned to the high-water mark.
    #[inline]
    pub fn high_water(&self) -> usize {
        self.alloc_index
    }

    /// Recycled slots waiting on the free list.
    #[inline]
    pub fn free_len(&self) -> usize {
        self.free_len
    }

    /// Slots holding a value.
    #[inline]
    pub fn live_len(&self) -> usize {
        self.alloc_index - self.free_len
    }

    /// Maximum number of live slots.
    #[inline]
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Pages committed across all four columns.
    pub fn committed_pages(&self) -> usize {
        self.left.committed_pages()
            + self.right.committed_pages()
            + self.height.committed_pages()
            + self.value.committed_pages()
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            high_water: self.high_water(),
            free_len: self.free_len(),
            live_len: self.live_len(),
            committed_pages: self.committed_pages(),
        }
    }
}

impl<T, I: NodeIndex, H: NodeHeight> Drop for TreeArena<T, I, H> {
    fn drop(&mut self) {
        if !mem::needs_drop::<T>() {
            return;
        }
        for slot in 0..self.alloc_index {
            if self.is_live(I::from_usize(slot)) {
                // SAFETY: live slot; the regions are freed right after.
                unsafe { ptr::drop_in_place(self.value.ptr().add(slot)) };
            }
        }
    }
}

impl<T, I: NodeIndex, H: NodeHeight> fmt::Debug for TreeArena<T, I, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeArena")
            .field("max_elements", &self.max_elements)
            .field("run_pages", &self.run)
            .field("stats", &self.stats())
            .finish()
    }
}
