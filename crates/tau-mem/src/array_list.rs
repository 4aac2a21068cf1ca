//! Page-committing growable array.
//!
//! An [`ArrayList`] reserves address space for its maximum capacity up front
//! and commits pages only as elements are added, so it never reallocates and
//! element addresses never move while the element stays in place.
//!
//! # Layout
//!
//! ```text
//! ┌──────────── page 0 ────────────┬── page 1 ──┬─ ... ─┬─ reserved only ─┐
//! │ header (64 B) │ e0 │ e1 │ ...  │    ...     │       │                 │
//! └────────────────────────────────┴────────────┴───────┴─────────────────┘
//! ```
//!
//! The header holds the handle reference count, element count, bytes used
//! (header included) and committed page count. At least the first page stays
//! committed while any handle exists.
//!
//! # Sharing
//!
//! Cloning a handle shares the storage and bumps the reference count; so
//! does creating a [`Cursor`]. Mutation requires the storage to be unshared
//! and otherwise fails with [`Error::SharedHandle`], which keeps shared
//! handles read-only the same way `Arc::get_mut` does.
//!
//! # Removal
//!
//! [`ArrayList::remove_fast`] moves the last element into the hole and does
//! not preserve order. [`ArrayList::remove`] shifts every later element down
//! one slot. Either way, once two pages of slack sit past the used bytes,
//! trailing pages are decommitted.
//!
//! # Example
//!
//! ```
//! use tau_mem::array_list::ArrayList;
//!
//! let mut list = ArrayList::<u64>::new(10_000).unwrap();
//! for i in 0..100 {
//!     list.add(i).unwrap();
//! }
//! assert_eq!(list.len(), 100);
//! assert_eq!(list.remove_fast(0).unwrap(), 0);
//! assert_eq!(list[0], 99);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Index;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{self, AtomicUsize, Ordering};

use tau_log::trace;

use crate::error::{Error, Result};
use crate::page::PageAllocator;
use crate::rc::MAX_REFCOUNT;

/// How elements are moved when a removal closes a gap.
pub trait Relocation {
    /// Moves `count` values from `src` to `dst`.
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `count` values; they may overlap. The
    /// source values are logically moved out and must not be dropped.
    unsafe fn relocate<T>(src: *const T, dst: *mut T, count: usize);
}

/// Moves the whole run with one bytewise copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemCopy;

/// Moves elements one at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveConstruct;

impl Relocation for MemCopy {
    #[inline]
    unsafe fn relocate<T>(src: *const T, dst: *mut T, count: usize) {
        // SAFETY: forwarded contract; `copy` tolerates overlap.
        unsafe { ptr::copy(src, dst, count) }
    }
}

impl Relocation for MoveConstruct {
    unsafe fn relocate<T>(src: *const T, dst: *mut T, count: usize) {
        // Walk in the direction that never overwrites an unread source.
        // SAFETY: forwarded contract.
        unsafe {
            if (dst as usize) < (src as usize) {
                for i in 0..count {
                    dst.add(i).write(src.add(i).read());
                }
            } else {
                for i in (0..count).rev() {
                    dst.add(i).write(src.add(i).read());
                }
            }
        }
    }
}

#[repr(C, align(64))]
struct ListHeader {
    ref_count: AtomicUsize,
    len: usize,
    used_bytes: usize,
    committed_pages: usize,
    reserved_pages: usize,
    capacity: usize,
}

/// Offset of the first element from the start of the storage.
const fn data_offset<T>() -> usize {
    mem::size_of::<ListHeader>().next_multiple_of(mem::align_of::<T>())
}

/// Pointer to the first element slot.
///
/// # Safety
///
/// `header` must point at live list storage for `T`.
#[inline]
unsafe fn data_ptr<T>(header: NonNull<ListHeader>) -> *mut T {
    // SAFETY: the element area starts inside the first committed page.
    unsafe { header.as_ptr().cast::<u8>().add(data_offset::<T>()).cast() }
}

/// Drops one reference; at zero drops the elements and frees the pages.
///
/// # Safety
///
/// The caller must own one reference on `header` and give it up.
unsafe fn release_storage<T>(header: NonNull<ListHeader>) {
    let raw = header.as_ptr();
    // SAFETY: the caller's reference keeps the storage alive until here.
    if unsafe { (*raw).ref_count.fetch_sub(1, Ordering::Release) } != 1 {
        return;
    }
    atomic::fence(Ordering::Acquire);
    // SAFETY: no other handle or cursor remains.
    unsafe {
        let len = (*raw).len;
        let reserved = (*raw).reserved_pages;
        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(data_ptr::<T>(header), len));
        PageAllocator::free(header.cast(), reserved);
    }
}

/// Takes one more reference on `header`.
///
/// # Safety
///
/// `header` must point at live list storage.
unsafe fn retain_storage(header: NonNull<ListHeader>) {
    // SAFETY: forwarded contract.
    let old = unsafe { (*header.as_ptr()).ref_count.fetch_add(1, Ordering::Relaxed) };
    if old >= MAX_REFCOUNT {
        panic!("Reference count overflow in ArrayList");
    }
}

/// Growable array over a page reservation.
///
/// `R` selects how elements are relocated on removal; see [`Relocation`].
pub struct ArrayList<T, R: Relocation = MemCopy> {
    header: NonNull<ListHeader>,
    _marker: PhantomData<(T, R)>,
}

// SAFETY: shared handles only read; mutation requires the storage to be
// unshared. That is the `Arc` contract, so the same bounds apply.
unsafe impl<T: Send + Sync, R: Relocation> Send for ArrayList<T, R> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync, R: Relocation> Sync for ArrayList<T, R> {}

impl<T, R: Relocation> ArrayList<T, R> {
    /// Reserves room for `capacity` elements and commits the first page.
    pub fn new(capacity: usize) -> Result<Self> {
        let page = PageAllocator::page_size();
        if mem::align_of::<T>() > page {
            return Err(Error::InvalidAlignment {
                alignment: mem::align_of::<T>(),
            });
        }
        let bytes = mem::size_of::<T>()
            .checked_mul(capacity)
            .and_then(|b| b.checked_add(data_offset::<T>()))
            .ok_or(Error::OutOfAddressSpace { pages: usize::MAX })?;
        let reserved = PageAllocator::pages_for(bytes).max(1);

        let base = PageAllocator::reserve(reserved)?;
        // SAFETY: the first page lies in the fresh reservation.
        if let Err(err) = unsafe { PageAllocator::commit_page(base) } {
            // SAFETY: nothing references the reservation yet.
            unsafe { PageAllocator::free(base, reserved) };
            return Err(err);
        }

        let header = base.cast::<ListHeader>();
        // SAFETY: the first page is committed and page aligned.
        unsafe {
            header.write(ListHeader {
                ref_count: AtomicUsize::new(1),
                len: 0,
                used_bytes: data_offset::<T>(),
                committed_pages: 1,
                reserved_pages: reserved,
                capacity,
            });
        }
        trace!("array list for {} elements over {} pages", capacity, reserved);
        Ok(ArrayList {
            header,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &ListHeader {
        // SAFETY: the storage is alive while this handle exists.
        unsafe { self.header.as_ref() }
    }

    /// # Safety
    ///
    /// The storage must be unshared (checked by `check_unique`).
    #[inline]
    unsafe fn header_mut(&mut self) -> &mut ListHeader {
        // SAFETY: forwarded contract.
        unsafe { self.header.as_mut() }
    }

    #[inline]
    fn data(&self) -> *mut T {
        // SAFETY: the storage is alive while this handle exists.
        unsafe { data_ptr::<T>(self.header) }
    }

    fn check_unique(&self) -> Result<()> {
        if self.is_unique() {
            Ok(())
        } else {
            Err(Error::SharedHandle)
        }
    }

    /// Number of live elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.header().len
    }

    /// Returns true if there are no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of elements.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.header().capacity
    }

    /// Pages currently committed.
    #[inline]
    pub fn committed_pages(&self) -> usize {
        self.header().committed_pages
    }

    /// Pages reserved for the full capacity.
    #[inline]
    pub fn reserved_pages(&self) -> usize {
        self.header().reserved_pages
    }

    /// Bytes in use, header included.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.header().used_bytes
    }

    /// Handles and cursors sharing the storage.
    pub fn ref_count(&self) -> usize {
        self.header().ref_count.load(Ordering::Acquire)
    }

    /// Returns true if this handle is the only reference to the storage.
    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    /// Returns true if both handles share storage.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.header == b.header
    }

    /// The live elements.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized and committed.
        unsafe { slice::from_raw_parts(self.data(), self.len()) }
    }

    /// Iterates over the live elements.
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Bounds-checked access.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Unchecked access.
    ///
    /// # Safety
    ///
    /// `index` must be less than [`ArrayList::len`].
    #[inline]
    pub unsafe fn get_unchecked(&self, index: usize) -> &T {
        // SAFETY: forwarded contract.
        unsafe { &*self.data().add(index) }
    }

    /// Bounds-checked mutable access; `None` when shared or out of range.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if !self.is_unique() || index >= self.len() {
            return None;
        }
        // SAFETY: in range, and no other handle can observe the element.
        Some(unsafe { &mut *self.data().add(index) })
    }

    /// Mutable view of the live elements; `None` when shared.
    pub fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        if !self.is_unique() {
            return None;
        }
        // SAFETY: unshared, and the first `len` slots are initialized.
        Some(unsafe { slice::from_raw_parts_mut(self.data(), self.len()) })
    }

    /// Ensures a committed slot exists past the last element and returns it.
    fn next_slot(&mut self) -> Result<*mut T> {
        self.check_unique()?;
        let page = PageAllocator::page_size();
        let base = self.header.cast::<u8>();
        let data = self.data();
        // SAFETY: checked unique above.
        let header = unsafe { self.header_mut() };
        if header.len == header.capacity {
            return Err(Error::CapacityExceeded {
                capacity: header.capacity,
            });
        }

        let needed = header.used_bytes + mem::size_of::<T>();
        let committed_bytes = header.committed_pages * page;
        if needed > committed_bytes {
            let extra = (needed - committed_bytes).div_ceil(page);
            if header.committed_pages + extra > header.reserved_pages {
                return Err(Error::CapacityExceeded {
                    capacity: header.capacity,
                });
            }
            // SAFETY: the pages lie inside the reservation, right after the
            // committed prefix.
            unsafe { PageAllocator::commit_pages(base.add(committed_bytes), extra)? };
            header.committed_pages += extra;
            trace!("array list grew to {} pages", header.committed_pages);
        }
        // SAFETY: the slot is committed and inside the reservation.
        Ok(unsafe { data.add(header.len) })
    }

    /// Records one more element after its slot was written.
    fn commit_push(&mut self) -> usize {
        // SAFETY: only called after `next_slot` checked uniqueness.
        let header = unsafe { self.header_mut() };
        let index = header.len;
        header.len += 1;
        header.used_bytes += mem::size_of::<T>();
        index
    }

    /// Appends `value`.
    pub fn add(&mut self, value: T) -> Result<()> {
        self.emplace(|| value).map(|_| ())
    }

    /// Appends the value produced by `make`, constructed in place.
    pub fn emplace<F: FnOnce() -> T>(&mut self, make: F) -> Result<&mut T> {
        let slot = self.next_slot()?;
        // SAFETY: the slot is committed and unoccupied.
        unsafe { slot.write(make()) };
        self.commit_push();
        // SAFETY: just initialized.
        Ok(unsafe { &mut *slot })
    }

    /// Appends a value built from its future index and returns that index.
    pub fn placement<F: FnOnce(usize) -> T>(&mut self, make: F) -> Result<usize> {
        let slot = self.next_slot()?;
        let index = self.len();
        // SAFETY: the slot is committed and unoccupied.
        unsafe { slot.write(make(index)) };
        Ok(self.commit_push())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        self.check_unique()?;
        let len = self.len();
        if index < len {
            Ok(())
        } else {
            Err(Error::IndexOutOfBounds { index, len })
        }
    }

    /// Shrinks the element count by one after a removal.
    fn commit_pop(&mut self) {
        // SAFETY: only called after `check_index` checked uniqueness.
        let header = unsafe { self.header_mut() };
        header.len -= 1;
        header.used_bytes -= mem::size_of::<T>();
        self.attempt_release();
    }

    /// Removes the element at `index`, filling the hole with the last one.
    ///
    /// Does not preserve order. Removing the last element relocates nothing.
    pub fn remove_fast(&mut self, index: usize) -> Result<T> {
        self.check_index(index)?;
        let data = self.data();
        let last = self.len() - 1;
        // SAFETY: `index` and `last` are live slots; the removed value is
        // read out before the last one is moved over it.
        let value = unsafe {
            let value = data.add(index).read();
            if index != last {
                R::relocate(data.add(last), data.add(index), 1);
            }
            value
        };
        self.commit_pop();
        Ok(value)
    }

    /// Removes the element at `index`, shifting later elements down.
    pub fn remove(&mut self, index: usize) -> Result<T> {
        self.check_index(index)?;
        let data = self.data();
        let len = self.len();
        // SAFETY: `index < len`; the tail is moved down over the hole left
        // by the read.
        let value = unsafe {
            let value = data.add(index).read();
            R::relocate(data.add(index + 1), data.add(index), len - index - 1);
            value
        };
        self.commit_pop();
        Ok(value)
    }

    /// Removes and returns the last element, or `None` when empty.
    pub fn pop(&mut self) -> Result<Option<T>> {
        self.check_unique()?;
        match self.len().checked_sub(1) {
            Some(last) => self.remove_fast(last).map(Some),
            None => Ok(None),
        }
    }

    /// Decommits trailing pages while two pages of slack remain.
    fn attempt_release(&mut self) {
        let page = PageAllocator::page_size();
        let base = self.header.cast::<u8>();
        // SAFETY: callers hold unique access.
        let header = unsafe { self.header_mut() };
        while header.committed_pages > 1
            && header.committed_pages * page - header.used_bytes >= 2 * page
        {
            header.committed_pages -= 1;
            // SAFETY: the page is committed, past every live element, and
            // not the header page.
            unsafe { PageAllocator::decommit_page(base.add(header.committed_pages * page)) };
            trace!("array list shrank to {} pages", header.committed_pages);
        }
    }

    /// Drops every element.
    ///
    /// With `release_pages`, every page but the first is decommitted.
    pub fn clear(&mut self, release_pages: bool) -> Result<()> {
        self.check_unique()?;
        let page = PageAllocator::page_size();
        let base = self.header.cast::<u8>();
        let data = self.data();
        // SAFETY: checked unique above.
        let header = unsafe { self.header_mut() };
        let len = mem::replace(&mut header.len, 0);
        header.used_bytes = data_offset::<T>();
        // SAFETY: the first `len` slots were initialized; the count is
        // already zero, so a panicking drop cannot cause a double drop.
        unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(data, len)) };

        if release_pages && header.committed_pages > 1 {
            // SAFETY: pages past the first hold no live elements now.
            unsafe { PageAllocator::decommit_pages(base.add(page), header.committed_pages - 1) };
            header.committed_pages = 1;
        }
        Ok(())
    }

    /// A counted cursor positioned at the first element.
    ///
    /// The cursor keeps the storage alive even after every handle is gone.
    pub fn cursor(&self) -> Cursor<T, R> {
        // SAFETY: the storage is alive while this handle exists.
        unsafe { retain_storage(self.header) };
        Cursor {
            header: self.header,
            index: 0,
            _marker: PhantomData,
        }
    }
}

impl<T, R: Relocation> Clone for ArrayList<T, R> {
    /// Shares the storage.
    fn clone(&self) -> Self {
        // SAFETY: the storage is alive while this handle exists.
        unsafe { retain_storage(self.header) };
        ArrayList {
            header: self.header,
            _marker: PhantomData,
        }
    }
}

impl<T, R: Relocation> Drop for ArrayList<T, R> {
    fn drop(&mut self) {
        // SAFETY: this handle owns one reference.
        unsafe { release_storage::<T>(self.header) };
    }
}

impl<T, R: Relocation> Index<usize> for ArrayList<T, R> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!(
                "index {index} out of bounds for ArrayList of length {}",
                self.len()
            ),
        }
    }
}

impl<'a, T, R: Relocation> IntoIterator for &'a ArrayList<T, R> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: fmt::Debug, R: Relocation> fmt::Debug for ArrayList<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Bidirectional position in an [`ArrayList`] that holds a reference.
///
/// While a cursor exists the storage is shared, so no handle can mutate it.
/// When `T: Clone` the cursor is also an iterator yielding clones from its
/// position onwards.
pub struct Cursor<T, R: Relocation = MemCopy> {
    header: NonNull<ListHeader>,
    index: usize,
    _marker: PhantomData<(T, R)>,
}

// SAFETY: a cursor only reads, like a shared handle.
unsafe impl<T: Send + Sync, R: Relocation> Send for Cursor<T, R> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync, R: Relocation> Sync for Cursor<T, R> {}

impl<T, R: Relocation> Cursor<T, R> {
    fn list_len(&self) -> usize {
        // SAFETY: the cursor's reference keeps the storage alive.
        unsafe { (*self.header.as_ptr()).len }
    }

    /// Current position.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Element at the current position, if any.
    pub fn get(&self) -> Option<&T> {
        if self.index < self.list_len() {
            // SAFETY: in range; the storage cannot change while shared.
            Some(unsafe { &*data_ptr::<T>(self.header).add(self.index) })
        } else {
            None
        }
    }

    /// Steps forward; stops one past the last element.
    pub fn move_next(&mut self) {
        if self.index < self.list_len() {
            self.index += 1;
        }
    }

    /// Steps back; stops at the first element.
    pub fn move_prev(&mut self) {
        self.index = self.index.saturating_sub(1);
    }

    /// Moves to `index`, clamped to one past the last element.
    pub fn seek(&mut self, index: usize) {
        self.index = index.min(self.list_len());
    }
}

impl<T, R: Relocation> Clone for Cursor<T, R> {
    fn clone(&self) -> Self {
        // SAFETY: the storage is alive while this cursor exists.
        unsafe { retain_storage(self.header) };
        Cursor {
            header: self.header,
            index: self.index,
            _marker: PhantomData,
        }
    }
}

impl<T, R: Relocation> Drop for Cursor<T, R> {
    fn drop(&mut self) {
        // SAFETY: this cursor owns one reference.
        unsafe { release_storage::<T>(self.header) };
    }
}

impl<T: Clone, R: Relocation> Iterator for Cursor<T, R> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let value = self.get().cloned()?;
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.list_len() - self.index;
        (remaining, Some(remaining))
    }
}

impl<T: Clone, R: Relocation> ExactSizeIterator for Cursor<T, R> {}

impl<T, R: Relocation> fmt::Debug for Cursor<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("index", &self.index)
            .field("len", &self.list_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pages_for_elements<T>(count: usize) -> usize {
        PageAllocator::pages_for(data_offset::<T>() + count * mem::size_of::<T>())
    }

    #[test]
    fn test_new_commits_one_page() {
        let list = ArrayList::<u32>::new(100_000).unwrap();
        assert_eq!(list.len(), 0);
        assert_eq!(list.committed_pages(), 1);
        assert_eq!(list.used_bytes(), mem::size_of::<ListHeader>());
        assert_eq!(list.ref_count(), 1);
        assert!(list.reserved_pages() >= pages_for_elements::<u32>(100_000));
    }

    #[test]
    fn test_first_add_counts_one() {
        let mut list = ArrayList::<String>::new(8).unwrap();
        list.add("a".to_owned()).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).map(String::as_str), Some("a"));
        assert!(list.get(1).is_none());
    }

    #[test]
    fn test_commit_tracks_usage() {
        let mut list = ArrayList::<u64>::new(10_000).unwrap();
        for i in 0..5_000u64 {
            list.add(i).unwrap();
        }
        assert_eq!(list.committed_pages(), pages_for_elements::<u64>(5_000));
        assert_eq!(list.as_slice()[4_999], 4_999);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut list = ArrayList::<u8>::new(2).unwrap();
        list.add(1).unwrap();
        list.add(2).unwrap();
        assert_eq!(list.add(3), Err(Error::CapacityExceeded { capacity: 2 }));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_fast_swaps_last() {
        let mut list = ArrayList::<u32>::new(16).unwrap();
        for i in 0..5 {
            list.add(i).unwrap();
        }
        assert_eq!(list.remove_fast(1), Ok(1));
        assert_eq!(list.as_slice(), &[0, 4, 2, 3]);

        // The tail is popped without relocation.
        assert_eq!(list.remove_fast(3), Ok(3));
        assert_eq!(list.as_slice(), &[0, 4, 2]);
        assert_eq!(
            list.remove_fast(3),
            Err(Error::IndexOutOfBounds { index: 3, len: 3 })
        );
    }

    #[test]
    fn test_pop() {
        let mut list = ArrayList::<String>::new(4).unwrap();
        assert_eq!(list.pop(), Ok(None));
        list.add("x".to_owned()).unwrap();
        list.add("y".to_owned()).unwrap();
        assert_eq!(list.pop(), Ok(Some("y".to_owned())));
        assert_eq!(list.len(), 1);

        let shared = list.clone();
        assert_eq!(list.pop(), Err(Error::SharedHandle));
        drop(shared);
        assert_eq!(list.pop(), Ok(Some("x".to_owned())));
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut list = ArrayList::<u32, MoveConstruct>::new(16).unwrap();
        for i in 0..6 {
            list.add(i).unwrap();
        }
        assert_eq!(list.remove(2), Ok(2));
        assert_eq!(list.as_slice(), &[0, 1, 3, 4, 5]);
        assert_eq!(list.remove(4), Ok(5));
        assert_eq!(list.as_slice(), &[0, 1, 3, 4]);
    }

    #[test]
    fn test_move_construct_with_owned_values() {
        let mut list = ArrayList::<String, MoveConstruct>::new(8).unwrap();
        for word in ["a", "b", "c", "d"] {
            list.add(word.to_owned()).unwrap();
        }
        assert_eq!(list.remove_fast(0).unwrap(), "a");
        assert_eq!(list.remove(0).unwrap(), "d");
        let rest: Vec<&str> = list.iter().map(String::as_str).collect();
        assert_eq!(rest, ["b", "c"]);
    }

    #[test]
    fn test_remove_fast_shrinks_pages() {
        let mut list = ArrayList::<u64>::new(10_000).unwrap();
        for i in 0..5_000 {
            list.add(i).unwrap();
        }
        let grown = list.committed_pages();
        for _ in 0..4_999 {
            list.remove_fast(0).unwrap();
        }
        assert_eq!(list.len(), 1);
        assert!(list.committed_pages() < grown);
        assert!(list.committed_pages() <= 2);
    }

    #[test]
    fn test_clear_resets_and_releases() {
        let drops = AtomicUsize::new(0);
        struct Noisy<'a>(&'a AtomicUsize, [u8; 100]);
        impl Drop for Noisy<'_> {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut list = ArrayList::<Noisy<'_>>::new(1_000).unwrap();
        for _ in 0..200 {
            list.add(Noisy(&drops, [0; 100])).unwrap();
        }
        assert!(list.committed_pages() > 1);

        list.clear(true).unwrap();
        assert_eq!(list.len(), 0);
        assert_eq!(list.committed_pages(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 200);

        list.add(Noisy(&drops, [1; 100])).unwrap();
        assert_eq!(list.len(), 1);
        drop(list);
        assert_eq!(drops.load(Ordering::SeqCst), 201);
    }

    #[test]
    fn test_clear_keeps_pages_when_asked() {
        let mut list = ArrayList::<u64>::new(10_000).unwrap();
        for i in 0..2_000 {
            list.add(i).unwrap();
        }
        let committed = list.committed_pages();
        list.clear(false).unwrap();
        assert_eq!(list.committed_pages(), committed);
        assert!(list.is_empty());
    }

    #[test]
    fn test_shared_handles_are_read_only() {
        let mut list = ArrayList::<u32>::new(4).unwrap();
        list.add(1).unwrap();
        let other = list.clone();
        assert_eq!(list.ref_count(), 2);
        assert!(ArrayList::ptr_eq(&list, &other));

        assert_eq!(list.add(2), Err(Error::SharedHandle));
        assert!(list.get_mut(0).is_none());
        assert_eq!(other[0], 1);

        drop(other);
        list.add(2).unwrap();
        *list.get_mut(0).unwrap() = 10;
        assert_eq!(list.as_slice(), &[10, 2]);
    }

    #[test]
    fn test_cursor_outlives_handles() {
        let mut list = ArrayList::<String>::new(4).unwrap();
        list.add("x".into()).unwrap();
        list.add("y".into()).unwrap();

        let mut cursor = list.cursor();
        let copy = list.clone();
        assert_eq!(list.ref_count(), 3);
        drop(list);
        drop(copy);

        assert_eq!(cursor.get().map(String::as_str), Some("x"));
        cursor.move_next();
        assert_eq!(cursor.get().map(String::as_str), Some("y"));
        cursor.move_next();
        cursor.move_next();
        assert!(cursor.get().is_none());
        assert_eq!(cursor.index(), 2);
        cursor.move_prev();
        assert_eq!(cursor.get().map(String::as_str), Some("y"));
    }

    #[test]
    fn test_cursor_iterates_clones() {
        let mut list = ArrayList::<u16>::new(8).unwrap();
        for i in 0..4 {
            list.add(i).unwrap();
        }
        let mut cursor = list.cursor();
        cursor.seek(1);
        assert_eq!(cursor.len(), 3);
        let rest: Vec<u16> = cursor.collect();
        assert_eq!(rest, [1, 2, 3]);
        assert!(list.is_unique());
    }

    #[test]
    fn test_emplace_and_placement() {
        let mut list = ArrayList::<(usize, &str)>::new(4).unwrap();
        list.emplace(|| (0, "zero")).unwrap().1 = "first";
        let index = list.placement(|i| (i, "second")).unwrap();
        assert_eq!(index, 1);
        assert_eq!(list.as_slice(), &[(0, "first"), (1, "second")]);
    }

    #[test]
    fn test_large_elements_commit_multiple_pages() {
        let page = PageAllocator::page_size();
        let mut list = ArrayList::<[u8; 10_000]>::new(4).unwrap();
        list.add([7; 10_000]).unwrap();
        assert_eq!(list.committed_pages(), (64 + 10_000usize).div_ceil(page));
        assert_eq!(list[0][9_999], 7);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_index_panics_out_of_range() {
        let list = ArrayList::<u8>::new(1).unwrap();
        let _ = list[0];
    }

    #[test]
    fn test_zero_sized_elements() {
        let mut list = ArrayList::<()>::new(3).unwrap();
        list.add(()).unwrap();
        list.add(()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.committed_pages(), 1);
        list.remove(0).unwrap();
        assert_eq!(list.len(), 1);
    }
}
