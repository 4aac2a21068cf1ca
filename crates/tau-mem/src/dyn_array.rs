//! Fixed-length heap arrays.
//!
//! - [`DynArray`]: single owner. Cloning copies the elements into a new
//!   buffer; moving transfers the buffer.
//! - [`RefDynArray`]: shared. One allocation holds an atomic counter, the
//!   length and the elements; clones share it, and the elements are dropped
//!   when the last handle or [`RefDynIter`] goes away.
//!
//! Both obtain their storage from a [`HeapAllocator`] (the default one unless
//! an `*_in` constructor is used).

use std::alloc::{Layout, handle_alloc_error};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{self, AtomicUsize, Ordering};

use crate::alloc::{HeapAllocator, default_allocator};
use crate::error::{Error, Result};
use crate::rc::MAX_REFCOUNT;

/// Drops the initialized prefix if filling a buffer panics.
struct Fill<T> {
    data: *mut T,
    initialized: usize,
}

impl<T> Fill<T> {
    /// Writes `len` values from `f` into `data`.
    ///
    /// # Safety
    ///
    /// `data` must be valid for writes of `len` values.
    unsafe fn run(data: *mut T, len: usize, mut f: impl FnMut(usize) -> T) {
        let mut fill = Fill {
            data,
            initialized: 0,
        };
        while fill.initialized < len {
            let value = f(fill.initialized);
            // SAFETY: in bounds per the caller.
            unsafe { fill.data.add(fill.initialized).write(value) };
            fill.initialized += 1;
        }
        mem::forget(fill);
    }
}

impl<T> Drop for Fill<T> {
    fn drop(&mut self) {
        // SAFETY: exactly the first `initialized` values were written.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.data, self.initialized));
        }
    }
}

fn array_layout<T>(len: usize) -> Result<Layout> {
    Layout::array::<T>(len).map_err(|_| Error::OutOfMemory {
        size: len.saturating_mul(mem::size_of::<T>()),
    })
}

/// Owned fixed-length array.
pub struct DynArray<T> {
    data: NonNull<T>,
    len: usize,
    allocator: &'static dyn HeapAllocator,
}

// SAFETY: the array owns its elements like a `Box<[T]>`.
unsafe impl<T: Send> Send for DynArray<T> {}
// SAFETY: see above.
unsafe impl<T: Sync> Sync for DynArray<T> {}

impl<T> DynArray<T> {
    /// Builds `len` elements from `f(index)` using the default allocator.
    pub fn from_fn(len: usize, f: impl FnMut(usize) -> T) -> Result<Self> {
        Self::from_fn_in(len, default_allocator(), f)
    }

    /// Builds `len` elements from `f(index)` using `allocator`.
    pub fn from_fn_in(
        len: usize,
        allocator: &'static dyn HeapAllocator,
        f: impl FnMut(usize) -> T,
    ) -> Result<Self> {
        let layout = array_layout::<T>(len)?;
        let data = allocator.allocate(layout)?.cast::<T>();

        struct Free {
            data: NonNull<u8>,
            layout: Layout,
            allocator: &'static dyn HeapAllocator,
        }
        impl Drop for Free {
            fn drop(&mut self) {
                // SAFETY: the block came from this allocator with this layout.
                unsafe { self.allocator.deallocate(self.data, self.layout) };
            }
        }

        // Returns the block if `f` panics.
        let free = Free {
            data: data.cast(),
            layout,
            allocator,
        };
        // SAFETY: the block holds `len` values.
        unsafe { Fill::run(data.as_ptr(), len, f) };
        mem::forget(free);

        Ok(DynArray {
            data,
            len,
            allocator,
        })
    }

    /// Clones every element of `values`.
    pub fn from_slice(values: &[T]) -> Result<Self>
    where
        T: Clone,
    {
        Self::from_fn(values.len(), |i| values[i].clone())
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the array holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The elements.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: `len` initialized values.
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// The elements, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: `len` initialized values, exclusively owned.
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    /// Allocator that owns the buffer.
    pub fn allocator(&self) -> &'static dyn HeapAllocator {
        self.allocator
    }

    /// Copies the elements into a new buffer from the same allocator.
    pub fn try_clone(&self) -> Result<Self>
    where
        T: Clone,
    {
        let values = self.as_slice();
        Self::from_fn_in(self.len, self.allocator, |i| values[i].clone())
    }
}

impl<T: Default> DynArray<T> {
    /// `len` default values from the default allocator.
    pub fn new(len: usize) -> Result<Self> {
        Self::from_fn(len, |_| T::default())
    }

    /// `len` default values from `allocator`.
    pub fn new_in(len: usize, allocator: &'static dyn HeapAllocator) -> Result<Self> {
        Self::from_fn_in(len, allocator, |_| T::default())
    }
}

impl<T> Drop for DynArray<T> {
    fn drop(&mut self) {
        // SAFETY: the values are initialized and the block came from
        // `self.allocator` with this layout.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.data.as_ptr(), self.len));
            if let Ok(layout) = Layout::array::<T>(self.len) {
                self.allocator.deallocate(self.data.cast(), layout);
            }
        }
    }
}

impl<T: Clone> Clone for DynArray<T> {
    /// Deep copy.
    ///
    /// # Panics
    ///
    /// Aborts through [`handle_alloc_error`] when the allocator fails; use
    /// [`DynArray::try_clone`] to handle that case.
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(copy) => copy,
            Err(_) => handle_alloc_error(
                Layout::array::<T>(self.len).unwrap_or(Layout::new::<T>()),
            ),
        }
    }
}

impl<T> Deref for DynArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for DynArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<'a, T> IntoIterator for &'a DynArray<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl<T: PartialEq> PartialEq for DynArray<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: fmt::Debug> fmt::Debug for DynArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[repr(C)]
struct SharedHeader {
    count: AtomicUsize,
    len: usize,
    allocator: &'static dyn HeapAllocator,
}

/// Layout of a shared block and the offset of its elements.
fn shared_layout<T>(len: usize) -> Result<(Layout, usize)> {
    let (layout, offset) = Layout::new::<SharedHeader>()
        .extend(array_layout::<T>(len)?)
        .map_err(|_| Error::OutOfMemory { size: usize::MAX })?;
    Ok((layout.pad_to_align(), offset))
}

/// # Safety
///
/// `header` must point at a live shared block for `T`.
unsafe fn shared_data<T>(header: NonNull<SharedHeader>) -> *mut T {
    // SAFETY: forwarded contract.
    let len = unsafe { (*header.as_ptr()).len };
    // The layout was computed successfully when the block was made.
    let offset = shared_layout::<T>(len).map_or(0, |(_, offset)| offset);
    // SAFETY: the elements start `offset` bytes into the block.
    unsafe { header.as_ptr().cast::<u8>().add(offset).cast() }
}

/// # Safety
///
/// `header` must point at a live shared block.
unsafe fn retain_shared(header: NonNull<SharedHeader>) {
    // SAFETY: forwarded contract.
    let old = unsafe { (*header.as_ptr()).count.fetch_add(1, Ordering::Relaxed) };
    if old >= MAX_REFCOUNT {
        panic!("Reference count overflow in RefDynArray");
    }
}

/// # Safety
///
/// The caller must own one count on `header` and give it up.
unsafe fn release_shared<T>(header: NonNull<SharedHeader>) {
    let raw = header.as_ptr();
    // SAFETY: the caller's count keeps the block alive until here.
    if unsafe { (*raw).count.fetch_sub(1, Ordering::Release) } != 1 {
        return;
    }
    atomic::fence(Ordering::Acquire);
    // SAFETY: last holder; the block came from the stored allocator.
    unsafe {
        let len = (*raw).len;
        let allocator = (*raw).allocator;
        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(shared_data::<T>(header), len));
        if let Ok((layout, _)) = shared_layout::<T>(len) {
            allocator.deallocate(header.cast(), layout);
        }
    }
}

/// Shared fixed-length array.
///
/// Handles give shared, read-only access; [`RefDynArray::get_mut`] grants
/// mutation when no other handle or iterator exists.
pub struct RefDynArray<T> {
    header: NonNull<SharedHeader>,
    _owns: PhantomData<T>,
}

// SAFETY: `Arc<[T]>` rules.
unsafe impl<T: Send + Sync> Send for RefDynArray<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for RefDynArray<T> {}

impl<T> RefDynArray<T> {
    /// Builds `len` elements from `f(index)` using the default allocator.
    pub fn from_fn(len: usize, f: impl FnMut(usize) -> T) -> Result<Self> {
        Self::from_fn_in(len, default_allocator(), f)
    }

    /// Builds `len` elements from `f(index)` using `allocator`.
    pub fn from_fn_in(
        len: usize,
        allocator: &'static dyn HeapAllocator,
        f: impl FnMut(usize) -> T,
    ) -> Result<Self> {
        let (layout, offset) = shared_layout::<T>(len)?;
        let block = allocator.allocate(layout)?;
        let header = block.cast::<SharedHeader>();

        // Until the handle exists, a panic in `f` must return the block.
        struct Free {
            block: NonNull<u8>,
            layout: Layout,
            allocator: &'static dyn HeapAllocator,
        }
        impl Drop for Free {
            fn drop(&mut self) {
                // SAFETY: the block came from this allocator with this layout.
                unsafe { self.allocator.deallocate(self.block, self.layout) };
            }
        }
        let free = Free {
            block,
            layout,
            allocator,
        };
        // SAFETY: the element area starts at `offset` and holds `len` values.
        unsafe { Fill::run(block.as_ptr().add(offset).cast::<T>(), len, f) };
        mem::forget(free);

        // SAFETY: the header slot is at offset zero of the fresh block.
        unsafe {
            header.write(SharedHeader {
                count: AtomicUsize::new(1),
                len,
                allocator,
            });
        }
        Ok(RefDynArray {
            header,
            _owns: PhantomData,
        })
    }

    /// Clones every element of `values`.
    pub fn from_slice(values: &[T]) -> Result<Self>
    where
        T: Clone,
    {
        Self::from_fn(values.len(), |i| values[i].clone())
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        // SAFETY: alive while this handle exists.
        unsafe { (*self.header.as_ptr()).len }
    }

    /// Returns true when the array holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The elements.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: `len` initialized values, alive while this handle exists.
        unsafe { slice::from_raw_parts(shared_data::<T>(self.header), self.len()) }
    }

    /// Mutable access when this is the only holder.
    pub fn get_mut(&mut self) -> Option<&mut [T]> {
        if !self.is_unique() {
            return None;
        }
        // SAFETY: no other handle or iterator exists.
        Some(unsafe { slice::from_raw_parts_mut(shared_data::<T>(self.header), self.len()) })
    }

    /// Handles and iterators sharing the buffer.
    pub fn ref_count(&self) -> usize {
        // SAFETY: alive while this handle exists.
        unsafe { (*self.header.as_ptr()).count.load(Ordering::Acquire) }
    }

    /// Returns true if this handle is the only holder.
    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    /// Returns true if both handles share a buffer.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.header == b.header
    }

    /// Iterator that keeps the buffer alive on its own.
    pub fn counted_iter(&self) -> RefDynIter<T> {
        // SAFETY: alive while this handle exists.
        unsafe { retain_shared(self.header) };
        RefDynIter {
            header: self.header,
            front: 0,
            back: self.len(),
            _owns: PhantomData,
        }
    }
}

impl<T: Default> RefDynArray<T> {
    /// `len` default values from the default allocator.
    pub fn new(len: usize) -> Result<Self> {
        Self::from_fn(len, |_| T::default())
    }

    /// `len` default values from `allocator`.
    pub fn new_in(len: usize, allocator: &'static dyn HeapAllocator) -> Result<Self> {
        Self::from_fn_in(len, allocator, |_| T::default())
    }
}

impl<T> Clone for RefDynArray<T> {
    /// Shares the buffer.
    fn clone(&self) -> Self {
        // SAFETY: alive while this handle exists.
        unsafe { retain_shared(self.header) };
        RefDynArray {
            header: self.header,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for RefDynArray<T> {
    fn drop(&mut self) {
        // SAFETY: this handle owns one count.
        unsafe { release_shared::<T>(self.header) };
    }
}

impl<T> Deref for RefDynArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: fmt::Debug> fmt::Debug for RefDynArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over a [`RefDynArray`] that holds its own count.
///
/// Yields clones, so it stays valid after every handle is dropped.
pub struct RefDynIter<T> {
    header: NonNull<SharedHeader>,
    front: usize,
    back: usize,
    _owns: PhantomData<T>,
}

// SAFETY: reads only, like a shared handle.
unsafe impl<T: Send + Sync> Send for RefDynIter<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for RefDynIter<T> {}

impl<T> RefDynIter<T> {
    fn at(&self, index: usize) -> &T {
        // SAFETY: `index < len`, and the count keeps the buffer alive.
        unsafe { &*shared_data::<T>(self.header).add(index) }
    }
}

impl<T: Clone> Iterator for RefDynIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.front == self.back {
            return None;
        }
        let value = self.at(self.front).clone();
        self.front += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<T: Clone> DoubleEndedIterator for RefDynIter<T> {
    fn next_back(&mut self) -> Option<T> {
        if self.front == self.back {
            return None;
        }
        self.back -= 1;
        Some(self.at(self.back).clone())
    }
}

impl<T: Clone> ExactSizeIterator for RefDynIter<T> {}

impl<T> Drop for RefDynIter<T> {
    fn drop(&mut self) {
        // SAFETY: this iterator owns one count.
        unsafe { release_shared::<T>(self.header) };
    }
}
