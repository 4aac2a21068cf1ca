//! Intrusive single-count reference-counted pointer.
//!
//! [`Rcp`] co-allocates its control block and payload in one block obtained
//! from a [`HeapAllocator`]:
//!
//! ```text
//! ┌─────────────────────────────┬──────────────┐
//! │ count │ allocator reference │   payload T  │
//! └─────────────────────────────┴──────────────┘
//!   offset 0                      offset = header size
//! ```
//!
//! The payload is dropped and the block returned to its allocator when the
//! last handle goes away. Handles may be null; a null handle owns nothing.
//! Equality is identity of the control block, not payload equality.
//!
//! For cycle-breaking weak references see [`crate::sw`].
//!
//! # Example
//!
//! ```
//! use tau_mem::rc::Rcp;
//!
//! let a = Rcp::new(String::from("shared")).unwrap();
//! let b = a.clone();
//!
//! assert_eq!(a.ref_count(), 2);
//! assert_eq!(b.get().map(String::as_str), Some("shared"));
//! assert_eq!(a, b);
//! ```

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicUsize, Ordering};

use crate::alloc::{HeapAllocator, default_allocator};
use crate::error::Result;

/// Counts above this are treated as overflow.
pub(crate) const MAX_REFCOUNT: usize = isize::MAX as usize;

#[repr(C)]
struct RcBlock<T> {
    count: AtomicUsize,
    allocator: &'static dyn HeapAllocator,
    value: T,
}

/// Reference-counted pointer with a single atomic count.
pub struct Rcp<T> {
    block: Option<NonNull<RcBlock<T>>>,
    _owns: PhantomData<RcBlock<T>>,
}

// SAFETY: like `Arc`, handles may move between threads when the payload can
// be shared between them.
unsafe impl<T: Send + Sync> Send for Rcp<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for Rcp<T> {}

impl<T> Rcp<T> {
    /// A handle that points at nothing.
    #[must_use]
    pub const fn null() -> Self {
        Rcp {
            block: None,
            _owns: PhantomData,
        }
    }

    /// Moves `value` into a new block from the default allocator.
    pub fn new(value: T) -> Result<Self> {
        Self::new_in(value, default_allocator())
    }

    /// Moves `value` into a new block from `allocator`.
    ///
    /// On failure `value` is dropped and the error returned.
    pub fn new_in(value: T, allocator: &'static dyn HeapAllocator) -> Result<Self> {
        let block = allocator
            .allocate(Layout::new::<RcBlock<T>>())?
            .cast::<RcBlock<T>>();
        // SAFETY: fresh block sized and aligned for `RcBlock<T>`. The payload
        // is written before the handle exists, so no other holder can observe
        // the count first.
        unsafe {
            block.write(RcBlock {
                count: AtomicUsize::new(1),
                allocator,
                value,
            });
        }
        Ok(Rcp {
            block: Some(block),
            _owns: PhantomData,
        })
    }

    /// Drops the current payload reference and rebinds to a new `value`.
    ///
    /// The handle is null if allocation fails.
    pub fn reset(&mut self, value: T) -> Result<()> {
        self.reset_in(value, default_allocator())
    }

    /// Like [`Rcp::reset`] with an explicit allocator.
    pub fn reset_in(&mut self, value: T, allocator: &'static dyn HeapAllocator) -> Result<()> {
        self.clear();
        *self = Self::new_in(value, allocator)?;
        Ok(())
    }

    /// Releases this handle's reference and leaves it null.
    pub fn clear(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: this handle held one count on `block`.
            unsafe { Self::release(block) };
        }
    }

    /// Returns true if the handle points at nothing.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.block.is_none()
    }

    /// Shared access to the payload.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-null handle keeps the count above zero, so the
        // payload is alive for as long as `self` is borrowed.
        self.block.map(|block| unsafe { &(*block.as_ptr()).value })
    }

    /// Exclusive access to the payload when this is the only handle.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let block = self.block?;
        // SAFETY: the block is alive while this handle exists.
        let unique = unsafe { (*block.as_ptr()).count.load(Ordering::Acquire) == 1 };
        // SAFETY: a count of one means no other handle can reach the payload,
        // and `&mut self` stops this one from being cloned meanwhile.
        unique.then(|| unsafe { &mut (*block.as_ptr()).value })
    }

    /// Current count, or 0 for a null handle.
    pub fn ref_count(&self) -> usize {
        self.block.map_or(0, |block| {
            // SAFETY: the block is alive while this handle exists.
            unsafe { (*block.as_ptr()).count.load(Ordering::Acquire) }
        })
    }

    /// Allocator that owns the block.
    pub fn allocator(&self) -> Option<&'static dyn HeapAllocator> {
        // SAFETY: the block is alive while this handle exists.
        self.block
            .map(|block| unsafe { (*block.as_ptr()).allocator })
    }

    /// Returns true if both handles share a control block (or are both null).
    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.block == b.block
    }

    /// Drops one count; frees the block at zero.
    ///
    /// # Safety
    ///
    /// The caller must own one count on `block` and give it up.
    unsafe fn release(block: NonNull<RcBlock<T>>) {
        let raw = block.as_ptr();
        // SAFETY: the caller's count keeps the block alive until here.
        if unsafe { (*raw).count.fetch_sub(1, Ordering::Release) } != 1 {
            return;
        }
        // Pairs with the release decrements of every other holder, so all
        // their payload accesses happen before the drop.
        atomic::fence(Ordering::Acquire);
        // SAFETY: the count hit zero, so this is the only access left.
        unsafe {
            let allocator = (*raw).allocator;
            ptr::drop_in_place(&raw mut (*raw).value);
            allocator.deallocate(block.cast(), Layout::new::<RcBlock<T>>());
        }
    }
}

impl<T> Clone for Rcp<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            // SAFETY: the block is alive while this handle exists.
            let old = unsafe { (*block.as_ptr()).count.fetch_add(1, Ordering::Relaxed) };
            if old >= MAX_REFCOUNT {
                panic!("Reference count overflow in Rcp::clone");
            }
        }
        Rcp {
            block: self.block,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for Rcp<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> Default for Rcp<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for Rcp<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T> Eq for Rcp<T> {}

impl<T: fmt::Debug> fmt::Debug for Rcp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rcp")
            .field("value", &self.get())
            .field("refcount", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::CountingAllocator;
    use std::sync::atomic::AtomicUsize;

    struct DropCounter<'a>(&'a AtomicUsize);

    impl Drop for DropCounter<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_payload_follows_header() {
        let rcp = Rcp::new(5u64).unwrap();
        let block = rcp.block.unwrap().as_ptr() as usize;
        let payload = rcp.get().unwrap() as *const u64 as usize;
        assert_eq!(payload - block, std::mem::offset_of!(RcBlock<u64>, value));
        assert!(payload > block);
    }

    #[test]
    fn test_clone_and_drop_counts() {
        let a = Rcp::new(1u32).unwrap();
        assert_eq!(a.ref_count(), 1);
        let b = a.clone();
        let c = b.clone();
        assert_eq!(a.ref_count(), 3);
        drop(b);
        assert_eq!(c.ref_count(), 2);
    }

    #[test]
    fn test_move_keeps_count() {
        let a = Rcp::new(1u32).unwrap();
        let b = a;
        assert_eq!(b.ref_count(), 1);
    }

    #[test]
    fn test_payload_dropped_once_at_zero() {
        static ALLOC: CountingAllocator = CountingAllocator::new();
        let drops = AtomicUsize::new(0);
        {
            let a = Rcp::new_in(DropCounter(&drops), &ALLOC).unwrap();
            let _b = a.clone();
            assert_eq!(ALLOC.live(), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(ALLOC.live(), 0);
    }

    #[test]
    fn test_null_handle() {
        let null: Rcp<u8> = Rcp::default();
        assert!(null.is_null());
        assert!(null.get().is_none());
        assert_eq!(null.ref_count(), 0);
        assert_eq!(null.clone(), Rcp::null());
        assert!(null.allocator().is_none());
    }

    #[test]
    fn test_identity_equality() {
        let a = Rcp::new(3).unwrap();
        let b = Rcp::new(3).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_get_mut_requires_uniqueness() {
        let mut a = Rcp::new(vec![1, 2]).unwrap();
        a.get_mut().unwrap().push(3);
        let b = a.clone();
        assert!(a.get_mut().is_none());
        drop(b);
        assert_eq!(a.get_mut().map(|v| v.len()), Some(3));
    }

    #[test]
    fn test_reset_releases_previous() {
        static ALLOC: CountingAllocator = CountingAllocator::new();
        let mut a = Rcp::new_in(1u16, &ALLOC).unwrap();
        let keep = a.clone();
        a.reset_in(2, &ALLOC).unwrap();
        assert_eq!(keep.ref_count(), 1);
        assert_eq!(a.get(), Some(&2));
        assert_eq!(ALLOC.live(), 2);

        a.clear();
        assert!(a.is_null());
        drop(keep);
        assert_eq!(ALLOC.live(), 0);
    }

    #[test]
    fn test_debug_output() {
        let a = Rcp::new(9).unwrap();
        let debug = format!("{a:?}");
        assert!(debug.contains("refcount: 1"));
        assert!(debug.contains('9'));
    }

    #[test]
    #[should_panic(expected = "Reference count overflow")]
    fn test_refcount_overflow() {
        let a = Rcp::new(0u8).unwrap();
        // SAFETY: direct manipulation for testing; the handle is leaked below.
        unsafe {
            (*a.block.unwrap().as_ptr())
                .count
                .store(MAX_REFCOUNT, Ordering::Release);
        }
        let a = std::mem::ManuallyDrop::new(a);
        let _b = std::mem::ManuallyDrop::new((*a).clone());
    }
}
