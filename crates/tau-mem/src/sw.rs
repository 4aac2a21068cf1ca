//! Strong/weak reference-counted pointers.
//!
//! [`StrongRcp`] and [`WeakRcp`] share one control block holding two atomic
//! counts, the owning allocator, and the payload:
//!
//! ```text
//! ┌────────┬──────┬───────────┬──────────────┐
//! │ strong │ weak │ allocator │   payload T  │
//! └────────┴──────┴───────────┴──────────────┘
//! ```
//!
//! # Block states
//!
//! | state              | strong | weak | payload   | memory    |
//! |--------------------|--------|------|-----------|-----------|
//! | live               | > 0    | any  | alive     | allocated |
//! | payload destroyed  | 0      | > 0  | dropped   | allocated |
//! | freed              | 0      | 0    | dropped   | released  |
//!
//! The payload is dropped when the last strong handle goes away; the block is
//! returned to its allocator when the last handle of either kind goes away.
//! While any strong handle exists, the strong handles together hold one
//! extra weak count, so exactly one party observes the final release.
//!
//! A weak handle never dereferences directly: [`WeakRcp::upgrade`] atomically
//! checks that the payload is alive and takes a strong count, or fails.
//!
//! # Example
//!
//! ```
//! use tau_mem::sw::StrongRcp;
//!
//! let strong = StrongRcp::new(41).unwrap();
//! let weak = strong.downgrade();
//!
//! assert_eq!(weak.upgrade().and_then(|s| s.get().copied()), Some(41));
//!
//! drop(strong);
//! assert!(weak.upgrade().is_none());
//! assert_eq!(weak.strong_ref_count(), 0);
//! ```

use std::alloc::Layout;
use std::fmt;
use std::hint;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};

use crate::alloc::{HeapAllocator, default_allocator};
use crate::error::Result;
use crate::rc::MAX_REFCOUNT;

/// Weak count while `get_mut` checks uniqueness.
const WEAK_LOCKED: usize = usize::MAX;

#[repr(C)]
struct SwBlock<T> {
    strong: AtomicUsize,
    weak: AtomicUsize,
    allocator: &'static dyn HeapAllocator,
    value: ManuallyDrop<T>,
}

impl<T> SwBlock<T> {
    /// # Safety
    ///
    /// `block` must be allocated (some handle holds a count).
    #[inline]
    unsafe fn strong<'a>(block: NonNull<Self>) -> &'a AtomicUsize {
        // SAFETY: forwarded contract. Only the field is borrowed, never the
        // payload.
        unsafe { &(*block.as_ptr()).strong }
    }

    /// # Safety
    ///
    /// `block` must be allocated.
    #[inline]
    unsafe fn weak<'a>(block: NonNull<Self>) -> &'a AtomicUsize {
        // SAFETY: forwarded contract.
        unsafe { &(*block.as_ptr()).weak }
    }

    /// Gives up one weak count and frees the block at zero.
    ///
    /// # Safety
    ///
    /// The caller must own one weak count (explicit or the strong side's
    /// shared one) and give it up.
    unsafe fn release_weak(block: NonNull<Self>) {
        // SAFETY: the caller's count keeps the block allocated.
        if unsafe { Self::weak(block) }.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        // SAFETY: both counts are zero; nothing else can reach the block.
        unsafe {
            let allocator = (*block.as_ptr()).allocator;
            allocator.deallocate(block.cast(), Layout::new::<Self>());
        }
    }

    /// Gives up one strong count, dropping the payload at zero.
    ///
    /// # Safety
    ///
    /// The caller must own one strong count and give it up.
    unsafe fn release_strong(block: NonNull<Self>) {
        // SAFETY: the caller's count keeps the block and payload alive.
        if unsafe { Self::strong(block) }.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        // SAFETY: the strong count is zero and upgrades refuse to revive it,
        // so nobody else can reach the payload. Then the strong side's shared
        // weak count is handed back.
        unsafe {
            ManuallyDrop::drop(&mut (*block.as_ptr()).value);
            Self::release_weak(block);
        }
    }
}

fn retain(count: &AtomicUsize) {
    if count.fetch_add(1, Ordering::Relaxed) >= MAX_REFCOUNT {
        panic!("Reference count overflow in strong/weak pointer");
    }
}

/// Owning handle that keeps the payload alive.
pub struct StrongRcp<T> {
    block: Option<NonNull<SwBlock<T>>>,
    _owns: PhantomData<SwBlock<T>>,
}

/// Observing handle that keeps only the control block alive.
pub struct WeakRcp<T> {
    block: Option<NonNull<SwBlock<T>>>,
    _owns: PhantomData<SwBlock<T>>,
}

// SAFETY: same rules as `Arc`/`sync::Weak`.
unsafe impl<T: Send + Sync> Send for StrongRcp<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for StrongRcp<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Send for WeakRcp<T> {}
// SAFETY: see above.
unsafe impl<T: Send + Sync> Sync for WeakRcp<T> {}

impl<T> StrongRcp<T> {
    const fn from_block(block: Option<NonNull<SwBlock<T>>>) -> Self {
        StrongRcp {
            block,
            _owns: PhantomData,
        }
    }

    /// A handle that points at nothing.
    #[must_use]
    pub const fn null() -> Self {
        Self::from_block(None)
    }

    /// Moves `value` into a new block from the default allocator.
    pub fn new(value: T) -> Result<Self> {
        Self::new_in(value, default_allocator())
    }

    /// Moves `value` into a new block from `allocator`.
    pub fn new_in(value: T, allocator: &'static dyn HeapAllocator) -> Result<Self> {
        let block = allocator
            .allocate(Layout::new::<SwBlock<T>>())?
            .cast::<SwBlock<T>>();
        // SAFETY: fresh block sized and aligned for `SwBlock<T>`. The weak
        // count starts at one: the strong side's shared count.
        unsafe {
            block.write(SwBlock {
                strong: AtomicUsize::new(1),
                weak: AtomicUsize::new(1),
                allocator,
                value: ManuallyDrop::new(value),
            });
        }
        Ok(Self::from_block(Some(block)))
    }

    /// Promotes `weak`, or returns a null handle if its payload is gone.
    pub fn from_weak(weak: &WeakRcp<T>) -> Self {
        weak.upgrade().unwrap_or_default()
    }

    /// Drops the current reference and rebinds to a new `value`.
    pub fn reset(&mut self, value: T) -> Result<()> {
        self.reset_in(value, default_allocator())
    }

    /// Like [`StrongRcp::reset`] with an explicit allocator.
    pub fn reset_in(&mut self, value: T, allocator: &'static dyn HeapAllocator) -> Result<()> {
        self.clear();
        *self = Self::new_in(value, allocator)?;
        Ok(())
    }

    /// Releases this handle's reference and leaves it null.
    pub fn clear(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: this handle owned one strong count.
            unsafe { SwBlock::release_strong(block) };
        }
    }

    /// Creates a weak handle to the same block.
    pub fn downgrade(&self) -> WeakRcp<T> {
        if let Some(block) = self.block {
            // SAFETY: the block is allocated while this handle exists.
            let weak = unsafe { SwBlock::weak(block) };
            let mut current = weak.load(Ordering::Relaxed);
            loop {
                // Another strong handle is inside `get_mut`.
                if current == WEAK_LOCKED {
                    hint::spin_loop();
                    current = weak.load(Ordering::Relaxed);
                    continue;
                }
                if current >= MAX_REFCOUNT {
                    panic!("Reference count overflow in StrongRcp::downgrade");
                }
                match weak.compare_exchange_weak(
                    current,
                    current + 1,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(seen) => current = seen,
                }
            }
        }
        WeakRcp {
            block: self.block,
            _owns: PhantomData,
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
        // SAFETY: this handle's strong count keeps the payload alive.
        self.block.map(|block| unsafe { &*(*block.as_ptr()).value })
    }

    /// Exclusive access when this is the only handle of either kind.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let block = self.block?;
        // SAFETY: the block is allocated while this handle exists.
        let (strong, weak) = unsafe { (SwBlock::strong(block), SwBlock::weak(block)) };
        // Locking the weak count at 1 proves no weak handle exists and keeps
        // other strong handles from creating one until the strong count is
        // read.
        if weak
            .compare_exchange(1, WEAK_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let unique = strong.load(Ordering::Acquire) == 1;
        weak.store(1, Ordering::Release);
        // SAFETY: no other handle of either kind exists, and `&mut self`
        // prevents new ones.
        unique.then(|| unsafe { &mut *(*block.as_ptr()).value })
    }

    /// Strong count, or 0 for a null handle.
    pub fn strong_ref_count(&self) -> usize {
        // SAFETY: the block is allocated while this handle exists.
        self.block
            .map_or(0, |block| unsafe { SwBlock::strong(block) }.load(Ordering::Acquire))
    }

    /// Weak handles alive, or 0 for a null handle.
    pub fn weak_ref_count(&self) -> usize {
        // The strong side's shared weak count is excluded.
        // SAFETY: the block is allocated while this handle exists.
        self.block.map_or(0, |block| {
            match unsafe { SwBlock::weak(block) }.load(Ordering::Acquire) {
                WEAK_LOCKED => 0,
                weak => weak - 1,
            }
        })
    }

    /// Alias of [`StrongRcp::strong_ref_count`].
    pub fn ref_count(&self) -> usize {
        self.strong_ref_count()
    }

    /// Returns true if both handles share a control block.
    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.block == b.block
    }
}

impl<T> WeakRcp<T> {
    /// A handle that points at nothing.
    #[must_use]
    pub const fn null() -> Self {
        WeakRcp {
            block: None,
            _owns: PhantomData,
        }
    }

    /// Takes a strong count if the payload is still alive.
    ///
    /// Uses a compare-and-swap loop so a payload whose strong count already
    /// reached zero is never revived.
    pub fn upgrade(&self) -> Option<StrongRcp<T>> {
        let block = self.block?;
        // SAFETY: this weak handle keeps the block allocated.
        let strong = unsafe { SwBlock::strong(block) };
        let mut current = strong.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return None;
            }
            if current >= MAX_REFCOUNT {
                panic!("Reference count overflow in WeakRcp::upgrade");
            }
            match strong.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(StrongRcp::from_block(Some(block))),
                Err(seen) => current = seen,
            }
        }
    }

    /// Returns true if the payload has been dropped (or the handle is null).
    pub fn is_expired(&self) -> bool {
        self.strong_ref_count() == 0
    }

    /// Returns true if the handle points at nothing.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.block.is_none()
    }

    /// Strong count; 0 once expired.
    pub fn strong_ref_count(&self) -> usize {
        // SAFETY: this weak handle keeps the block allocated.
        self.block
            .map_or(0, |block| unsafe { SwBlock::strong(block) }.load(Ordering::Acquire))
    }

    /// Weak handles alive, or 0 for a null handle.
    ///
    /// A snapshot: it may be off by one while the last strong handle is being
    /// dropped on another thread.
    pub fn weak_ref_count(&self) -> usize {
        let Some(block) = self.block else {
            return 0;
        };
        // SAFETY: this weak handle keeps the block allocated.
        let (weak, strong) = unsafe {
            (
                SwBlock::weak(block).load(Ordering::Acquire),
                SwBlock::strong(block).load(Ordering::Acquire),
            )
        };
        if strong > 0 { weak.saturating_sub(1) } else { weak }
    }

    /// Releases this handle's reference and leaves it null.
    pub fn clear(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: this handle owned one weak count.
            unsafe { SwBlock::release_weak(block) };
        }
    }

    /// Returns true if both handles share a control block.
    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.block == b.block
    }
}

impl<T> Clone for StrongRcp<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            // SAFETY: the block is allocated while this handle exists.
            retain(unsafe { SwBlock::strong(block) });
        }
        Self::from_block(self.block)
    }
}

impl<T> Clone for WeakRcp<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            // SAFETY: the block is allocated while this handle exists.
            retain(unsafe { SwBlock::weak(block) });
        }
        WeakRcp {
            block: self.block,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for StrongRcp<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> Drop for WeakRcp<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> Default for StrongRcp<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Default for WeakRcp<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<&StrongRcp<T>> for WeakRcp<T> {
    fn from(strong: &StrongRcp<T>) -> Self {
        strong.downgrade()
    }
}

impl<T> PartialEq for StrongRcp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
    }
}

impl<T> Eq for StrongRcp<T> {}

impl<T> PartialEq for WeakRcp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
    }
}

impl<T> Eq for WeakRcp<T> {}

impl<T> PartialEq<WeakRcp<T>> for StrongRcp<T> {
    fn eq(&self, other: &WeakRcp<T>) -> bool {
        self.block == other.block
    }
}

impl<T> PartialEq<StrongRcp<T>> for WeakRcp<T> {
    fn eq(&self, other: &StrongRcp<T>) -> bool {
        self.block == other.block
    }
}

impl<T: fmt::Debug> fmt::Debug for StrongRcp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrongRcp")
            .field("value", &self.get())
            .field("strong", &self.strong_ref_count())
            .field("weak", &self.weak_ref_count())
            .finish()
    }
}

impl<T> fmt::Debug for WeakRcp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRcp")
            .field("strong", &self.strong_ref_count())
            .field("weak", &self.weak_ref_count())
            .finish()
    }
}
