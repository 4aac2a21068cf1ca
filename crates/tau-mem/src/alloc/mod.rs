//! Heap allocator abstraction.
//!
//! Every container in this crate obtains memory through [`HeapAllocator`], a
//! two-operation capability: `allocate(layout)` and `deallocate(ptr, layout)`.
//! The layout is explicit on both sides, so alignment is never implied.
//!
//! # Implementations
//!
//! - [`SystemAllocator`]: the global Rust allocator, no tracking.
//! - [`CountingAllocator`]: counts live blocks; freeing past zero panics.
//! - [`GuardedAllocator`]: counts live blocks and prepends a guard word to
//!   each one, so a second free of the same block panics.
//! - [`PageHeapAllocator`]: whole pages from [`PageAllocator`].
//! - [`RingAllocator`]: a fixed ring of equal slots.
//! - `LeakTracker` (feature `leak-tracking`): records every live block of
//!   a wrapped allocator.
//!
//! Handles that need an allocator for their whole life store a
//! `&'static dyn HeapAllocator`. Constructors without an allocator argument use
//! [`default_allocator`].
//!
//! # Example
//!
//! ```
//! use std::alloc::Layout;
//! use tau_mem::alloc::{CountingAllocator, HeapAllocator};
//!
//! let counter = CountingAllocator::new();
//! let layout = Layout::new::<u64>();
//!
//! let block = counter.allocate(layout).unwrap();
//! assert_eq!(counter.live_allocations(), Some(1));
//!
//! unsafe { counter.deallocate(block, layout) };
//! assert_eq!(counter.live_allocations(), Some(0));
//! ```

mod ring;

#[cfg(feature = "leak-tracking")]
mod leak;

use std::alloc::{self as sys_alloc, Layout};
use std::collections::VecDeque;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Mutex;
use std::sync::atomic::{AtomicIsize, Ordering};

use tau_log::error;

use crate::error::{Error, Result};
use crate::page::PageAllocator;

pub use ring::RingAllocator;

#[cfg(feature = "leak-tracking")]
pub use leak::{LeakRecord, LeakTracker};

/// How an allocator accounts for its blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationTracking {
    /// No accounting.
    None,
    /// A live-block counter.
    Count,
    /// A live-block counter plus a per-block double-free guard.
    DoubleDeleteCount,
}

/// A source of raw memory.
///
/// # Safety
///
/// Implementors must return blocks that are valid for reads and writes of
/// `layout.size()` bytes, aligned to `layout.align()`, and not aliased by any
/// other live block, until they are passed back to `deallocate`.
pub unsafe trait HeapAllocator: Send + Sync {
    /// Allocates a block for `layout`.
    ///
    /// Zero-sized layouts are allowed and yield a unique block.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Returns a block to this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this same instance with
    /// the same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Accounting performed by this allocator.
    fn tracking(&self) -> AllocationTracking {
        AllocationTracking::None
    }

    /// Live blocks, for allocators that count them.
    fn live_allocations(&self) -> Option<isize> {
        None
    }
}

/// Layout actually requested from the global allocator for `layout`.
#[inline]
fn non_zero(layout: Layout) -> Layout {
    // SAFETY: the alignment comes from a valid layout, and growing a zero
    // size to one byte cannot overflow.
    unsafe { Layout::from_size_align_unchecked(layout.size().max(1), layout.align()) }
}

/// The global Rust allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

// SAFETY: blocks come straight from the global allocator.
unsafe impl HeapAllocator for SystemAllocator {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        // SAFETY: `non_zero` never produces a zero-sized layout.
        let ptr = unsafe { sys_alloc::alloc(non_zero(layout)) };
        NonNull::new(ptr).ok_or(Error::OutOfMemory {
            size: layout.size(),
        })
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the block came from `allocate` with the same layout.
        unsafe { sys_alloc::dealloc(ptr.as_ptr(), non_zero(layout)) }
    }
}

static DEFAULT_ALLOCATOR: SystemAllocator = SystemAllocator;

/// The allocator used by constructors that do not take one.
///
/// It is a stateless [`SystemAllocator`] that lives for the whole program.
#[inline]
#[must_use]
pub fn default_allocator() -> &'static dyn HeapAllocator {
    &DEFAULT_ALLOCATOR
}

/// Decrements a live counter, panicking if it is already zero.
fn release_count(live: &AtomicIsize) {
    if live
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n > 0).then_some(n - 1)
        })
        .is_err()
    {
        error!("deallocation with no live allocations");
        panic!("live allocation count underflow");
    }
}

/// System allocator that counts live blocks.
///
/// Freeing when the count is already zero is a programmer error and panics.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    live: AtomicIsize,
}

impl CountingAllocator {
    /// Creates an allocator with no live blocks.
    pub const fn new() -> Self {
        CountingAllocator {
            live: AtomicIsize::new(0),
        }
    }

    /// Current live block count.
    pub fn live(&self) -> isize {
        self.live.load(Ordering::Acquire)
    }
}

// SAFETY: blocks come from `SystemAllocator`.
unsafe impl HeapAllocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        let ptr = SystemAllocator.allocate(layout)?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        release_count(&self.live);
        // SAFETY: forwarded contract.
        unsafe { SystemAllocator.deallocate(ptr, layout) }
    }

    fn tracking(&self) -> AllocationTracking {
        AllocationTracking::Count
    }

    fn live_allocations(&self) -> Option<isize> {
        Some(self.live())
    }
}

/// Guard word stored immediately before each guarded block.
type Guard = AtomicIsize;

const GUARD_SIZE: usize = mem::size_of::<Guard>();

struct Quarantined {
    block: NonNull<u8>,
    layout: Layout,
}

// SAFETY: quarantined blocks are owned by the allocator and never accessed
// except to release them.
unsafe impl Send for Quarantined {}

/// Counting allocator that detects double frees.
///
/// Each block carries a guard word set to 1 on allocation. Deallocation
/// drops the guard to 0; a second deallocation finds 0 and panics.
///
/// For the guard to stay readable, freed blocks are quarantined instead of
/// returned to the system. The quarantine is a FIFO of at most `capacity`
/// blocks: once full, the oldest block is released, so only double frees
/// among the most recent `capacity` deallocations are caught. Everything
/// left is released when the allocator is dropped or through
/// [`GuardedAllocator::release_quarantine`].
pub struct GuardedAllocator {
    live: AtomicIsize,
    capacity: usize,
    quarantine: Mutex<VecDeque<Quarantined>>,
}

impl GuardedAllocator {
    /// Quarantine length used by [`GuardedAllocator::new`].
    pub const DEFAULT_QUARANTINE: usize = 4096;

    /// Creates an allocator with no live blocks.
    pub const fn new() -> Self {
        Self::with_quarantine(Self::DEFAULT_QUARANTINE)
    }

    /// Creates an allocator that keeps at most `capacity` freed blocks.
    pub const fn with_quarantine(capacity: usize) -> Self {
        GuardedAllocator {
            live: AtomicIsize::new(0),
            capacity,
            quarantine: Mutex::new(VecDeque::new()),
        }
    }

    /// Current live block count.
    pub fn live(&self) -> isize {
        self.live.load(Ordering::Acquire)
    }

    /// Freed blocks held in quarantine.
    pub fn quarantined(&self) -> usize {
        self.quarantine.lock().map_or(0, |q| q.len())
    }

    /// Offset from the start of the underlying block to the user pointer.
    fn header(layout: Layout) -> usize {
        GUARD_SIZE.max(layout.align())
    }

    fn outer_layout(layout: Layout) -> Result<Layout> {
        let size = Self::header(layout)
            .checked_add(layout.size())
            .ok_or(Error::OutOfMemory {
                size: layout.size(),
            })?;
        Layout::from_size_align(size, layout.align().max(mem::align_of::<Guard>())).map_err(|_| {
            Error::InvalidAlignment {
                alignment: layout.align(),
            }
        })
    }

    /// Returns quarantined blocks to the system.
    ///
    /// # Safety
    ///
    /// No block freed before this call may be deallocated again: its guard is
    /// gone, so the double free would go undetected.
    pub unsafe fn release_quarantine(&self) {
        let drained = match self.quarantine.lock() {
            Ok(mut q) => mem::take(&mut *q),
            Err(poisoned) => mem::take(&mut *poisoned.into_inner()),
        };
        for q in drained {
            // SAFETY: the block came from `SystemAllocator` with this layout.
            unsafe { SystemAllocator.deallocate(q.block, q.layout) };
        }
    }
}

// SAFETY: the user pointer is `header` bytes into a block sized
// `header + size`, and `header` is a multiple of the requested alignment.
unsafe impl HeapAllocator for GuardedAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        let outer = Self::outer_layout(layout)?;
        let block = SystemAllocator.allocate(outer)?;
        // SAFETY: the header fits inside the block, and the guard sits just
        // below the user pointer, which is aligned to at least the guard.
        let user = unsafe {
            let user = block.add(Self::header(layout));
            user.cast::<Guard>().sub(1).write(Guard::new(1));
            user
        };
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(user)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: `ptr` is live or among the last `capacity` freed blocks,
        // which are quarantined rather than freed, so its guard is readable.
        let guard = unsafe { &*ptr.cast::<Guard>().as_ptr().sub(1) };
        if let Err(seen) = guard.compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire) {
            error!("double deallocation of {:p} (guard {})", ptr, seen);
            panic!("double deallocation detected");
        }
        release_count(&self.live);

        let Ok(outer) = Self::outer_layout(layout) else {
            return;
        };
        // SAFETY: reverses the offset applied in `allocate`.
        let block = unsafe { ptr.sub(Self::header(layout)) };
        let evicted = {
            let mut q = match self.quarantine.lock() {
                Ok(q) => q,
                Err(poisoned) => poisoned.into_inner(),
            };
            q.push_back(Quarantined { block, layout: outer });
            if q.len() > self.capacity {
                q.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            // SAFETY: the block came from `SystemAllocator` with this layout
            // and left the quarantine, so nothing else frees it.
            unsafe { SystemAllocator.deallocate(old.block, old.layout) };
        }
    }

    fn tracking(&self) -> AllocationTracking {
        AllocationTracking::DoubleDeleteCount
    }

    fn live_allocations(&self) -> Option<isize> {
        Some(self.live())
    }
}

impl Default for GuardedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GuardedAllocator {
    fn drop(&mut self) {
        // SAFETY: no deallocation can reach an allocator being dropped.
        unsafe { self.release_quarantine() };
    }
}

impl std::fmt::Debug for GuardedAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedAllocator")
            .field("live", &self.live())
            .field("quarantined", &self.quarantined())
            .finish()
    }
}

/// Allocator handing out whole pages.
///
/// Sizes are rounded up to the page size. Useful for large, long-lived
/// blocks; every request costs at least one page.
#[derive(Debug, Default, Clone, Copy)]
pub struct PageHeapAllocator;

// SAFETY: every block is a fresh read-write mapping.
unsafe impl HeapAllocator for PageHeapAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.align() > PageAllocator::page_size() {
            return Err(Error::InvalidAlignment {
                alignment: layout.align(),
            });
        }
        PageAllocator::alloc(PageAllocator::pages_for(layout.size().max(1)))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: same page count as `allocate` computed.
        unsafe { PageAllocator::free(ptr, PageAllocator::pages_for(layout.size().max(1))) }
    }
}

/// Allocates a block and moves `value` into it.
pub fn allocate_value<T, A>(allocator: &A, value: T) -> Result<NonNull<T>>
where
    A: HeapAllocator + ?Sized,
{
    let ptr = allocator.allocate(Layout::new::<T>())?.cast::<T>();
    // SAFETY: fresh block sized and aligned for `T`.
    unsafe { ptr.write(value) };
    Ok(ptr)
}

/// Drops the value at `ptr` and returns its block.
///
/// # Safety
///
/// `ptr` must come from [`allocate_value`] on the same allocator and must not
/// be used afterwards.
pub unsafe fn deallocate_value<T, A>(allocator: &A, ptr: NonNull<T>)
where
    A: HeapAllocator + ?Sized,
{
    // SAFETY: forwarded contract.
    unsafe {
        ptr::drop_in_place(ptr.as_ptr());
        allocator.deallocate(ptr.cast(), Layout::new::<T>());
    }
}

/// Allocates uninitialized storage for `len` values of `T`.
pub fn allocate_array<T, A>(allocator: &A, len: usize) -> Result<NonNull<T>>
where
    A: HeapAllocator + ?Sized,
{
    let layout = Layout::array::<T>(len).map_err(|_| Error::OutOfMemory {
        size: len.saturating_mul(mem::size_of::<T>()),
    })?;
    Ok(allocator.allocate(layout)?.cast())
}

/// Drops `len` initialized values at `ptr` and returns the storage.
///
/// # Safety
///
/// `ptr` must come from [`allocate_array`] on the same allocator with the same
/// `len`, all `len` values must be initialized, and `ptr` must not be used
/// afterwards.
pub unsafe fn deallocate_array<T, A>(allocator: &A, ptr: NonNull<T>, len: usize)
where
    A: HeapAllocator + ?Sized,
{
    // SAFETY: forwarded contract.
    unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)) };
    // The layout was valid when the array was allocated.
    if let Ok(layout) = Layout::array::<T>(len) {
        // SAFETY: same allocator and layout as the allocation.
        unsafe { allocator.deallocate(ptr.cast(), layout) };
    }
}
