//! Live-block recording for leak hunting.
//!
//! [`LeakTracker`] wraps another allocator and remembers every block it has
//! handed out and not yet taken back. Deallocating a pointer it never handed
//! out panics, which catches frees routed to the wrong allocator.
//!
//! With the `leak-backtrace` feature each record also carries the call stack
//! of the allocation, resolved lazily when a report is produced.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use fxhash::FxBuildHasher;
use hashbrown::HashMap;
use tau_log::{error, warn};

use super::{AllocationTracking, HeapAllocator, SystemAllocator};
use crate::error::Result;

struct BlockRecord {
    layout: Layout,
    #[cfg(feature = "leak-backtrace")]
    backtrace: backtrace::Backtrace,
}

/// A block that was still live when [`LeakTracker::leaks`] was called.
#[derive(Debug, Clone)]
pub struct LeakRecord {
    /// Address of the block.
    pub address: usize,
    /// Size in bytes.
    pub size: usize,
    /// Alignment in bytes.
    pub align: usize,
    /// Allocation call stack, when captured.
    #[cfg(feature = "leak-backtrace")]
    pub backtrace: backtrace::Backtrace,
}

/// Allocator wrapper recording every live block.
pub struct LeakTracker<A: HeapAllocator = SystemAllocator> {
    inner: A,
    live: Mutex<HashMap<usize, BlockRecord, FxBuildHasher>>,
}

impl<A: HeapAllocator> LeakTracker<A> {
    /// Wraps `inner`.
    pub fn new(inner: A) -> Self {
        LeakTracker {
            inner,
            live: Mutex::new(HashMap::with_hasher(FxBuildHasher::default())),
        }
    }

    /// The wrapped allocator.
    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn blocks(&self) -> MutexGuard<'_, HashMap<usize, BlockRecord, FxBuildHasher>> {
        // Records stay consistent even if a holder panicked mid-report.
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of live blocks.
    pub fn live_blocks(&self) -> usize {
        self.blocks().len()
    }

    /// Snapshot of all live blocks, ordered by address.
    pub fn leaks(&self) -> Vec<LeakRecord> {
        let mut leaks: Vec<LeakRecord> = self
            .blocks()
            .iter()
            .map(|(&address, record)| LeakRecord {
                address,
                size: record.layout.size(),
                align: record.layout.align(),
                #[cfg(feature = "leak-backtrace")]
                backtrace: {
                    let mut bt = record.backtrace.clone();
                    bt.resolve();
                    bt
                },
            })
            .collect();
        leaks.sort_unstable_by_key(|leak| leak.address);
        leaks
    }

    /// Logs every live block at warn level and returns how many there are.
    pub fn report(&self) -> usize {
        let leaks = self.leaks();
        for leak in &leaks {
            warn!(
                "leaked {} bytes (align {}) at {:#x}",
                leak.size, leak.align, leak.address
            );
            #[cfg(feature = "leak-backtrace")]
            warn!("allocated at:\n{:?}", leak.backtrace);
        }
        leaks.len()
    }
}

impl Default for LeakTracker<SystemAllocator> {
    fn default() -> Self {
        Self::new(SystemAllocator)
    }
}

// SAFETY: blocks come unchanged from the wrapped allocator.
unsafe impl<A: HeapAllocator> HeapAllocator for LeakTracker<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        let ptr = self.inner.allocate(layout)?;
        let record = BlockRecord {
            layout,
            #[cfg(feature = "leak-backtrace")]
            backtrace: backtrace::Backtrace::new_unresolved(),
        };
        self.blocks().insert(ptr.as_ptr() as usize, record);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let removed = self.blocks().remove(&(ptr.as_ptr() as usize));
        match removed {
            Some(record) if record.layout == layout => {}
            Some(record) => {
                error!(
                    "block {:p} freed with {:?}, allocated with {:?}",
                    ptr, layout, record.layout
                );
                panic!("deallocation layout mismatch");
            }
            None => {
                error!("block {:p} is not live in this allocator", ptr);
                panic!("deallocation of a block this allocator does not own");
            }
        }
        // SAFETY: the block was live in `inner` with this layout.
        unsafe { self.inner.deallocate(ptr, layout) }
    }

    fn tracking(&self) -> AllocationTracking {
        AllocationTracking::Count
    }

    fn live_allocations(&self) -> Option<isize> {
        Some(self.live_blocks() as isize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_live_blocks() {
        let tracker = LeakTracker::default();
        let small = Layout::new::<u32>();
        let big = Layout::from_size_align(256, 32).unwrap();

        let a = tracker.allocate(small).unwrap();
        let b = tracker.allocate(big).unwrap();
        assert_eq!(tracker.live_blocks(), 2);

        unsafe { tracker.deallocate(a, small) };
        let leaks = tracker.leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].address, b.as_ptr() as usize);
        assert_eq!(leaks[0].size, 256);
        assert_eq!(leaks[0].align, 32);
        assert_eq!(tracker.report(), 1);

        unsafe { tracker.deallocate(b, big) };
        assert_eq!(tracker.live_allocations(), Some(0));
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn test_foreign_pointer_panics() {
        let tracker = LeakTracker::default();
        let layout = Layout::new::<u64>();
        let foreign = SystemAllocator.allocate(layout).unwrap();
        unsafe { tracker.deallocate(foreign, layout) };
    }

    #[test]
    #[should_panic(expected = "layout mismatch")]
    fn test_layout_mismatch_panics() {
        let tracker = LeakTracker::default();
        let ptr = tracker.allocate(Layout::new::<u64>()).unwrap();
        unsafe { tracker.deallocate(ptr, Layout::new::<u32>()) };
    }
}
