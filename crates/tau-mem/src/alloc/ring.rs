//! Fixed ring of equal-size slots.
//!
//! A [`RingAllocator`] carves one block from a backing allocator into `slots`
//! slots of `slot_size` bytes and hands them out round-robin. Deallocation is
//! a no-op: a slot becomes available again when the ring wraps around to it.
//! It suits short-lived scratch buffers whose lifetime is bounded by how many
//! allocations follow them.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use tau_log::trace;

use super::{HeapAllocator, default_allocator};
use crate::error::{Error, Result};

/// Alignment of every slot.
pub const SLOT_ALIGN: usize = 16;

/// Round-robin slot allocator.
///
/// A slot handed out is overwritten once `slots` further allocations have
/// happened. Callers must not keep it that long.
pub struct RingAllocator {
    storage: NonNull<u8>,
    slot_size: usize,
    slots: usize,
    next: AtomicUsize,
    backing: &'static dyn HeapAllocator,
}

// SAFETY: the storage is owned by the ring; slot selection is atomic.
unsafe impl Send for RingAllocator {}
// SAFETY: see above.
unsafe impl Sync for RingAllocator {}

impl RingAllocator {
    /// Creates a ring backed by the default allocator.
    pub fn new(slot_size: usize, slots: usize) -> Result<Self> {
        Self::new_in(slot_size, slots, default_allocator())
    }

    /// Creates a ring backed by `backing`.
    ///
    /// `slot_size` is rounded up to [`SLOT_ALIGN`]. At least one slot is
    /// always created.
    pub fn new_in(
        slot_size: usize,
        slots: usize,
        backing: &'static dyn HeapAllocator,
    ) -> Result<Self> {
        let slot_size = slot_size.max(1).next_multiple_of(SLOT_ALIGN);
        let slots = slots.max(1);
        let layout = Self::storage_layout(slot_size, slots)?;
        let storage = backing.allocate(layout)?;
        trace!("ring of {} x {} bytes at {:p}", slots, slot_size, storage);
        Ok(RingAllocator {
            storage,
            slot_size,
            slots,
            next: AtomicUsize::new(0),
            backing,
        })
    }

    fn storage_layout(slot_size: usize, slots: usize) -> Result<Layout> {
        let size = slot_size
            .checked_mul(slots)
            .ok_or(Error::OutOfMemory { size: usize::MAX })?;
        Layout::from_size_align(size, SLOT_ALIGN).map_err(|_| Error::OutOfMemory { size })
    }

    /// Size of one slot in bytes.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots in the ring.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Index of the slot the next allocation will use.
    pub fn next_slot(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }
}

// SAFETY: each slot is `slot_size` bytes aligned to `SLOT_ALIGN`, and requests
// that do not fit are refused. Slots are reused only after wrapping, which is
// the documented contract of this allocator.
unsafe impl HeapAllocator for RingAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() > self.slot_size {
            return Err(Error::SlotTooLarge {
                size: layout.size(),
                slot_size: self.slot_size,
            });
        }
        if layout.align() > SLOT_ALIGN {
            return Err(Error::InvalidAlignment {
                alignment: layout.align(),
            });
        }

        let slots = self.slots;
        let slot = match self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % slots))
        {
            Ok(slot) | Err(slot) => slot,
        };
        // SAFETY: `slot < slots`, so the offset stays inside the storage.
        Ok(unsafe { self.storage.add(slot * self.slot_size) })
    }

    #[inline]
    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {}
}

impl Drop for RingAllocator {
    fn drop(&mut self) {
        if let Ok(layout) = Self::storage_layout(self.slot_size, self.slots) {
            // SAFETY: same backing allocator and layout as in `new_in`.
            unsafe { self.backing.deallocate(self.storage, layout) };
        }
    }
}

impl std::fmt::Debug for RingAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingAllocator")
            .field("slot_size", &self.slot_size)
            .field("slots", &self.slots)
            .field("next", &self.next_slot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::CountingAllocator;

    #[test]
    fn test_ring_wraps_around() {
        let ring = RingAllocator::new(20, 3).unwrap();
        assert_eq!(ring.slot_size(), 32);

        let layout = Layout::new::<[u8; 20]>();
        let first = ring.allocate(layout).unwrap();
        let second = ring.allocate(layout).unwrap();
        let third = ring.allocate(layout).unwrap();
        let fourth = ring.allocate(layout).unwrap();

        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 32);
        assert_eq!(third.as_ptr() as usize - second.as_ptr() as usize, 32);
        assert_eq!(fourth, first);
        assert_eq!(ring.next_slot(), 1);
    }

    #[test]
    fn test_ring_refuses_oversized() {
        let ring = RingAllocator::new(16, 2).unwrap();
        assert_eq!(
            ring.allocate(Layout::new::<[u8; 17]>()),
            Err(Error::SlotTooLarge {
                size: 17,
                slot_size: 16
            })
        );
        assert!(matches!(
            ring.allocate(Layout::from_size_align(8, 64).unwrap()),
            Err(Error::InvalidAlignment { alignment: 64 })
        ));
    }

    #[test]
    fn test_ring_returns_storage_to_backing() {
        static BACKING: CountingAllocator = CountingAllocator::new();
        {
            let ring = RingAllocator::new_in(64, 8, &BACKING).unwrap();
            assert_eq!(BACKING.live(), 1);
            let layout = Layout::new::<u64>();
            let slot = ring.allocate(layout).unwrap();
            unsafe { ring.deallocate(slot, layout) };
            assert_eq!(BACKING.live(), 1);
        }
        assert_eq!(BACKING.live(), 0);
    }

    #[test]
    fn test_ring_concurrent_slots_stay_in_range() {
        let ring = std::sync::Arc::new(RingAllocator::new(32, 5).unwrap());
        let base = ring.storage.as_ptr() as usize;
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ring = std::sync::Arc::clone(&ring);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let slot = ring.allocate(Layout::new::<u32>()).unwrap();
                        let offset = slot.as_ptr() as usize - base;
                        assert!(offset < 5 * 32);
                        assert_eq!(offset % 32, 0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
