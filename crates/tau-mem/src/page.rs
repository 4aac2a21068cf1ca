//! Page-granular virtual memory.
//!
//! [`PageAllocator`] is a thin wrapper over the operating system's virtual
//! memory calls: reserve address space, commit and decommit pages inside a
//! reservation, change protection, and release the reservation. Every
//! structure in this crate that grows in place (the array list and the tree
//! arena) sits on top of it.
//!
//! [`PageRegion`] owns one reservation and tracks a committed prefix that
//! grows and shrinks in contiguous runs. It releases the reservation on drop.
//!
//! # Lifecycle
//!
//! ```text
//! reserved ──commit──▶ committed ──decommit──▶ reserved ──free──▶ (gone)
//! ```
//!
//! Reserved pages have no backing memory and no access permission. Touching
//! them faults.
//!
//! # Example
//!
//! ```
//! use tau_mem::page::PageRegion;
//!
//! let mut region = PageRegion::reserve(16).unwrap();
//! region.grow(2).unwrap();
//! assert_eq!(region.committed_pages(), 2);
//!
//! // SAFETY: the first two pages are committed read-write.
//! unsafe { region.as_ptr().write(7) };
//! ```

use std::ptr::NonNull;
use std::sync::OnceLock;

use tau_log::{trace, warn};

use crate::error::{Error, Result};

/// Access permission applied to committed pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults.
    NoAccess,
    /// Readable and writable.
    ReadWrite,
    /// Readable only.
    ReadOnly,
    /// Readable and executable.
    Execute,
}

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Operating-system page allocator.
///
/// All operations are associated functions; there is no instance state apart
/// from the page size, which is queried once and cached.
///
/// Functions taking a raw address are `unsafe`: the address must come from
/// [`PageAllocator::reserve`] or [`PageAllocator::alloc`], be page aligned,
/// and the page range must lie inside that reservation.
pub struct PageAllocator;

impl PageAllocator {
    /// Returns the platform page size in bytes.
    #[inline]
    pub fn page_size() -> usize {
        *PAGE_SIZE.get_or_init(sys::page_size)
    }

    /// Number of whole pages needed to hold `bytes`.
    #[inline]
    pub fn pages_for(bytes: usize) -> usize {
        bytes.div_ceil(Self::page_size())
    }

    fn span(pages: usize) -> Option<usize> {
        if pages == 0 {
            return None;
        }
        pages.checked_mul(Self::page_size())
    }

    /// Reserves `page_count` pages of address space without backing memory.
    pub fn reserve(page_count: usize) -> Result<NonNull<u8>> {
        let bytes = Self::span(page_count).ok_or(Error::OutOfAddressSpace { pages: page_count })?;
        match NonNull::new(sys::reserve(bytes)) {
            Some(base) => {
                trace!("reserved {} pages at {:p}", page_count, base);
                Ok(base)
            }
            None => {
                warn!("failed to reserve {} pages", page_count);
                Err(Error::OutOfAddressSpace { pages: page_count })
            }
        }
    }

    /// Reserves and commits `page_count` read-write pages.
    pub fn alloc(page_count: usize) -> Result<NonNull<u8>> {
        let bytes = Self::span(page_count).ok_or(Error::OutOfAddressSpace { pages: page_count })?;
        match NonNull::new(sys::alloc(bytes)) {
            Some(base) => {
                trace!("allocated {} pages at {:p}", page_count, base);
                Ok(base)
            }
            None => {
                warn!("failed to allocate {} pages", page_count);
                Err(Error::OutOfAddressSpace { pages: page_count })
            }
        }
    }

    /// Commits a single page.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    #[inline]
    pub unsafe fn commit_page(page: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { Self::commit_pages(page, 1) }
    }

    /// Commits `count` pages starting at `page`, making them read-write.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    pub unsafe fn commit_pages(page: NonNull<u8>, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let bytes = Self::span(count).ok_or(Error::CommitFailed { pages: count })?;
        // SAFETY: the caller guarantees the range lies in a reservation.
        if unsafe { sys::commit(page.as_ptr(), bytes) } {
            trace!("committed {} pages at {:p}", count, page);
            Ok(())
        } else {
            warn!("failed to commit {} pages at {:p}", count, page);
            Err(Error::CommitFailed { pages: count })
        }
    }

    /// Decommits a single page.
    ///
    /// # Safety
    ///
    /// See the type-level contract. The page contents are lost.
    #[inline]
    pub unsafe fn decommit_page(page: NonNull<u8>) {
        // SAFETY: forwarded contract.
        unsafe { Self::decommit_pages(page, 1) }
    }

    /// Releases the backing memory of `count` pages, keeping the address
    /// range reserved.
    ///
    /// # Safety
    ///
    /// See the type-level contract. The page contents are lost.
    pub unsafe fn decommit_pages(page: NonNull<u8>, count: usize) {
        let Some(bytes) = Self::span(count) else {
            return;
        };
        // SAFETY: the caller guarantees the range lies in a reservation.
        unsafe { sys::decommit(page.as_ptr(), bytes) };
        trace!("decommitted {} pages at {:p}", count, page);
    }

    /// Releases a whole reservation.
    ///
    /// `page_count` must be the count the reservation was created with.
    ///
    /// # Safety
    ///
    /// `base` must come from `reserve`/`alloc` and must not be used again.
    pub unsafe fn free(base: NonNull<u8>, page_count: usize) {
        let Some(bytes) = Self::span(page_count) else {
            return;
        };
        // SAFETY: the caller hands over the whole reservation.
        unsafe { sys::release(base.as_ptr(), bytes) };
        trace!("freed {} pages at {:p}", page_count, base);
    }

    /// Applies `protection` to `count` committed pages.
    ///
    /// # Safety
    ///
    /// See the type-level contract. The pages must be committed, and no live
    /// reference may rely on an access the new protection forbids.
    pub unsafe fn protect(page: NonNull<u8>, count: usize, protection: Protection) -> Result<()> {
        let bytes = Self::span(count).ok_or(Error::ProtectFailed { pages: count })?;
        // SAFETY: forwarded contract.
        if unsafe { sys::protect(page.as_ptr(), bytes, protection) } {
            Ok(())
        } else {
            warn!("failed to set {:?} on {} pages at {:p}", protection, count, page);
            Err(Error::ProtectFailed { pages: count })
        }
    }

    /// Makes `count` pages read-write.
    ///
    /// # Safety
    ///
    /// See [`PageAllocator::protect`].
    pub unsafe fn set_read_write(page: NonNull<u8>, count: usize) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { Self::protect(page, count, Protection::ReadWrite) }
    }

    /// Makes `count` pages read-only.
    ///
    /// # Safety
    ///
    /// See [`PageAllocator::protect`].
    pub unsafe fn set_read_only(page: NonNull<u8>, count: usize) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { Self::protect(page, count, Protection::ReadOnly) }
    }

    /// Makes `count` pages readable and executable.
    ///
    /// # Safety
    ///
    /// See [`PageAllocator::protect`].
    pub unsafe fn set_execute(page: NonNull<u8>, count: usize) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { Self::protect(page, count, Protection::Execute) }
    }

    /// Single-page [`PageAllocator::set_read_write`].
    ///
    /// # Safety
    ///
    /// See [`PageAllocator::protect`].
    #[inline]
    pub unsafe fn set_read_write_page(page: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { Self::set_read_write(page, 1) }
    }

    /// Single-page [`PageAllocator::set_read_only`].
    ///
    /// # Safety
    ///
    /// See [`PageAllocator::protect`].
    #[inline]
    pub unsafe fn set_read_only_page(page: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { Self::set_read_only(page, 1) }
    }

    /// Single-page [`PageAllocator::set_execute`].
    ///
    /// # Safety
    ///
    /// See [`PageAllocator::protect`].
    #[inline]
    pub unsafe fn set_execute_page(page: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { Self::set_execute(page, 1) }
    }
}

/// An owned reservation with a committed prefix.
///
/// Pages `0..committed_pages()` are committed read-write (unless reprotected
/// with [`PageRegion::protect`]); the rest are reserved only.
pub struct PageRegion {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
}

// SAFETY: the region exclusively owns its reservation; the raw base pointer
// is only dereferenced by whoever holds `&mut` or has been handed the
// committed memory.
unsafe impl Send for PageRegion {}
// SAFETY: no method mutates through `&self`.
unsafe impl Sync for PageRegion {}

impl PageRegion {
    /// Reserves `pages` pages with none committed.
    pub fn reserve(pages: usize) -> Result<Self> {
        Ok(PageRegion {
            base: PageAllocator::reserve(pages)?,
            reserved: pages,
            committed: 0,
        })
    }

    /// Reserves and commits `pages` pages.
    pub fn alloc(pages: usize) -> Result<Self> {
        Ok(PageRegion {
            base: PageAllocator::alloc(pages)?,
            reserved: pages,
            committed: pages,
        })
    }

    /// Base address of the reservation.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Base address of the reservation.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Pages claimed by the reservation.
    #[inline]
    pub fn reserved_pages(&self) -> usize {
        self.reserved
    }

    /// Pages currently committed.
    #[inline]
    pub fn committed_pages(&self) -> usize {
        self.committed
    }

    /// Bytes currently committed.
    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.committed * PageAllocator::page_size()
    }

    /// Bytes claimed by the reservation.
    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved * PageAllocator::page_size()
    }

    fn page_ptr(&self, page: usize) -> NonNull<u8> {
        // SAFETY: callers keep `page <= reserved`, so the offset stays within
        // (or one past) the reservation.
        unsafe { self.base.add(page * PageAllocator::page_size()) }
    }

    /// Commits the next `pages` pages after the committed prefix.
    pub fn grow(&mut self, pages: usize) -> Result<()> {
        let first = self.committed;
        if first + pages > self.reserved {
            return Err(Error::PageOutOfRange {
                first,
                count: pages,
                reserved: self.reserved,
            });
        }
        // SAFETY: the range was just checked against the reservation.
        unsafe { PageAllocator::commit_pages(self.page_ptr(first), pages)? };
        self.committed += pages;
        Ok(())
    }

    /// Decommits up to `pages` pages from the end of the committed prefix.
    pub fn shrink(&mut self, pages: usize) {
        let pages = pages.min(self.committed);
        if pages == 0 {
            return;
        }
        let first = self.committed - pages;
        // SAFETY: the range is part of the committed prefix, and `&mut self`
        // means nobody borrows the memory through this region.
        unsafe { PageAllocator::decommit_pages(self.page_ptr(first), pages) };
        self.committed = first;
    }

    /// Grows or shrinks the committed prefix to exactly `pages` pages.
    pub fn commit_to(&mut self, pages: usize) -> Result<()> {
        if pages > self.committed {
            self.grow(pages - self.committed)
        } else {
            self.shrink(self.committed - pages);
            Ok(())
        }
    }

    /// Changes protection of committed pages `first..first + count`.
    pub fn protect(&mut self, first: usize, count: usize, protection: Protection) -> Result<()> {
        if first + count > self.committed {
            return Err(Error::PageOutOfRange {
                first,
                count,
                reserved: self.reserved,
            });
        }
        // SAFETY: the range is committed, and `&mut self` rules out borrows
        // into it through this region.
        unsafe { PageAllocator::protect(self.page_ptr(first), count, protection) }
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        // SAFETY: the region owns the reservation and is going away.
        unsafe { PageAllocator::free(self.base, self.reserved) };
    }
}

impl std::fmt::Debug for PageRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRegion")
            .field("base", &self.base)
            .field("reserved", &self.reserved)
            .field("committed", &self.committed)
            .finish()
    }
}

#[cfg(unix)]
mod sys {
    use std::ptr;

    use super::Protection;

    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 4096 } else { size as usize }
    }

    fn map(bytes: usize, prot: libc::c_int) -> *mut u8 {
        // SAFETY: anonymous private mapping at a kernel-chosen address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr.cast()
        }
    }

    pub(super) fn reserve(bytes: usize) -> *mut u8 {
        map(bytes, libc::PROT_NONE)
    }

    pub(super) fn alloc(bytes: usize) -> *mut u8 {
        map(bytes, libc::PROT_READ | libc::PROT_WRITE)
    }

    pub(super) unsafe fn commit(ptr: *mut u8, bytes: usize) -> bool {
        // SAFETY: the caller guarantees the range is mapped.
        unsafe { libc::mprotect(ptr.cast(), bytes, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }

    pub(super) unsafe fn decommit(ptr: *mut u8, bytes: usize) {
        // SAFETY: the caller guarantees the range is mapped. Dropping the
        // pages first returns the memory; the protection change makes later
        // stray accesses fault like on a fresh reservation.
        unsafe {
            libc::madvise(ptr.cast(), bytes, libc::MADV_DONTNEED);
            libc::mprotect(ptr.cast(), bytes, libc::PROT_NONE);
        }
    }

    pub(super) unsafe fn release(ptr: *mut u8, bytes: usize) {
        // SAFETY: the caller hands over the whole mapping.
        unsafe { libc::munmap(ptr.cast(), bytes) };
    }

    pub(super) unsafe fn protect(ptr: *mut u8, bytes: usize, protection: Protection) -> bool {
        let prot = match protection {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::Execute => libc::PROT_READ | libc::PROT_EXEC,
        };
        // SAFETY: the caller guarantees the range is mapped.
        unsafe { libc::mprotect(ptr.cast(), bytes, prot) == 0 }
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::c_void;
    use std::ptr;

    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_NOACCESS,
        PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, VirtualAlloc, VirtualFree,
        VirtualProtect,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    use super::Protection;

    pub(super) fn page_size() -> usize {
        // SAFETY: SYSTEM_INFO is plain data and GetSystemInfo fills it.
        let info = unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        info.dwPageSize as usize
    }

    pub(super) fn reserve(bytes: usize) -> *mut u8 {
        // SAFETY: reserving at a system-chosen address.
        unsafe { VirtualAlloc(ptr::null(), bytes, MEM_RESERVE, PAGE_NOACCESS).cast() }
    }

    pub(super) fn alloc(bytes: usize) -> *mut u8 {
        // SAFETY: reserving and committing at a system-chosen address.
        unsafe { VirtualAlloc(ptr::null(), bytes, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE).cast() }
    }

    pub(super) unsafe fn commit(ptr: *mut u8, bytes: usize) -> bool {
        // SAFETY: the caller guarantees the range is reserved.
        unsafe { !VirtualAlloc(ptr as *const c_void, bytes, MEM_COMMIT, PAGE_READWRITE).is_null() }
    }

    pub(super) unsafe fn decommit(ptr: *mut u8, bytes: usize) {
        // SAFETY: the caller guarantees the range is reserved.
        unsafe { VirtualFree(ptr.cast(), bytes, MEM_DECOMMIT) };
    }

    pub(super) unsafe fn release(ptr: *mut u8, _bytes: usize) {
        // SAFETY: the caller hands over the whole reservation.
        unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) };
    }

    pub(super) unsafe fn protect(ptr: *mut u8, bytes: usize, protection: Protection) -> bool {
        let flags = match protection {
            Protection::NoAccess => PAGE_NOACCESS,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadOnly => PAGE_READONLY,
            Protection::Execute => PAGE_EXECUTE_READ,
        };
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        // SAFETY: the caller guarantees the range is committed.
        unsafe { VirtualProtect(ptr as *const c_void, bytes, flags, &mut old) != 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PageAllocator::page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
        assert_eq!(PageAllocator::page_size(), size);
    }

    #[test]
    fn test_page_size_concurrent_init() {
        let sizes: Vec<usize> = (0..8)
            .map(|_| std::thread::spawn(PageAllocator::page_size))
            .map(|handle| handle.join().unwrap())
            .collect();
        assert!(sizes.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_pages_for() {
        let page = PageAllocator::page_size();
        assert_eq!(PageAllocator::pages_for(0), 0);
        assert_eq!(PageAllocator::pages_for(1), 1);
        assert_eq!(PageAllocator::pages_for(page), 1);
        assert_eq!(PageAllocator::pages_for(page + 1), 2);
    }

    #[test]
    fn test_zero_page_reserve_fails() {
        assert_eq!(
            PageAllocator::reserve(0),
            Err(Error::OutOfAddressSpace { pages: 0 })
        );
    }

    #[test]
    fn test_alloc_is_writable() {
        let base = PageAllocator::alloc(2).unwrap();
        let page = PageAllocator::page_size();
        // SAFETY: two committed read-write pages.
        unsafe {
            base.as_ptr().write(1);
            base.as_ptr().add(2 * page - 1).write(2);
            assert_eq!(base.as_ptr().read(), 1);
            PageAllocator::free(base, 2);
        }
    }

    #[test]
    fn test_commit_decommit_roundtrip() {
        let base = PageAllocator::reserve(4).unwrap();
        let page = PageAllocator::page_size();
        // SAFETY: all ranges lie in the four-page reservation.
        unsafe {
            let second = base.add(page);
            PageAllocator::commit_pages(second, 2).unwrap();
            second.as_ptr().write(42);
            assert_eq!(second.as_ptr().read(), 42);

            PageAllocator::decommit_page(second);
            PageAllocator::commit_page(second).unwrap();
            // Decommitted pages come back zeroed.
            assert_eq!(second.as_ptr().read(), 0);

            PageAllocator::free(base, 4);
        }
    }

    #[test]
    fn test_region_grow_and_shrink() {
        let mut region = PageRegion::reserve(8).unwrap();
        assert_eq!(region.committed_pages(), 0);
        assert_eq!(region.reserved_pages(), 8);

        region.grow(3).unwrap();
        assert_eq!(region.committed_pages(), 3);
        assert_eq!(region.committed_bytes(), 3 * PageAllocator::page_size());

        region.shrink(1);
        assert_eq!(region.committed_pages(), 2);

        region.commit_to(8).unwrap();
        assert_eq!(region.committed_pages(), 8);

        assert_eq!(
            region.grow(1),
            Err(Error::PageOutOfRange {
                first: 8,
                count: 1,
                reserved: 8
            })
        );

        region.shrink(100);
        assert_eq!(region.committed_pages(), 0);
    }

    #[test]
    fn test_region_protect() {
        let mut region = PageRegion::alloc(2).unwrap();
        // SAFETY: committed read-write.
        unsafe { region.as_ptr().write(9) };

        region.protect(0, 1, Protection::ReadOnly).unwrap();
        // SAFETY: read-only pages are still readable.
        assert_eq!(unsafe { region.as_ptr().read() }, 9);

        region.protect(0, 1, Protection::ReadWrite).unwrap();
        // SAFETY: writable again.
        unsafe { region.as_ptr().write(10) };
        assert_eq!(unsafe { region.as_ptr().read() }, 10);

        assert!(region.protect(1, 2, Protection::ReadOnly).is_err());
    }

    #[test]
    fn test_single_page_protection() {
        let base = PageAllocator::alloc(1).unwrap();
        // SAFETY: one committed page, freed at the end.
        unsafe {
            base.as_ptr().write(3);
            PageAllocator::set_read_only_page(base).unwrap();
            assert_eq!(base.as_ptr().read(), 3);
            PageAllocator::set_read_write_page(base).unwrap();
            base.as_ptr().write(4);
            assert_eq!(base.as_ptr().read(), 4);
            PageAllocator::free(base, 1);
        }
    }
}
