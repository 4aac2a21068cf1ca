//! Error types for `tau-mem`.
//!
//! Every recoverable failure in the crate (address-space exhaustion, failed
//! commits, full containers) is reported through [`Error`]. Detected memory
//! corruption such as a double free is not an error value: it panics.

use std::fmt;

/// Errors reported by the page allocator, heap allocators and containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Reserving address space failed.
    OutOfAddressSpace {
        /// Number of pages requested.
        pages: usize,
    },

    /// Backing reserved pages with memory failed.
    CommitFailed {
        /// Number of pages requested.
        pages: usize,
    },

    /// Changing page protection failed.
    ProtectFailed {
        /// Number of pages affected.
        pages: usize,
    },

    /// A heap allocator could not satisfy a request.
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
    },

    /// The allocator cannot honor the requested alignment.
    InvalidAlignment {
        /// The requested alignment.
        alignment: usize,
    },

    /// A page range falls outside its reservation.
    PageOutOfRange {
        /// First page of the range.
        first: usize,
        /// Number of pages in the range.
        count: usize,
        /// Pages reserved by the region.
        reserved: usize,
    },

    /// A container has no room for another element.
    CapacityExceeded {
        /// The container's element capacity.
        capacity: usize,
    },

    /// An index is outside the live elements.
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// Number of live elements.
        len: usize,
    },

    /// Mutation was attempted while other handles share the storage.
    SharedHandle,

    /// The tree index type cannot address the requested capacity.
    IndexWidthTooSmall {
        /// The requested capacity.
        max_elements: usize,
    },

    /// A ring allocator request exceeds its slot size.
    SlotTooLarge {
        /// Requested size in bytes.
        size: usize,
        /// Size of one ring slot.
        slot_size: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfAddressSpace { pages } => {
                write!(f, "Out of address space: could not reserve {pages} pages")
            }
            Error::CommitFailed { pages } => {
                write!(f, "Failed to commit {pages} pages")
            }
            Error::ProtectFailed { pages } => {
                write!(f, "Failed to change protection of {pages} pages")
            }
            Error::OutOfMemory { size } => {
                write!(f, "Out of memory: failed to allocate {size} bytes")
            }
            Error::InvalidAlignment { alignment } => {
                write!(f, "Unsupported alignment: {alignment}")
            }
            Error::PageOutOfRange {
                first,
                count,
                reserved,
            } => {
                write!(
                    f,
                    "Pages {first}..{} outside reservation of {reserved} pages",
                    first + count
                )
            }
            Error::CapacityExceeded { capacity } => {
                write!(f, "Capacity of {capacity} elements exceeded")
            }
            Error::IndexOutOfBounds { index, len } => {
                write!(f, "Index {index} out of bounds for length {len}")
            }
            Error::SharedHandle => {
                write!(f, "Storage is shared by other handles")
            }
            Error::IndexWidthTooSmall { max_elements } => {
                write!(f, "Index type cannot address {max_elements} elements")
            }
            Error::SlotTooLarge { size, slot_size } => {
                write!(
                    f,
                    "Request of {size} bytes exceeds ring slot of {slot_size} bytes"
                )
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for `tau-mem` operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::OutOfAddressSpace { pages: 8 }.to_string(),
            "Out of address space: could not reserve 8 pages"
        );
        assert_eq!(
            Error::PageOutOfRange {
                first: 3,
                count: 2,
                reserved: 4
            }
            .to_string(),
            "Pages 3..5 outside reservation of 4 pages"
        );
        assert_eq!(
            Error::IndexOutOfBounds { index: 7, len: 2 }.to_string(),
            "Index 7 out of bounds for length 2"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(
            Error::CapacityExceeded { capacity: 4 },
            Error::CapacityExceeded { capacity: 4 }
        );
        assert_ne!(Error::SharedHandle, Error::OutOfMemory { size: 0 });
    }

    #[test]
    fn test_error_is_std_error() {
        fn takes_error(_: &dyn std::error::Error) {}
        takes_error(&Error::SharedHandle);
    }
}
