//! Memory management primitives without a garbage collector
//!
//! This crate provides the low-level storage layer used by the Tau utilities:
//!
//! - **Pages**: reserve, commit, decommit and protect virtual memory
//!   ([`page`])
//! - **Heap allocators**: a two-operation allocator trait with counting,
//!   double-free guarding, page-backed and ring variants ([`alloc`]); a
//!   leak tracker with the `leak-tracking` feature
//! - **Reference counting**: co-allocated single-count ([`rc`]) and
//!   strong/weak ([`sw`]) pointers
//! - **Arrays**: the page-committing [`array_list::ArrayList`] and the fixed
//!   length [`dyn_array`] family
//! - **Trees**: the index-addressed [`avl::StreamedAvlTree`] and the
//!   allocator-backed [`avl::AvlTree`]
//!
//! Allocation failure is reported as [`Error`]; detected corruption such as
//! a double free panics.

pub mod alloc;
pub mod array_list;
pub mod avl;
pub mod dyn_array;
pub mod error;
pub mod page;
pub mod rc;
pub mod sw;

pub use error::{Error, Result};
