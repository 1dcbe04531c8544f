//! Mapping providers - where block pairs come from
//!
//! Architecture:
//! - `os.rs` - executable mappings via mmap/mprotect (VirtualAlloc on Windows)
//! - `memory.rs` - page-aligned process-heap memory, no execute permission

mod os;
mod memory;

pub use os::OsMappingProvider;
pub use memory::InMemoryProvider;

use crate::arch::AddressTag;
use crate::error::ThunkError;
use crate::layout::ThunkLayout;

/// Source of freshly mapped block pairs
///
/// A mapping of `block_count` pairs is one contiguous run whose code pages
/// start at the returned base, `layout().block_stride()` apart. Every code
/// page must be aligned to `layout().page_size()`.
pub trait MappingProvider: Send + Sync + 'static {
    /// How entry addresses are tagged for this provider's code
    type Tag: AddressTag;

    fn layout(&self) -> &ThunkLayout;

    /// Reserve and commit `block_count` block pairs, returning the first code page
    fn request_mapping(&self, block_count: usize) -> Result<usize, ThunkError>;

    /// Data page paired with a code page (any address inside the page)
    #[inline]
    fn data_region_of(&self, code_address: usize) -> usize {
        self.layout().data_region_of(code_address)
    }

    /// Code page paired with a data page (any address inside the page)
    #[inline]
    fn code_region_of(&self, data_address: usize) -> usize {
        self.layout().code_region_of(data_address)
    }
}
