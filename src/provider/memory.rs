//! Process-heap backed provider
//!
//! Hands out zeroed, page-aligned memory from the global allocator. Code pages
//! are never made executable, so stubs cannot be called; everything else
//! (pairing, free lists, data cells) behaves exactly as with OS mappings.
//! Supports failure injection for exercising the error paths.

use core::marker::PhantomData;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::MappingProvider;
use crate::arch::{AddressTag, TargetTag};
use crate::error::ThunkError;
use crate::layout::ThunkLayout;

/// One live allocation, released when the provider drops
struct Region {
    base: usize,
    layout: Layout,
}

pub struct InMemoryProvider<T: AddressTag = TargetTag> {
    layout: ThunkLayout,
    /// Mappings allowed before reporting `OutOfMemory`
    budget: Option<usize>,
    /// Reason reported on every request when set
    unsupported: Option<String>,
    regions: Mutex<Vec<Region>>,
    served: AtomicUsize,
    _tag: PhantomData<fn() -> T>,
}

impl InMemoryProvider<TargetTag> {
    /// Provider tagging addresses like the build target
    pub fn new(layout: ThunkLayout) -> Self {
        Self::with_tag(layout)
    }

    /// Provider that rejects every request as unsupported
    pub fn unsupported(layout: ThunkLayout, reason: impl Into<String>) -> Self {
        let mut provider = Self::new(layout);
        provider.unsupported = Some(reason.into());
        provider
    }
}

impl<T: AddressTag> InMemoryProvider<T> {
    /// Provider with an explicit tagging strategy
    pub fn with_tag(layout: ThunkLayout) -> Self {
        Self {
            layout,
            budget: None,
            unsupported: None,
            regions: Mutex::new(Vec::new()),
            served: AtomicUsize::new(0),
            _tag: PhantomData,
        }
    }

    /// Fail with `OutOfMemory` once `mappings` requests have been served
    pub fn with_budget(mut self, mappings: usize) -> Self {
        self.budget = Some(mappings);
        self
    }

    /// Number of mapping requests served so far
    pub fn mappings_served(&self) -> usize {
        self.served.load(Ordering::Relaxed)
    }

    /// Total bytes currently held
    pub fn bytes_mapped(&self) -> usize {
        self.regions.lock().iter().map(|r| r.layout.size()).sum()
    }
}

impl<T: AddressTag> MappingProvider for InMemoryProvider<T> {
    type Tag = T;

    fn layout(&self) -> &ThunkLayout {
        &self.layout
    }

    fn request_mapping(&self, block_count: usize) -> Result<usize, ThunkError> {
        if let Some(reason) = &self.unsupported {
            return Err(ThunkError::Unsupported(reason.clone()));
        }

        let mut regions = self.regions.lock();

        if let Some(budget) = self.budget {
            if self.served.load(Ordering::Relaxed) >= budget {
                warn!(budget, "in-memory mapping budget exhausted");
                return Err(ThunkError::OutOfMemory);
            }
        }

        if block_count != self.layout.blocks_per_mapping() {
            return Err(ThunkError::InvalidLayout(format!(
                "requested {} blocks, layout pairs {} per mapping",
                block_count,
                self.layout.blocks_per_mapping()
            )));
        }

        let layout = self
            .layout
            .mapping_size()
            .and_then(|size| Layout::from_size_align(size, self.layout.page_size()).ok())
            .ok_or_else(|| ThunkError::InvalidLayout("mapping exceeds address space".into()))?;

        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(ThunkError::OutOfMemory);
        }

        debug!(
            base = ?base,
            size_bytes = layout.size(),
            blocks = block_count,
            "in-memory thunk mapping"
        );

        regions.push(Region { base: base as usize, layout });
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(base as usize)
    }
}

impl<T: AddressTag> Drop for InMemoryProvider<T> {
    fn drop(&mut self) {
        for region in self.regions.get_mut().drain(..) {
            unsafe {
                dealloc(region.base as *mut u8, region.layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RegionArrangement;

    fn layout() -> ThunkLayout {
        ThunkLayout::new(16, 4, 2, RegionArrangement::Split).unwrap()
    }

    #[test]
    fn mappings_are_page_aligned() {
        let provider = InMemoryProvider::new(layout());
        let base = provider.request_mapping(2).unwrap();
        assert_eq!(base % provider.layout().page_size(), 0);
        assert_eq!(provider.mappings_served(), 1);
        assert_eq!(provider.bytes_mapped(), 4 * provider.layout().page_size());
    }

    #[test]
    fn batch_size_must_match_layout() {
        let provider = InMemoryProvider::new(layout());
        assert!(matches!(
            provider.request_mapping(3),
            Err(ThunkError::InvalidLayout(_))
        ));
    }

    #[test]
    fn budget_reports_out_of_memory() {
        let provider = InMemoryProvider::new(layout()).with_budget(1);
        assert!(provider.request_mapping(2).is_ok());
        assert_eq!(provider.request_mapping(2), Err(ThunkError::OutOfMemory));
        assert_eq!(provider.mappings_served(), 1);
    }

    #[test]
    fn unsupported_provider_never_maps() {
        let provider = InMemoryProvider::unsupported(layout(), "test platform");
        assert_eq!(
            provider.request_mapping(2),
            Err(ThunkError::Unsupported("test platform".into()))
        );
        assert_eq!(provider.bytes_mapped(), 0);
    }
}
