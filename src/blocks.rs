//! Block source - batches provider mappings into single block pairs
//!
//! One provider request yields `blocks_per_mapping` block pairs; the unused
//! ones wait in a small cache so consecutive heaps do not each trigger an OS
//! mapping. The cache has its own lock: it is shared by every heap drawing
//! from the same source, and no heap lock covers it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ThunkConfig;
use crate::error::ThunkError;
use crate::layout::DATA_CELL_SIZE;
use crate::provider::{MappingProvider, OsMappingProvider};

/// Slot 1 of a cell that sits in a free list (debug builds only)
pub(crate) const FREE_MARKER: usize = usize::MAX;

/// Process-wide source backed by executable OS mappings
static GLOBAL: Lazy<Arc<BlockSource<OsMappingProvider>>> = Lazy::new(|| {
    let config = ThunkConfig::from_env();
    Arc::new(BlockSource::new(OsMappingProvider::host(config.blocks_per_mapping)))
});

/// Code pages from the most recent mapping not yet handed out
struct BatchCache {
    blocks: Vec<usize>,
    cursor: usize,
}

impl BatchCache {
    fn take(&mut self) -> Option<usize> {
        let block = self.blocks.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(block)
    }

    fn refill(&mut self, base: usize, count: usize, stride: usize) {
        self.blocks.clear();
        self.blocks.extend((0..count).map(|i| base + i * stride));
        self.cursor = 0;
    }

    fn remaining(&self) -> usize {
        self.blocks.len() - self.cursor
    }
}

pub struct BlockSource<P: MappingProvider> {
    provider: P,
    cache: Mutex<BatchCache>,
    blocks_issued: AtomicUsize,
    mappings_requested: AtomicUsize,
}

impl BlockSource<OsMappingProvider> {
    /// The shared process-wide source
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }
}

impl<P: MappingProvider> BlockSource<P> {
    pub fn new(provider: P) -> Self {
        let capacity = provider.layout().blocks_per_mapping();
        Self {
            provider,
            cache: Mutex::new(BatchCache {
                blocks: Vec::with_capacity(capacity),
                cursor: 0,
            }),
            blocks_issued: AtomicUsize::new(0),
            mappings_requested: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Hand out one fresh block pair, returning its code page
    ///
    /// The data page comes back threaded as a free list: cell `i` links to
    /// cell `i + 1` and the last cell holds null. The common stub slot is left
    /// for the consuming heap to fill in.
    pub fn get_block(&self) -> Result<usize, ThunkError> {
        let code_block = {
            let mut cache = self.cache.lock();
            match cache.take() {
                Some(block) => block,
                None => self.map_batch(&mut cache)?,
            }
        };

        unsafe {
            self.thread_free_list(self.provider.data_region_of(code_block));
        }

        self.blocks_issued.fetch_add(1, Ordering::Relaxed);
        Ok(code_block)
    }

    /// Request a new mapping and serve its first block (cache lock held)
    fn map_batch(&self, cache: &mut BatchCache) -> Result<usize, ThunkError> {
        let layout = self.provider.layout();
        let count = layout.blocks_per_mapping();

        let base = self.provider.request_mapping(count).map_err(|err| {
            warn!(error = %err, blocks = count, "thunk block mapping failed");
            err
        })?;
        self.mappings_requested.fetch_add(1, Ordering::Relaxed);

        cache.refill(base, count, layout.block_stride());
        debug!(
            base = ?(base as *const ()),
            blocks = count,
            "cached new thunk block batch"
        );

        cache.take().ok_or(ThunkError::OutOfMemory)
    }

    /// # Safety
    /// `data_block` must be the data page of a block pair not yet handed out.
    unsafe fn thread_free_list(&self, data_block: usize) {
        let count = self.provider.layout().thunks_per_block();

        for index in 0..count {
            let cell = (data_block + index * DATA_CELL_SIZE) as *mut usize;
            let next = if index + 1 == count {
                0
            } else {
                cell as usize + DATA_CELL_SIZE
            };
            cell.write(next);
            if cfg!(debug_assertions) {
                cell.add(1).write(FREE_MARKER);
            }
        }
    }

    /// Block pairs handed out so far
    pub fn blocks_issued(&self) -> usize {
        self.blocks_issued.load(Ordering::Relaxed)
    }

    /// Provider mappings requested so far
    pub fn mappings_requested(&self) -> usize {
        self.mappings_requested.load(Ordering::Relaxed)
    }

    /// Block pairs mapped but not yet handed out
    pub fn cached_blocks(&self) -> usize {
        self.cache.lock().remaining()
    }
}
