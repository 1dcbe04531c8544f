//! Thunk layout - platform constants for stub/data block pairs
//!
//! A block pair is one code page of `N` stubs plus one data page of `N`
//! two-word cells. The last word of every data page is reserved for the
//! common stub address that all stubs in the paired code page jump through.
//!
//! Block pairs are handed out in batches (one OS mapping each). The batch is
//! arranged either with all code pages first (`Split`) or with code/data pages
//! alternating (`Interleaved`); either way the pairing is pure arithmetic.

use crate::error::ThunkError;

/// Machine word size
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Size of one thunk data cell (context + target)
pub const DATA_CELL_SIZE: usize = 2 * WORD_SIZE;

/// How code and data pages are ordered inside one mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionArrangement {
    /// All code pages, then all data pages
    Split,
    /// Code page, data page, code page, data page, ...
    Interleaved,
}

/// Immutable layout constants shared by a provider, its block source and heaps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThunkLayout {
    stub_size: usize,
    thunks_per_block: usize,
    blocks_per_mapping: usize,
    page_size: usize,
    arrangement: RegionArrangement,
}

impl ThunkLayout {
    /// Build a layout from a fixed thunk count, deriving the page size
    ///
    /// The page size is the smallest power of two holding either the stubs or
    /// the data cells plus the reserved common stub slot, whichever is larger.
    pub fn new(
        stub_size: usize,
        thunks_per_block: usize,
        blocks_per_mapping: usize,
        arrangement: RegionArrangement,
    ) -> Result<Self, ThunkError> {
        if stub_size == 0 || thunks_per_block == 0 || blocks_per_mapping == 0 {
            return Err(ThunkError::InvalidLayout(format!(
                "zero-sized layout (stub {}, thunks {}, blocks {})",
                stub_size, thunks_per_block, blocks_per_mapping
            )));
        }

        let overflow = || ThunkError::InvalidLayout("block size overflows usize".into());

        let code_bytes = stub_size.checked_mul(thunks_per_block).ok_or_else(overflow)?;
        let data_bytes = DATA_CELL_SIZE
            .checked_mul(thunks_per_block)
            .and_then(|bytes| bytes.checked_add(WORD_SIZE))
            .ok_or_else(overflow)?;
        let page_size = code_bytes
            .max(data_bytes)
            .checked_next_power_of_two()
            .ok_or_else(overflow)?;

        Self::checked(Self {
            stub_size,
            thunks_per_block,
            blocks_per_mapping,
            page_size,
            arrangement,
        })
    }

    /// Build a layout for a fixed page size, packing as many thunks as fit
    pub fn fill_page(
        stub_size: usize,
        page_size: usize,
        blocks_per_mapping: usize,
        arrangement: RegionArrangement,
    ) -> Result<Self, ThunkError> {
        if stub_size == 0 || blocks_per_mapping == 0 {
            return Err(ThunkError::InvalidLayout(format!(
                "zero-sized layout (stub {}, blocks {})",
                stub_size, blocks_per_mapping
            )));
        }
        if !page_size.is_power_of_two() {
            return Err(ThunkError::InvalidLayout(format!(
                "page size {} is not a power of two",
                page_size
            )));
        }

        let by_code = page_size / stub_size;
        let by_data = page_size.saturating_sub(WORD_SIZE) / DATA_CELL_SIZE;
        let thunks_per_block = by_code.min(by_data);
        if thunks_per_block == 0 {
            return Err(ThunkError::InvalidLayout(format!(
                "page size {} cannot hold a single thunk",
                page_size
            )));
        }

        Self::checked(Self {
            stub_size,
            thunks_per_block,
            blocks_per_mapping,
            page_size,
            arrangement,
        })
    }

    /// Minimal layout for providers that will refuse every request
    pub(crate) fn placeholder(blocks_per_mapping: usize) -> Self {
        Self {
            stub_size: 16,
            thunks_per_block: 1,
            blocks_per_mapping: blocks_per_mapping.max(1),
            page_size: 32,
            arrangement: RegionArrangement::Split,
        }
    }

    fn checked(layout: Self) -> Result<Self, ThunkError> {
        layout
            .mapping_size()
            .ok_or_else(|| ThunkError::InvalidLayout("mapping size overflows usize".into()))?;
        Ok(layout)
    }

    #[inline]
    pub fn stub_size(&self) -> usize {
        self.stub_size
    }

    #[inline]
    pub fn data_cell_size(&self) -> usize {
        DATA_CELL_SIZE
    }

    #[inline]
    pub fn thunks_per_block(&self) -> usize {
        self.thunks_per_block
    }

    #[inline]
    pub fn blocks_per_mapping(&self) -> usize {
        self.blocks_per_mapping
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn page_mask(&self) -> usize {
        self.page_size - 1
    }

    #[inline]
    pub fn arrangement(&self) -> RegionArrangement {
        self.arrangement
    }

    /// Offset of the common stub slot inside a data page
    #[inline]
    pub fn common_stub_slot_offset(&self) -> usize {
        self.page_size - WORD_SIZE
    }

    /// Bytes of a code page actually covered by stubs
    #[inline]
    pub fn block_code_span(&self) -> usize {
        self.stub_size * self.thunks_per_block
    }

    /// Distance between consecutive code pages of one mapping
    #[inline]
    pub fn block_stride(&self) -> usize {
        match self.arrangement {
            RegionArrangement::Split => self.page_size,
            RegionArrangement::Interleaved => 2 * self.page_size,
        }
    }

    /// Bytes reserved by one mapping of `blocks_per_mapping` pairs
    pub fn mapping_size(&self) -> Option<usize> {
        self.page_size
            .checked_mul(2)?
            .checked_mul(self.blocks_per_mapping)
    }

    /// Same layout with a different batch size
    pub fn with_blocks_per_mapping(self, blocks_per_mapping: usize) -> Result<Self, ThunkError> {
        if blocks_per_mapping == 0 {
            return Err(ThunkError::InvalidLayout("zero blocks per mapping".into()));
        }
        Self::checked(Self { blocks_per_mapping, ..self })
    }

    /// Data page paired with the code page containing `code_address`
    ///
    /// Pure arithmetic; wraps instead of panicking for foreign addresses.
    #[inline]
    pub fn data_region_of(&self, code_address: usize) -> usize {
        let base = code_address & !self.page_mask();
        match self.arrangement {
            RegionArrangement::Split => base.wrapping_add(self.blocks_per_mapping * self.page_size),
            RegionArrangement::Interleaved => base.wrapping_add(self.page_size),
        }
    }

    /// Code page paired with the data page containing `data_address`
    #[inline]
    pub fn code_region_of(&self, data_address: usize) -> usize {
        let base = data_address & !self.page_mask();
        match self.arrangement {
            RegionArrangement::Split => base.wrapping_sub(self.blocks_per_mapping * self.page_size),
            RegionArrangement::Interleaved => base.wrapping_sub(self.page_size),
        }
    }
}
