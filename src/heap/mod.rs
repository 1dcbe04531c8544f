//! Thunk heap - per-consumer thunk allocator
//!
//! Design: The free list lives inside the data cells themselves. Slot 0 of a
//! free cell links to the next free cell, so allocation and free are a pop
//! and a push at the list head under one per-heap lock. The list grows by
//! appending whole blocks from the block source at the tail; nothing a heap
//! acquires is ever given back, so issued addresses never move.
//!
//! Thunk address <-> data cell translation is pure arithmetic: the index of a
//! stub within its page-aligned code page equals the index of its cell within
//! the paired data page.

mod address;


pub use address::{ThunkAddress, ThunkData};

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arch::AddressTag;
use crate::blocks::{BlockSource, FREE_MARKER};
use crate::error::ThunkError;
use crate::layout::{ThunkLayout, DATA_CELL_SIZE};
use crate::logging::{log_heap_expanded, log_thunk_allocated, log_thunk_freed};
use crate::provider::{MappingProvider, OsMappingProvider};
use address::DataCell;

/// Membership record for one acquired block pair
struct AllocatedBlock {
    code_base: usize,
    next: *mut AllocatedBlock,
}

/// Free list bookkeeping (guarded by the heap lock)
struct FreeList {
    /// First free cell, 0 when exhausted
    head: usize,
    /// Cell whose link is the terminating 0; 0 when the list is empty
    tail: usize,
    free: usize,
    blocks: usize,
    expansions: usize,
}

impl FreeList {
    /// Whether `cell_address` is currently linked into the list
    fn contains(&self, cell_address: usize) -> bool {
        let mut current = self.head;
        while current != 0 {
            if current == cell_address {
                return true;
            }
            current = unsafe { DataCell::at(current) }.next_free();
        }
        false
    }
}

/// Heap counters for monitoring and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub blocks: usize,
    pub capacity: usize,
    pub free: usize,
    pub allocated: usize,
    /// Blocks acquired after construction
    pub expansions: usize,
}

pub struct ThunkHeap<P: MappingProvider = OsMappingProvider> {
    source: Arc<BlockSource<P>>,
    common_stub: usize,
    free_list: Mutex<FreeList>,
    /// Append-only list of owned blocks; pushed under the lock, read without it
    blocks: AtomicPtr<AllocatedBlock>,
}

impl ThunkHeap<OsMappingProvider> {
    /// Create a heap of executable thunks jumping through `common_stub`
    pub fn create(common_stub: usize) -> Result<Self, ThunkError> {
        Self::with_source(BlockSource::global(), common_stub)
    }
}

impl<P: MappingProvider> ThunkHeap<P> {
    /// Create a heap drawing blocks from `source`
    ///
    /// Acquires the first block pair immediately.
    pub fn with_source(source: Arc<BlockSource<P>>, common_stub: usize) -> Result<Self, ThunkError> {
        let heap = Self {
            source,
            common_stub,
            free_list: Mutex::new(FreeList {
                head: 0,
                tail: 0,
                free: 0,
                blocks: 0,
                expansions: 0,
            }),
            blocks: AtomicPtr::new(ptr::null_mut()),
        };

        {
            let mut list = heap.free_list.lock();
            heap.acquire_block(&mut list)?;
        }

        Ok(heap)
    }

    #[inline]
    fn provider(&self) -> &P {
        self.source.provider()
    }

    #[inline]
    pub fn layout(&self) -> &ThunkLayout {
        self.provider().layout()
    }

    /// Handler every thunk of this heap jumps to
    #[inline]
    pub fn common_stub(&self) -> usize {
        self.common_stub
    }

    /// Take a block pair from the source and append its cells to the list
    fn acquire_block(&self, list: &mut FreeList) -> Result<(), ThunkError> {
        let layout = *self.layout();
        let code_block = self.source.get_block()?;
        let data_block = self.provider().data_region_of(code_block);

        debug_assert_eq!(data_block & layout.page_mask(), 0, "data page must be page aligned");

        unsafe {
            let slot = (data_block + layout.common_stub_slot_offset()) as *mut usize;
            slot.write(self.common_stub);
        }

        let first = data_block;
        let last = data_block + DATA_CELL_SIZE * (layout.thunks_per_block() - 1);

        if list.tail == 0 {
            debug_assert_eq!(list.head, 0);
            list.head = first;
        } else {
            unsafe { DataCell::at(list.tail) }.set_next_free(first);
        }
        list.tail = last;
        list.free += layout.thunks_per_block();

        let record = Box::into_raw(Box::new(AllocatedBlock {
            code_base: code_block,
            next: self.blocks.load(Ordering::Relaxed),
        }));
        self.blocks.store(record, Ordering::Release);

        if list.blocks > 0 {
            list.expansions += 1;
        }
        list.blocks += 1;
        log_heap_expanded(code_block, list.blocks, list.free);

        Ok(())
    }

    /// Allocate a thunk, growing the heap if every thunk is in use
    pub fn allocate(&self) -> Result<ThunkAddress, ThunkError> {
        let cell_address = {
            let mut list = self.free_list.lock();
            if list.head == 0 {
                self.acquire_block(&mut list)?;
            }

            let cell_address = list.head;
            list.head = unsafe { DataCell::at(cell_address) }.next_free();
            if list.head == 0 {
                list.tail = 0;
            }
            list.free -= 1;
            cell_address
        };

        if cfg!(debug_assertions) {
            unsafe { DataCell::at(cell_address) }.target.store(0, Ordering::Relaxed);
        }

        let layout = self.layout();
        let offset = cell_address & layout.page_mask();
        debug_assert_eq!(offset % DATA_CELL_SIZE, 0);
        let index = offset / DATA_CELL_SIZE;

        let stub = self.provider().code_region_of(cell_address) + index * layout.stub_size();
        log_thunk_allocated(stub, cell_address);

        ThunkAddress::from_raw(P::Tag::tag(stub)).ok_or(ThunkError::OutOfMemory)
    }

    /// Return a thunk to the heap
    ///
    /// # Safety
    /// `thunk` must have been returned by `allocate` on this heap and not
    /// freed since. Code still jumping through it after this call sees
    /// whatever the next owner stores. Debug builds assert both conditions;
    /// the double free check walks the free list, so it is linear there.
    pub unsafe fn free_thunk(&self, thunk: ThunkAddress) {
        let Some(cell_address) = self.data_cell_of(thunk) else {
            if cfg!(debug_assertions) {
                panic!("{:?} is not a thunk address", thunk);
            }
            return;
        };
        let cell = DataCell::at(cell_address);

        if cfg!(debug_assertions) {
            assert!(self.is_thunk_in_heap(thunk), "{:?} does not belong to this heap", thunk);
        }

        {
            let mut list = self.free_list.lock();
            if cfg!(debug_assertions) {
                assert!(!list.contains(cell_address), "double free of {:?}", thunk);
                // Poison the stale target
                cell.target.store(FREE_MARKER, Ordering::Relaxed);
            }
            cell.set_next_free(list.head);
            list.head = cell_address;
            if list.tail == 0 {
                list.tail = cell_address;
            }
            list.free += 1;
        }

        log_thunk_freed(thunk.as_usize());
    }

    /// Read the context/target pair of a thunk owned by this heap
    ///
    /// Returns `None` for misaligned addresses, missing tags, and addresses
    /// outside every block of this heap. The caller must ensure the thunk is
    /// not being freed concurrently; the values of a free thunk are
    /// meaningless.
    pub fn try_get_thunk_data(&self, thunk: ThunkAddress) -> Option<ThunkData> {
        let cell_address = self.data_cell_of(thunk)?;
        if !self.is_thunk_in_heap(thunk) {
            return None;
        }
        Some(unsafe { DataCell::at(cell_address) }.read())
    }

    /// Store the context/target pair the common stub will see for `thunk`
    ///
    /// # Safety
    /// `thunk` must be currently allocated from this heap and owned by the
    /// caller. No ownership check is made in release builds.
    pub unsafe fn set_thunk_data(&self, thunk: ThunkAddress, context: usize, target: usize) {
        let Some(cell_address) = self.data_cell_of(thunk) else {
            if cfg!(debug_assertions) {
                panic!("{:?} is not a thunk address", thunk);
            }
            return;
        };
        debug_assert!(self.is_thunk_in_heap(thunk), "{:?} does not belong to this heap", thunk);

        DataCell::at(cell_address).write(ThunkData { context, target });
    }

    /// Whether `thunk` lies inside a block pair this heap acquired
    ///
    /// Linear in the number of blocks; blocks are acquired rarely.
    pub fn is_thunk_in_heap(&self, thunk: ThunkAddress) -> bool {
        let Some(address) = P::Tag::strip(thunk.as_usize()) else {
            return false;
        };
        let span = self.layout().block_code_span();

        let mut current = self.blocks.load(Ordering::Acquire);
        while !current.is_null() {
            let block = unsafe { &*current };
            if address >= block.code_base && address < block.code_base + span {
                return true;
            }
            current = block.next;
        }
        false
    }

    /// Data cell paired with a stub address, if the address is stub-aligned
    fn data_cell_of(&self, thunk: ThunkAddress) -> Option<usize> {
        let address = P::Tag::strip(thunk.as_usize())?;
        let layout = self.layout();

        let page = address & !layout.page_mask();
        let offset = address - page;
        if offset % layout.stub_size() != 0 {
            return None;
        }
        let index = offset / layout.stub_size();
        if index >= layout.thunks_per_block() {
            return None;
        }

        Some(self.provider().data_region_of(page).wrapping_add(index * DATA_CELL_SIZE))
    }

    /// Grow until at least `additional` thunks can be allocated without
    /// touching the block source
    ///
    /// New blocks go to the tail, so previously freed thunks are still
    /// handed out first.
    pub fn reserve(&self, additional: usize) -> Result<(), ThunkError> {
        let mut list = self.free_list.lock();
        while list.free < additional {
            self.acquire_block(&mut list)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        let list = self.free_list.lock();
        let capacity = list.blocks * self.layout().thunks_per_block();
        HeapStats {
            blocks: list.blocks,
            capacity,
            free: list.free,
            allocated: capacity - list.free,
            expansions: list.expansions,
        }
    }
}

impl<P: MappingProvider> Drop for ThunkHeap<P> {
    fn drop(&mut self) {
        // Block pairs stay mapped; only the membership records go away
        let mut current = *self.blocks.get_mut();
        while !current.is_null() {
            let block = unsafe { Box::from_raw(current) };
            current = block.next;
        }
    }
}
