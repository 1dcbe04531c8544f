//! Thunk addresses and data cells

use core::fmt;
use core::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Entry point of an allocated thunk, including any architecture tag
///
/// This is the exact value to jump to or call; it stays valid until the
/// thunk is freed.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThunkAddress(NonZeroUsize);

impl ThunkAddress {
    /// Wrap a raw code address (e.g. one received back from generated code)
    #[inline]
    pub fn from_raw(address: usize) -> Option<Self> {
        NonZeroUsize::new(address).map(Self)
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0.get()
    }

    /// The entry point as a raw code pointer
    #[inline]
    pub fn as_ptr(self) -> *const () {
        self.0.get() as *const ()
    }
}

impl fmt::Debug for ThunkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThunkAddress({:#x})", self.0)
    }
}

impl fmt::Pointer for ThunkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.as_ptr(), f)
    }
}

/// The two words the common stub sees for a thunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThunkData {
    pub context: usize,
    pub target: usize,
}

/// In-place layout of one data cell
///
/// Free: `link` holds the address of the next free cell (0 terminates).
/// Allocated: `link` is the caller's context, `target` the caller's target.
/// Atomics keep unlocked readers free of data races; relaxed loads and
/// stores compile to plain moves, which is what the stubs' consumers see.
#[repr(C)]
pub(crate) struct DataCell {
    pub link: AtomicUsize,
    pub target: AtomicUsize,
}

impl DataCell {
    /// # Safety
    /// `address` must be a cell inside a live, read-write data page.
    #[inline(always)]
    pub unsafe fn at<'a>(address: usize) -> &'a DataCell {
        &*(address as *const DataCell)
    }

    #[inline]
    pub fn next_free(&self) -> usize {
        self.link.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_next_free(&self, next: usize) {
        self.link.store(next, Ordering::Relaxed);
    }

    #[inline]
    pub fn read(&self) -> ThunkData {
        ThunkData {
            context: self.link.load(Ordering::Acquire),
            target: self.target.load(Ordering::Acquire),
        }
    }

    #[inline]
    pub fn write(&self, data: ThunkData) {
        self.link.store(data.context, Ordering::Release);
        self.target.store(data.target, Ordering::Release);
    }
}
