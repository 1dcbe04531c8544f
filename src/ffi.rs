//! C FFI - stable ABI for generated code
//!
//! Errors surface as null pointers or `false`; the reason is logged. Heaps
//! created here live for the rest of the process, matching the mappings
//! behind them.

use core::ffi::c_void;
use core::ptr;

use tracing::error;

use crate::heap::{ThunkAddress, ThunkHeap};

/// Initialize thunk pool logging (called once at program start)
#[no_mangle]
pub extern "C" fn typthon_thunks_init() {
    crate::init();
}

/// Create a heap whose thunks jump through `common_stub`
///
/// Returns null if the first block pair cannot be mapped.
#[no_mangle]
pub extern "C" fn typthon_thunk_heap_create(common_stub: *const c_void) -> *mut ThunkHeap {
    match ThunkHeap::create(common_stub as usize) {
        Ok(heap) => Box::into_raw(Box::new(heap)),
        Err(err) => {
            error!(error = %err, "thunk heap creation failed");
            ptr::null_mut()
        }
    }
}

/// Allocate a thunk; null on failure
///
/// # Safety
/// `heap` must be null or a pointer returned by `typthon_thunk_heap_create`.
#[no_mangle]
pub unsafe extern "C" fn typthon_thunk_allocate(heap: *const ThunkHeap) -> *const c_void {
    let Some(heap) = heap.as_ref() else {
        return ptr::null();
    };

    match heap.allocate() {
        Ok(thunk) => thunk.as_ptr() as *const c_void,
        Err(err) => {
            error!(error = %err, "thunk allocation failed");
            ptr::null()
        }
    }
}

/// Return a thunk to its heap
///
/// # Safety
/// `heap` as for `typthon_thunk_allocate`; `thunk` must be null or a live
/// thunk allocated from `heap`.
#[no_mangle]
pub unsafe extern "C" fn typthon_thunk_free(heap: *const ThunkHeap, thunk: *const c_void) {
    if let (Some(heap), Some(thunk)) = (heap.as_ref(), ThunkAddress::from_raw(thunk as usize)) {
        heap.free_thunk(thunk);
    }
}

/// Store the context/target pair for a thunk
///
/// # Safety
/// Same as `typthon_thunk_free`, and the caller must own `thunk`.
#[no_mangle]
pub unsafe extern "C" fn typthon_thunk_set_data(
    heap: *const ThunkHeap,
    thunk: *const c_void,
    context: usize,
    target: usize,
) {
    if let (Some(heap), Some(thunk)) = (heap.as_ref(), ThunkAddress::from_raw(thunk as usize)) {
        heap.set_thunk_data(thunk, context, target);
    }
}

/// Read the context/target pair of any address, validating ownership
///
/// Writes through the out pointers only on success.
///
/// # Safety
/// `heap` as for `typthon_thunk_allocate`; `context` and `target` must be
/// null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn typthon_thunk_try_get_data(
    heap: *const ThunkHeap,
    thunk: *const c_void,
    context: *mut usize,
    target: *mut usize,
) -> bool {
    let Some(heap) = heap.as_ref() else {
        return false;
    };
    let Some(data) = ThunkAddress::from_raw(thunk as usize).and_then(|t| heap.try_get_thunk_data(t))
    else {
        return false;
    };

    if !context.is_null() {
        context.write(data.context);
    }
    if !target.is_null() {
        target.write(data.target);
    }
    true
}

/// Whether `thunk` belongs to `heap`
///
/// # Safety
/// `heap` as for `typthon_thunk_allocate`.
#[no_mangle]
pub unsafe extern "C" fn typthon_thunk_is_in_heap(heap: *const ThunkHeap, thunk: *const c_void) -> bool {
    match (heap.as_ref(), ThunkAddress::from_raw(thunk as usize)) {
        (Some(heap), Some(thunk)) => heap.is_thunk_in_heap(thunk),
        _ => false,
    }
}
