//! Executable thunk mappings from the operating system
//!
//! Each request reserves `2 * blocks` pages read-write, writes every stub of
//! the code half, then flips the code half to read-execute. Data pages stay
//! read-write for the lifetime of the process; nothing is ever unmapped once
//! handed out.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, info, warn};

use super::MappingProvider;
use crate::arch::{self, StubTargets, TargetTag};
use crate::error::ThunkError;
use crate::layout::{RegionArrangement, ThunkLayout, DATA_CELL_SIZE};

/// Maps real executable thunk blocks for the host architecture
pub struct OsMappingProvider {
    layout: ThunkLayout,
    /// Set when the host cannot run thunks; reported on every request
    unsupported: Option<String>,
    mappings: AtomicUsize,
}

impl OsMappingProvider {
    /// Provider for the host, pairing `blocks_per_mapping` blocks per OS call
    ///
    /// Never fails: an unusable host is reported by `request_mapping`, so the
    /// error surfaces at the first allocation.
    pub fn host(blocks_per_mapping: usize) -> Self {
        let layout = arch::host_stub_size()
            .ok_or_else(|| {
                ThunkError::Unsupported(format!("no thunk stubs for {}", arch::host_arch()))
            })
            .and_then(|stub_size| {
                let page_size = sys::page_size();
                let reach = arch::host_stub_reach();
                let blocks = blocks_within_reach(blocks_per_mapping, page_size, reach);
                if blocks < blocks_per_mapping {
                    warn!(
                        requested = blocks_per_mapping,
                        blocks,
                        page_size,
                        "clamped thunk blocks per mapping to stub reach"
                    );
                }
                ThunkLayout::fill_page(stub_size, page_size, blocks, RegionArrangement::Split)
            });

        match layout {
            Ok(layout) => Self {
                layout,
                unsupported: None,
                mappings: AtomicUsize::new(0),
            },
            Err(err) => Self {
                layout: ThunkLayout::placeholder(blocks_per_mapping),
                unsupported: Some(err.to_string()),
                mappings: AtomicUsize::new(0),
            },
        }
    }

    /// Number of OS mappings created so far
    pub fn mappings_served(&self) -> usize {
        self.mappings.load(Ordering::Relaxed)
    }

    /// Write every stub of every code page in the mapping at `base`
    ///
    /// # Safety
    /// `base` must point at a writable mapping of `layout.mapping_size()` bytes.
    unsafe fn emit_stubs(&self, base: usize) -> Result<(), ThunkError> {
        let layout = &self.layout;

        for block in 0..layout.blocks_per_mapping() {
            let code = base + block * layout.block_stride();
            let data = layout.data_region_of(code);
            let common_slot = data + layout.common_stub_slot_offset();

            for index in 0..layout.thunks_per_block() {
                let stub = code + index * layout.stub_size();
                let out = core::slice::from_raw_parts_mut(stub as *mut u8, layout.stub_size());
                let targets = StubTargets {
                    stub,
                    data_cell: data + index * DATA_CELL_SIZE,
                    common_slot,
                };
                if !arch::emit_stub(out, targets) {
                    return Err(ThunkError::Unsupported(format!(
                        "stub at {:#x} cannot reach its data page",
                        stub
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Largest batch whose Split layout keeps every stub within `reach` bytes
/// of its data cell and common stub slot
///
/// A stub in block `i` is `blocks` pages before its data page and at most one
/// more page from the end of it, so `(blocks + 1) * page_size` must fit.
fn blocks_within_reach(blocks: usize, page_size: usize, reach: usize) -> usize {
    let max_blocks = (reach / page_size).saturating_sub(1).max(1);
    blocks.min(max_blocks)
}

impl MappingProvider for OsMappingProvider {
    type Tag = TargetTag;

    fn layout(&self) -> &ThunkLayout {
        &self.layout
    }

    fn request_mapping(&self, block_count: usize) -> Result<usize, ThunkError> {
        if let Some(reason) = &self.unsupported {
            return Err(ThunkError::Unsupported(reason.clone()));
        }
        if block_count != self.layout.blocks_per_mapping() {
            return Err(ThunkError::InvalidLayout(format!(
                "requested {} blocks, layout pairs {} per mapping",
                block_count,
                self.layout.blocks_per_mapping()
            )));
        }

        let size = self
            .layout
            .mapping_size()
            .ok_or_else(|| ThunkError::InvalidLayout("mapping exceeds address space".into()))?;
        // Split arrangement: the code pages form the first half
        let code_size = size / 2;

        unsafe {
            let base = sys::reserve_read_write(size)?;

            let sealed = self.emit_stubs(base).and_then(|()| {
                arch::flush_instruction_cache(base, code_size);
                sys::make_executable(base, code_size)
            });

            if let Err(err) = sealed {
                error!(error = %err, "failed to seal thunk mapping");
                sys::release(base, size);
                return Err(err);
            }

            let count = self.mappings.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                base = ?(base as *const ()),
                size_bytes = size,
                blocks = block_count,
                thunks_per_block = self.layout.thunks_per_block(),
                mappings = count,
                "mapped thunk blocks"
            );

            Ok(base)
        }
    }
}

#[cfg(unix)]
mod sys {
    use crate::error::ThunkError;
    use std::io;

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    fn os_error(context: &str) -> ThunkError {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOMEM) | Some(libc::EAGAIN) => ThunkError::OutOfMemory,
            _ => ThunkError::Unsupported(format!("{}: {}", context, err)),
        }
    }

    pub unsafe fn reserve_read_write(size: usize) -> Result<usize, ThunkError> {
        let ptr = libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap"));
        }
        Ok(ptr as usize)
    }

    pub unsafe fn make_executable(addr: usize, size: usize) -> Result<(), ThunkError> {
        if libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
            return Err(os_error("mprotect"));
        }
        Ok(())
    }

    pub unsafe fn release(addr: usize, size: usize) {
        libc::munmap(addr as *mut libc::c_void, size);
    }
}

#[cfg(windows)]
mod sys {
    use crate::error::ThunkError;
    use winapi::shared::winerror::{ERROR_COMMITMENT_LIMIT, ERROR_NOT_ENOUGH_MEMORY, ERROR_OUTOFMEMORY};
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
    use winapi::um::processthreadsapi::{FlushInstructionCache, GetCurrentProcess};
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE};

    pub fn page_size() -> usize {
        unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    fn os_error(context: &str) -> ThunkError {
        let code = unsafe { GetLastError() };
        match code {
            ERROR_NOT_ENOUGH_MEMORY | ERROR_OUTOFMEMORY | ERROR_COMMITMENT_LIMIT => {
                ThunkError::OutOfMemory
            }
            _ => ThunkError::Unsupported(format!("{}: error code {}", context, code)),
        }
    }

    pub unsafe fn reserve_read_write(size: usize) -> Result<usize, ThunkError> {
        let ptr = VirtualAlloc(core::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
        if ptr.is_null() {
            return Err(os_error("VirtualAlloc"));
        }
        Ok(ptr as usize)
    }

    pub unsafe fn make_executable(addr: usize, size: usize) -> Result<(), ThunkError> {
        let mut old = 0;
        if VirtualProtect(addr as *mut _, size, PAGE_EXECUTE_READ, &mut old) == 0 {
            return Err(os_error("VirtualProtect"));
        }
        FlushInstructionCache(GetCurrentProcess(), addr as *const _, size);
        Ok(())
    }

    pub unsafe fn release(addr: usize, _size: usize) {
        VirtualFree(addr as *mut _, 0, MEM_RELEASE);
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use crate::error::ThunkError;

    pub fn page_size() -> usize {
        4096
    }

    pub unsafe fn reserve_read_write(_size: usize) -> Result<usize, ThunkError> {
        Err(ThunkError::Unsupported("no virtual memory API on this target".into()))
    }

    pub unsafe fn make_executable(_addr: usize, _size: usize) -> Result<(), ThunkError> {
        Err(ThunkError::Unsupported("no virtual memory API on this target".into()))
    }

    pub unsafe fn release(_addr: usize, _size: usize) {}
}
