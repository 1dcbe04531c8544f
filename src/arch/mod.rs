//! Architecture support - entry address tagging and stub emission
//!
//! The heap never branches on the target architecture. Address tagging is a
//! strategy type (`AddressTag`) selected per build target, and stub bytes are
//! only emitted by the OS mapping provider.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "aarch64")]
mod aarch64;

/// Marks or unmarks code addresses handed to callers
pub trait AddressTag: Send + Sync + 'static {
    /// Add the tag to an untagged stub address
    fn tag(address: usize) -> usize;

    /// Remove the tag, or `None` if the address does not carry it
    fn strip(address: usize) -> Option<usize>;
}

/// Entry addresses are plain code addresses
#[derive(Debug, Clone, Copy, Default)]
pub struct Untagged;

impl AddressTag for Untagged {
    #[inline(always)]
    fn tag(address: usize) -> usize {
        address
    }

    #[inline(always)]
    fn strip(address: usize) -> Option<usize> {
        Some(address)
    }
}

/// Entry addresses carry the Thumb instruction-set bit (bit 0)
#[derive(Debug, Clone, Copy, Default)]
pub struct ThumbBit;

impl AddressTag for ThumbBit {
    #[inline(always)]
    fn tag(address: usize) -> usize {
        debug_assert!(address & 1 == 0, "stub address already tagged");
        address | 1
    }

    #[inline(always)]
    fn strip(address: usize) -> Option<usize> {
        if address & 1 == 1 {
            Some(address & !1)
        } else {
            None
        }
    }
}

/// Tagging strategy for the build target
#[cfg(target_arch = "arm")]
pub type TargetTag = ThumbBit;

/// Tagging strategy for the build target
#[cfg(not(target_arch = "arm"))]
pub type TargetTag = Untagged;

/// Addresses a stub needs to encode its jump
#[derive(Debug, Clone, Copy)]
pub(crate) struct StubTargets {
    /// Where the stub itself lives
    pub stub: usize,
    /// Its data cell, handed to the common stub in a scratch register
    pub data_cell: usize,
    /// The common stub slot at the end of the data page
    pub common_slot: usize,
}

/// Stub size of the host architecture, if thunks can be emitted for it
pub(crate) fn host_stub_size() -> Option<usize> {
    #[cfg(target_arch = "x86_64")]
    {
        Some(x86_64::STUB_SIZE)
    }
    #[cfg(target_arch = "aarch64")]
    {
        Some(aarch64::STUB_SIZE)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        None
    }
}

/// Largest distance a host stub can span to its data cell and common slot
pub(crate) fn host_stub_reach() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::REACH
    }
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::REACH
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        usize::MAX
    }
}

/// Host architecture name for diagnostics
pub(crate) fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Write one stub into `out` (exactly `host_stub_size()` bytes)
///
/// Returns `false` when the displacements do not fit the encoding.
#[allow(unused_variables)]
pub(crate) fn emit_stub(out: &mut [u8], targets: StubTargets) -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::emit_stub(out, targets)
    }
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::emit_stub(out, targets)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

/// Make freshly written code visible to instruction fetch
///
/// # Safety
/// `start..start + len` must be mapped memory.
#[allow(unused_variables)]
pub(crate) unsafe fn flush_instruction_cache(start: usize, len: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::flush_instruction_cache(start, len);
    }
    // x86 keeps instruction fetch coherent with stores
}
