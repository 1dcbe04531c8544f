//! AArch64 thunk stubs
//!
//! ```text
//! adr x17, data_cell
//! ldr x16, slot
//! br  x16
//! brk #0
//! ```

use super::StubTargets;

pub const STUB_SIZE: usize = 16;

const ADR: u32 = 0x1000_0000;
const LDR_LITERAL_X: u32 = 0x5800_0000;
const BR_X16: u32 = 0xD61F_0200;
const BRK_0: u32 = 0xD420_0000;

const X16: u32 = 16;
const X17: u32 = 17;

/// ±1 MiB reach of `adr` and `ldr (literal)`
const LITERAL_RANGE: i64 = 1 << 20;

pub const REACH: usize = LITERAL_RANGE as usize;

fn encode_adr(rd: u32, offset: i64) -> Option<u32> {
    if !(-LITERAL_RANGE..LITERAL_RANGE).contains(&offset) {
        return None;
    }
    let imm = offset as u32;
    Some(ADR | ((imm & 0x3) << 29) | (((imm >> 2) & 0x7_FFFF) << 5) | rd)
}

fn encode_ldr_literal(rt: u32, offset: i64) -> Option<u32> {
    if offset % 4 != 0 || !(-LITERAL_RANGE..LITERAL_RANGE).contains(&offset) {
        return None;
    }
    let imm19 = ((offset >> 2) as u32) & 0x7_FFFF;
    Some(LDR_LITERAL_X | (imm19 << 5) | rt)
}

pub fn emit_stub(out: &mut [u8], targets: StubTargets) -> bool {
    if out.len() < STUB_SIZE {
        return false;
    }

    let cell_offset = (targets.data_cell as i64).wrapping_sub(targets.stub as i64);
    let slot_offset = (targets.common_slot as i64).wrapping_sub(targets.stub as i64 + 4);

    let (Some(adr), Some(ldr)) = (
        encode_adr(X17, cell_offset),
        encode_ldr_literal(X16, slot_offset),
    ) else {
        return false;
    };

    for (chunk, word) in out[..STUB_SIZE].chunks_exact_mut(4).zip([adr, ldr, BR_X16, BRK_0]) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    true
}

/// Clean data cache lines to the point of unification, then invalidate the
/// matching instruction cache lines
///
/// # Safety
/// `start..start + len` must be mapped memory.
pub unsafe fn flush_instruction_cache(start: usize, len: usize) {
    use core::arch::asm;

    let ctr: u64;
    asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
    let dline = 4usize << ((ctr >> 16) & 0xF);
    let iline = 4usize << (ctr & 0xF);
    let end = start + len;

    let mut addr = start & !(dline - 1);
    while addr < end {
        asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags));
        addr += dline;
    }
    asm!("dsb ish", options(nostack, preserves_flags));

    let mut addr = start & !(iline - 1);
    while addr < end {
        asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
        addr += iline;
    }
    asm!("dsb ish", "isb", options(nostack, preserves_flags));
}
