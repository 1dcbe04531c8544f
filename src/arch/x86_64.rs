//! x86-64 thunk stubs
//!
//! ```text
//! lea r10, [rip + data_cell]      4C 8D 15 rel32
//! jmp qword ptr [rip + slot]      FF 25 rel32
//! int3 x3                         CC CC CC
//! ```

use super::StubTargets;

pub const STUB_SIZE: usize = 16;

/// rel32 displacements
pub const REACH: usize = i32::MAX as usize;

const LEA_R10_RIP: [u8; 3] = [0x4C, 0x8D, 0x15];
const JMP_RIP_INDIRECT: [u8; 2] = [0xFF, 0x25];
const INT3: u8 = 0xCC;

/// Signed displacement from the end of an instruction, if it fits in 32 bits
fn rel32(target: usize, next_instruction: usize) -> Option<[u8; 4]> {
    let delta = (target as i64).wrapping_sub(next_instruction as i64);
    i32::try_from(delta).ok().map(i32::to_le_bytes)
}

pub fn emit_stub(out: &mut [u8], targets: StubTargets) -> bool {
    if out.len() < STUB_SIZE {
        return false;
    }

    let Some(cell) = rel32(targets.data_cell, targets.stub + 7) else {
        return false;
    };
    let Some(slot) = rel32(targets.common_slot, targets.stub + 13) else {
        return false;
    };

    out[0..3].copy_from_slice(&LEA_R10_RIP);
    out[3..7].copy_from_slice(&cell);
    out[7..9].copy_from_slice(&JMP_RIP_INDIRECT);
    out[9..13].copy_from_slice(&slot);
    out[13..STUB_SIZE].fill(INT3);
    true
}
