//! The ARMv3 frontend: the 32-bit load/store guest.
//!
//! This CPU is far colder than the main one, so translation leans on the
//! interpreter: every instruction body is emitted as a fallback call, and
//! the JIT's value is in block linking, the cycle accounting preamble and
//! the dispatch terminators. Analysis still classifies branches properly so
//! static control flow gets inlined and patched like any other guest.

mod decode;
mod translate;

use self::decode::{Kind, COND_AL};
use super::{BlockMeta, BranchKind, Frontend};
use crate::{
    guest::Guest,
    ir::Ir,
    jit::Code,
    log::log_jit_event,
    GuestAddr, HostAddr,
};
use std::collections::BTreeMap;
use std::mem::offset_of;

/// Cycles charged per instruction; a flat estimate for this guest.
const CYCLES_PER_INSTR: u32 = 12;

/// The ARMv3 guest context. r15 is the pc.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Armv3Context {
    pub r: [u32; 16],
    pub cpsr: u32,
    pub spsr: u32,
    pub remaining_cycles: i32,
    pub ran_instrs: u64,
    pub pending_interrupts: u64,
}

pub(crate) fn reg_off(n: u8) -> usize {
    offset_of!(Armv3Context, r) + 4 * n as usize
}

pub(crate) fn pc_off() -> usize {
    reg_off(15)
}

pub struct Armv3Frontend {
    /// Interpreter entry point used for instruction bodies.
    fallback: HostAddr,
}

impl Armv3Frontend {
    pub fn new(fallback: HostAddr) -> Self {
        Armv3Frontend { fallback }
    }
}

impl Frontend for Armv3Frontend {
    fn analyze_code(&self, guest: &dyn Guest, meta: &mut BlockMeta) -> bool {
        meta.num_cycles = 0;
        meta.num_instrs = 0;
        meta.size = 0;

        loop {
            let addr = meta.guest_addr + meta.size;
            let Some(instr) = decode::decode(addr, guest.r32(addr)) else {
                return false;
            };

            meta.num_cycles += CYCLES_PER_INSTR;
            meta.num_instrs += 1;
            meta.size += 4;

            if !instr.ends_block() {
                continue;
            }

            match instr.kind {
                Kind::Branch if instr.cond() == COND_AL => {
                    meta.branch_kind = BranchKind::Static;
                    meta.branch_addr = instr.branch_target();
                }
                Kind::Branch => {
                    meta.branch_kind = BranchKind::StaticTrue;
                    meta.branch_addr = instr.branch_target();
                    meta.next_addr = addr + 4;
                }
                // Everything else reaches the interpreter, which leaves the
                // new pc in the context.
                _ => meta.branch_kind = BranchKind::Dynamic,
            }
            break;
        }

        true
    }

    fn translate_code(
        &self,
        guest: &dyn Guest,
        metas: &BTreeMap<GuestAddr, BlockMeta>,
        code: &mut Code,
        ir: &mut Ir,
    ) {
        translate::translate(self, guest, metas, code, ir);
    }

    fn dump_code(&self, guest: &dyn Guest, addr: GuestAddr, size: u32) {
        let mut i = 0;
        while i < size {
            match decode::decode(addr + i, guest.r32(addr + i)) {
                Some(instr) => log_jit_event(&decode::format(&instr)),
                None => log_jit_event(&format!(
                    "0x{:08x}: .word 0x{:08x}",
                    addr + i,
                    guest.r32(addr + i)
                )),
            }
            i += 4;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestGuest;
    use crate::INVALID_ADDR;

    fn analyze(mem: &[(GuestAddr, u32)], entry: GuestAddr) -> Option<BlockMeta> {
        let guest = TestGuest::new();
        for (addr, op) in mem {
            guest.write32(*addr, *op);
        }
        let frontend = Armv3Frontend::new(HostAddr(0));
        let mut meta = BlockMeta::new(entry);
        frontend.analyze_code(&guest, &mut meta).then_some(meta)
    }

    #[test]
    fn unconditional_branch_is_static() {
        // mov r0, #0 ; b +8
        let meta = analyze(&[(0x1000, 0xe3a0_0000), (0x1004, 0xea00_0000)], 0x1000).unwrap();
        assert_eq!(meta.branch_kind, BranchKind::Static);
        assert_eq!(meta.branch_addr, 0x100c);
        assert_eq!(meta.next_addr, INVALID_ADDR);
        assert_eq!(meta.num_instrs, 2);
        assert_eq!(meta.size, 8);
        assert_eq!(meta.num_cycles, 2 * CYCLES_PER_INSTR);
    }

    #[test]
    fn conditional_branch_has_fall_through() {
        // beq +0
        let meta = analyze(&[(0x1000, 0x0aff_fffe)], 0x1000).unwrap();
        assert_eq!(meta.branch_kind, BranchKind::StaticTrue);
        assert_eq!(meta.branch_addr, 0x1000);
        assert_eq!(meta.next_addr, 0x1004);
    }

    #[test]
    fn pc_write_is_dynamic() {
        // mov pc, lr
        let meta = analyze(&[(0x1000, 0xe1a0_f00e)], 0x1000).unwrap();
        assert_eq!(meta.branch_kind, BranchKind::Dynamic);
        assert_eq!(meta.branch_addr, INVALID_ADDR);
    }

    #[test]
    fn invalid_instruction_fails_analysis() {
        assert!(analyze(&[(0x1000, 0xee00_0000)], 0x1000).is_none());
    }
}
