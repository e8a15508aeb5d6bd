//! The SH4 frontend: 16-bit opcodes, delay slots, and an exploded T bit.
//!
//! Analysis decodes straight from guest memory until it hits a branch or an
//! instruction that invalidates interrupt/FPU state (SR or FPSCR writes).
//! A delayed branch consumes its delay slot as part of the same block; the
//! slot must decode cleanly and must not itself be a delayed branch.

mod decode;
mod translate;

use self::decode::{flags, Instr, Op};
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

/// The SH4 guest context, as compiled code sees it. Field offsets are the
/// currency of the IR's context loads and stores, so the layout is fixed.
///
/// `sr_t` is the T flag held apart from SR so compare/branch sequences touch
/// one word; SR proper is re-imploded by the CPU shell when it matters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Sh4Context {
    pub r: [u32; 16],
    pub pc: u32,
    pub pr: u32,
    pub sr: u32,
    pub sr_t: u32,
    pub gbr: u32,
    pub vbr: u32,
    pub spc: u32,
    pub ssr: u32,
    pub mach: u32,
    pub macl: u32,
    pub fpscr: u32,
    pub remaining_cycles: i32,
    pub ran_instrs: u64,
    pub pending_interrupts: u64,
}

pub(crate) fn reg_off(n: u8) -> usize {
    offset_of!(Sh4Context, r) + 4 * n as usize
}

pub struct Sh4Frontend {
    /// Interpreter entry point for instructions translated as fallbacks
    /// (currently TRAPA).
    fallback: HostAddr,
}

impl Sh4Frontend {
    pub fn new(fallback: HostAddr) -> Self {
        Sh4Frontend { fallback }
    }

    fn read_instr(&self, guest: &dyn Guest, addr: GuestAddr) -> Option<Instr> {
        decode::decode(addr, guest.r16(addr))
    }
}

impl Frontend for Sh4Frontend {
    fn analyze_code(&self, guest: &dyn Guest, meta: &mut BlockMeta) -> bool {
        meta.num_cycles = 0;
        meta.num_instrs = 0;
        meta.size = 0;

        loop {
            let addr = meta.guest_addr + meta.size;
            // End analysis on an invalid instruction.
            let Some(instr) = self.read_instr(guest, addr) else {
                return false;
            };

            meta.num_cycles += instr.cycles;
            meta.num_instrs += 1;
            meta.size += 2;

            if instr.is_delayed() {
                let delay_addr = meta.guest_addr + meta.size;
                // The delay slot must decode, and a delayed branch cannot
                // itself occupy one.
                match self.read_instr(guest, delay_addr) {
                    Some(delay) if !delay.is_delayed() => {
                        meta.num_cycles += delay.cycles;
                        meta.num_instrs += 1;
                        meta.size += 2;
                    }
                    _ => return false,
                }
            }

            // Stop emitting once a branch is hit and save off its targets.
            if instr.is_branch() {
                let addr = instr.addr;
                match instr.op {
                    Op::Bf => {
                        meta.branch_kind = BranchKind::StaticFalse;
                        meta.branch_addr = branch_dest8(&instr);
                        meta.next_addr = addr + 2;
                    }
                    Op::BfS => {
                        meta.branch_kind = BranchKind::StaticFalse;
                        meta.branch_addr = branch_dest8(&instr);
                        meta.next_addr = addr + 4;
                    }
                    Op::Bt => {
                        meta.branch_kind = BranchKind::StaticTrue;
                        meta.branch_addr = branch_dest8(&instr);
                        meta.next_addr = addr + 2;
                    }
                    Op::BtS => {
                        meta.branch_kind = BranchKind::StaticTrue;
                        meta.branch_addr = branch_dest8(&instr);
                        meta.next_addr = addr + 4;
                    }
                    Op::Bra | Op::Bsr => {
                        meta.branch_kind = BranchKind::Static;
                        meta.branch_addr =
                            (instr.disp12() * 2 + addr as i32 + 4) as GuestAddr;
                    }
                    Op::Braf
                    | Op::Bsrf
                    | Op::Jmp
                    | Op::Jsr
                    | Op::Rts
                    | Op::Rte
                    | Op::Trapa => {
                        meta.branch_kind = BranchKind::Dynamic;
                    }
                    _ => panic!("unexpected branch op"),
                }
                break;
            }

            // SR writes can unmask interrupts and FPSCR writes invalidate
            // the translated FPU state, so either ends the block.
            if instr.flags & (flags::SET_SR | flags::SET_FPSCR) != 0 {
                meta.branch_kind = BranchKind::FallThrough;
                break;
            }
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
            let Some(instr) = self.read_instr(guest, addr + i) else {
                log_jit_event(&format!("0x{:08x}: .word 0x{:04x}", addr + i, guest.r16(addr + i)));
                i += 2;
                continue;
            };
            log_jit_event(&decode::format(&instr));
            i += 2;

            if instr.is_delayed() {
                if let Some(delay) = self.read_instr(guest, addr + i) {
                    log_jit_event(&decode::format(&delay));
                }
                i += 2;
            }
        }
    }
}

/// Destination of an 8-bit-displacement conditional branch.
fn branch_dest8(instr: &Instr) -> GuestAddr {
    ((instr.imm8() as i8 as i32) * 2 + instr.addr as i32 + 4) as GuestAddr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestGuest;
    use crate::INVALID_ADDR;

    fn analyze(mem: &[(GuestAddr, u16)], entry: GuestAddr) -> Option<BlockMeta> {
        let guest = TestGuest::new();
        for (addr, op) in mem {
            guest.write16(*addr, *op);
        }
        let frontend = Sh4Frontend::new(HostAddr(0));
        let mut meta = BlockMeta::new(entry);
        frontend.analyze_code(&guest, &mut meta).then_some(meta)
    }

    #[test]
    fn classifies_conditional_branch() {
        // bt +4 at 0x8c010000 branches to 0x8c010008.
        let meta = analyze(&[(0x8c010000, 0x8902)], 0x8c010000).unwrap();
        assert_eq!(meta.branch_kind, BranchKind::StaticTrue);
        assert_eq!(meta.branch_addr, 0x8c010008);
        assert_eq!(meta.next_addr, 0x8c010002);
        assert_eq!(meta.size, 2);
        assert_eq!(meta.num_instrs, 1);
    }

    #[test]
    fn delayed_branch_consumes_slot() {
        // bra +0 with a nop in the delay slot.
        let meta = analyze(
            &[(0x8c010000, 0xa000), (0x8c010002, 0x0009)],
            0x8c010000,
        )
        .unwrap();
        assert_eq!(meta.branch_kind, BranchKind::Static);
        assert_eq!(meta.branch_addr, 0x8c010004);
        assert_eq!(meta.next_addr, INVALID_ADDR);
        assert_eq!(meta.num_instrs, 2);
        assert_eq!(meta.size, 4);
    }

    #[test]
    fn delayed_branch_in_delay_slot_fails_analysis() {
        // bra +0 with another bra in the delay slot.
        assert!(analyze(
            &[(0x8c010000, 0xa000), (0x8c010002, 0xa000)],
            0x8c010000
        )
        .is_none());
    }

    #[test]
    fn invalid_opening_instruction_fails_analysis() {
        assert!(analyze(&[(0x8c010000, 0x0000)], 0x8c010000).is_none());
    }

    #[test]
    fn sr_write_ends_block_as_fall_through() {
        // mov r1, r2 ; ldc r0, sr
        let meta = analyze(
            &[(0x8c010000, 0x6213), (0x8c010002, 0x400e)],
            0x8c010000,
        )
        .unwrap();
        assert_eq!(meta.branch_kind, BranchKind::FallThrough);
        assert_eq!(meta.branch_addr, INVALID_ADDR);
        assert_eq!(meta.next_addr, INVALID_ADDR);
        assert_eq!(meta.num_instrs, 2);
        assert_eq!(meta.size, 4);
    }

    #[test]
    fn accumulates_cycles() {
        // dt r1 ; bf -2 (loop)
        let meta = analyze(
            &[(0x8c010000, 0x4110), (0x8c010002, 0x8bfd)],
            0x8c010000,
        )
        .unwrap();
        assert_eq!(meta.num_cycles, 3);
        assert_eq!(meta.branch_kind, BranchKind::StaticFalse);
        // disp -3: -3*2 + 0x8c010002 + 4 = 0x8c010000.
        assert_eq!(meta.branch_addr, 0x8c010000);
    }
}
