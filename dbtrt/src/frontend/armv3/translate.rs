//! ARMv3 IR emission.
//!
//! Instruction bodies are fallback calls into the interpreter; this module
//! contributes the cycle/instruction preamble, condition evaluation for
//! conditional branches, and the dispatch terminators. The block layout
//! rules match the SH4 translator: the fall-through path is always the
//! textually next block.

use super::{
    decode::{self, Kind, COND_AL},
    pc_off, reg_off, Armv3Context, Armv3Frontend,
};
use crate::{
    frontend::{BlockMeta, BranchKind},
    guest::Guest,
    ir::{BlockIdx, Ir, Ty, ValueIdx},
    jit::{Code, UnitId},
    GuestAddr,
};
use std::collections::BTreeMap;
use std::mem::offset_of;

/* CPSR flag bits */
const N_BIT: i32 = 1 << 31;
const Z_BIT: i32 = 1 << 30;
const C_BIT: i32 = 1 << 29;
const V_BIT: i32 = 1 << 28;

pub(super) fn translate(
    fe: &Armv3Frontend,
    guest: &dyn Guest,
    metas: &BTreeMap<GuestAddr, BlockMeta>,
    code: &mut Code,
    ir: &mut Ir,
) {
    let entry = ir.append_block();
    ir.set_current_block(entry);

    let remaining = ir.load_context(offset_of!(Armv3Context, remaining_cycles), Ty::I32);
    let zero = ir.const_i32(0);
    let done = ir.cmp_sle(remaining, zero);
    let leave = ir.const_ptr(guest.dispatch().leave);
    ir.branch_true(done, leave);
    let b = ir.append_block();
    ir.set_current_block(b);

    let pending = ir.load_context(offset_of!(Armv3Context, pending_interrupts), Ty::I64);
    let interrupt = ir.const_ptr(guest.dispatch().interrupt);
    ir.branch_true(pending, interrupt);
    let b = ir.append_block();
    ir.set_current_block(b);

    let root = code.root.expect("translating a code with no units");
    translate_unit(fe, guest, metas, code, ir, root);
}

fn translate_unit(
    fe: &Armv3Frontend,
    guest: &dyn Guest,
    metas: &BTreeMap<GuestAddr, BlockMeta>,
    code: &mut Code,
    ir: &mut Ir,
    unit: UnitId,
) {
    let meta = &metas[&code.unit(unit).meta_addr];

    let remaining = ir.load_context(offset_of!(Armv3Context, remaining_cycles), Ty::I32);
    let cycles = ir.const_i32(meta.num_cycles as i32);
    let remaining = ir.sub(remaining, cycles);
    ir.store_context(offset_of!(Armv3Context, remaining_cycles), remaining);

    let ran = ir.load_context(offset_of!(Armv3Context, ran_instrs), Ty::I64);
    let n = ir.const_i64(meta.num_instrs as i64);
    let ran = ir.add(ran, n);
    ir.store_context(offset_of!(Armv3Context, ran_instrs), ran);

    let mut i = 0;
    while i < meta.size {
        let addr = meta.guest_addr + i;
        let instr = decode::decode(addr, guest.r32(addr))
            .expect("analysis validated this instruction");
        i += 4;

        match instr.kind {
            Kind::Branch => {
                let cond = (instr.cond() != COND_AL).then(|| cond_value(ir, instr.cond()));
                if instr.link() {
                    let ret = ir.const_i32(addr.wrapping_add(4) as i32);
                    // A conditional bl only writes the link register on the
                    // taken path.
                    let ret = match cond {
                        Some(c) => {
                            let old = ir.load_context(reg_off(14), Ty::I32);
                            ir.select(c, ret, old)
                        }
                        None => ret,
                    };
                    ir.store_context(reg_off(14), ret);
                }
                if let Some(c) = cond {
                    code.unit_mut(unit).branch_cond = Some(c);
                }
            }
            _ => {
                // The interpreter performs the instruction, including any
                // pc write.
                ir.call_fallback(fe.fallback, addr, instr.raw);
            }
        }
    }

    if meta.branch_kind == BranchKind::Dynamic {
        let dest = ir.load_context(pc_off(), Ty::I32);
        code.unit_mut(unit).branch_dest = Some(dest);
    }

    let (next_unit, branch_unit) = {
        let u = code.unit(unit);
        (u.next, u.branch)
    };
    let conditional = matches!(
        meta.branch_kind,
        BranchKind::StaticTrue | BranchKind::StaticFalse
    );

    if let Some(nu) = next_unit {
        let nb = demand_block(ir, meta.next_addr);
        let saved = ir.insert_point();
        ir.set_current_block(nb);
        translate_unit(fe, guest, metas, code, ir, nu);
        ir.set_insert_point(saved);
    } else if conditional {
        static_branch_thunk(ir, guest, meta.next_addr);
    }

    if let Some(bu) = branch_unit {
        let bb = demand_block(ir, meta.branch_addr);
        let saved = ir.insert_point();
        ir.set_current_block(bb);
        translate_unit(fe, guest, metas, code, ir, bu);
        ir.set_insert_point(saved);
    }

    match meta.branch_kind {
        BranchKind::FallThrough => {
            let pc = ir.const_i32((meta.guest_addr + meta.size) as i32);
            ir.store_context(pc_off(), pc);
            let dynamic = ir.const_ptr(guest.dispatch().dynamic);
            ir.branch(dynamic);
        }
        BranchKind::Static => {
            if branch_unit.is_some() {
                let bb = demand_block(ir, meta.branch_addr);
                let target = ir.const_blk(bb);
                ir.branch(target);
            } else {
                let pc = ir.const_i32(meta.branch_addr as i32);
                ir.store_context(pc_off(), pc);
                let thunk = ir.const_ptr(guest.dispatch().static_);
                ir.call_noreturn(thunk);
            }
        }
        BranchKind::StaticTrue | BranchKind::StaticFalse => {
            let target = if branch_unit.is_some() {
                let bb = demand_block(ir, meta.branch_addr);
                ir.const_blk(bb)
            } else {
                static_branch_thunk(ir, guest, meta.branch_addr)
            };
            let cond = code
                .unit(unit)
                .branch_cond
                .expect("conditional branch without a condition");
            if meta.branch_kind == BranchKind::StaticTrue {
                ir.branch_true(cond, target);
            } else {
                ir.branch_false(cond, target);
            }
        }
        BranchKind::Dynamic => {
            let dest = code
                .unit(unit)
                .branch_dest
                .expect("dynamic branch without a destination");
            ir.store_context(pc_off(), dest);
            let dynamic = ir.const_ptr(guest.dispatch().dynamic);
            ir.branch(dynamic);
        }
        BranchKind::DynamicTrue | BranchKind::DynamicFalse => {
            unreachable!("the analyzer never produces dynamic conditionals")
        }
    }
}

fn demand_block(ir: &mut Ir, addr: GuestAddr) -> BlockIdx {
    let label = format!("0x{addr:08x}");
    match ir.find_block(&label) {
        Some(b) => b,
        None => {
            let b = ir.append_block();
            ir.set_block_label(b, label);
            b
        }
    }
}

fn static_branch_thunk(ir: &mut Ir, guest: &dyn Guest, addr: GuestAddr) -> ValueIdx {
    let saved = ir.insert_point();
    let tb = ir.append_block();
    ir.set_current_block(tb);
    let pc = ir.const_i32(addr as i32);
    ir.store_context(pc_off(), pc);
    let thunk = ir.const_ptr(guest.dispatch().static_);
    ir.call_noreturn(thunk);
    ir.set_insert_point(saved);
    ir.const_blk(tb)
}

/// A value that is non-zero iff the condition field holds for the current
/// CPSR.
fn cond_value(ir: &mut Ir, cond: u8) -> ValueIdx {
    let cpsr = ir.load_context(offset_of!(Armv3Context, cpsr), Ty::I32);
    let zero = ir.const_i32(0);

    let flag_set = |ir: &mut Ir, cpsr: ValueIdx, bit: i32| {
        let mask = ir.const_i32(bit);
        ir.and(cpsr, mask)
    };

    match cond {
        // eq / ne
        0x0 => flag_set(ir, cpsr, Z_BIT),
        0x1 => {
            let z = flag_set(ir, cpsr, Z_BIT);
            let v = ir.cmp_eq(z, zero);
            ir.zext(v, Ty::I32)
        }
        // cs / cc
        0x2 => flag_set(ir, cpsr, C_BIT),
        0x3 => {
            let c = flag_set(ir, cpsr, C_BIT);
            let v = ir.cmp_eq(c, zero);
            ir.zext(v, Ty::I32)
        }
        // mi / pl
        0x4 => flag_set(ir, cpsr, N_BIT),
        0x5 => {
            let n = flag_set(ir, cpsr, N_BIT);
            let v = ir.cmp_eq(n, zero);
            ir.zext(v, Ty::I32)
        }
        // vs / vc
        0x6 => flag_set(ir, cpsr, V_BIT),
        0x7 => {
            let v = flag_set(ir, cpsr, V_BIT);
            let r = ir.cmp_eq(v, zero);
            ir.zext(r, Ty::I32)
        }
        // hi: C && !Z
        0x8 => {
            let c = flag_set(ir, cpsr, C_BIT);
            let cset = ir.cmp_ne(c, zero);
            let z = flag_set(ir, cpsr, Z_BIT);
            let zclear = ir.cmp_eq(z, zero);
            let both = ir.and(cset, zclear);
            ir.zext(both, Ty::I32)
        }
        // ls: !C || Z
        0x9 => {
            let c = flag_set(ir, cpsr, C_BIT);
            let cclear = ir.cmp_eq(c, zero);
            let z = flag_set(ir, cpsr, Z_BIT);
            let zset = ir.cmp_ne(z, zero);
            let either = ir.or(cclear, zset);
            ir.zext(either, Ty::I32)
        }
        // ge / lt: N == V / N != V
        0xa | 0xb => {
            let n = flag_set(ir, cpsr, N_BIT);
            let nset = ir.cmp_ne(n, zero);
            let v = flag_set(ir, cpsr, V_BIT);
            let vset = ir.cmp_ne(v, zero);
            let r = if cond == 0xa {
                ir.cmp_eq(nset, vset)
            } else {
                ir.cmp_ne(nset, vset)
            };
            ir.zext(r, Ty::I32)
        }
        // gt / le: !Z && N == V / Z || N != V
        0xc | 0xd => {
            let n = flag_set(ir, cpsr, N_BIT);
            let nset = ir.cmp_ne(n, zero);
            let v = flag_set(ir, cpsr, V_BIT);
            let vset = ir.cmp_ne(v, zero);
            let z = flag_set(ir, cpsr, Z_BIT);
            if cond == 0xc {
                let same = ir.cmp_eq(nset, vset);
                let zclear = ir.cmp_eq(z, zero);
                let both = ir.and(same, zclear);
                ir.zext(both, Ty::I32)
            } else {
                let differ = ir.cmp_ne(nset, vset);
                let zset = ir.cmp_ne(z, zero);
                let either = ir.or(differ, zset);
                ir.zext(either, Ty::I32)
            }
        }
        _ => panic!("condition 0x{cond:x} does not guard a branch"),
    }
}
