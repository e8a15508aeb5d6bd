//! SH4 IR emission.
//!
//! `translate` walks a code's compile-unit tree recursively. Each unit gets
//! a block preamble charging its cycles and instruction count, its
//! instructions' IR, and a terminator matching the analysed branch kind.
//! Child units are emitted into blocks labelled with their guest address,
//! demand-created so a block shared between the taken and fall-through path
//! is emitted once.
//!
//! Layout matters: a conditional terminator relies on the fall-through path
//! (the inline `next` unit or a static-dispatch thunk) being the textually
//! next block.

use super::{
    decode::{self, Instr, Op},
    reg_off, Sh4Context, Sh4Frontend,
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

pub(super) fn translate(
    fe: &Sh4Frontend,
    guest: &dyn Guest,
    metas: &BTreeMap<GuestAddr, BlockMeta>,
    code: &mut Code,
    ir: &mut Ir,
) {
    let fastmem = code.fastmem;
    let entry = ir.append_block();
    ir.set_current_block(entry);

    // Yield back to the run loop once this window's cycles are spent.
    let remaining = ir.load_context(offset_of!(Sh4Context, remaining_cycles), Ty::I32);
    let zero = ir.const_i32(0);
    let done = ir.cmp_sle(remaining, zero);
    let leave = ir.const_ptr(guest.dispatch().leave);
    ir.branch_true(done, leave);
    let b = ir.append_block();
    ir.set_current_block(b);

    // Service pending interrupts before running the block.
    let pending = ir.load_context(offset_of!(Sh4Context, pending_interrupts), Ty::I64);
    let interrupt = ir.const_ptr(guest.dispatch().interrupt);
    ir.branch_true(pending, interrupt);
    let b = ir.append_block();
    ir.set_current_block(b);

    let root = code.root.expect("translating a code with no units");
    translate_unit(fe, guest, metas, code, ir, fastmem, root);
}

fn translate_unit(
    fe: &Sh4Frontend,
    guest: &dyn Guest,
    metas: &BTreeMap<GuestAddr, BlockMeta>,
    code: &mut Code,
    ir: &mut Ir,
    fastmem: bool,
    unit: UnitId,
) {
    let meta = &metas[&code.unit(unit).meta_addr];

    // Charge the block's cycles and instruction count up front.
    let remaining = ir.load_context(offset_of!(Sh4Context, remaining_cycles), Ty::I32);
    let cycles = ir.const_i32(meta.num_cycles as i32);
    let remaining = ir.sub(remaining, cycles);
    ir.store_context(offset_of!(Sh4Context, remaining_cycles), remaining);

    let ran = ir.load_context(offset_of!(Sh4Context, ran_instrs), Ty::I64);
    let n = ir.const_i64(meta.num_instrs as i64);
    let ran = ir.add(ran, n);
    ir.store_context(offset_of!(Sh4Context, ran_instrs), ran);

    // The block body.
    let mut i = 0;
    while i < meta.size {
        let addr = meta.guest_addr + i;
        let instr = decode::decode(addr, guest.r16(addr))
            .expect("analysis validated this instruction");
        i += 2;

        let delay = if instr.is_delayed() {
            let daddr = meta.guest_addr + i;
            let d = decode::decode(daddr, guest.r16(daddr))
                .expect("analysis validated the delay slot");
            i += 2;
            Some(d)
        } else {
            None
        };

        emit_instr(fe, guest, code, unit, ir, fastmem, &instr, delay.as_ref());
    }

    // Emit the children. The fall-through path must come right after this
    // block in layout order; the taken path can land anywhere.
    let (next_unit, branch_unit) = {
        let u = code.unit(unit);
        (u.next, u.branch)
    };
    let conditional = matches!(
        meta.branch_kind,
        BranchKind::StaticTrue
            | BranchKind::StaticFalse
            | BranchKind::DynamicTrue
            | BranchKind::DynamicFalse
    );

    if let Some(nu) = next_unit {
        let nb = demand_block(ir, meta.next_addr);
        let saved = ir.insert_point();
        ir.set_current_block(nb);
        translate_unit(fe, guest, metas, code, ir, fastmem, nu);
        ir.set_insert_point(saved);
    } else if conditional {
        static_branch_thunk(ir, guest, meta.next_addr);
    }

    if let Some(bu) = branch_unit {
        let bb = demand_block(ir, meta.branch_addr);
        let saved = ir.insert_point();
        ir.set_current_block(bb);
        translate_unit(fe, guest, metas, code, ir, fastmem, bu);
        ir.set_insert_point(saved);
    }

    // The terminator.
    match meta.branch_kind {
        BranchKind::FallThrough => {
            let pc = ir.const_i32((meta.guest_addr + meta.size) as i32);
            ir.store_context(offset_of!(Sh4Context, pc), pc);
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
                ir.store_context(offset_of!(Sh4Context, pc), pc);
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
            ir.store_context(offset_of!(Sh4Context, pc), dest);
            let dynamic = ir.const_ptr(guest.dispatch().dynamic);
            ir.branch(dynamic);
        }
        BranchKind::DynamicTrue | BranchKind::DynamicFalse => {
            let u = code.unit(unit);
            assert!(u.branch.is_none(), "dynamic conditional cannot inline its target");
            let cond = u.branch_cond.expect("conditional branch without a condition");
            let dest = u.branch_dest.expect("dynamic branch without a destination");
            if meta.branch_kind == BranchKind::DynamicTrue {
                ir.branch_true(cond, dest);
            } else {
                ir.branch_false(cond, dest);
            }
        }
    }
}

/// Find or create the block for guest address `addr`.
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

/// Append a block that leaves via the static dispatch thunk with
/// `pc := addr`, and return a block-reference value for branching to it.
fn static_branch_thunk(ir: &mut Ir, guest: &dyn Guest, addr: GuestAddr) -> ValueIdx {
    let saved = ir.insert_point();
    let tb = ir.append_block();
    ir.set_current_block(tb);
    let pc = ir.const_i32(addr as i32);
    ir.store_context(offset_of!(Sh4Context, pc), pc);
    let thunk = ir.const_ptr(guest.dispatch().static_);
    ir.call_noreturn(thunk);
    ir.set_insert_point(saved);
    ir.const_blk(tb)
}

fn load_reg(ir: &mut Ir, n: u8) -> ValueIdx {
    ir.load_context(reg_off(n), Ty::I32)
}

fn store_reg(ir: &mut Ir, n: u8, v: ValueIdx) {
    ir.store_context(reg_off(n), v);
}

fn load_t(ir: &mut Ir) -> ValueIdx {
    ir.load_context(offset_of!(Sh4Context, sr_t), Ty::I32)
}

/// Store a comparison result (an i8) into the exploded T flag.
fn store_t(ir: &mut Ir, cmp: ValueIdx) {
    let t = ir.zext(cmp, Ty::I32);
    ir.store_context(offset_of!(Sh4Context, sr_t), t);
}

fn load_guest(ir: &mut Ir, fastmem: bool, addr: ValueIdx, ty: Ty) -> ValueIdx {
    if fastmem {
        ir.load_fast(addr, ty)
    } else {
        ir.load_slow(addr, ty)
    }
}

fn store_guest(ir: &mut Ir, fastmem: bool, addr: ValueIdx, v: ValueIdx) {
    if fastmem {
        ir.store_fast(addr, v);
    } else {
        ir.store_slow(addr, v);
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_instr(
    fe: &Sh4Frontend,
    guest: &dyn Guest,
    code: &mut Code,
    unit: UnitId,
    ir: &mut Ir,
    fastmem: bool,
    instr: &Instr,
    delay: Option<&Instr>,
) {
    let addr = instr.addr;
    let (n, m) = (instr.rn(), instr.rm());

    // Emit the delay slot; delayed branches read their operands first.
    macro_rules! emit_delay {
        () => {
            if let Some(d) = delay {
                emit_instr(fe, guest, code, unit, ir, fastmem, d, None);
            }
        };
    }

    match instr.op {
        Op::Nop => {}

        /* moves */
        Op::MovI => {
            let v = ir.const_i32(instr.imm8() as i8 as i32);
            store_reg(ir, n, v);
        }
        Op::MovR => {
            let v = load_reg(ir, m);
            store_reg(ir, n, v);
        }
        Op::MovwPc => {
            let ea = addr.wrapping_add(4).wrapping_add(instr.imm8() as u32 * 2);
            let ea = ir.const_i32(ea as i32);
            let v = load_guest(ir, fastmem, ea, Ty::I16);
            let v = ir.sext(v, Ty::I32);
            store_reg(ir, n, v);
        }
        Op::MovlPc => {
            let ea = (addr & !3).wrapping_add(4).wrapping_add(instr.imm8() as u32 * 4);
            let ea = ir.const_i32(ea as i32);
            let v = load_guest(ir, fastmem, ea, Ty::I32);
            store_reg(ir, n, v);
        }
        Op::Mova => {
            let ea = (addr & !3).wrapping_add(4).wrapping_add(instr.imm8() as u32 * 4);
            let v = ir.const_i32(ea as i32);
            store_reg(ir, 0, v);
        }
        Op::MovbS | Op::MovwS | Op::MovlS => {
            let ea = load_reg(ir, n);
            let v = load_reg(ir, m);
            let v = match instr.op {
                Op::MovbS => ir.truncate(v, Ty::I8),
                Op::MovwS => ir.truncate(v, Ty::I16),
                _ => v,
            };
            store_guest(ir, fastmem, ea, v);
        }
        Op::MovbL | Op::MovwL | Op::MovlL => {
            let ea = load_reg(ir, m);
            let ty = match instr.op {
                Op::MovbL => Ty::I8,
                Op::MovwL => Ty::I16,
                _ => Ty::I32,
            };
            let v = load_guest(ir, fastmem, ea, ty);
            let v = if ty == Ty::I32 { v } else { ir.sext(v, Ty::I32) };
            store_reg(ir, n, v);
        }

        /* integer ops */
        Op::Add => {
            let (a, b) = (load_reg(ir, n), load_reg(ir, m));
            let v = ir.add(a, b);
            store_reg(ir, n, v);
        }
        Op::AddI => {
            let a = load_reg(ir, n);
            let b = ir.const_i32(instr.imm8() as i8 as i32);
            let v = ir.add(a, b);
            store_reg(ir, n, v);
        }
        Op::Sub => {
            let (a, b) = (load_reg(ir, n), load_reg(ir, m));
            let v = ir.sub(a, b);
            store_reg(ir, n, v);
        }
        Op::Neg => {
            let a = load_reg(ir, m);
            let v = ir.neg(a);
            store_reg(ir, n, v);
        }
        Op::Not => {
            let a = load_reg(ir, m);
            let v = ir.not(a);
            store_reg(ir, n, v);
        }
        Op::And | Op::Or | Op::Xor => {
            let (a, b) = (load_reg(ir, n), load_reg(ir, m));
            let v = match instr.op {
                Op::And => ir.and(a, b),
                Op::Or => ir.or(a, b),
                _ => ir.xor(a, b),
            };
            store_reg(ir, n, v);
        }
        Op::AndI | Op::OrI | Op::XorI => {
            let a = load_reg(ir, 0);
            let b = ir.const_i32(instr.imm8() as i32);
            let v = match instr.op {
                Op::AndI => ir.and(a, b),
                Op::OrI => ir.or(a, b),
                _ => ir.xor(a, b),
            };
            store_reg(ir, 0, v);
        }
        Op::MulL => {
            let (a, b) = (load_reg(ir, n), load_reg(ir, m));
            let v = ir.smul(a, b);
            ir.store_context(offset_of!(Sh4Context, macl), v);
        }

        /* T flag ops */
        Op::Tst => {
            let (a, b) = (load_reg(ir, n), load_reg(ir, m));
            let v = ir.and(a, b);
            let zero = ir.const_i32(0);
            let t = ir.cmp_eq(v, zero);
            store_t(ir, t);
        }
        Op::TstI => {
            let a = load_reg(ir, 0);
            let b = ir.const_i32(instr.imm8() as i32);
            let v = ir.and(a, b);
            let zero = ir.const_i32(0);
            let t = ir.cmp_eq(v, zero);
            store_t(ir, t);
        }
        Op::CmpEq | Op::CmpHs | Op::CmpGe | Op::CmpHi | Op::CmpGt => {
            let (a, b) = (load_reg(ir, n), load_reg(ir, m));
            let t = match instr.op {
                Op::CmpEq => ir.cmp_eq(a, b),
                Op::CmpHs => ir.cmp_uge(a, b),
                Op::CmpGe => ir.cmp_sge(a, b),
                Op::CmpHi => ir.cmp_ugt(a, b),
                _ => ir.cmp_sgt(a, b),
            };
            store_t(ir, t);
        }
        Op::CmpEqI => {
            let a = load_reg(ir, 0);
            let b = ir.const_i32(instr.imm8() as i8 as i32);
            let t = ir.cmp_eq(a, b);
            store_t(ir, t);
        }
        Op::CmpPz | Op::CmpPl => {
            let a = load_reg(ir, n);
            let zero = ir.const_i32(0);
            let t = if instr.op == Op::CmpPz {
                ir.cmp_sge(a, zero)
            } else {
                ir.cmp_sgt(a, zero)
            };
            store_t(ir, t);
        }
        Op::Dt => {
            let a = load_reg(ir, n);
            let one = ir.const_i32(1);
            let v = ir.sub(a, one);
            store_reg(ir, n, v);
            let zero = ir.const_i32(0);
            let t = ir.cmp_eq(v, zero);
            store_t(ir, t);
        }
        Op::Movt => {
            let t = load_t(ir);
            store_reg(ir, n, t);
        }
        Op::Sett => {
            let one = ir.const_i32(1);
            ir.store_context(offset_of!(Sh4Context, sr_t), one);
        }
        Op::Clrt => {
            let zero = ir.const_i32(0);
            ir.store_context(offset_of!(Sh4Context, sr_t), zero);
        }

        /* shifts; the single-bit forms latch the shifted-out bit in T */
        Op::Shll | Op::Shal => {
            let a = load_reg(ir, n);
            let t = ir.lshri(a, 31);
            ir.store_context(offset_of!(Sh4Context, sr_t), t);
            let v = ir.shli(a, 1);
            store_reg(ir, n, v);
        }
        Op::Shlr | Op::Shar => {
            let a = load_reg(ir, n);
            let one = ir.const_i32(1);
            let t = ir.and(a, one);
            ir.store_context(offset_of!(Sh4Context, sr_t), t);
            let v = if instr.op == Op::Shlr {
                ir.lshri(a, 1)
            } else {
                ir.ashri(a, 1)
            };
            store_reg(ir, n, v);
        }
        Op::Shll2 | Op::Shll8 | Op::Shll16 | Op::Shlr2 | Op::Shlr8 | Op::Shlr16 => {
            let a = load_reg(ir, n);
            let v = match instr.op {
                Op::Shll2 => ir.shli(a, 2),
                Op::Shll8 => ir.shli(a, 8),
                Op::Shll16 => ir.shli(a, 16),
                Op::Shlr2 => ir.lshri(a, 2),
                Op::Shlr8 => ir.lshri(a, 8),
                _ => ir.lshri(a, 16),
            };
            store_reg(ir, n, v);
        }

        /* extensions */
        Op::ExtuB | Op::ExtuW => {
            let a = load_reg(ir, m);
            let mask = ir.const_i32(if instr.op == Op::ExtuB { 0xff } else { 0xffff });
            let v = ir.and(a, mask);
            store_reg(ir, n, v);
        }
        Op::ExtsB | Op::ExtsW => {
            let a = load_reg(ir, m);
            let narrow = ir.truncate(a, if instr.op == Op::ExtsB { Ty::I8 } else { Ty::I16 });
            let v = ir.sext(narrow, Ty::I32);
            store_reg(ir, n, v);
        }

        /* system registers */
        Op::StsMacl => {
            let v = ir.load_context(offset_of!(Sh4Context, macl), Ty::I32);
            store_reg(ir, n, v);
        }
        Op::StsPr => {
            let v = ir.load_context(offset_of!(Sh4Context, pr), Ty::I32);
            store_reg(ir, n, v);
        }
        Op::LdsPr => {
            let v = load_reg(ir, n);
            ir.store_context(offset_of!(Sh4Context, pr), v);
        }
        Op::LdcSr => {
            let v = load_reg(ir, n);
            ir.store_context(offset_of!(Sh4Context, sr), v);
            let one = ir.const_i32(1);
            let t = ir.and(v, one);
            ir.store_context(offset_of!(Sh4Context, sr_t), t);
        }

        /* branches: operands are read before the delay slot runs */
        Op::Bf | Op::BfS | Op::Bt | Op::BtS => {
            let cond = load_t(ir);
            emit_delay!();
            code.unit_mut(unit).branch_cond = Some(cond);
        }
        Op::Bra => {
            emit_delay!();
        }
        Op::Bsr => {
            let ret = ir.const_i32(addr.wrapping_add(4) as i32);
            ir.store_context(offset_of!(Sh4Context, pr), ret);
            emit_delay!();
        }
        Op::Braf | Op::Bsrf => {
            if instr.op == Op::Bsrf {
                let ret = ir.const_i32(addr.wrapping_add(4) as i32);
                ir.store_context(offset_of!(Sh4Context, pr), ret);
            }
            let base = load_reg(ir, n);
            let off = ir.const_i32(addr.wrapping_add(4) as i32);
            let dest = ir.add(base, off);
            emit_delay!();
            code.unit_mut(unit).branch_dest = Some(dest);
        }
        Op::Jmp | Op::Jsr => {
            if instr.op == Op::Jsr {
                let ret = ir.const_i32(addr.wrapping_add(4) as i32);
                ir.store_context(offset_of!(Sh4Context, pr), ret);
            }
            let dest = load_reg(ir, n);
            emit_delay!();
            code.unit_mut(unit).branch_dest = Some(dest);
        }
        Op::Rts => {
            let dest = ir.load_context(offset_of!(Sh4Context, pr), Ty::I32);
            emit_delay!();
            code.unit_mut(unit).branch_dest = Some(dest);
        }
        Op::Rte => {
            let dest = ir.load_context(offset_of!(Sh4Context, spc), Ty::I32);
            let ssr = ir.load_context(offset_of!(Sh4Context, ssr), Ty::I32);
            ir.store_context(offset_of!(Sh4Context, sr), ssr);
            let one = ir.const_i32(1);
            let t = ir.and(ssr, one);
            ir.store_context(offset_of!(Sh4Context, sr_t), t);
            emit_delay!();
            code.unit_mut(unit).branch_dest = Some(dest);
        }
        Op::Trapa => {
            ir.call_fallback(fe.fallback, addr, instr.raw as u32);
            let dest = ir.load_context(offset_of!(Sh4Context, pc), Ty::I32);
            code.unit_mut(unit).branch_dest = Some(dest);
        }
    }
}
