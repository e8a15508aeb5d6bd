//! Expression simplification.
//!
//! Algebraic identities and strength reductions that don't need full
//! constant operands: neutral elements, absorbing elements, double
//! inversions, and multiplications by powers of two. Anything both-constant
//! is left to constant propagation.

use crate::ir::{InstIdx, Ir, Opcode, ValueIdx};

pub fn run(ir: &mut Ir) {
    let blocks: Vec<_> = ir.blocks().collect();
    for b in blocks {
        for i in ir.block_insts(b) {
            simplify(ir, i);
        }
    }
}

/// The zero-extended bits of `v` if it is an integer constant.
fn const_bits(ir: &Ir, v: ValueIdx) -> Option<u64> {
    if ir.value(v).is_constant() && ir.value(v).ty.is_int() {
        Some(ir.zext_constant(v))
    } else {
        None
    }
}

fn all_ones(ir: &Ir, v: ValueIdx) -> u64 {
    let bits = u64::from(ir.value(v).ty.size()) * 8;
    u64::MAX >> (64 - bits)
}

fn simplify(ir: &mut Ir, i: InstIdx) {
    let inst = ir.inst(i);
    let op = inst.op;
    let Some(result) = inst.result else { return };
    let a = inst.arg(0);
    let b = inst.arg(1);

    // Identities that replace the whole instruction with an existing value.
    let replacement = match op {
        Opcode::Add => neutral(ir, a, b, 0, true),
        Opcode::Sub | Opcode::Shl | Opcode::Ashr | Opcode::Lshr => {
            // Right operand only: x - 0, x >> 0, x << 0.
            b.and_then(|bv| (const_bits(ir, bv) == Some(0)).then_some(a.unwrap()))
        }
        Opcode::Or | Opcode::Xor => {
            if op == Opcode::Xor && a == b {
                // x ^ x == 0
                let av = a.unwrap();
                let z = ir.const_int(0, ir.value(av).ty);
                Some(z)
            } else if op == Opcode::Or && a == b {
                a
            } else {
                neutral(ir, a, b, 0, true)
            }
        }
        Opcode::And => {
            let (av, bv) = (a.unwrap(), b.unwrap());
            if av == bv {
                Some(av)
            } else if const_bits(ir, bv) == Some(0) || const_bits(ir, av) == Some(0) {
                let z = ir.const_int(0, ir.value(av).ty);
                Some(z)
            } else if const_bits(ir, bv) == Some(all_ones(ir, bv)) {
                Some(av)
            } else if const_bits(ir, av) == Some(all_ones(ir, av)) {
                Some(bv)
            } else {
                None
            }
        }
        Opcode::Smul | Opcode::Umul => {
            let (av, bv) = (a.unwrap(), b.unwrap());
            if const_bits(ir, bv) == Some(0) || const_bits(ir, av) == Some(0) {
                let z = ir.const_int(0, ir.value(av).ty);
                Some(z)
            } else if const_bits(ir, bv) == Some(1) {
                Some(av)
            } else if const_bits(ir, av) == Some(1) {
                Some(bv)
            } else {
                None
            }
        }
        Opcode::Not | Opcode::Neg => {
            // not(not x) == x, neg(neg x) == x
            let av = a.unwrap();
            ir.value(av)
                .def()
                .filter(|d| ir.inst(*d).op == op)
                .map(|d| ir.inst(d).arg(0).unwrap())
        }
        Opcode::Sext | Opcode::Zext | Opcode::Trunc => {
            // A conversion to the value's own type is a no-op.
            let av = a.unwrap();
            (ir.value(av).ty == ir.value(result).ty).then_some(av)
        }
        _ => None,
    };

    if let Some(new) = replacement {
        ir.replace_uses(result, new);
        ir.remove_inst(i);
        return;
    }

    // Strength reduction: multiplication by a power of two becomes a shift.
    // The instruction is rewritten in place, keeping its result value.
    if matches!(op, Opcode::Smul | Opcode::Umul) {
        let (av, bv) = (a.unwrap(), b.unwrap());
        let (x, c) = if let Some(c) = const_bits(ir, bv) {
            (av, c)
        } else if let Some(c) = const_bits(ir, av) {
            (bv, c)
        } else {
            return;
        };
        if c.is_power_of_two() {
            let shift = ir.const_i32(c.trailing_zeros() as i32);
            ir.inst_mut(i).op = Opcode::Shl;
            ir.set_arg(i, 0, x);
            ir.set_arg(i, 1, shift);
        }
    }
}

/// `x op 0 == x` (both operands if `commutes`).
fn neutral(
    ir: &Ir,
    a: Option<ValueIdx>,
    b: Option<ValueIdx>,
    id: u64,
    commutes: bool,
) -> Option<ValueIdx> {
    let (av, bv) = (a?, b?);
    if const_bits(ir, bv) == Some(id) {
        return Some(av);
    }
    if commutes && const_bits(ir, av) == Some(id) {
        return Some(bv);
    }
    None
}

#[cfg(test)]
mod tests {
    fn assert_esimp(input: &str, expect: &str) {
        crate::opt::tests::assert_opt_eq(input, super::run, expect);
    }

    #[test]
    fn neutral_elements() {
        assert_esimp(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = add %0, 0x0:i32
              i32 %2 = sub %1, 0x0:i32
              i32 %3 = or %2, 0x0:i32
              store_context 0x8:i32, %3
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x0:i32
              store_context 0x8:i32, %{{0}}
            ",
        );
    }

    #[test]
    fn absorbing_elements() {
        assert_esimp(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = and %0, 0x0:i32
              i32 %2 = smul %0, 0x0:i32
              store_context 0x8:i32, %1
              store_context 0xc:i32, %2
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x0:i32
              store_context 0x8:i32, 0x0:i32
              store_context 0xc:i32, 0x0:i32
            ",
        );
    }

    #[test]
    fn and_with_all_ones() {
        assert_esimp(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = and %0, 0xffffffff:i32
              store_context 0x8:i32, %1
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x0:i32
              store_context 0x8:i32, %{{0}}
            ",
        );
    }

    #[test]
    fn xor_self_is_zero() {
        assert_esimp(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = xor %0, %0
              store_context 0x8:i32, %1
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x0:i32
              store_context 0x8:i32, 0x0:i32
            ",
        );
    }

    #[test]
    fn double_inversion() {
        assert_esimp(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = not %0
              i32 %2 = not %1
              store_context 0x8:i32, %2
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x0:i32
              i32 %{{1}} = not %{{0}}
              store_context 0x8:i32, %{{0}}
            ",
        );
    }

    #[test]
    fn multiply_by_power_of_two_becomes_shift() {
        assert_esimp(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = umul %0, 0x8:i32
              store_context 0x8:i32, %1
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x0:i32
              i32 %{{1}} = shl %{{0}}, 0x3:i32
              store_context 0x8:i32, %{{1}}
            ",
        );
    }
}
