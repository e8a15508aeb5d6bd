//! Constant propagation.
//!
//! Folds instructions whose arguments are all constants and splices the
//! computed constant through the IR with `replace_uses`. Walking in layout
//! order means a fold feeds the folds after it in the same sweep.

use crate::ir::{ConstVal, InstIdx, Ir, Opcode, Ty, ValueIdx};

pub fn run(ir: &mut Ir) {
    let blocks: Vec<_> = ir.blocks().collect();
    for b in blocks {
        for i in ir.block_insts(b) {
            fold(ir, i);
        }
    }
}

/// The zero-extended bits of an integer constant.
fn bits(ir: &Ir, v: ValueIdx) -> Option<u64> {
    match ir.value(v).const_val()? {
        ConstVal::I8(c) => Some(*c as u8 as u64),
        ConstVal::I16(c) => Some(*c as u16 as u64),
        ConstVal::I32(c) => Some(*c as u32 as u64),
        ConstVal::I64(c) => Some(*c as u64),
        _ => None,
    }
}

/// The sign-extended value of an integer constant.
fn sext(ir: &Ir, v: ValueIdx) -> Option<i64> {
    match ir.value(v).const_val()? {
        ConstVal::I8(c) => Some(*c as i64),
        ConstVal::I16(c) => Some(*c as i64),
        ConstVal::I32(c) => Some(*c as i64),
        ConstVal::I64(c) => Some(*c),
        _ => None,
    }
}

fn float(ir: &Ir, v: ValueIdx) -> Option<f64> {
    match ir.value(v).const_val()? {
        ConstVal::F32(c) => Some(*c as f64),
        ConstVal::F64(c) => Some(*c),
        _ => None,
    }
}

fn width(ty: Ty) -> u32 {
    ty.size() * 8
}

fn bool_const(ir: &mut Ir, b: bool) -> ValueIdx {
    ir.const_i8(b as i8)
}

fn fold(ir: &mut Ir, i: InstIdx) {
    let inst = ir.inst(i);
    let op = inst.op;
    let Some(result) = inst.result else { return };
    let args: Vec<ValueIdx> = inst.args().map(|(_, v)| v).collect();

    // `select` only needs a constant condition.
    if op == Opcode::Select {
        if let Some(c) = bits(ir, args[0]) {
            let chosen = if c != 0 { args[1] } else { args[2] };
            ir.replace_uses(result, chosen);
            ir.remove_inst(i);
        }
        return;
    }

    if args.iter().any(|v| !ir.value(*v).is_constant()) {
        return;
    }
    let rty = ir.value(result).ty;

    let folded = match op {
        Opcode::Sext => sext(ir, args[0]).map(|c| ir.const_int(c, rty)),
        Opcode::Zext | Opcode::Trunc => {
            bits(ir, args[0]).map(|c| ir.const_int(c as i64, rty))
        }
        Opcode::Neg => sext(ir, args[0]).map(|c| ir.const_int(c.wrapping_neg(), rty)),
        Opcode::Abs => sext(ir, args[0]).map(|c| ir.const_int(c.wrapping_abs(), rty)),
        Opcode::Not => bits(ir, args[0]).map(|c| ir.const_int(!c as i64, rty)),
        Opcode::Add
        | Opcode::Sub
        | Opcode::Smul
        | Opcode::Umul
        | Opcode::Div
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor => fold_int_binop(ir, op, rty, args[0], args[1]),
        Opcode::Shl | Opcode::Lshr | Opcode::Ashr | Opcode::Ashd | Opcode::Lshd => {
            fold_shift(ir, op, rty, args[0], args[1])
        }
        Opcode::CmpEq
        | Opcode::CmpNe
        | Opcode::CmpSge
        | Opcode::CmpSgt
        | Opcode::CmpUge
        | Opcode::CmpUgt
        | Opcode::CmpSle
        | Opcode::CmpSlt
        | Opcode::CmpUle
        | Opcode::CmpUlt => fold_icmp(ir, op, args[0], args[1]),
        Opcode::Ftoi => float(ir, args[0]).map(|c| ir.const_int(c as i64, rty)),
        Opcode::Itof => sext(ir, args[0]).map(|c| float_const(ir, rty, c as f64)),
        Opcode::Fext | Opcode::Ftrunc => {
            float(ir, args[0]).map(|c| float_const(ir, rty, c))
        }
        Opcode::Fneg => float(ir, args[0]).map(|c| float_const(ir, rty, -c)),
        Opcode::Fabs => float(ir, args[0]).map(|c| float_const(ir, rty, c.abs())),
        Opcode::Sqrt => fold_sqrt(ir, rty, args[0]),
        Opcode::Fadd | Opcode::Fsub | Opcode::Fmul | Opcode::Fdiv => {
            fold_float_binop(ir, op, rty, args[0], args[1])
        }
        Opcode::FcmpEq
        | Opcode::FcmpNe
        | Opcode::FcmpGe
        | Opcode::FcmpGt
        | Opcode::FcmpLe
        | Opcode::FcmpLt => fold_fcmp(ir, op, args[0], args[1]),
        _ => None,
    };

    if let Some(new) = folded {
        ir.replace_uses(result, new);
        ir.remove_inst(i);
    }
}

fn fold_int_binop(ir: &mut Ir, op: Opcode, rty: Ty, a: ValueIdx, b: ValueIdx) -> Option<ValueIdx> {
    let (x, y) = (bits(ir, a)?, bits(ir, b)?);
    let r = match op {
        Opcode::Add => x.wrapping_add(y),
        Opcode::Sub => x.wrapping_sub(y),
        // Wrapping multiplication has the same low bits either way.
        Opcode::Smul | Opcode::Umul => x.wrapping_mul(y),
        Opcode::Div => {
            let (sx, sy) = (sext(ir, a)?, sext(ir, b)?);
            if sy == 0 || (sx == i64::MIN && sy == -1) {
                return None;
            }
            (sx / sy) as u64
        }
        Opcode::And => x & y,
        Opcode::Or => x | y,
        Opcode::Xor => x ^ y,
        _ => unreachable!(),
    };
    Some(ir.const_int(r as i64, rty))
}

fn fold_shift(ir: &mut Ir, op: Opcode, rty: Ty, a: ValueIdx, n: ValueIdx) -> Option<ValueIdx> {
    let w = width(rty);
    let amt = (bits(ir, n)? as u32) % w;
    let x = bits(ir, a)?;
    let sx = sext(ir, a)?;
    let r = match op {
        Opcode::Shl => x << amt,
        Opcode::Lshr => x >> amt,
        Opcode::Ashr => (sx >> amt) as u64,
        // Dynamic-direction shifts: positive is left, negative is right.
        Opcode::Ashd | Opcode::Lshd => {
            let sn = sext(ir, n)?;
            if sn >= 0 {
                x << ((sn as u32) % w)
            } else if op == Opcode::Lshd {
                x >> ((-sn as u32) % w)
            } else {
                (sx >> ((-sn as u32) % w)) as u64
            }
        }
        _ => unreachable!(),
    };
    Some(ir.const_int(r as i64, rty))
}

fn fold_icmp(ir: &mut Ir, op: Opcode, a: ValueIdx, b: ValueIdx) -> Option<ValueIdx> {
    let (x, y) = (bits(ir, a)?, bits(ir, b)?);
    let (sx, sy) = (sext(ir, a)?, sext(ir, b)?);
    let r = match op {
        Opcode::CmpEq => x == y,
        Opcode::CmpNe => x != y,
        Opcode::CmpSge => sx >= sy,
        Opcode::CmpSgt => sx > sy,
        Opcode::CmpUge => x >= y,
        Opcode::CmpUgt => x > y,
        Opcode::CmpSle => sx <= sy,
        Opcode::CmpSlt => sx < sy,
        Opcode::CmpUle => x <= y,
        Opcode::CmpUlt => x < y,
        _ => unreachable!(),
    };
    Some(bool_const(ir, r))
}

fn float_const(ir: &mut Ir, ty: Ty, c: f64) -> ValueIdx {
    match ty {
        Ty::F32 => ir.const_f32(c as f32),
        Ty::F64 => ir.const_f64(c),
        _ => panic!("not a float type: {ty}"),
    }
}

fn fold_sqrt(ir: &mut Ir, rty: Ty, a: ValueIdx) -> Option<ValueIdx> {
    // Evaluate in the value's own precision.
    match ir.value(a).const_val()? {
        ConstVal::F32(c) => {
            let c = c.sqrt();
            Some(ir.const_f32(c))
        }
        ConstVal::F64(c) => {
            let c = c.sqrt();
            Some(ir.const_f64(c))
        }
        _ => None,
    }
    .filter(|_| rty.is_float())
}

fn fold_float_binop(
    ir: &mut Ir,
    op: Opcode,
    rty: Ty,
    a: ValueIdx,
    b: ValueIdx,
) -> Option<ValueIdx> {
    // Single precision folds must round like single precision execution.
    if rty == Ty::F32 {
        let (ConstVal::F32(x), ConstVal::F32(y)) =
            (ir.value(a).const_val()?.clone(), ir.value(b).const_val()?.clone())
        else {
            return None;
        };
        let r = match op {
            Opcode::Fadd => x + y,
            Opcode::Fsub => x - y,
            Opcode::Fmul => x * y,
            Opcode::Fdiv => x / y,
            _ => unreachable!(),
        };
        Some(ir.const_f32(r))
    } else {
        let (x, y) = (float(ir, a)?, float(ir, b)?);
        let r = match op {
            Opcode::Fadd => x + y,
            Opcode::Fsub => x - y,
            Opcode::Fmul => x * y,
            Opcode::Fdiv => x / y,
            _ => unreachable!(),
        };
        Some(ir.const_f64(r))
    }
}

fn fold_fcmp(ir: &mut Ir, op: Opcode, a: ValueIdx, b: ValueIdx) -> Option<ValueIdx> {
    let (x, y) = (float(ir, a)?, float(ir, b)?);
    let r = match op {
        Opcode::FcmpEq => x == y,
        Opcode::FcmpNe => x != y,
        Opcode::FcmpGe => x >= y,
        Opcode::FcmpGt => x > y,
        Opcode::FcmpLe => x <= y,
        Opcode::FcmpLt => x < y,
        _ => unreachable!(),
    };
    Some(bool_const(ir, r))
}

#[cfg(test)]
mod tests {
    fn assert_cprop(input: &str, expect: &str) {
        crate::opt::tests::assert_opt_eq(input, super::run, expect);
    }

    #[test]
    fn folds_arithmetic_chains() {
        assert_cprop(
            "
            entry:
              i32 %0 = add 0x2:i32, 0x3:i32
              i32 %1 = smul %0, 0x4:i32
              store_context 0x8:i32, %1
            ",
            "
            entry:
              store_context 0x8:i32, 0x14:i32
            ",
        );
    }

    #[test]
    fn folds_wrapping_at_width() {
        assert_cprop(
            "
            entry:
              i8 %0 = add 0xff:i8, 0x1:i8
              store_context 0x8:i32, %0
            ",
            "
            entry:
              store_context 0x8:i32, 0x0:i8
            ",
        );
    }

    #[test]
    fn folds_comparisons_signed_and_unsigned() {
        assert_cprop(
            "
            entry:
              i8 %0 = cmp_slt 0xff:i8, 0x1:i8
              i8 %1 = cmp_ult 0xff:i8, 0x1:i8
              store_context 0x8:i32, %0
              store_context 0xc:i32, %1
            ",
            "
            entry:
              store_context 0x8:i32, 0x1:i8
              store_context 0xc:i32, 0x0:i8
            ",
        );
    }

    #[test]
    fn folds_select_on_constant_condition() {
        assert_cprop(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = select 0x1:i8, %0, 0x7:i32
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
    fn does_not_fold_division_by_zero() {
        assert_cprop(
            "
            entry:
              i32 %0 = div 0x8:i32, 0x0:i32
              store_context 0x8:i32, %0
            ",
            "
            entry:
              i32 %{{0}} = div 0x8:i32, 0x0:i32
              store_context 0x8:i32, %{{0}}
            ",
        );
    }

    #[test]
    fn folds_zext_and_trunc() {
        assert_cprop(
            "
            entry:
              i32 %0 = zext 0x80:i8
              i64 %1 = sext 0x80:i8
              i8 %2 = trunc 0x1234:i32
              store_context 0x0:i32, %0
              store_context 0x8:i32, %1
              store_context 0x10:i32, %2
            ",
            "
            entry:
              store_context 0x0:i32, 0x80:i32
              store_context 0x8:i32, 0xffffffffffffff80:i64
              store_context 0x10:i32, 0x34:i8
            ",
        );
    }
}
