//! Dead code elimination.
//!
//! A reverse sweep removing instructions whose result has no remaining uses
//! and which have no observable side effect. Removing one instruction
//! detaches its argument uses, which is what lets whole dead chains fall out
//! in a single pass.

use crate::ir::{Ir, Opcode};

pub fn run(ir: &mut Ir) {
    let blocks: Vec<_> = ir.blocks().collect();
    for b in blocks.into_iter().rev() {
        for i in ir.block_insts(b).into_iter().rev() {
            let inst = ir.inst(i);
            if inst.op.has_side_effects() {
                continue;
            }
            let dead = match inst.result {
                Some(r) => ir.value(r).uses().is_empty(),
                None => true,
            };
            if dead {
                ir.remove_inst(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    fn assert_dce(input: &str, expect: &str) {
        crate::opt::tests::assert_opt_eq(input, super::run, expect);
    }

    #[test]
    fn removes_unused_chains() {
        assert_dce(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = add %0, 0x1:i32
              i32 %2 = smul %1, %1
              store_context 0x8:i32, %0
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x0:i32
              store_context 0x8:i32, %{{0}}
            ",
        );
    }

    #[test]
    fn keeps_side_effects() {
        assert_dce(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = load_slow %0
              store_context 0x8:i32, %0
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x0:i32
              i32 %{{1}} = load_slow %{{0}}
              store_context 0x8:i32, %{{0}}
            ",
        );
    }

    #[test]
    fn keeps_used_values_across_blocks() {
        assert_dce(
            "
            a:
              i32 %0 = load_context 0x0:i32
              branch :b
            b:
              store_context 0x8:i32, %0
            ",
            "
            a:
              i32 %{{0}} = load_context 0x0:i32
              branch :b
            b:
              store_context 0x8:i32, %{{0}}
            ",
        );
    }
}
