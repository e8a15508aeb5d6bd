//! Control-flow analysis.
//!
//! Adds CFG edges between blocks so later passes can traverse the graph:
//! an unconditional branch to a block value contributes one edge, a
//! conditional branch contributes an edge to its target block plus a
//! fall-through edge to the next block in layout order. Branches to
//! dispatch thunks (pointer constants) contribute nothing: control leaves
//! the compiled code there.

use crate::ir::{ConstVal, Ir, Opcode};

pub fn run(ir: &mut Ir) {
    let blocks: Vec<_> = ir.blocks().collect();
    for b in blocks {
        let next = ir.next_block(b);
        for i in ir.block_insts(b) {
            let inst = ir.inst(i);
            match inst.op {
                Opcode::Branch => {
                    if let Some(ConstVal::Blk(dst)) =
                        inst.arg(0).and_then(|v| ir.value(v).const_val().cloned())
                    {
                        ir.add_block_edge(b, dst);
                    }
                }
                Opcode::BranchTrue | Opcode::BranchFalse => {
                    if let Some(ConstVal::Blk(dst)) =
                        inst.arg(1).and_then(|v| ir.value(v).const_val().cloned())
                    {
                        ir.add_block_edge(b, dst);
                    }
                    if let Some(next) = next {
                        ir.add_block_edge(b, next);
                    }
                }
                _ => (),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{parser, Ir};

    #[test]
    fn edges_follow_branches() {
        let mut ir = Ir::new();
        parser::read(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i8 %1 = cmp_eq %0, 0x0:i32
              branch_true %1, :exit
            body:
              branch :entry
            exit:
              call_noreturn 0x1000:i64
            ",
            &mut ir,
        )
        .unwrap();
        super::run(&mut ir);

        let blocks: Vec<_> = ir.blocks().collect();
        let (entry, body, exit) = (blocks[0], blocks[1], blocks[2]);
        assert_eq!(ir.block(entry).outgoing, vec![exit, body]);
        assert_eq!(ir.block(body).outgoing, vec![entry]);
        assert_eq!(ir.block(entry).incoming, vec![body]);
        assert!(ir.block(exit).outgoing.is_empty());
    }

    #[test]
    fn thunk_branches_add_no_edges() {
        let mut ir = Ir::new();
        parser::read("entry:\n  branch 0x7f00aa00:i64\n", &mut ir).unwrap();
        super::run(&mut ir);
        let entry = ir.blocks().next().unwrap();
        assert!(ir.block(entry).outgoing.is_empty());
    }
}
