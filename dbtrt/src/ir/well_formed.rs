//! IR well-formedness checks.
//!
//! These are cheap-ish but not free, so they are only compiled into debug
//! and test builds. Every optimisation pass is expected to leave the IR in a
//! state that passes these checks.

use super::{Ir, Opcode};

impl Ir {
    /// Panic if the IR's internal invariants don't hold.
    pub fn assert_well_formed(&self) {
        // Every argument's use record must appear in the value's use list,
        // and every use record must point back at a matching argument slot.
        for b in self.blocks() {
            for i in self.block_insts(b) {
                let inst = self.inst(i);
                assert!(
                    inst.block == b,
                    "instruction's block field does not match its containing block"
                );
                for (n, v) in inst.args() {
                    assert!(
                        self.value(v)
                            .uses()
                            .iter()
                            .any(|u| u.inst == i && u.arg == n),
                        "use of %{} by instruction {} arg {n} missing from its use list",
                        usize::from(v),
                        usize::from(i),
                    );
                }
                if let Some(r) = inst.result {
                    assert!(
                        self.value(r).def() == Some(i),
                        "result %{} does not point back at its defining instruction",
                        usize::from(r),
                    );
                }
            }
        }

        for v in 0..self.num_values() {
            let v = super::ValueIdx::try_from(v).unwrap();
            let val = self.value(v);
            if val.is_constant() {
                assert!(val.def().is_none(), "constant with a defining instruction");
            }
            for u in val.uses() {
                let inst = self.inst(u.inst);
                assert!(
                    inst.op != Opcode::Tombstone,
                    "%{} is used by a tombstoned instruction",
                    usize::from(v),
                );
                assert!(
                    inst.arg(u.arg) == Some(v),
                    "use record of %{} points at a slot holding something else",
                    usize::from(v),
                );
            }
        }
    }

}
