//! Load/store elimination over the guest context.
//!
//! Within a block, context slots behave like ordinary memory with known
//! constant offsets, so a load from a slot whose current value is already
//! known (from an earlier load or store) can be replaced outright, and a
//! store that is overwritten before anything reads it is dead. Calls and
//! guest-memory stores can mutate the context behind our back, so they
//! clobber everything known. The analysis is per-block; nothing is carried
//! across block boundaries.

use crate::ir::{InstIdx, Ir, Opcode, ValueIdx};

#[derive(Clone, Copy)]
struct Slot {
    off: u32,
    size: u32,
}

impl Slot {
    fn overlaps(&self, other: &Slot) -> bool {
        self.off < other.off + other.size && other.off < self.off + self.size
    }
}

pub fn run(ir: &mut Ir) {
    let blocks: Vec<_> = ir.blocks().collect();
    for b in blocks {
        // (slot, value currently held there)
        let mut known: Vec<(Slot, ValueIdx)> = Vec::new();
        // stores that nothing has read back yet
        let mut pending: Vec<(Slot, InstIdx)> = Vec::new();

        for i in ir.block_insts(b) {
            let inst = ir.inst(i);
            match inst.op {
                Opcode::LoadContext => {
                    let result = inst.result.unwrap();
                    let ty = ir.value(result).ty;
                    let slot = Slot {
                        off: ir.zext_constant(inst.arg(0).unwrap()) as u32,
                        size: ty.size(),
                    };
                    let hit = known.iter().find(|(s, v)| {
                        s.off == slot.off && s.size == slot.size && ir.value(*v).ty == ty
                    });
                    if let Some(&(_, v)) = hit {
                        ir.replace_uses(result, v);
                        ir.remove_inst(i);
                        continue;
                    }
                    // The slot's value is now known; earlier stores to this
                    // range have been observed, so they stay.
                    pending.retain(|(s, _)| !s.overlaps(&slot));
                    known.retain(|(s, _)| !s.overlaps(&slot));
                    known.push((slot, result));
                }
                Opcode::StoreContext => {
                    let v = inst.arg(1).unwrap();
                    let slot = Slot {
                        off: ir.zext_constant(inst.arg(0).unwrap()) as u32,
                        size: ir.value(v).ty.size(),
                    };
                    // An unread store to the exact same slot is dead.
                    if let Some(pos) = pending
                        .iter()
                        .position(|(s, _)| s.off == slot.off && s.size == slot.size)
                    {
                        let (_, dead) = pending.remove(pos);
                        ir.remove_inst(dead);
                    }
                    pending.retain(|(s, _)| !s.overlaps(&slot));
                    pending.push((slot, i));
                    known.retain(|(s, _)| !s.overlaps(&slot));
                    known.push((slot, v));
                }
                Opcode::Call
                | Opcode::CallCond
                | Opcode::CallNoreturn
                | Opcode::CallFallback
                | Opcode::StoreHost
                | Opcode::StoreFast
                | Opcode::StoreSlow
                | Opcode::DebugBreak => {
                    known.clear();
                    pending.clear();
                }
                _ => (),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::Ir;

    fn assert_lse(input: &str, expect: &str) {
        crate::opt::tests::assert_opt_eq(input, super::run, expect);
    }

    #[test]
    fn forwards_stored_value_to_load() {
        assert_lse(
            "
            entry:
              i32 %0 = load_context 0x8:i32
              store_context 0x10:i32, %0
              i32 %2 = load_context 0x10:i32
              store_context 0x14:i32, %2
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x8:i32
              store_context 0x10:i32, %{{0}}
              store_context 0x14:i32, %{{0}}
            ",
        );
    }

    #[test]
    fn removes_redundant_load() {
        assert_lse(
            "
            entry:
              i32 %0 = load_context 0x8:i32
              i32 %1 = load_context 0x8:i32
              store_context 0xc:i32, %0
              store_context 0x10:i32, %1
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x8:i32
              store_context 0xc:i32, %{{0}}
              store_context 0x10:i32, %{{0}}
            ",
        );
    }

    #[test]
    fn removes_overwritten_store() {
        assert_lse(
            "
            entry:
              store_context 0x8:i32, 0x1:i32
              store_context 0x8:i32, 0x2:i32
            ",
            "
            entry:
              store_context 0x8:i32, 0x2:i32
            ",
        );
    }

    #[test]
    fn call_clobbers_known_values() {
        assert_lse(
            "
            entry:
              i32 %0 = load_context 0x8:i32
              call 0x1000:i64
              i32 %2 = load_context 0x8:i32
              store_context 0xc:i32, %2
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x8:i32
              call 0x1000:i64
              i32 %{{2}} = load_context 0x8:i32
              store_context 0xc:i32, %{{2}}
            ",
        );
    }

    #[test]
    fn forwarding_can_make_a_store_dead() {
        // Once the load is forwarded from the first store, nothing reads
        // the slot before it is overwritten, so the first store dies too.
        assert_lse(
            "
            entry:
              store_context 0x8:i32, 0x1:i32
              i32 %1 = load_context 0x8:i32
              store_context 0xc:i32, %1
              store_context 0x8:i32, 0x2:i32
            ",
            "
            entry:
              store_context 0xc:i32, 0x1:i32
              store_context 0x8:i32, 0x2:i32
            ",
        );
    }

    #[test]
    fn overlapping_store_invalidates() {
        // An i8 store into the middle of a known i32 slot clobbers it.
        assert_lse(
            "
            entry:
              i32 %0 = load_context 0x8:i32
              store_context 0x14:i32, %0
              store_context 0x9:i32, 0x7:i8
              i32 %3 = load_context 0x8:i32
              store_context 0x18:i32, %3
            ",
            "
            entry:
              i32 %{{0}} = load_context 0x8:i32
              store_context 0x14:i32, %{{0}}
              store_context 0x9:i32, 0x7:i8
              i32 %{{3}} = load_context 0x8:i32
              store_context 0x18:i32, %{{3}}
            ",
        );
    }

    #[test]
    fn loads_do_not_cross_blocks() {
        assert_lse(
            "
            a:
              i32 %0 = load_context 0x8:i32
              store_context 0xc:i32, %0
            b:
              i32 %2 = load_context 0x8:i32
              store_context 0x10:i32, %2
            ",
            "
            a:
              i32 %{{0}} = load_context 0x8:i32
              store_context 0xc:i32, %{{0}}
            b:
              i32 %{{2}} = load_context 0x8:i32
              store_context 0x10:i32, %{{2}}
            ",
        );
    }
}
