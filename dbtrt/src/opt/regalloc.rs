//! Linear scan register allocation.
//!
//! Runs last, over blocks in layout order and instructions in order, treating
//! the whole compilation as one linear range. Every value that is alive in a
//! register occupies one entry of the backend-supplied bank; each register
//! advertises (via a type mask) which value types it can hold. When the bank
//! is exhausted the occupant with the furthest last use is evicted: its value
//! is stored to a spill local on first eviction (SSA values never change, so
//! a later eviction of the same value needs no second store) and reloaded in
//! front of any later use.
//!
//! Reloads define fresh values, so after this pass a value's uses may be
//! split between the original and one reload per resurrecting use site; all
//! of them carry a register assignment for the emitter.

use crate::{
    backend::RegisterDesc,
    ir::{InstIdx, Ir, LocalIdx, Ty, ValueIdx},
};
use std::collections::HashMap;

struct Alloc<'a> {
    registers: &'a [RegisterDesc],
    /// The value currently held by each register.
    occupant: Vec<Option<ValueIdx>>,
    /// The spill local of every value that has ever been evicted.
    spilled: HashMap<ValueIdx, LocalIdx>,
    /// Position of each value's final use in the pre-pass snapshot.
    last_use: HashMap<ValueIdx, usize>,
}

impl Alloc<'_> {
    /// Free every register whose occupant is dead at `pos`.
    fn expire(&mut self, pos: usize) {
        for slot in self.occupant.iter_mut() {
            if let Some(v) = *slot {
                if self.last_use.get(&v).map_or(true, |p| *p < pos) {
                    *slot = None;
                }
            }
        }
    }

    fn where_is(&self, v: ValueIdx) -> Option<usize> {
        self.occupant.iter().position(|o| *o == Some(v))
    }

    fn fits(&self, r: usize, ty: Ty) -> bool {
        self.registers[r].value_types & ty.mask() != 0
    }

    /// Claim a register able to hold `ty`, evicting (and spilling) an
    /// occupant in front of `before` if none is free. Occupants that are
    /// dead after `pos` are reclaimed without a spill.
    fn take_reg(
        &mut self,
        ir: &mut Ir,
        before: InstIdx,
        pos: usize,
        ty: Ty,
        pinned: &[bool],
    ) -> usize {
        if let Some(r) = (0..self.registers.len())
            .find(|r| self.occupant[*r].is_none() && !pinned[*r] && self.fits(*r, ty))
        {
            return r;
        }

        // An occupant with no use beyond `pos` is as good as free.
        if let Some(r) = (0..self.registers.len()).find(|r| {
            !pinned[*r]
                && self.fits(*r, ty)
                && self.occupant[*r]
                    .is_some_and(|v| self.last_use.get(&v).map_or(true, |p| *p <= pos))
        }) {
            self.occupant[r] = None;
            return r;
        }

        // Evict the occupant whose next need is furthest away.
        let r = (0..self.registers.len())
            .filter(|r| !pinned[*r] && self.fits(*r, ty) && self.occupant[*r].is_some())
            .max_by_key(|r| self.last_use[&self.occupant[*r].unwrap()])
            .unwrap_or_else(|| {
                panic!(
                    "register bank has no allocatable register for type {ty} \
                     ({} registers, all pinned or unsuitable)",
                    self.registers.len()
                )
            });
        let evicted = self.occupant[r].take().unwrap();
        if !self.spilled.contains_key(&evicted) {
            let l = ir.alloc_local(ir.value(evicted).ty);
            let saved = ir.insert_point();
            ir.set_insert_point(ir.insert_point_before(before));
            ir.store_local(l, evicted);
            ir.set_insert_point(saved);
            self.spilled.insert(evicted, l);
        }
        r
    }
}

pub fn run(ir: &mut Ir, registers: &[RegisterDesc]) {
    assert!(
        !registers.is_empty(),
        "register allocation needs a register bank"
    );

    // Snapshot the instruction order and find each value's last use.
    let mut order: Vec<InstIdx> = Vec::new();
    let mut last_use: HashMap<ValueIdx, usize> = HashMap::new();
    for b in ir.blocks().collect::<Vec<_>>() {
        for i in ir.block_insts(b) {
            let pos = order.len();
            order.push(i);
            for (_, v) in ir.inst(i).args() {
                if !ir.value(v).is_constant() {
                    last_use.insert(v, pos);
                }
            }
            if let Some(r) = ir.inst(i).result {
                last_use.insert(r, pos);
            }
        }
    }

    let mut alloc = Alloc {
        registers,
        occupant: vec![None; registers.len()],
        spilled: HashMap::new(),
        last_use,
    };

    for (pos, &i) in order.iter().enumerate() {
        alloc.expire(pos);

        let args: Vec<(usize, ValueIdx)> = ir.inst(i).args().collect();
        let mut pinned = vec![false; registers.len()];
        for &(_, v) in &args {
            if let Some(r) = alloc.where_is(v) {
                pinned[r] = true;
            }
        }

        // Reload any argument that is no longer register resident.
        let mut reloaded: Vec<ValueIdx> = Vec::new();
        for &(_, v) in &args {
            if ir.value(v).is_constant()
                || alloc.where_is(v).is_some()
                || reloaded.contains(&v)
            {
                continue;
            }
            let l = *alloc
                .spilled
                .get(&v)
                .expect("live value is neither register resident nor spilled");
            // Claim the register first: a spill store it emits has to land
            // in front of the reload that overwrites the register.
            let ty = ir.value(v).ty;
            let r = alloc.take_reg(ir, i, pos, ty, &pinned);
            let saved = ir.insert_point();
            ir.set_insert_point(ir.insert_point_before(i));
            let nv = ir.load_local(l);
            ir.set_insert_point(saved);
            for &(m, v2) in &args {
                if v2 == v {
                    ir.set_arg(i, m, nv);
                }
            }
            alloc.last_use.insert(nv, pos);
            ir.value_mut(nv).reg = Some(r as u8);
            alloc.occupant[r] = Some(nv);
            pinned[r] = true;
            reloaded.push(v);
        }

        if let Some(res) = ir.inst(i).result {
            // The result may share a register with an argument that dies at
            // this instruction, so only pin the arguments that live on.
            let mut pinned_res = vec![false; registers.len()];
            for (_, v) in ir.inst(i).args().collect::<Vec<_>>() {
                if let Some(r) = alloc.where_is(v) {
                    if alloc.last_use.get(&v).map_or(false, |p| *p > pos) {
                        pinned_res[r] = true;
                    }
                }
            }
            let ty = ir.value(res).ty;
            let r = alloc.take_reg(ir, i, pos, ty, &pinned_res);
            ir.value_mut(res).reg = Some(r as u8);
            alloc.occupant[r] = Some(res);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{parser, type_mask, Opcode};

    const TWO_GP: [RegisterDesc; 2] = [
        RegisterDesc {
            name: "r0",
            value_types: type_mask::INT,
        },
        RegisterDesc {
            name: "r1",
            value_types: type_mask::INT,
        },
    ];

    const GP_AND_FP: [RegisterDesc; 4] = [
        RegisterDesc {
            name: "r0",
            value_types: type_mask::INT,
        },
        RegisterDesc {
            name: "r1",
            value_types: type_mask::INT,
        },
        RegisterDesc {
            name: "f0",
            value_types: type_mask::FLOAT,
        },
        RegisterDesc {
            name: "f1",
            value_types: type_mask::FLOAT,
        },
    ];

    /// Every non-constant argument in `ir` must carry a register whose type
    /// mask admits the value's type.
    fn assert_fully_allocated(ir: &Ir, registers: &[RegisterDesc]) {
        for b in ir.blocks().collect::<Vec<_>>() {
            for i in ir.block_insts(b) {
                for (_, v) in ir.inst(i).args() {
                    let val = ir.value(v);
                    if val.is_constant() {
                        continue;
                    }
                    let r = val.reg.expect("unallocated value") as usize;
                    assert!(registers[r].value_types & val.ty.mask() != 0);
                }
            }
        }
    }

    #[test]
    fn allocates_without_spills_when_bank_suffices() {
        let mut ir = Ir::new();
        parser::read(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = add %0, 0x1:i32
              store_context 0x0:i32, %1
            ",
            &mut ir,
        )
        .unwrap();
        run(&mut ir, &TWO_GP);
        assert_fully_allocated(&ir, &TWO_GP);
        assert_eq!(ir.locals_size, 0);
    }

    #[test]
    fn spills_when_bank_is_exhausted() {
        // Three values alive across the adds; only two registers.
        let mut ir = Ir::new();
        parser::read(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              i32 %1 = load_context 0x4:i32
              i32 %2 = load_context 0x8:i32
              i32 %3 = add %0, %1
              i32 %4 = add %3, %2
              i32 %5 = add %4, %0
              store_context 0xc:i32, %5
            ",
            &mut ir,
        )
        .unwrap();
        run(&mut ir, &TWO_GP);
        assert_fully_allocated(&ir, &TWO_GP);
        assert!(ir.locals_size > 0, "expected at least one spill");

        let entry = ir.blocks().next().unwrap();
        let ops: Vec<Opcode> = ir
            .block_insts(entry)
            .iter()
            .map(|i| ir.inst(*i).op)
            .collect();
        assert!(ops.contains(&Opcode::StoreLocal));
        assert!(ops.contains(&Opcode::LoadLocal));
        #[cfg(debug_assertions)]
        ir.assert_well_formed();
    }

    #[test]
    fn respects_type_masks() {
        let mut ir = Ir::new();
        parser::read(
            "
            entry:
              i32 %0 = load_context 0x0:i32
              f32 %1 = load_context 0x4:i32
              f32 %2 = fadd %1, %1
              i32 %3 = add %0, %0
              store_context 0x8:i32, %2
              store_context 0xc:i32, %3
            ",
            &mut ir,
        )
        .unwrap();
        run(&mut ir, &GP_AND_FP);
        assert_fully_allocated(&ir, &GP_AND_FP);
        // Float results must be in the float half of the bank.
        let f = ir
            .blocks()
            .flat_map(|b| ir.block_insts(b))
            .find(|i| ir.inst(*i).op == Opcode::Fadd)
            .unwrap();
        let r = ir.value(ir.inst(f).result.unwrap()).reg.unwrap() as usize;
        assert!(GP_AND_FP[r].value_types & type_mask::FLOAT != 0);
    }
}
