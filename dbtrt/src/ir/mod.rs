//! The intermediate representation (IR) of a compiled block.
//!
//! The IR is SSA-like: every non-void instruction defines exactly one
//! [Value], and constants are values with no defining instruction. What makes
//! the representation convenient for the optimisation passes is the *use
//! list*: each value records every `(instruction, argument slot)` pair that
//! references it, so [Ir::replace_uses] can substitute one value for another
//! across the whole IR in one sweep while keeping use/def integrity intact.
//!
//! Storage is arena-style: values, instructions, blocks and locals live in
//! typed pools owned by the [Ir] container and are referenced by index
//! newtypes ([ValueIdx], [InstIdx], [BlockIdx], [LocalIdx]). The pools are
//! reset (but keep their capacity) between compilations, so a long-lived JIT
//! does not re-allocate per block. Removing an instruction tombstones it in
//! place; iteration and printing skip tombstones.
//!
//! An [InsertPoint] is a `{block, instruction-after}` cursor. Callers that
//! need to emit into a different block temporarily (e.g. a frontend emitting
//! a branch thunk) save the cursor, move it, emit, and restore it.
//!
//! The textual form of the IR (see [display] and [parser]) round-trips: IR
//! written with `to_string()` and read back compares equal under
//! [Ir::structural_eq].

mod display;
pub mod parser;
#[cfg(any(debug_assertions, test))]
mod well_formed;

use crate::HostAddr;
use smallvec::SmallVec;
use strum::{Display, EnumString};

/// The maximum number of argument slots an instruction has.
pub const MAX_INST_ARGS: usize = 4;

/// A value type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum Ty {
    #[strum(serialize = "void")]
    Void,
    #[strum(serialize = "i8")]
    I8,
    #[strum(serialize = "i16")]
    I16,
    #[strum(serialize = "i32")]
    I32,
    #[strum(serialize = "i64")]
    I64,
    #[strum(serialize = "f32")]
    F32,
    #[strum(serialize = "f64")]
    F64,
    #[strum(serialize = "v128")]
    V128,
    #[strum(serialize = "str")]
    Str,
    #[strum(serialize = "blk")]
    Blk,
}

impl Ty {
    /// Size of a value of this type in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Ty::I8 => 1,
            Ty::I16 => 2,
            Ty::I32 | Ty::F32 => 4,
            Ty::I64 | Ty::F64 => 8,
            Ty::V128 => 16,
            Ty::Void | Ty::Str | Ty::Blk => panic!("type {self} has no size"),
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Ty::I8 | Ty::I16 | Ty::I32 | Ty::I64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::F32 | Ty::F64)
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Ty::V128)
    }

    /// The bit for this type in a register's [type mask](crate::backend::RegisterDesc).
    pub const fn mask(self) -> u16 {
        1 << (self as u16)
    }
}

/// Bit masks over [Ty] for describing which value types a host register can
/// hold.
pub mod type_mask {
    use super::Ty;

    pub const INT: u16 =
        Ty::I8.mask() | Ty::I16.mask() | Ty::I32.mask() | Ty::I64.mask();
    pub const FLOAT: u16 = Ty::F32.mask() | Ty::F64.mask();
    pub const VECTOR: u16 = Ty::V128.mask();
    pub const ALL: u16 = INT | FLOAT;
}

/// An instruction opcode.
///
/// Serialised names (via strum) double as the textual IR spelling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    /// A removed instruction. Never printed, never executed.
    Tombstone,

    /* memory */
    LoadHost,
    StoreHost,
    LoadFast,
    StoreFast,
    LoadSlow,
    StoreSlow,
    LoadContext,
    StoreContext,
    LoadLocal,
    StoreLocal,

    /* casts / conversions */
    Ftoi,
    Itof,
    Sext,
    Zext,
    Trunc,
    Fext,
    Ftrunc,

    /* conditionals */
    Select,
    CmpEq,
    CmpNe,
    CmpSge,
    CmpSgt,
    CmpUge,
    CmpUgt,
    CmpSle,
    CmpSlt,
    CmpUle,
    CmpUlt,
    FcmpEq,
    FcmpNe,
    FcmpGe,
    FcmpGt,
    FcmpLe,
    FcmpLt,

    /* integer math */
    Add,
    Sub,
    Smul,
    Umul,
    Div,
    Neg,
    Abs,

    /* floating point math */
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fneg,
    Fabs,
    Sqrt,

    /* vector math */
    Vbroadcast,
    Vadd,
    Vdot,
    Vmul,

    /* bitwise */
    And,
    Or,
    Xor,
    Not,
    Shl,
    Ashr,
    Lshr,
    Ashd,
    Lshd,

    /* control flow */
    Label,
    Branch,
    BranchTrue,
    BranchFalse,
    Call,
    CallCond,
    CallNoreturn,
    CallFallback,

    /* debug */
    DebugInfo,
    DebugBreak,
    AssertLt,
}

impl Opcode {
    /// Does this instruction have an effect beyond producing its result?
    /// Instructions for which this is true are never dead-code eliminated.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Opcode::StoreHost
                | Opcode::StoreFast
                | Opcode::StoreSlow
                // Slow loads can hit memory-mapped I/O, whose reads are
                // observable by the guest.
                | Opcode::LoadSlow
                | Opcode::StoreContext
                | Opcode::StoreLocal
                | Opcode::Label
                | Opcode::Branch
                | Opcode::BranchTrue
                | Opcode::BranchFalse
                | Opcode::Call
                | Opcode::CallCond
                | Opcode::CallNoreturn
                | Opcode::CallFallback
                | Opcode::DebugInfo
                | Opcode::DebugBreak
                | Opcode::AssertLt
        )
    }

    /// Is this a block terminator?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Branch | Opcode::BranchTrue | Opcode::BranchFalse | Opcode::CallNoreturn
        )
    }
}

/// The payload of a constant value.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstVal {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Blk(BlockIdx),
}

macro_rules! index_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl From<$name> for usize {
            fn from(v: $name) -> usize {
                v.0 as usize
            }
        }

        impl TryFrom<usize> for $name {
            type Error = std::num::TryFromIntError;
            fn try_from(v: usize) -> Result<Self, Self::Error> {
                u32::try_from(v).map($name)
            }
        }
    };
}

index_newtype!(ValueIdx);
index_newtype!(InstIdx);
index_newtype!(BlockIdx);
index_newtype!(LocalIdx);

/// One recorded use of a value: argument slot `arg` of instruction `inst`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Use {
    pub inst: InstIdx,
    pub arg: usize,
}

#[derive(Clone, Debug, PartialEq)]
enum ValueKind {
    /// A constant; carries its payload inline.
    Const(ConstVal),
    /// The result of the given instruction.
    Def(InstIdx),
}

/// An SSA value.
#[derive(Clone, Debug)]
pub struct Value {
    pub ty: Ty,
    kind: ValueKind,
    uses: SmallVec<[Use; 4]>,
    /// Host register assigned by register allocation, if any.
    pub reg: Option<u8>,
    /// Scratch slot for optimisation passes.
    pub tag: u64,
}

impl Value {
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ValueKind::Const(_))
    }

    /// The instruction defining this value, or `None` for constants.
    pub fn def(&self) -> Option<InstIdx> {
        match self.kind {
            ValueKind::Def(iidx) => Some(iidx),
            ValueKind::Const(_) => None,
        }
    }

    /// The constant payload, or `None` for instruction results.
    pub fn const_val(&self) -> Option<&ConstVal> {
        match &self.kind {
            ValueKind::Const(c) => Some(c),
            ValueKind::Def(_) => None,
        }
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }
}

/// An instruction.
#[derive(Clone, Debug)]
pub struct Inst {
    pub op: Opcode,
    args: [Option<ValueIdx>; MAX_INST_ARGS],
    pub result: Option<ValueIdx>,
    pub block: BlockIdx,
    pub label: Option<String>,
    /// Scratch slot for optimisation passes.
    pub tag: u64,
}

impl Inst {
    pub fn arg(&self, n: usize) -> Option<ValueIdx> {
        self.args[n]
    }

    /// The arguments that are set, in slot order.
    pub fn args(&self) -> impl Iterator<Item = (usize, ValueIdx)> + '_ {
        self.args
            .iter()
            .enumerate()
            .filter_map(|(n, a)| a.map(|v| (n, v)))
    }
}

/// A basic block: an ordered list of instructions ending in a terminator.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub label: Option<String>,
    insts: Vec<InstIdx>,
    /// CFG edges, filled in by control-flow analysis.
    pub incoming: Vec<BlockIdx>,
    pub outgoing: Vec<BlockIdx>,
    /// Scratch slot for optimisation passes.
    pub tag: u64,
}

/// A spill slot in the guest context frame, allocated by register
/// allocation.
#[derive(Clone, Copy, Debug)]
pub struct Local {
    pub ty: Ty,
    /// A constant i32 value holding the slot's frame offset.
    pub offset: ValueIdx,
}

/// The builder cursor: new instructions are inserted into `block` after
/// `after` (or at the head of `block` when `after` is `None`).
#[derive(Clone, Copy, Debug, Default)]
pub struct InsertPoint {
    pub block: Option<BlockIdx>,
    pub after: Option<InstIdx>,
}

/// The IR container: pools, the block layout order, locals, and the builder
/// cursor.
#[derive(Debug, Default)]
pub struct Ir {
    values: Vec<Value>,
    insts: Vec<Inst>,
    blocks: Vec<Block>,
    /// Block layout order. "Next block" for fall-through purposes means the
    /// next entry here, not the next pool index.
    order: Vec<BlockIdx>,
    locals: Vec<Local>,
    /// Total bytes of locals allocated so far.
    pub locals_size: u32,
    cursor: InsertPoint,
}

impl Ir {
    pub fn new() -> Self {
        Ir::default()
    }

    /// Drop all IR, keeping pool capacity for the next compilation.
    pub fn reset(&mut self) {
        self.values.clear();
        self.insts.clear();
        self.blocks.clear();
        self.order.clear();
        self.locals.clear();
        self.locals_size = 0;
        self.cursor = InsertPoint::default();
    }

    /* accessors */

    pub fn value(&self, v: ValueIdx) -> &Value {
        &self.values[usize::from(v)]
    }

    pub fn value_mut(&mut self, v: ValueIdx) -> &mut Value {
        &mut self.values[usize::from(v)]
    }

    pub fn inst(&self, i: InstIdx) -> &Inst {
        &self.insts[usize::from(i)]
    }

    pub fn inst_mut(&mut self, i: InstIdx) -> &mut Inst {
        &mut self.insts[usize::from(i)]
    }

    pub fn block(&self, b: BlockIdx) -> &Block {
        &self.blocks[usize::from(b)]
    }

    pub fn block_mut(&mut self, b: BlockIdx) -> &mut Block {
        &mut self.blocks[usize::from(b)]
    }

    pub fn local(&self, l: LocalIdx) -> &Local {
        &self.locals[usize::from(l)]
    }

    /// The number of values in the pool (live or not).
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Blocks in layout order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockIdx> + '_ {
        self.order.iter().copied()
    }

    /// The block following `b` in layout order, if any.
    pub fn next_block(&self, b: BlockIdx) -> Option<BlockIdx> {
        let pos = self.order_pos(b);
        self.order.get(pos + 1).copied()
    }

    /// Instructions of `b` in order, skipping tombstones.
    pub fn block_insts(&self, b: BlockIdx) -> Vec<InstIdx> {
        self.block(b)
            .insts
            .iter()
            .copied()
            .filter(|i| self.inst(*i).op != Opcode::Tombstone)
            .collect()
    }

    /// Total number of live instructions.
    pub fn num_insts(&self) -> usize {
        self.blocks().map(|b| self.block_insts(b).len()).sum()
    }

    fn order_pos(&self, b: BlockIdx) -> usize {
        self.order
            .iter()
            .position(|x| *x == b)
            .expect("block not in layout order")
    }

    /* cursor */

    pub fn insert_point(&self) -> InsertPoint {
        self.cursor
    }

    pub fn set_insert_point(&mut self, point: InsertPoint) {
        self.cursor = point;
    }

    /// Move the cursor to the end of `b`.
    pub fn set_current_block(&mut self, b: BlockIdx) {
        self.cursor = InsertPoint {
            block: Some(b),
            after: self.block(b).insts.last().copied(),
        };
    }

    /// Move the cursor to just after `i`.
    pub fn set_current_inst(&mut self, i: InstIdx) {
        self.cursor = InsertPoint {
            block: Some(self.inst(i).block),
            after: Some(i),
        };
    }

    /// The insert point at which emission lands directly before `i`.
    pub fn insert_point_before(&self, i: InstIdx) -> InsertPoint {
        let block = self.inst(i).block;
        let pos = self
            .block(block)
            .insts
            .iter()
            .position(|x| *x == i)
            .expect("instruction not in its block");
        InsertPoint {
            block: Some(block),
            after: if pos == 0 {
                None
            } else {
                Some(self.block(block).insts[pos - 1])
            },
        }
    }

    /* blocks */

    /// Append a new empty block at the end of the layout order.
    pub fn append_block(&mut self) -> BlockIdx {
        let b = BlockIdx::try_from(self.blocks.len()).unwrap();
        self.blocks.push(Block::default());
        self.order.push(b);
        b
    }

    /// Insert a new empty block in layout order directly after `after`.
    pub fn insert_block(&mut self, after: BlockIdx) -> BlockIdx {
        let b = BlockIdx::try_from(self.blocks.len()).unwrap();
        self.blocks.push(Block::default());
        let pos = self.order_pos(after);
        self.order.insert(pos + 1, b);
        b
    }

    pub fn set_block_label(&mut self, b: BlockIdx, label: String) {
        self.block_mut(b).label = Some(label);
    }

    /// Find a block by label.
    pub fn find_block(&self, label: &str) -> Option<BlockIdx> {
        self.blocks()
            .find(|b| self.block(*b).label.as_deref() == Some(label))
    }

    /// Remove `b` from the layout order, tombstoning its instructions.
    pub fn remove_block(&mut self, b: BlockIdx) {
        for i in self.block(b).insts.clone() {
            if self.inst(i).op != Opcode::Tombstone {
                self.remove_inst(i);
            }
        }
        let pos = self.order_pos(b);
        self.order.remove(pos);
        if self.cursor.block == Some(b) {
            self.cursor = InsertPoint::default();
        }
    }

    /// Add a CFG edge between two blocks (used by control-flow analysis).
    pub fn add_block_edge(&mut self, src: BlockIdx, dst: BlockIdx) {
        if !self.block(src).outgoing.contains(&dst) {
            self.block_mut(src).outgoing.push(dst);
            self.block_mut(dst).incoming.push(src);
        }
    }

    /* instructions */

    /// Append an instruction at the cursor. If `result_ty` is non-void a
    /// fresh result value is created.
    pub fn append_inst(&mut self, op: Opcode, result_ty: Ty) -> InstIdx {
        let block = self
            .cursor
            .block
            .expect("no current block to insert into");
        let iidx = InstIdx::try_from(self.insts.len()).unwrap();
        self.insts.push(Inst {
            op,
            args: [None; MAX_INST_ARGS],
            result: None,
            block,
            label: None,
            tag: 0,
        });
        if result_ty != Ty::Void {
            let v = self.new_value(result_ty, ValueKind::Def(iidx));
            self.inst_mut(iidx).result = Some(v);
        }
        let pos = match self.cursor.after {
            Some(after) => {
                self.blocks[usize::from(block)]
                    .insts
                    .iter()
                    .position(|x| *x == after)
                    .expect("cursor instruction not in cursor block")
                    + 1
            }
            None => 0,
        };
        self.blocks[usize::from(block)].insts.insert(pos, iidx);
        self.cursor.after = Some(iidx);
        iidx
    }

    /// Insert an instruction immediately before `before`, leaving the cursor
    /// untouched.
    pub fn insert_inst_before(&mut self, before: InstIdx, op: Opcode, result_ty: Ty) -> InstIdx {
        let saved = self.cursor;
        let block = self.inst(before).block;
        let pos = self.blocks[usize::from(block)]
            .insts
            .iter()
            .position(|x| *x == before)
            .expect("instruction not in its block");
        let after = if pos == 0 {
            None
        } else {
            Some(self.blocks[usize::from(block)].insts[pos - 1])
        };
        self.cursor = InsertPoint {
            block: Some(block),
            after,
        };
        let iidx = self.append_inst(op, result_ty);
        self.cursor = saved;
        iidx
    }

    /// Insert an instruction immediately after `after`, leaving the cursor
    /// untouched.
    pub fn insert_inst_after(&mut self, after: InstIdx, op: Opcode, result_ty: Ty) -> InstIdx {
        let saved = self.cursor;
        self.cursor = InsertPoint {
            block: Some(self.inst(after).block),
            after: Some(after),
        };
        let iidx = self.append_inst(op, result_ty);
        self.cursor = saved;
        iidx
    }

    pub fn set_inst_label(&mut self, i: InstIdx, label: String) {
        self.inst_mut(i).label = Some(label);
    }

    /// Tombstone `i`, detaching its argument uses. The result value (if any)
    /// is left dangling; callers must have rewritten its uses first.
    pub fn remove_inst(&mut self, i: InstIdx) {
        assert!(
            self.inst(i).op != Opcode::Tombstone,
            "instruction removed twice"
        );
        for n in 0..MAX_INST_ARGS {
            if self.insts[usize::from(i)].args[n].is_some() {
                self.clear_arg(i, n);
            }
        }
        if self.cursor.after == Some(i) {
            // Retreat the cursor so it never points at a tombstone.
            let block = self.inst(i).block;
            let pos = self.blocks[usize::from(block)]
                .insts
                .iter()
                .position(|x| *x == i)
                .unwrap();
            self.cursor.after = if pos == 0 {
                None
            } else {
                Some(self.blocks[usize::from(block)].insts[pos - 1])
            };
        }
        self.inst_mut(i).op = Opcode::Tombstone;
    }

    /* arguments and uses */

    /// Set argument `n` of `i` to `v`, updating use lists on both sides.
    pub fn set_arg(&mut self, i: InstIdx, n: usize, v: ValueIdx) {
        assert!(n < MAX_INST_ARGS);
        if self.insts[usize::from(i)].args[n].is_some() {
            self.clear_arg(i, n);
        }
        self.insts[usize::from(i)].args[n] = Some(v);
        self.values[usize::from(v)].uses.push(Use { inst: i, arg: n });
    }

    fn clear_arg(&mut self, i: InstIdx, n: usize) {
        let old = self.insts[usize::from(i)].args[n].take().unwrap();
        let uses = &mut self.values[usize::from(old)].uses;
        let pos = uses
            .iter()
            .position(|u| u.inst == i && u.arg == n)
            .expect("use record missing from value's use list");
        uses.swap_remove(pos);
    }

    /// Rewrite a single use to reference `new`.
    pub fn replace_use(&mut self, u: Use, new: ValueIdx) {
        self.set_arg(u.inst, u.arg, new);
    }

    /// Rewrite every use of `old` to reference `new`.
    pub fn replace_uses(&mut self, old: ValueIdx, new: ValueIdx) {
        assert!(old != new, "replacing a value's uses with itself");
        let uses = std::mem::take(&mut self.values[usize::from(old)].uses);
        for u in uses {
            self.insts[usize::from(u.inst)].args[u.arg] = Some(new);
            self.values[usize::from(new)].uses.push(u);
        }
    }

    /* values */

    fn new_value(&mut self, ty: Ty, kind: ValueKind) -> ValueIdx {
        let v = ValueIdx::try_from(self.values.len()).unwrap();
        self.values.push(Value {
            ty,
            kind,
            uses: SmallVec::new(),
            reg: None,
            tag: 0,
        });
        v
    }

    pub fn const_i8(&mut self, c: i8) -> ValueIdx {
        self.new_value(Ty::I8, ValueKind::Const(ConstVal::I8(c)))
    }

    pub fn const_i16(&mut self, c: i16) -> ValueIdx {
        self.new_value(Ty::I16, ValueKind::Const(ConstVal::I16(c)))
    }

    pub fn const_i32(&mut self, c: i32) -> ValueIdx {
        self.new_value(Ty::I32, ValueKind::Const(ConstVal::I32(c)))
    }

    pub fn const_i64(&mut self, c: i64) -> ValueIdx {
        self.new_value(Ty::I64, ValueKind::Const(ConstVal::I64(c)))
    }

    pub fn const_f32(&mut self, c: f32) -> ValueIdx {
        self.new_value(Ty::F32, ValueKind::Const(ConstVal::F32(c)))
    }

    pub fn const_f64(&mut self, c: f64) -> ValueIdx {
        self.new_value(Ty::F64, ValueKind::Const(ConstVal::F64(c)))
    }

    pub fn const_str(&mut self, s: String) -> ValueIdx {
        self.new_value(Ty::Str, ValueKind::Const(ConstVal::Str(s)))
    }

    /// A host address constant (an i64 in the IR).
    pub fn const_ptr(&mut self, p: HostAddr) -> ValueIdx {
        self.const_i64(p.0 as i64)
    }

    /// A block-reference constant.
    pub fn const_blk(&mut self, b: BlockIdx) -> ValueIdx {
        self.new_value(Ty::Blk, ValueKind::Const(ConstVal::Blk(b)))
    }

    /// Make an integer constant of type `ty` from the low bits of `c`.
    pub fn const_int(&mut self, c: i64, ty: Ty) -> ValueIdx {
        match ty {
            Ty::I8 => self.const_i8(c as i8),
            Ty::I16 => self.const_i16(c as i16),
            Ty::I32 => self.const_i32(c as i32),
            Ty::I64 => self.const_i64(c),
            _ => panic!("not an integer type: {ty}"),
        }
    }

    /// The zero-extended bits of an integer constant.
    pub fn zext_constant(&self, v: ValueIdx) -> u64 {
        match self.value(v).const_val() {
            Some(ConstVal::I8(c)) => *c as u8 as u64,
            Some(ConstVal::I16(c)) => *c as u16 as u64,
            Some(ConstVal::I32(c)) => *c as u32 as u64,
            Some(ConstVal::I64(c)) => *c as u64,
            _ => panic!("zext_constant on a non-integer value"),
        }
    }

    /* locals */

    /// Allocate a new spill slot of type `ty` in the context frame.
    pub fn alloc_local(&mut self, ty: Ty) -> LocalIdx {
        let size = ty.size();
        // Align the slot to the value's natural alignment.
        self.locals_size = (self.locals_size + size - 1) & !(size - 1);
        let offset = self.const_i32(self.locals_size as i32);
        self.locals_size += size;
        let l = LocalIdx::try_from(self.locals.len()).unwrap();
        self.locals.push(Local { ty, offset });
        l
    }

    /// Create a local aliasing an existing slot offset (used when a spilled
    /// value is reloaded in more than one place).
    pub fn reuse_local(&mut self, offset: ValueIdx, ty: Ty) -> LocalIdx {
        let l = LocalIdx::try_from(self.locals.len()).unwrap();
        self.locals.push(Local { ty, offset });
        l
    }

    /* instruction builders */

    fn inst0(&mut self, op: Opcode, ty: Ty) -> InstIdx {
        self.append_inst(op, ty)
    }

    fn inst1(&mut self, op: Opcode, ty: Ty, a: ValueIdx) -> InstIdx {
        let i = self.append_inst(op, ty);
        self.set_arg(i, 0, a);
        i
    }

    fn inst2(&mut self, op: Opcode, ty: Ty, a: ValueIdx, b: ValueIdx) -> InstIdx {
        let i = self.inst1(op, ty, a);
        self.set_arg(i, 1, b);
        i
    }

    fn inst3(&mut self, op: Opcode, ty: Ty, a: ValueIdx, b: ValueIdx, c: ValueIdx) -> InstIdx {
        let i = self.inst2(op, ty, a, b);
        self.set_arg(i, 2, c);
        i
    }

    fn result_of(&self, i: InstIdx) -> ValueIdx {
        self.inst(i).result.expect("instruction has no result")
    }

    fn binop(&mut self, op: Opcode, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        let ty = self.value(a).ty;
        assert!(
            ty == self.value(b).ty,
            "{op} operand types differ: {ty} vs {}",
            self.value(b).ty
        );
        let i = self.inst2(op, ty, a, b);
        self.result_of(i)
    }

    fn unop(&mut self, op: Opcode, a: ValueIdx) -> ValueIdx {
        let ty = self.value(a).ty;
        let i = self.inst1(op, ty, a);
        self.result_of(i)
    }

    fn cmp(&mut self, op: Opcode, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        assert!(self.value(a).ty == self.value(b).ty, "{op} operand types differ");
        let i = self.inst2(op, Ty::I8, a, b);
        self.result_of(i)
    }

    /* direct access to host memory */

    pub fn load_host(&mut self, addr: ValueIdx, ty: Ty) -> ValueIdx {
        let i = self.inst1(Opcode::LoadHost, ty, addr);
        self.result_of(i)
    }

    pub fn store_host(&mut self, addr: ValueIdx, v: ValueIdx) {
        self.inst2(Opcode::StoreHost, Ty::Void, addr, v);
    }

    /* guest memory */

    pub fn load_fast(&mut self, addr: ValueIdx, ty: Ty) -> ValueIdx {
        let i = self.inst1(Opcode::LoadFast, ty, addr);
        self.result_of(i)
    }

    pub fn store_fast(&mut self, addr: ValueIdx, v: ValueIdx) {
        self.inst2(Opcode::StoreFast, Ty::Void, addr, v);
    }

    pub fn load_slow(&mut self, addr: ValueIdx, ty: Ty) -> ValueIdx {
        let i = self.inst1(Opcode::LoadSlow, ty, addr);
        self.result_of(i)
    }

    pub fn store_slow(&mut self, addr: ValueIdx, v: ValueIdx) {
        self.inst2(Opcode::StoreSlow, Ty::Void, addr, v);
    }

    /* context */

    pub fn load_context(&mut self, offset: usize, ty: Ty) -> ValueIdx {
        let off = self.const_i32(i32::try_from(offset).unwrap());
        let i = self.inst1(Opcode::LoadContext, ty, off);
        self.result_of(i)
    }

    pub fn store_context(&mut self, offset: usize, v: ValueIdx) {
        let off = self.const_i32(i32::try_from(offset).unwrap());
        self.inst2(Opcode::StoreContext, Ty::Void, off, v);
    }

    /* locals */

    pub fn load_local(&mut self, l: LocalIdx) -> ValueIdx {
        let Local { ty, offset } = *self.local(l);
        let i = self.inst1(Opcode::LoadLocal, ty, offset);
        self.result_of(i)
    }

    pub fn store_local(&mut self, l: LocalIdx, v: ValueIdx) {
        let offset = self.local(l).offset;
        self.inst2(Opcode::StoreLocal, Ty::Void, offset, v);
    }

    /* casts / conversions */

    pub fn ftoi(&mut self, v: ValueIdx, dst_ty: Ty) -> ValueIdx {
        assert!(self.value(v).ty.is_float() && dst_ty.is_int());
        let i = self.inst1(Opcode::Ftoi, dst_ty, v);
        self.result_of(i)
    }

    pub fn itof(&mut self, v: ValueIdx, dst_ty: Ty) -> ValueIdx {
        assert!(self.value(v).ty.is_int() && dst_ty.is_float());
        let i = self.inst1(Opcode::Itof, dst_ty, v);
        self.result_of(i)
    }

    pub fn sext(&mut self, v: ValueIdx, dst_ty: Ty) -> ValueIdx {
        assert!(self.value(v).ty.is_int() && dst_ty.is_int());
        let i = self.inst1(Opcode::Sext, dst_ty, v);
        self.result_of(i)
    }

    pub fn zext(&mut self, v: ValueIdx, dst_ty: Ty) -> ValueIdx {
        assert!(self.value(v).ty.is_int() && dst_ty.is_int());
        let i = self.inst1(Opcode::Zext, dst_ty, v);
        self.result_of(i)
    }

    pub fn truncate(&mut self, v: ValueIdx, dst_ty: Ty) -> ValueIdx {
        assert!(self.value(v).ty.is_int() && dst_ty.is_int());
        let i = self.inst1(Opcode::Trunc, dst_ty, v);
        self.result_of(i)
    }

    pub fn fext(&mut self, v: ValueIdx, dst_ty: Ty) -> ValueIdx {
        assert!(self.value(v).ty == Ty::F32 && dst_ty == Ty::F64);
        let i = self.inst1(Opcode::Fext, dst_ty, v);
        self.result_of(i)
    }

    pub fn ftrunc(&mut self, v: ValueIdx, dst_ty: Ty) -> ValueIdx {
        assert!(self.value(v).ty == Ty::F64 && dst_ty == Ty::F32);
        let i = self.inst1(Opcode::Ftrunc, dst_ty, v);
        self.result_of(i)
    }

    /* conditionals */

    pub fn select(&mut self, cond: ValueIdx, t: ValueIdx, f: ValueIdx) -> ValueIdx {
        let ty = self.value(t).ty;
        assert!(ty == self.value(f).ty, "select arm types differ");
        let i = self.inst3(Opcode::Select, ty, cond, t, f);
        self.result_of(i)
    }

    pub fn cmp_eq(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpEq, a, b)
    }

    pub fn cmp_ne(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpNe, a, b)
    }

    pub fn cmp_sge(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpSge, a, b)
    }

    pub fn cmp_sgt(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpSgt, a, b)
    }

    pub fn cmp_uge(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpUge, a, b)
    }

    pub fn cmp_ugt(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpUgt, a, b)
    }

    pub fn cmp_sle(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpSle, a, b)
    }

    pub fn cmp_slt(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpSlt, a, b)
    }

    pub fn cmp_ule(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpUle, a, b)
    }

    pub fn cmp_ult(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::CmpUlt, a, b)
    }

    pub fn fcmp_eq(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::FcmpEq, a, b)
    }

    pub fn fcmp_ne(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::FcmpNe, a, b)
    }

    pub fn fcmp_ge(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::FcmpGe, a, b)
    }

    pub fn fcmp_gt(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::FcmpGt, a, b)
    }

    pub fn fcmp_le(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::FcmpLe, a, b)
    }

    pub fn fcmp_lt(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.cmp(Opcode::FcmpLt, a, b)
    }

    /* integer math */

    pub fn add(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Add, a, b)
    }

    pub fn sub(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Sub, a, b)
    }

    pub fn smul(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Smul, a, b)
    }

    pub fn umul(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Umul, a, b)
    }

    pub fn div(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Div, a, b)
    }

    pub fn neg(&mut self, a: ValueIdx) -> ValueIdx {
        self.unop(Opcode::Neg, a)
    }

    pub fn abs(&mut self, a: ValueIdx) -> ValueIdx {
        self.unop(Opcode::Abs, a)
    }

    /* floating point math */

    pub fn fadd(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Fadd, a, b)
    }

    pub fn fsub(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Fsub, a, b)
    }

    pub fn fmul(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Fmul, a, b)
    }

    pub fn fdiv(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Fdiv, a, b)
    }

    pub fn fneg(&mut self, a: ValueIdx) -> ValueIdx {
        self.unop(Opcode::Fneg, a)
    }

    pub fn fabs(&mut self, a: ValueIdx) -> ValueIdx {
        self.unop(Opcode::Fabs, a)
    }

    pub fn sqrt(&mut self, a: ValueIdx) -> ValueIdx {
        self.unop(Opcode::Sqrt, a)
    }

    /* vector math */

    pub fn vbroadcast(&mut self, a: ValueIdx) -> ValueIdx {
        let i = self.inst1(Opcode::Vbroadcast, Ty::V128, a);
        self.result_of(i)
    }

    pub fn vadd(&mut self, a: ValueIdx, b: ValueIdx, el_ty: Ty) -> ValueIdx {
        let el = self.const_i32(el_ty as i32);
        let i = self.inst3(Opcode::Vadd, Ty::V128, a, b, el);
        self.result_of(i)
    }

    pub fn vdot(&mut self, a: ValueIdx, b: ValueIdx, el_ty: Ty) -> ValueIdx {
        let el = self.const_i32(el_ty as i32);
        let i = self.inst3(Opcode::Vdot, Ty::F32, a, b, el);
        self.result_of(i)
    }

    pub fn vmul(&mut self, a: ValueIdx, b: ValueIdx, el_ty: Ty) -> ValueIdx {
        let el = self.const_i32(el_ty as i32);
        let i = self.inst3(Opcode::Vmul, Ty::V128, a, b, el);
        self.result_of(i)
    }

    /* bitwise */

    pub fn and(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::And, a, b)
    }

    pub fn or(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Or, a, b)
    }

    pub fn xor(&mut self, a: ValueIdx, b: ValueIdx) -> ValueIdx {
        self.binop(Opcode::Xor, a, b)
    }

    pub fn not(&mut self, a: ValueIdx) -> ValueIdx {
        self.unop(Opcode::Not, a)
    }

    fn shift(&mut self, op: Opcode, a: ValueIdx, n: ValueIdx) -> ValueIdx {
        assert!(self.value(n).ty == Ty::I32, "shift amount must be i32");
        let ty = self.value(a).ty;
        let i = self.inst2(op, ty, a, n);
        self.result_of(i)
    }

    pub fn shl(&mut self, a: ValueIdx, n: ValueIdx) -> ValueIdx {
        self.shift(Opcode::Shl, a, n)
    }

    pub fn shli(&mut self, a: ValueIdx, n: i32) -> ValueIdx {
        let n = self.const_i32(n);
        self.shl(a, n)
    }

    pub fn ashr(&mut self, a: ValueIdx, n: ValueIdx) -> ValueIdx {
        self.shift(Opcode::Ashr, a, n)
    }

    pub fn ashri(&mut self, a: ValueIdx, n: i32) -> ValueIdx {
        let n = self.const_i32(n);
        self.ashr(a, n)
    }

    pub fn lshr(&mut self, a: ValueIdx, n: ValueIdx) -> ValueIdx {
        self.shift(Opcode::Lshr, a, n)
    }

    pub fn lshri(&mut self, a: ValueIdx, n: i32) -> ValueIdx {
        let n = self.const_i32(n);
        self.lshr(a, n)
    }

    /// Arithmetic shift with a runtime direction: positive `n` shifts left,
    /// negative shifts right.
    pub fn ashd(&mut self, a: ValueIdx, n: ValueIdx) -> ValueIdx {
        self.shift(Opcode::Ashd, a, n)
    }

    /// Logical shift with a runtime direction.
    pub fn lshd(&mut self, a: ValueIdx, n: ValueIdx) -> ValueIdx {
        self.shift(Opcode::Lshd, a, n)
    }

    /* control flow */

    pub fn label(&mut self, lbl: ValueIdx) {
        self.inst1(Opcode::Label, Ty::Void, lbl);
    }

    pub fn branch(&mut self, dst: ValueIdx) {
        self.inst1(Opcode::Branch, Ty::Void, dst);
    }

    pub fn branch_true(&mut self, cond: ValueIdx, dst: ValueIdx) {
        self.inst2(Opcode::BranchTrue, Ty::Void, cond, dst);
    }

    pub fn branch_false(&mut self, cond: ValueIdx, dst: ValueIdx) {
        self.inst2(Opcode::BranchFalse, Ty::Void, cond, dst);
    }

    /* calls */

    pub fn call(&mut self, f: ValueIdx) {
        self.inst1(Opcode::Call, Ty::Void, f);
    }

    pub fn call_1(&mut self, f: ValueIdx, arg0: ValueIdx) {
        self.inst2(Opcode::Call, Ty::Void, f, arg0);
    }

    pub fn call_2(&mut self, f: ValueIdx, arg0: ValueIdx, arg1: ValueIdx) {
        self.inst3(Opcode::Call, Ty::Void, f, arg0, arg1);
    }

    pub fn call_cond(&mut self, cond: ValueIdx, f: ValueIdx) {
        self.inst2(Opcode::CallCond, Ty::Void, cond, f);
    }

    pub fn call_cond_1(&mut self, cond: ValueIdx, f: ValueIdx, arg0: ValueIdx) {
        self.inst3(Opcode::CallCond, Ty::Void, cond, f, arg0);
    }

    pub fn call_cond_2(&mut self, cond: ValueIdx, f: ValueIdx, arg0: ValueIdx, arg1: ValueIdx) {
        let i = self.inst3(Opcode::CallCond, Ty::Void, cond, f, arg0);
        self.set_arg(i, 3, arg1);
    }

    pub fn call_noreturn(&mut self, f: ValueIdx) {
        self.inst1(Opcode::CallNoreturn, Ty::Void, f);
    }

    pub fn call_noreturn_1(&mut self, f: ValueIdx, arg0: ValueIdx) {
        self.inst2(Opcode::CallNoreturn, Ty::Void, f, arg0);
    }

    pub fn call_noreturn_2(&mut self, f: ValueIdx, arg0: ValueIdx, arg1: ValueIdx) {
        self.inst3(Opcode::CallNoreturn, Ty::Void, f, arg0, arg1);
    }

    /// Call out to the interpreter for an instruction the translator does
    /// not handle inline.
    pub fn call_fallback(&mut self, handler: HostAddr, addr: crate::GuestAddr, raw_instr: u32) {
        let f = self.const_ptr(handler);
        let a = self.const_i32(addr as i32);
        let r = self.const_i32(raw_instr as i32);
        self.inst3(Opcode::CallFallback, Ty::Void, f, a, r);
    }

    /* debug */

    pub fn debug_info(&mut self, desc: &str, addr: crate::GuestAddr, raw_instr: u32) {
        let d = self.const_str(desc.to_owned());
        let a = self.const_i32(addr as i32);
        let r = self.const_i32(raw_instr as i32);
        self.inst3(Opcode::DebugInfo, Ty::Void, d, a, r);
    }

    pub fn debug_break(&mut self) {
        self.inst0(Opcode::DebugBreak, Ty::Void);
    }

    pub fn assert_lt(&mut self, a: ValueIdx, b: ValueIdx) {
        self.inst2(Opcode::AssertLt, Ty::Void, a, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_lists_track_arguments() {
        let mut ir = Ir::new();
        let b = ir.append_block();
        ir.set_current_block(b);
        let one = ir.const_i32(1);
        let two = ir.const_i32(2);
        let sum = ir.add(one, two);
        let _ = ir.add(sum, one);

        assert_eq!(ir.value(one).uses().len(), 2);
        assert_eq!(ir.value(two).uses().len(), 1);
        assert_eq!(ir.value(sum).uses().len(), 1);
        #[cfg(debug_assertions)]
        ir.assert_well_formed();
    }

    #[test]
    fn replace_uses_rewrites_every_slot() {
        let mut ir = Ir::new();
        let b = ir.append_block();
        ir.set_current_block(b);
        let a = ir.const_i32(10);
        let c = ir.const_i32(20);
        let x = ir.add(a, a);
        let y = ir.sub(x, a);

        ir.replace_uses(a, c);

        assert!(ir.value(a).uses().is_empty());
        assert_eq!(ir.value(c).uses().len(), 3);
        let def_x = ir.value(x).def().unwrap();
        assert_eq!(ir.inst(def_x).arg(0), Some(c));
        assert_eq!(ir.inst(def_x).arg(1), Some(c));
        let def_y = ir.value(y).def().unwrap();
        assert_eq!(ir.inst(def_y).arg(1), Some(c));
        #[cfg(debug_assertions)]
        ir.assert_well_formed();
    }

    #[test]
    fn remove_inst_detaches_uses() {
        let mut ir = Ir::new();
        let b = ir.append_block();
        ir.set_current_block(b);
        let a = ir.const_i32(1);
        let x = ir.add(a, a);
        let def = ir.value(x).def().unwrap();

        ir.remove_inst(def);

        assert!(ir.value(a).uses().is_empty());
        assert_eq!(ir.block_insts(b).len(), 0);
    }

    #[test]
    fn insert_point_scopes_emission() {
        let mut ir = Ir::new();
        let b0 = ir.append_block();
        let b1 = ir.append_block();
        ir.set_current_block(b0);
        let a = ir.const_i32(1);
        let _ = ir.add(a, a);

        // Emit into b1 then restore; the next instruction must land in b0.
        let saved = ir.insert_point();
        ir.set_current_block(b1);
        ir.debug_break();
        ir.set_insert_point(saved);
        let _ = ir.sub(a, a);

        assert_eq!(ir.block_insts(b0).len(), 2);
        assert_eq!(ir.block_insts(b1).len(), 1);
        assert_eq!(
            ir.inst(ir.block_insts(b0)[1]).op,
            Opcode::Sub
        );
    }

    #[test]
    fn locals_are_aligned() {
        let mut ir = Ir::new();
        let l8 = ir.alloc_local(Ty::I8);
        let l32 = ir.alloc_local(Ty::I32);
        assert_eq!(ir.zext_constant(ir.local(l8).offset), 0);
        assert_eq!(ir.zext_constant(ir.local(l32).offset), 4);
        assert_eq!(ir.locals_size, 8);
    }
}
