//! The guest ISA frontends.
//!
//! A frontend knows how to do three things for its ISA: analyse one basic
//! block's worth of guest code (producing a [BlockMeta]), emit IR for a
//! whole compile-unit tree, and print a disassembly listing for debugging.
//! Everything else (caching, optimisation, assembly) is ISA-independent and
//! lives with the [coordinator](crate::jit).

pub mod armv3;
pub mod sh4;

use crate::{
    guest::Guest,
    ir::Ir,
    jit::{Code, CodeId, UnitId},
    GuestAddr, INVALID_ADDR,
};
use std::collections::BTreeMap;

/// How a block's terminating instruction transfers control.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BranchKind {
    /// No branch: the block ends because of an instruction with
    /// side effects on interrupt or FPU state.
    #[default]
    FallThrough,
    /// Unconditional branch to a statically known address.
    Static,
    /// Conditional branch, taken when the condition is true.
    StaticTrue,
    /// Conditional branch, taken when the condition is false.
    StaticFalse,
    /// Unconditional branch to a runtime-computed address.
    Dynamic,
    /// Conditional branch to a runtime-computed address, on true.
    DynamicTrue,
    /// Conditional branch to a runtime-computed address, on false.
    DynamicFalse,
}

/// Cached analysis of the basic block starting at a guest address.
#[derive(Clone, Debug)]
pub struct BlockMeta {
    /// Address of the block in guest memory.
    pub guest_addr: GuestAddr,
    /// Classification of the terminating branch.
    pub branch_kind: BranchKind,
    /// Destination of the terminating branch, if statically known.
    pub branch_addr: GuestAddr,
    /// Address of the next instruction after the branch.
    pub next_addr: GuestAddr,
    /// Number of guest instructions in the block.
    pub num_instrs: u32,
    /// Estimated cycles to execute the block.
    pub num_cycles: u32,
    /// Size of the block in bytes.
    pub size: u32,
    /// The compile units currently referencing this meta.
    pub compile_refs: Vec<(CodeId, UnitId)>,
    /// Stamp of the analysis walk that last visited this meta.
    pub visited: u64,
}

impl BlockMeta {
    pub fn new(guest_addr: GuestAddr) -> Self {
        BlockMeta {
            guest_addr,
            branch_kind: BranchKind::FallThrough,
            branch_addr: INVALID_ADDR,
            next_addr: INVALID_ADDR,
            num_instrs: 0,
            num_cycles: 0,
            size: 0,
            compile_refs: Vec::new(),
            visited: 0,
        }
    }
}

pub trait Frontend {
    /// Decode guest instructions from `meta.guest_addr` until a block
    /// terminator, filling in the meta's branch classification and counts.
    /// Returns false if analysis cannot complete (e.g. the opening
    /// instruction is invalid because the code hasn't been written yet).
    fn analyze_code(&self, guest: &dyn Guest, meta: &mut BlockMeta) -> bool;

    /// Emit IR for `code`'s whole compile-unit tree.
    fn translate_code(
        &self,
        guest: &dyn Guest,
        metas: &BTreeMap<GuestAddr, BlockMeta>,
        code: &mut Code,
        ir: &mut Ir,
    );

    /// Log a disassembly of `size` bytes of guest code at `addr`.
    fn dump_code(&self, guest: &dyn Guest, addr: GuestAddr, size: u32);
}
