//! The host code generator interface.
//!
//! A backend assembles finalised IR into a bounded host code buffer and owns
//! everything host-ISA specific: the register bank description consumed by
//! register allocation, the entry/exit glue, and the fastmem fault pads that
//! [Backend::handle_exception] patches to slow-path calls when a guarded
//! access traps. The emitters themselves live with their host platforms;
//! this crate only consumes the trait.

use crate::{guest::Exception, ir::Ir, jit::Code, HostAddr};

#[cfg(test)]
pub(crate) mod testing;

/// One host register, as described by the backend for register allocation.
#[derive(Clone, Copy, Debug)]
pub struct RegisterDesc {
    pub name: &'static str,
    /// A bit mask of [crate::ir::Ty] values this register can hold (see
    /// [crate::ir::type_mask]).
    pub value_types: u16,
}

/// Where an assembled block landed.
#[derive(Clone, Copy, Debug)]
pub struct AssembledCode {
    pub host_addr: HostAddr,
    pub host_size: u32,
}

/// The backend's code buffer is exhausted. The coordinator responds by
/// freeing the whole cache and letting dispatch retry the compilation.
#[derive(Clone, Copy, Debug)]
pub struct CodeBufferFull;

pub trait Backend {
    /// Drop all emitted code and reset emitter state.
    fn reset(&mut self);

    /// Assemble `ir` into the code buffer. `code` provides the guest address
    /// and the fastmem flag for the translation.
    fn assemble_code(&mut self, code: &Code, ir: &Ir) -> Result<AssembledCode, CodeBufferFull>;

    /// Attempt to handle a host fault. Returns true iff the faulting pc was
    /// a fastmem access site this backend emitted, in which case the site
    /// has been patched to its slow path.
    fn handle_exception(&mut self, ex: &Exception) -> bool;

    /// Disassemble emitted code for debugging.
    fn dump_code(&self, addr: HostAddr, size: u32);

    /// The register bank register allocation hands out from.
    fn registers(&self) -> &[RegisterDesc];
}
