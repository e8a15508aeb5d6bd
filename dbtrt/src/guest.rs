//! The interface the emulated guest CPU provides to the runtime.
//!
//! The runtime never owns guest memory or the dispatch machinery: both
//! belong to the CPU shell driving it. Everything the translator needs from
//! the guest is expressed through the [Guest] trait so that the coordinator
//! and the frontends can be exercised against a purely in-memory fake.

use crate::{GuestAddr, HostAddr};

/// The addresses of the runtime glue routines that compiled code branches to
/// when it cannot jump directly to another compiled block.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchTable {
    /// Looks up the next block by the guest `pc` stored in the context and
    /// jumps to it, compiling on a miss.
    pub dynamic: HostAddr,
    /// As [Self::dynamic], but the branch site is eligible for edge
    /// patching: the thunk reports the branch back via `Jit::add_edge`.
    pub static_: HostAddr,
    /// Returns control to the guest's run loop.
    pub leave: HostAddr,
    /// Services pending interrupts, then re-enters dispatch.
    pub interrupt: HostAddr,
}

/// Services supplied by the emulated guest CPU.
pub trait Guest {
    /* memory interface */
    fn r8(&self, addr: GuestAddr) -> u8;
    fn r16(&self, addr: GuestAddr) -> u16;
    fn r32(&self, addr: GuestAddr) -> u32;
    fn r64(&self, addr: GuestAddr) -> u64;
    fn w8(&mut self, addr: GuestAddr, v: u8);
    fn w16(&mut self, addr: GuestAddr, v: u16);
    fn w32(&mut self, addr: GuestAddr, v: u32);
    fn w64(&mut self, addr: GuestAddr, v: u64);

    /* dispatch interface */

    /// Return the host code currently cached for `addr`, if any.
    fn lookup_code(&self, addr: GuestAddr) -> Option<HostAddr>;

    /// Install `host` as the direct-dispatch target for `addr`.
    fn cache_code(&mut self, addr: GuestAddr, host: HostAddr);

    /// Drop `addr` from the direct-dispatch cache.
    fn invalidate_code(&mut self, addr: GuestAddr);

    /// Rewrite the branch instruction at `branch` to jump straight to
    /// `dst`. Must be safe to perform on a live code page.
    fn patch_edge(&mut self, branch: HostAddr, dst: HostAddr);

    /// Undo [Self::patch_edge]: rewrite the branch at `branch` to dispatch
    /// on the guest address `dst` again.
    fn restore_edge(&mut self, branch: HostAddr, dst: GuestAddr);

    /// The dispatch thunks compiled code falls back on.
    fn dispatch(&self) -> DispatchTable;
}

/// A host fault delivered to the runtime by the process' exception handler
/// plumbing.
#[derive(Clone, Copy, Debug)]
pub struct Exception {
    /// The host pc the fault was raised at.
    pub pc: HostAddr,
    /// The host address whose access faulted.
    pub fault_addr: HostAddr,
}
