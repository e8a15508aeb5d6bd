//! Test doubles shared across the crate's unit tests.

use crate::{
    guest::{DispatchTable, Guest},
    GuestAddr, HostAddr,
};
use std::{cell::RefCell, collections::HashMap, rc::Rc};

/// Everything observable the coordinator asked the guest to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GuestEvent {
    CacheCode(GuestAddr, HostAddr),
    InvalidateCode(GuestAddr),
    PatchEdge(HostAddr, HostAddr),
    RestoreEdge(HostAddr, GuestAddr),
}

#[derive(Debug, Default)]
pub(crate) struct GuestState {
    mem: HashMap<GuestAddr, u8>,
    cache: HashMap<GuestAddr, HostAddr>,
    pub events: Vec<GuestEvent>,
}

/// An in-memory [Guest]: sparse byte memory, a dispatch cache map, and an
/// event log. Clones share state, so tests can keep a handle while the
/// coordinator owns the other.
#[derive(Clone)]
pub(crate) struct TestGuest {
    state: Rc<RefCell<GuestState>>,
    dispatch: DispatchTable,
}

impl TestGuest {
    pub(crate) fn new() -> Self {
        TestGuest {
            state: Rc::new(RefCell::new(GuestState::default())),
            dispatch: DispatchTable {
                dynamic: HostAddr(0x1000),
                static_: HostAddr(0x2000),
                leave: HostAddr(0x3000),
                interrupt: HostAddr(0x4000),
            },
        }
    }

    pub(crate) fn write16(&self, addr: GuestAddr, v: u16) {
        let mut st = self.state.borrow_mut();
        for (i, b) in v.to_le_bytes().into_iter().enumerate() {
            st.mem.insert(addr + i as u32, b);
        }
    }

    pub(crate) fn write32(&self, addr: GuestAddr, v: u32) {
        let mut st = self.state.borrow_mut();
        for (i, b) in v.to_le_bytes().into_iter().enumerate() {
            st.mem.insert(addr + i as u32, b);
        }
    }

    pub(crate) fn events(&self) -> Vec<GuestEvent> {
        self.state.borrow().events.clone()
    }
}

impl Guest for TestGuest {
    fn r8(&self, addr: GuestAddr) -> u8 {
        *self.state.borrow().mem.get(&addr).unwrap_or(&0)
    }

    fn r16(&self, addr: GuestAddr) -> u16 {
        u16::from_le_bytes([self.r8(addr), self.r8(addr + 1)])
    }

    fn r32(&self, addr: GuestAddr) -> u32 {
        u32::from_le_bytes([
            self.r8(addr),
            self.r8(addr + 1),
            self.r8(addr + 2),
            self.r8(addr + 3),
        ])
    }

    fn r64(&self, addr: GuestAddr) -> u64 {
        u64::from(self.r32(addr)) | (u64::from(self.r32(addr + 4)) << 32)
    }

    fn w8(&mut self, addr: GuestAddr, v: u8) {
        self.state.borrow_mut().mem.insert(addr, v);
    }

    fn w16(&mut self, addr: GuestAddr, v: u16) {
        self.write16(addr, v);
    }

    fn w32(&mut self, addr: GuestAddr, v: u32) {
        self.write32(addr, v);
    }

    fn w64(&mut self, addr: GuestAddr, v: u64) {
        self.write32(addr, v as u32);
        self.write32(addr + 4, (v >> 32) as u32);
    }

    fn lookup_code(&self, addr: GuestAddr) -> Option<HostAddr> {
        self.state.borrow().cache.get(&addr).copied()
    }

    fn cache_code(&mut self, addr: GuestAddr, host: HostAddr) {
        let mut st = self.state.borrow_mut();
        st.cache.insert(addr, host);
        st.events.push(GuestEvent::CacheCode(addr, host));
    }

    fn invalidate_code(&mut self, addr: GuestAddr) {
        let mut st = self.state.borrow_mut();
        st.cache.remove(&addr);
        st.events.push(GuestEvent::InvalidateCode(addr));
    }

    fn patch_edge(&mut self, branch: HostAddr, dst: HostAddr) {
        self.state
            .borrow_mut()
            .events
            .push(GuestEvent::PatchEdge(branch, dst));
    }

    fn restore_edge(&mut self, branch: HostAddr, dst: GuestAddr) {
        self.state
            .borrow_mut()
            .events
            .push(GuestEvent::RestoreEdge(branch, dst));
    }

    fn dispatch(&self) -> DispatchTable {
        self.dispatch
    }
}
