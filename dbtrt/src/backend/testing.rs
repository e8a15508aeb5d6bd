//! A [Backend] double for coordinator tests.
//!
//! "Assembles" by carving fake host address ranges out of a bounded
//! buffer, can be programmed to overflow, and handles (or declines) faults
//! on request. Clones share state so tests keep a handle after moving one
//! into the coordinator.

use super::{AssembledCode, Backend, CodeBufferFull, RegisterDesc};
use crate::{
    guest::Exception,
    ir::{type_mask, Ir},
    jit::Code,
    HostAddr,
};
use std::{cell::RefCell, rc::Rc};

const BASE: u64 = 0x10_0000;

static REGISTERS: [RegisterDesc; 8] = [
    RegisterDesc {
        name: "r0",
        value_types: type_mask::INT,
    },
    RegisterDesc {
        name: "r1",
        value_types: type_mask::INT,
    },
    RegisterDesc {
        name: "r2",
        value_types: type_mask::INT,
    },
    RegisterDesc {
        name: "r3",
        value_types: type_mask::INT,
    },
    RegisterDesc {
        name: "r4",
        value_types: type_mask::INT,
    },
    RegisterDesc {
        name: "r5",
        value_types: type_mask::INT,
    },
    RegisterDesc {
        name: "f0",
        value_types: type_mask::FLOAT | type_mask::VECTOR,
    },
    RegisterDesc {
        name: "f1",
        value_types: type_mask::FLOAT | type_mask::VECTOR,
    },
];

#[derive(Debug, Default)]
pub(crate) struct BackendState {
    next: u64,
    pub resets: usize,
    pub assembles: usize,
    /// When set, every assemble reports a full buffer.
    pub overflow: bool,
    /// What `handle_exception` should claim.
    pub handle_faults: bool,
    /// Every fault pc the backend was asked about.
    pub faults_seen: Vec<HostAddr>,
}

#[derive(Clone)]
pub(crate) struct TestBackend {
    state: Rc<RefCell<BackendState>>,
}

impl TestBackend {
    pub(crate) fn new() -> Self {
        TestBackend {
            state: Rc::new(RefCell::new(BackendState {
                next: BASE,
                handle_faults: true,
                ..Default::default()
            })),
        }
    }

    pub(crate) fn set_overflow(&self, overflow: bool) {
        self.state.borrow_mut().overflow = overflow;
    }

    pub(crate) fn set_handle_faults(&self, handle: bool) {
        self.state.borrow_mut().handle_faults = handle;
    }

    pub(crate) fn resets(&self) -> usize {
        self.state.borrow().resets
    }
}

impl Backend for TestBackend {
    fn reset(&mut self) {
        let mut st = self.state.borrow_mut();
        st.resets += 1;
        st.next = BASE;
    }

    fn assemble_code(&mut self, _code: &Code, ir: &Ir) -> Result<AssembledCode, CodeBufferFull> {
        let mut st = self.state.borrow_mut();
        if st.overflow {
            return Err(CodeBufferFull);
        }
        st.assembles += 1;
        let host_addr = HostAddr(st.next);
        let host_size = 16 + 4 * ir.num_insts() as u32;
        st.next += u64::from(host_size);
        Ok(AssembledCode {
            host_addr,
            host_size,
        })
    }

    fn handle_exception(&mut self, ex: &Exception) -> bool {
        let mut st = self.state.borrow_mut();
        st.faults_seen.push(ex.pc);
        st.handle_faults
    }

    fn dump_code(&self, _addr: HostAddr, _size: u32) {}

    fn registers(&self) -> &[RegisterDesc] {
        &REGISTERS
    }
}
