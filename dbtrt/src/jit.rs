//! The JIT coordinator.
//!
//! Owns the code cache and drives a compilation end to end: analyse the
//! guest control flow into a compile-unit tree, have the frontend emit IR,
//! run the optimisation pipeline, hand the IR to the backend, and register
//! the result for dispatch. It also services the two re-entrant paths that
//! arrive from *inside* executing compiled code: direct-branch edge
//! discovery ([Jit::add_edge]) and fastmem fault recovery
//! ([Jit::handle_exception]).
//!
//! ## Cache structure
//!
//! Compiled code is held in a slab ([`Jit::codes`]) and indexed two ways: a
//! forward map keyed by guest address and a reverse map keyed by host
//! address, the latter answering "which code contains this host pc?" range
//! queries for fault handling and edge discovery. Block analysis results
//! ([BlockMeta]) are cached separately and can outlive any particular
//! compilation of their address.
//!
//! ## Invalidation vs freeing
//!
//! Invalidation is deliberately two-phase. `invalidate_code` strips a code
//! of its compile units and edges and removes it from the guest's dispatch
//! cache, but leaves it in both lookup maps: the code may still be running
//! on the host stack (this is exactly the fastmem fault case) and must keep
//! resolving reverse lookups until the frame unwinds. Tombstoned entries are
//! reaped by the next `free_cache`.

use crate::{
    backend::Backend,
    frontend::{BlockMeta, Frontend},
    guest::{Exception, Guest},
    ir::{Ir, ValueIdx},
    log::{log_jit_event, log_warning},
    GuestAddr, HostAddr, INVALID_ADDR,
};
use std::{
    collections::BTreeMap,
    env,
    error::Error,
    fmt, fs,
    io::Write,
    path::PathBuf,
};

/// A failure to compile a guest block.
#[derive(Debug)]
pub enum CompilationError {
    /// The guest code at the requested address could not be analysed (e.g.
    /// it has not been written to memory yet). Dispatch will simply retry
    /// on the next hit.
    General(String),
    /// Something that suggests a bug in the runtime itself.
    InternalError(String),
    /// The backend's code buffer overflowed. The whole cache has been freed
    /// and the next dispatch hit retries from scratch.
    ResourceExhausted(String),
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationError::General(s) => write!(f, "General error: {s}"),
            CompilationError::InternalError(s) => write!(f, "Internal error: {s}"),
            CompilationError::ResourceExhausted(s) => write!(f, "Resource exhausted: {s}"),
        }
    }
}

impl Error for CompilationError {}

macro_rules! handle_newtype {
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

handle_newtype!(CodeId);
handle_newtype!(UnitId);
handle_newtype!(EdgeId);

/// One node of a compilation's unit tree: a [BlockMeta] scheduled for
/// translation, with up to two children along the taken and fall-through
/// paths. The tree is finite because the analysis walk cuts off any address
/// it has already visited in the current compilation.
#[derive(Debug)]
pub struct CompileUnit {
    /// Guest address of the meta this unit translates.
    pub meta_addr: GuestAddr,
    /// The taken path, if compiled into this code.
    pub branch: Option<UnitId>,
    /// The fall-through path, if compiled into this code.
    pub next: Option<UnitId>,
    /// For conditional branches: the IR value of the branch condition. Set
    /// by the frontend during translation; meaningless outside it.
    pub branch_cond: Option<ValueIdx>,
    /// For dynamic branches: the IR value of the destination address.
    pub branch_dest: Option<ValueIdx>,
}

/// A patched (or patchable) direct branch between two compiled codes.
#[derive(Debug)]
pub struct Edge {
    pub src: CodeId,
    pub dst: CodeId,
    /// Host address of the branch instruction.
    pub branch: HostAddr,
    pub patched: bool,
}

/// One compiled native artifact for one guest entry point.
#[derive(Debug)]
pub struct Code {
    /// Address of the entry point in guest memory.
    pub guest_addr: GuestAddr,
    /// Translate with fastmem optimisations? Monotone non-increasing over
    /// the code's lifetime: cleared on the first fastmem fault, never set
    /// again except by building a new code.
    pub fastmem: bool,
    /// Where the assembled code landed.
    pub host_addr: HostAddr,
    pub host_size: u32,
    /// The compile-unit tree, rooted at [Self::root].
    units: Vec<CompileUnit>,
    pub root: Option<UnitId>,
    /// Edges from other codes into this one.
    pub in_edges: Vec<EdgeId>,
    /// Edges from this code into others.
    pub out_edges: Vec<EdgeId>,
}

impl Code {
    fn new(guest_addr: GuestAddr, fastmem: bool) -> Self {
        Code {
            guest_addr,
            fastmem,
            host_addr: HostAddr(0),
            host_size: 0,
            units: Vec::new(),
            root: None,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
        }
    }

    pub fn unit(&self, id: UnitId) -> &CompileUnit {
        &self.units[usize::from(id)]
    }

    pub fn unit_mut(&mut self, id: UnitId) -> &mut CompileUnit {
        &mut self.units[usize::from(id)]
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    fn add_unit(&mut self, meta_addr: GuestAddr) -> UnitId {
        let id = UnitId::try_from(self.units.len()).unwrap();
        self.units.push(CompileUnit {
            meta_addr,
            branch: None,
            next: None,
            branch_cond: None,
            branch_dest: None,
        });
        id
    }
}

/// Coordinator configuration.
#[derive(Debug)]
pub struct Options {
    /// Short name used in log lines and perf map symbols (e.g. the guest
    /// CPU's name).
    pub tag: String,
    /// Append a line per finalised code to `/tmp/perf-<pid>.map`.
    pub perf: bool,
    /// If set, write each block's pre-optimisation IR to
    /// `<dir>/0x<guest_addr>.ir`.
    pub dump_ir: Option<PathBuf>,
}

impl Options {
    pub fn new(tag: &str) -> Self {
        Options {
            tag: tag.to_owned(),
            perf: false,
            dump_ir: None,
        }
    }

    /// Read `DBT_PERF` and `DBT_DUMP_IR` from the environment.
    pub fn from_env(tag: &str) -> Self {
        Options {
            tag: tag.to_owned(),
            perf: env::var("DBT_PERF").map(|v| v != "0").unwrap_or(false),
            dump_ir: env::var("DBT_DUMP_IR").ok().map(PathBuf::from),
        }
    }
}

/// The JIT coordinator: one per emulated guest CPU.
pub struct Jit {
    options: Options,
    guest: Box<dyn Guest>,
    frontend: Box<dyn Frontend>,
    backend: Box<dyn Backend>,

    /// Owned storage for all live (and tombstoned) codes.
    codes: Vec<Option<Code>>,
    code_free: Vec<CodeId>,
    /// Owned storage for edges; an edge dies with either endpoint.
    edges: Vec<Option<Edge>>,
    edge_free: Vec<EdgeId>,

    /// Forward lookup: guest address -> code.
    code_map: BTreeMap<GuestAddr, CodeId>,
    /// Reverse lookup: host address of the code's start -> code. Queried by
    /// range, since callers hold addresses *inside* a code.
    reverse_map: BTreeMap<HostAddr, CodeId>,
    /// Analysis cache, keyed by guest address.
    metas: BTreeMap<GuestAddr, BlockMeta>,

    /// Stamp distinguishing one analysis walk from the next.
    visit_token: u64,

    /// Scratch IR, reused across compilations.
    ir: Ir,

    perf_map: Option<fs::File>,
}

impl Jit {
    pub fn new(
        options: Options,
        guest: Box<dyn Guest>,
        frontend: Box<dyn Frontend>,
        backend: Box<dyn Backend>,
    ) -> Result<Self, Box<dyn Error>> {
        let perf_map = if options.perf {
            let path = format!("/tmp/perf-{}.map", std::process::id());
            Some(fs::OpenOptions::new().create(true).append(true).open(path)?)
        } else {
            None
        };

        Ok(Jit {
            options,
            guest,
            frontend,
            backend,
            codes: Vec::new(),
            code_free: Vec::new(),
            edges: Vec::new(),
            edge_free: Vec::new(),
            code_map: BTreeMap::new(),
            reverse_map: BTreeMap::new(),
            metas: BTreeMap::new(),
            visit_token: 0,
            ir: Ir::new(),
            perf_map,
        })
    }

    /* accessors */

    pub fn code(&self, id: CodeId) -> &Code {
        self.codes[usize::from(id)]
            .as_ref()
            .expect("use of freed code")
    }

    fn code_mut(&mut self, id: CodeId) -> &mut Code {
        self.codes[usize::from(id)]
            .as_mut()
            .expect("use of freed code")
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges[usize::from(id)]
            .as_ref()
            .expect("use of freed edge")
    }

    pub fn meta(&self, addr: GuestAddr) -> Option<&BlockMeta> {
        self.metas.get(&addr)
    }

    pub fn num_codes(&self) -> usize {
        self.code_map.len()
    }

    pub fn num_metas(&self) -> usize {
        self.metas.len()
    }

    /// The code compiled for `addr`, if any (including tombstoned entries).
    pub fn lookup_code(&self, addr: GuestAddr) -> Option<CodeId> {
        self.code_map.get(&addr).copied()
    }

    /// Find the code whose emitted range contains `host`. `host` may be any
    /// address inside the code, not only the entry.
    pub fn lookup_code_reverse(&self, host: HostAddr) -> Option<CodeId> {
        let (_, &id) = self.reverse_map.range(..=host).next_back()?;
        let code = self.code(id);
        if host >= code.host_addr && host < code.host_addr.end(code.host_size) {
            Some(id)
        } else {
            None
        }
    }

    /// Is the guest's dispatch cache no longer pointing at this code?
    fn is_stale(&self, id: CodeId) -> bool {
        let code = self.code(id);
        self.guest.lookup_code(code.guest_addr) != Some(code.host_addr)
    }

    /* compilation */

    /// Compile the guest block graph reachable from `guest_addr` and
    /// register the result for dispatch. An existing code at this address
    /// is freed first: recompilation is invalidation, not appending.
    pub fn compile_code(&mut self, guest_addr: GuestAddr) -> Result<CodeId, CompilationError> {
        log_jit_event(&format!(
            "compile_code {} 0x{guest_addr:08x}",
            self.options.tag
        ));

        // Fastmem makes SIGSEGV handling part of normal operation, which is
        // miserable to run under a debugger. Debug builds turn it off.
        let mut fastmem = true;
        if cfg!(debug_assertions) {
            fastmem = false;
        }

        // If this address was previously invalidated by a fastmem fault,
        // finish freeing it now and keep fastmem off for the replacement.
        if let Some(existing) = self.lookup_code(guest_addr) {
            fastmem = self.code(existing).fastmem;
            self.free_code(existing);
        }

        let id = self.alloc_code(guest_addr, fastmem);

        if !self.analyze_code(id) {
            self.free_code(id);
            return Err(CompilationError::General(format!(
                "analysis failed at 0x{guest_addr:08x}"
            )));
        }

        self.ir.reset();
        {
            let Jit {
                guest,
                frontend,
                codes,
                metas,
                ir,
                ..
            } = self;
            let code = codes[usize::from(id)].as_mut().expect("use of freed code");
            frontend.translate_code(&**guest, metas, code, ir);
        }

        if self.options.dump_ir.is_some() {
            self.dump_ir(guest_addr);
        }

        {
            let Jit { backend, ir, .. } = self;
            crate::opt::run_all(ir, backend.registers());
        }

        let assembled = {
            let Jit {
                backend, codes, ir, ..
            } = self;
            let code = codes[usize::from(id)].as_ref().expect("use of freed code");
            backend.assemble_code(code, ir)
        };

        match assembled {
            Ok(asm) => {
                let code = self.code_mut(id);
                code.host_addr = asm.host_addr;
                code.host_size = asm.host_size;
                self.finalize_code(id);
                Ok(id)
            }
            Err(_) => {
                // The guest dispatcher retries the compilation on its next
                // hit, against an empty buffer.
                log_jit_event("backend overflow, resetting code cache");
                self.free_code(id);
                self.free_cache();
                Err(CompilationError::ResourceExhausted(format!(
                    "code buffer overflow compiling 0x{guest_addr:08x}"
                )))
            }
        }
    }

    fn alloc_code(&mut self, guest_addr: GuestAddr, fastmem: bool) -> CodeId {
        let code = Code::new(guest_addr, fastmem);
        match self.code_free.pop() {
            Some(id) => {
                self.codes[usize::from(id)] = Some(code);
                id
            }
            None => {
                let id = CodeId::try_from(self.codes.len()).unwrap();
                self.codes.push(Some(code));
                id
            }
        }
    }

    /// Walk the guest CFG from the code's entry, building its compile-unit
    /// tree. Returns false if even the root is unanalyzable.
    fn analyze_code(&mut self, id: CodeId) -> bool {
        self.visit_token += 1;
        let entry = self.code(id).guest_addr;
        let root = self.analyze_code_r(id, entry);
        self.code_mut(id).root = root;
        root.is_some()
    }

    fn analyze_code_r(&mut self, id: CodeId, guest_addr: GuestAddr) -> Option<UnitId> {
        if guest_addr == INVALID_ADDR {
            return None;
        }

        if let Some(meta) = self.metas.get(&guest_addr) {
            // Don't allow control flow to rejoin: each meta appears at most
            // once per compile-unit tree.
            if meta.visited == self.visit_token {
                return None;
            }
        } else {
            let mut meta = BlockMeta::new(guest_addr);
            // Analysis fails during bootstrap when a branch target is
            // discovered before the guest has written its code out.
            if !self.frontend.analyze_code(&*self.guest, &mut meta) {
                return None;
            }
            self.metas.insert(guest_addr, meta);
        }

        let meta = self.metas.get_mut(&guest_addr).unwrap();
        meta.visited = self.visit_token;
        let (branch_addr, next_addr) = (meta.branch_addr, meta.next_addr);

        let unit = self.code_mut(id).add_unit(guest_addr);
        self.metas
            .get_mut(&guest_addr)
            .unwrap()
            .compile_refs
            .push((id, unit));

        let branch = self.analyze_code_r(id, branch_addr);
        let next = self.analyze_code_r(id, next_addr);
        let u = self.code_mut(id).unit_mut(unit);
        u.branch = branch;
        u.next = next;

        Some(unit)
    }

    fn finalize_code(&mut self, id: CodeId) {
        let code = self.code(id);
        assert!(
            code.in_edges.is_empty() && code.out_edges.is_empty(),
            "code shouldn't have any existing edges"
        );
        assert!(
            !self.code_map.contains_key(&code.guest_addr)
                && !self.reverse_map.contains_key(&code.host_addr),
            "code was already inserted in lookup maps"
        );

        let (guest_addr, host_addr, host_size) = (code.guest_addr, code.host_addr, code.host_size);
        self.guest.cache_code(guest_addr, host_addr);
        self.code_map.insert(guest_addr, id);
        self.reverse_map.insert(host_addr, id);

        if let Some(perf_map) = &mut self.perf_map {
            let _ = writeln!(
                perf_map,
                "{:x} {:x} {}_0x{:08x}",
                host_addr.0, host_size, self.options.tag, guest_addr
            );
        }
    }

    fn dump_ir(&self, guest_addr: GuestAddr) {
        let Some(dir) = &self.options.dump_ir else {
            return;
        };
        let res = fs::create_dir_all(dir).and_then(|()| {
            fs::write(
                dir.join(format!("0x{guest_addr:08x}.ir")),
                self.ir.to_string(),
            )
        });
        if let Err(e) = res {
            log_warning(&format!("failed to dump ir for 0x{guest_addr:08x}: {e}"));
        }
    }

    /* edges */

    /// Record a direct branch, discovered at run-time, from the compiled
    /// code containing `branch` to the code at guest address `dst`. Called
    /// re-entrantly from executing compiled code; drops silently if either
    /// end is gone or stale.
    pub fn add_edge(&mut self, branch: HostAddr, dst: GuestAddr) {
        let Some(src) = self.lookup_code_reverse(branch) else {
            return;
        };
        let Some(dst) = self.lookup_code(dst) else {
            return;
        };
        if self.is_stale(src) {
            return;
        }

        let edge = Edge {
            src,
            dst,
            branch,
            patched: false,
        };
        let eid = match self.edge_free.pop() {
            Some(eid) => {
                self.edges[usize::from(eid)] = Some(edge);
                eid
            }
            None => {
                let eid = EdgeId::try_from(self.edges.len()).unwrap();
                self.edges.push(Some(edge));
                eid
            }
        };
        self.code_mut(src).out_edges.push(eid);
        self.code_mut(dst).in_edges.push(eid);

        self.patch_edges(src);
    }

    /// Rewrite every unpatched branch into and out of `id` to jump directly
    /// to its destination's host code. Idempotent via the per-edge flag.
    fn patch_edges(&mut self, id: CodeId) {
        let mut all = self.code(id).in_edges.clone();
        all.extend_from_slice(&self.code(id).out_edges);
        for eid in all {
            let (patched, branch, dst) = {
                let e = self.edge(eid);
                (e.patched, e.branch, e.dst)
            };
            if !patched {
                let dst_host = self.code(dst).host_addr;
                self.edges[usize::from(eid)].as_mut().unwrap().patched = true;
                self.guest.patch_edge(branch, dst_host);
            }
        }
    }

    /// Restore every patched *incoming* branch to dispatch through the
    /// destination's guest address again. Used before a code becomes
    /// unreachable.
    fn restore_edges(&mut self, id: CodeId) {
        for eid in self.code(id).in_edges.clone() {
            let (patched, branch, dst) = {
                let e = self.edge(eid);
                (e.patched, e.branch, e.dst)
            };
            if patched {
                let dst_guest = self.code(dst).guest_addr;
                self.edges[usize::from(eid)].as_mut().unwrap().patched = false;
                self.guest.restore_edge(branch, dst_guest);
            }
        }
    }

    /* invalidation */

    /// Strip `id` of its compile units, dispatch cache entry and edges, but
    /// leave it in the lookup maps: it may still be executing on the host
    /// stack and raise further faults before its frame unwinds. Idempotent.
    pub fn invalidate_code(&mut self, id: CodeId) {
        // Free the compile-unit tree, detaching each unit from its meta.
        let units = std::mem::take(&mut self.code_mut(id).units);
        self.code_mut(id).root = None;
        for unit in &units {
            let meta = self
                .metas
                .get_mut(&unit.meta_addr)
                .expect("compile unit references a freed meta");
            meta.compile_refs.retain(|(c, _)| *c != id);
        }

        let guest_addr = self.code(id).guest_addr;
        self.guest.invalidate_code(guest_addr);

        self.restore_edges(id);

        for eid in std::mem::take(&mut self.code_mut(id).in_edges) {
            let Some(e) = self.edges[usize::from(eid)].take() else {
                continue;
            };
            self.code_mut(e.src).out_edges.retain(|x| *x != eid);
            self.edge_free.push(eid);
        }
        for eid in std::mem::take(&mut self.code_mut(id).out_edges) {
            let Some(e) = self.edges[usize::from(eid)].take() else {
                continue;
            };
            self.code_mut(e.dst).in_edges.retain(|x| *x != eid);
            self.edge_free.push(eid);
        }
    }

    /// Invalidate `id` and remove it from the lookup maps and the slab.
    /// Only safe when the code is not executing.
    pub fn free_code(&mut self, id: CodeId) {
        self.invalidate_code(id);

        let (guest_addr, host_addr) = {
            let code = self.code(id);
            (code.guest_addr, code.host_addr)
        };
        if self.code_map.get(&guest_addr) == Some(&id) {
            self.code_map.remove(&guest_addr);
        }
        if self.reverse_map.get(&host_addr) == Some(&id) {
            self.reverse_map.remove(&host_addr);
        }

        self.codes[usize::from(id)] = None;
        self.code_free.push(id);
    }

    /// Invalidate every code without removing lookup map entries. This is
    /// the "clear the cache while code is executing" path: a frame on the
    /// host stack keeps resolving its own reverse lookups until it unwinds.
    pub fn invalidate_cache(&mut self) {
        for id in self.live_code_ids() {
            self.invalidate_code(id);
        }

        // Every compile unit is gone now, so no meta can have refs left and
        // the analysis cache can be dropped wholesale.
        for (_, meta) in std::mem::take(&mut self.metas) {
            assert!(
                meta.compile_refs.is_empty(),
                "meta freed while compile units reference it"
            );
        }
    }

    /// Free every code and meta and reset the backend's buffers. Only safe
    /// when no compiled code is executing.
    pub fn free_cache(&mut self) {
        for id in self.live_code_ids() {
            self.free_code(id);
        }
        assert!(self.code_map.is_empty() && self.reverse_map.is_empty());

        for (_, meta) in std::mem::take(&mut self.metas) {
            assert!(
                meta.compile_refs.is_empty(),
                "meta freed while compile units reference it"
            );
        }

        self.backend.reset();
    }

    fn live_code_ids(&self) -> Vec<CodeId> {
        (0..self.codes.len())
            .filter(|i| self.codes[*i].is_some())
            .map(|i| CodeId::try_from(i).unwrap())
            .collect()
    }

    /* faults */

    /// Process-wide fault callback: returns true iff the fault was a
    /// fastmem access in compiled code and has been recovered. The code is
    /// invalidated but kept in the lookup maps; the next compilation of its
    /// guest address rebuilds it with fastmem off.
    pub fn handle_exception(&mut self, ex: &Exception) -> bool {
        let Some(id) = self.lookup_code_reverse(ex.pc) else {
            return false;
        };

        if !self.backend.handle_exception(ex) {
            return false;
        }

        self.code_mut(id).fastmem = false;
        self.invalidate_code(id);

        true
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        self.free_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::testing::TestBackend,
        frontend::{sh4::Sh4Frontend, BranchKind},
        testing::{GuestEvent, TestGuest},
    };

    /// Build a coordinator over the SH4 frontend with the given guest
    /// memory contents.
    fn jit_with(mem: &[(GuestAddr, u16)]) -> (Jit, TestGuest, TestBackend) {
        let guest = TestGuest::new();
        for (addr, op) in mem {
            guest.write16(*addr, *op);
        }
        let backend = TestBackend::new();
        let jit = Jit::new(
            Options::new("sh4"),
            Box::new(guest.clone()),
            Box::new(Sh4Frontend::new(HostAddr(0xdead_0000))),
            Box::new(backend.clone()),
        )
        .unwrap();
        (jit, guest, backend)
    }

    // "bt +4" at 0x8c010000: branches to 0x8c010008, falls through to
    // 0x8c010002.
    const BT_PLUS_4: (GuestAddr, u16) = (0x8c010000, 0x8902);
    // "rts; nop" at 0x8c010008.
    const RTS: (GuestAddr, u16) = (0x8c010008, 0x000b);
    const RTS_SLOT: (GuestAddr, u16) = (0x8c01000a, 0x0009);

    #[test]
    fn compiles_a_simple_static_branch() {
        let (mut jit, _guest, _backend) = jit_with(&[BT_PLUS_4]);
        let id = jit.compile_code(0x8c010000).unwrap();

        assert_eq!(jit.lookup_code(0x8c010000), Some(id));
        let meta = jit.meta(0x8c010000).unwrap();
        assert_eq!(meta.branch_kind, BranchKind::StaticTrue);
        assert_eq!(meta.branch_addr, 0x8c010008);
        assert_eq!(meta.next_addr, 0x8c010002);

        // Both branch targets hold invalid code, so the tree is one unit.
        assert_eq!(jit.code(id).num_units(), 1);

        // Reverse lookup works for addresses inside the code, not only the
        // entry.
        let host = jit.code(id).host_addr;
        assert_eq!(jit.lookup_code_reverse(HostAddr(host.0 + 1)), Some(id));
        let end = host.end(jit.code(id).host_size);
        assert_eq!(jit.lookup_code_reverse(end), None);
    }

    #[test]
    fn patches_discovered_edges() {
        let (mut jit, guest, _backend) = jit_with(&[BT_PLUS_4, RTS, RTS_SLOT]);
        let a = jit.compile_code(0x8c010000).unwrap();
        let b = jit.compile_code(0x8c010008).unwrap();

        let branch = HostAddr(jit.code(a).host_addr.0 + 4);
        jit.add_edge(branch, 0x8c010008);

        assert_eq!(jit.code(a).out_edges.len(), 1);
        assert_eq!(jit.code(b).in_edges.len(), 1);
        let eid = jit.code(a).out_edges[0];
        assert_eq!(jit.code(b).in_edges[0], eid);
        let edge = jit.edge(eid);
        assert!(edge.patched);
        assert_eq!(edge.src, a);
        assert_eq!(edge.dst, b);

        let patches: Vec<_> = guest
            .events()
            .into_iter()
            .filter(|e| matches!(e, GuestEvent::PatchEdge(..)))
            .collect();
        assert_eq!(
            patches,
            vec![GuestEvent::PatchEdge(branch, jit.code(b).host_addr)]
        );
    }

    #[test]
    fn fastmem_fault_invalidates_but_keeps_map_entries() {
        let (mut jit, _guest, backend) = jit_with(&[BT_PLUS_4]);
        let id = jit.compile_code(0x8c010000).unwrap();
        let host = jit.code(id).host_addr;

        let ex = Exception {
            pc: HostAddr(host.0 + 2),
            fault_addr: HostAddr(0x5000_0000),
        };
        assert!(jit.handle_exception(&ex));

        assert!(!jit.code(id).fastmem);
        // Still resolvable both ways: the faulting frame may raise more
        // exceptions before it unwinds.
        assert_eq!(jit.lookup_code(0x8c010000), Some(id));
        assert_eq!(jit.lookup_code_reverse(ex.pc), Some(id));
        // But stripped of its units.
        assert_eq!(jit.code(id).num_units(), 0);

        // The next compilation builds a fresh code without fastmem.
        let id2 = jit.compile_code(0x8c010000).unwrap();
        assert!(!jit.code(id2).fastmem);

        // A fault the backend declines propagates.
        backend.set_handle_faults(false);
        let host2 = jit.code(id2).host_addr;
        assert!(!jit.handle_exception(&Exception {
            pc: host2,
            fault_addr: HostAddr(0),
        }));
    }

    #[test]
    fn fault_outside_compiled_code_is_declined() {
        let (mut jit, _guest, _backend) = jit_with(&[BT_PLUS_4]);
        jit.compile_code(0x8c010000).unwrap();
        assert!(!jit.handle_exception(&Exception {
            pc: HostAddr(0x1),
            fault_addr: HostAddr(0),
        }));
    }

    #[test]
    fn cycles_are_cut_by_the_visit_token() {
        // A: "bra 0x8c010008; nop" -> B, B: "bra 0x8c010000; nop" -> A.
        let (mut jit, _guest, _backend) = jit_with(&[
            (0x8c010000, 0xa002),
            (0x8c010002, 0x0009),
            (0x8c010008, 0xaffa),
            (0x8c01000a, 0x0009),
        ]);
        let id = jit.compile_code(0x8c010000).unwrap();

        let code = jit.code(id);
        assert_eq!(code.num_units(), 2);
        let root = code.unit(code.root.unwrap());
        assert_eq!(root.meta_addr, 0x8c010000);
        let b = root.branch.expect("root should inline its branch target");
        assert_eq!(code.unit(b).meta_addr, 0x8c010008);
        // B's branch back to A is cut, not duplicated.
        assert!(code.unit(b).branch.is_none());
        assert!(code.unit(b).next.is_none());
    }

    #[test]
    fn overflow_frees_the_whole_cache() {
        let (mut jit, _guest, backend) = jit_with(&[BT_PLUS_4, RTS, RTS_SLOT]);
        jit.compile_code(0x8c010008).unwrap();
        assert_eq!(jit.num_codes(), 1);

        backend.set_overflow(true);
        let err = jit.compile_code(0x8c010000).unwrap_err();
        assert!(matches!(err, CompilationError::ResourceExhausted(_)));

        assert_eq!(jit.num_codes(), 0);
        assert_eq!(jit.num_metas(), 0);
        assert!(backend.resets() >= 1);
    }

    #[test]
    fn stale_edges_are_dropped_silently() {
        let (mut jit, guest, _backend) = jit_with(&[BT_PLUS_4, RTS, RTS_SLOT]);
        let a = jit.compile_code(0x8c010000).unwrap();
        jit.compile_code(0x8c010008).unwrap();

        let stale_branch = HostAddr(jit.code(a).host_addr.0 + 4);
        jit.free_code(a);
        jit.add_edge(stale_branch, 0x8c010008);

        let b = jit.lookup_code(0x8c010008).unwrap();
        assert!(jit.code(b).in_edges.is_empty());
        assert!(!guest
            .events()
            .iter()
            .any(|e| matches!(e, GuestEvent::PatchEdge(..))));
    }

    #[test]
    fn analysis_failure_is_recoverable() {
        // Nothing in guest memory at all.
        let (mut jit, _guest, _backend) = jit_with(&[]);
        let err = jit.compile_code(0x8c010000).unwrap_err();
        assert!(matches!(err, CompilationError::General(_)));
        assert_eq!(jit.num_codes(), 0);

        // Once the guest writes the code out, compilation succeeds.
        let (mut jit, guest, _backend) = jit_with(&[]);
        assert!(jit.compile_code(0x8c010000).is_err());
        guest.write16(0x8c010000, 0x8902);
        assert!(jit.compile_code(0x8c010000).is_ok());
    }

    #[test]
    fn recompilation_replaces_the_existing_code() {
        let (mut jit, _guest, _backend) = jit_with(&[BT_PLUS_4]);
        let a = jit.compile_code(0x8c010000).unwrap();
        let host_a = jit.code(a).host_addr;
        let b = jit.compile_code(0x8c010000).unwrap();

        assert_eq!(jit.lookup_code(0x8c010000), Some(b));
        assert_eq!(jit.num_codes(), 1);
        assert_eq!(jit.lookup_code_reverse(host_a), None);
    }

    #[test]
    fn meta_refcounts_match_the_unit_trees() {
        let (mut jit, _guest, _backend) = jit_with(&[BT_PLUS_4, RTS, RTS_SLOT]);
        let a = jit.compile_code(0x8c010000).unwrap();
        let b = jit.compile_code(0x8c010008).unwrap();

        // 0x8c010008 is referenced by a unit in each code.
        let meta = jit.meta(0x8c010008).unwrap();
        assert_eq!(meta.compile_refs.len(), 2);
        for &(cid, uid) in &meta.compile_refs {
            assert!(cid == a || cid == b);
            assert_eq!(jit.code(cid).unit(uid).meta_addr, 0x8c010008);
        }

        jit.free_code(a);
        assert_eq!(jit.meta(0x8c010008).unwrap().compile_refs.len(), 1);
    }

    #[test]
    fn invalidation_is_idempotent() {
        let (mut jit, guest, _backend) = jit_with(&[BT_PLUS_4]);
        let id = jit.compile_code(0x8c010000).unwrap();

        jit.invalidate_code(id);
        let events_after_one = guest.events().len();
        jit.invalidate_code(id);

        assert_eq!(jit.code(id).num_units(), 0);
        assert!(jit.code(id).in_edges.is_empty());
        assert_eq!(jit.lookup_code(0x8c010000), Some(id));
        // The second call re-asks the guest to invalidate (harmless) and
        // does nothing else.
        assert_eq!(guest.events().len(), events_after_one + 1);
    }

    #[test]
    fn invalidate_cache_keeps_map_entries_and_frees_meta() {
        let (mut jit, _guest, _backend) = jit_with(&[BT_PLUS_4, RTS, RTS_SLOT]);
        let a = jit.compile_code(0x8c010000).unwrap();
        let b = jit.compile_code(0x8c010008).unwrap();

        jit.invalidate_cache();

        assert_eq!(jit.num_codes(), 2);
        assert_eq!(jit.lookup_code(0x8c010000), Some(a));
        assert_eq!(jit.lookup_code(0x8c010008), Some(b));
        assert_eq!(jit.num_metas(), 0);
    }

    #[test]
    fn fastmem_never_comes_back_without_a_cache_reset() {
        let (mut jit, _guest, _backend) = jit_with(&[BT_PLUS_4]);
        let id = jit.compile_code(0x8c010000).unwrap();
        let pc = HostAddr(jit.code(id).host_addr.0 + 1);
        jit.handle_exception(&Exception {
            pc,
            fault_addr: HostAddr(0),
        });
        assert!(!jit.code(id).fastmem);

        for _ in 0..3 {
            let id = jit.compile_code(0x8c010000).unwrap();
            assert!(!jit.code(id).fastmem);
            let pc = HostAddr(jit.code(id).host_addr.0 + 1);
            jit.handle_exception(&Exception {
                pc,
                fault_addr: HostAddr(0),
            });
        }
    }

    #[test]
    fn dumps_pre_optimisation_ir() {
        let dir = tempfile::tempdir().unwrap();
        let guest = TestGuest::new();
        guest.write16(BT_PLUS_4.0, BT_PLUS_4.1);
        let mut options = Options::new("sh4");
        options.dump_ir = Some(dir.path().to_path_buf());
        let mut jit = Jit::new(
            options,
            Box::new(guest.clone()),
            Box::new(Sh4Frontend::new(HostAddr(0xdead_0000))),
            Box::new(TestBackend::new()),
        )
        .unwrap();
        jit.compile_code(0x8c010000).unwrap();

        let text = std::fs::read_to_string(dir.path().join("0x8c010000.ir")).unwrap();
        // The dump is the round-trippable textual form.
        let mut reread = crate::ir::Ir::new();
        crate::ir::parser::read(&text, &mut reread).unwrap();
        assert!(text.contains("load_context"));
        assert!(text.contains("branch_true"));
    }

    #[test]
    fn edges_die_with_either_endpoint() {
        let (mut jit, guest, _backend) = jit_with(&[BT_PLUS_4, RTS, RTS_SLOT]);
        let a = jit.compile_code(0x8c010000).unwrap();
        let b = jit.compile_code(0x8c010008).unwrap();
        let branch = HostAddr(jit.code(a).host_addr.0 + 4);
        jit.add_edge(branch, 0x8c010008);

        // Invalidate the destination: its incoming patched branch must be
        // restored to dispatch on the guest address first.
        jit.invalidate_code(b);
        assert!(jit.code(a).out_edges.is_empty());
        assert!(jit.code(b).in_edges.is_empty());
        assert!(guest
            .events()
            .iter()
            .any(|e| *e == GuestEvent::RestoreEdge(branch, 0x8c010008)));
    }
}
