//! The textual form of the IR.
//!
//! The writer here and the reader in [super::parser] round-trip: an [Ir]
//! printed and re-read compares equal under [Ir::structural_eq]. Integer and
//! float constants are printed as hex bit patterns with a type suffix so no
//! precision is lost on the way through the text.

use super::{BlockIdx, ConstVal, Ir, Opcode, ValueIdx};
use std::fmt;

impl Ir {
    /// The label a block is printed with: its assigned label, or a
    /// positional default.
    pub fn effective_label(&self, b: BlockIdx) -> String {
        match &self.block(b).label {
            Some(l) => l.clone(),
            None => format!("bb{}", usize::from(b)),
        }
    }

    fn fmt_arg(&self, f: &mut fmt::Formatter<'_>, v: ValueIdx) -> fmt::Result {
        let val = self.value(v);
        match val.const_val() {
            None => write!(f, "%{}", usize::from(v)),
            Some(ConstVal::I8(c)) => write!(f, "0x{:x}:i8", *c as u8),
            Some(ConstVal::I16(c)) => write!(f, "0x{:x}:i16", *c as u16),
            Some(ConstVal::I32(c)) => write!(f, "0x{:x}:i32", *c as u32),
            Some(ConstVal::I64(c)) => write!(f, "0x{:x}:i64", *c as u64),
            Some(ConstVal::F32(c)) => write!(f, "0x{:x}:f32", c.to_bits()),
            Some(ConstVal::F64(c)) => write!(f, "0x{:x}:f64", c.to_bits()),
            Some(ConstVal::Str(s)) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        _ => write!(f, "{ch}")?,
                    }
                }
                write!(f, "\"")
            }
            Some(ConstVal::Blk(b)) => write!(f, ":{}", self.effective_label(*b)),
        }
    }

    /// Compare two IRs structurally: same block layout (by effective label),
    /// same instructions (opcode, result type, argument shape) and the same
    /// argument value flow. Register assignments, pass tags and value
    /// numbering are ignored.
    pub fn structural_eq(&self, other: &Ir) -> bool {
        let ours: Vec<_> = self.blocks().collect();
        let theirs: Vec<_> = other.blocks().collect();
        if ours.len() != theirs.len() {
            return false;
        }

        // First pass: pair up defined values in walk order.
        let mut val_map = std::collections::HashMap::new();
        for (&a, &b) in ours.iter().zip(theirs.iter()) {
            let ia = self.block_insts(a);
            let ib = other.block_insts(b);
            if ia.len() != ib.len() {
                return false;
            }
            for (&x, &y) in ia.iter().zip(ib.iter()) {
                match (self.inst(x).result, other.inst(y).result) {
                    (Some(rx), Some(ry)) => {
                        val_map.insert(rx, ry);
                    }
                    (None, None) => (),
                    _ => return false,
                }
            }
        }

        for (&a, &b) in ours.iter().zip(theirs.iter()) {
            if self.effective_label(a) != other.effective_label(b) {
                return false;
            }
            for (&x, &y) in self.block_insts(a).iter().zip(other.block_insts(b).iter()) {
                let (xi, yi) = (self.inst(x), other.inst(y));
                if xi.op != yi.op {
                    return false;
                }
                if let (Some(rx), Some(ry)) = (xi.result, yi.result) {
                    if self.value(rx).ty != other.value(ry).ty {
                        return false;
                    }
                }
                for n in 0..super::MAX_INST_ARGS {
                    match (xi.arg(n), yi.arg(n)) {
                        (None, None) => (),
                        (Some(va), Some(vb)) => {
                            let (a_val, b_val) = (self.value(va), other.value(vb));
                            if a_val.ty != b_val.ty {
                                return false;
                            }
                            match (a_val.const_val(), b_val.const_val()) {
                                (Some(ConstVal::Blk(ba)), Some(ConstVal::Blk(bb))) => {
                                    if self.effective_label(*ba) != other.effective_label(*bb) {
                                        return false;
                                    }
                                }
                                (Some(ca), Some(cb)) => {
                                    if ca != cb {
                                        return false;
                                    }
                                }
                                (None, None) => {
                                    if val_map.get(&va) != Some(&vb) {
                                        return false;
                                    }
                                }
                                _ => return false,
                            }
                        }
                        _ => return false,
                    }
                }
            }
        }
        true
    }
}

impl fmt::Display for Ir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.blocks() {
            writeln!(f, "{}:", self.effective_label(b))?;
            for i in self.block_insts(b) {
                let inst = self.inst(i);
                assert!(inst.op != Opcode::Tombstone);
                write!(f, "  ")?;
                if let Some(r) = inst.result {
                    write!(f, "{} %{} = ", self.value(r).ty, usize::from(r))?;
                }
                write!(f, "{}", inst.op)?;
                let mut first = true;
                for (_, v) in inst.args() {
                    if first {
                        write!(f, " ")?;
                        first = false;
                    } else {
                        write!(f, ", ")?;
                    }
                    self.fmt_arg(f, v)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
