//! A reader for the textual IR form.
//!
//! The input accepted is the same as the writer's output (see
//! [super::display]), plus blank lines and `#` comments. Value numbers in
//! the input are arbitrary names: they are remapped onto fresh values as the
//! IR is built, so concatenating or hand-editing dumps is fine as long as
//! every `%n` argument refers to a `%n` defined earlier in the file.
//!
//! Used at run-time by the standalone pass driver, and by tests to build IR
//! from concrete syntax.

use super::{Ir, Opcode, Ty};
use std::{collections::HashMap, error::Error, fmt, str::FromStr};

/// A failure to parse textual IR.
#[derive(Debug)]
pub struct ParseError {
    pub line: usize,
    pub msg: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.msg)
    }
}

impl Error for ParseError {}

fn err<T>(line: usize, msg: impl Into<String>) -> Result<T, ParseError> {
    Err(ParseError {
        line,
        msg: msg.into(),
    })
}

/// Parse `text` into `ir`. Any existing contents of `ir` are discarded.
pub fn read(text: &str, ir: &mut Ir) -> Result<(), ParseError> {
    ir.reset();

    // First pass: create the blocks in file order so that forward block
    // references don't disturb the layout.
    let mut blocks = HashMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = strip(line);
        if let Some(label) = line.strip_suffix(':') {
            if !is_ident(label) {
                return err(lineno + 1, format!("invalid block label '{label}'"));
            }
            if blocks.contains_key(label) {
                return err(lineno + 1, format!("duplicate block label '{label}'"));
            }
            let b = ir.append_block();
            ir.set_block_label(b, label.to_owned());
            blocks.insert(label.to_owned(), b);
        }
    }

    let mut values: HashMap<String, super::ValueIdx> = HashMap::new();
    let mut in_block = false;
    for (lineno, raw) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = strip(raw);
        if line.is_empty() {
            continue;
        }
        if let Some(label) = line.strip_suffix(':') {
            ir.set_current_block(blocks[label]);
            in_block = true;
            continue;
        }
        if !in_block {
            return err(lineno, "instruction before any block label");
        }

        // Optional "<ty> %<n> = " result prefix.
        let (result, rest) = match line.find('=') {
            // A '=' inside a string literal is not a result assignment.
            Some(eq) if !line[..eq].contains('"') => {
                let lhs = line[..eq].trim();
                let mut it = lhs.split_whitespace();
                let (ty, name) = match (it.next(), it.next(), it.next()) {
                    (Some(ty), Some(name), None) => (ty, name),
                    _ => return err(lineno, format!("malformed result '{lhs}'")),
                };
                let ty = Ty::from_str(ty)
                    .map_err(|_| ParseError {
                        line: lineno,
                        msg: format!("unknown type '{ty}'"),
                    })?;
                let name = name
                    .strip_prefix('%')
                    .ok_or_else(|| ParseError {
                        line: lineno,
                        msg: format!("malformed result name '{name}'"),
                    })?
                    .to_owned();
                (Some((ty, name)), line[eq + 1..].trim())
            }
            _ => (None, line),
        };

        let (op_str, args_str) = match rest.find(' ') {
            Some(sp) => (&rest[..sp], rest[sp + 1..].trim()),
            None => (rest, ""),
        };
        let op = Opcode::from_str(op_str).map_err(|_| ParseError {
            line: lineno,
            msg: format!("unknown opcode '{op_str}'"),
        })?;

        let result_ty = result.as_ref().map(|(ty, _)| *ty).unwrap_or(Ty::Void);
        let iidx = ir.append_inst(op, result_ty);
        if let Some((_, name)) = result {
            let r = ir.inst(iidx).result.unwrap();
            values.insert(name, r);
        }

        for (n, arg) in split_args(args_str).into_iter().enumerate() {
            if n >= super::MAX_INST_ARGS {
                return err(lineno, "too many arguments");
            }
            let v = parse_arg(ir, &blocks, &values, arg, lineno)?;
            ir.set_arg(iidx, n, v);
        }
    }

    Ok(())
}

fn strip(line: &str) -> &str {
    match line.find('#') {
        Some(h) if !line[..h].contains('"') => line[..h].trim(),
        _ => line.trim(),
    }
}

fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Split an argument list on commas, respecting string literals.
fn split_args(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    if s.is_empty() {
        return out;
    }
    let mut depth_str = false;
    let mut start = 0;
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => depth_str = !depth_str,
            b'\\' if depth_str => i += 1,
            b',' if !depth_str => {
                out.push(s[start..i].trim());
                start = i + 1;
            }
            _ => (),
        }
        i += 1;
    }
    out.push(s[start..].trim());
    out
}

fn parse_arg(
    ir: &mut Ir,
    blocks: &HashMap<String, super::BlockIdx>,
    values: &HashMap<String, super::ValueIdx>,
    arg: &str,
    lineno: usize,
) -> Result<super::ValueIdx, ParseError> {
    if let Some(name) = arg.strip_prefix('%') {
        return match values.get(name) {
            Some(v) => Ok(*v),
            None => err(lineno, format!("use of undefined value '%{name}'")),
        };
    }
    if let Some(label) = arg.strip_prefix(':') {
        return match blocks.get(label) {
            Some(b) => Ok(ir.const_blk(*b)),
            None => err(lineno, format!("branch to unknown block '{label}'")),
        };
    }
    if arg.starts_with('"') {
        let inner = arg
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .ok_or_else(|| ParseError {
                line: lineno,
                msg: format!("unterminated string '{arg}'"),
            })?;
        return Ok(ir.const_str(unescape(inner)));
    }

    // A typed constant: "<literal>:<ty>".
    let (lit, ty) = match arg.rsplit_once(':') {
        Some(x) => x,
        None => return err(lineno, format!("malformed argument '{arg}'")),
    };
    let ty = Ty::from_str(ty).map_err(|_| ParseError {
        line: lineno,
        msg: format!("unknown type '{ty}' in '{arg}'"),
    })?;
    let bits = if let Some(hex) = lit.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).map_err(|_| ParseError {
            line: lineno,
            msg: format!("bad hex literal '{lit}'"),
        })?
    } else {
        // Decimal literals are sign-extended.
        lit.parse::<i64>().map_err(|_| ParseError {
            line: lineno,
            msg: format!("bad literal '{lit}'"),
        })? as u64
    };
    Ok(match ty {
        Ty::I8 => ir.const_i8(bits as i8),
        Ty::I16 => ir.const_i16(bits as i16),
        Ty::I32 => ir.const_i32(bits as i32),
        Ty::I64 => ir.const_i64(bits as i64),
        Ty::F32 => ir.const_f32(f32::from_bits(bits as u32)),
        Ty::F64 => ir.const_f64(f64::from_bits(bits)),
        _ => return err(lineno, format!("type '{ty}' cannot be a literal")),
    })
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut it = s.chars();
    while let Some(c) = it.next() {
        if c == '\\' {
            match it.next() {
                Some('n') => out.push('\n'),
                Some(x) => out.push(x),
                None => (),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::{ConstVal, Ir, Opcode};
    use super::read;

    #[test]
    fn reads_blocks_and_insts() {
        let mut ir = Ir::new();
        read(
            "
            entry:
              i32 %0 = load_context 0x2c:i32
              i32 %1 = add %0, 0x1:i32
              store_context 0x2c:i32, %1
              branch :exit
            exit:
              debug_break
            ",
            &mut ir,
        )
        .unwrap();

        let blocks: Vec<_> = ir.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(ir.effective_label(blocks[0]), "entry");
        let insts = ir.block_insts(blocks[0]);
        assert_eq!(insts.len(), 4);
        assert_eq!(ir.inst(insts[3]).op, Opcode::Branch);
        let dst = ir.inst(insts[3]).arg(0).unwrap();
        assert_eq!(ir.value(dst).const_val(), Some(&ConstVal::Blk(blocks[1])));
    }

    #[test]
    fn forward_references_keep_layout_order() {
        let mut ir = Ir::new();
        read(
            "
            a:
              branch :c
            b:
              debug_break
            c:
              debug_break
            ",
            &mut ir,
        )
        .unwrap();
        let labels: Vec<_> = ir.blocks().map(|b| ir.effective_label(b)).collect();
        assert_eq!(labels, ["a", "b", "c"]);
    }

    #[test]
    fn undefined_value_is_an_error() {
        let mut ir = Ir::new();
        let e = read("entry:\n  i32 %1 = add %0, %0\n", &mut ir).unwrap_err();
        assert!(e.msg.contains("undefined value"));
    }

    #[test]
    fn round_trips_structurally() {
        let text = "
            0x8c010000:
              i32 %0 = load_context 0x84:i32
              i32 %2 = sub %0, 0x6:i32
              store_context 0x84:i32, %2
              i8 %4 = cmp_sle %2, 0x0:i32
              branch_true %4, :yield
              f64 %5 = fadd 0x3ff0000000000000:f64, 0x4000000000000000:f64
              debug_info \"test, with comma\", 0x8c010000:i32, 0x9:i32
              branch :0x8c010000
            yield:
              call_noreturn 0x7f0000001000:i64
            ";
        let mut a = Ir::new();
        read(text, &mut a).unwrap();
        let mut b = Ir::new();
        read(&a.to_string(), &mut b).unwrap();
        assert!(a.structural_eq(&b), "round trip changed the IR:\n{a}\nvs\n{b}");
    }
}
