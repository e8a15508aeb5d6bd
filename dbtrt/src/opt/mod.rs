//! The optimisation pipeline.
//!
//! Passes run in a fixed order, each mutating the IR in place, and each is
//! stateless between runs. Every pass must leave the IR well-formed: in
//! debug and test builds that is asserted after each one.

pub mod cfa;
pub mod cprop;
pub mod dce;
pub mod esimp;
pub mod lse;
pub mod regalloc;

use crate::{backend::RegisterDesc, ir::Ir};

/// The fixed pass order used for every compilation.
pub const PASS_ORDER: [&str; 6] = ["cfa", "lse", "cprop", "esimp", "dce", "ra"];

/// Run the full pipeline over `ir`. `registers` is the host register bank
/// register allocation hands out from.
pub fn run_all(ir: &mut Ir, registers: &[RegisterDesc]) {
    for name in PASS_ORDER {
        run_pass(name, ir, registers);
    }
}

/// Run a single pass by name. Panics on an unknown name; use
/// [is_pass_name] to validate first.
pub fn run_pass(name: &str, ir: &mut Ir, registers: &[RegisterDesc]) {
    match name {
        "cfa" => cfa::run(ir),
        "lse" => lse::run(ir),
        "cprop" => cprop::run(ir),
        "esimp" => esimp::run(ir),
        "dce" => dce::run(ir),
        "ra" => regalloc::run(ir, registers),
        _ => panic!("unknown pass '{name}'"),
    }
    #[cfg(debug_assertions)]
    ir.assert_well_formed();
}

pub fn is_pass_name(name: &str) -> bool {
    PASS_ORDER.contains(&name)
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::ir::{parser, Ir};
    use fm::FMBuilder;
    use regex::Regex;
    use std::sync::OnceLock;

    /// Parse `input` as textual IR, run `transform` over it, and assert the
    /// result matches the [fm] pattern `expect`.
    ///
    /// `expect` may use `{{name}}` patterns: two occurrences of the same
    /// name must match the same literal text.
    pub(crate) fn assert_opt_eq<F>(input: &str, transform: F, expect: &str)
    where
        F: FnOnce(&mut Ir),
    {
        static PTN_RE: OnceLock<Regex> = OnceLock::new();
        static LITERAL_RE: OnceLock<Regex> = OnceLock::new();
        let ptn_re = PTN_RE
            .get_or_init(|| Regex::new(r"\{\{.+?\}\}").unwrap())
            .clone();
        let literal_re = LITERAL_RE
            .get_or_init(|| Regex::new(r"[a-zA-Z0-9\._]+").unwrap())
            .clone();

        let mut ir = Ir::new();
        parser::read(input, &mut ir).unwrap();
        transform(&mut ir);
        #[cfg(debug_assertions)]
        ir.assert_well_formed();

        let fmm = FMBuilder::new(expect)
            .unwrap()
            .name_matcher(ptn_re, literal_re)
            .build()
            .unwrap();
        if let Err(e) = fmm.matches(&ir.to_string()) {
            panic!("{e}");
        }
    }
}
