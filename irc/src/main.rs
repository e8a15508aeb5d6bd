//! irc -- run the optimisation pipeline over textual IR dumps.
//!
//! Reads one or more `.ir` files (as written by the runtime's IR dump
//! option), runs a configurable list of passes over each, and prints the IR
//! after every pass. Useful for inspecting what a pass did to a block that
//! misbehaved, without re-running the whole emulator.
//!
//! Usage: `irc [--passes cfa,lse,cprop,esimp,dce,ra] [--quiet] <file|dir>...`

use dbtrt::{
    backend::RegisterDesc,
    ir::{parser, type_mask, Ir},
    opt,
};
use std::{fs, path::Path, process::ExitCode};

/// A stand-in x64-shaped register bank for running register allocation
/// outside a real backend: the allocatable general purpose and xmm
/// registers, minus the ones the emitter reserves.
static REGISTERS: [RegisterDesc; 12] = [
    RegisterDesc { name: "rbx", value_types: type_mask::INT },
    RegisterDesc { name: "rbp", value_types: type_mask::INT },
    RegisterDesc { name: "r12", value_types: type_mask::INT },
    RegisterDesc { name: "r13", value_types: type_mask::INT },
    RegisterDesc { name: "r14", value_types: type_mask::INT },
    RegisterDesc { name: "r15", value_types: type_mask::INT },
    RegisterDesc { name: "xmm6", value_types: type_mask::FLOAT | type_mask::VECTOR },
    RegisterDesc { name: "xmm7", value_types: type_mask::FLOAT | type_mask::VECTOR },
    RegisterDesc { name: "xmm8", value_types: type_mask::FLOAT | type_mask::VECTOR },
    RegisterDesc { name: "xmm9", value_types: type_mask::FLOAT | type_mask::VECTOR },
    RegisterDesc { name: "xmm10", value_types: type_mask::FLOAT | type_mask::VECTOR },
    RegisterDesc { name: "xmm11", value_types: type_mask::FLOAT | type_mask::VECTOR },
];

struct Stats {
    instrs_total: usize,
    instrs_removed: usize,
}

fn process_file(path: &Path, passes: &[String], quiet: bool, stats: &mut Stats) -> bool {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("irc: {}: {e}", path.display());
            return false;
        }
    };

    let mut ir = Ir::new();
    if let Err(e) = parser::read(&text, &mut ir) {
        eprintln!("irc: {}: {e}", path.display());
        return false;
    }

    let before = ir.num_insts();
    for name in passes {
        opt::run_pass(name, &mut ir, &REGISTERS);
        if !quiet {
            println!("===-----------------------------------------------------===");
            println!("IR after {name}");
            println!("===-----------------------------------------------------===");
            print!("{ir}");
            println!();
        }
    }
    let after = ir.num_insts();

    stats.instrs_total += before;
    stats.instrs_removed += before.saturating_sub(after);
    true
}

fn main() -> ExitCode {
    let mut passes: Vec<String> = opt::PASS_ORDER.iter().map(|s| s.to_string()).collect();
    let mut quiet = false;
    let mut inputs = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--passes" => {
                let Some(list) = args.next() else {
                    eprintln!("irc: --passes needs a comma-separated list");
                    return ExitCode::FAILURE;
                };
                passes = list.split(',').map(|s| s.trim().to_string()).collect();
            }
            "--quiet" => quiet = true,
            "--help" => {
                println!(
                    "usage: irc [--passes {}] [--quiet] <file|dir>...",
                    opt::PASS_ORDER.join(",")
                );
                return ExitCode::SUCCESS;
            }
            _ => inputs.push(arg),
        }
    }

    for name in &passes {
        if !opt::is_pass_name(name) {
            eprintln!("irc: unknown pass '{name}'");
            return ExitCode::FAILURE;
        }
    }
    if inputs.is_empty() {
        eprintln!("irc: no input files");
        return ExitCode::FAILURE;
    }

    let mut stats = Stats {
        instrs_total: 0,
        instrs_removed: 0,
    };
    let mut ok = true;
    for input in &inputs {
        let path = Path::new(input);
        if path.is_dir() {
            let mut entries: Vec<_> = match fs::read_dir(path) {
                Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
                Err(e) => {
                    eprintln!("irc: {}: {e}", path.display());
                    ok = false;
                    continue;
                }
            };
            entries.sort();
            for entry in entries.iter().filter(|p| p.is_file()) {
                println!("Processing {}", entry.display());
                ok &= process_file(entry, &passes, true, &mut stats);
            }
        } else {
            ok &= process_file(path, &passes, quiet, &mut stats);
        }
    }

    println!();
    println!("total ir instructions: {}", stats.instrs_total);
    println!("removed ir instructions: {}", stats.instrs_removed);

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
