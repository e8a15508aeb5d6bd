//! The implementation of the `DBT_LOG` environment variable.
//!
//! `DBT_LOG=<n>` selects a [Verbosity]: anything at or below the selected
//! level is written to stderr. The default is [Verbosity::Warning].

use std::{env, sync::LazyLock};
use strum::FromRepr;

/// How verbose should the runtime's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log JIT events (e.g. each block compilation).
    JitEvent,
}

static VERBOSITY: LazyLock<Verbosity> = LazyLock::new(|| {
    match env::var("DBT_LOG") {
        Ok(x) => match x.parse::<u8>().ok().and_then(Verbosity::from_repr) {
            Some(v) => v,
            None => panic!("Invalid DBT_LOG value: {x}"),
        },
        Err(_) => Verbosity::Warning,
    }
});

pub(crate) fn log(level: Verbosity, msg: &str) {
    if level <= *VERBOSITY && level != Verbosity::Disabled {
        eprintln!("dbt: {msg}");
    }
}

pub(crate) fn log_warning(msg: &str) {
    log(Verbosity::Warning, msg);
}

pub(crate) fn log_jit_event(msg: &str) {
    log(Verbosity::JitEvent, msg);
}
