//! `eprint`/`eprintln` relocate against this object instead of
//! `flapc-runtime` directly. ELF relocations target the literal symbol
//! name (`print_value`), and that name is already taken by the stdout
//! object, so a second, otherwise-identical shared object carries the
//! stderr-facing pair under the same two names (catalog namespace
//! `rt_err`; see `flapc_catalog::DEFAULT_RUNTIME_MANIFEST`).

use flapc_runtime::print::{format_value, write_fd};

/// # Safety
/// Called only by compiler-generated code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn print_value(v: f64) -> f64 {
    let mut out = String::new();
    format_value(v, &mut out);
    write_fd(2, out.as_bytes());
    0.0
}

/// # Safety
/// Called only by compiler-generated code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn print_newline(_unused: f64) -> f64 {
    write_fd(2, b"\n");
    0.0
}
