//! `println`/`print`/`eprintln`/`eprint` lower to these two entry points
//! against whichever namespace's `.so` the catalog resolves (`rt` for
//! stdout, `rt_err` for stderr — see `flapc_runtime_stderr`). Output goes
//! through raw `write(2)`, never Rust's buffered stdio, so a forked
//! worker's output interleaves with its siblings at the granularity of a
//! single `write` rather than getting stuck in a libc buffer.

use crate::container;
use crate::strings;
use crate::value::{self, Kind};
use std::fmt::Write as _;

pub fn write_fd(fd: i32, bytes: &[u8]) {
    let mut remaining = bytes;
    while !remaining.is_empty() {
        let n = unsafe { libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len()) };
        if n <= 0 {
            return;
        }
        remaining = &remaining[n as usize..];
    }
}

pub fn format_value(v: f64, out: &mut String) {
    if let Some(code) = value::error_code(v) {
        let text = std::str::from_utf8(&code).unwrap_or("err ");
        out.push_str("error(");
        out.push_str(text.trim_end());
        out.push(')');
        return;
    }
    if value::is_null(v) {
        out.push_str("null");
        return;
    }
    let ptr: *mut u8 = value::value_to_ptr(v);
    // Plain numbers never collide with a live heap address: this runtime
    // never maps page zero, so any f64 small enough to be a realistic
    // numeric literal fails the `is_null` check above instead of being
    // mistaken for a pointer. Anything else is assumed to be one of our
    // own tagged allocations.
    if !looks_like_heap_pointer(ptr) {
        format_number(v, out);
        return;
    }
    match unsafe { Kind::of(ptr) } {
        Kind::Str => {
            let bytes = unsafe { strings::bytes(ptr) };
            out.push_str(&String::from_utf8_lossy(bytes));
        }
        Kind::Sequence => {
            out.push('[');
            for (i, item) in unsafe { container::sequence_items(ptr) }.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                format_value(*item, out);
            }
            out.push(']');
        }
        Kind::Map => {
            out.push_str("{...}");
        }
        Kind::Closure => out.push_str("<closure>"),
    }
}

fn looks_like_heap_pointer(ptr: *mut u8) -> bool {
    !ptr.is_null() && (ptr as usize) > 0x1000
}

fn format_number(v: f64, out: &mut String) {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        let _ = write!(out, "{}", v as i64);
    } else {
        let _ = write!(out, "{v}");
    }
}

/// # Safety
/// Called only by compiler-generated code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn print_value(v: f64) -> f64 {
    let mut out = String::new();
    format_value(v, &mut out);
    write_fd(1, out.as_bytes());
    0.0
}

/// # Safety
/// Called only by compiler-generated code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn print_newline(_unused: f64) -> f64 {
    write_fd(1, b"\n");
    0.0
}
