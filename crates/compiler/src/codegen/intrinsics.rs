//! Builtin call lowering (spec §6.3, §8 concrete scenarios exercise
//! `println`, `atomic_add`, `atomic_load`).
//!
//! These names never go through the FFI catalog's `lookup` — they are
//! resolved here, before a `Call` falls through to
//! [`super::expr::lower_call`]'s ordinary Language-function path. Each
//! lowers to a call into the companion runtime shared object (spec §1
//! "a companion runtime library ships separately"; see `DESIGN.md`
//! "Runtime helper namespace"), addressed the same way an FFI import is:
//! through the catalog's `rt` namespace.

use super::expr::RUNTIME_NAMESPACE;
use super::state::CodeGen;
use crate::ast::{Expr, Reg};
use crate::error::{Category, Span};

/// Returns `Some(())` if `name` was a recognized intrinsic (and therefore
/// fully lowered), `None` if the caller should treat it as an ordinary
/// Language-function call.
pub fn lower_intrinsic(cg: &mut CodeGen, name: &str, args: &[Expr], dst: u8, span: &Span) -> Option<()> {
    match name {
        "print" | "println" => {
            lower_print(cg, args, name == "println", RUNTIME_NAMESPACE);
            zero(cg, dst);
            Some(())
        }
        "eprint" | "eprintln" => {
            lower_print(cg, args, name == "eprintln", "rt_err");
            zero(cg, dst);
            Some(())
        }
        "exit" => {
            lower_exit(cg, args, span);
            Some(())
        }
        "atomic_add" | "atomic_sub" | "atomic_load" | "atomic_store" => {
            lower_atomic(cg, name, args, dst, span);
            Some(())
        }
        "take" => {
            // `take(x!)` — the `!` is what does the move; `take` itself is
            // the identity, kept only so the example in spec §8 parses as
            // an ordinary call.
            if let Some(a) = args.first() {
                super::expr::lower_expr(cg, a, dst);
            } else {
                zero(cg, dst);
            }
            Some(())
        }
        "len" => {
            if let Some(a) = args.first() {
                super::expr::lower_expr(cg, a, dst);
                emit_runtime_call(cg, "length");
            } else {
                zero(cg, dst);
            }
            Some(())
        }
        "fork" => {
            emit_runtime_call(cg, "fork");
            Some(())
        }
        _ => None,
    }
}

fn zero(cg: &mut CodeGen, dst: u8) {
    let scratch = if dst == 0 { Reg::Rcx } else { Reg::Rax };
    cg.emitter.mov_reg_imm64(scratch, 0);
    cg.emitter.movq_xmm_gpr(dst, scratch);
}

fn lower_print(cg: &mut CodeGen, args: &[Expr], newline: bool, namespace: &str) {
    for a in args {
        super::expr::lower_expr(cg, a, 0);
        call_namespaced(cg, namespace, "print_value");
    }
    if newline {
        call_namespaced(cg, namespace, "print_newline");
    }
}

/// Like [`emit_runtime_call`] but against an explicit namespace, since
/// `eprint`/`eprintln` must relocate against the stderr-facing runtime
/// object (`rt_err`) for both `print_value` and `print_newline`, not just
/// the former.
fn call_namespaced(cg: &mut CodeGen, namespace: &str, name: &str) {
    match cg.catalog.lookup(namespace, name) {
        Some((library, _)) => {
            let site = cg.emitter.call_rel32(0);
            cg.reloc_plt_call(site, library, name.to_string());
        }
        None => cg.diags_error(Category::Codegen, format!("runtime helper '{namespace}.{name}' has no catalog entry")),
    }
}

/// `exit(code)` — a direct libc call rather than a runtime helper, since
/// it never returns and needs no argument marshaling beyond the ordinary
/// System V integer convention (spec §6.3 "Exit status comes from `exit(n)`
/// builtin").
fn lower_exit(cg: &mut CodeGen, args: &[Expr], span: &Span) {
    let code = args.first();
    match code {
        Some(e) => super::expr::lower_expr(cg, e, 0),
        None => zero(cg, 0),
    }
    cg.emitter.cvttsd2si(Reg::Rdi, 0);
    match cg.catalog.lookup("c", "exit") {
        Some((library, _)) => {
            let site = cg.emitter.call_rel32(0);
            cg.reloc_plt_call(site, library, "exit".to_string());
        }
        None => cg.diags_error(Category::Codegen, "no catalog entry for 'c.exit'"),
    }
    let _ = span;
}

/// Atomics (spec §5 "compile to `lock`-prefixed x86 instructions"). The
/// address argument is lowered as an ordinary value (a pointer bit-cast
/// into the universal `f64` representation, spec §3.4) and the actual
/// `lock xadd`/`lock cmpxchg` sequence lives in the runtime helper so a
/// single call site here stays correct regardless of how the pointer was
/// produced (stack slot address, heap cell, `mmap`'d shared region).
fn lower_atomic(cg: &mut CodeGen, name: &str, args: &[Expr], dst: u8, span: &Span) {
    let helper = match name {
        "atomic_add" => "atomic_add",
        "atomic_sub" => "atomic_sub",
        "atomic_load" => "atomic_load",
        "atomic_store" => "atomic_store",
        _ => unreachable!(),
    };
    match args {
        [addr] if name == "atomic_load" => {
            super::expr::lower_expr(cg, addr, 0);
            emit_runtime_call(cg, helper);
        }
        [addr, value] => {
            super::expr::lower_expr(cg, addr, 0);
            super::expr::lower_expr(cg, value, 1);
            emit_runtime_call(cg, helper);
        }
        _ => cg.diags_error(Category::Codegen, format!("'{name}' expects 2 arguments, found {}", args.len())),
    }
    if dst != 0 {
        cg.emitter.movq_gpr_xmm(Reg::Rax, 0);
        cg.emitter.movq_xmm_gpr(dst, Reg::Rax);
    }
    let _ = span;
}

fn emit_runtime_call(cg: &mut CodeGen, name: &str) {
    match cg.catalog.lookup(RUNTIME_NAMESPACE, name) {
        Some((library, _)) => {
            let site = cg.emitter.call_rel32(0);
            cg.reloc_plt_call(site, library, name.to_string());
        }
        None => cg.diags_error(Category::Codegen, format!("runtime helper '{name}' has no catalog entry")),
    }
}
