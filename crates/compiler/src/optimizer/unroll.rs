//! Pass 5: loop unrolling (spec §4.3).
//!
//! A sequential loop (`ThreadCount::Sequential`) over a numeric range with
//! known literal bounds of size ≤ 8 is unrolled: the body is deep-cloned
//! once per iteration with the loop variable substituted by that
//! iteration's literal value. If the same name is (re-)assigned by more
//! than one unrolled copy, the second and later occurrences are converted
//! to update form (`<-`) so later passes don't see what looks like a
//! duplicate immutable binding.
//!
//! Conservative restriction (recorded in `DESIGN.md`): a loop whose body
//! contains a `ret @K` targeting the loop's own label is left alone,
//! since flattening would strand that jump's target.

use crate::ast::{Expr, JumpNode, Program, Statement, ThreadCount};
use std::collections::HashMap;

const MAX_UNROLL: i64 = 8;

pub fn unroll_program(program: Program) -> (Program, bool) {
    let mut changed = false;
    let statements = unroll_block(program.statements, &mut changed);
    (Program { statements }, changed)
}

fn unroll_block(stmts: Vec<Statement>, changed: &mut bool) -> Vec<Statement> {
    let mut out = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        match try_unroll(stmt, changed) {
            Ok(mut flattened) => out.append(&mut flattened),
            Err(stmt) => out.push(recurse_nested(stmt, changed)),
        }
    }
    out
}

/// Recurses into a statement's nested bodies without attempting to unroll
/// the statement itself (it either isn't a loop, or didn't qualify).
fn recurse_nested(stmt: Statement, changed: &mut bool) -> Statement {
    match stmt {
        Statement::Loop {
            iterator,
            iterable,
            body,
            max_iterations,
            threads,
            base_offset,
            label,
            span,
        } => Statement::Loop {
            iterator,
            iterable,
            body: unroll_block(body, changed),
            max_iterations,
            threads,
            base_offset,
            label,
            span,
        },
        Statement::Arena(mut block, span) => {
            block.body = unroll_block(block.body, changed);
            Statement::Arena(block, span)
        }
        Statement::Spawn { expr, handler, span } => Statement::Spawn {
            expr,
            handler: handler.map(|(params, body)| (params, unroll_block(body, changed))),
            span,
        },
        other => other,
    }
}

/// Attempts to unroll `stmt`. Returns `Ok(flattened)` on success (a list
/// of statements to splice in place of the loop), or `Err(stmt)` to leave
/// it untouched (after recursing into its own nested bodies, handled by
/// the caller).
fn try_unroll(stmt: Statement, changed: &mut bool) -> Result<Vec<Statement>, Statement> {
    let Statement::Loop {
        iterator: Some(iter_name),
        iterable: Some(iterable),
        body,
        max_iterations,
        threads: ThreadCount::Sequential,
        base_offset,
        label,
        span,
    } = stmt
    else {
        return Err(stmt);
    };

    let Expr::Range { start, end: Some(end), inclusive, step: None, .. } = iterable.as_ref() else {
        return Err(Statement::Loop {
            iterator: Some(iter_name),
            iterable: Some(iterable),
            body,
            max_iterations,
            threads: ThreadCount::Sequential,
            base_offset,
            label,
            span,
        });
    };

    let start_val = match start.as_ref().map(|e| e.as_number()) {
        Some(Some(v)) => v,
        Some(None) => {
            return reject(iter_name, iterable, body, max_iterations, base_offset, label, span)
        }
        None => 0.0,
    };
    let Some(end_val) = end.as_number() else {
        return reject(iter_name, iterable, body, max_iterations, base_offset, label, span);
    };

    let start_i = start_val as i64;
    let end_i = end_val as i64;
    let count = if *inclusive { end_i - start_i + 1 } else { end_i - start_i };
    if count <= 0 || count > MAX_UNROLL || jumps_to_label(&body, label) {
        return reject(iter_name, iterable, body, max_iterations, base_offset, label, span);
    }

    *changed = true;
    let mut seen_names: HashMap<String, usize> = HashMap::new();
    let mut flattened = Vec::new();
    for i in 0..count {
        let value = (start_i + i) as f64;
        for stmt in &body {
            let mut copy = substitute_ident_stmt(stmt, &iter_name, value);
            mark_repeated_assignments(&mut copy, &mut seen_names);
            flattened.push(copy);
        }
    }
    Ok(flattened)
}

#[allow(clippy::too_many_arguments)]
fn reject(
    iterator: String,
    iterable: Box<Expr>,
    body: Vec<Statement>,
    max_iterations: Option<crate::ast::MaxIterations>,
    base_offset: i64,
    label: usize,
    span: crate::error::Span,
) -> Result<Vec<Statement>, Statement> {
    Err(Statement::Loop {
        iterator: Some(iterator),
        iterable: Some(iterable),
        body,
        max_iterations,
        threads: ThreadCount::Sequential,
        base_offset,
        label,
        span,
    })
}

fn jumps_to_label(body: &[Statement], label: usize) -> bool {
    body.iter().any(|s| stmt_jumps_to_label(s, label))
}

fn stmt_jumps_to_label(stmt: &Statement, label: usize) -> bool {
    match stmt {
        Statement::Jump(JumpNode { label: Some(l), .. }, _) => *l == label,
        Statement::ExpressionStmt(e) => expr_jumps_to_label(e, label),
        Statement::Assignment { value, .. } => expr_jumps_to_label(value, label),
        Statement::Arena(block, _) => jumps_to_label(&block.body, label),
        // Nested loops have their own label scope; a bare `ret @K` inside
        // them still refers to the outer label numerically, so keep
        // checking nested bodies too.
        Statement::Loop { body, .. } => jumps_to_label(body, label),
        _ => false,
    }
}

fn expr_jumps_to_label(expr: &Expr, label: usize) -> bool {
    match expr {
        Expr::Jump(JumpNode { label: Some(l), .. }, _) => *l == label,
        Expr::Block(body, _) => jumps_to_label(body, label),
        Expr::Match { arms, default, .. } => {
            arms.iter().any(|a| expr_jumps_to_label(&a.result, label))
                || default.as_deref().is_some_and(|d| expr_jumps_to_label(d, label))
        }
        _ => false,
    }
}

/// Replaces every bare reference to `name` with the literal `value`
/// throughout `stmt` (the loop-unrolling equivalent of constant
/// propagation's substitution, scoped to one iteration's copy of the
/// body).
fn substitute_ident_stmt(stmt: &Statement, name: &str, value: f64) -> Statement {
    match stmt {
        Statement::Assignment { name: n, value: v, mutable, update, precision, hot, span } => {
            Statement::Assignment {
                name: n.clone(),
                value: Box::new(substitute_ident_expr(v, name, value)),
                mutable: *mutable,
                update: *update,
                precision: *precision,
                hot: *hot,
                span: span.clone(),
            }
        }
        Statement::ExpressionStmt(e) => Statement::ExpressionStmt(Box::new(substitute_ident_expr(e, name, value))),
        Statement::Loop {
            iterator,
            iterable,
            body,
            max_iterations,
            threads,
            base_offset,
            label,
            span,
        } => Statement::Loop {
            iterator: iterator.clone(),
            iterable: iterable
                .as_ref()
                .map(|e| Box::new(substitute_ident_expr(e, name, value))),
            body: body.iter().map(|s| substitute_ident_stmt(s, name, value)).collect(),
            max_iterations: *max_iterations,
            threads: *threads,
            base_offset: *base_offset,
            label: *label,
            span: span.clone(),
        },
        other => other.clone(),
    }
}

fn substitute_ident_expr(expr: &Expr, name: &str, value: f64) -> Expr {
    match expr {
        Expr::Ident(n, span) if n == name => Expr::Number(value, span.clone()),
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op: op.clone(),
            left: Box::new(substitute_ident_expr(left, name, value)),
            right: Box::new(substitute_ident_expr(right, name, value)),
            span: span.clone(),
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op: op.clone(),
            operand: Box::new(substitute_ident_expr(operand, name, value)),
            span: span.clone(),
        },
        Expr::Call { name: cname, args, span } => Expr::Call {
            name: cname.clone(),
            args: args.iter().map(|a| substitute_ident_expr(a, name, value)).collect(),
            span: span.clone(),
        },
        Expr::Block(body, span) => Expr::Block(
            body.iter().map(|s| substitute_ident_stmt(s, name, value)).collect(),
            span.clone(),
        ),
        Expr::Index { target, index, span } => Expr::Index {
            target: Box::new(substitute_ident_expr(target, name, value)),
            index: Box::new(substitute_ident_expr(index, name, value)),
            span: span.clone(),
        },
        other => other.clone(),
    }
}

/// After the first unrolled copy binds `name`, later copies binding the
/// same `name` become updates (spec: "the second and subsequent
/// occurrences are converted to update form").
fn mark_repeated_assignments(stmt: &mut Statement, seen: &mut HashMap<String, usize>) {
    if let Statement::Assignment { name, mutable, update, .. } = stmt {
        let count = seen.entry(name.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            *mutable = true;
            *update = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostics;
    use std::path::PathBuf;

    fn unroll(src: &str) -> Program {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse(src, &mut diags, &PathBuf::from("<test>"));
        unroll_program(program).0
    }

    #[test]
    fn unrolls_small_range_loop() {
        let program = unroll("@ i in 0..3 { println(i) }\n");
        assert_eq!(program.statements.len(), 3);
    }

    #[test]
    fn leaves_large_range_loop_alone() {
        let program = unroll("@ i in 0..100 { println(i) }\n");
        assert_eq!(program.statements.len(), 1);
        assert!(matches!(program.statements[0], Statement::Loop { .. }));
    }
}
