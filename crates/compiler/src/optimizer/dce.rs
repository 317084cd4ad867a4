//! Pass 3: dead-code elimination (spec §4.3).
//!
//! Live-variable analysis over a statement list, processed back-to-front
//! so each statement sees the set of names referenced by everything after
//! it. An `Assignment` whose only effect is binding a name nothing later
//! references is dropped unless: (a) its value contains a call, a
//! `parallel` evaluation, or a block (any of which may have a side
//! effect the removal would lose), (b) the binding is marked `hot`
//! (spec §6 `# flap:hot`), or (c) it is a lambda that mentions its own
//! name (self-recursive — spec §4.3 pass 3, §8 property 3).

use crate::ast::{Expr, FStringSegment, MatchPattern, Program, Statement};
use crate::symbols::mentions_ident;
use std::collections::HashSet;

pub fn eliminate_dead_code(program: Program) -> (Program, bool) {
    let mut changed = false;
    let mut live = HashSet::new();
    let statements = dce_block(program.statements, &mut live, &mut changed);
    (Program { statements }, changed)
}

/// Processes a statement list back-to-front. `live` is updated in place:
/// on entry it holds the names used *after* this block; on exit it holds
/// the names used by this block or after it (the caller, if this block is
/// nested inside a larger one, should fold that back into its own `live`
/// set after restoring anything block-local — callers in this module
/// always treat nested blocks as closed scopes and re-derive their own
/// `live` contribution via [`used_idents_stmt`], so no leakage occurs).
fn dce_block(stmts: Vec<Statement>, live: &mut HashSet<String>, changed: &mut bool) -> Vec<Statement> {
    let mut kept_rev = Vec::with_capacity(stmts.len());
    for stmt in stmts.into_iter().rev() {
        if let Statement::Assignment {
            name,
            value,
            mutable,
            update,
            precision,
            hot,
            span,
        } = stmt
        {
            let self_recursive = matches!(value.as_ref(), Expr::Lambda { .. } | Expr::MultiLambda { .. })
                && mentions_ident(&value, &name);
            let keep = hot || self_recursive || live.contains(&name) || has_side_effects(&value);
            if !keep {
                *changed = true;
                continue;
            }
            live.remove(&name);
            used_idents(&value, live);
            kept_rev.push(Statement::Assignment {
                name,
                value,
                mutable,
                update,
                precision,
                hot,
                span,
            });
            continue;
        }
        let stmt = dce_nested(stmt, changed);
        used_idents_stmt(&stmt, live);
        kept_rev.push(stmt);
    }
    kept_rev.reverse();
    kept_rev
}

/// Recurses dead-code elimination into a statement's nested statement
/// lists (loop/arena bodies, spawn handlers, block-valued expressions)
/// without touching the statement's own liveness.
fn dce_nested(stmt: Statement, changed: &mut bool) -> Statement {
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
        } => {
            let mut inner_live = HashSet::new();
            let body = dce_block(body, &mut inner_live, changed);
            Statement::Loop {
                iterator,
                iterable,
                body,
                max_iterations,
                threads,
                base_offset,
                label,
                span,
            }
        }
        Statement::Arena(mut block, span) => {
            let mut inner_live = HashSet::new();
            block.body = dce_block(block.body, &mut inner_live, changed);
            Statement::Arena(block, span)
        }
        Statement::Spawn { expr, handler, span } => Statement::Spawn {
            expr,
            handler: handler.map(|(params, body)| {
                let mut inner_live = HashSet::new();
                (params, dce_block(body, &mut inner_live, changed))
            }),
            span,
        },
        Statement::ExpressionStmt(e) => Statement::ExpressionStmt(Box::new(dce_expr(*e, changed))),
        other => other,
    }
}

fn dce_expr(expr: Expr, changed: &mut bool) -> Expr {
    match expr {
        Expr::Block(body, span) => {
            let mut inner_live = HashSet::new();
            Expr::Block(dce_block(body, &mut inner_live, changed), span)
        }
        Expr::Lambda {
            params,
            body,
            is_pure,
            captured,
            nested,
            span,
        } => Expr::Lambda {
            params,
            body: Box::new(dce_expr(*body, changed)),
            is_pure,
            captured,
            nested,
            span,
        },
        Expr::Match { condition, arms, default, span } => Expr::Match {
            condition,
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.result = Box::new(dce_expr(*a.result, changed));
                    a
                })
                .collect(),
            default: default.map(|d| Box::new(dce_expr(*d, changed))),
            span,
        },
        other => other,
    }
}

/// Whether evaluating `expr` can perform an effect DCE must not silently
/// drop: a call, a `parallel` evaluation, or a nested statement block
/// (spec §4.3 pass 3). Does not descend into lambda bodies — those only
/// run when called elsewhere, not as a side effect of the binding itself.
fn has_side_effects(expr: &Expr) -> bool {
    match expr {
        Expr::Call { .. } | Expr::DirectCall { .. } | Expr::Parallel { .. } | Expr::Block(..) => true,
        Expr::Binary { left, right, .. } => has_side_effects(left) || has_side_effects(right),
        Expr::Unary { operand, .. } | Expr::Postfix { operand, .. } => has_side_effects(operand),
        Expr::FString(parts, _) => parts.iter().any(|p| match p {
            FStringSegment::Literal(_) => false,
            FStringSegment::Interpolated(e) => has_side_effects(e),
        }),
        Expr::Index { target, index, .. } => has_side_effects(target) || has_side_effects(index),
        Expr::Slice { target, range, .. } => has_side_effects(target) || has_side_effects(range),
        Expr::List(items, _) | Expr::Vector(items, _) => items.iter().any(has_side_effects),
        Expr::Map { keys, values, .. } => keys.iter().any(has_side_effects) || values.iter().any(has_side_effects),
        Expr::Match { condition, arms, default, .. } => {
            condition.as_deref().is_some_and(has_side_effects)
                || arms.iter().any(|a| has_side_effects(&a.test) || has_side_effects(&a.result))
                || default.as_deref().is_some_and(has_side_effects)
        }
        Expr::Cast { value, .. } => has_side_effects(value),
        Expr::Length(e, _) => has_side_effects(e),
        Expr::In { value, collection, .. } => has_side_effects(value) || has_side_effects(collection),
        Expr::Pipe { value, func, .. } => has_side_effects(value) || has_side_effects(func),
        Expr::Send { .. } => true,
        Expr::Cons { head, tail, .. } => has_side_effects(head) || has_side_effects(tail),
        Expr::OrElse { left, right, .. } => has_side_effects(left) || has_side_effects(right),
        Expr::Arena(..) => true,
        _ => false,
    }
}

/// Free-identifier collector, also reused by closure analysis (the same
/// notion of "names an expression reads" underlies both liveness and
/// captured-variable derivation).
pub(crate) fn used_idents(expr: &Expr, set: &mut HashSet<String>) {
    match expr {
        Expr::Ident(name, _) => {
            set.insert(name.clone());
        }
        Expr::Move(name, _) => {
            set.insert(name.clone());
        }
        Expr::Call { name, args, .. } => {
            set.insert(name.clone());
            for a in args {
                used_idents(a, set);
            }
        }
        Expr::NamespacedIdent { .. } | Expr::Number(..) | Expr::String(..) | Expr::LoopState { .. } => {}
        Expr::FString(parts, _) => {
            for p in parts {
                if let FStringSegment::Interpolated(e) = p {
                    used_idents(e, set);
                }
            }
        }
        Expr::Binary { left, right, .. } => {
            used_idents(left, set);
            used_idents(right, set);
        }
        Expr::Unary { operand, .. } | Expr::Postfix { operand, .. } => used_idents(operand, set),
        Expr::Lambda { body, params, .. } => {
            let mut inner = HashSet::new();
            used_idents(body, &mut inner);
            for p in params {
                inner.remove(p);
            }
            set.extend(inner);
        }
        Expr::MultiLambda { arms, .. } => {
            for a in arms {
                let mut inner = HashSet::new();
                used_idents(&a.body, &mut inner);
                for p in &a.params {
                    if let MatchPattern::Binding(n) = p {
                        inner.remove(n);
                    }
                }
                set.extend(inner);
            }
        }
        Expr::DirectCall { callee, args, .. } => {
            used_idents(callee, set);
            for a in args {
                used_idents(a, set);
            }
        }
        Expr::Index { target, index, .. } => {
            used_idents(target, set);
            used_idents(index, set);
        }
        Expr::Slice { target, range, .. } => {
            used_idents(target, set);
            used_idents(range, set);
        }
        Expr::Range { start, end, step, .. } => {
            if let Some(e) = start {
                used_idents(e, set);
            }
            if let Some(e) = end {
                used_idents(e, set);
            }
            if let Some(e) = step {
                used_idents(e, set);
            }
        }
        Expr::List(items, _) | Expr::Vector(items, _) => {
            for i in items {
                used_idents(i, set);
            }
        }
        Expr::Map { keys, values, .. } => {
            for k in keys {
                used_idents(k, set);
            }
            for v in values {
                used_idents(v, set);
            }
        }
        Expr::Block(body, _) => {
            for s in body {
                used_idents_stmt(s, set);
            }
        }
        Expr::Match { condition, arms, default, .. } => {
            if let Some(c) = condition {
                used_idents(c, set);
            }
            for a in arms {
                used_idents(&a.test, set);
                used_idents(&a.result, set);
            }
            if let Some(d) = default {
                used_idents(d, set);
            }
        }
        Expr::Cast { value, .. } => used_idents(value, set),
        Expr::Length(e, _) => used_idents(e, set),
        Expr::In { value, collection, .. } => {
            used_idents(value, set);
            used_idents(collection, set);
        }
        Expr::Pipe { value, func, .. } => {
            used_idents(value, set);
            used_idents(func, set);
        }
        Expr::Parallel { body, .. } => used_idents(body, set),
        Expr::Send { target, value, .. } => {
            used_idents(target, set);
            if let Some(v) = value {
                used_idents(v, set);
            }
        }
        Expr::Cons { head, tail, .. } => {
            used_idents(head, set);
            used_idents(tail, set);
        }
        Expr::Jump(jump, _) => {
            if let Some(v) = &jump.value {
                used_idents(v, set);
            }
        }
        Expr::Arena(block, _) => {
            for s in &block.body {
                used_idents_stmt(s, set);
            }
        }
        Expr::Unsafe { .. } | Expr::ErrorExpr(_) => {}
        Expr::OrElse { left, right, .. } => {
            used_idents(left, set);
            used_idents(right, set);
        }
    }
}

pub(crate) fn used_idents_stmt(stmt: &Statement, set: &mut HashSet<String>) {
    match stmt {
        Statement::Assignment { value, .. } => used_idents(value, set),
        Statement::TupleAssign { value, .. } => used_idents(value, set),
        Statement::ExpressionStmt(e) => used_idents(e, set),
        Statement::Loop { iterable, body, .. } => {
            if let Some(e) = iterable {
                used_idents(e, set);
            }
            for s in body {
                used_idents_stmt(s, set);
            }
        }
        Statement::Jump(jump, _) => {
            if let Some(v) = &jump.value {
                used_idents(v, set);
            }
        }
        Statement::Arena(block, _) => {
            for s in &block.body {
                used_idents_stmt(s, set);
            }
        }
        Statement::Defer { expr, .. } => used_idents(expr, set),
        Statement::Spawn { expr, handler, .. } => {
            used_idents(expr, set);
            if let Some((_, body)) = handler {
                for s in body {
                    used_idents_stmt(s, set);
                }
            }
        }
        Statement::CStruct(_) | Statement::Alias { .. } | Statement::Import { .. } => {}
        Statement::RegisterAssign(_, _) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostics;
    use std::path::PathBuf;

    fn dce(src: &str) -> Program {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse(src, &mut diags, &PathBuf::from("<test>"));
        eliminate_dead_code(program).0
    }

    #[test]
    fn removes_unused_pure_binding() {
        let program = dce("x = 1 + 2\nprintln(\"hi\")\n");
        assert_eq!(program.statements.len(), 1);
    }

    #[test]
    fn keeps_used_binding() {
        let program = dce("x = 1 + 2\nprintln(x)\n");
        assert_eq!(program.statements.len(), 2);
    }

    #[test]
    fn keeps_hot_binding_even_if_unused() {
        let mut diags = Diagnostics::new();
        let mut program = crate::parser::parse("x = 1\nprintln(\"hi\")\n", &mut diags, &PathBuf::from("<t>"));
        if let Statement::Assignment { hot, .. } = &mut program.statements[0] {
            *hot = true;
        }
        let (program, _) = eliminate_dead_code(program);
        assert_eq!(program.statements.len(), 2);
    }

    #[test]
    fn keeps_self_recursive_unused_lambda() {
        let program = dce("fact = (n) -> fact(n - 1)\nprintln(\"hi\")\n");
        assert_eq!(program.statements.len(), 2);
    }

    #[test]
    fn keeps_binding_with_call_side_effect() {
        let program = dce("x = compute()\nprintln(\"hi\")\n");
        assert_eq!(program.statements.len(), 2);
    }
}
