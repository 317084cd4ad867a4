//! Pass 2: constant propagation (spec §4.3).
//!
//! Forward-substitutes variables bound exactly once via `=` to a literal
//! value. A lambda body gets a shadow scope where its parameters mask
//! outer constants (restored on exit, spec "bindings restored on exit");
//! [`crate::ast::Expr::Move`] is a substitution barrier — since it stores a
//! bare `String` rather than an `Expr::Ident`, it is never itself rewritten,
//! so the original binding is always reachable for the use-after-move
//! check in [`crate::semantics`].
//!
//! Shares the mutation analysis used by dead-code elimination: a single
//! traversal records every name that is ever the target of a mutating
//! operation, and those names never enter the propagation environment.

use crate::ast::{Expr, FStringSegment, Program, Statement};
use std::collections::{HashMap, HashSet};

/// Names that are the target of `<-`/`++`/`--` or an indexed assignment
/// anywhere in the program — excluded from constant propagation (spec
/// §4.3 "Mutation analysis").
pub fn mutated_names(program: &Program) -> HashSet<String> {
    let mut set = HashSet::new();
    for stmt in &program.statements {
        collect_mutated_stmt(stmt, &mut set);
    }
    set
}

fn collect_mutated_stmt(stmt: &Statement, set: &mut HashSet<String>) {
    match stmt {
        Statement::Assignment { value, mutable, name, .. } => {
            if *mutable {
                set.insert(name.clone());
            }
            collect_mutated_expr(value, set);
        }
        Statement::TupleAssign { names, mutable, value, .. } => {
            if *mutable {
                set.extend(names.iter().cloned());
            }
            collect_mutated_expr(value, set);
        }
        Statement::ExpressionStmt(e) => collect_mutated_expr(e, set),
        Statement::Loop { iterable, body, .. } => {
            if let Some(e) = iterable {
                collect_mutated_expr(e, set);
            }
            for s in body {
                collect_mutated_stmt(s, set);
            }
        }
        Statement::Jump(jump, _) => {
            if let Some(v) = &jump.value {
                collect_mutated_expr(v, set);
            }
        }
        Statement::Arena(block, _) => {
            for s in &block.body {
                collect_mutated_stmt(s, set);
            }
        }
        Statement::Defer { expr, .. } => collect_mutated_expr(expr, set),
        Statement::Spawn { expr, handler, .. } => {
            collect_mutated_expr(expr, set);
            if let Some((_, body)) = handler {
                for s in body {
                    collect_mutated_stmt(s, set);
                }
            }
        }
        Statement::CStruct(_) | Statement::Alias { .. } | Statement::Import { .. } => {}
        Statement::RegisterAssign(_, _) => {}
    }
}

fn collect_mutated_expr(expr: &Expr, set: &mut HashSet<String>) {
    match expr {
        Expr::Send { target, value, .. } => {
            if value.is_some() {
                if let Expr::Ident(name, _) = target.as_ref() {
                    set.insert(name.clone());
                }
            }
            collect_mutated_expr(target, set);
            if let Some(v) = value {
                collect_mutated_expr(v, set);
            }
        }
        Expr::Postfix { operand, .. } => {
            if let Expr::Ident(name, _) = operand.as_ref() {
                set.insert(name.clone());
            }
            collect_mutated_expr(operand, set);
        }
        Expr::Index { target, index, .. } => {
            collect_mutated_expr(target, set);
            collect_mutated_expr(index, set);
        }
        _ => walk_children(expr, set),
    }
}

/// Visits every immediate child expression without any special handling
/// (used by [`collect_mutated_expr`]'s fallback arm).
fn walk_children(expr: &Expr, set: &mut HashSet<String>) {
    match expr {
        Expr::Binary { left, right, .. } => {
            collect_mutated_expr(left, set);
            collect_mutated_expr(right, set);
        }
        Expr::Unary { operand, .. } => collect_mutated_expr(operand, set),
        Expr::FString(parts, _) => {
            for p in parts {
                if let FStringSegment::Interpolated(e) = p {
                    collect_mutated_expr(e, set);
                }
            }
        }
        Expr::Lambda { body, .. } => collect_mutated_expr(body, set),
        Expr::MultiLambda { arms, .. } => {
            for a in arms {
                collect_mutated_expr(&a.body, set);
            }
        }
        Expr::Call { args, .. } => {
            for a in args {
                collect_mutated_expr(a, set);
            }
        }
        Expr::DirectCall { callee, args, .. } => {
            collect_mutated_expr(callee, set);
            for a in args {
                collect_mutated_expr(a, set);
            }
        }
        Expr::Slice { target, range, .. } => {
            collect_mutated_expr(target, set);
            collect_mutated_expr(range, set);
        }
        Expr::Range { start, end, step, .. } => {
            if let Some(e) = start {
                collect_mutated_expr(e, set);
            }
            if let Some(e) = end {
                collect_mutated_expr(e, set);
            }
            if let Some(e) = step {
                collect_mutated_expr(e, set);
            }
        }
        Expr::List(items, _) | Expr::Vector(items, _) => {
            for i in items {
                collect_mutated_expr(i, set);
            }
        }
        Expr::Map { keys, values, .. } => {
            for k in keys {
                collect_mutated_expr(k, set);
            }
            for v in values {
                collect_mutated_expr(v, set);
            }
        }
        Expr::Block(body, _) => {
            for s in body {
                collect_mutated_stmt(s, set);
            }
        }
        Expr::Match { condition, arms, default, .. } => {
            if let Some(c) = condition {
                collect_mutated_expr(c, set);
            }
            for a in arms {
                collect_mutated_expr(&a.test, set);
                collect_mutated_expr(&a.result, set);
            }
            if let Some(d) = default {
                collect_mutated_expr(d, set);
            }
        }
        Expr::Cast { value, .. } => collect_mutated_expr(value, set),
        Expr::Length(e, _) => collect_mutated_expr(e, set),
        Expr::In { value, collection, .. } => {
            collect_mutated_expr(value, set);
            collect_mutated_expr(collection, set);
        }
        Expr::Pipe { value, func, .. } => {
            collect_mutated_expr(value, set);
            collect_mutated_expr(func, set);
        }
        Expr::Parallel { body, .. } => collect_mutated_expr(body, set),
        Expr::Cons { head, tail, .. } => {
            collect_mutated_expr(head, set);
            collect_mutated_expr(tail, set);
        }
        Expr::Jump(jump, _) => {
            if let Some(v) = &jump.value {
                collect_mutated_expr(v, set);
            }
        }
        Expr::Arena(block, _) => {
            for s in &block.body {
                collect_mutated_stmt(s, set);
            }
        }
        Expr::OrElse { left, right, .. } => {
            collect_mutated_expr(left, set);
            collect_mutated_expr(right, set);
        }
        Expr::Number(..)
        | Expr::String(..)
        | Expr::Ident(..)
        | Expr::NamespacedIdent { .. }
        | Expr::LoopState { .. }
        | Expr::Unsafe { .. }
        | Expr::Move(..)
        | Expr::ErrorExpr(_)
        | Expr::Postfix { .. }
        | Expr::Index { .. }
        | Expr::Send { .. } => {}
    }
}

type Env = HashMap<String, Expr>;

pub fn propagate_program(program: Program) -> (Program, bool) {
    let mutated = mutated_names(&program);
    let mut changed = false;
    let mut env: Env = HashMap::new();
    let statements = propagate_block(program.statements, &mut env, &mutated, &mut changed);
    (Program { statements }, changed)
}

/// Propagates through a statement list, threading `env` forward so later
/// statements in the *same* list see earlier literal bindings, but never
/// leaking bindings made inside a nested block/lambda back out.
fn propagate_block(
    stmts: Vec<Statement>,
    env: &mut Env,
    mutated: &HashSet<String>,
    changed: &mut bool,
) -> Vec<Statement> {
    let mut out = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        out.push(propagate_stmt(stmt, env, mutated, changed));
    }
    out
}

fn propagate_stmt(stmt: Statement, env: &mut Env, mutated: &HashSet<String>, changed: &mut bool) -> Statement {
    match stmt {
        Statement::Assignment {
            name,
            value,
            mutable,
            update,
            precision,
            hot,
            span,
        } => {
            let value = propagate_expr(*value, env, mutated, changed);
            if !mutable && !mutated.contains(&name) && is_literal(&value) {
                env.insert(name.clone(), value.clone());
            } else {
                env.remove(&name);
            }
            Statement::Assignment {
                name,
                value: Box::new(value),
                mutable,
                update,
                precision,
                hot,
                span,
            }
        }
        Statement::TupleAssign { names, mutable, value, span } => {
            let value = propagate_expr(*value, env, mutated, changed);
            for n in &names {
                env.remove(n);
            }
            Statement::TupleAssign {
                names,
                mutable,
                value: Box::new(value),
                span,
            }
        }
        Statement::ExpressionStmt(e) => {
            Statement::ExpressionStmt(Box::new(propagate_expr(*e, env, mutated, changed)))
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
        } => {
            let iterable = iterable.map(|e| Box::new(propagate_expr(*e, env, mutated, changed)));
            let mut inner = env.clone();
            if let Some(name) = &iterator {
                inner.remove(name);
            }
            let body = propagate_block(body, &mut inner, mutated, changed);
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
        Statement::Jump(mut jump, span) => {
            jump.value = jump.value.map(|v| Box::new(propagate_expr(*v, env, mutated, changed)));
            Statement::Jump(jump, span)
        }
        Statement::Arena(mut block, span) => {
            let mut inner = env.clone();
            block.body = propagate_block(block.body, &mut inner, mutated, changed);
            Statement::Arena(block, span)
        }
        Statement::Defer { expr, span } => Statement::Defer {
            expr: Box::new(propagate_expr(*expr, env, mutated, changed)),
            span,
        },
        Statement::Spawn { expr, handler, span } => Statement::Spawn {
            expr: Box::new(propagate_expr(*expr, env, mutated, changed)),
            handler: handler.map(|(params, body)| {
                let mut inner = env.clone();
                for p in &params {
                    inner.remove(p);
                }
                (params, propagate_block(body, &mut inner, mutated, changed))
            }),
            span,
        },
        other @ (Statement::CStruct(_)
        | Statement::Alias { .. }
        | Statement::Import { .. }
        | Statement::RegisterAssign(_, _)) => other,
    }
}

fn is_literal(expr: &Expr) -> bool {
    matches!(expr, Expr::Number(..) | Expr::String(..))
}

fn propagate_expr(expr: Expr, env: &mut Env, mutated: &HashSet<String>, changed: &mut bool) -> Expr {
    match expr {
        Expr::Ident(name, span) => {
            if let Some(literal) = env.get(&name) {
                *changed = true;
                let mut substituted = literal.clone();
                retag_span(&mut substituted, span);
                substituted
            } else {
                Expr::Ident(name, span)
            }
        }
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op,
            left: Box::new(propagate_expr(*left, env, mutated, changed)),
            right: Box::new(propagate_expr(*right, env, mutated, changed)),
            span,
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op,
            operand: Box::new(propagate_expr(*operand, env, mutated, changed)),
            span,
        },
        Expr::Postfix { op, operand, span } => Expr::Postfix {
            op,
            operand: Box::new(propagate_expr(*operand, env, mutated, changed)),
            span,
        },
        Expr::FString(parts, span) => Expr::FString(
            parts
                .into_iter()
                .map(|p| match p {
                    FStringSegment::Literal(s) => FStringSegment::Literal(s),
                    FStringSegment::Interpolated(e) => {
                        FStringSegment::Interpolated(Box::new(propagate_expr(*e, env, mutated, changed)))
                    }
                })
                .collect(),
            span,
        ),
        Expr::Lambda {
            params,
            body,
            is_pure,
            captured,
            nested,
            span,
        } => {
            // Shadow scope: parameters mask outer constants for the
            // duration of the body, restored once we return (spec §4.3
            // pass 2 "bindings restored on exit").
            let mut inner = env.clone();
            for p in &params {
                inner.remove(p);
            }
            let body = propagate_expr(*body, &mut inner, mutated, changed);
            Expr::Lambda {
                params,
                body: Box::new(body),
                is_pure,
                captured,
                nested,
                span,
            }
        }
        Expr::MultiLambda { arms, span } => Expr::MultiLambda {
            arms: arms
                .into_iter()
                .map(|mut a| {
                    let mut inner = env.clone();
                    for p in &a.params {
                        if let crate::ast::MatchPattern::Binding(n) = p {
                            inner.remove(n);
                        }
                    }
                    a.body = Box::new(propagate_expr(*a.body, &mut inner, mutated, changed));
                    a
                })
                .collect(),
            span,
        },
        Expr::Call { name, args, span } => Expr::Call {
            name,
            args: args
                .into_iter()
                .map(|a| propagate_expr(a, env, mutated, changed))
                .collect(),
            span,
        },
        Expr::DirectCall { callee, args, span } => Expr::DirectCall {
            callee: Box::new(propagate_expr(*callee, env, mutated, changed)),
            args: args
                .into_iter()
                .map(|a| propagate_expr(a, env, mutated, changed))
                .collect(),
            span,
        },
        Expr::Index { target, index, span } => Expr::Index {
            target: Box::new(propagate_expr(*target, env, mutated, changed)),
            index: Box::new(propagate_expr(*index, env, mutated, changed)),
            span,
        },
        Expr::Slice { target, range, span } => Expr::Slice {
            target: Box::new(propagate_expr(*target, env, mutated, changed)),
            range: Box::new(propagate_expr(*range, env, mutated, changed)),
            span,
        },
        Expr::Range { start, end, inclusive, step, span } => Expr::Range {
            start: start.map(|e| Box::new(propagate_expr(*e, env, mutated, changed))),
            end: end.map(|e| Box::new(propagate_expr(*e, env, mutated, changed))),
            inclusive,
            step: step.map(|e| Box::new(propagate_expr(*e, env, mutated, changed))),
            span,
        },
        Expr::List(items, span) => Expr::List(
            items.into_iter().map(|i| propagate_expr(i, env, mutated, changed)).collect(),
            span,
        ),
        Expr::Vector(items, span) => Expr::Vector(
            items.into_iter().map(|i| propagate_expr(i, env, mutated, changed)).collect(),
            span,
        ),
        Expr::Map { keys, values, span } => Expr::Map {
            keys: keys.into_iter().map(|k| propagate_expr(k, env, mutated, changed)).collect(),
            values: values.into_iter().map(|v| propagate_expr(v, env, mutated, changed)).collect(),
            span,
        },
        Expr::Block(body, span) => {
            let mut inner = env.clone();
            Expr::Block(propagate_block(body, &mut inner, mutated, changed), span)
        }
        Expr::Match { condition, arms, default, span } => Expr::Match {
            condition: condition.map(|c| Box::new(propagate_expr(*c, env, mutated, changed))),
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.test = Box::new(propagate_expr(*a.test, env, mutated, changed));
                    a.result = Box::new(propagate_expr(*a.result, env, mutated, changed));
                    a
                })
                .collect(),
            default: default.map(|d| Box::new(propagate_expr(*d, env, mutated, changed))),
            span,
        },
        Expr::Cast { value, target, span } => Expr::Cast {
            value: Box::new(propagate_expr(*value, env, mutated, changed)),
            target,
            span,
        },
        Expr::Length(e, span) => Expr::Length(Box::new(propagate_expr(*e, env, mutated, changed)), span),
        Expr::In { value, collection, span } => Expr::In {
            value: Box::new(propagate_expr(*value, env, mutated, changed)),
            collection: Box::new(propagate_expr(*collection, env, mutated, changed)),
            span,
        },
        Expr::Pipe { value, func, span } => Expr::Pipe {
            value: Box::new(propagate_expr(*value, env, mutated, changed)),
            func: Box::new(propagate_expr(*func, env, mutated, changed)),
            span,
        },
        Expr::Parallel { threads, body, span } => Expr::Parallel {
            threads,
            body: Box::new(propagate_expr(*body, env, mutated, changed)),
            span,
        },
        Expr::Send { target, value, span } => Expr::Send {
            target: Box::new(propagate_expr(*target, env, mutated, changed)),
            value: value.map(|v| Box::new(propagate_expr(*v, env, mutated, changed))),
            span,
        },
        Expr::Cons { head, tail, span } => Expr::Cons {
            head: Box::new(propagate_expr(*head, env, mutated, changed)),
            tail: Box::new(propagate_expr(*tail, env, mutated, changed)),
            span,
        },
        Expr::Jump(mut jump, span) => {
            jump.value = jump.value.map(|v| Box::new(propagate_expr(*v, env, mutated, changed)));
            Expr::Jump(jump, span)
        }
        Expr::Arena(mut block, span) => {
            let mut inner = env.clone();
            block.body = propagate_block(block.body, &mut inner, mutated, changed);
            Expr::Arena(block, span)
        }
        Expr::OrElse { left, right, span } => Expr::OrElse {
            left: Box::new(propagate_expr(*left, env, mutated, changed)),
            right: Box::new(propagate_expr(*right, env, mutated, changed)),
            span,
        },
        // Move is a substitution barrier by construction: it stores a raw
        // name, not an Expr::Ident, so there is nothing here to rewrite.
        other @ (Expr::Number(..)
        | Expr::String(..)
        | Expr::NamespacedIdent { .. }
        | Expr::LoopState { .. }
        | Expr::Unsafe { .. }
        | Expr::Move(..)
        | Expr::ErrorExpr(_)) => other,
    }
}

fn retag_span(expr: &mut Expr, span: crate::error::Span) {
    match expr {
        Expr::Number(_, s) | Expr::String(_, s) => *s = span,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostics;
    use std::path::PathBuf;

    fn propagate(src: &str) -> Program {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse(src, &mut diags, &PathBuf::from("<test>"));
        propagate_program(program).0
    }

    #[test]
    fn substitutes_single_binding() {
        let program = propagate("x = 5\ny = x + 1\n");
        match &program.statements[1] {
            Statement::Assignment { value, .. } => match value.as_ref() {
                Expr::Binary { left, .. } => assert_eq!(left.as_number(), Some(5.0)),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mutable_binding_is_not_propagated() {
        let program = propagate("x := 5\nx <- x + 1\ny = x\n");
        match &program.statements[2] {
            Statement::Assignment { value, .. } => assert!(matches!(value.as_ref(), Expr::Ident(..))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lambda_param_shadows_outer_constant() {
        let program = propagate("x = 5\nf = (x) -> x + 1\n");
        match &program.statements[1] {
            Statement::Assignment { value, .. } => match value.as_ref() {
                Expr::Lambda { body, .. } => match body.as_ref() {
                    Expr::Binary { left, .. } => assert!(matches!(left.as_ref(), Expr::Ident(..))),
                    other => panic!("unexpected {other:?}"),
                },
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
