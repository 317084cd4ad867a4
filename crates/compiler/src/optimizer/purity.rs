//! Pass 7: purity & closure analysis (spec §4.3).
//!
//! Not optimizations — analyses that annotate every `Lambda` node with its
//! derived `is_pure` and `captured` fields (spec §3.2: "A Lambda's
//! `captured vars` is *derived*... empty until closure analysis runs").
//!
//! Purity = no side-effecting calls, no mutable captured bindings, only
//! pure callees. Named lambdas (`f = (x) -> ...`) can call each other, so
//! purity is resolved to a fixed point over the whole program before the
//! per-node rewrite: a lambda is pure only once every named lambda it
//! calls is already known pure.

use crate::ast::{Expr, Program, Statement};
use crate::optimizer::dce::used_idents;
use crate::optimizer::propagate::mutated_names;
use std::collections::{HashMap, HashSet};

pub fn closure_analysis(program: Program) -> Program {
    let statements = program.statements.into_iter().map(annotate_captured_stmt).collect();
    Program { statements }
}

pub fn purity_analysis(program: Program) -> Program {
    let mutated = mutated_names(&program);
    let named = collect_named_lambdas(&program);
    let pure_names = resolve_pure_fixed_point(&named, &mutated);
    let statements = program
        .statements
        .into_iter()
        .map(|s| annotate_purity_stmt(s, &pure_names, &mutated))
        .collect();
    Program { statements }
}

struct NamedLambda {
    params: Vec<String>,
    body: Expr,
}

fn collect_named_lambdas(program: &Program) -> HashMap<String, NamedLambda> {
    let mut out = HashMap::new();
    for stmt in &program.statements {
        if let Statement::Assignment { name, value, .. } = stmt {
            if let Expr::Lambda { params, body, .. } = value.as_ref() {
                out.insert(
                    name.clone(),
                    NamedLambda {
                        params: params.clone(),
                        body: (**body).clone(),
                    },
                );
            }
        }
    }
    out
}

/// Iterates purity membership to a fixed point: a named lambda is pure
/// once its body contains no impure construct and every call it makes
/// targets either a parameter (unknown, assumed impure) or a name already
/// in the pure set. Bounded by the number of named lambdas — each round
/// can only grow the pure set, never shrink it.
fn resolve_pure_fixed_point(named: &HashMap<String, NamedLambda>, mutated: &HashSet<String>) -> HashSet<String> {
    let mut pure: HashSet<String> = HashSet::new();
    for _ in 0..=named.len() {
        let mut changed = false;
        for (name, def) in named {
            if pure.contains(name) {
                continue;
            }
            let captures_mutable = {
                let mut free = HashSet::new();
                used_idents(&def.body, &mut free);
                for p in &def.params {
                    free.remove(p);
                }
                free.iter().any(|n| mutated.contains(n))
            };
            if !captures_mutable && is_pure_body(&def.body, &pure) {
                pure.insert(name.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    pure
}

fn is_pure_body(expr: &Expr, pure_names: &HashSet<String>) -> bool {
    match expr {
        Expr::Number(..) | Expr::String(..) | Expr::Ident(..) | Expr::NamespacedIdent { .. } | Expr::LoopState { .. } => {
            true
        }
        Expr::Call { name, args, .. } => pure_names.contains(name) && args.iter().all(|a| is_pure_body(a, pure_names)),
        Expr::Binary { left, right, .. } => is_pure_body(left, pure_names) && is_pure_body(right, pure_names),
        Expr::Unary { operand, .. } | Expr::Postfix { operand, .. } => is_pure_body(operand, pure_names),
        Expr::Index { target, index, .. } => is_pure_body(target, pure_names) && is_pure_body(index, pure_names),
        Expr::Slice { target, range, .. } => is_pure_body(target, pure_names) && is_pure_body(range, pure_names),
        Expr::Range { start, end, step, .. } => {
            start.as_deref().is_none_or(|e| is_pure_body(e, pure_names))
                && end.as_deref().is_none_or(|e| is_pure_body(e, pure_names))
                && step.as_deref().is_none_or(|e| is_pure_body(e, pure_names))
        }
        Expr::List(items, _) | Expr::Vector(items, _) => items.iter().all(|i| is_pure_body(i, pure_names)),
        Expr::Map { keys, values, .. } => {
            keys.iter().all(|k| is_pure_body(k, pure_names)) && values.iter().all(|v| is_pure_body(v, pure_names))
        }
        Expr::Cast { value, .. } => is_pure_body(value, pure_names),
        Expr::Length(e, _) => is_pure_body(e, pure_names),
        Expr::In { value, collection, .. } => is_pure_body(value, pure_names) && is_pure_body(collection, pure_names),
        Expr::Cons { head, tail, .. } => is_pure_body(head, pure_names) && is_pure_body(tail, pure_names),
        Expr::OrElse { left, right, .. } => is_pure_body(left, pure_names) && is_pure_body(right, pure_names),
        Expr::Lambda { .. } | Expr::MultiLambda { .. } => true,
        Expr::Match { condition, arms, default, .. } => {
            condition.as_deref().is_none_or(|c| is_pure_body(c, pure_names))
                && arms.iter().all(|a| is_pure_body(&a.test, pure_names) && is_pure_body(&a.result, pure_names))
                && default.as_deref().is_none_or(|d| is_pure_body(d, pure_names))
        }
        // DirectCall (unknown target), Block, Send, Parallel, Arena, Unsafe,
        // Jump, Move: treated as impure — any of these may perform or
        // observe a side effect we can't rule out statically.
        _ => false,
    }
}

fn annotate_purity_stmt(stmt: Statement, pure_names: &HashSet<String>, mutated: &HashSet<String>) -> Statement {
    match stmt {
        Statement::Assignment { name, value, mutable, update, precision, hot, span } => Statement::Assignment {
            name,
            value: Box::new(annotate_purity_expr(*value, pure_names, mutated)),
            mutable,
            update,
            precision,
            hot,
            span,
        },
        Statement::TupleAssign { names, mutable, value, span } => Statement::TupleAssign {
            names,
            mutable,
            value: Box::new(annotate_purity_expr(*value, pure_names, mutated)),
            span,
        },
        Statement::ExpressionStmt(e) => {
            Statement::ExpressionStmt(Box::new(annotate_purity_expr(*e, pure_names, mutated)))
        }
        Statement::Loop { iterator, iterable, body, max_iterations, threads, base_offset, label, span } => {
            Statement::Loop {
                iterator,
                iterable: iterable.map(|e| Box::new(annotate_purity_expr(*e, pure_names, mutated))),
                body: body.into_iter().map(|s| annotate_purity_stmt(s, pure_names, mutated)).collect(),
                max_iterations,
                threads,
                base_offset,
                label,
                span,
            }
        }
        Statement::Arena(mut block, span) => {
            block.body = block
                .body
                .into_iter()
                .map(|s| annotate_purity_stmt(s, pure_names, mutated))
                .collect();
            Statement::Arena(block, span)
        }
        Statement::Defer { expr, span } => Statement::Defer {
            expr: Box::new(annotate_purity_expr(*expr, pure_names, mutated)),
            span,
        },
        Statement::Spawn { expr, handler, span } => Statement::Spawn {
            expr: Box::new(annotate_purity_expr(*expr, pure_names, mutated)),
            handler: handler.map(|(params, body)| {
                (params, body.into_iter().map(|s| annotate_purity_stmt(s, pure_names, mutated)).collect())
            }),
            span,
        },
        Statement::Jump(mut jump, span) => {
            jump.value = jump.value.map(|v| Box::new(annotate_purity_expr(*v, pure_names, mutated)));
            Statement::Jump(jump, span)
        }
        other @ (Statement::CStruct(_)
        | Statement::Alias { .. }
        | Statement::Import { .. }
        | Statement::RegisterAssign(_, _)) => other,
    }
}

fn annotate_purity_expr(expr: Expr, pure_names: &HashSet<String>, mutated: &HashSet<String>) -> Expr {
    match expr {
        Expr::Lambda { params, body, captured, nested, span, .. } => {
            let body = Box::new(annotate_purity_expr(*body, pure_names, mutated));
            let captures_mutable = captured.iter().any(|n| mutated.contains(n));
            let is_pure = !captures_mutable && is_pure_body(&body, pure_names);
            Expr::Lambda { params, body, is_pure, captured, nested, span }
        }
        Expr::MultiLambda { arms, span } => Expr::MultiLambda {
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.body = Box::new(annotate_purity_expr(*a.body, pure_names, mutated));
                    a
                })
                .collect(),
            span,
        },
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op,
            left: Box::new(annotate_purity_expr(*left, pure_names, mutated)),
            right: Box::new(annotate_purity_expr(*right, pure_names, mutated)),
            span,
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op,
            operand: Box::new(annotate_purity_expr(*operand, pure_names, mutated)),
            span,
        },
        Expr::Call { name, args, span } => Expr::Call {
            name,
            args: args.into_iter().map(|a| annotate_purity_expr(a, pure_names, mutated)).collect(),
            span,
        },
        Expr::Block(body, span) => {
            Expr::Block(body.into_iter().map(|s| annotate_purity_stmt(s, pure_names, mutated)).collect(), span)
        }
        Expr::Match { condition, arms, default, span } => Expr::Match {
            condition: condition.map(|c| Box::new(annotate_purity_expr(*c, pure_names, mutated))),
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.test = Box::new(annotate_purity_expr(*a.test, pure_names, mutated));
                    a.result = Box::new(annotate_purity_expr(*a.result, pure_names, mutated));
                    a
                })
                .collect(),
            default: default.map(|d| Box::new(annotate_purity_expr(*d, pure_names, mutated))),
            span,
        },
        Expr::List(items, span) => {
            Expr::List(items.into_iter().map(|i| annotate_purity_expr(i, pure_names, mutated)).collect(), span)
        }
        Expr::DirectCall { callee, args, span } => Expr::DirectCall {
            callee: Box::new(annotate_purity_expr(*callee, pure_names, mutated)),
            args: args.into_iter().map(|a| annotate_purity_expr(a, pure_names, mutated)).collect(),
            span,
        },
        other => other,
    }
}

/// Free variables of a lambda body, minus its own parameters — the
/// captured-variable list (spec §4.3 pass 7). Nested lambdas already
/// fold their own captures up through [`used_idents`]'s handling of
/// `Expr::Lambda`, so an outer lambda's captured list transitively
/// includes whatever its nested lambdas need from further out.
fn free_vars(body: &Expr, params: &[String]) -> Vec<String> {
    let mut set = HashSet::new();
    used_idents(body, &mut set);
    for p in params {
        set.remove(p);
    }
    let mut out: Vec<String> = set.into_iter().collect();
    out.sort();
    out
}

fn annotate_captured_stmt(stmt: Statement) -> Statement {
    match stmt {
        Statement::Assignment { name, value, mutable, update, precision, hot, span } => Statement::Assignment {
            name,
            value: Box::new(annotate_captured_expr(*value)),
            mutable,
            update,
            precision,
            hot,
            span,
        },
        Statement::TupleAssign { names, mutable, value, span } => Statement::TupleAssign {
            names,
            mutable,
            value: Box::new(annotate_captured_expr(*value)),
            span,
        },
        Statement::ExpressionStmt(e) => Statement::ExpressionStmt(Box::new(annotate_captured_expr(*e))),
        Statement::Loop { iterator, iterable, body, max_iterations, threads, base_offset, label, span } => {
            Statement::Loop {
                iterator,
                iterable: iterable.map(|e| Box::new(annotate_captured_expr(*e))),
                body: body.into_iter().map(annotate_captured_stmt).collect(),
                max_iterations,
                threads,
                base_offset,
                label,
                span,
            }
        }
        Statement::Arena(mut block, span) => {
            block.body = block.body.into_iter().map(annotate_captured_stmt).collect();
            Statement::Arena(block, span)
        }
        Statement::Defer { expr, span } => Statement::Defer {
            expr: Box::new(annotate_captured_expr(*expr)),
            span,
        },
        Statement::Spawn { expr, handler, span } => Statement::Spawn {
            expr: Box::new(annotate_captured_expr(*expr)),
            handler: handler.map(|(params, body)| (params, body.into_iter().map(annotate_captured_stmt).collect())),
            span,
        },
        Statement::Jump(mut jump, span) => {
            jump.value = jump.value.map(|v| Box::new(annotate_captured_expr(*v)));
            Statement::Jump(jump, span)
        }
        other @ (Statement::CStruct(_)
        | Statement::Alias { .. }
        | Statement::Import { .. }
        | Statement::RegisterAssign(_, _)) => other,
    }
}

fn annotate_captured_expr(expr: Expr) -> Expr {
    match expr {
        Expr::Lambda { params, body, is_pure, nested, span, .. } => {
            let body = Box::new(annotate_captured_expr(*body));
            let captured = free_vars(&body, &params);
            Expr::Lambda { params, body, is_pure, captured, nested, span }
        }
        Expr::MultiLambda { arms, span } => Expr::MultiLambda {
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.body = Box::new(annotate_captured_expr(*a.body));
                    a
                })
                .collect(),
            span,
        },
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op,
            left: Box::new(annotate_captured_expr(*left)),
            right: Box::new(annotate_captured_expr(*right)),
            span,
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op,
            operand: Box::new(annotate_captured_expr(*operand)),
            span,
        },
        Expr::Call { name, args, span } => Expr::Call {
            name,
            args: args.into_iter().map(annotate_captured_expr).collect(),
            span,
        },
        Expr::Block(body, span) => Expr::Block(body.into_iter().map(annotate_captured_stmt).collect(), span),
        Expr::Match { condition, arms, default, span } => Expr::Match {
            condition: condition.map(|c| Box::new(annotate_captured_expr(*c))),
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.test = Box::new(annotate_captured_expr(*a.test));
                    a.result = Box::new(annotate_captured_expr(*a.result));
                    a
                })
                .collect(),
            default: default.map(|d| Box::new(annotate_captured_expr(*d))),
            span,
        },
        Expr::List(items, span) => Expr::List(items.into_iter().map(annotate_captured_expr).collect(), span),
        Expr::DirectCall { callee, args, span } => Expr::DirectCall {
            callee: Box::new(annotate_captured_expr(*callee)),
            args: args.into_iter().map(annotate_captured_expr).collect(),
            span,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostics;
    use std::path::PathBuf;

    fn run(src: &str) -> Program {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse(src, &mut diags, &PathBuf::from("<test>"));
        closure_analysis(purity_analysis(program))
    }

    #[test]
    fn pure_arithmetic_lambda_is_marked_pure() {
        let program = run("square = (x) -> x * x\n");
        match &program.statements[0] {
            Statement::Assignment { value, .. } => {
                assert!(matches!(value.as_ref(), Expr::Lambda { is_pure: true, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lambda_calling_print_is_impure() {
        let program = run("greet = (name) -> print(name)\n");
        match &program.statements[0] {
            Statement::Assignment { value, .. } => {
                assert!(matches!(value.as_ref(), Expr::Lambda { is_pure: false, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn closure_captures_free_variable() {
        let program = run("n = 5\nadder = (x) -> x + n\n");
        match &program.statements[1] {
            Statement::Assignment { value, .. } => match value.as_ref() {
                Expr::Lambda { captured, .. } => assert_eq!(captured, &vec!["n".to_string()]),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
