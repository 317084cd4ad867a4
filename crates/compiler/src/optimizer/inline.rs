//! Pass 4: function inlining (spec §4.3).
//!
//! A lambda is inlined at a call site iff it captures nothing, its body
//! matches a "simple" form (literals, identifiers, binary/unary ops
//! composed only of such), and the call's argument count matches its
//! arity. Body substitution deep-clones the lambda's body per call site
//! ([`super::deep_clone`]) so two inlined copies never alias the same
//! nodes — required for the dead-code/constant-propagation passes that
//! run again next round to treat them independently.

use crate::ast::{Expr, Program, Statement};
use crate::symbols::mentions_ident;
use std::collections::{HashMap, HashSet};

#[derive(Clone)]
struct Inlinable {
    params: Vec<String>,
    body: Expr,
}

pub fn inline_program(program: Program) -> (Program, bool) {
    let table = collect_inlinable(&program);
    if table.is_empty() {
        return (program, false);
    }
    let mut changed = false;
    let statements = program
        .statements
        .into_iter()
        .map(|s| inline_statement(s, &table, &mut changed))
        .collect();
    (Program { statements }, changed)
}

fn collect_inlinable(program: &Program) -> HashMap<String, Inlinable> {
    let mut table = HashMap::new();
    for stmt in &program.statements {
        if let Statement::Assignment {
            name, value, mutable, ..
        } = stmt
        {
            if *mutable {
                continue;
            }
            if let Expr::Lambda { params, body, .. } = value.as_ref() {
                if mentions_ident(body, name) {
                    continue; // self-recursive: never inlined
                }
                if is_simple_body(body) && simple_body_only_uses(body, params) {
                    table.insert(
                        name.clone(),
                        Inlinable {
                            params: params.clone(),
                            body: (**body).clone(),
                        },
                    );
                }
            }
        }
    }
    table
}

/// Spec §4.3 pass 4: "body matches a 'simple' form (literals, identifiers,
/// binary ops composed only of such)". Extended to unary ops over the same
/// restricted grammar, matching the unary-arithmetic cases constant
/// folding already treats uniformly with binary ones.
fn is_simple_body(expr: &Expr) -> bool {
    match expr {
        Expr::Number(..) | Expr::String(..) | Expr::Ident(..) => true,
        Expr::Binary { left, right, .. } => is_simple_body(left) && is_simple_body(right),
        Expr::Unary { operand, .. } => is_simple_body(operand),
        _ => false,
    }
}

fn simple_body_only_uses(expr: &Expr, params: &[String]) -> bool {
    let mut idents = HashSet::new();
    collect_simple_idents(expr, &mut idents);
    idents.iter().all(|i| params.contains(i))
}

fn collect_simple_idents(expr: &Expr, set: &mut HashSet<String>) {
    match expr {
        Expr::Ident(name, _) => {
            set.insert(name.clone());
        }
        Expr::Binary { left, right, .. } => {
            collect_simple_idents(left, set);
            collect_simple_idents(right, set);
        }
        Expr::Unary { operand, .. } => collect_simple_idents(operand, set),
        _ => {}
    }
}

fn substitute(expr: &Expr, bindings: &HashMap<&str, &Expr>) -> Expr {
    match expr {
        Expr::Ident(name, span) => match bindings.get(name.as_str()) {
            Some(arg) => super::deep_clone(*arg),
            None => Expr::Ident(name.clone(), span.clone()),
        },
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op: op.clone(),
            left: Box::new(substitute(left, bindings)),
            right: Box::new(substitute(right, bindings)),
            span: span.clone(),
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op: op.clone(),
            operand: Box::new(substitute(operand, bindings)),
            span: span.clone(),
        },
        other => other.clone(),
    }
}

fn inline_statement(stmt: Statement, table: &HashMap<String, Inlinable>, changed: &mut bool) -> Statement {
    match stmt {
        Statement::Assignment {
            name,
            value,
            mutable,
            update,
            precision,
            hot,
            span,
        } => Statement::Assignment {
            name,
            value: Box::new(inline_expr(*value, table, changed)),
            mutable,
            update,
            precision,
            hot,
            span,
        },
        Statement::TupleAssign { names, mutable, value, span } => Statement::TupleAssign {
            names,
            mutable,
            value: Box::new(inline_expr(*value, table, changed)),
            span,
        },
        Statement::ExpressionStmt(e) => Statement::ExpressionStmt(Box::new(inline_expr(*e, table, changed))),
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
            iterable: iterable.map(|e| Box::new(inline_expr(*e, table, changed))),
            body: body.into_iter().map(|s| inline_statement(s, table, changed)).collect(),
            max_iterations,
            threads,
            base_offset,
            label,
            span,
        },
        Statement::Arena(mut block, span) => {
            block.body = block.body.into_iter().map(|s| inline_statement(s, table, changed)).collect();
            Statement::Arena(block, span)
        }
        Statement::Defer { expr, span } => Statement::Defer {
            expr: Box::new(inline_expr(*expr, table, changed)),
            span,
        },
        Statement::Spawn { expr, handler, span } => Statement::Spawn {
            expr: Box::new(inline_expr(*expr, table, changed)),
            handler: handler
                .map(|(params, body)| (params, body.into_iter().map(|s| inline_statement(s, table, changed)).collect())),
            span,
        },
        Statement::Jump(mut jump, span) => {
            jump.value = jump.value.map(|v| Box::new(inline_expr(*v, table, changed)));
            Statement::Jump(jump, span)
        }
        other @ (Statement::CStruct(_)
        | Statement::Alias { .. }
        | Statement::Import { .. }
        | Statement::RegisterAssign(_, _)) => other,
    }
}

fn inline_expr(expr: Expr, table: &HashMap<String, Inlinable>, changed: &mut bool) -> Expr {
    match expr {
        Expr::Call { name, args, span } => {
            let args: Vec<Expr> = args.into_iter().map(|a| inline_expr(a, table, changed)).collect();
            if let Some(def) = table.get(&name) {
                if def.params.len() == args.len() {
                    let bindings: HashMap<&str, &Expr> =
                        def.params.iter().map(|p| p.as_str()).zip(args.iter()).collect();
                    *changed = true;
                    return substitute(&def.body, &bindings);
                }
            }
            Expr::Call { name, args, span }
        }
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op,
            left: Box::new(inline_expr(*left, table, changed)),
            right: Box::new(inline_expr(*right, table, changed)),
            span,
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op,
            operand: Box::new(inline_expr(*operand, table, changed)),
            span,
        },
        Expr::Block(body, span) => Expr::Block(
            body.into_iter().map(|s| inline_statement(s, table, changed)).collect(),
            span,
        ),
        Expr::Lambda {
            params,
            body,
            is_pure,
            captured,
            nested,
            span,
        } => Expr::Lambda {
            params,
            body: Box::new(inline_expr(*body, table, changed)),
            is_pure,
            captured,
            nested,
            span,
        },
        Expr::Match { condition, arms, default, span } => Expr::Match {
            condition: condition.map(|c| Box::new(inline_expr(*c, table, changed))),
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.test = Box::new(inline_expr(*a.test, table, changed));
                    a.result = Box::new(inline_expr(*a.result, table, changed));
                    a
                })
                .collect(),
            default: default.map(|d| Box::new(inline_expr(*d, table, changed))),
            span,
        },
        Expr::List(items, span) => Expr::List(
            items.into_iter().map(|i| inline_expr(i, table, changed)).collect(),
            span,
        ),
        Expr::DirectCall { callee, args, span } => Expr::DirectCall {
            callee: Box::new(inline_expr(*callee, table, changed)),
            args: args.into_iter().map(|a| inline_expr(a, table, changed)).collect(),
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

    fn inline(src: &str) -> Program {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse(src, &mut diags, &PathBuf::from("<test>"));
        inline_program(program).0
    }

    #[test]
    fn inlines_simple_call_site() {
        let program = inline("square = (x) -> x * x\ny = square(3)\n");
        match &program.statements[1] {
            Statement::Assignment { value, .. } => {
                assert!(matches!(value.as_ref(), Expr::Binary { op, .. } if op == "*"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn does_not_inline_recursive_lambda() {
        let program = inline("fact = (n) -> fact(n - 1)\ny = fact(5)\n");
        match &program.statements[1] {
            Statement::Assignment { value, .. } => {
                assert!(matches!(value.as_ref(), Expr::Call { name, .. } if name == "fact"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
