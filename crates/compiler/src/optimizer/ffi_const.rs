//! FFI `#define` constant resolution (`SPEC_FULL.md` §4 supplement).
//!
//! Runs once, before the fixed-point optimizer: a `NamespacedIdent`
//! (`errno.EINTR`, `math.M_PI`, ...) that the catalog recognizes as a
//! header-derived numeric constant becomes a plain `Number` literal, so
//! constant folding treats arithmetic on FFI constants exactly like
//! arithmetic on literals written by hand. A `NamespacedIdent` the
//! catalog has no `constant` record for (an ordinary function reference)
//! is left untouched for the code generator to resolve at call sites.

use crate::ast::{Expr, Program, Statement};
use flapc_catalog::SymbolCatalog;

pub fn resolve_ffi_constants(program: Program, catalog: &dyn SymbolCatalog) -> Program {
    let statements = program.statements.into_iter().map(|s| resolve_stmt(s, catalog)).collect();
    Program { statements }
}

fn resolve_stmt(stmt: Statement, catalog: &dyn SymbolCatalog) -> Statement {
    match stmt {
        Statement::Assignment { name, value, mutable, update, precision, hot, span } => Statement::Assignment {
            name,
            value: Box::new(resolve_expr(*value, catalog)),
            mutable,
            update,
            precision,
            hot,
            span,
        },
        Statement::TupleAssign { names, mutable, value, span } => Statement::TupleAssign {
            names,
            mutable,
            value: Box::new(resolve_expr(*value, catalog)),
            span,
        },
        Statement::ExpressionStmt(e) => Statement::ExpressionStmt(Box::new(resolve_expr(*e, catalog))),
        Statement::Loop { iterator, iterable, body, max_iterations, threads, base_offset, label, span } => {
            Statement::Loop {
                iterator,
                iterable: iterable.map(|e| Box::new(resolve_expr(*e, catalog))),
                body: body.into_iter().map(|s| resolve_stmt(s, catalog)).collect(),
                max_iterations,
                threads,
                base_offset,
                label,
                span,
            }
        }
        Statement::Arena(mut block, span) => {
            block.body = block.body.into_iter().map(|s| resolve_stmt(s, catalog)).collect();
            Statement::Arena(block, span)
        }
        Statement::Defer { expr, span } => Statement::Defer {
            expr: Box::new(resolve_expr(*expr, catalog)),
            span,
        },
        Statement::Spawn { expr, handler, span } => Statement::Spawn {
            expr: Box::new(resolve_expr(*expr, catalog)),
            handler: handler.map(|(params, body)| (params, body.into_iter().map(|s| resolve_stmt(s, catalog)).collect())),
            span,
        },
        Statement::Jump(mut jump, span) => {
            jump.value = jump.value.map(|v| Box::new(resolve_expr(*v, catalog)));
            Statement::Jump(jump, span)
        }
        other @ (Statement::CStruct(_)
        | Statement::Alias { .. }
        | Statement::Import { .. }
        | Statement::RegisterAssign(_, _)) => other,
    }
}

fn resolve_expr(expr: Expr, catalog: &dyn SymbolCatalog) -> Expr {
    match expr {
        Expr::NamespacedIdent { namespace, name, span } => {
            match catalog.constant(&namespace, &name) {
                Some(value) => Expr::Number(value, span),
                None => Expr::NamespacedIdent { namespace, name, span },
            }
        }
        Expr::Binary { op, left, right, span } => Expr::Binary {
            op,
            left: Box::new(resolve_expr(*left, catalog)),
            right: Box::new(resolve_expr(*right, catalog)),
            span,
        },
        Expr::Unary { op, operand, span } => Expr::Unary {
            op,
            operand: Box::new(resolve_expr(*operand, catalog)),
            span,
        },
        Expr::Postfix { op, operand, span } => Expr::Postfix {
            op,
            operand: Box::new(resolve_expr(*operand, catalog)),
            span,
        },
        Expr::Call { name, args, span } => Expr::Call {
            name,
            args: args.into_iter().map(|a| resolve_expr(a, catalog)).collect(),
            span,
        },
        Expr::DirectCall { callee, args, span } => Expr::DirectCall {
            callee: Box::new(resolve_expr(*callee, catalog)),
            args: args.into_iter().map(|a| resolve_expr(a, catalog)).collect(),
            span,
        },
        Expr::Index { target, index, span } => Expr::Index {
            target: Box::new(resolve_expr(*target, catalog)),
            index: Box::new(resolve_expr(*index, catalog)),
            span,
        },
        Expr::Slice { target, range, span } => Expr::Slice {
            target: Box::new(resolve_expr(*target, catalog)),
            range: Box::new(resolve_expr(*range, catalog)),
            span,
        },
        Expr::Range { start, end, inclusive, step, span } => Expr::Range {
            start: start.map(|e| Box::new(resolve_expr(*e, catalog))),
            end: end.map(|e| Box::new(resolve_expr(*e, catalog))),
            inclusive,
            step: step.map(|e| Box::new(resolve_expr(*e, catalog))),
            span,
        },
        Expr::List(items, span) => Expr::List(items.into_iter().map(|i| resolve_expr(i, catalog)).collect(), span),
        Expr::Vector(items, span) => Expr::Vector(items.into_iter().map(|i| resolve_expr(i, catalog)).collect(), span),
        Expr::Map { keys, values, span } => Expr::Map {
            keys: keys.into_iter().map(|k| resolve_expr(k, catalog)).collect(),
            values: values.into_iter().map(|v| resolve_expr(v, catalog)).collect(),
            span,
        },
        Expr::Block(body, span) => Expr::Block(body.into_iter().map(|s| resolve_stmt(s, catalog)).collect(), span),
        Expr::Match { condition, arms, default, span } => Expr::Match {
            condition: condition.map(|c| Box::new(resolve_expr(*c, catalog))),
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.test = Box::new(resolve_expr(*a.test, catalog));
                    a.result = Box::new(resolve_expr(*a.result, catalog));
                    a
                })
                .collect(),
            default: default.map(|d| Box::new(resolve_expr(*d, catalog))),
            span,
        },
        Expr::Cast { value, target, span } => Expr::Cast {
            value: Box::new(resolve_expr(*value, catalog)),
            target,
            span,
        },
        Expr::Length(e, span) => Expr::Length(Box::new(resolve_expr(*e, catalog)), span),
        Expr::In { value, collection, span } => Expr::In {
            value: Box::new(resolve_expr(*value, catalog)),
            collection: Box::new(resolve_expr(*collection, catalog)),
            span,
        },
        Expr::Pipe { value, func, span } => Expr::Pipe {
            value: Box::new(resolve_expr(*value, catalog)),
            func: Box::new(resolve_expr(*func, catalog)),
            span,
        },
        Expr::Parallel { threads, body, span } => Expr::Parallel {
            threads,
            body: Box::new(resolve_expr(*body, catalog)),
            span,
        },
        Expr::Send { target, value, span } => Expr::Send {
            target: Box::new(resolve_expr(*target, catalog)),
            value: value.map(|v| Box::new(resolve_expr(*v, catalog))),
            span,
        },
        Expr::Cons { head, tail, span } => Expr::Cons {
            head: Box::new(resolve_expr(*head, catalog)),
            tail: Box::new(resolve_expr(*tail, catalog)),
            span,
        },
        Expr::OrElse { left, right, span } => Expr::OrElse {
            left: Box::new(resolve_expr(*left, catalog)),
            right: Box::new(resolve_expr(*right, catalog)),
            span,
        },
        Expr::Lambda { params, body, is_pure, captured, nested, span } => Expr::Lambda {
            params,
            body: Box::new(resolve_expr(*body, catalog)),
            is_pure,
            captured,
            nested,
            span,
        },
        Expr::MultiLambda { arms, span } => Expr::MultiLambda {
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.body = Box::new(resolve_expr(*a.body, catalog));
                    a
                })
                .collect(),
            span,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostics;
    use flapc_catalog::TomlCatalog;
    use std::path::PathBuf;

    #[test]
    fn resolves_known_constant_to_number() {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse("x = errno.EINTR\n", &mut diags, &PathBuf::from("<test>"));
        let catalog = TomlCatalog::from_toml(
            r#"
            [[library]]
            name = "libc"
            soname = "libc.so.6"
            [[library.constant]]
            namespace = "errno"
            name = "EINTR"
            value = 4.0
            "#,
        )
        .expect("manifest should parse");
        let resolved = resolve_ffi_constants(program, &catalog);
        match &resolved.statements[0] {
            Statement::Assignment { value, .. } => assert!(matches!(value.as_ref(), Expr::Number(v, _) if *v == 4.0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn leaves_unknown_namespaced_ident_alone() {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse("x = libc.malloc\n", &mut diags, &PathBuf::from("<test>"));
        let catalog = TomlCatalog::default();
        let resolved = resolve_ffi_constants(program, &catalog);
        match &resolved.statements[0] {
            Statement::Assignment { value, .. } => {
                assert!(matches!(value.as_ref(), Expr::NamespacedIdent { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
