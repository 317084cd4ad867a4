//! Pass 1: constant folding (spec §4.3).
//!
//! Arithmetic, comparison, logical (`and`/`or`/`xor`), unary
//! `-`/`not`/`~b`, bitwise, modulo, and power over two [`Expr::Number`]
//! literals fold to their result literal. Division/modulo by a literal
//! zero are **not** folded (spec §4.3 pass 1, §8 property 2) — the
//! `Binary` node survives so the code generator emits the runtime `dv0`
//! error-NaN check (spec §4.6 "Binary arithmetic").

use crate::ast::{Expr, FStringSegment, Program, Statement};

/// Attempt to fold a binary operator over two already-numeric operands.
/// Returns `None` for division/modulo by zero (must stay unfolded) or an
/// unrecognized operator (defensive default; every operator the parser
/// can produce is covered below).
pub fn fold_binary(op: &str, l: f64, r: f64) -> Option<f64> {
    match op {
        "+" => Some(l + r),
        "-" => Some(l - r),
        "*" => Some(l * r),
        "/" => {
            if r == 0.0 {
                None
            } else {
                Some(l / r)
            }
        }
        "%" => {
            if r == 0.0 {
                None
            } else {
                Some(l % r)
            }
        }
        "**" => Some(l.powf(r)),
        "==" => Some(bool_f64(l == r)),
        "!=" | "<>" => Some(bool_f64(l != r)),
        "<" => Some(bool_f64(l < r)),
        "<=" => Some(bool_f64(l <= r)),
        ">" => Some(bool_f64(l > r)),
        ">=" => Some(bool_f64(l >= r)),
        "and" => Some(bool_f64(truthy(l) && truthy(r))),
        "or" => Some(bool_f64(truthy(l) || truthy(r))),
        "xor" => Some(bool_f64(truthy(l) ^ truthy(r))),
        "&b" => Some(((l as i64) & (r as i64)) as f64),
        "|b" => Some(((l as i64) | (r as i64)) as f64),
        "^b" => Some(((l as i64) ^ (r as i64)) as f64),
        "<<b" => Some(((l as i64) << ((r as i64) & 63)) as f64),
        ">>b" => Some(((l as i64) >> ((r as i64) & 63)) as f64),
        "<<<b" => Some(((l as u64).rotate_left((r as u64 & 63) as u32)) as f64),
        ">>>b" => Some(((l as u64).rotate_right((r as u64 & 63) as u32)) as f64),
        _ => None,
    }
}

pub fn fold_unary(op: &str, v: f64) -> Option<f64> {
    match op {
        "-" => Some(-v),
        "not" => Some(bool_f64(!truthy(v))),
        "~b" => Some((!(v as i64)) as f64),
        "^" => Some(v), // length/identity-style unary used elsewhere; no-op on a bare number
        _ => None,
    }
}

fn truthy(v: f64) -> bool {
    v != 0.0 && !v.is_nan()
}

fn bool_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

pub fn fold_program(program: Program) -> (Program, bool) {
    let mut changed = false;
    let statements = program
        .statements
        .into_iter()
        .map(|s| fold_statement(s, &mut changed))
        .collect();
    (Program { statements }, changed)
}

fn fold_statement(stmt: Statement, changed: &mut bool) -> Statement {
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
            value: Box::new(fold_expr(*value, changed)),
            mutable,
            update,
            precision,
            hot,
            span,
        },
        Statement::TupleAssign {
            names,
            mutable,
            value,
            span,
        } => Statement::TupleAssign {
            names,
            mutable,
            value: Box::new(fold_expr(*value, changed)),
            span,
        },
        Statement::ExpressionStmt(e) => Statement::ExpressionStmt(Box::new(fold_expr(*e, changed))),
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
            iterable: iterable.map(|e| Box::new(fold_expr(*e, changed))),
            body: fold_block(body, changed),
            max_iterations,
            threads,
            base_offset,
            label,
            span,
        },
        Statement::Jump(mut jump, span) => {
            jump.value = jump.value.map(|v| Box::new(fold_expr(*v, changed)));
            Statement::Jump(jump, span)
        }
        Statement::Arena(mut block, span) => {
            block.body = fold_block(block.body, changed);
            Statement::Arena(block, span)
        }
        Statement::Defer { expr, span } => Statement::Defer {
            expr: Box::new(fold_expr(*expr, changed)),
            span,
        },
        Statement::Spawn { expr, handler, span } => Statement::Spawn {
            expr: Box::new(fold_expr(*expr, changed)),
            handler: handler.map(|(params, body)| (params, fold_block(body, changed))),
            span,
        },
        other @ (Statement::CStruct(_)
        | Statement::Alias { .. }
        | Statement::Import { .. }
        | Statement::RegisterAssign(_, _)) => other,
    }
}

fn fold_block(body: Vec<Statement>, changed: &mut bool) -> Vec<Statement> {
    body.into_iter().map(|s| fold_statement(s, changed)).collect()
}

fn fold_expr(expr: Expr, changed: &mut bool) -> Expr {
    match expr {
        Expr::Binary { op, left, right, span } => {
            let left = fold_expr(*left, changed);
            let right = fold_expr(*right, changed);
            if let (Some(l), Some(r)) = (left.as_number(), right.as_number()) {
                if let Some(v) = fold_binary(&op, l, r) {
                    *changed = true;
                    return Expr::Number(v, span);
                }
            }
            Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            }
        }
        Expr::Unary { op, operand, span } => {
            let operand = fold_expr(*operand, changed);
            if let Some(v) = operand.as_number() {
                if let Some(folded) = fold_unary(&op, v) {
                    *changed = true;
                    return Expr::Number(folded, span);
                }
            }
            Expr::Unary {
                op,
                operand: Box::new(operand),
                span,
            }
        }
        Expr::Postfix { op, operand, span } => Expr::Postfix {
            op,
            operand: Box::new(fold_expr(*operand, changed)),
            span,
        },
        Expr::FString(parts, span) => Expr::FString(
            parts
                .into_iter()
                .map(|p| match p {
                    FStringSegment::Literal(s) => FStringSegment::Literal(s),
                    FStringSegment::Interpolated(e) => {
                        FStringSegment::Interpolated(Box::new(fold_expr(*e, changed)))
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
        } => Expr::Lambda {
            params,
            body: Box::new(fold_expr(*body, changed)),
            is_pure,
            captured,
            nested,
            span,
        },
        Expr::MultiLambda { arms, span } => Expr::MultiLambda {
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.body = Box::new(fold_expr(*a.body, changed));
                    a
                })
                .collect(),
            span,
        },
        Expr::Call { name, args, span } => Expr::Call {
            name,
            args: args.into_iter().map(|a| fold_expr(a, changed)).collect(),
            span,
        },
        Expr::DirectCall { callee, args, span } => Expr::DirectCall {
            callee: Box::new(fold_expr(*callee, changed)),
            args: args.into_iter().map(|a| fold_expr(a, changed)).collect(),
            span,
        },
        Expr::Index { target, index, span } => Expr::Index {
            target: Box::new(fold_expr(*target, changed)),
            index: Box::new(fold_expr(*index, changed)),
            span,
        },
        Expr::Slice { target, range, span } => Expr::Slice {
            target: Box::new(fold_expr(*target, changed)),
            range: Box::new(fold_expr(*range, changed)),
            span,
        },
        Expr::Range {
            start,
            end,
            inclusive,
            step,
            span,
        } => Expr::Range {
            start: start.map(|e| Box::new(fold_expr(*e, changed))),
            end: end.map(|e| Box::new(fold_expr(*e, changed))),
            inclusive,
            step: step.map(|e| Box::new(fold_expr(*e, changed))),
            span,
        },
        Expr::List(items, span) => {
            Expr::List(items.into_iter().map(|i| fold_expr(i, changed)).collect(), span)
        }
        Expr::Vector(items, span) => {
            Expr::Vector(items.into_iter().map(|i| fold_expr(i, changed)).collect(), span)
        }
        Expr::Map { keys, values, span } => Expr::Map {
            keys: keys.into_iter().map(|k| fold_expr(k, changed)).collect(),
            values: values.into_iter().map(|v| fold_expr(v, changed)).collect(),
            span,
        },
        Expr::Block(body, span) => Expr::Block(fold_block(body, changed), span),
        Expr::Match {
            condition,
            arms,
            default,
            span,
        } => Expr::Match {
            condition: condition.map(|c| Box::new(fold_expr(*c, changed))),
            arms: arms
                .into_iter()
                .map(|mut a| {
                    a.test = Box::new(fold_expr(*a.test, changed));
                    a.result = Box::new(fold_expr(*a.result, changed));
                    a
                })
                .collect(),
            default: default.map(|d| Box::new(fold_expr(*d, changed))),
            span,
        },
        Expr::Cast { value, target, span } => Expr::Cast {
            value: Box::new(fold_expr(*value, changed)),
            target,
            span,
        },
        Expr::Length(e, span) => Expr::Length(Box::new(fold_expr(*e, changed)), span),
        Expr::In { value, collection, span } => Expr::In {
            value: Box::new(fold_expr(*value, changed)),
            collection: Box::new(fold_expr(*collection, changed)),
            span,
        },
        Expr::Pipe { value, func, span } => Expr::Pipe {
            value: Box::new(fold_expr(*value, changed)),
            func: Box::new(fold_expr(*func, changed)),
            span,
        },
        Expr::Parallel { threads, body, span } => Expr::Parallel {
            threads,
            body: Box::new(fold_expr(*body, changed)),
            span,
        },
        Expr::Send { target, value, span } => Expr::Send {
            target: Box::new(fold_expr(*target, changed)),
            value: value.map(|v| Box::new(fold_expr(*v, changed))),
            span,
        },
        Expr::Cons { head, tail, span } => Expr::Cons {
            head: Box::new(fold_expr(*head, changed)),
            tail: Box::new(fold_expr(*tail, changed)),
            span,
        },
        Expr::Jump(mut jump, span) => {
            jump.value = jump.value.map(|v| Box::new(fold_expr(*v, changed)));
            Expr::Jump(jump, span)
        }
        Expr::Arena(mut block, span) => {
            block.body = fold_block(block.body, changed);
            Expr::Arena(block, span)
        }
        Expr::OrElse { left, right, span } => Expr::OrElse {
            left: Box::new(fold_expr(*left, changed)),
            right: Box::new(fold_expr(*right, changed)),
            span,
        },
        other @ (Expr::Number(..)
        | Expr::String(..)
        | Expr::Ident(..)
        | Expr::NamespacedIdent { .. }
        | Expr::LoopState { .. }
        | Expr::Unsafe { .. }
        | Expr::Move(..)
        | Expr::ErrorExpr(_)) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostics;
    use std::path::PathBuf;

    fn fold_src(src: &str) -> Program {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse(src, &mut diags, &PathBuf::from("<test>"));
        fold_program(program).0
    }

    #[test]
    fn folds_arithmetic() {
        let program = fold_src("x = 1 + 2 * 3\n");
        match &program.statements[0] {
            Statement::Assignment { value, .. } => assert_eq!(value.as_number(), Some(7.0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn leaves_division_by_zero_unfolded() {
        let program = fold_src("x = 10 / 0\n");
        match &program.statements[0] {
            Statement::Assignment { value, .. } => {
                assert!(matches!(value.as_ref(), Expr::Binary { op, .. } if op == "/"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
