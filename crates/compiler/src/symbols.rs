//! Symbol Collector (spec §4.4, §3.3)
//!
//! Walks the optimized AST to enumerate every named binding in declaration
//! order, assigning each a 16-byte-aligned negative frame-pointer offset
//! (spec §3.3 "Variable slot"). Function records are emitted for every
//! lambda; recursive self-reference is detected so the code generator can
//! tail-call-optimize. `cstruct` declarations are registered as
//! compile-time constants (`T.size`, `T.field.offset`).
//!
//! Grounded on the teacher's `resolver.rs` (a pre-codegen walk that
//! assigns stable identities to every binding before the generator runs).

use crate::ast::{Expr, FStringSegment, MatchPattern, Program, Statement};
use crate::error::Span;
use flapc_catalog::CType;
use std::collections::HashMap;

/// Every 64-bit (f64-valued) local occupies one 16-byte-aligned slot below
/// `rbp` (spec §3.3).
pub const SLOT_SIZE: i64 = 16;

/// A named local's storage location before register allocation narrows it
/// further (spec §4.5 "Output").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Negative offset from `rbp`, e.g. `-16`, `-32`, ...
    pub frame_offset: i64,
}

/// One function discovered while walking the program: either a top-level
/// `Lambda`/`MultiLambda` binding or a nested closure (spec §3.3
/// "Function record").
#[derive(Debug, Clone)]
pub struct FunctionRecord {
    pub id: usize,
    pub name: Option<String>,
    pub params: Vec<String>,
    pub captured: Vec<String>,
    /// Filled in by the code generator once the function's entry label has
    /// a known offset into `.text`.
    pub entry_offset: Option<usize>,
    /// True if the body mentions the binding's own name (spec §4.4; also
    /// spec §4.3 pass 3 "Recursive lambdas ... treated as self-referencing
    /// and kept live").
    pub is_recursive: bool,
    pub is_pure: bool,
    /// Local slot table for this function's own frame, keyed by name.
    pub slots: HashMap<String, Slot>,
    pub slot_count: usize,
}

impl FunctionRecord {
    pub fn frame_size(&self) -> i64 {
        let raw = self.slot_count as i64 * SLOT_SIZE;
        // Stack must be 16-byte aligned before `call` (spec §4.5
        // "Prologue/epilogue"); the frame itself already is since
        // SLOT_SIZE is 16, but keep the rule explicit for future slot
        // sizes.
        (raw + 15) & !15
    }
}

#[derive(Debug, Clone)]
pub struct CStructInfo {
    pub size: u32,
    pub align: u32,
    pub fields: Vec<(String, CType, u32)>,
}

/// Output of the symbol-collection pass: one slot table per function plus
/// the registered `cstruct` layouts (spec §3.3 "CStruct record").
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub functions: Vec<FunctionRecord>,
    pub cstructs: HashMap<String, CStructInfo>,
    /// Top-level slot table (for the program's implicit `main` frame).
    pub top_level: HashMap<String, Slot>,
    pub top_level_slot_count: usize,
    /// Maps a `Lambda`/`MultiLambda` expression's own span to the
    /// `FunctionRecord` id collected for it, so the code generator can
    /// resolve *any* occurrence of a lambda node — not just one that is
    /// the direct right-hand side of a top-level assignment — to its
    /// compiled entry address (spec §3.3 "Closure object": "pointer to
    /// code + tuple of captured values"). A span is unique per lambda
    /// since no two lambdas occupy the same source location.
    pub lambda_ids: HashMap<Span, usize>,
}

impl SymbolTable {
    /// Looks up a named top-level function's id by name, for the code
    /// generator's `Call`/`Pipe` lowering (spec §4.6 "Call").
    pub fn function_id(&self, name: &str) -> Option<usize> {
        self.functions.iter().find(|f| f.name.as_deref() == Some(name)).map(|f| f.id)
    }

    /// Looks up the `FunctionRecord` id collected for a `Lambda`/
    /// `MultiLambda` expression node by its own span (spec §4.6 "a
    /// lambda used as a value ... lowers to its entry-point address").
    pub fn lambda_id(&self, span: &Span) -> Option<usize> {
        self.lambda_ids.get(span).copied()
    }

    pub fn function_by_id(&self, id: usize) -> Option<&FunctionRecord> {
        self.functions.iter().find(|f| f.id == id)
    }

    pub fn cstruct_constant(&self, struct_name: &str, member: &str) -> Option<f64> {
        let info = self.cstructs.get(struct_name)?;
        if member == "size" {
            return Some(info.size as f64);
        }
        None
    }

    pub fn cstruct_field_offset(&self, struct_name: &str, field: &str) -> Option<f64> {
        let info = self.cstructs.get(struct_name)?;
        info.fields
            .iter()
            .find(|(n, _, _)| n == field)
            .map(|(_, _, off)| *off as f64)
    }
}

/// Scope-local slot allocator: assigns the next free 16-byte slot the
/// first time a name is seen, in declaration order (spec §4.4 "in
/// declaration order").
struct ScopeBuilder {
    slots: HashMap<String, Slot>,
    next_index: usize,
}

impl ScopeBuilder {
    fn new() -> Self {
        ScopeBuilder {
            slots: HashMap::new(),
            next_index: 0,
        }
    }

    fn bind(&mut self, name: &str) {
        if !self.slots.contains_key(name) {
            let offset = -((self.next_index as i64 + 1) * SLOT_SIZE);
            self.slots.insert(name.to_string(), Slot { frame_offset: offset });
            self.next_index += 1;
        }
    }
}

pub struct Collector {
    next_fn_id: usize,
    functions: Vec<FunctionRecord>,
    cstructs: HashMap<String, CStructInfo>,
    lambda_ids: HashMap<Span, usize>,
}

impl Collector {
    pub fn new() -> Self {
        Collector {
            next_fn_id: 0,
            functions: Vec::new(),
            cstructs: HashMap::new(),
            lambda_ids: HashMap::new(),
        }
    }

    pub fn collect(mut self, program: &Program) -> SymbolTable {
        let mut top = ScopeBuilder::new();
        for stmt in &program.statements {
            self.collect_statement(stmt, &mut top);
        }
        SymbolTable {
            functions: self.functions,
            cstructs: self.cstructs,
            top_level_slot_count: top.next_index,
            top_level: top.slots,
            lambda_ids: self.lambda_ids,
        }
    }

    fn collect_statement(&mut self, stmt: &Statement, scope: &mut ScopeBuilder) {
        match stmt {
            Statement::Assignment { name, value, .. } => {
                scope.bind(name);
                self.collect_expr_named(value, scope, Some(name.as_str()));
            }
            Statement::TupleAssign { names, value, .. } => {
                for n in names {
                    scope.bind(n);
                }
                self.collect_expr(value, scope);
            }
            Statement::ExpressionStmt(e) => self.collect_expr(e, scope),
            Statement::Loop {
                iterator,
                iterable,
                body,
                ..
            } => {
                if let Some(name) = iterator {
                    scope.bind(name);
                }
                if let Some(it) = iterable {
                    self.collect_expr(it, scope);
                }
                for s in body {
                    self.collect_statement(s, scope);
                }
            }
            Statement::Jump(jump, _) => {
                if let Some(v) = &jump.value {
                    self.collect_expr(v, scope);
                }
            }
            Statement::CStruct(decl) => {
                self.cstructs.insert(
                    decl.name.clone(),
                    CStructInfo {
                        size: decl.size,
                        align: decl.align,
                        fields: decl
                            .fields
                            .iter()
                            .map(|f| (f.name.clone(), f.c_type, f.offset))
                            .collect(),
                    },
                );
            }
            Statement::Alias { .. } | Statement::Import { .. } => {}
            Statement::Arena(block, _) => {
                for s in &block.body {
                    self.collect_statement(s, scope);
                }
            }
            Statement::Defer { expr, .. } => self.collect_expr(expr, scope),
            Statement::Spawn { expr, handler, .. } => {
                self.collect_expr(expr, scope);
                if let Some((params, body)) = handler {
                    for p in params {
                        scope.bind(p);
                    }
                    for s in body {
                        self.collect_statement(s, scope);
                    }
                }
            }
            Statement::RegisterAssign(_, _) => {}
        }
    }

    fn collect_expr(&mut self, expr: &Expr, scope: &mut ScopeBuilder) {
        self.collect_expr_named(expr, scope, None)
    }

    /// Like [`Self::collect_expr`] but threads through the enclosing
    /// binding's name, if any, so a directly-assigned lambda (`f = (n) ->
    /// ...`) can detect self-recursion (spec §4.4).
    fn collect_expr_named(&mut self, expr: &Expr, scope: &mut ScopeBuilder, name_hint: Option<&str>) {
        match expr {
            Expr::Number(..) | Expr::String(..) | Expr::Ident(..) | Expr::ErrorExpr(_) => {}
            Expr::NamespacedIdent { .. } => {}
            Expr::FString(parts, _) => {
                for part in parts {
                    if let FStringSegment::Interpolated(e) = part {
                        self.collect_expr(e, scope);
                    }
                }
            }
            Expr::Binary { left, right, .. } => {
                self.collect_expr(left, scope);
                self.collect_expr(right, scope);
            }
            Expr::Unary { operand, .. } | Expr::Postfix { operand, .. } => {
                self.collect_expr(operand, scope)
            }
            Expr::Lambda {
                params,
                body,
                captured,
                span,
                ..
            } => {
                self.collect_function(name_hint.map(str::to_string), params, body, captured, span);
            }
            Expr::MultiLambda { arms, .. } => {
                for arm in arms {
                    let mut inner = ScopeBuilder::new();
                    for p in &arm.params {
                        if let MatchPattern::Binding(name) = p {
                            inner.bind(name);
                        }
                    }
                    self.collect_expr(&arm.body, &mut inner);
                }
            }
            Expr::Call { args, .. } => {
                for a in args {
                    self.collect_expr(a, scope);
                }
            }
            Expr::DirectCall { callee, args, .. } => {
                self.collect_expr(callee, scope);
                for a in args {
                    self.collect_expr(a, scope);
                }
            }
            Expr::Index { target, index, .. } => {
                self.collect_expr(target, scope);
                self.collect_expr(index, scope);
            }
            Expr::Slice { target, range, .. } => {
                self.collect_expr(target, scope);
                self.collect_expr(range, scope);
            }
            Expr::Range { start, end, step, .. } => {
                if let Some(s) = start {
                    self.collect_expr(s, scope);
                }
                if let Some(e) = end {
                    self.collect_expr(e, scope);
                }
                if let Some(s) = step {
                    self.collect_expr(s, scope);
                }
            }
            Expr::List(items, _) | Expr::Vector(items, _) => {
                for i in items {
                    self.collect_expr(i, scope);
                }
            }
            Expr::Map { keys, values, .. } => {
                for k in keys {
                    self.collect_expr(k, scope);
                }
                for v in values {
                    self.collect_expr(v, scope);
                }
            }
            Expr::Block(stmts, _) => {
                for s in stmts {
                    self.collect_statement(s, scope);
                }
            }
            Expr::Match {
                condition,
                arms,
                default,
                ..
            } => {
                if let Some(c) = condition {
                    self.collect_expr(c, scope);
                }
                for arm in arms {
                    self.collect_expr(&arm.test, scope);
                    self.collect_expr(&arm.result, scope);
                }
                if let Some(d) = default {
                    self.collect_expr(d, scope);
                }
            }
            Expr::Cast { value, .. } => self.collect_expr(value, scope),
            Expr::Length(e, _) => self.collect_expr(e, scope),
            Expr::In { value, collection, .. } => {
                self.collect_expr(value, scope);
                self.collect_expr(collection, scope);
            }
            Expr::Pipe { value, func, .. } => {
                self.collect_expr(value, scope);
                self.collect_expr(func, scope);
            }
            Expr::Parallel { body, .. } => self.collect_expr(body, scope),
            Expr::Send { target, value, .. } => {
                self.collect_expr(target, scope);
                if let Some(v) = value {
                    self.collect_expr(v, scope);
                }
            }
            Expr::Cons { head, tail, .. } => {
                self.collect_expr(head, scope);
                self.collect_expr(tail, scope);
            }
            Expr::LoopState { .. } => {}
            Expr::Jump(jump, _) => {
                if let Some(v) = &jump.value {
                    self.collect_expr(v, scope);
                }
            }
            Expr::Arena(block, _) => {
                for s in &block.body {
                    self.collect_statement(s, scope);
                }
            }
            Expr::Unsafe { .. } => {}
            Expr::Move(name, _) => scope.bind(name),
            Expr::OrElse { left, right, .. } => {
                self.collect_expr(left, scope);
                self.collect_expr(right, scope);
            }
        }
    }

    fn collect_function(
        &mut self,
        name_hint: Option<String>,
        params: &[String],
        body: &Expr,
        captured: &[String],
        span: &Span,
    ) {
        let mut scope = ScopeBuilder::new();
        for p in params {
            scope.bind(p);
        }
        self.collect_expr(body, &mut scope);
        let is_recursive = name_hint
            .as_ref()
            .map(|n| mentions_ident(body, n))
            .unwrap_or(false);
        let id = self.next_fn_id;
        self.next_fn_id += 1;
        self.lambda_ids.insert(span.clone(), id);
        self.functions.push(FunctionRecord {
            id,
            name: name_hint,
            params: params.to_vec(),
            captured: captured.to_vec(),
            entry_offset: None,
            is_recursive,
            is_pure: false,
            slots: scope.slots,
            slot_count: scope.next_index,
        });
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `expr` contains a reference to identifier `name` anywhere in
/// its subtree (used for recursive-self-reference and dead-code-liveness
/// checks). Does not descend into nested lambdas with a *different*
/// recursive name shadowing `name`, but does look inside their bodies
/// since a shadowed outer name is still "mentioned" lexically only if
/// unshadowed — shadowing is rare enough in this language (no nested
/// re-binding of the same param name without a new `=`) that a
/// conservative "mentions anywhere" check is sufficient and matches the
/// teacher's resolver's treatment of free-variable search.
pub fn mentions_ident(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Ident(n, _) => n == name,
        Expr::NamespacedIdent { .. } => false,
        Expr::Number(..) | Expr::String(..) | Expr::ErrorExpr(_) | Expr::LoopState { .. } => false,
        Expr::FString(parts, _) => parts.iter().any(|p| match p {
            FStringSegment::Literal(_) => false,
            FStringSegment::Interpolated(e) => mentions_ident(e, name),
        }),
        Expr::Binary { left, right, .. } => mentions_ident(left, name) || mentions_ident(right, name),
        Expr::Unary { operand, .. } | Expr::Postfix { operand, .. } => mentions_ident(operand, name),
        Expr::Lambda { body, .. } => mentions_ident(body, name),
        Expr::MultiLambda { arms, .. } => arms.iter().any(|a| mentions_ident(&a.body, name)),
        Expr::Call { args, name: callee, .. } => callee == name || args.iter().any(|a| mentions_ident(a, name)),
        Expr::DirectCall { callee, args, .. } => {
            mentions_ident(callee, name) || args.iter().any(|a| mentions_ident(a, name))
        }
        Expr::Index { target, index, .. } => mentions_ident(target, name) || mentions_ident(index, name),
        Expr::Slice { target, range, .. } => mentions_ident(target, name) || mentions_ident(range, name),
        Expr::Range { start, end, step, .. } => {
            start.as_deref().is_some_and(|e| mentions_ident(e, name))
                || end.as_deref().is_some_and(|e| mentions_ident(e, name))
                || step.as_deref().is_some_and(|e| mentions_ident(e, name))
        }
        Expr::List(items, _) | Expr::Vector(items, _) => items.iter().any(|i| mentions_ident(i, name)),
        Expr::Map { keys, values, .. } => {
            keys.iter().any(|k| mentions_ident(k, name)) || values.iter().any(|v| mentions_ident(v, name))
        }
        Expr::Block(stmts, _) => stmts.iter().any(|s| statement_mentions_ident(s, name)),
        Expr::Match {
            condition,
            arms,
            default,
            ..
        } => {
            condition.as_deref().is_some_and(|c| mentions_ident(c, name))
                || arms
                    .iter()
                    .any(|a| mentions_ident(&a.test, name) || mentions_ident(&a.result, name))
                || default.as_deref().is_some_and(|d| mentions_ident(d, name))
        }
        Expr::Cast { value, .. } => mentions_ident(value, name),
        Expr::Length(e, _) => mentions_ident(e, name),
        Expr::In { value, collection, .. } => mentions_ident(value, name) || mentions_ident(collection, name),
        Expr::Pipe { value, func, .. } => mentions_ident(value, name) || mentions_ident(func, name),
        Expr::Parallel { body, .. } => mentions_ident(body, name),
        Expr::Send { target, value, .. } => {
            mentions_ident(target, name) || value.as_deref().is_some_and(|v| mentions_ident(v, name))
        }
        Expr::Cons { head, tail, .. } => mentions_ident(head, name) || mentions_ident(tail, name),
        Expr::Jump(jump, _) => jump.value.as_deref().is_some_and(|v| mentions_ident(v, name)),
        Expr::Arena(block, _) => block.body.iter().any(|s| statement_mentions_ident(s, name)),
        Expr::Unsafe { .. } => false,
        Expr::Move(n, _) => n == name,
        Expr::OrElse { left, right, .. } => mentions_ident(left, name) || mentions_ident(right, name),
    }
}

fn statement_mentions_ident(stmt: &Statement, name: &str) -> bool {
    match stmt {
        Statement::Assignment { value, .. } => mentions_ident(value, name),
        Statement::TupleAssign { value, .. } => mentions_ident(value, name),
        Statement::ExpressionStmt(e) => mentions_ident(e, name),
        Statement::Loop { iterable, body, .. } => {
            iterable.as_deref().is_some_and(|e| mentions_ident(e, name))
                || body.iter().any(|s| statement_mentions_ident(s, name))
        }
        Statement::Jump(jump, _) => jump.value.as_deref().is_some_and(|v| mentions_ident(v, name)),
        Statement::CStruct(_) | Statement::Alias { .. } | Statement::Import { .. } => false,
        Statement::Arena(block, _) => block.body.iter().any(|s| statement_mentions_ident(s, name)),
        Statement::Defer { expr, .. } => mentions_ident(expr, name),
        Statement::Spawn { expr, handler, .. } => {
            mentions_ident(expr, name)
                || handler
                    .as_ref()
                    .is_some_and(|(_, body)| body.iter().any(|s| statement_mentions_ident(s, name)))
        }
        Statement::RegisterAssign(_, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostics;
    use std::path::PathBuf;

    fn collect(src: &str) -> SymbolTable {
        let mut diags = Diagnostics::new();
        let program = crate::parser::parse(src, &mut diags, &PathBuf::from("<test>"));
        Collector::new().collect(&program)
    }

    #[test]
    fn assigns_increasing_slots() {
        let table = collect("a = 1\nb = 2\n");
        assert_eq!(table.top_level["a"].frame_offset, -16);
        assert_eq!(table.top_level["b"].frame_offset, -32);
    }

    #[test]
    fn detects_self_recursive_lambda() {
        let table = collect("factorial = (n) -> factorial(n - 1)\n");
        assert_eq!(table.functions.len(), 1);
        assert!(table.functions[0].is_recursive);
    }

    #[test]
    fn registers_cstruct_layout() {
        let table = collect("cstruct Point { x: float64 y: float64 }\n");
        let info = &table.cstructs["Point"];
        assert_eq!(info.size, 16);
        assert_eq!(table.cstruct_field_offset("Point", "y"), Some(8.0));
    }
}
