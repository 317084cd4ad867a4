//! Semantic analysis (spec §7 "Semantic" taxonomy row, §8 properties 4–5).
//!
//! Runs after symbol collection, over the already-optimized AST, checking
//! what the earlier passes don't: undefined identifiers, immutable
//! reassignment, use-after-move, non-exhaustive value matches, call-arity
//! mismatches (both Language-internal and FFI). Every finding is appended
//! to the shared [`Diagnostics`] collector rather than aborting (spec §7
//! "Recoverable errors ... local recovery continues"); the pipeline still
//! proceeds to code generation only when `!diags.should_abort()`.
//!
//! Cast-to-unknown-C-type (also listed in the taxonomy) never reaches this
//! pass: [`crate::ast::CType`] has no "unknown" variant, so the parser
//! already rejects an unrecognized type name as a syntax error before a
//! `Cast` node can exist.

use crate::ast::{Expr, Program, Statement};
use crate::error::{Category, Diagnostic, Diagnostics, Level, Location, Span};
use crate::symbols::SymbolTable;
use flapc_catalog::SymbolCatalog;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Names resolved at code-generation time rather than through a user
/// binding or the FFI catalog (spec §6.3/§8 concrete scenarios exercise
/// `println`, `atomic_add`, `atomic_load`, `take`).
const INTRINSICS: &[&str] = &[
    "print",
    "println",
    "eprint",
    "eprintln",
    "exit",
    "atomic_add",
    "atomic_sub",
    "atomic_load",
    "atomic_store",
    "take",
    "len",
    "fork",
];

struct Analyzer<'a> {
    symbols: &'a SymbolTable,
    catalog: &'a dyn SymbolCatalog,
    file: &'a Path,
    top_level_names: HashSet<String>,
    function_arity: HashMap<String, usize>,
}

/// Tracks binding state within one straight-line scope (a function body or
/// the top-level program): the set of names currently visible, which of
/// them are immutable, and which have been moved (spec §8 property 4: "any
/// use ... after a `name!` expression within the same scope").
#[derive(Clone, Default)]
struct Scope {
    bound: HashSet<String>,
    immutable: HashSet<String>,
    moved: HashSet<String>,
}

impl Scope {
    fn child(&self) -> Scope {
        // A nested block/loop/arena shares the enclosing scope's bindings
        // and move state (reading a moved name is still an error inside a
        // nested block) but its own fresh declarations don't leak back out
        // once the pass returns to the caller's clone.
        self.clone()
    }
}

pub fn analyze(program: &Program, symbols: &SymbolTable, catalog: &dyn SymbolCatalog, file: &Path, diags: &mut Diagnostics) {
    let mut top_level_names: HashSet<String> = symbols.top_level.keys().cloned().collect();
    let mut function_arity = HashMap::new();
    for f in &symbols.functions {
        if let Some(name) = &f.name {
            top_level_names.insert(name.clone());
            function_arity.insert(name.clone(), f.params.len());
        }
    }

    let analyzer = Analyzer {
        symbols,
        catalog,
        file,
        top_level_names,
        function_arity,
    };

    let mut scope = Scope::default();
    scope.bound.extend(analyzer.top_level_names.iter().cloned());
    analyzer.analyze_block(&program.statements, &mut scope, diags);
}

impl<'a> Analyzer<'a> {
    fn analyze_block(&self, stmts: &[Statement], scope: &mut Scope, diags: &mut Diagnostics) {
        for stmt in stmts {
            self.analyze_stmt(stmt, scope, diags);
        }
    }

    fn analyze_stmt(&self, stmt: &Statement, scope: &mut Scope, diags: &mut Diagnostics) {
        match stmt {
            Statement::Assignment { name, value, mutable, update, span, .. } => {
                self.analyze_expr(value, scope, diags);
                if !*update && !*mutable && scope.immutable.contains(name) {
                    diags.error_at(
                        self.loc(span),
                        format!("cannot update immutable variable '{name}'"),
                    );
                }
                scope.moved.remove(name);
                scope.bound.insert(name.clone());
                if !*mutable {
                    scope.immutable.insert(name.clone());
                } else {
                    scope.immutable.remove(name);
                }
            }
            Statement::TupleAssign { names, value, span, .. } => {
                self.analyze_expr(value, scope, diags);
                let _ = span;
                for n in names {
                    scope.moved.remove(n);
                    scope.bound.insert(n.clone());
                    scope.immutable.remove(n);
                }
            }
            Statement::ExpressionStmt(e) => self.analyze_expr(e, scope, diags),
            Statement::Loop { iterator, iterable, body, .. } => {
                if let Some(it) = iterable {
                    self.analyze_expr(it, scope, diags);
                }
                let mut inner = scope.child();
                if let Some(name) = iterator {
                    inner.bound.insert(name.clone());
                    inner.immutable.remove(name);
                }
                self.analyze_block(body, &mut inner, diags);
            }
            Statement::Jump(jump, _) => {
                if let Some(v) = &jump.value {
                    self.analyze_expr(v, scope, diags);
                }
            }
            Statement::Arena(block, _) => {
                let mut inner = scope.child();
                self.analyze_block(&block.body, &mut inner, diags);
            }
            Statement::Defer { expr, .. } => self.analyze_expr(expr, scope, diags),
            Statement::Spawn { expr, handler, .. } => {
                self.analyze_expr(expr, scope, diags);
                if let Some((params, body)) = handler {
                    let mut inner = scope.child();
                    for p in params {
                        inner.bound.insert(p.clone());
                        inner.immutable.remove(p);
                    }
                    self.analyze_block(body, &mut inner, diags);
                }
            }
            Statement::CStruct(_) | Statement::Alias { .. } | Statement::Import { .. } | Statement::RegisterAssign(_, _) => {}
        }
    }

    fn analyze_expr(&self, expr: &Expr, scope: &mut Scope, diags: &mut Diagnostics) {
        match expr {
            Expr::Ident(name, span) => {
                if scope.moved.contains(name) {
                    diags.error_at(self.loc(span), format!("use-after-move: '{name}'"));
                } else if !scope.bound.contains(name) && !INTRINSICS.contains(&name.as_str()) {
                    diags.error_at(self.loc(span), format!("undefined identifier '{name}'"));
                }
            }
            Expr::Move(name, span) => {
                if scope.moved.contains(name) {
                    diags.error_at(self.loc(span), format!("use-after-move: '{name}'"));
                } else if !scope.bound.contains(name) && !INTRINSICS.contains(&name.as_str()) {
                    diags.error_at(self.loc(span), format!("undefined identifier '{name}'"));
                }
                scope.moved.insert(name.clone());
            }
            Expr::NamespacedIdent { .. } | Expr::Number(..) | Expr::String(..) | Expr::ErrorExpr(_) | Expr::LoopState { .. } => {}
            Expr::FString(parts, _) => {
                for part in parts {
                    if let crate::ast::FStringSegment::Interpolated(e) = part {
                        self.analyze_expr(e, scope, diags);
                    }
                }
            }
            Expr::Binary { left, right, .. } => {
                self.analyze_expr(left, scope, diags);
                self.analyze_expr(right, scope, diags);
            }
            Expr::Unary { operand, .. } | Expr::Postfix { operand, .. } => self.analyze_expr(operand, scope, diags),
            Expr::Lambda { params, body, .. } => {
                let mut inner = scope.child();
                for p in params {
                    inner.bound.insert(p.clone());
                    inner.immutable.remove(p);
                    inner.moved.remove(p);
                }
                self.analyze_expr(body, &mut inner, diags);
            }
            Expr::MultiLambda { arms, .. } => {
                for arm in arms {
                    let mut inner = scope.child();
                    for p in &arm.params {
                        if let crate::ast::MatchPattern::Binding(name) = p {
                            inner.bound.insert(name.clone());
                            inner.immutable.remove(name);
                            inner.moved.remove(name);
                        }
                    }
                    self.analyze_expr(&arm.body, &mut inner, diags);
                }
            }
            Expr::Call { name, args, span } => {
                for a in args {
                    self.analyze_expr(a, scope, diags);
                }
                if !INTRINSICS.contains(&name.as_str()) {
                    if let Some(&arity) = self.function_arity.get(name) {
                        if arity != args.len() {
                            diags.error_at(
                                self.loc(span),
                                format!(
                                    "'{name}' expects {arity} argument(s), found {}",
                                    args.len()
                                ),
                            );
                        }
                    } else if !self.top_level_names.contains(name) {
                        diags.error_at(self.loc(span), format!("undefined identifier '{name}'"));
                    }
                }
            }
            Expr::DirectCall { callee, args, span } => {
                self.analyze_expr(callee, scope, diags);
                for a in args {
                    self.analyze_expr(a, scope, diags);
                }
                if let Expr::NamespacedIdent { namespace, name, .. } = callee.as_ref() {
                    match self.catalog.lookup(namespace, name) {
                        Some((_, sig)) if !sig.variadic && sig.params.len() != args.len() => {
                            diags.error_at(
                                self.loc(span),
                                format!(
                                    "'{namespace}.{name}' expects {} argument(s), found {}",
                                    sig.params.len(),
                                    args.len()
                                ),
                            );
                        }
                        Some(_) => {}
                        None => {
                            diags.error_at(
                                self.loc(span),
                                format!("no catalog entry for '{namespace}.{name}'"),
                            );
                        }
                    }
                }
            }
            Expr::Index { target, index, .. } => {
                self.analyze_expr(target, scope, diags);
                self.analyze_expr(index, scope, diags);
            }
            Expr::Slice { target, range, .. } => {
                self.analyze_expr(target, scope, diags);
                self.analyze_expr(range, scope, diags);
            }
            Expr::Range { start, end, step, .. } => {
                for e in [start, end, step].into_iter().flatten() {
                    self.analyze_expr(e, scope, diags);
                }
            }
            Expr::List(items, _) | Expr::Vector(items, _) => {
                for i in items {
                    self.analyze_expr(i, scope, diags);
                }
            }
            Expr::Map { keys, values, .. } => {
                for k in keys {
                    self.analyze_expr(k, scope, diags);
                }
                for v in values {
                    self.analyze_expr(v, scope, diags);
                }
            }
            Expr::Block(body, _) => {
                let mut inner = scope.child();
                self.analyze_block(body, &mut inner, diags);
            }
            Expr::Match { condition, arms, default, span } => {
                if let Some(c) = condition {
                    self.analyze_expr(c, scope, diags);
                }
                for arm in arms {
                    self.analyze_expr(&arm.test, scope, diags);
                    self.analyze_expr(&arm.result, scope, diags);
                }
                if let Some(d) = default {
                    self.analyze_expr(d, scope, diags);
                } else if condition.is_some() {
                    diags.warn_at(
                        self.loc(span),
                        "match has no default arm and literal arms cannot be proven exhaustive".to_string(),
                    );
                }
            }
            Expr::Cast { value, .. } => self.analyze_expr(value, scope, diags),
            Expr::Length(e, _) => self.analyze_expr(e, scope, diags),
            Expr::In { value, collection, .. } => {
                self.analyze_expr(value, scope, diags);
                self.analyze_expr(collection, scope, diags);
            }
            Expr::Pipe { value, func, .. } => {
                self.analyze_expr(value, scope, diags);
                self.analyze_expr(func, scope, diags);
            }
            Expr::Parallel { body, .. } => {
                let mut inner = scope.child();
                self.analyze_expr(body, &mut inner, diags);
            }
            Expr::Send { target, value, .. } => {
                self.analyze_expr(target, scope, diags);
                if let Some(v) = value {
                    self.analyze_expr(v, scope, diags);
                }
            }
            Expr::Cons { head, tail, .. } => {
                self.analyze_expr(head, scope, diags);
                self.analyze_expr(tail, scope, diags);
            }
            Expr::Jump(jump, _) => {
                if let Some(v) = &jump.value {
                    self.analyze_expr(v, scope, diags);
                }
            }
            Expr::Arena(block, _) => {
                let mut inner = scope.child();
                self.analyze_block(&block.body, &mut inner, diags);
            }
            Expr::Unsafe { .. } => {}
            Expr::OrElse { left, right, .. } => {
                self.analyze_expr(left, scope, diags);
                self.analyze_expr(right, scope, diags);
            }
        }
    }

    fn loc(&self, span: &Span) -> Location {
        Location {
            file: self.file.to_path_buf(),
            span: span.clone(),
        }
    }
}

/// Thin convenience layer so call sites read `diags.error_at(self.loc(span),
/// msg)` instead of building a [`Diagnostic`] by hand at every check —
/// every finding in this module is a `Category::Semantic` record.
trait SemanticReport {
    fn error_at(&mut self, location: Location, message: String);
    fn warn_at(&mut self, location: Location, message: String);
}

impl SemanticReport for Diagnostics {
    fn error_at(&mut self, location: Location, message: String) {
        self.report(Diagnostic::new(Level::Error, Category::Semantic, message).at(location));
    }

    fn warn_at(&mut self, location: Location, message: String) {
        self.report(Diagnostic::new(Level::Warning, Category::Semantic, message).at(location));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::empty_catalog;
    use std::path::PathBuf;

    fn run(src: &str) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let file = PathBuf::from("<test>");
        let program = crate::parser::parse(src, &mut diags, &file);
        let symbols = crate::symbols::Collector::new().collect(&program);
        let catalog = empty_catalog();
        analyze(&program, &symbols, &catalog, &file, &mut diags);
        diags
    }

    #[test]
    fn flags_immutable_reassignment() {
        let diags = run("x = 42\nx = 100\n");
        assert!(diags.records().iter().any(|d| d.message.contains("cannot update immutable variable 'x'")));
    }

    #[test]
    fn flags_use_after_move() {
        let diags = run("msg = \"hi\"\ntake(msg!)\nprintln(msg)\n");
        assert!(diags.records().iter().any(|d| d.message.contains("use-after-move: 'msg'")));
    }

    #[test]
    fn allows_mutable_rebind() {
        let diags = run("x := 0\nx = 1\n");
        assert!(!diags.records().iter().any(|d| d.message.contains("cannot update immutable")));
    }

    #[test]
    fn flags_undefined_call() {
        let diags = run("println(nope())\n");
        assert!(diags.records().iter().any(|d| d.message.contains("undefined identifier 'nope'")));
    }

    #[test]
    fn flags_arity_mismatch() {
        let diags = run("square = (x) -> x * x\ny = square(1, 2)\n");
        assert!(diags.records().iter().any(|d| d.message.contains("expects 1 argument")));
    }
}
