//! Structural lint pass (`SPEC_FULL.md` §4 "[SUPPLEMENT] Lint pass").
//!
//! The distilled spec's Non-goals exclude garbage collection and
//! source-level debugging info but say nothing about static lints; the
//! original project ships a lint engine alongside the compiler proper
//! (teacher: `lint.rs`, a TOML-configurable set of rules reported through
//! `Severity` levels, later surfaced to the LSP). That engine matches
//! pattern sequences over a stack-based word language, which has no
//! counterpart here — this port keeps its shape (`LintConfig` loaded from
//! TOML, a `Linter` that walks the tree, `LintDiagnostic` output) but
//! applies it structurally over the AST instead of over a token sequence.
//!
//! Findings are reported through the same Error Collector the rest of the
//! pipeline uses, at `Level::Warning`, so `-v`/`-q` and the existing
//! stderr rendering apply unchanged; `LintDiagnostic` additionally exists
//! standalone (with an LSP-style numeric severity) for a future editor
//! integration, mirroring the teacher's dual-purpose `Severity`.

use crate::ast::{Expr, Program, Statement, ThreadCount};
use crate::error::{Category, Diagnostic, Diagnostics, Level, Location, Span};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Severity level for a lint finding (teacher: `lint::Severity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Hint,
}

impl Severity {
    /// LSP `DiagnosticSeverity` numbering, for a future editor integration
    /// (teacher: `Severity::to_lsp_severity`).
    pub fn to_lsp_severity(self) -> u32 {
        match self {
            Severity::Error => 1,
            Severity::Warning => 2,
            Severity::Hint => 4,
        }
    }

    fn to_diagnostic_level(self) -> Level {
        match self {
            Severity::Error => Level::Error,
            Severity::Warning | Severity::Hint => Level::Warning,
        }
    }
}

/// Stable identifier for each structural rule this pass implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LintId {
    ShadowedImmutable,
    UnguardedMutatingLoop,
    EmptyMatchArm,
}

impl LintId {
    fn key(self) -> &'static str {
        match self {
            LintId::ShadowedImmutable => "shadowed-immutable",
            LintId::UnguardedMutatingLoop => "unguarded-mutating-loop",
            LintId::EmptyMatchArm => "empty-match-arm",
        }
    }
}

/// One entry of a TOML lint configuration: `[lint.shadowed-immutable]
/// severity = "hint"`. Unlisted rules keep their built-in default.
#[derive(Debug, Clone, Deserialize)]
struct LintRuleConfig {
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    enabled: Option<bool>,
}

/// User-supplied overrides of the built-in rule set (`SPEC_FULL.md`
/// "configurable via the same TOML mechanism the teacher uses for its
/// lint rules").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LintConfig {
    #[serde(default, rename = "lint")]
    rules: std::collections::HashMap<String, LintRuleConfig>,
}

impl LintConfig {
    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("failed to parse lint config: {e}"))
    }

    fn severity(&self, id: LintId, default: Severity) -> Option<Severity> {
        match self.rules.get(id.key()) {
            Some(rule) if rule.enabled == Some(false) => None,
            Some(rule) => Some(rule.severity.unwrap_or(default)),
            None => Some(default),
        }
    }
}

/// A single lint finding, in the shape an editor integration would want
/// (teacher: `LintDiagnostic`).
#[derive(Debug, Clone)]
pub struct LintDiagnostic {
    pub id: &'static str,
    pub severity: Severity,
    pub message: String,
    pub span: Span,
}

/// Walks a [`Program`] and reports every structural lint finding.
pub struct Linter<'a> {
    config: &'a LintConfig,
}

impl<'a> Linter<'a> {
    pub fn new(config: &'a LintConfig) -> Self {
        Linter { config }
    }

    /// Flags a parameter name that shadows an immutable binding already
    /// visible in the enclosing scope (spec's "shadowed immutable binding"
    /// supplement lint). Shadowing a lambda parameter is always legal —
    /// the inner binding simply masks the outer one for the body — but is
    /// usually a copy-paste accident worth a warning.
    fn report_if_shadowed(&self, name: &str, immutable: &HashSet<String>, span: &Span, out: &mut Vec<LintDiagnostic>) {
        if immutable.contains(name) {
            if let Some(severity) = self.config.severity(LintId::ShadowedImmutable, Severity::Warning) {
                out.push(LintDiagnostic {
                    id: LintId::ShadowedImmutable.key(),
                    severity,
                    message: format!("parameter '{name}' shadows an immutable binding of the same name"),
                    span: span.clone(),
                });
            }
        }
    }

    pub fn lint(&self, program: &Program) -> Vec<LintDiagnostic> {
        let mut out = Vec::new();
        let mut immutable_in_scope = HashSet::new();
        self.lint_block(&program.statements, &mut immutable_in_scope, &mut out);
        out
    }

    fn lint_block(&self, stmts: &[Statement], immutable: &mut HashSet<String>, out: &mut Vec<LintDiagnostic>) {
        for stmt in stmts {
            self.lint_stmt(stmt, immutable, out);
        }
    }

    fn lint_stmt(&self, stmt: &Statement, immutable: &mut HashSet<String>, out: &mut Vec<LintDiagnostic>) {
        match stmt {
            Statement::Assignment { name, value, mutable, .. } => {
                if !*mutable {
                    immutable.insert(name.clone());
                } else {
                    immutable.remove(name);
                }
                self.lint_expr(value, immutable, out);
            }
            Statement::TupleAssign { value, .. } => self.lint_expr(value, immutable, out),
            Statement::ExpressionStmt(e) => self.lint_expr(e, immutable, out),
            Statement::Loop { iterator, iterable, body, max_iterations, threads, span, .. } => {
                if let Some(it) = iterable {
                    self.lint_expr(it, immutable, out);
                }
                if let (Some(name), None, ThreadCount::Sequential) = (iterator, max_iterations, threads) {
                    if body_mutates(body, name) {
                        if let Some(severity) = self.config.severity(LintId::UnguardedMutatingLoop, Severity::Warning) {
                            out.push(LintDiagnostic {
                                id: LintId::UnguardedMutatingLoop.key(),
                                severity,
                                message: format!(
                                    "loop mutates its iterator '{name}' but has no 'max' guard"
                                ),
                                span: span.clone(),
                            });
                        }
                    }
                }
                let mut inner = immutable.clone();
                self.lint_block(body, &mut inner, out);
            }
            Statement::Arena(block, _) => {
                let mut inner = immutable.clone();
                self.lint_block(&block.body, &mut inner, out);
            }
            Statement::Defer { expr, .. } => self.lint_expr(expr, immutable, out),
            Statement::Spawn { expr, handler, .. } => {
                self.lint_expr(expr, immutable, out);
                if let Some((_, body)) = handler {
                    let mut inner = immutable.clone();
                    self.lint_block(body, &mut inner, out);
                }
            }
            Statement::Jump(jump, _) => {
                if let Some(v) = &jump.value {
                    self.lint_expr(v, immutable, out);
                }
            }
            Statement::CStruct(_) | Statement::Alias { .. } | Statement::Import { .. } | Statement::RegisterAssign(_, _) => {}
        }
    }

    fn lint_expr(&self, expr: &Expr, immutable: &mut HashSet<String>, out: &mut Vec<LintDiagnostic>) {
        match expr {
            Expr::Lambda { params, body, span, .. } => {
                let mut inner = immutable.clone();
                for p in params {
                    self.report_if_shadowed(p, &inner, span, out);
                    inner.remove(p);
                }
                self.lint_expr(body, &mut inner, out);
            }
            Expr::MultiLambda { arms, .. } => {
                for arm in arms {
                    let mut inner = immutable.clone();
                    for p in &arm.params {
                        if let crate::ast::MatchPattern::Binding(name) = p {
                            self.report_if_shadowed(name, &inner, &arm.body.span(), out);
                            inner.remove(name);
                        }
                    }
                    self.lint_expr(&arm.body, &mut inner, out);
                }
            }
            Expr::Binary { left, right, .. } => {
                self.lint_expr(left, immutable, out);
                self.lint_expr(right, immutable, out);
            }
            Expr::Unary { operand, .. } | Expr::Postfix { operand, .. } => self.lint_expr(operand, immutable, out),
            Expr::Call { args, .. } | Expr::DirectCall { args, .. } => {
                if let Expr::DirectCall { callee, .. } = expr {
                    self.lint_expr(callee, immutable, out);
                }
                for a in args {
                    self.lint_expr(a, immutable, out);
                }
            }
            Expr::Index { target, index, .. } => {
                self.lint_expr(target, immutable, out);
                self.lint_expr(index, immutable, out);
            }
            Expr::Slice { target, range, .. } => {
                self.lint_expr(target, immutable, out);
                self.lint_expr(range, immutable, out);
            }
            Expr::Range { start, end, step, .. } => {
                for e in [start, end, step].into_iter().flatten() {
                    self.lint_expr(e, immutable, out);
                }
            }
            Expr::List(items, _) | Expr::Vector(items, _) => {
                for i in items {
                    self.lint_expr(i, immutable, out);
                }
            }
            Expr::Map { keys, values, .. } => {
                for k in keys {
                    self.lint_expr(k, immutable, out);
                }
                for v in values {
                    self.lint_expr(v, immutable, out);
                }
            }
            Expr::Block(stmts, _) => {
                let mut inner = immutable.clone();
                self.lint_block(stmts, &mut inner, out);
            }
            Expr::Match { condition, arms, default, .. } => {
                if let Some(c) = condition {
                    self.lint_expr(c, immutable, out);
                }
                for arm in arms {
                    self.lint_expr(&arm.test, immutable, out);
                    if let Expr::Block(stmts, span) = arm.result.as_ref() {
                        if stmts.is_empty() {
                            if let Some(severity) = self.config.severity(LintId::EmptyMatchArm, Severity::Warning) {
                                out.push(LintDiagnostic {
                                    id: LintId::EmptyMatchArm.key(),
                                    severity,
                                    message: "match arm has an empty body".to_string(),
                                    span: span.clone(),
                                });
                            }
                        }
                    }
                    self.lint_expr(&arm.result, immutable, out);
                }
                if let Some(d) = default {
                    self.lint_expr(d, immutable, out);
                }
            }
            Expr::Cast { value, .. } => self.lint_expr(value, immutable, out),
            Expr::Length(e, _) => self.lint_expr(e, immutable, out),
            Expr::In { value, collection, .. } => {
                self.lint_expr(value, immutable, out);
                self.lint_expr(collection, immutable, out);
            }
            Expr::Pipe { value, func, .. } => {
                self.lint_expr(value, immutable, out);
                self.lint_expr(func, immutable, out);
            }
            Expr::Parallel { body, .. } => self.lint_expr(body, immutable, out),
            Expr::Send { target, value, .. } => {
                self.lint_expr(target, immutable, out);
                if let Some(v) = value {
                    self.lint_expr(v, immutable, out);
                }
            }
            Expr::Cons { head, tail, .. } => {
                self.lint_expr(head, immutable, out);
                self.lint_expr(tail, immutable, out);
            }
            Expr::Jump(jump, _) => {
                if let Some(v) = &jump.value {
                    self.lint_expr(v, immutable, out);
                }
            }
            Expr::Arena(block, _) => {
                let mut inner = immutable.clone();
                self.lint_block(&block.body, &mut inner, out);
            }
            Expr::OrElse { left, right, .. } => {
                self.lint_expr(left, immutable, out);
                self.lint_expr(right, immutable, out);
            }
            Expr::Number(..)
            | Expr::String(..)
            | Expr::FString(..)
            | Expr::Ident(..)
            | Expr::NamespacedIdent { .. }
            | Expr::LoopState { .. }
            | Expr::Unsafe { .. }
            | Expr::Move(..)
            | Expr::ErrorExpr(_) => {}
        }
    }
}

/// True if `name` is reassigned (`<-`/`++`/`--`) anywhere directly inside
/// `body` — the condition spec §4.2 says requires a `max` guard.
fn body_mutates(body: &[Statement], name: &str) -> bool {
    body.iter().any(|s| stmt_mutates(s, name))
}

fn stmt_mutates(stmt: &Statement, name: &str) -> bool {
    match stmt {
        Statement::Assignment { name: n, update, .. } => *update && n == name,
        Statement::ExpressionStmt(e) => expr_mutates(e, name),
        Statement::Loop { body, .. } => body_mutates(body, name),
        Statement::Arena(block, _) => body_mutates(&block.body, name),
        Statement::Defer { expr, .. } => expr_mutates(expr, name),
        Statement::Spawn { expr, handler, .. } => {
            expr_mutates(expr, name) || handler.as_ref().is_some_and(|(_, b)| body_mutates(b, name))
        }
        _ => false,
    }
}

fn expr_mutates(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Postfix { operand, .. } => matches!(operand.as_ref(), Expr::Ident(n, _) if n == name),
        Expr::Block(stmts, _) => body_mutates(stmts, name),
        _ => false,
    }
}

/// Runs the lint pass and folds its findings into the shared collector at
/// `Level::Warning`/`Level::Error` per [`Severity`] (spec §4.8: lints share
/// the same Error Collector as every other stage).
pub fn run(program: &Program, config: &LintConfig, file: &Path, diags: &mut Diagnostics) {
    let linter = Linter::new(config);
    for finding in linter.lint(program) {
        let location = Location {
            file: PathBuf::from(file),
            span: finding.span,
        };
        diags.report(
            Diagnostic::new(finding.severity.to_diagnostic_level(), Category::Semantic, finding.message).at(location),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn run_lints(src: &str) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let file = PathBuf::from("<test>");
        let program = crate::parser::parse(src, &mut diags, &file);
        let config = LintConfig::default();
        run(&program, &config, &file, &mut diags);
        diags
    }

    #[test]
    fn flags_unguarded_mutating_loop() {
        let diags = run_lints("@ i in 0..10 { i <- i + 2 }\n");
        assert!(diags.records().iter().any(|d| d.message.contains("no 'max' guard")));
    }

    #[test]
    fn allows_guarded_mutating_loop() {
        let diags = run_lints("@ i in 0..10 max 100 { i <- i + 2 }\n");
        assert!(!diags.records().iter().any(|d| d.message.contains("no 'max' guard")));
    }

    #[test]
    fn flags_shadowed_immutable_binding() {
        let diags = run_lints("x = 1\nf = (x) -> x + 1\nprintln(f(2))\n");
        assert!(diags
            .records()
            .iter()
            .any(|d| d.message.contains("shadows an immutable binding")));
    }

    #[test]
    fn rule_can_be_disabled_via_config() {
        let mut diags = Diagnostics::new();
        let file = PathBuf::from("<test>");
        let program = crate::parser::parse("x = 1\nf = (x) -> x + 1\nprintln(f(2))\n", &mut diags, &file);
        let config = LintConfig::from_toml("[lint.shadowed-immutable]\nenabled = false\n").unwrap();
        run(&program, &config, &file, &mut diags);
        assert!(!diags
            .records()
            .iter()
            .any(|d| d.message.contains("shadows an immutable binding")));
    }
}
