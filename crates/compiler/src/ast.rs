//! Abstract Syntax Tree
//!
//! Every expression node is a variant of one sum type ([`Expr`]), every
//! statement another ([`Statement`]) — spec §3.2. The AST is built during
//! parsing, rewritten in place by the optimizer (whose passes return
//! `(Statement, changed)`/`(Expr, changed)` pairs, never panic on a
//! malformed tree), then consumed by the code generator and dropped.
//!
//! Following spec §9's re-architecture guidance, nodes are plain owned
//! trees (`Box<Expr>`), not an index-stable arena: the optimizer's
//! substitution step deep-clones subtrees explicitly (see
//! `optimizer::inline`) rather than relying on shared mutable pointers.

use crate::error::Span;
use flapc_catalog::CType;
use std::path::PathBuf;

/// A source location spanning one or more lines (spec §3.1), used for
/// diagnostics anchored to a whole construct (a function body, a block)
/// rather than a single token.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub start_line: usize,
    pub end_line: usize,
}

impl SourceLocation {
    pub fn new(file: PathBuf, line: usize) -> Self {
        SourceLocation {
            file,
            start_line: line,
            end_line: line,
        }
    }

    pub fn span(file: PathBuf, start_line: usize, end_line: usize) -> Self {
        SourceLocation {
            file,
            start_line,
            end_line,
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start_line == self.end_line {
            write!(f, "{}:{}", self.file.display(), self.start_line + 1)
        } else {
            write!(
                f,
                "{}:{}-{}",
                self.file.display(),
                self.start_line + 1,
                self.end_line + 1
            )
        }
    }
}

/// Whether a loop runs sequentially or forks N worker processes (spec §4.2,
/// §5). `Parallel(None)` is `@@` (logical CPU count, resolved by the code
/// generator at emission time); `Parallel(Some(n))` is `N @`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThreadCount {
    Sequential,
    Parallel(Option<u32>),
}

impl ThreadCount {
    pub fn is_parallel(self) -> bool {
        matches!(self, ThreadCount::Parallel(_))
    }
}

/// The `max N` / `max inf` guard on a loop whose iterator is mutated in its
/// body (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaxIterations {
    Limit(u64),
    Infinite,
}

/// A `ret` / `ret @N` / `ret @N value` jump (spec §3.2 `Jump`). Shared
/// between [`Statement::Jump`] and [`Expr::Jump`] since `ret` may appear as
/// the result expression of a tail-position match arm (spec §4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct JumpNode {
    /// Explicit loop label (`@N`), or `None` for "return from the enclosing
    /// function" / "exit the innermost loop" depending on context.
    pub label: Option<usize>,
    pub value: Option<Box<Expr>>,
}

/// An `arena { ... }` block: saves the global bump-allocator pointer on
/// entry and resets it on exit (spec §4.6 "Arena"). Shared between
/// [`Statement::Arena`] and [`Expr::Arena`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArenaBlock {
    pub body: Vec<Statement>,
}

/// A field in a `cstruct` declaration, with its byte offset filled in by
/// the symbol collector once the whole struct's layout is known (spec
/// §3.3 CStruct record).
#[derive(Debug, Clone, PartialEq)]
pub struct CStructField {
    pub name: String,
    pub c_type: CType,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CStructDecl {
    pub name: String,
    pub fields: Vec<CStructField>,
    pub size: u32,
    pub align: u32,
    pub span: Span,
}

/// One pattern-matching alternative of a [`Expr::MultiLambda`].
#[derive(Debug, Clone, PartialEq)]
pub struct LambdaArm {
    pub params: Vec<MatchPattern>,
    pub body: Box<Expr>,
}

/// A pattern used by a match arm or a multi-lambda alternative.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchPattern {
    /// Compare against the result of evaluating this expression.
    Literal(Box<Expr>),
    /// `_`: always matches, binds nothing.
    Wildcard,
    /// Bare identifier: always matches, binds the scrutinee to this name.
    Binding(String),
}

/// One arm of a [`Expr::Match`].
///
/// For a *value match* (`condition` is `Some`), `test` is the literal/value
/// expression compared against the condition with `==`. For a *guard
/// match* (`condition` is `None`), `test` is a boolean guard expression
/// evaluated in sequence (spec §4.2 block disambiguation, §4.6 lowering).
#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub test: Box<Expr>,
    pub result: Box<Expr>,
    pub span: Span,
}

/// One of the three architecture-specific bodies of an `unsafe` block
/// (spec §3.2). Only the `amd64` body is consumed by code generation; the
/// other two are retained for forward compatibility with non-primary
/// back ends (spec §1 "Out of scope").
#[derive(Debug, Clone, PartialEq)]
pub struct UnsafeVariants {
    pub amd64: Vec<Statement>,
    pub arm64: Vec<Statement>,
    pub riscv64: Vec<Statement>,
}

/// A 64-bit general-purpose x86-64 register, as named directly inside an
/// `unsafe` block (spec §4.6 "Unsafe block").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    /// 3-bit ModRM/SIB register field, extended by the REX.R/X/B bit for
    /// registers 8-15 (spec §4.6 code generator consumes this for both
    /// `unsafe`-block instructions and ordinary instruction encoding).
    pub fn encoding(self) -> u8 {
        match self {
            Reg::Rax => 0,
            Reg::Rcx => 1,
            Reg::Rdx => 2,
            Reg::Rbx => 3,
            Reg::Rsp => 4,
            Reg::Rbp => 5,
            Reg::Rsi => 6,
            Reg::Rdi => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::R12 => 12,
            Reg::R13 => 13,
            Reg::R14 => 14,
            Reg::R15 => 15,
        }
    }

    /// Whether this register needs REX.B/R/X set (encoding ≥ 8).
    pub fn needs_rex_extension(self) -> bool {
        self.encoding() >= 8
    }
}

/// Either a register or an immediate, for the right-hand side of an
/// `unsafe` instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
}

/// One low-level instruction inside an `unsafe` block (spec §4.6): the set
/// of forms is closed (`REG <- imm`, `REG <- REG`, `REG <- REG + REG|imm`,
/// `REG <- REG - REG|imm`, `REG <- [REG + imm]`, `[REG + imm] <- REG|imm`,
/// `stack <- REG`, `REG <- stack`, `syscall`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnsafeInstr {
    Set { dst: Reg, src: Operand },
    Add { dst: Reg, lhs: Reg, rhs: Operand },
    Sub { dst: Reg, lhs: Reg, rhs: Operand },
    Load { dst: Reg, base: Reg, offset: i32 },
    Store { base: Reg, offset: i32, src: Operand },
    Push { src: Reg },
    Pop { dst: Reg },
    Syscall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostfixOp {
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStateKind {
    First,
    Last,
    Counter,
    Index,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Assignment {
        name: String,
        value: Box<Expr>,
        mutable: bool,
        update: bool,
        /// Optional numeric-width annotation (`x: i32 = ...`), consulted at
        /// `unsafe`/FFI boundaries (spec §3.2 "precision?").
        precision: Option<CType>,
        /// Set by `# flap:hot` annotation or inferred from a loop-carried
        /// binding; exempts the binding from dead-code elimination (spec
        /// §4.3 pass 3, §8 property 3).
        hot: bool,
        span: Span,
    },
    /// `a, b[, ...] = rhs` tuple unpack (spec §4.2).
    TupleAssign {
        names: Vec<String>,
        mutable: bool,
        value: Box<Expr>,
        span: Span,
    },
    ExpressionStmt(Box<Expr>),
    Loop {
        /// Named loop variable (`i`, `item`); `None` for the infinite and
        /// counted forms.
        iterator: Option<String>,
        iterable: Option<Box<Expr>>,
        body: Vec<Statement>,
        max_iterations: Option<MaxIterations>,
        threads: ThreadCount,
        /// Base offset for a counted loop declared `@ N from K { ... }`;
        /// `0` unless explicitly specified (spec §3.2).
        base_offset: i64,
        /// 1-indexed outermost-first label, assigned by the parser.
        label: usize,
        span: Span,
    },
    Jump(JumpNode, Span),
    CStruct(CStructDecl),
    Alias {
        name: String,
        target: String,
        span: Span,
    },
    Import {
        path: String,
        span: Span,
    },
    Arena(ArenaBlock, Span),
    Defer {
        expr: Box<Expr>,
        span: Span,
    },
    Spawn {
        expr: Box<Expr>,
        /// `spawn expr | params | block` receive-then-process continuation
        /// (spec §5).
        handler: Option<(Vec<String>, Vec<Statement>)>,
        span: Span,
    },
    RegisterAssign(UnsafeInstr, Span),
}

impl Statement {
    pub fn span(&self) -> Span {
        match self {
            Statement::Assignment { span, .. }
            | Statement::TupleAssign { span, .. }
            | Statement::Alias { span, .. }
            | Statement::Import { span, .. }
            | Statement::Defer { span, .. }
            | Statement::Spawn { span, .. }
            | Statement::RegisterAssign(_, span)
            | Statement::Jump(_, span)
            | Statement::Arena(_, span) => span.clone(),
            Statement::Loop { span, .. } => span.clone(),
            Statement::CStruct(decl) => decl.span.clone(),
            Statement::ExpressionStmt(expr) => expr.span(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FStringSegment {
    Literal(String),
    Interpolated(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64, Span),
    String(String, Span),
    FString(Vec<FStringSegment>, Span),
    Ident(String, Span),
    NamespacedIdent {
        namespace: String,
        name: String,
        span: Span,
    },
    Binary {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Unary {
        op: String,
        operand: Box<Expr>,
        span: Span,
    },
    Postfix {
        op: PostfixOp,
        operand: Box<Expr>,
        span: Span,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
        is_pure: bool,
        /// Derived by closure analysis; empty until that pass runs (spec
        /// §3.2 invariant).
        captured: Vec<String>,
        /// True when this lambda is declared inside another lambda's body
        /// (affects environment-pointer threading at codegen time).
        nested: bool,
        span: Span,
    },
    MultiLambda {
        arms: Vec<LambdaArm>,
        span: Span,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    DirectCall {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
    Slice {
        target: Box<Expr>,
        range: Box<Expr>,
        span: Span,
    },
    Range {
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
        inclusive: bool,
        step: Option<Box<Expr>>,
        span: Span,
    },
    List(Vec<Expr>, Span),
    Map {
        keys: Vec<Expr>,
        values: Vec<Expr>,
        span: Span,
    },
    Block(Vec<Statement>, Span),
    Match {
        /// `Some(value)` for a value match; `None` for a guard match (spec
        /// §4.2 block disambiguation).
        condition: Option<Box<Expr>>,
        arms: Vec<MatchArm>,
        default: Option<Box<Expr>>,
        span: Span,
    },
    Cast {
        value: Box<Expr>,
        target: CType,
        span: Span,
    },
    Length(Box<Expr>, Span),
    In {
        value: Box<Expr>,
        collection: Box<Expr>,
        span: Span,
    },
    Pipe {
        value: Box<Expr>,
        func: Box<Expr>,
        span: Span,
    },
    /// An inline parallel evaluation: the body runs once per worker (same
    /// source, no loop variable) and the expression's value is the list of
    /// per-worker results (spec §5; see `DESIGN.md` for the judgment call).
    Parallel {
        threads: ThreadCount,
        body: Box<Expr>,
        span: Span,
    },
    /// `&port <- expr` (send) or `expr <- => &port` (receive), spec §5.
    Send {
        target: Box<Expr>,
        value: Option<Box<Expr>>,
        span: Span,
    },
    Cons {
        head: Box<Expr>,
        tail: Box<Expr>,
        span: Span,
    },
    LoopState {
        kind: LoopStateKind,
        /// Loop label this refers to; `None` means "innermost enclosing
        /// loop".
        depth: Option<usize>,
        span: Span,
    },
    Jump(JumpNode, Span),
    Arena(ArenaBlock, Span),
    Unsafe {
        variants: UnsafeVariants,
        span: Span,
    },
    /// A fixed-size numeric vector literal, e.g. for SIMD-flavored
    /// `unsafe` interop.
    Vector(Vec<Expr>, Span),
    /// `name!` — read `name`, then mark it moved so later references in
    /// the same scope become a semantic error (spec §4.6, §8 property 4).
    Move(String, Span),
    /// `left or! right` — fallback to `right` (expression or block) when
    /// `left` is an error-NaN or null (spec §4.6, GLOSSARY "or!").
    OrElse {
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    /// A placeholder inserted by the parser at a synchronization point
    /// after a recoverable syntax error (spec §4.2 "Error recovery").
    ErrorExpr(Span),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Number(_, s)
            | Expr::String(_, s)
            | Expr::FString(_, s)
            | Expr::Ident(_, s)
            | Expr::List(_, s)
            | Expr::Block(_, s)
            | Expr::Vector(_, s)
            | Expr::Move(_, s)
            | Expr::Jump(_, s)
            | Expr::Arena(_, s)
            | Expr::ErrorExpr(s) => s.clone(),
            Expr::NamespacedIdent { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Postfix { span, .. }
            | Expr::Lambda { span, .. }
            | Expr::MultiLambda { span, .. }
            | Expr::Call { span, .. }
            | Expr::DirectCall { span, .. }
            | Expr::Index { span, .. }
            | Expr::Slice { span, .. }
            | Expr::Range { span, .. }
            | Expr::Map { span, .. }
            | Expr::Match { span, .. }
            | Expr::Cast { span, .. }
            | Expr::Length(_, span)
            | Expr::In { span, .. }
            | Expr::Pipe { span, .. }
            | Expr::Parallel { span, .. }
            | Expr::Send { span, .. }
            | Expr::Cons { span, .. }
            | Expr::LoopState { span, .. }
            | Expr::Unsafe { span, .. }
            | Expr::OrElse { span, .. } => span.clone(),
        }
    }

    pub fn is_literal_number(&self) -> bool {
        matches!(self, Expr::Number(_, _))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Number(v, _) => Some(*v),
            _ => None,
        }
    }
}

/// A complete compilation unit: every top-level statement, in source
/// order (spec §6.3: "Entry point runs the program's top-level
/// statements").
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }
}
