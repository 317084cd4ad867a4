//! Parser
//!
//! Recursive-descent parser with ten explicit precedence levels and the
//! contextual block-disambiguation rules of spec §4.2. On an unexpected
//! token the parser records a diagnostic, emits an [`Expr::ErrorExpr`]
//! placeholder, and skips to the next synchronization point — parsing
//! always continues to the end of the token stream (spec §4.2 "Error
//! recovery", §7).

use crate::ast::*;
use crate::error::{Category, Diagnostics, Location, Span};
use crate::lexer::{Keyword, NumberLit, Token, TokenKind};
use flapc_catalog::CType;
use std::path::{Path, PathBuf};

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    diags: &'a mut Diagnostics,
    file: PathBuf,
    /// Next loop label to assign; labels are outermost = 1 (spec §4.2).
    next_loop_label: usize,
    /// Stack of currently-open loop labels, innermost last.
    loop_stack: Vec<usize>,
}

type PResult<T> = Result<T, ()>;

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, diags: &'a mut Diagnostics, file: &Path) -> Self {
        Parser {
            tokens,
            pos: 0,
            diags,
            file: file.to_path_buf(),
            next_loop_label: 1,
            loop_stack: Vec::new(),
        }
    }

    pub fn parse_program(mut self) -> Program {
        let mut statements = Vec::new();
        self.skip_newlines();
        while !self.at_eof() {
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(()) => self.synchronize(),
            }
            self.skip_statement_separators();
        }
        Program { statements }
    }

    // ---------------------------------------------------------------
    // Token stream primitives
    // ---------------------------------------------------------------

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_ahead(&self, n: usize) -> &Token {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn bump(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline) {
            self.bump();
        }
    }

    fn skip_statement_separators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semicolon) {
            self.bump();
        }
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Op(s) if s == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> PResult<Token> {
        if std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind) {
            Ok(self.bump())
        } else {
            self.error(format!("expected {what}, found {:?}", self.peek_kind()));
            Err(())
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let span = self.peek().span.clone();
        self.diags.report(
            crate::error::Diagnostic::new(crate::error::Level::Error, Category::Syntax, message.into())
                .at(Location::new(self.file.clone(), span)),
        );
    }

    fn error_expr(&mut self) -> Expr {
        Expr::ErrorExpr(self.peek().span.clone())
    }

    /// Skip tokens until a synchronization point: `}`, a newline at
    /// statement depth, `;`, or a keyword that starts a statement (spec
    /// §4.2 "Error recovery").
    fn synchronize(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::RBrace | TokenKind::Semicolon | TokenKind::Newline => {
                    self.bump();
                    return;
                }
                TokenKind::Keyword(
                    Keyword::Defer | Keyword::Arena | Keyword::Import | Keyword::Use
                    | Keyword::Spawn | Keyword::Alias | Keyword::CStruct,
                ) => return,
                TokenKind::At => return,
                _ => {
                    self.bump();
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------

    fn parse_statement(&mut self) -> PResult<Statement> {
        self.skip_newlines();
        match self.peek_kind().clone() {
            TokenKind::Keyword(Keyword::Import) | TokenKind::Keyword(Keyword::Use) => {
                self.parse_import()
            }
            TokenKind::Keyword(Keyword::Alias) => self.parse_alias(),
            TokenKind::Keyword(Keyword::CStruct) => self.parse_cstruct(),
            TokenKind::Keyword(Keyword::Defer) => self.parse_defer(),
            TokenKind::Keyword(Keyword::Arena) => self.parse_arena_stmt(),
            TokenKind::Keyword(Keyword::Spawn) => self.parse_spawn(),
            TokenKind::Keyword(Keyword::Ret) => self.parse_jump_stmt(),
            TokenKind::At | TokenKind::AtAt => self.parse_loop(),
            _ => self.parse_simple_statement(),
        }
    }

    fn parse_import(&mut self) -> PResult<Statement> {
        let start = self.peek().span.clone();
        self.bump();
        let path = match self.peek_kind().clone() {
            TokenKind::String { text, .. } => {
                self.bump();
                text
            }
            TokenKind::Ident(name) => {
                self.bump();
                let mut path = name;
                while self.eat(&TokenKind::Dot) {
                    if let TokenKind::Ident(seg) = self.peek_kind().clone() {
                        self.bump();
                        path.push('.');
                        path.push_str(&seg);
                    }
                }
                path
            }
            _ => {
                self.error("expected a module path after 'import'");
                return Err(());
            }
        };
        Ok(Statement::Import { path, span: start })
    }

    fn parse_alias(&mut self) -> PResult<Statement> {
        let start = self.peek().span.clone();
        self.bump();
        let name = self.expect_ident("an alias name")?;
        self.eat_op("=");
        let target = self.expect_ident("an alias target")?;
        Ok(Statement::Alias {
            name,
            target,
            span: start,
        })
    }

    fn parse_cstruct(&mut self) -> PResult<Statement> {
        let start = self.peek().span.clone();
        self.bump();
        let name = self.expect_ident("a cstruct name")?;
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut fields = Vec::new();
        let mut offset = 0u32;
        let mut align = 1u32;
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            let field_name = self.expect_ident("a field name")?;
            self.expect(&TokenKind::Colon, "':'")?;
            let c_type = self.parse_c_type()?;
            let size = c_type.size_bytes().max(1);
            offset = offset.div_ceil(size) * size;
            fields.push(CStructField {
                name: field_name,
                c_type,
                offset,
            });
            offset += size;
            align = align.max(size);
            self.skip_statement_separators();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        let size = offset.div_ceil(align.max(1)) * align.max(1);
        Ok(Statement::CStruct(CStructDecl {
            name,
            fields,
            size,
            align,
            span: start,
        }))
    }

    fn parse_c_type(&mut self) -> PResult<CType> {
        let name = self.expect_ident("a C type name")?;
        Ok(match name.as_str() {
            "int8" => CType::Int8,
            "int16" => CType::Int16,
            "int32" => CType::Int32,
            "int64" => CType::Int64,
            "uint8" => CType::UInt8,
            "uint16" => CType::UInt16,
            "uint32" => CType::UInt32,
            "uint64" => CType::UInt64,
            "float32" => CType::Float32,
            "float64" => CType::Float64,
            "cstr" => CType::CStr,
            "ptr" => CType::Ptr,
            "void" => CType::Void,
            other => {
                self.error(format!("unknown C type '{other}'"));
                CType::Ptr
            }
        })
    }

    fn parse_defer(&mut self) -> PResult<Statement> {
        let start = self.peek().span.clone();
        self.bump();
        let expr = self.parse_expr()?;
        Ok(Statement::Defer {
            expr: Box::new(expr),
            span: start,
        })
    }

    fn parse_arena_stmt(&mut self) -> PResult<Statement> {
        let start = self.peek().span.clone();
        self.bump();
        let body = self.parse_statement_block_body()?;
        Ok(Statement::Arena(ArenaBlock { body }, start))
    }

    fn parse_spawn(&mut self) -> PResult<Statement> {
        let start = self.peek().span.clone();
        self.bump();
        let expr = self.parse_expr()?;
        let handler = if self.eat(&TokenKind::Pipe) {
            let mut params = Vec::new();
            while !matches!(self.peek_kind(), TokenKind::Pipe) {
                params.push(self.expect_ident("a parameter name")?);
                self.eat(&TokenKind::Comma);
            }
            self.expect(&TokenKind::Pipe, "'|'")?;
            let body = self.parse_statement_block_body()?;
            Some((params, body))
        } else {
            None
        };
        Ok(Statement::Spawn {
            expr: Box::new(expr),
            handler,
            span: start,
        })
    }

    fn parse_jump_stmt(&mut self) -> PResult<Statement> {
        let start = self.peek().span.clone();
        self.bump();
        let label = if self.eat(&TokenKind::At) {
            match self.peek_kind().clone() {
                TokenKind::Number(n) => {
                    self.bump();
                    Some(n.value() as usize)
                }
                _ => {
                    self.error("expected a loop label number after '@'");
                    None
                }
            }
        } else {
            None
        };
        let value = if self.is_statement_end() {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        Ok(Statement::Jump(JumpNode { label, value }, start))
    }

    fn is_statement_end(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
        )
    }

    fn expect_ident(&mut self, what: &str) -> PResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.bump();
                Ok(name)
            }
            _ => {
                self.error(format!("expected {what}, found {:?}", self.peek_kind()));
                Err(())
            }
        }
    }

    /// `@`/`@@`/`N @` loop forms (spec §4.2).
    fn parse_loop(&mut self) -> PResult<Statement> {
        let start = self.peek().span.clone();
        let threads = if self.eat(&TokenKind::AtAt) {
            ThreadCount::Parallel(None)
        } else {
            self.expect(&TokenKind::At, "'@'")?;
            ThreadCount::Sequential
        };

        let label = self.next_loop_label;
        self.next_loop_label += 1;
        self.loop_stack.push(label);

        // `@ i in expr { ... }` (range or collection) or `@ N { ... }`
        // (counted) or `@ { ... }` (infinite).
        let mut iterator = None;
        let mut iterable = None;
        if let TokenKind::Ident(name) = self.peek_kind().clone() {
            if matches!(self.peek_ahead(1).kind, TokenKind::Keyword(Keyword::In)) {
                self.bump();
                self.bump(); // `in`
                iterator = Some(name);
                iterable = Some(Box::new(self.parse_expr()?));
            }
        }
        if iterator.is_none() && !matches!(self.peek_kind(), TokenKind::LBrace) {
            // counted loop: `@ N { ... }`
            iterable = Some(Box::new(self.parse_expr()?));
        }

        let max_iterations = if matches!(self.peek_kind(), TokenKind::Keyword(Keyword::Max)) {
            self.bump();
            if matches!(self.peek_kind(), TokenKind::Keyword(Keyword::Inf)) {
                self.bump();
                Some(MaxIterations::Infinite)
            } else {
                let n = self.parse_expr()?;
                n.as_number().map(|v| MaxIterations::Limit(v as u64))
            }
        } else {
            None
        };

        let body = self.parse_statement_block_body()?;
        self.loop_stack.pop();
        Ok(Statement::Loop {
            iterator,
            iterable,
            body,
            max_iterations,
            threads,
            base_offset: 0,
            label,
            span: start,
        })
    }

    fn parse_statement_block_body(&mut self) -> PResult<Vec<Statement>> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut statements = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(()) => self.synchronize(),
            }
            self.skip_statement_separators();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(statements)
    }

    /// Assignment, tuple-unpack, or a bare expression statement. Handles
    /// `=`, `:=`, `<-` at statement level (spec §4.2: "assignment ... are
    /// statement-level and lowest").
    fn parse_simple_statement(&mut self) -> PResult<Statement> {
        let start = self.peek().span.clone();

        // Tuple unpack: `a, b[, ...] = rhs`.
        if let TokenKind::Ident(first) = self.peek_kind().clone() {
            if matches!(self.peek_ahead(1).kind, TokenKind::Comma) {
                let checkpoint = self.pos;
                let mut names = vec![first];
                self.bump();
                let mut ok = true;
                while self.eat(&TokenKind::Comma) {
                    if let TokenKind::Ident(n) = self.peek_kind().clone() {
                        self.bump();
                        names.push(n);
                    } else {
                        ok = false;
                        break;
                    }
                }
                let mutable = self.check_op(":=");
                if ok && (self.check_op("=") || mutable) {
                    self.bump();
                    let value = self.parse_expr()?;
                    return Ok(Statement::TupleAssign {
                        names,
                        mutable,
                        value: Box::new(value),
                        span: start,
                    });
                }
                self.pos = checkpoint;
            }
        }

        // Simple/precision/hot assignment: `name = expr`, `name := expr`,
        // `name: i32 = expr`.
        if let TokenKind::Ident(name) = self.peek_kind().clone() {
            let checkpoint = self.pos;
            self.bump();
            let mut precision = None;
            if self.eat(&TokenKind::Colon) {
                precision = Some(self.parse_c_type()?);
            }
            let mutable = self.check_op(":=");
            if self.check_op("=") || mutable || self.check_op("<-") {
                let receive = self.check_op("<-");
                self.bump();
                let value = self.parse_expr()?;
                if receive {
                    return Ok(Statement::ExpressionStmt(Box::new(Expr::Send {
                        target: Box::new(Expr::Ident(name, start.clone())),
                        value: Some(Box::new(value)),
                        span: start,
                    })));
                }
                return Ok(Statement::Assignment {
                    name,
                    value: Box::new(value),
                    mutable,
                    update: false,
                    precision,
                    hot: false,
                    span: start,
                });
            }
            self.pos = checkpoint;
        }

        let expr = self.parse_expr()?;
        Ok(Statement::ExpressionStmt(Box::new(expr)))
    }

    // ---------------------------------------------------------------
    // Expressions: ten precedence levels, high to low as listed in spec
    // §4.2 is cons > unary > power > multiplicative > additive >
    // comparison > bitwise > and > or > pipe; entry point is the lowest
    // (`pipe`).
    // ---------------------------------------------------------------

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_pipe()
    }

    fn parse_pipe(&mut self) -> PResult<Expr> {
        let mut left = self.parse_or_else()?;
        while self.check_op("|>") {
            let span = self.bump().span;
            let func = self.parse_or_else()?;
            left = Expr::Pipe {
                value: Box::new(left),
                func: Box::new(func),
                span,
            };
        }
        Ok(left)
    }

    /// `or!` sits between pipe and the logical-or level: it is documented
    /// in §4.6 as an operator, not one of the ten named levels, so it is
    /// placed just inside `pipe` to let `a or! b |> c` read naturally.
    fn parse_or_else(&mut self) -> PResult<Expr> {
        let mut left = self.parse_or()?;
        while self.check_op("or!") {
            let span = self.bump().span;
            let right = if self.eat(&TokenKind::LBrace) {
                let body = self.parse_block_body_after_brace()?;
                Expr::Block(body, span.clone())
            } else {
                self.parse_or()?
            };
            left = Expr::OrElse {
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_and()?;
        while matches!(self.peek_kind(), TokenKind::Keyword(Keyword::Or) | TokenKind::Keyword(Keyword::Xor)) {
            let op = if matches!(self.peek_kind(), TokenKind::Keyword(Keyword::Xor)) {
                "xor"
            } else {
                "or"
            };
            let span = self.bump().span;
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: op.to_string(),
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_bitwise()?;
        while matches!(self.peek_kind(), TokenKind::Keyword(Keyword::And)) {
            let span = self.bump().span;
            let right = self.parse_bitwise()?;
            left = Expr::Binary {
                op: "and".to_string(),
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_bitwise(&mut self) -> PResult<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Op(s)
                    if matches!(s.as_str(), "&b" | "|b" | "^b" | "<<b" | ">>b" | "<<<b" | ">>>b") =>
                {
                    s.clone()
                }
                _ => break,
            };
            let span = self.bump().span;
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            if matches!(self.peek_kind(), TokenKind::Keyword(Keyword::In)) {
                let span = self.bump().span;
                let collection = self.parse_additive()?;
                left = Expr::In {
                    value: Box::new(left),
                    collection: Box::new(collection),
                    span,
                };
                continue;
            }
            let op = match self.peek_kind() {
                TokenKind::Op(s) if matches!(s.as_str(), "==" | "!=" | "<=" | ">=") => s.clone(),
                TokenKind::Diamond => "<>".to_string(),
                _ => break,
            };
            let span = self.bump().span;
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        // Bare `<`/`>` are lexed generically via the operator table too,
        // but must not shadow lambda arrows (`->`) or generics; handled by
        // longest-match at the lexer level already.
        Ok(left)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Op(s) if matches!(s.as_str(), "+" | "-") => s.clone(),
                _ => break,
            };
            let span = self.bump().span;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Op(s) if matches!(s.as_str(), "*" | "/" | "%") => s.clone(),
                _ => break,
            };
            let span = self.bump().span;
            let right = self.parse_power()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    /// `**` is right-associative.
    fn parse_power(&mut self) -> PResult<Expr> {
        let left = self.parse_unary()?;
        if self.check_op("**") {
            let span = self.bump().span;
            let right = self.parse_power()?;
            return Ok(Expr::Binary {
                op: "**".to_string(),
                left: Box::new(left),
                right: Box::new(right),
                span,
            });
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Op(s) if s == "-" || s == "~b" => Some(s.clone()),
            TokenKind::Keyword(Keyword::Not) => Some("not".to_string()),
            TokenKind::Caret => Some("^".to_string()),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.bump().span;
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                span,
            });
        }
        self.parse_cons()
    }

    /// `::` is right-associative (list cons).
    fn parse_cons(&mut self) -> PResult<Expr> {
        let left = self.parse_cast()?;
        if self.check_op("::") {
            let span = self.bump().span;
            let tail = self.parse_cons()?;
            return Ok(Expr::Cons {
                head: Box::new(left),
                tail: Box::new(tail),
                span,
            });
        }
        Ok(left)
    }

    fn parse_cast(&mut self) -> PResult<Expr> {
        let mut left = self.parse_postfix()?;
        while matches!(self.peek_kind(), TokenKind::Keyword(Keyword::As)) {
            let span = self.bump().span;
            let target = self.parse_c_type()?;
            left = Expr::Cast {
                value: Box::new(left),
                target,
                span,
            };
        }
        Ok(left)
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind().clone() {
                TokenKind::Dot => {
                    self.bump();
                    let name = self.expect_ident("a field/namespace name")?;
                    if self.check_lparen_immediate() {
                        // `ns.fn(args)` reads as a namespaced call.
                        if let Expr::Ident(namespace, _) = &expr {
                            let namespace = namespace.clone();
                            let span = self.bump().span;
                            let args = self.parse_call_args()?;
                            expr = Expr::DirectCall {
                                callee: Box::new(Expr::NamespacedIdent {
                                    namespace,
                                    name,
                                    span: span.clone(),
                                }),
                                args,
                                span,
                            };
                            continue;
                        }
                    }
                    let span = expr.span();
                    expr = if let Expr::Ident(namespace, _) = &expr {
                        Expr::NamespacedIdent {
                            namespace: namespace.clone(),
                            name,
                            span,
                        }
                    } else {
                        Expr::Index {
                            target: Box::new(expr),
                            index: Box::new(Expr::String(name, span.clone())),
                            span,
                        }
                    };
                }
                TokenKind::LParen if self.check_lparen_immediate() => {
                    let span = self.peek().span.clone();
                    let args = self.parse_call_args()?;
                    expr = match expr {
                        Expr::Ident(name, _) => Expr::Call { name, args, span },
                        Expr::NamespacedIdent { namespace, name, .. } => Expr::DirectCall {
                            callee: Box::new(Expr::NamespacedIdent {
                                namespace,
                                name,
                                span: span.clone(),
                            }),
                            args,
                            span,
                        },
                        other => Expr::DirectCall {
                            callee: Box::new(other),
                            args,
                            span,
                        },
                    };
                }
                TokenKind::LBracket => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    let span = expr.span();
                    expr = if matches!(index, Expr::Range { .. }) {
                        Expr::Slice {
                            target: Box::new(expr),
                            range: Box::new(index),
                            span,
                        }
                    } else {
                        Expr::Index {
                            target: Box::new(expr),
                            index: Box::new(index),
                            span,
                        }
                    };
                }
                TokenKind::Op(s) if s == "!" => {
                    self.bump();
                    if let Expr::Ident(name, span) = expr {
                        expr = Expr::Move(name, span);
                    } else {
                        let span = expr.span();
                        expr = Expr::Postfix {
                            op: PostfixOp::Increment,
                            operand: Box::new(expr),
                            span,
                        };
                    }
                }
                TokenKind::Op(s) if s == "++" || s == "--" => {
                    let op = if s == "++" {
                        PostfixOp::Increment
                    } else {
                        PostfixOp::Decrement
                    };
                    let span = self.bump().span;
                    expr = Expr::Postfix {
                        op,
                        operand: Box::new(expr),
                        span,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn check_lparen_immediate(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::LParen)
    }

    fn parse_call_args(&mut self) -> PResult<Vec<Expr>> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RParen | TokenKind::Eof) {
            args.push(self.parse_expr()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let span = self.peek().span.clone();
        match self.peek_kind().clone() {
            TokenKind::Number(n) => {
                self.bump();
                Ok(Expr::Number(n.value(), span))
            }
            TokenKind::String { text, is_fstring } => {
                self.bump();
                if is_fstring {
                    let parts = crate::lexer::split_fstring(&text, self.diags, &self.file);
                    let mut segments = Vec::new();
                    for part in parts {
                        match part {
                            crate::lexer::FStringPart::Literal(s) => {
                                segments.push(FStringSegment::Literal(s))
                            }
                            crate::lexer::FStringPart::Expr(tokens) => {
                                let mut sub_tokens = tokens;
                                sub_tokens.push(Token {
                                    kind: TokenKind::Eof,
                                    lexeme: String::new(),
                                    span: span.clone(),
                                });
                                let mut sub = Parser::new(sub_tokens, self.diags, &self.file);
                                let e = sub.parse_expr().unwrap_or_else(|_| Expr::ErrorExpr(span.clone()));
                                segments.push(FStringSegment::Interpolated(Box::new(e)));
                            }
                        }
                    }
                    Ok(Expr::FString(segments, span))
                } else {
                    Ok(Expr::String(text, span))
                }
            }
            TokenKind::Hash => {
                self.bump();
                let operand = self.parse_postfix()?;
                Ok(Expr::Length(Box::new(operand), span))
            }
            TokenKind::Underscore => {
                self.bump();
                Ok(Expr::Ident("_".to_string(), span))
            }
            TokenKind::LParen => self.parse_paren_or_lambda(),
            TokenKind::LBracket => self.parse_list_or_range(),
            TokenKind::LBrace => self.parse_brace_expr(),
            TokenKind::Keyword(Keyword::Arena) => {
                self.bump();
                let body = self.parse_statement_block_body()?;
                Ok(Expr::Arena(ArenaBlock { body }, span))
            }
            TokenKind::Keyword(Keyword::Ret) => {
                self.bump();
                let label = if self.eat(&TokenKind::At) {
                    match self.peek_kind().clone() {
                        TokenKind::Number(n) => {
                            self.bump();
                            Some(n.value() as usize)
                        }
                        _ => None,
                    }
                } else {
                    None
                };
                let value = if self.is_statement_end() || matches!(self.peek_kind(), TokenKind::RParen) {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                Ok(Expr::Jump(JumpNode { label, value }, span))
            }
            TokenKind::Keyword(Keyword::Unsafe) => self.parse_unsafe_expr(),
            TokenKind::At => {
                self.bump();
                self.parse_loop_state(span)
            }
            TokenKind::Ident(name) => self.parse_ident_or_lambda(name, span),
            TokenKind::Op(s) if s == "->" => self.parse_lambda_no_params(span),
            TokenKind::Op(s) if s == "<-" => {
                self.bump();
                let port = self.parse_postfix()?;
                Ok(Expr::Send {
                    target: Box::new(port),
                    value: None,
                    span,
                })
            }
            _ => {
                self.error(format!("unexpected token {:?}", self.peek_kind()));
                self.bump();
                Ok(self.error_expr())
            }
        }
    }

    fn parse_loop_state(&mut self, span: Span) -> PResult<Expr> {
        let name = self.expect_ident("a loop-state keyword (first/last/counter/i)")?;
        let kind = match name.as_str() {
            "first" => LoopStateKind::First,
            "last" => LoopStateKind::Last,
            "counter" => LoopStateKind::Counter,
            _ if name.starts_with('i') => LoopStateKind::Index,
            _ => {
                self.error(format!("unknown loop-state keyword '@{name}'"));
                LoopStateKind::Index
            }
        };
        let depth = name
            .strip_prefix('i')
            .and_then(|rest| rest.parse::<usize>().ok());
        Ok(Expr::LoopState { kind, depth, span })
    }

    fn parse_unsafe_expr(&mut self) -> PResult<Expr> {
        let span = self.peek().span.clone();
        self.bump();
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut amd64 = Vec::new();
        let mut arm64 = Vec::new();
        let mut riscv64 = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            if let TokenKind::Ident(arch) = self.peek_kind().clone() {
                if matches!(arch.as_str(), "amd64" | "arm64" | "riscv64") {
                    self.bump();
                    let body = self.parse_unsafe_body()?;
                    match arch.as_str() {
                        "amd64" => amd64 = body,
                        "arm64" => arm64 = body,
                        _ => riscv64 = body,
                    }
                    self.skip_statement_separators();
                    continue;
                }
            }
            self.synchronize();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::Unsafe {
            variants: UnsafeVariants {
                amd64,
                arm64,
                riscv64,
            },
            span,
        })
    }

    fn parse_unsafe_body(&mut self) -> PResult<Vec<Statement>> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.skip_newlines();
        let mut body = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            let span = self.peek().span.clone();
            if let Some(instr) = self.parse_unsafe_instr()? {
                body.push(Statement::RegisterAssign(instr, span));
            }
            self.skip_statement_separators();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(body)
    }

    fn parse_reg(&mut self) -> PResult<Reg> {
        let name = self.expect_ident("a register name")?;
        Ok(match name.to_lowercase().as_str() {
            "rax" => Reg::Rax,
            "rbx" => Reg::Rbx,
            "rcx" => Reg::Rcx,
            "rdx" => Reg::Rdx,
            "rsi" => Reg::Rsi,
            "rdi" => Reg::Rdi,
            "rbp" => Reg::Rbp,
            "rsp" => Reg::Rsp,
            "r8" => Reg::R8,
            "r9" => Reg::R9,
            "r10" => Reg::R10,
            "r11" => Reg::R11,
            "r12" => Reg::R12,
            "r13" => Reg::R13,
            "r14" => Reg::R14,
            "r15" => Reg::R15,
            other => {
                self.error(format!("unknown register '{other}'"));
                Reg::Rax
            }
        })
    }

    fn parse_operand(&mut self) -> PResult<Operand> {
        if let TokenKind::Number(n) = self.peek_kind().clone() {
            self.bump();
            return Ok(Operand::Imm(n.value() as i64));
        }
        if self.check_op("-") {
            self.bump();
            if let TokenKind::Number(n) = self.peek_kind().clone() {
                self.bump();
                return Ok(Operand::Imm(-(n.value() as i64)));
            }
        }
        Ok(Operand::Reg(self.parse_reg()?))
    }

    fn parse_unsafe_instr(&mut self) -> PResult<Option<UnsafeInstr>> {
        if let TokenKind::Ident(word) = self.peek_kind().clone() {
            if word == "syscall" {
                self.bump();
                return Ok(Some(UnsafeInstr::Syscall));
            }
            if word == "stack" {
                self.bump();
                self.eat_op("<-");
                let src = self.parse_reg()?;
                return Ok(Some(UnsafeInstr::Push { src }));
            }
        }
        if matches!(self.peek_kind(), TokenKind::LBracket) {
            self.bump();
            let base = self.parse_reg()?;
            let mut offset = 0i32;
            if self.check_op("+") || self.check_op("-") {
                let neg = self.check_op("-");
                self.bump();
                if let TokenKind::Number(n) = self.peek_kind().clone() {
                    self.bump();
                    offset = n.value() as i32 * if neg { -1 } else { 1 };
                }
            }
            self.expect(&TokenKind::RBracket, "']'")?;
            self.eat_op("<-");
            let src = self.parse_operand()?;
            return Ok(Some(UnsafeInstr::Store { base, offset, src }));
        }

        let dst = self.parse_reg()?;
        if !self.eat_op("<-") {
            self.error("expected '<-' in unsafe instruction");
            return Ok(None);
        }
        if let TokenKind::Ident(word) = self.peek_kind().clone() {
            if word == "stack" {
                self.bump();
                return Ok(Some(UnsafeInstr::Pop { dst }));
            }
        }
        if matches!(self.peek_kind(), TokenKind::LBracket) {
            self.bump();
            let base = self.parse_reg()?;
            let mut offset = 0i32;
            if self.check_op("+") || self.check_op("-") {
                let neg = self.check_op("-");
                self.bump();
                if let TokenKind::Number(n) = self.peek_kind().clone() {
                    self.bump();
                    offset = n.value() as i32 * if neg { -1 } else { 1 };
                }
            }
            self.expect(&TokenKind::RBracket, "']'")?;
            return Ok(Some(UnsafeInstr::Load { dst, base, offset }));
        }
        let first = self.parse_operand()?;
        if self.check_op("+") || self.check_op("-") {
            let is_add = self.check_op("+");
            self.bump();
            let lhs = match first {
                Operand::Reg(r) => r,
                Operand::Imm(_) => {
                    self.error("left-hand side of 'REG <- a OP b' must be a register");
                    dst
                }
            };
            let rhs = self.parse_operand()?;
            return Ok(Some(if is_add {
                UnsafeInstr::Add { dst, lhs, rhs }
            } else {
                UnsafeInstr::Sub { dst, lhs, rhs }
            }));
        }
        Ok(Some(UnsafeInstr::Set { dst, src: first }))
    }

    fn parse_ident_or_lambda(&mut self, name: String, span: Span) -> PResult<Expr> {
        // `name -> expr` (single-parameter lambda).
        if matches!(self.peek_ahead(1).kind, TokenKind::Op(ref s) if s == "->") {
            self.bump();
            self.bump();
            let body = self.parse_lambda_body()?;
            return Ok(Expr::Lambda {
                params: vec![name],
                body: Box::new(body),
                is_pure: false,
                captured: Vec::new(),
                nested: false,
                span,
            });
        }
        self.bump();
        Ok(Expr::Ident(name, span))
    }

    /// `(params) -> expr`, or a fully parenthesized expression, or a
    /// parenthesized tuple (treated as a `List` literal).
    fn parse_paren_or_lambda(&mut self) -> PResult<Expr> {
        let span = self.peek().span.clone();
        let checkpoint = self.pos;
        if let Some(params) = self.try_parse_param_list() {
            if matches!(self.peek_kind(), TokenKind::Op(s) if s == "->") {
                self.bump();
                let body = self.parse_lambda_body()?;
                return Ok(Expr::Lambda {
                    params,
                    body: Box::new(body),
                    is_pure: false,
                    captured: Vec::new(),
                    nested: false,
                    span,
                });
            }
        }
        self.pos = checkpoint;
        self.bump(); // '('
        let mut items = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RParen | TokenKind::Eof) {
            items.push(self.parse_expr()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        if items.len() == 1 {
            Ok(items.into_iter().next().unwrap())
        } else {
            Ok(Expr::List(items, span))
        }
    }

    /// Attempt to parse `(ident, ident, ...)` as a parameter list without
    /// committing; returns `None` (and leaves `self.pos` advanced — caller
    /// must restore on failure) if the tokens aren't a clean ident list.
    fn try_parse_param_list(&mut self) -> Option<Vec<String>> {
        if !self.eat(&TokenKind::LParen) {
            return None;
        }
        let mut params = Vec::new();
        while let TokenKind::Ident(name) = self.peek_kind().clone() {
            self.bump();
            params.push(name);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        if self.eat(&TokenKind::RParen) {
            Some(params)
        } else {
            None
        }
    }

    fn parse_lambda_no_params(&mut self, span: Span) -> PResult<Expr> {
        self.bump(); // '->'
        let body = self.parse_lambda_body()?;
        Ok(Expr::Lambda {
            params: Vec::new(),
            body: Box::new(body),
            is_pure: false,
            captured: Vec::new(),
            nested: false,
            span,
        })
    }

    fn parse_lambda_body(&mut self) -> PResult<Expr> {
        if matches!(self.peek_kind(), TokenKind::LBrace) {
            self.parse_brace_expr()
        } else {
            self.parse_expr()
        }
    }

    fn parse_list_or_range(&mut self) -> PResult<Expr> {
        let span = self.peek().span.clone();
        self.bump(); // '['
        if self.eat(&TokenKind::RBracket) {
            return Ok(Expr::List(Vec::new(), span));
        }
        let first = self.parse_expr()?;
        if let Expr::Range { .. } = &first {
            self.expect(&TokenKind::RBracket, "']'")?;
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if matches!(self.peek_kind(), TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(&TokenKind::RBracket, "']'")?;
        Ok(Expr::List(items, span))
    }

    /// `{ ... }` block disambiguation (spec §4.2): a map literal if a
    /// top-level `:` appears before any `->`/`~>`; a match block if a
    /// top-level arm uses `->`/`~>`; otherwise a statement block.
    fn parse_brace_expr(&mut self) -> PResult<Expr> {
        let span = self.peek().span.clone();
        self.bump(); // '{'
        match self.classify_brace_body() {
            BraceKind::Map => self.parse_map_body(span),
            BraceKind::GuardMatch => self.parse_guard_match_body(span, None),
            BraceKind::StatementBlock => {
                let body = self.parse_block_body_after_brace()?;
                Ok(Expr::Block(body, span))
            }
        }
    }

    fn parse_block_body_after_brace(&mut self) -> PResult<Vec<Statement>> {
        self.skip_newlines();
        let mut statements = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(()) => self.synchronize(),
            }
            self.skip_statement_separators();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(statements)
    }

    /// Scans (without consuming) the tokens up to the matching `}` at
    /// depth 0 to decide which of the three block forms this is.
    fn classify_brace_body(&self) -> BraceKind {
        let mut depth = 0i32;
        let mut i = self.pos;
        while i < self.tokens.len() {
            match &self.tokens[i].kind {
                TokenKind::LBrace | TokenKind::LParen | TokenKind::LBracket => depth += 1,
                TokenKind::RBrace if depth == 0 => break,
                TokenKind::RBrace | TokenKind::RParen | TokenKind::RBracket => depth -= 1,
                TokenKind::Op(s) if depth == 0 && (s == "->" || s == "~>") => {
                    return BraceKind::GuardMatch;
                }
                TokenKind::Colon if depth == 0 => return BraceKind::Map,
                _ => {}
            }
            i += 1;
        }
        BraceKind::StatementBlock
    }

    fn parse_map_body(&mut self, span: Span) -> PResult<Expr> {
        self.skip_newlines();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            let key = self.parse_expr()?;
            self.expect(&TokenKind::Colon, "':'")?;
            let value = self.parse_expr()?;
            keys.push(key);
            values.push(value);
            if !self.eat(&TokenKind::Comma) {
                self.skip_newlines();
            }
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::Map { keys, values, span })
    }

    /// Parses a guard-match body (`| guard -> result` arms) or, if
    /// `condition` is `Some`, a value-match body (`literal -> result`
    /// arms, optionally with `_ -> default`).
    fn parse_guard_match_body(&mut self, span: Span, condition: Option<Box<Expr>>) -> PResult<Expr> {
        self.skip_newlines();
        let mut arms = Vec::new();
        let mut default = None;
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            self.eat(&TokenKind::Pipe);
            let arm_span = self.peek().span.clone();
            if matches!(self.peek_kind(), TokenKind::Underscore) {
                self.bump();
                self.eat_op("->");
                self.eat_op("~>");
                default = Some(Box::new(self.parse_expr()?));
            } else {
                let test = self.parse_expr()?;
                if !(self.eat_op("->") || self.eat_op("~>")) {
                    self.error("expected '->' or '~>' in match arm");
                }
                let result = self.parse_expr()?;
                arms.push(MatchArm {
                    test: Box::new(test),
                    result: Box::new(result),
                    span: arm_span,
                });
            }
            self.skip_statement_separators();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::Match {
            condition,
            arms,
            default,
            span,
        })
    }

    /// Value-match form: `condition { literal -> result ~> default }`.
    /// Called by statement/expr parsing whenever an expression is
    /// immediately followed by `{` and the body classifies as a match.
    pub fn parse_value_match(&mut self, condition: Expr) -> PResult<Expr> {
        let span = self.peek().span.clone();
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.parse_guard_match_body(span, Some(Box::new(condition)))
    }

    /// Entry point used by callers that need range literal parsing
    /// (`start..end`, `start..<end`, `start..=end`) outside of `[...]`.
    pub fn parse_range_after(&mut self, start: Option<Expr>) -> PResult<Expr> {
        let span = self.peek().span.clone();
        let (inclusive, exclusive_strict) = if self.check_op("..=") {
            self.bump();
            (true, false)
        } else if self.check_op("..<") {
            self.bump();
            (false, true)
        } else if self.check_op("..") {
            self.bump();
            (false, false)
        } else {
            return start.ok_or(());
        };
        let _ = exclusive_strict;
        let end = if self.is_statement_end() || matches!(self.peek_kind(), TokenKind::RBracket) {
            None
        } else {
            Some(Box::new(self.parse_additive()?))
        };
        Ok(Expr::Range {
            start: start.map(Box::new),
            end,
            inclusive,
            step: None,
            span,
        })
    }
}

enum BraceKind {
    Map,
    GuardMatch,
    StatementBlock,
}

/// Parse a full program from source text, the public entry point used by
/// [`crate::compile`].
pub fn parse(source: &str, diags: &mut Diagnostics, file: &Path) -> Program {
    let tokens = crate::lexer::Lexer::new(source).tokenize(diags, file);
    Parser::new(tokens, diags, file).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> (Program, Diagnostics) {
        let mut diags = Diagnostics::new();
        let program = parse(src, &mut diags, Path::new("<test>"));
        (program, diags)
    }

    #[test]
    fn parses_assignment_and_call() {
        let (program, diags) = parse_ok("x = 1\nprintln(x)\n");
        assert!(!diags.has_errors());
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(program.statements[0], Statement::Assignment { .. }));
    }

    #[test]
    fn parses_lambda_single_param() {
        let (program, diags) = parse_ok("double = x -> x * 2\n");
        assert!(!diags.has_errors());
        match &program.statements[0] {
            Statement::Assignment { value, .. } => {
                assert!(matches!(**value, Expr::Lambda { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reports_immutable_reassignment_is_still_parsed() {
        // Mutability enforcement is a semantic check, not a parse error;
        // the parser must still accept the syntax (spec §8 scenario table).
        let (_, diags) = parse_ok("x = 42\nx = 100\n");
        assert!(!diags.has_errors());
    }

    #[test]
    fn parses_counted_loop() {
        let (program, diags) = parse_ok("@ 3 { println(1) }\n");
        assert!(!diags.has_errors());
        assert!(matches!(program.statements[0], Statement::Loop { .. }));
    }

    #[test]
    fn error_recovery_continues_parsing() {
        let (program, diags) = parse_ok("x = )\ny = 2\n");
        assert!(diags.has_errors());
        // Parsing should still have produced a statement for `y`.
        assert!(program.statements.iter().any(|s| matches!(
            s,
            Statement::Assignment { name, .. } if name == "y"
        )));
    }
}
