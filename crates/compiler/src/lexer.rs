//! Lexer
//!
//! Single-pass tokenizer (spec §4.1). Produces a flat token stream with
//! source locations; the parser does all structural disambiguation.
//!
//! Numbers keep their base (decimal/hex/binary) and float-ness so the
//! parser/optimizer can fold them without re-parsing text. Strings are
//! decoded eagerly except for f-string interpolation fragments, which are
//! re-lexed lazily by [`split_fstring`] the first time the parser needs
//! them — this matches spec §4.1's "each fragment re-tokenized by
//! recursion".

use crate::error::Span;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberBase {
    Decimal,
    Hex,
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberLit {
    pub base: NumberBase,
    /// Normalized text, digits only (no `0x`/`0b` prefix, no underscores).
    pub text: String,
    pub is_float: bool,
}

impl NumberLit {
    /// Parse the literal to its `f64` runtime value (spec §3.4: every value
    /// is a float64 at runtime, even integer literals).
    pub fn value(&self) -> f64 {
        match self.base {
            NumberBase::Decimal => self.text.parse::<f64>().unwrap_or(f64::NAN),
            NumberBase::Hex => u64::from_str_radix(&self.text, 16).unwrap_or(0) as f64,
            NumberBase::Binary => u64::from_str_radix(&self.text, 2).unwrap_or(0) as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keyword {
    And,
    Or,
    Xor,
    Not,
    In,
    As,
    Ret,
    Defer,
    Arena,
    Unsafe,
    CStruct,
    Class,
    Import,
    Use,
    Spawn,
    Alias,
    Error,
    Max,
    Inf,
}

impl Keyword {
    fn lookup(ident: &str) -> Option<Keyword> {
        use Keyword::*;
        Some(match ident {
            "and" => And,
            "or" => Or,
            "xor" => Xor,
            "not" => Not,
            "in" => In,
            "as" => As,
            "ret" => Ret,
            "defer" => Defer,
            "arena" => Arena,
            "unsafe" => Unsafe,
            "cstruct" => CStruct,
            "class" => Class,
            "import" => Import,
            "use" => Use,
            "spawn" => Spawn,
            "alias" => Alias,
            "error" => Error,
            "max" => Max,
            "inf" => Inf,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(NumberLit),
    /// Decoded text (escapes already resolved, except f-string fragments,
    /// which remain as literal `{`...`}` text for `split_fstring`).
    String { text: String, is_fstring: bool },
    Ident(String),
    Keyword(Keyword),
    /// Any binary/unary operator lexeme (`+`, `==`, `&b`, `or!`, `??`, `???`,
    /// `==>`, ...). The AST stores binary operators as plain strings (spec
    /// §3.2), so the lexer does not need one variant per operator.
    Op(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semicolon,
    Pipe,
    Dot,
    At,
    AtAt,
    Hash,
    Caret,
    Underscore,
    Diamond,
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub span: Span,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)
    }
}

/// Longest-match operator table, tried in order (longest lexemes first so
/// `<<<b` is not mis-split into `<<` + `<b`).
const OPERATORS: &[&str] = &[
    "<<<b", ">>>b", "or!", "==>", "???", "<<b", ">>b", "&b", "|b", "^b", "~b", "..<", "..=", "::",
    "==", "!=", "<=", ">=", "=>", "->", "~>", "<-", ":=", "??", "**", "|>", "+", "-", "*", "/",
    "%", "=", "<", ">", "~",
];

pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut lexer = Lexer {
            source: source.as_bytes(),
            pos: 0,
            line: 0,
            col: 0,
        };
        lexer.strip_shebang();
        lexer
    }

    /// If line 1 begins with `#!`, skip to the following newline (spec §4.1,
    /// §6.2).
    fn strip_shebang(&mut self) {
        if self.source.starts_with(b"#!") {
            while self.pos < self.source.len() && self.source[self.pos] != b'\n' {
                self.pos += 1;
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn make_span(&self, start_line: usize, start_col: usize, start_pos: usize) -> Span {
        Span::new(start_line, start_col, self.pos - start_pos)
    }

    /// Tokenize the whole source to EOF. Lexical errors (bad numeric
    /// literal, unterminated string, invalid character) push a diagnostic
    /// into `diags` and emit a best-effort token so the parser still has
    /// something to synchronize against.
    pub fn tokenize(mut self, diags: &mut crate::error::Diagnostics, file: &std::path::Path) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token(diags, file);
            let is_eof = matches!(tok.kind, TokenKind::Eof);
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        tokens
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.advance();
                }
                Some(b';') => {
                    while self.peek().is_some() && self.peek() != Some(b'\n') {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self, diags: &mut crate::error::Diagnostics, file: &std::path::Path) -> Token {
        self.skip_whitespace_and_comments();
        let start_line = self.line;
        let start_col = self.col;
        let start_pos = self.pos;

        let Some(c) = self.peek() else {
            return Token {
                kind: TokenKind::Eof,
                lexeme: String::new(),
                span: Span::new(start_line, start_col, 0),
            };
        };

        if c == b'\n' {
            self.advance();
            return Token {
                kind: TokenKind::Newline,
                lexeme: "\n".to_string(),
                span: self.make_span(start_line, start_col, start_pos),
            };
        }

        if c.is_ascii_digit() {
            return self.lex_number(start_line, start_col, start_pos);
        }

        if c == b'"' {
            return self.lex_string(start_line, start_col, start_pos, false, diags, file);
        }

        if c == b'f' && self.peek_at(1) == Some(b'"') {
            self.advance(); // consume 'f'
            return self.lex_string(start_line, start_col, start_pos, true, diags, file);
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            return self.lex_ident_or_keyword(start_line, start_col, start_pos);
        }

        if let Some(tok) = self.lex_punct(c, start_line, start_col, start_pos) {
            return tok;
        }

        if let Some(tok) = self.lex_operator(start_line, start_col, start_pos) {
            return tok;
        }

        // Unrecognized character: report and skip it.
        self.advance();
        diags.error(
            crate::error::Category::Syntax,
            format!(
                "invalid character '{}' at {}:{}:{}",
                c as char,
                file.display(),
                start_line + 1,
                start_col + 1
            ),
        );
        Token {
            kind: TokenKind::Op(String::from(c as char)),
            lexeme: String::from(c as char),
            span: self.make_span(start_line, start_col, start_pos),
        }
    }

    fn lex_punct(&mut self, c: u8, line: usize, col: usize, start: usize) -> Option<Token> {
        // `_` as a bare wildcard token vs. identifier start is disambiguated
        // by the caller (identifiers starting with `_` are lexed as idents;
        // a lone `_` followed by a non-ident-continue char is the wildcard).
        let kind = match c {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b':' if self.peek_at(1) != Some(b':') && self.peek_at(1) != Some(b'=') => {
                TokenKind::Colon
            }
            b';' => TokenKind::Semicolon,
            b'|' if self.peek_at(1) != Some(b'>') && self.peek_at(1) != Some(b'b') => {
                TokenKind::Pipe
            }
            b'.' if self.peek_at(1) != Some(b'.') => TokenKind::Dot,
            b'@' if self.peek_at(1) == Some(b'@') => {
                self.advance();
                self.advance();
                return Some(Token {
                    kind: TokenKind::AtAt,
                    lexeme: "@@".to_string(),
                    span: self.make_span(line, col, start),
                });
            }
            b'@' => TokenKind::At,
            b'#' => TokenKind::Hash,
            b'^' if self.peek_at(1) != Some(b'b') => TokenKind::Caret,
            b'<' if self.peek_at(1) == Some(b'>') => {
                self.advance();
                self.advance();
                return Some(Token {
                    kind: TokenKind::Diamond,
                    lexeme: "<>".to_string(),
                    span: self.make_span(line, col, start),
                });
            }
            _ => return None,
        };
        self.advance();
        Some(Token {
            kind,
            lexeme: (c as char).to_string(),
            span: self.make_span(line, col, start),
        })
    }

    fn lex_operator(&mut self, line: usize, col: usize, start: usize) -> Option<Token> {
        let remaining = &self.source[self.pos..];
        for op in OPERATORS {
            if remaining.starts_with(op.as_bytes()) {
                for _ in 0..op.len() {
                    self.advance();
                }
                return Some(Token {
                    kind: TokenKind::Op(op.to_string()),
                    lexeme: op.to_string(),
                    span: self.make_span(line, col, start),
                });
            }
        }
        None
    }

    fn lex_ident_or_keyword(&mut self, line: usize, col: usize, start: usize) -> Token {
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.advance();
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.source[start..self.pos]).to_string();
        let span = self.make_span(line, col, start);
        if text == "_" {
            return Token {
                kind: TokenKind::Underscore,
                lexeme: text,
                span,
            };
        }
        if let Some(kw) = Keyword::lookup(&text) {
            return Token {
                kind: TokenKind::Keyword(kw),
                lexeme: text,
                span,
            };
        }
        Token {
            kind: TokenKind::Ident(text.clone()),
            lexeme: text,
            span,
        }
    }

    fn lex_number(&mut self, line: usize, col: usize, start: usize) -> Token {
        let base = if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
        {
            self.advance();
            self.advance();
            NumberBase::Hex
        } else if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'b') | Some(b'B')) {
            self.advance();
            self.advance();
            NumberBase::Binary
        } else {
            NumberBase::Decimal
        };

        let digit_start = self.pos;
        let is_digit = |c: u8, base: NumberBase| match base {
            NumberBase::Decimal => c.is_ascii_digit(),
            NumberBase::Hex => c.is_ascii_hexdigit(),
            NumberBase::Binary => c == b'0' || c == b'1',
        };
        while let Some(c) = self.peek() {
            if is_digit(c, base) || c == b'_' {
                self.advance();
            } else {
                break;
            }
        }

        let mut is_float = false;
        if base == NumberBase::Decimal {
            if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit())
            {
                is_float = true;
                self.advance();
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == b'_') {
                    self.advance();
                }
            }
            if matches!(self.peek(), Some(b'e') | Some(b'E')) {
                let save = self.pos;
                let save_line = self.line;
                let save_col = self.col;
                self.advance();
                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.advance();
                }
                if matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    is_float = true;
                    while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                        self.advance();
                    }
                } else {
                    // Not actually an exponent; back out.
                    self.pos = save;
                    self.line = save_line;
                    self.col = save_col;
                }
            }
        }

        let raw = String::from_utf8_lossy(&self.source[digit_start..self.pos]).to_string();
        let text: String = raw.chars().filter(|c| *c != '_').collect();
        let lexeme = String::from_utf8_lossy(&self.source[start..self.pos]).to_string();
        Token {
            kind: TokenKind::Number(NumberLit {
                base,
                text,
                is_float,
            }),
            lexeme,
            span: self.make_span(line, col, start),
        }
    }

    fn lex_string(
        &mut self,
        line: usize,
        col: usize,
        start: usize,
        is_fstring: bool,
        diags: &mut crate::error::Diagnostics,
        file: &std::path::Path,
    ) -> Token {
        self.advance(); // opening quote
        let mut text = String::new();
        let mut terminated = false;
        while let Some(c) = self.peek() {
            if c == b'"' {
                self.advance();
                terminated = true;
                break;
            }
            if c == b'\\' {
                self.advance();
                match self.peek() {
                    Some(b'n') => {
                        text.push('\n');
                        self.advance();
                    }
                    Some(b't') => {
                        text.push('\t');
                        self.advance();
                    }
                    Some(b'\\') => {
                        text.push('\\');
                        self.advance();
                    }
                    Some(b'"') => {
                        text.push('"');
                        self.advance();
                    }
                    Some(b'{') => {
                        text.push('{');
                        self.advance();
                    }
                    Some(b'}') => {
                        text.push('}');
                        self.advance();
                    }
                    Some(b'x') => {
                        self.advance();
                        let mut hex = String::new();
                        for _ in 0..2 {
                            if let Some(c) = self.peek() {
                                if c.is_ascii_hexdigit() {
                                    hex.push(c as char);
                                    self.advance();
                                }
                            }
                        }
                        if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                            text.push(byte as char);
                        }
                    }
                    _ => {
                        diags.error(
                            crate::error::Category::Syntax,
                            format!("unknown escape sequence at {}:{}", file.display(), line + 1),
                        );
                    }
                }
            } else if c == b'\n' {
                break; // unterminated: stop at end of line
            } else {
                // Preserve raw bytes (including `{`/`}` for f-string fragments).
                text.push(c as char);
                self.advance();
            }
        }
        if !terminated {
            diags.error(
                crate::error::Category::Syntax,
                format!("unterminated string literal at {}:{}", file.display(), line + 1),
            );
        }
        let lexeme = String::from_utf8_lossy(&self.source[start..self.pos]).to_string();
        Token {
            kind: TokenKind::String { text, is_fstring },
            lexeme,
            span: self.make_span(line, col, start),
        }
    }
}

/// One piece of an f-string: literal text, or a `{ expr }` fragment that
/// still needs to be lexed+parsed as an expression (spec §4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum FStringPart {
    Literal(String),
    Expr(Vec<Token>),
}

/// Split decoded f-string text into literal/expression parts, recursively
/// re-tokenizing each `{ ... }` fragment (spec §4.1: "each fragment
/// re-tokenized by recursion").
pub fn split_fstring(
    text: &str,
    diags: &mut crate::error::Diagnostics,
    file: &std::path::Path,
) -> Vec<FStringPart> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '{' {
            if !literal.is_empty() {
                parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
            }
            let mut depth = 1;
            let mut frag = String::new();
            i += 1;
            while i < chars.len() && depth > 0 {
                match chars[i] {
                    '{' => {
                        depth += 1;
                        frag.push(chars[i]);
                    }
                    '}' => {
                        depth -= 1;
                        if depth > 0 {
                            frag.push(chars[i]);
                        }
                    }
                    c => frag.push(c),
                }
                i += 1;
            }
            let sub_tokens = Lexer::new(&frag).tokenize(diags, file);
            parts.push(FStringPart::Expr(sub_tokens));
        } else {
            literal.push(chars[i]);
            i += 1;
        }
    }
    if !literal.is_empty() {
        parts.push(FStringPart::Literal(literal));
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn lex(src: &str) -> (Vec<Token>, crate::error::Diagnostics) {
        let mut diags = crate::error::Diagnostics::new();
        let tokens = Lexer::new(src).tokenize(&mut diags, &PathBuf::from("<test>"));
        (tokens, diags)
    }

    #[test]
    fn strips_shebang() {
        let (tokens, diags) = lex("#!/usr/bin/env flapc\n1");
        assert!(!diags.has_errors());
        assert!(matches!(
            tokens.first().map(|t| &t.kind),
            Some(TokenKind::Newline)
        ));
    }

    #[test]
    fn lexes_hex_and_binary() {
        let (tokens, _) = lex("0xFF 0b101 3.14");
        match &tokens[0].kind {
            TokenKind::Number(n) => {
                assert_eq!(n.base, NumberBase::Hex);
                assert_eq!(n.value(), 255.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &tokens[1].kind {
            TokenKind::Number(n) => {
                assert_eq!(n.base, NumberBase::Binary);
                assert_eq!(n.value(), 5.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &tokens[2].kind {
            TokenKind::Number(n) => assert!(n.is_float),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn longest_match_operators() {
        let (tokens, _) = lex("a <<<b b");
        let ops: Vec<&str> = tokens
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Op(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ops, vec!["<<<b"]);
    }

    #[test]
    fn string_escapes() {
        let (tokens, diags) = lex(r#""a\nb\{c\}\x41""#);
        assert!(!diags.has_errors());
        match &tokens[0].kind {
            TokenKind::String { text, .. } => assert_eq!(text, "a\nb{c}A"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn split_fstring_parts() {
        let mut diags = crate::error::Diagnostics::new();
        let parts = split_fstring("x = {a + 1} done", &mut diags, &PathBuf::from("<test>"));
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], FStringPart::Literal(s) if s == "x = "));
        assert!(matches!(&parts[2], FStringPart::Literal(s) if s == " done"));
    }
}
