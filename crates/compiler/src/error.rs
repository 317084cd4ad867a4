//! Error Collector
//!
//! A process-wide, append-only record of diagnostics (spec §3.6, §4.8, §7).
//! Every stage of the pipeline is handed a `&mut Diagnostics` rather than
//! reaching for global mutable state (spec §9 "Global mutable compiler
//! state"): the collector is threaded explicitly, alongside the rest of the
//! compile [`crate::config::Context`].

use std::fmt;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

/// A single source location, spanning one token or one expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Span {
    /// 0-indexed line.
    pub line: usize,
    /// 0-indexed column.
    pub column: usize,
    /// Length in bytes of the spanned text.
    pub length: usize,
}

impl Span {
    pub fn new(line: usize, column: usize, length: usize) -> Self {
        Span {
            line,
            column,
            length,
        }
    }

    /// A zero-length span, used for synthesized nodes that have no direct
    /// source counterpart (e.g. an implicit `() ->` lambda wrapper).
    pub fn synthetic() -> Self {
        Span::default()
    }
}

/// A file plus a `Span`, sufficient to render a caret diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub file: PathBuf,
    pub span: Span,
}

impl Location {
    pub fn new(file: impl Into<PathBuf>, span: Span) -> Self {
        Location {
            file: file.into(),
            span,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.file.display(),
            self.span.line + 1,
            self.span.column + 1
        )
    }
}

/// Severity of a diagnostic (spec §3.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Warning => write!(f, "warning"),
            Level::Error => write!(f, "error"),
            Level::Fatal => write!(f, "error"),
        }
    }
}

/// Diagnostic category (spec §7 taxonomy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Syntax,
    Semantic,
    Codegen,
    Internal,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Syntax => "syntax",
            Category::Semantic => "semantic",
            Category::Codegen => "codegen",
            Category::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// A single diagnostic record (spec §3.6).
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: Level,
    pub category: Category,
    pub location: Option<Location>,
    pub message: String,
    pub source_line: Option<String>,
    pub suggestion: Option<String>,
}

impl Diagnostic {
    pub fn new(level: Level, category: Category, message: impl Into<String>) -> Self {
        Diagnostic {
            level,
            category,
            location: None,
            message: message.into(),
            source_line: None,
            suggestion: None,
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_source_line(mut self, line: impl Into<String>) -> Self {
        self.source_line = Some(line.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Render the diagnostic in the `error[kind]: message` format of spec §7.
    pub fn render(&self, color: bool) -> String {
        let mut out = String::new();
        let (tag, tag_color) = match self.level {
            Level::Warning => ("warning", "33"),
            Level::Error | Level::Fatal => ("error", "31"),
        };
        if color {
            out.push_str(&format!(
                "\x1b[1;{tag_color}m{tag}[{}]\x1b[0m: {}\n",
                self.category, self.message
            ));
        } else {
            out.push_str(&format!("{tag}[{}]: {}\n", self.category, self.message));
        }
        if let Some(loc) = &self.location {
            out.push_str(&format!("  --> {loc}\n"));
            if let Some(src) = &self.source_line {
                let lineno = loc.span.line + 1;
                let gutter = " ".repeat(lineno.to_string().len());
                out.push_str(&format!("{gutter} |\n"));
                out.push_str(&format!("{lineno} | {src}\n"));
                let caret_pad = " ".repeat(loc.span.column);
                let caret_len = loc.span.length.max(1);
                let carets = "^".repeat(caret_len);
                out.push_str(&format!("{gutter} | {caret_pad}{carets}\n"));
            }
        }
        if let Some(suggestion) = &self.suggestion {
            out.push_str(&format!("  = help: {suggestion}\n"));
        }
        out
    }
}

/// Default cap on the number of non-fatal diagnostics before the pipeline
/// gives up (spec §3.6).
pub const DEFAULT_ERROR_CAP: usize = 10;

/// Accumulates diagnostics across every pipeline stage and governs abort
/// (spec §4.8).
#[derive(Debug)]
pub struct Diagnostics {
    records: Vec<Diagnostic>,
    cap: usize,
    fatal: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics {
            records: Vec::new(),
            cap: DEFAULT_ERROR_CAP,
            fatal: false,
        }
    }

    pub fn with_cap(cap: usize) -> Self {
        Diagnostics {
            records: Vec::new(),
            cap,
            fatal: false,
        }
    }

    pub fn report(&mut self, diagnostic: Diagnostic) {
        if matches!(diagnostic.level, Level::Fatal) {
            self.fatal = true;
        }
        self.records.push(diagnostic);
        let non_fatal_errors = self
            .records
            .iter()
            .filter(|d| matches!(d.level, Level::Error))
            .count();
        if non_fatal_errors > self.cap {
            self.fatal = true;
        }
    }

    pub fn error(&mut self, category: Category, message: impl Into<String>) {
        self.report(Diagnostic::new(Level::Error, category, message));
    }

    pub fn fatal(&mut self, category: Category, message: impl Into<String>) {
        self.report(Diagnostic::new(Level::Fatal, category, message));
    }

    pub fn warn(&mut self, category: Category, message: impl Into<String>) {
        self.report(Diagnostic::new(Level::Warning, category, message));
    }

    /// True once a fatal record was added or the error cap was exceeded —
    /// the pipeline must halt at the next stage boundary (spec §2, §4.8).
    pub fn should_abort(&self) -> bool {
        self.fatal
    }

    pub fn has_errors(&self) -> bool {
        self.records
            .iter()
            .any(|d| matches!(d.level, Level::Error | Level::Fatal))
    }

    pub fn error_count(&self) -> usize {
        self.records
            .iter()
            .filter(|d| matches!(d.level, Level::Error | Level::Fatal))
            .count()
    }

    pub fn records(&self) -> &[Diagnostic] {
        &self.records
    }

    /// Print every diagnostic to stderr, deduplicated and grouped by
    /// source file, color-coded when stderr is a terminal (spec §7).
    pub fn print_to_stderr(&self) {
        let color = std::io::stderr().is_terminal();
        let mut seen = std::collections::HashSet::new();
        let mut by_file: Vec<(Option<PathBuf>, &Diagnostic)> = Vec::new();
        for d in &self.records {
            let key = format!("{:?}|{}", d.location, d.message);
            if seen.insert(key) {
                by_file.push((d.location.as_ref().map(|l| l.file.clone()), d));
            }
        }
        by_file.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, d) in by_file {
            eprint!("{}", d.render(color));
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the specific source line referenced by `span` out of `source`, for
/// embedding in a diagnostic's caret display.
pub fn source_line(source: &str, span: &Span) -> Option<String> {
    source.lines().nth(span.line).map(|s| s.to_string())
}

#[allow(dead_code)]
fn relative_to(file: &Path, base: &Path) -> PathBuf {
    file.strip_prefix(base).unwrap_or(file).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_non_fatal_errors() {
        let mut diags = Diagnostics::with_cap(2);
        for _ in 0..3 {
            diags.error(Category::Semantic, "undefined identifier 'x'");
        }
        assert!(diags.should_abort());
    }

    #[test]
    fn fatal_sets_abort_immediately() {
        let mut diags = Diagnostics::new();
        diags.fatal(Category::Codegen, "relocation overflow");
        assert!(diags.should_abort());
        assert_eq!(diags.error_count(), 1);
    }

    #[test]
    fn render_matches_caret_format() {
        let d = Diagnostic::new(Level::Error, Category::Semantic, "cannot update immutable variable 'x'")
            .at(Location::new("a.flap", Span::new(1, 0, 1)))
            .with_source_line("x = 100")
            .with_suggestion("declare 'x' with ':=' if it needs to be mutated");
        let rendered = d.render(false);
        assert!(rendered.starts_with("error[semantic]: cannot update immutable variable 'x'"));
        assert!(rendered.contains("--> a.flap:2:1"));
        assert!(rendered.contains("2 | x = 100"));
        assert!(rendered.contains("^"));
        assert!(rendered.contains("= help:"));
    }
}
