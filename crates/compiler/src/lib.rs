//! flapc core: a self-contained ahead-of-time compiler for the Language
//! (spec §1). Lexing and parsing build an AST (§4.1–§4.2); a fixed-point
//! optimizer rewrites it (§4.3); a symbol collector and linear-scan
//! register allocator assign storage (§4.4–§4.5); a single-pass code
//! generator emits x86-64 machine bytes with a patch-up relocation table
//! (§4.6); the binary writer assembles a dynamically-linked ELF64
//! executable directly, with no external assembler or linker (§4.7).
//!
//! `compile` is the one entry point external callers (the `flapc` binary,
//! tests, a future LSP) need: source text in, an [`Executable`] or a
//! populated [`Diagnostics`] collector out. Every stage shares one
//! [`Diagnostics`] instance and the pipeline halts at the next stage
//! boundary once it reports a fatal condition (spec §2, §4.8), mirroring
//! the teacher's `compile_file`/`compile_file_with_config` entry points.

pub mod ast;
pub mod binary;
pub mod codegen;
pub mod config;
pub mod error;
pub mod lexer;
pub mod lint;
pub mod optimizer;
pub mod parser;
pub mod regalloc;
pub mod semantics;
pub mod symbols;

pub use config::{Arch, CompilerConfig, Context, Os, OptTimeout, Target, Verbosity};
pub use error::{Category, Diagnostics, Level};
pub use lint::LintConfig;

use flapc_catalog::{SymbolCatalog, WithDefaults};
use std::path::Path;

/// The successful product of a full `compile` run: the raw ELF64 bytes
/// plus whatever non-fatal warnings were collected along the way (spec
/// §7 "zero [errors] = write binary").
pub struct Executable {
    pub bytes: Vec<u8>,
    pub diagnostics: Diagnostics,
}

/// Runs every stage of the pipeline in order, stopping early and
/// returning `Err` the first time a stage boundary finds the collector's
/// abort flag set (spec §2 "the pipeline halts between stages if fatal
/// errors were recorded", §4.8).
pub fn compile(source: &str, file: &Path, config: &CompilerConfig, lints: &LintConfig, catalog: &dyn SymbolCatalog) -> Result<Executable, Diagnostics> {
    let mut diags = Diagnostics::with_cap(config.error_cap);

    // Every compiled program needs the `rt`/`rt_err`/`c.exit` runtime
    // helpers regardless of what FFI manifest the caller passed in; layer
    // the caller's catalog over the embedded defaults rather than making
    // every caller remember to merge them in (spec §1, §4.9).
    let catalog = WithDefaults::new(catalog);
    let catalog: &dyn SymbolCatalog = &catalog;

    tracing::debug!(file = %file.display(), "parsing");
    let program = parser::parse(source, &mut diags, file);
    if diags.should_abort() {
        tracing::warn!(errors = diags.records().len(), "aborting at parse stage boundary");
        return Err(diags);
    }

    lint::run(&program, lints, file, &mut diags);
    if diags.should_abort() {
        tracing::warn!(errors = diags.records().len(), "aborting at lint stage boundary");
        return Err(diags);
    }

    tracing::debug!(timeout = ?config.opt_timeout, "optimizing");
    let program = optimizer::optimize(program, config.opt_timeout, catalog);

    tracing::debug!("collecting symbols");
    let symbols = symbols::Collector::new().collect(&program);

    tracing::debug!("checking semantics");
    semantics::analyze(&program, &symbols, catalog, file, &mut diags);
    if diags.should_abort() || diags.has_errors() {
        tracing::warn!(errors = diags.records().len(), "aborting at semantic stage boundary");
        return Err(diags);
    }

    tracing::debug!("generating code");
    let codegen_output = codegen::generate(&program, &symbols, catalog, &mut diags);
    if diags.should_abort() || diags.has_errors() {
        tracing::warn!(errors = diags.records().len(), "aborting at codegen stage boundary");
        return Err(diags);
    }

    tracing::debug!(functions = codegen_output.relocations.len(), "writing executable");
    let bytes = binary::write_executable(&codegen_output, catalog);
    tracing::info!(bytes = bytes.len(), "compile finished");
    Ok(Executable { bytes, diagnostics: diags })
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::empty_catalog;
    use std::path::PathBuf;

    #[test]
    fn compiles_hello_world_to_nonempty_elf() {
        let catalog = empty_catalog();
        let config = CompilerConfig::new();
        let lints = LintConfig::default();
        let file = PathBuf::from("<test>");
        let result = compile("println(\"Hello, World!\")\n", &file, &config, &lints, &catalog);
        let exe = result.unwrap_or_else(|diags| {
            panic!("expected success, got diagnostics: {:?}", diags.records());
        });
        assert!(exe.bytes.starts_with(&[0x7f, b'E', b'L', b'F']));
    }

    #[test]
    fn stops_at_parse_stage_on_unrecoverable_error_budget() {
        let catalog = empty_catalog();
        let config = CompilerConfig::new().with_opt_timeout(OptTimeout::from_secs(0));
        let lints = LintConfig::default();
        let file = PathBuf::from("<test>");
        // An undefined identifier is a semantic error, not a parse error:
        // the pipeline should still reach codegen's stage boundary and
        // fail there rather than at parse.
        let result = compile("println(totally_undefined_name)\n", &file, &config, &lints, &catalog);
        assert!(result.is_err());
    }

    #[test]
    fn immutable_reassignment_is_rejected_before_codegen() {
        let catalog = empty_catalog();
        let config = CompilerConfig::new();
        let lints = LintConfig::default();
        let file = PathBuf::from("<test>");
        let result = compile("x = 42\nx = 100\n", &file, &config, &lints, &catalog);
        match result {
            Err(diags) => assert!(diags
                .records()
                .iter()
                .any(|d| d.message.contains("cannot update immutable variable 'x'"))),
            Ok(_) => panic!("expected immutable-reassignment error"),
        }
    }
}
