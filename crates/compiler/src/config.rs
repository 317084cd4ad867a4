//! Compiler configuration and the threaded `Context` object.
//!
//! Spec §9 calls out "global mutable compiler state" as a pattern that
//! needs re-architecting for a systems-language port: the error collector,
//! the optimizer's verbose flag, and the FFI catalog all live inside one
//! explicit [`Context`] value instead. Every pipeline stage takes `&mut
//! Context` (or the narrower `&mut Diagnostics` it owns) rather than
//! reaching for a global.
//!
//! Grounded on the teacher's `config::CompilerConfig`/`OptimizationLevel`
//! builder (`navicore-cem3/crates/compiler/src/config.rs`).

use crate::error::Diagnostics;
use flapc_catalog::{SymbolCatalog, TomlCatalog};
use std::time::Duration;

/// Target CPU architecture (spec §1: "component boundaries are drawn so
/// alternative back ends can be slotted in"; only `Amd64` is implemented).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
    Riscv64,
}

impl Arch {
    pub fn parse(s: &str) -> Option<Arch> {
        match s {
            "amd64" | "x86_64" | "x86-64" => Some(Arch::Amd64),
            "arm64" | "aarch64" => Some(Arch::Arm64),
            "riscv64" => Some(Arch::Riscv64),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Riscv64 => "riscv64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Darwin,
    FreeBsd,
}

impl Os {
    pub fn parse(s: &str) -> Option<Os> {
        match s {
            "linux" => Some(Os::Linux),
            "darwin" | "macos" => Some(Os::Darwin),
            "freebsd" => Some(Os::FreeBsd),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::FreeBsd => "freebsd",
        }
    }
}

/// `--target arch-os`, or the default derived from `--arch`/`--os`
/// (spec §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub arch: Arch,
    pub os: Os,
}

impl Target {
    /// The only combination the core actually emits code for (spec §1 "Out
    /// of scope": non-primary architectures).
    pub fn native() -> Self {
        Target {
            arch: Arch::Amd64,
            os: Os::Linux,
        }
    }

    pub fn parse(spec: &str) -> Option<Target> {
        let (arch, os) = spec.split_once('-')?;
        Some(Target {
            arch: Arch::parse(arch)?,
            os: Os::parse(os)?,
        })
    }

    pub fn is_supported(self) -> bool {
        matches!(
            (self.arch, self.os),
            (Arch::Amd64, Os::Linux)
        )
    }
}

impl Default for Target {
    fn default() -> Self {
        Target::native()
    }
}

/// Whole-program optimization timeout (spec §4.3): a wall-clock budget
/// checked between passes, not a preempting signal. `Duration::ZERO`
/// disables WPO entirely (`--opt-timeout 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptTimeout(pub Duration);

impl OptTimeout {
    pub const DEFAULT_SECS: u64 = 5;

    pub fn from_secs(secs: u64) -> Self {
        OptTimeout(Duration::from_secs(secs))
    }

    pub fn disabled(self) -> bool {
        self.0.is_zero()
    }
}

impl Default for OptTimeout {
    fn default() -> Self {
        OptTimeout::from_secs(Self::DEFAULT_SECS)
    }
}

/// Verbosity level, mapped onto the `tracing-subscriber` `EnvFilter` by
/// the CLI entry point (SPEC_FULL.md §2 "[AMBIENT] Observability").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// Builder-style compiler configuration, threaded through the whole
/// pipeline. Construction mirrors the teacher's `CompilerConfig::with_*`
/// chain.
#[derive(Clone)]
pub struct CompilerConfig {
    pub target: Target,
    pub opt_timeout: OptTimeout,
    pub single_file: bool,
    pub verbosity: Verbosity,
    pub error_cap: usize,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig {
            target: Target::default(),
            opt_timeout: OptTimeout::default(),
            single_file: false,
            verbosity: Verbosity::Normal,
            error_cap: crate::error::DEFAULT_ERROR_CAP,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_opt_timeout(mut self, timeout: OptTimeout) -> Self {
        self.opt_timeout = timeout;
        self
    }

    pub fn with_single_file(mut self, single: bool) -> Self {
        self.single_file = single;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a pipeline stage needs other than the AST it is
/// transforming: diagnostics, configuration, and the FFI catalog (spec §9
/// "Context value threaded through every pass").
pub struct Context<'cat> {
    pub diags: Diagnostics,
    pub config: CompilerConfig,
    pub catalog: &'cat dyn SymbolCatalog,
}

impl<'cat> Context<'cat> {
    pub fn new(config: CompilerConfig, catalog: &'cat dyn SymbolCatalog) -> Self {
        Context {
            diags: Diagnostics::with_cap(config.error_cap),
            config,
            catalog,
        }
    }
}

/// An empty catalog, used when the caller has no FFI manifest (every
/// `lookup`/`constant` call misses; `libraries_needed` is empty beyond
/// whatever the runtime itself always links).
pub fn empty_catalog() -> TomlCatalog {
    TomlCatalog::new()
}
