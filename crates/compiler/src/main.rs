//! flapc CLI
//!
//! Command-line entry point: parses flags, drives [`flapc::compile`], and
//! writes the resulting ELF64 executable to disk (spec §6.1). `run`
//! additionally executes the result in place from a temporary location
//! under `/dev/shm`.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use flapc::config::{empty_catalog, Arch, CompilerConfig, Os, OptTimeout, Target, Verbosity};
use flapc::LintConfig;
use flapc_catalog::TomlCatalog;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const EXIT_SUCCESS: u8 = 0;
const EXIT_COMPILE_FAILED: u8 = 1;
const EXIT_INVALID_ARGS: u8 = 2;
const EXIT_IO_ERROR: u8 = 3;

#[derive(ClapParser)]
#[command(name = "flapc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Self-contained ahead-of-time compiler for the Language", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input source file, when no subcommand is given (defaults to `build`).
    input: Option<PathBuf>,

    #[command(flatten)]
    build: BuildArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a `.flap` file to an executable.
    Build {
        input: PathBuf,
        #[command(flatten)]
        args: BuildArgs,
    },
    /// Compile a `.flap` file and immediately execute it.
    Run {
        input: PathBuf,
        #[command(flatten)]
        args: BuildArgs,
        /// Arguments forwarded to the compiled program.
        #[arg(last = true)]
        program_args: Vec<String>,
    },
    /// Generate shell completion scripts.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args, Clone)]
struct BuildArgs {
    /// Output executable path (defaults to the input filename without its
    /// extension).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print progress and diagnostic detail.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress non-error output.
    #[arg(short, long)]
    quiet: bool,

    /// Target CPU architecture (`amd64`, `arm64`, `riscv64`). Only `amd64`
    /// is actually implemented; anything else is accepted and rejected
    /// with exit code 2 once parsed, matching `--target`'s behavior.
    #[arg(long)]
    arch: Option<String>,

    /// Target OS (`linux`, `darwin`, `freebsd`).
    #[arg(long)]
    os: Option<String>,

    /// `arch-os` pair, overriding `--arch`/`--os` individually.
    #[arg(long)]
    target: Option<String>,

    /// Whole-program optimization timeout in seconds; `0` disables WPO.
    #[arg(long, default_value_t = OptTimeout::DEFAULT_SECS)]
    opt_timeout: u64,

    /// Compile as a single translation unit (no module resolution).
    #[arg(short, long)]
    single: bool,

    /// Accepted for interface parity with the external package manager;
    /// module/package fetching is out of scope for this compiler core.
    #[arg(short = 'u', long)]
    update_deps: bool,

    /// FFI manifest file(s) to layer over the embedded runtime defaults.
    #[arg(long = "ffi-manifest", value_name = "PATH")]
    ffi_manifests: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Some(Commands::Build { input, args }) => run_build(&input, &args),
        Some(Commands::Run { input, args, program_args }) => run_run(&input, &args, &program_args),
        Some(Commands::Completions { shell }) => {
            run_completions(shell);
            EXIT_SUCCESS
        }
        None => match cli.input {
            Some(input) => run_build(&input, &cli.build),
            None => {
                Cli::command().print_help().ok();
                EXIT_INVALID_ARGS
            }
        },
    };
    ExitCode::from(code)
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "flapc", &mut io::stdout());
}

fn init_tracing(verbosity: Verbosity) {
    let filter = match verbosity {
        Verbosity::Quiet => "error",
        Verbosity::Normal => "warn",
        Verbosity::Verbose => "debug",
    };
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter)).try_init();
}

fn resolve_config(args: &BuildArgs) -> Result<CompilerConfig, u8> {
    let verbosity = match (args.verbose, args.quiet) {
        (true, _) => Verbosity::Verbose,
        (_, true) => Verbosity::Quiet,
        _ => Verbosity::Normal,
    };
    init_tracing(verbosity);

    let target = if let Some(spec) = &args.target {
        Target::parse(spec).ok_or_else(|| {
            eprintln!("error: invalid --target '{spec}', expected <arch>-<os>");
            EXIT_INVALID_ARGS
        })?
    } else {
        let arch = match &args.arch {
            Some(a) => Arch::parse(a).ok_or_else(|| {
                eprintln!("error: invalid --arch '{a}'");
                EXIT_INVALID_ARGS
            })?,
            None => Arch::Amd64,
        };
        let os = match &args.os {
            Some(o) => Os::parse(o).ok_or_else(|| {
                eprintln!("error: invalid --os '{o}'");
                EXIT_INVALID_ARGS
            })?,
            None => Os::Linux,
        };
        Target { arch, os }
    };
    if !target.is_supported() {
        eprintln!("error: target {}-{} is not supported; only amd64-linux emits code", target.arch.as_str(), target.os.as_str());
        return Err(EXIT_INVALID_ARGS);
    }

    Ok(CompilerConfig::new()
        .with_target(target)
        .with_opt_timeout(OptTimeout::from_secs(args.opt_timeout))
        .with_single_file(args.single)
        .with_verbosity(verbosity))
}

fn load_catalog(args: &BuildArgs) -> Result<TomlCatalog, u8> {
    let mut catalog = empty_catalog();
    for path in &args.ffi_manifests {
        let content = std::fs::read_to_string(path).map_err(|e| {
            eprintln!("error: reading FFI manifest {}: {e}", path.display());
            EXIT_IO_ERROR
        })?;
        let manifest = TomlCatalog::from_toml(&content).map_err(|e| {
            eprintln!("error: parsing FFI manifest {}: {e}", path.display());
            EXIT_INVALID_ARGS
        })?;
        catalog.merge(&manifest);
    }
    Ok(catalog)
}

/// Strips a leading shebang line (spec §6.1 "Shebang ... stripped from
/// the compiled input"), replacing it with a blank line so diagnostic
/// line numbers still line up with the original file.
fn strip_shebang(source: &str) -> String {
    if let Some(rest) = source.strip_prefix("#!") {
        if let Some(newline) = rest.find('\n') {
            return format!("\n{}", &rest[newline + 1..]);
        }
        return String::new();
    }
    source.to_string()
}

fn compile_to_bytes(input: &Path, args: &BuildArgs) -> Result<Vec<u8>, u8> {
    let config = resolve_config(args)?;
    let catalog = load_catalog(args)?;
    let lints = LintConfig::default();

    let source = std::fs::read_to_string(input).map_err(|e| {
        eprintln!("error: reading {}: {e}", input.display());
        EXIT_IO_ERROR
    })?;
    let source = strip_shebang(&source);

    match flapc::compile(&source, input, &config, &lints, &catalog) {
        Ok(exe) => {
            if !exe.diagnostics.records().is_empty() && !matches!(config.verbosity, Verbosity::Quiet) {
                exe.diagnostics.print_to_stderr();
            }
            Ok(exe.bytes)
        }
        Err(diags) => {
            diags.print_to_stderr();
            Err(EXIT_COMPILE_FAILED)
        }
    }
}

fn write_executable(path: &Path, bytes: &[u8]) -> Result<(), u8> {
    std::fs::write(path, bytes).map_err(|e| {
        eprintln!("error: writing {}: {e}", path.display());
        EXIT_IO_ERROR
    })?;
    let mut perms = std::fs::metadata(path)
        .map_err(|e| {
            eprintln!("error: stat {}: {e}", path.display());
            EXIT_IO_ERROR
        })?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).map_err(|e| {
        eprintln!("error: chmod {}: {e}", path.display());
        EXIT_IO_ERROR
    })?;
    Ok(())
}

fn default_output_path(input: &Path) -> PathBuf {
    PathBuf::from(input.file_stem().unwrap_or_default())
}

fn run_build(input: &Path, args: &BuildArgs) -> u8 {
    let bytes = match compile_to_bytes(input, args) {
        Ok(b) => b,
        Err(code) => return code,
    };
    let output = args.output.clone().unwrap_or_else(|| default_output_path(input));
    if let Err(code) = write_executable(&output, &bytes) {
        return code;
    }
    if !args.quiet {
        println!("{} -> {}", input.display(), output.display());
    }
    EXIT_SUCCESS
}

fn run_run(input: &Path, args: &BuildArgs, program_args: &[String]) -> u8 {
    let bytes = match compile_to_bytes(input, args) {
        Ok(b) => b,
        Err(code) => return code,
    };

    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("flapc-run");
    let tmp_path = PathBuf::from(format!("/dev/shm/.flapc-{stem}-{}", std::process::id()));
    if let Err(code) = write_executable(&tmp_path, &bytes) {
        return code;
    }

    let err = std::process::Command::new(&tmp_path).args(program_args).exec();
    // `exec` only returns on failure; the temp file is deliberately left
    // in place on the success path because this process no longer exists
    // to clean it up.
    let _ = std::fs::remove_file(&tmp_path);
    eprintln!("error: exec {}: {err}", tmp_path.display());
    EXIT_IO_ERROR
}
