//! Exercises the same write-to-disk-then-mark-executable path `main.rs`'s
//! `run` subcommand uses, against a real temp file rather than `/dev/shm`
//! (grounded on the teacher's `tempfile::NamedTempFile` usage for its own
//! "compile and immediately exec" REPL path, `crates/repl/src/app.rs`).

use flapc::config::{empty_catalog, CompilerConfig};
use flapc::LintConfig;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::NamedTempFile;

#[test]
fn compiled_output_can_be_written_and_marked_executable() {
    let catalog = empty_catalog();
    let config = CompilerConfig::new();
    let lints = LintConfig::default();
    let file = PathBuf::from("<test>");

    let exe = flapc::compile("println(\"Hello, World!\")\n", &file, &config, &lints, &catalog)
        .unwrap_or_else(|diags| panic!("expected success, got: {:?}", diags.records()));

    let mut tmp = NamedTempFile::new().expect("create temp file");
    tmp.write_all(&exe.bytes).expect("write executable bytes");

    let mut perms = tmp.as_file().metadata().expect("stat temp file").permissions();
    perms.set_mode(0o755);
    tmp.as_file().set_permissions(perms).expect("chmod temp file");

    let mode = tmp.as_file().metadata().expect("stat again").permissions().mode();
    assert_eq!(mode & 0o777, 0o755);

    let on_disk = std::fs::read(tmp.path()).expect("read back");
    assert_eq!(&on_disk[0..4], &[0x7f, b'E', b'L', b'F']);
}
