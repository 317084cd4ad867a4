//! FFI Symbol Catalog — the boundary the compiler core consumes
//!
//! The core compiler never parses a C header or a DWARF section itself
//! (see `spec.md` §4.9 / §1 "Out of scope"). It only ever asks a
//! [`SymbolCatalog`] three questions: does this `namespace.name` refer to a
//! callable symbol and what is its signature, does it refer to a numeric
//! `#define` constant, and which shared libraries need a `DT_NEEDED` entry.
//!
//! [`TomlCatalog`] is the concrete implementation this workspace ships: a
//! catalog populated from a TOML manifest, structured the way the teacher
//! project's FFI manifests are (one `[[library]]` table per shared library,
//! nested `[[library.function]]`/`[[library.constant]]` tables). A real
//! `pkg-config`+DWARF ingestion pipeline would implement the same trait and
//! is out of scope here.

use serde::Deserialize;
use std::collections::HashMap;

/// A C type tag, as used for FFI argument/return conversion (spec §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// `char*` — a pointer to a zero-terminated UTF-8 byte sequence.
    CStr,
    /// `void*` — an opaque pointer.
    Ptr,
    /// No return value.
    Void,
}

impl CType {
    /// Size in bytes of the C type, used by the code generator to pick the
    /// right truncating/widening instruction at a cast site.
    pub fn size_bytes(self) -> u32 {
        match self {
            CType::Int8 | CType::UInt8 => 1,
            CType::Int16 | CType::UInt16 => 2,
            CType::Int32 | CType::UInt32 | CType::Float32 => 4,
            CType::Int64 | CType::UInt64 | CType::Float64 | CType::CStr | CType::Ptr => 8,
            CType::Void => 0,
        }
    }

    /// Whether values of this type are passed/returned in an `xmm` register
    /// under the System V AMD64 ABI (spec §4.6 "Calling convention").
    pub fn is_sse_class(self) -> bool {
        matches!(self, CType::Float32 | CType::Float64)
    }
}

/// The signature the catalog reports for a callable symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct FfiSignature {
    pub params: Vec<CType>,
    /// True if the C declaration ends in `...` (varargs); the code generator
    /// must set `al` to the xmm-register count per the System V ABI.
    pub variadic: bool,
    pub returns: CType,
}

/// The boundary interface the compiler core consumes (spec §4.9).
///
/// Implementors populate this however they like (TOML manifest, live
/// `pkg-config` + DWARF walk, an in-memory table built by tests); the
/// compiler only ever calls these three methods.
pub trait SymbolCatalog {
    /// Resolve `namespace.name` to the library that defines it and its
    /// signature, or `None` if the catalog has no record of it.
    fn lookup(&self, namespace: &str, name: &str) -> Option<(String, FfiSignature)>;

    /// Resolve a header-derived `#define` numeric constant.
    fn constant(&self, namespace: &str, name: &str) -> Option<f64>;

    /// Every shared library soname referenced by at least one resolved
    /// lookup, in first-seen order — becomes the binary writer's
    /// `DT_NEEDED` list (spec §4.7 step 4).
    fn libraries_needed(&self) -> Vec<String>;
}

/// Top-level manifest structure, one TOML file per catalog.
///
/// ```toml
/// [[library]]
/// name = "libc"
/// soname = "libc.so.6"
///
/// [[library.function]]
/// namespace = "c"
/// name = "printf"
/// params = ["cstr"]
/// variadic = true
/// returns = "int32"
///
/// [[library.constant]]
/// namespace = "c"
/// name = "EAGAIN"
/// value = 11.0
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogManifest {
    #[serde(rename = "library", default)]
    pub libraries: Vec<LibraryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryEntry {
    /// Human-readable name, used only in diagnostics.
    pub name: String,
    /// The `DT_NEEDED` soname, e.g. `"libc.so.6"`.
    pub soname: String,
    #[serde(rename = "function", default)]
    pub functions: Vec<FunctionEntry>,
    #[serde(rename = "constant", default)]
    pub constants: Vec<ConstantEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionEntry {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub params: Vec<CType>,
    #[serde(default)]
    pub variadic: bool,
    pub returns: CType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstantEntry {
    pub namespace: String,
    pub name: String,
    pub value: f64,
}

impl CatalogManifest {
    /// Parse a manifest from TOML text, then validate it.
    pub fn parse(content: &str) -> Result<Self, String> {
        let manifest: Self =
            toml::from_str(content).map_err(|e| format!("failed to parse FFI manifest: {e}"))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), String> {
        for lib in &self.libraries {
            if lib.soname.trim().is_empty() {
                return Err(format!("library '{}' has an empty soname", lib.name));
            }
            for f in &lib.functions {
                if f.namespace.trim().is_empty() || f.name.trim().is_empty() {
                    return Err(format!(
                        "library '{}' declares a function with an empty namespace or name",
                        lib.name
                    ));
                }
            }
            for c in &lib.constants {
                if c.namespace.trim().is_empty() || c.name.trim().is_empty() {
                    return Err(format!(
                        "library '{}' declares a constant with an empty namespace or name",
                        lib.name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A [`SymbolCatalog`] backed by a parsed [`CatalogManifest`].
#[derive(Debug, Clone, Default)]
pub struct TomlCatalog {
    functions: HashMap<(String, String), (String, FfiSignature)>,
    constants: HashMap<(String, String), f64>,
    /// Library sonames in first-declaration order (stable `DT_NEEDED` output).
    libraries: Vec<String>,
}

impl TomlCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from manifest text (convenience wrapper around
    /// [`CatalogManifest::parse`] + [`TomlCatalog::from_manifest`]).
    pub fn from_toml(content: &str) -> Result<Self, String> {
        let manifest = CatalogManifest::parse(content)?;
        Ok(Self::from_manifest(&manifest))
    }

    pub fn from_manifest(manifest: &CatalogManifest) -> Self {
        let mut catalog = Self::default();
        for lib in &manifest.libraries {
            if !catalog.libraries.contains(&lib.soname) {
                catalog.libraries.push(lib.soname.clone());
            }
            for f in &lib.functions {
                catalog.functions.insert(
                    (f.namespace.clone(), f.name.clone()),
                    (
                        lib.soname.clone(),
                        FfiSignature {
                            params: f.params.clone(),
                            variadic: f.variadic,
                            returns: f.returns,
                        },
                    ),
                );
            }
            for c in &lib.constants {
                catalog
                    .constants
                    .insert((c.namespace.clone(), c.name.clone()), c.value);
            }
        }
        catalog
    }

    /// Merge another catalog's entries into this one (later entries win),
    /// used to layer a project-local manifest over a base one.
    pub fn merge(&mut self, other: &TomlCatalog) {
        for lib in &other.libraries {
            if !self.libraries.contains(lib) {
                self.libraries.push(lib.clone());
            }
        }
        for (k, v) in &other.functions {
            self.functions.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.constants {
            self.constants.insert(k.clone(), *v);
        }
    }
}

impl SymbolCatalog for TomlCatalog {
    fn lookup(&self, namespace: &str, name: &str) -> Option<(String, FfiSignature)> {
        self.functions
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn constant(&self, namespace: &str, name: &str) -> Option<f64> {
        self.constants
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
    }

    fn libraries_needed(&self) -> Vec<String> {
        self.libraries.clone()
    }
}

/// The TOML text backing [`default_runtime_catalog`], baked into the
/// binary at build time (spec §1 "a companion runtime library ships
/// separately"). Exposed mainly so callers can inspect or re-parse it
/// themselves (e.g. to print it via `flapc --print-runtime-catalog`).
pub const DEFAULT_RUNTIME_MANIFEST: &str = include_str!("default_runtime.toml");

/// The catalog every `compile` run starts from: the `rt`/`rt_err` runtime
/// helper namespaces plus `c.exit`. Callers layer a project-local FFI
/// manifest on top with [`TomlCatalog::merge`]; see [`WithDefaults`] for a
/// version of that layering that works against an arbitrary
/// `&dyn SymbolCatalog` rather than another `TomlCatalog`.
pub fn default_runtime_catalog() -> TomlCatalog {
    TomlCatalog::from_toml(DEFAULT_RUNTIME_MANIFEST)
        .expect("embedded default runtime manifest must parse")
}

/// Layers a caller-supplied catalog over the [`default_runtime_catalog`]
/// without requiring the caller's catalog to be a [`TomlCatalog`] itself.
///
/// `lookup`/`constant` try `user` first so a project manifest can shadow a
/// runtime entry (e.g. to swap in a different FFI signature for `c.exit`);
/// `libraries_needed` unions both, defaults first, so `DT_NEEDED` order
/// stays stable across runs regardless of what the caller's catalog
/// returns.
pub struct WithDefaults<'a> {
    user: &'a dyn SymbolCatalog,
    defaults: TomlCatalog,
}

impl<'a> WithDefaults<'a> {
    pub fn new(user: &'a dyn SymbolCatalog) -> Self {
        Self {
            user,
            defaults: default_runtime_catalog(),
        }
    }
}

impl<'a> SymbolCatalog for WithDefaults<'a> {
    fn lookup(&self, namespace: &str, name: &str) -> Option<(String, FfiSignature)> {
        self.user
            .lookup(namespace, name)
            .or_else(|| self.defaults.lookup(namespace, name))
    }

    fn constant(&self, namespace: &str, name: &str) -> Option<f64> {
        self.user
            .constant(namespace, name)
            .or_else(|| self.defaults.constant(namespace, name))
    }

    fn libraries_needed(&self) -> Vec<String> {
        let mut libs = self.defaults.libraries_needed();
        for lib in self.user.libraries_needed() {
            if !libs.contains(&lib) {
                libs.push(lib);
            }
        }
        libs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_manifest() {
        let toml = r#"
            [[library]]
            name = "libc"
            soname = "libc.so.6"

            [[library.function]]
            namespace = "c"
            name = "printf"
            params = ["cstr"]
            variadic = true
            returns = "int32"

            [[library.constant]]
            namespace = "c"
            name = "EAGAIN"
            value = 11.0
        "#;
        let catalog = TomlCatalog::from_toml(toml).expect("manifest should parse");
        let (lib, sig) = catalog.lookup("c", "printf").expect("printf resolves");
        assert_eq!(lib, "libc.so.6");
        assert!(sig.variadic);
        assert_eq!(sig.params, vec![CType::CStr]);
        assert_eq!(catalog.constant("c", "EAGAIN"), Some(11.0));
        assert_eq!(catalog.libraries_needed(), vec!["libc.so.6".to_string()]);
    }

    #[test]
    fn rejects_empty_soname() {
        let toml = r#"
            [[library]]
            name = "broken"
            soname = ""
        "#;
        assert!(TomlCatalog::from_toml(toml).is_err());
    }

    #[test]
    fn merge_lets_later_catalog_win() {
        let mut base = TomlCatalog::from_toml(
            r#"
            [[library]]
            name = "libc"
            soname = "libc.so.6"
            [[library.constant]]
            namespace = "c"
            name = "X"
            value = 1.0
            "#,
        )
        .unwrap();
        let overlay = TomlCatalog::from_toml(
            r#"
            [[library]]
            name = "libc"
            soname = "libc.so.6"
            [[library.constant]]
            namespace = "c"
            name = "X"
            value = 2.0
            "#,
        )
        .unwrap();
        base.merge(&overlay);
        assert_eq!(base.constant("c", "X"), Some(2.0));
        assert_eq!(base.libraries_needed(), vec!["libc.so.6".to_string()]);
    }

    #[test]
    fn default_runtime_manifest_parses_and_resolves_core_helpers() {
        let catalog = default_runtime_catalog();
        let (lib, _) = catalog.lookup("rt", "print_value").expect("rt.print_value resolves");
        assert_eq!(lib, "libflapc_runtime.so");
        let (err_lib, _) = catalog.lookup("rt_err", "print_value").expect("rt_err.print_value resolves");
        assert_eq!(err_lib, "libflapc_runtime_stderr.so");
        assert_ne!(lib, err_lib, "stdout and stderr print_value must live in distinct shared objects");
        assert!(catalog.lookup("c", "exit").is_some());
        assert!(catalog.lookup("rt", "sequence_push").is_some());
    }

    #[test]
    fn with_defaults_lets_user_catalog_shadow_a_runtime_entry() {
        let user = TomlCatalog::from_toml(
            r#"
            [[library]]
            name = "libc"
            soname = "libc.so.6"
            [[library.function]]
            namespace = "c"
            name = "exit"
            params = ["int64"]
            returns = "void"
            "#,
        )
        .unwrap();
        let layered = WithDefaults::new(&user);
        let (_, sig) = layered.lookup("c", "exit").unwrap();
        assert_eq!(sig.params, vec![CType::Int64]);
        // Runtime-only entries still resolve through the fallback.
        assert!(layered.lookup("rt", "print_value").is_some());
        assert!(layered.libraries_needed().contains(&"libflapc_runtime.so".to_string()));
        assert!(layered.libraries_needed().contains(&"libc.so.6".to_string()));
    }
}
