//! Core code-generation state: the `.rodata` dedup pool, the pending-patch
//! lists for intra-`.text` control flow, and the `Relocation` records that
//! survive to the Binary Writer (spec §4.6 "Rodata management",
//! "Relocations").
//!
//! Grounded on the teacher's `codegen/state.rs` (the same role — core
//! types shared by every codegen submodule — one layer lower: SSA virtual
//! registers and label counters there, raw byte offsets and label
//! counters here).

use super::x64::Emitter;
use crate::error::{Category, Diagnostics};
use crate::regalloc::Allocation;
use crate::symbols::SymbolTable;
use std::collections::HashMap;

/// A deduplicated `.rodata` byte pool (spec §4.6 "A deduplication hash maps
/// string/float constants to a unique offset; repeat references share the
/// same label").
#[derive(Debug, Default)]
pub struct RodataPool {
    pub bytes: Vec<u8>,
    floats: HashMap<u64, usize>,
    strings: HashMap<String, usize>,
}

impl RodataPool {
    pub fn new() -> Self {
        RodataPool::default()
    }

    /// Interns an `f64` literal's IEEE-754 bit pattern, 8-byte aligned.
    /// Returns its byte offset within `.rodata`.
    pub fn intern_float(&mut self, value: f64) -> usize {
        let key = value.to_bits();
        if let Some(&offset) = self.floats.get(&key) {
            return offset;
        }
        self.pad_to(8);
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self.floats.insert(key, offset);
        offset
    }

    /// Interns a null-terminated UTF-8 string (spec §4.6 "String literal:
    /// store the UTF-8 bytes (null-terminated) in rodata"). Returns its
    /// byte offset.
    pub fn intern_cstring(&mut self, s: &str) -> usize {
        if let Some(&offset) = self.strings.get(s) {
            return offset;
        }
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.strings.insert(s.to_string(), offset);
        offset
    }

    fn pad_to(&mut self, align: usize) {
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
    }
}

/// A relocation that cannot be resolved until the Binary Writer has
/// assigned final section virtual addresses (spec §4.6 "Relocations", §4.7
/// step 5). Everything resolvable from `.text`-internal offsets alone
/// (intra-function branches, calls between Language functions) is patched
/// directly by [`CodeGen::finish`] instead and never becomes one of these.
#[derive(Debug, Clone)]
pub enum Relocation {
    /// A `call rel32` to an imported C symbol's PLT stub.
    PltCall {
        site: usize,
        library: String,
        symbol: String,
    },
    /// A RIP-relative `lea`/`movsd` referencing a `.rodata` offset.
    RipRodata { site: usize, rodata_offset: usize },
}

/// An intra-`.text` label: a forward or backward branch target within the
/// code being emitted right now (loop tops/bottoms, match-arm joins,
/// `or!` fallbacks, defer epilogues). Resolved the moment the label site
/// is reached, never leaves this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub usize);

enum PendingTarget {
    Label(LabelId),
    /// A direct call to Language function `id`, patched once every
    /// function's entry offset is known (spec §4.6 "Single-pass with
    /// patch-up").
    FunctionEntry(usize),
}

struct Pending {
    site: usize,
    target: PendingTarget,
}

/// Per-pipeline code generation state, threaded through `expr.rs`/`stmt.rs`
/// (spec §9 Context-object pattern, applied one level below
/// `crate::config::Context`).
pub struct CodeGen<'a> {
    pub emitter: Emitter,
    pub rodata: RodataPool,
    pub relocations: Vec<Relocation>,
    pub catalog: &'a dyn flapc_catalog::SymbolCatalog,
    pub diags: &'a mut Diagnostics,
    /// The whole program's symbol table, consulted by `Expr::Lambda`
    /// lowering to resolve a lambda node's own span back to the
    /// `FunctionRecord` the symbol collector built for it (spec §3.3
    /// "Closure object").
    pub symbols: &'a SymbolTable,
    /// Named top-level function -> id, used by `Call`/`Pipe` lowering
    /// (spec §4.6 "Call").
    pub function_ids: HashMap<String, usize>,
    /// Language function id -> `.text` entry offset, filled in as each
    /// function is emitted; consulted to patch calls that were emitted
    /// before their target.
    pub function_entries: HashMap<usize, usize>,
    pending: Vec<Pending>,
    labels: HashMap<LabelId, usize>,
    next_label: usize,
    /// Current frame's register allocation (locations + callee-saved set),
    /// swapped out by `emit_function`/`emit_top_level` as each frame is
    /// entered.
    pub allocation: Allocation,
    /// Stack of `defer`red expressions queued in the current scope chain,
    /// innermost last; flushed LIFO at every control-flow exit (spec §4.6
    /// "Defer").
    pub defer_stack: Vec<Vec<crate::ast::Expr>>,
    /// `ret @N`/loop-state targets: loop label -> (top-of-loop label,
    /// after-loop label, frame-slot of the iteration counter), innermost
    /// loop last.
    pub loop_targets: Vec<(usize, LabelId, LabelId, i32)>,
    /// Next free frame-pointer offset below every named local's slots,
    /// used for compiler-internal scratch storage (loop counters, `or!`
    /// temporaries) that never gets a name of its own.
    pub scratch_slot_cursor: i32,
    /// Names captured by the function currently being emitted, in the
    /// order the environment record (`r15`) stores them (empty at top
    /// level and for any non-capturing function), spec §3.3 "Closure
    /// object"/§4.4 "Closure captures become cells in a heap-allocated
    /// environment record".
    pub current_captured: Vec<String>,
}

impl<'a> CodeGen<'a> {
    pub fn new(catalog: &'a dyn flapc_catalog::SymbolCatalog, diags: &'a mut Diagnostics, symbols: &'a SymbolTable) -> Self {
        CodeGen {
            emitter: Emitter::new(),
            rodata: RodataPool::new(),
            relocations: Vec::new(),
            catalog,
            diags,
            symbols,
            function_ids: HashMap::new(),
            function_entries: HashMap::new(),
            pending: Vec::new(),
            labels: HashMap::new(),
            next_label: 0,
            allocation: Allocation::default(),
            defer_stack: Vec::new(),
            loop_targets: Vec::new(),
            scratch_slot_cursor: 0,
            current_captured: Vec::new(),
        }
    }

    /// Looks up a named Language function's id for a direct `Call`/`Pipe`.
    pub fn function_id(&self, name: &str) -> Option<usize> {
        self.function_ids.get(name).copied()
    }

    pub fn diags_error(&mut self, category: Category, message: impl Into<String>) {
        self.diags.error(category, message);
    }

    /// Hands out the next free compiler-internal scratch stack slot below
    /// the current frame's named locals (16-byte aligned, spec §3.3).
    /// Used for loop iteration counters, which have no source-level name
    /// and so never go through `symbols::Collector`.
    pub fn alloc_scratch_slot(&mut self, base: i32) -> i32 {
        self.scratch_slot_cursor -= 16;
        base + self.scratch_slot_cursor
    }

    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// Binds `label` to the current `.text` offset (the site of a loop
    /// top, a match join point, or similar).
    pub fn place_label(&mut self, label: LabelId) {
        self.labels.insert(label, self.emitter.offset());
    }

    /// Records that the 4-byte field at `site` must be patched with the
    /// `rel32` distance to `label` once `label` is placed.
    pub fn patch_to_label(&mut self, site: usize, label: LabelId) {
        self.pending.push(Pending {
            site,
            target: PendingTarget::Label(label),
        });
    }

    /// Records that the 4-byte field at `site` is a call to Language
    /// function `function_id`, to be patched once every function has been
    /// emitted and `function_entries` is complete.
    pub fn patch_to_function(&mut self, site: usize, function_id: usize) {
        self.pending.push(Pending {
            site,
            target: PendingTarget::FunctionEntry(function_id),
        });
    }

    /// Interns a rodata float and records the RIP-relative relocation for
    /// the 4-byte displacement field at `site`.
    pub fn reloc_rodata_float(&mut self, site: usize, value: f64) {
        let offset = self.rodata.intern_float(value);
        self.relocations.push(Relocation::RipRodata { site, rodata_offset: offset });
    }

    pub fn reloc_rodata_cstring(&mut self, site: usize, s: &str) {
        let offset = self.rodata.intern_cstring(s);
        self.relocations.push(Relocation::RipRodata { site, rodata_offset: offset });
    }

    pub fn reloc_plt_call(&mut self, site: usize, library: String, symbol: String) {
        self.relocations.push(Relocation::PltCall { site, library, symbol });
    }

    /// Resolves every intra-`.text` pending patch (labels and
    /// Language-function calls) once the whole program has been emitted.
    /// Must run exactly once, after every function's body and every
    /// top-level statement has been lowered.
    pub fn finish(mut self) -> (Emitter, RodataPool, Vec<Relocation>) {
        for p in &self.pending {
            let target_offset = match p.target {
                PendingTarget::Label(label) => *self
                    .labels
                    .get(&label)
                    .unwrap_or_else(|| panic!("internal: label {label:?} never placed")),
                PendingTarget::FunctionEntry(id) => *self
                    .function_entries
                    .get(&id)
                    .unwrap_or_else(|| panic!("internal: function {id} never emitted")),
            };
            // rel32 is relative to the byte immediately following the
            // 4-byte field itself.
            let rel = target_offset as i64 - (p.site as i64 + 4);
            self.emitter.patch_rel32(p.site, rel as i32);
        }
        (self.emitter, self.rodata, self.relocations)
    }
}
