//! Companion runtime the compiler's generated code links against.
//!
//! Every compiled program is a flat sequence of machine code operating on
//! a single universal value type (an `f64`; see [`value`]). Anything that
//! type can't represent directly on its own — containers, strings,
//! channels, atomics, parallel dispatch — is a `call` out to one of the
//! `extern "C"` functions exported here, relocated against this crate's
//! `cdylib` output (`libflapc_runtime.so`) by the compiler's PLT
//! relocations under the catalog namespace `rt`.
//!
//! `eprint`/`eprintln` relocate against a second, near-identical object
//! (`flapc-runtime-stderr`) instead of calling into this crate directly,
//! since ELF relocations always target the literal symbol name
//! (`print_value`) regardless of namespace and two same-named exports
//! can't coexist in one shared object.

pub mod arena;
pub mod arith;
pub mod atomic;
pub mod channel;
pub mod closure;
pub mod container;
pub mod heap;
pub mod parallel;
pub mod print;
pub mod strings;
pub mod value;

pub use arena::{arena_enter, arena_exit};
pub use arith::{fmod, pow};
pub use atomic::{atomic_add, atomic_load, atomic_store, atomic_sub};
pub use channel::{channel_new, channel_recv, channel_send, channel_send_self};
pub use closure::{apply, closure_env_ptr, closure_new, closure_set_capture};
pub use container::{cons, contains, index_get, length, map_insert, map_new, sequence_new, sequence_push, slice};
pub use parallel::{fork, parallel_dispatch};
pub use print::{print_newline, print_value};
pub use strings::{string_concat, string_wrap};
