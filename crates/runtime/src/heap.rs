//! Allocation for this runtime's own heap objects (strings, sequences,
//! maps, closures). Routes through the open [`arena`] when one exists,
//! falling back to `malloc` otherwise — the only two allocators a
//! compiled program ever touches (spec §4.6 "Arena").

use crate::arena;

/// # Safety
/// The caller owns the returned block and must only free it if it came
/// from `malloc` (arena blocks are reclaimed in bulk by `arena_exit`, not
/// individually).
pub unsafe fn alloc(size: usize) -> *mut u8 {
    if let Some(p) = arena::try_alloc(size) {
        return p;
    }
    let p = unsafe { libc::malloc(size) as *mut u8 };
    assert!(!p.is_null(), "flapc-runtime: malloc failed");
    p
}
