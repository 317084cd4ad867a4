//! The process-wide bump arena backing `arena { ... }` blocks (spec §4.6
//! "Arena: save the global arena pointer at entry, emit body, restore
//! pointer at exit ... a process-wide `mmap`'d region of growable
//! capacity").
//!
//! There is exactly one arena region per process. `arena_enter`/`arena_exit`
//! don't nest separate regions — they push/pop a bump-pointer checkpoint,
//! so a nested `arena { arena { ... } }` just resets further back on the
//! same region. Memory is never handed back to the kernel mid-program;
//! `arena_exit` only rewinds the cursor, so the next allocation inside a
//! sibling arena reuses the same bytes.

use libc::c_void;
use std::ptr;
use std::sync::Mutex;

const INITIAL_CAPACITY: usize = 1 << 20;
const ALIGN: usize = 8;

struct ArenaState {
    base: *mut u8,
    capacity: usize,
    offset: usize,
    checkpoints: Vec<usize>,
}

// Safety: the only pointer this holds is an mmap'd region this process
// owns outright; it never crosses an actual OS thread boundary (this
// runtime's only concurrency is `fork`, which gives each child its own
// copy-on-write copy of the mapping).
unsafe impl Send for ArenaState {}

static ARENA: Mutex<ArenaState> = Mutex::new(ArenaState {
    base: ptr::null_mut(),
    capacity: 0,
    offset: 0,
    checkpoints: Vec::new(),
});

fn grow(state: &mut ArenaState, additional: usize) {
    let new_capacity = (state.capacity.max(INITIAL_CAPACITY) * 2).max(state.capacity + additional);
    let new_base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            new_capacity,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(new_base, libc::MAP_FAILED, "flapc-runtime: arena mmap failed");
    if !state.base.is_null() {
        unsafe {
            ptr::copy_nonoverlapping(state.base, new_base as *mut u8, state.offset);
            libc::munmap(state.base as *mut c_void, state.capacity);
        }
    }
    state.base = new_base as *mut u8;
    state.capacity = new_capacity;
}

/// Bump-allocates `size` bytes from the open arena, or `None` if no
/// `arena { }` block is currently active (the caller should fall back to
/// `malloc`).
pub fn try_alloc(size: usize) -> Option<*mut u8> {
    let mut state = ARENA.lock().unwrap();
    if state.checkpoints.is_empty() {
        return None;
    }
    let aligned = (state.offset + ALIGN - 1) & !(ALIGN - 1);
    if aligned + size > state.capacity {
        let additional = aligned + size - state.capacity;
        grow(&mut state, additional);
    }
    let ptr = unsafe { state.base.add(aligned) };
    state.offset = aligned + size;
    Some(ptr)
}

/// # Safety
/// Called only by compiler-generated code at an `arena { }` block's entry.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arena_enter(_unused: f64) -> f64 {
    let mut state = ARENA.lock().unwrap();
    let offset = state.offset;
    state.checkpoints.push(offset);
    0.0
}

/// # Safety
/// Called only by compiler-generated code at an `arena { }` block's exit.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arena_exit(_unused: f64) -> f64 {
    let mut state = ARENA.lock().unwrap();
    if let Some(mark) = state.checkpoints.pop() {
        state.offset = mark;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_nothing_outside_an_open_arena() {
        // This process-wide singleton makes parallel test execution racy
        // by nature; exercise only the no-arena-open fast path here.
        let state = ARENA.lock().unwrap();
        if state.checkpoints.is_empty() {
            drop(state);
            assert!(try_alloc(8).is_none());
        }
    }
}
