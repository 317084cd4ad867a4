//! `fork`-based parallelism: `@@`/`N @@` loops and bare `spawn` (spec
//! §5). There are no green threads or a thread pool here — every worker
//! is a real `fork()`ed process, so the per-worker loop counter lives in
//! `r14` rather than a stack slot the parent and children would need to
//! synchronize over.

use crate::value;

/// Thin wrapper so `fork` is reachable through the same `rt` namespace as
/// every other runtime helper.
///
/// # Safety
/// Called only by compiler-generated code for a bare `spawn`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fork(_unused: f64) -> f64 {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return value::error_value(value::BAD_ARGUMENT);
    }
    pid as f64
}

fn worker_count(requested: f64) -> usize {
    if requested < 0.0 {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        n.max(1) as usize
    } else {
        (requested as usize).max(1)
    }
}

/// # Safety
/// `entry` must be the address of a compiled worker body taking its
/// partition index in `r14` (not as a normal argument) and returning via
/// `ret`; it must not unwind or access freed parent stack state.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn parallel_dispatch(requested_workers: f64, start: f64, end: f64, entry: *const u8) -> f64 {
    let workers = worker_count(requested_workers);
    let total = (end - start).max(0.0) as i64;
    let chunk = (total / workers as i64).max(1);

    let mut children = Vec::with_capacity(workers);
    for w in 0..workers {
        let lo = start as i64 + w as i64 * chunk;
        let hi = if w + 1 == workers { end as i64 } else { lo + chunk };
        if lo >= hi {
            continue;
        }
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            for index in lo..hi {
                unsafe { invoke_worker(entry, index) };
            }
            unsafe { libc::_exit(0) };
        } else if pid > 0 {
            children.push(pid);
        }
    }
    for pid in children {
        let mut status: i32 = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
    }
    0.0
}

/// Calls directly into a compiled worker body with its loop index loaded
/// into `r14`, matching `codegen::stmt::lower_parallel_loop`'s register
/// convention for the body it patches `entry` to.
///
/// # Safety
/// See [`parallel_dispatch`].
unsafe fn invoke_worker(entry: *const u8, index: i64) {
    unsafe {
        core::arch::asm!(
            "call {entry}",
            entry = in(reg) entry,
            in("r14") index,
            out("rax") _,
            out("xmm0") _,
            clobber_abi("C"),
        );
    }
}
