//! Atomic read-modify-write over a raw address (spec §5 "atomic
//! operations compile to `lock`-prefixed instructions"). The compiler
//! hands us the address as a pointer bit-cast into the universal `f64`
//! representation; the actual `lock xadd`/`lock cmpxchg` sequence lives
//! here rather than in the generated machine code, since every atomic
//! site already pays a call's worth of overhead to reach the runtime
//! anyway (this codebase's `call_runtime2`/`call_runtime1` convention).

use std::sync::atomic::{AtomicI64, Ordering};

unsafe fn at(addr: f64) -> &'static AtomicI64 {
    let ptr: *const AtomicI64 = crate::value::value_to_ptr(addr);
    unsafe { &*ptr }
}

/// # Safety
/// `addr` must be the bit-cast address of a live, 8-byte-aligned `i64`
/// cell.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atomic_add(addr: f64, delta: f64) -> f64 {
    let prev = unsafe { at(addr) }.fetch_add(delta as i64, Ordering::SeqCst);
    prev as f64
}

/// # Safety
/// `addr` must be the bit-cast address of a live, 8-byte-aligned `i64`
/// cell.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atomic_sub(addr: f64, delta: f64) -> f64 {
    let prev = unsafe { at(addr) }.fetch_sub(delta as i64, Ordering::SeqCst);
    prev as f64
}

/// # Safety
/// `addr` must be the bit-cast address of a live, 8-byte-aligned `i64`
/// cell.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atomic_load(addr: f64) -> f64 {
    unsafe { at(addr) }.load(Ordering::SeqCst) as f64
}

/// # Safety
/// `addr` must be the bit-cast address of a live, 8-byte-aligned `i64`
/// cell.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atomic_store(addr: f64, value: f64) -> f64 {
    unsafe { at(addr) }.store(value as i64, Ordering::SeqCst);
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_load_round_trips() {
        let cell = AtomicI64::new(10);
        let addr = crate::value::ptr_to_value(&cell as *const AtomicI64 as *mut AtomicI64);
        unsafe { atomic_add(addr, 5.0) };
        assert_eq!(unsafe { atomic_load(addr) }, 15.0);
    }
}
