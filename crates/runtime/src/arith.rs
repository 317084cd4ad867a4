//! Float operators with no direct x86 instruction equivalent (spec §4.3
//! "`**`, `%` on floats"). These run inside our own `.so`, so the plain
//! `f64` methods suffice; no external `libm` link is needed.

/// # Safety
/// Called only by compiler-generated code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

/// # Safety
/// Called only by compiler-generated code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fmod(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        return crate::value::error_value(crate::value::DIVIDE_BY_ZERO);
    }
    a % b
}
