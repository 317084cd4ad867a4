//! x86-64 instruction encoder (spec §4.6): the only layer in this crate
//! that knows how an opcode turns into bytes. Everything above this module
//! works in terms of `Emitter` calls, never raw byte literals, so the
//! lowering code in `expr.rs`/`stmt.rs` reads like assembly rather than a
//! hex dump.
//!
//! Grounded on the teacher's `inline/ops.rs` (one function per operation,
//! writing into a shared output buffer) — this module plays the same role
//! one level lower, emitting machine bytes instead of LLVM IR text.

use crate::ast::Reg;

/// A growable `.text` buffer plus the running byte offset, used both while
/// emitting and when a relocation site needs recording (the offset is
/// captured at the instant the placeholder is written).
#[derive(Debug, Default)]
pub struct Emitter {
    pub bytes: Vec<u8>,
}

impl Emitter {
    pub fn new() -> Self {
        Emitter::default()
    }

    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    fn byte(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn bytes(&mut self, bs: &[u8]) {
        self.bytes.extend_from_slice(bs);
    }

    /// REX prefix: `W` selects 64-bit operand size, `R`/`X`/`B` extend the
    /// ModRM reg/SIB-index/ModRM rm (or opcode-reg) fields for registers
    /// 8-15. Emitted whenever any of the four bits are set, matching the
    /// x86-64 manual's "REX prefix is optional but required to access
    /// r8-r15 or for 64-bit operand size" rule.
    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        if w || r || x || b {
            let mut byte = 0x40;
            if w {
                byte |= 0x08;
            }
            if r {
                byte |= 0x04;
            }
            if x {
                byte |= 0x02;
            }
            if b {
                byte |= 0x01;
            }
            self.byte(byte);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.byte((mode << 6) | ((reg & 0x7) << 3) | (rm & 0x7));
    }

    // ---- General-purpose register moves ----------------------------------

    /// `mov reg64, imm64` (opcode `B8+r`, 64-bit form).
    pub fn mov_reg_imm64(&mut self, dst: Reg, imm: i64) {
        self.rex(true, false, false, dst.needs_rex_extension());
        self.byte(0xB8 + (dst.encoding() & 0x7));
        self.bytes(&imm.to_le_bytes());
    }

    /// `mov dst, src` (opcode `89 /r`, register-to-register, 64-bit).
    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_extension(), false, dst.needs_rex_extension());
        self.byte(0x89);
        self.modrm(0b11, src.encoding(), dst.encoding());
    }

    /// `mov dst, [base + disp32]`.
    pub fn mov_reg_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.needs_rex_extension(), false, base.needs_rex_extension());
        self.byte(0x8B);
        self.modrm(0b10, dst.encoding(), base.encoding());
        if (base.encoding() & 0x7) == 4 {
            self.byte(0x24); // SIB: no index, base = rsp/r12
        }
        self.bytes(&disp.to_le_bytes());
    }

    /// `mov [base + disp32], src`.
    pub fn mov_mem_reg(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(true, src.needs_rex_extension(), false, base.needs_rex_extension());
        self.byte(0x89);
        self.modrm(0b10, src.encoding(), base.encoding());
        if (base.encoding() & 0x7) == 4 {
            self.byte(0x24);
        }
        self.bytes(&disp.to_le_bytes());
    }

    /// `mov [base + disp32], imm32` (opcode `C7 /0`) — the `[REG + imm] <-
    /// imm` form of an `unsafe` store (spec §4.6 "Unsafe block").
    pub fn mov_mem_imm32(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex(true, false, false, base.needs_rex_extension());
        self.byte(0xC7);
        self.modrm(0b10, 0, base.encoding());
        if (base.encoding() & 0x7) == 4 {
            self.byte(0x24);
        }
        self.bytes(&disp.to_le_bytes());
        self.bytes(&imm.to_le_bytes());
    }

    pub fn add_reg_imm32(&mut self, dst: Reg, imm: i32) {
        self.rex(true, false, false, dst.needs_rex_extension());
        self.byte(0x81);
        self.modrm(0b11, 0, dst.encoding());
        self.bytes(&imm.to_le_bytes());
    }

    pub fn sub_reg_imm32(&mut self, dst: Reg, imm: i32) {
        self.rex(true, false, false, dst.needs_rex_extension());
        self.byte(0x81);
        self.modrm(0b11, 5, dst.encoding());
        self.bytes(&imm.to_le_bytes());
    }

    pub fn add_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_extension(), false, dst.needs_rex_extension());
        self.byte(0x01);
        self.modrm(0b11, src.encoding(), dst.encoding());
    }

    pub fn sub_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_extension(), false, dst.needs_rex_extension());
        self.byte(0x29);
        self.modrm(0b11, src.encoding(), dst.encoding());
    }

    pub fn inc_reg(&mut self, dst: Reg) {
        self.rex(true, false, false, dst.needs_rex_extension());
        self.byte(0xFF);
        self.modrm(0b11, 0, dst.encoding());
    }

    pub fn cmp_reg_reg(&mut self, lhs: Reg, rhs: Reg) {
        self.rex(true, rhs.needs_rex_extension(), false, lhs.needs_rex_extension());
        self.byte(0x39);
        self.modrm(0b11, rhs.encoding(), lhs.encoding());
    }

    pub fn cmp_reg_imm32(&mut self, lhs: Reg, imm: i32) {
        self.rex(true, false, false, lhs.needs_rex_extension());
        self.byte(0x81);
        self.modrm(0b11, 7, lhs.encoding());
        self.bytes(&imm.to_le_bytes());
    }

    /// `and dst, src` (opcode `21 /r`) — spec §4.6 bitwise `&b` lowering.
    pub fn bytes_and(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_extension(), false, dst.needs_rex_extension());
        self.byte(0x21);
        self.modrm(0b11, src.encoding(), dst.encoding());
    }

    /// `or dst, src` (opcode `09 /r`) — `|b`.
    pub fn bytes_or(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_extension(), false, dst.needs_rex_extension());
        self.byte(0x09);
        self.modrm(0b11, src.encoding(), dst.encoding());
    }

    /// `xor dst, src` (opcode `31 /r`) — `^b`.
    pub fn bytes_xor(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_extension(), false, dst.needs_rex_extension());
        self.byte(0x31);
        self.modrm(0b11, src.encoding(), dst.encoding());
    }

    /// `not dst` (opcode `F7 /2`) — the unary `~b` lowering.
    pub fn bytes_not(&mut self, dst: Reg) {
        self.rex(true, false, false, dst.needs_rex_extension());
        self.byte(0xF7);
        self.modrm(0b11, 2, dst.encoding());
    }

    /// `mov cl, src` then the `D3 /r` shift-by-`cl` family; `ext` selects
    /// the ModRM `/digit`: 4 = `shl`, 5 = `shr`, 0 = `rol`, 1 = `ror` (spec
    /// §4.6 "`<<b`/`>>b`/`<<<b`/`>>>b`").
    fn shift_cl(&mut self, ext: u8, dst: Reg, count: Reg) {
        // Move the shift count into `cl` (the 8-bit form of `rcx`) unless
        // it's already there; encoded as a plain 64-bit `mov` since only
        // the low byte is read by `D3`.
        if count != Reg::Rcx {
            self.rex(true, false, false, count.needs_rex_extension());
            self.byte(0x89);
            self.modrm(0b11, count.encoding(), Reg::Rcx.encoding());
        }
        self.rex(true, false, false, dst.needs_rex_extension());
        self.byte(0xD3);
        self.modrm(0b11, ext, dst.encoding());
    }

    pub fn shl_cl(&mut self, dst: Reg, count: Reg) {
        self.shift_cl(4, dst, count);
    }

    pub fn shr_cl(&mut self, dst: Reg, count: Reg) {
        self.shift_cl(5, dst, count);
    }

    pub fn rol_cl(&mut self, dst: Reg, count: Reg) {
        self.shift_cl(0, dst, count);
    }

    pub fn ror_cl(&mut self, dst: Reg, count: Reg) {
        self.shift_cl(1, dst, count);
    }

    pub fn push(&mut self, reg: Reg) {
        self.rex(false, false, false, reg.needs_rex_extension());
        self.byte(0x50 + (reg.encoding() & 0x7));
    }

    pub fn pop(&mut self, reg: Reg) {
        self.rex(false, false, false, reg.needs_rex_extension());
        self.byte(0x58 + (reg.encoding() & 0x7));
    }

    pub fn ret(&mut self) {
        self.byte(0xC3);
    }

    pub fn syscall(&mut self) {
        self.bytes(&[0x0F, 0x05]);
    }

    pub fn nop(&mut self) {
        self.byte(0x90);
    }

    // ---- SSE2 scalar-double moves/arithmetic ------------------------------

    fn xmm_rr(&mut self, prefix: &[u8], opcode: u8, dst: u8, src: u8) {
        self.bytes(prefix);
        if dst >= 8 || src >= 8 {
            self.byte(0x40 | ((dst >= 8) as u8) << 2 | ((src >= 8) as u8));
        }
        self.byte(opcode);
        self.modrm(0b11, dst, src);
    }

    /// `movq xmm, gpr` (bit-reinterpret, no conversion) — spec §4.6 "Number:
    /// ... then `movq xmm0, rax`".
    pub fn movq_xmm_gpr(&mut self, dst_xmm: u8, src: Reg) {
        self.bytes(&[0x66]);
        self.rex(true, dst_xmm >= 8, false, src.needs_rex_extension());
        self.bytes(&[0x0F, 0x6E]);
        self.modrm(0b11, dst_xmm, src.encoding());
    }

    pub fn movq_gpr_xmm(&mut self, dst: Reg, src_xmm: u8) {
        self.bytes(&[0x66]);
        self.rex(true, src_xmm >= 8, false, dst.needs_rex_extension());
        self.bytes(&[0x0F, 0x7E]);
        self.modrm(0b11, src_xmm, dst.encoding());
    }

    pub fn movsd_xmm_mem(&mut self, dst_xmm: u8, base: Reg, disp: i32) {
        self.bytes(&[0xF2]);
        if dst_xmm >= 8 || base.needs_rex_extension() {
            self.rex(false, dst_xmm >= 8, false, base.needs_rex_extension());
        }
        self.bytes(&[0x0F, 0x10]);
        self.modrm(0b10, dst_xmm, base.encoding());
        if (base.encoding() & 0x7) == 4 {
            self.byte(0x24);
        }
        self.bytes(&disp.to_le_bytes());
    }

    pub fn movsd_mem_xmm(&mut self, base: Reg, disp: i32, src_xmm: u8) {
        self.bytes(&[0xF2]);
        if src_xmm >= 8 || base.needs_rex_extension() {
            self.rex(false, src_xmm >= 8, false, base.needs_rex_extension());
        }
        self.bytes(&[0x0F, 0x11]);
        self.modrm(0b10, src_xmm, base.encoding());
        if (base.encoding() & 0x7) == 4 {
            self.byte(0x24);
        }
        self.bytes(&disp.to_le_bytes());
    }

    /// RIP-relative `movsd xmm, [rip+disp32]`, used to load a rodata
    /// float/string constant. Returns the offset of the `disp32` field so
    /// the caller can record a relocation against it.
    pub fn movsd_xmm_ripmem(&mut self, dst_xmm: u8, placeholder: i32) -> usize {
        self.bytes(&[0xF2]);
        if dst_xmm >= 8 {
            self.rex(false, true, false, false);
        }
        self.bytes(&[0x0F, 0x10]);
        self.modrm(0b00, dst_xmm, 0b101); // modrm.rm=101, mod=00 => RIP-relative
        let disp_offset = self.offset();
        self.bytes(&placeholder.to_le_bytes());
        disp_offset
    }

    /// `lea reg, [rip+disp32]`, used for string-literal / rodata pointers.
    /// Returns the offset of the `disp32` field.
    pub fn lea_rip(&mut self, dst: Reg, placeholder: i32) -> usize {
        self.rex(true, dst.needs_rex_extension(), false, false);
        self.byte(0x8D);
        self.modrm(0b00, dst.encoding(), 0b101);
        let disp_offset = self.offset();
        self.bytes(&placeholder.to_le_bytes());
        disp_offset
    }

    pub fn addsd(&mut self, dst: u8, src: u8) {
        self.xmm_rr(&[0xF2], 0x58, dst, src);
    }

    pub fn subsd(&mut self, dst: u8, src: u8) {
        self.xmm_rr(&[0xF2], 0x5C, dst, src);
    }

    pub fn mulsd(&mut self, dst: u8, src: u8) {
        self.xmm_rr(&[0xF2], 0x59, dst, src);
    }

    pub fn divsd(&mut self, dst: u8, src: u8) {
        self.xmm_rr(&[0xF2], 0x5E, dst, src);
    }

    pub fn ucomisd(&mut self, lhs: u8, rhs: u8) {
        self.xmm_rr(&[0x66], 0x2E, lhs, rhs);
    }

    pub fn xorpd(&mut self, dst: u8, src: u8) {
        self.xmm_rr(&[0x66], 0x57, dst, src);
    }

    /// `cvttsd2si reg, xmm` — truncating float64 -> int64.
    pub fn cvttsd2si(&mut self, dst: Reg, src_xmm: u8) {
        self.bytes(&[0xF2]);
        self.rex(true, dst.needs_rex_extension(), false, src_xmm >= 8);
        self.bytes(&[0x0F, 0x2C]);
        self.modrm(0b11, dst.encoding(), src_xmm);
    }

    /// `cvtsi2sd xmm, reg` — int64 -> float64.
    pub fn cvtsi2sd(&mut self, dst_xmm: u8, src: Reg) {
        self.bytes(&[0xF2]);
        self.rex(true, dst_xmm >= 8, false, src.needs_rex_extension());
        self.bytes(&[0x0F, 0x2A]);
        self.modrm(0b11, dst_xmm, src.encoding());
    }

    /// `setCC al`-family; `cc` is the raw SETcc opcode byte low nibble
    /// (e.g. `0x94` for `sete`, `0x9D` for `setge`).
    pub fn setcc(&mut self, cc_opcode: u8, dst: Reg) {
        if dst.needs_rex_extension() {
            self.rex(false, false, false, true);
        }
        self.bytes(&[0x0F, cc_opcode]);
        self.modrm(0b11, 0, dst.encoding());
    }

    /// `call rel32`. Returns the offset of the `rel32` field so the caller
    /// can record a relocation (PLT call or direct Language-function call).
    pub fn call_rel32(&mut self, placeholder: i32) -> usize {
        self.byte(0xE8);
        let rel_offset = self.offset();
        self.bytes(&placeholder.to_le_bytes());
        rel_offset
    }

    /// `jmp rel32`, used both for tail calls (spec §4.6 "emit a `jmp` to
    /// the function's post-prologue entry") and ordinary branches.
    pub fn jmp_rel32(&mut self, placeholder: i32) -> usize {
        self.byte(0xE9);
        let rel_offset = self.offset();
        self.bytes(&placeholder.to_le_bytes());
        rel_offset
    }

    /// `jcc rel32`; `cc_opcode` is the `0F 8x` conditional-jump low byte
    /// (e.g. `0x84` for `je`, `0x85` for `jne`).
    pub fn jcc_rel32(&mut self, cc_opcode: u8, placeholder: i32) -> usize {
        self.bytes(&[0x0F, cc_opcode]);
        let rel_offset = self.offset();
        self.bytes(&placeholder.to_le_bytes());
        rel_offset
    }

    /// Patches a previously-emitted `rel32` field (call/jmp/jcc) now that
    /// both the site and the target's virtual address are known.
    pub fn patch_rel32(&mut self, field_offset: usize, value: i32) {
        self.bytes[field_offset..field_offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// `setCC` condition codes used by comparison lowering (spec §4.6
/// "Comparison: `ucomisd`; map to Boolean 1.0/0.0 through `setCC`").
pub mod cc {
    pub const E: u8 = 0x94;
    pub const NE: u8 = 0x95;
    pub const A: u8 = 0x97; // unsigned >, used post-ucomisd for float >
    pub const AE: u8 = 0x93;
    pub const B: u8 = 0x92; // unsigned <, used post-ucomisd for float <
    pub const BE: u8 = 0x96;
    pub const P: u8 = 0x9A; // parity set: unordered (NaN) operand

    pub const JE: u8 = 0x84;
    pub const JNE: u8 = 0x85;
    pub const JA: u8 = 0x87;
    pub const JAE: u8 = 0x83;
    pub const JB: u8 = 0x82;
    pub const JBE: u8 = 0x86;
    pub const JP: u8 = 0x8A;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_reg_imm64_is_ten_bytes_with_rex() {
        let mut e = Emitter::new();
        e.mov_reg_imm64(Reg::Rax, 42);
        assert_eq!(e.bytes.len(), 10);
        assert_eq!(e.bytes[0], 0x48); // REX.W, no extension bits
        assert_eq!(e.bytes[1], 0xB8);
    }

    #[test]
    fn mov_reg_imm64_sets_rex_b_for_r8_plus() {
        let mut e = Emitter::new();
        e.mov_reg_imm64(Reg::R12, 1);
        assert_eq!(e.bytes[0], 0x49); // REX.W + REX.B
    }

    #[test]
    fn call_rel32_records_patchable_offset() {
        let mut e = Emitter::new();
        let site = e.call_rel32(0);
        assert_eq!(e.bytes[site - 1], 0xE8);
        e.patch_rel32(site, 100);
        assert_eq!(i32::from_le_bytes(e.bytes[site..site + 4].try_into().unwrap()), 100);
    }

    #[test]
    fn push_pop_are_single_byte_for_low_registers() {
        let mut e = Emitter::new();
        e.push(Reg::Rbx);
        e.pop(Reg::Rbx);
        assert_eq!(e.bytes, vec![0x53, 0x5B]);
    }
}
