//! x64 register encodings and names.

use crate::ir::PhysReg;

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;

/// Pseudo-encodings for the legacy high-byte registers AH, CH, DH, BH.
/// They encode as 4..=7 in ModR/M but only in the absence of a REX prefix;
/// the encoder translates and enforces that rule.
pub const AH: u8 = 16;
pub const CH: u8 = 17;
pub const DH: u8 = 18;
pub const BH: u8 = 19;

/// Whether `enc` is one of the high-byte pseudo-encodings.
pub fn is_high_byte(enc: u8) -> bool {
    (AH..=BH).contains(&enc)
}

/// A 64-bit GPR operand.
pub fn gpr(enc: u8) -> PhysReg {
    PhysReg::gpr(enc, 8)
}

/// A 32-bit GPR operand.
pub fn gpr32(enc: u8) -> PhysReg {
    PhysReg::gpr(enc, 4)
}

/// A 16-bit GPR operand.
pub fn gpr16(enc: u8) -> PhysReg {
    PhysReg::gpr(enc, 2)
}

/// An 8-bit GPR operand (low byte; use the `AH..BH` pseudo-encodings for
/// high bytes).
pub fn gpr8(enc: u8) -> PhysReg {
    PhysReg::gpr(enc, 1)
}

/// A 128-bit XMM operand.
pub fn xmm(enc: u8) -> PhysReg {
    PhysReg::vec(enc, 16)
}

/// A 256-bit YMM operand.
pub fn ymm(enc: u8) -> PhysReg {
    PhysReg::vec(enc, 32)
}

/// A 512-bit ZMM operand.
pub fn zmm(enc: u8) -> PhysReg {
    PhysReg::vec(enc, 64)
}

/// Return the name of a GPR encoding at the given size, for diagnostics.
pub fn gpr_name(enc: u8, size: u8) -> &'static str {
    static Q: &[&str] = &[
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    static D: &[&str] = &[
        "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
        "r12d", "r13d", "r14d", "r15d",
    ];
    static W: &[&str] = &[
        "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w",
        "r13w", "r14w", "r15w",
    ];
    static B: &[&str] = &[
        "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
        "r13b", "r14b", "r15b",
    ];
    static HI: &[&str] = &["ah", "ch", "dh", "bh"];
    if is_high_byte(enc) {
        return HI[(enc - AH) as usize];
    }
    let i = enc as usize;
    match size {
        8 => Q[i],
        4 => D[i],
        2 => W[i],
        _ => B[i],
    }
}
