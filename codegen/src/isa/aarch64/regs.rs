//! AArch64 register encodings and names.

use crate::ir::PhysReg;

/// The frame pointer, x29.
pub const FP: u8 = 29;
/// The link register, x30.
pub const LR: u8 = 30;
/// Encoding 31: the stack pointer in address contexts, the zero register in
/// operand contexts. The encoders pick the interpretation.
pub const SP: u8 = 31;
/// Alias of [`SP`]: the zero register.
pub const XZR: u8 = 31;

/// A 64-bit integer register operand.
pub fn xreg(enc: u8) -> PhysReg {
    PhysReg::gpr(enc, 8)
}

/// A 32-bit integer register operand.
pub fn wreg(enc: u8) -> PhysReg {
    PhysReg::gpr(enc, 4)
}

/// A 32-bit scalar float register operand.
pub fn sreg(enc: u8) -> PhysReg {
    PhysReg::vec(enc, 4)
}

/// A 64-bit scalar float register operand.
pub fn dreg(enc: u8) -> PhysReg {
    PhysReg::vec(enc, 8)
}

/// A 128-bit vector register operand.
pub fn qreg(enc: u8) -> PhysReg {
    PhysReg::vec(enc, 16)
}

/// Integer register name at a size, for diagnostics.
pub fn gpr_name(enc: u8, size: u8) -> String {
    let prefix = if size == 8 { 'x' } else { 'w' };
    match enc {
        29 => "fp".to_string(),
        30 => "lr".to_string(),
        31 => "sp".to_string(),
        _ => format!("{prefix}{enc}"),
    }
}
