//! REX prefix handling and displacement classification.

use crate::holder::CodeHolder;

/// What one instruction needs from the REX prefix.
///
/// Three independent facts are tracked: whether REX.W is set (64-bit
/// operand size), whether the byte must be present even when every field
/// is zero (SPL/BPL/SIL/DIL are only addressable with a prefix), and
/// whether it must be absent (AH/CH/DH/BH are only addressable without
/// one). When the last two collide the assembler layer reports the
/// combination as incompatible.
#[derive(Clone, Copy, Debug)]
pub struct RexFlags {
    w: bool,
    required: bool,
    forbidden: bool,
}

impl RexFlags {
    /// 64-bit operand size.
    #[inline]
    pub fn w64() -> Self {
        Self {
            w: true,
            required: false,
            forbidden: false,
        }
    }

    /// Operand size determined elsewhere (legacy prefix, opcode, or the
    /// 32-bit default).
    #[inline]
    pub fn w_default() -> Self {
        Self {
            w: false,
            required: false,
            forbidden: false,
        }
    }

    /// Pick W from an operand size in bytes.
    pub fn from_size(size: u8) -> Self {
        if size == 8 {
            Self::w64()
        } else {
            Self::w_default()
        }
    }

    /// Require the prefix byte even if all of its fields are zero.
    #[inline]
    pub fn require(&mut self) -> &mut Self {
        self.required = true;
        self
    }

    /// Forbid the prefix byte entirely.
    #[inline]
    pub fn forbid(&mut self) -> &mut Self {
        self.forbidden = true;
        self
    }

    /// Whether a high-byte operand has forbidden the prefix.
    #[inline]
    pub fn is_forbidden(self) -> bool {
        self.forbidden
    }

    /// Byte registers with encodings 4..=7 (SPL, BPL, SIL, DIL) need the
    /// prefix present to mean what they say.
    pub fn require_for_byte_reg(&mut self, enc: u8) {
        if (4..=7).contains(&enc) {
            self.require();
        }
    }

    /// The prefix byte itself: 0b0100WRXB, with W from this specification
    /// and R/X/B taken from bit 3 of the reg, index, and base encodings.
    fn byte(self, reg: u8, index: u8, base: u8) -> u8 {
        0x40 | (u8::from(self.w) << 3)
            | (((reg >> 3) & 1) << 2)
            | (((index >> 3) & 1) << 1)
            | ((base >> 3) & 1)
    }

    /// Whether emitting for these encodings produces a prefix byte.
    pub fn would_emit(self, reg: u8, index: u8, base: u8) -> bool {
        self.required || self.byte(reg, index, base) != 0x40
    }

    /// Emit the prefix if it carries any information (or is required).
    /// Unused positions pass 0.
    #[inline]
    pub fn emit_for(self, holder: &mut CodeHolder, reg: u8, index: u8, base: u8) {
        debug_assert!(!(self.forbidden && self.would_emit(reg, index, base)));
        if self.would_emit(reg, index, base) {
            holder.put1(self.byte(reg, index, base));
        }
    }
}

/// A memory displacement classified into the ModRM `mod` encoding space:
/// absent, one sign-extended byte, or four bytes.
#[derive(Clone, Copy, Debug)]
pub enum Disp {
    None,
    Disp8(i8),
    Disp32(i32),
}

impl Disp {
    /// Classify `val`. Under EVEX the byte form holds `val / N` for the
    /// instruction's compressed-displacement factor `N` (Intel SDM 2.7.5),
    /// so a scaled value that divides evenly still fits in one byte.
    pub fn new(val: i32, evex_scaling: Option<i8>) -> Disp {
        if val == 0 {
            return Disp::None;
        }
        if let Some(n) = evex_scaling {
            let n = i32::from(n);
            return match i8::try_from(val / n) {
                Ok(scaled) if val % n == 0 => Disp::Disp8(scaled),
                _ => Disp::Disp32(val),
            };
        }
        match i8::try_from(val) {
            Ok(val) => Disp::Disp8(val),
            Err(_) => Disp::Disp32(val),
        }
    }

    /// Upgrade an absent displacement to an explicit zero byte; required
    /// when the base register's low bits collide with the RIP-relative
    /// encoding (rbp/r13).
    pub fn force_disp8(&mut self) {
        if let Disp::None = self {
            *self = Disp::Disp8(0);
        }
    }

    /// The two `mod` bits this displacement selects.
    pub fn mod_bits(self) -> u8 {
        match self {
            Disp::None => 0b00,
            Disp::Disp8(_) => 0b01,
            Disp::Disp32(_) => 0b10,
        }
    }

    /// Append the displacement bytes, if any.
    pub fn emit(self, holder: &mut CodeHolder) {
        match self {
            Disp::None => {}
            Disp::Disp8(v) => holder.put1(v as u8),
            Disp::Disp32(v) => holder.put4(v as u32),
        }
    }
}
