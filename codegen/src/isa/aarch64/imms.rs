//! AArch64 immediate formats.
//!
//! Every constructor is a `maybe_from_*` returning `None` when the value is
//! not representable in the field, so the assembler layer can report a
//! structured error instead of silently truncating.

/// Operand size of an integer instruction, setting the `sf` bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSize {
    Size32,
    Size64,
}

impl OperandSize {
    /// Pick from a register size in bytes.
    pub fn from_bytes(bytes: u8) -> Self {
        if bytes == 8 {
            Self::Size64
        } else {
            Self::Size32
        }
    }

    /// The `sf` bit at position 31.
    pub fn sf_bit(self) -> u32 {
        match self {
            Self::Size32 => 0,
            Self::Size64 => 1,
        }
    }

    /// Width in bits.
    pub fn bits(self) -> u8 {
        match self {
            Self::Size32 => 32,
            Self::Size64 => 64,
        }
    }
}

/// A 12-bit unsigned immediate, optionally shifted left by 12 (ADD/SUB).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Imm12 {
    /// The immediate bits.
    pub bits: u16,
    /// Whether the bits are shifted left by 12.
    pub shift12: bool,
}

impl Imm12 {
    /// Compute an `Imm12` from raw bits, if possible.
    pub fn maybe_from_u64(val: u64) -> Option<Imm12> {
        if val < 0x1000 {
            Some(Imm12 {
                bits: val as u16,
                shift12: false,
            })
        } else if val < 0x100_0000 && (val & 0xfff) == 0 {
            Some(Imm12 {
                bits: (val >> 12) as u16,
                shift12: true,
            })
        } else {
            None
        }
    }

    /// The 2-bit shift field.
    pub fn shift_bits(self) -> u32 {
        u32::from(self.shift12)
    }

    /// The 12-bit immediate field.
    pub fn imm_bits(self) -> u32 {
        u32::from(self.bits)
    }
}

/// A 9-bit signed byte offset (LDUR/STUR).
#[derive(Clone, Copy, Debug)]
pub struct SImm9 {
    value: i16,
}

impl SImm9 {
    /// Create from a full-range offset, if representable.
    pub fn maybe_from_i64(value: i64) -> Option<SImm9> {
        if (-256..=255).contains(&value) {
            Some(SImm9 {
                value: value as i16,
            })
        } else {
            None
        }
    }

    /// Bits for encoding.
    pub fn bits(self) -> u32 {
        (self.value as u32) & 0x1ff
    }
}

/// An unsigned 12-bit offset scaled by the access size (LDR/STR unsigned
/// offset form).
#[derive(Clone, Copy, Debug)]
pub struct UImm12Scaled {
    value: u32,
    scale: u8,
}

impl UImm12Scaled {
    /// Create from a byte offset and access size in bytes, if representable.
    pub fn maybe_from_i64(value: i64, scale: u8) -> Option<UImm12Scaled> {
        debug_assert!(scale.is_power_of_two());
        let scale64 = i64::from(scale);
        if value >= 0 && value <= 4095 * scale64 && value % scale64 == 0 {
            Some(UImm12Scaled {
                value: value as u32,
                scale,
            })
        } else {
            None
        }
    }

    /// The scaled 12-bit field.
    pub fn bits(self) -> u32 {
        (self.value / u32::from(self.scale)) & 0xfff
    }
}

/// A signed 7-bit offset scaled by the access size (LDP/STP).
#[derive(Clone, Copy, Debug)]
pub struct SImm7Scaled {
    value: i32,
    scale: u8,
}

impl SImm7Scaled {
    /// Create from a byte offset and access size in bytes, if representable.
    pub fn maybe_from_i64(value: i64, scale: u8) -> Option<SImm7Scaled> {
        debug_assert!(scale.is_power_of_two());
        let scale64 = i64::from(scale);
        if value >= -64 * scale64 && value <= 63 * scale64 && value % scale64 == 0 {
            Some(SImm7Scaled {
                value: value as i32,
                scale,
            })
        } else {
            None
        }
    }

    /// The scaled 7-bit field.
    pub fn bits(self) -> u32 {
        ((self.value / i32::from(self.scale)) as u32) & 0x7f
    }
}

/// A 16-bit immediate with a {0,16,32,48}-bit shift (MOVZ/MOVN/MOVK).
#[derive(Clone, Copy, Debug)]
pub struct MoveWideConst {
    /// The 16 payload bits.
    pub bits: u16,
    /// Left shift in units of 16 bits (0..=3).
    pub shift: u8,
}

impl MoveWideConst {
    /// Construct from an arbitrary 64-bit constant if exactly one 16-bit
    /// chunk is populated.
    pub fn maybe_from_u64(value: u64) -> Option<MoveWideConst> {
        for shift in 0..4u8 {
            let mask = 0xffffu64 << (16 * shift);
            if value & !mask == 0 {
                return Some(MoveWideConst {
                    bits: (value >> (16 * shift)) as u16,
                    shift,
                });
            }
        }
        None
    }

    /// The value this constant represents.
    pub fn value(self) -> u64 {
        u64::from(self.bits) << (16 * self.shift)
    }
}

/// A 6-bit shift amount.
#[derive(Clone, Copy, Debug)]
pub struct ImmShift {
    /// The amount.
    pub imm: u8,
}

impl ImmShift {
    /// Create from a raw count, if in range for the operand size.
    pub fn maybe_from_u64(val: u64, size: OperandSize) -> Option<ImmShift> {
        if val < u64::from(size.bits()) {
            Some(ImmShift { imm: val as u8 })
        } else {
            None
        }
    }
}

/// A bitmask immediate for the logical instructions, encoded as N:immr:imms.
///
/// A bitmask immediate is a single contiguous run of ones, rotated, and
/// repeated across the word at power-of-two intervals. The recognizer below
/// follows VIXL's `Assembler::IsImmLogical`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImmLogic {
    value: u64,
    /// The `N` bit.
    pub n: bool,
    /// The rotate-right amount.
    pub r: u8,
    /// The element size / set-bit count field.
    pub s: u8,
    /// Whether this was built for a 32- or 64-bit instruction.
    pub size: OperandSize,
}

impl ImmLogic {
    /// Compute an `ImmLogic` from raw bits, if the value is encodable.
    pub fn maybe_from_u64(value: u64, size: OperandSize) -> Option<ImmLogic> {
        let original_value = value;

        let value = if size == OperandSize::Size32 {
            if value >> 32 != 0 {
                return None;
            }
            // A 32-bit immediate is encodable iff the value repeated into
            // the upper half is encodable as a 64-bit pattern.
            value << 32 | value
        } else {
            value
        };

        // All-zeros and all-ones have no run/gap structure and are not
        // encodable.
        if value == 0 || value == u64::MAX {
            return None;
        }

        // Normalize so the lowest bits are a run of zeros followed by a run
        // of ones; if bit 0 is set, the inverse has that shape and encodes
        // with compensated fields.
        let (value, inverted) = if value & 1 == 1 {
            (!value, true)
        } else {
            (value, false)
        };

        // Find the lowest set bit a, clear the bottom run by adding it, and
        // locate the following structure; the distance between runs gives
        // the repeat period.
        fn lowest_set_bit(value: u64) -> u64 {
            let bit = value.trailing_zeros();
            1u64.checked_shl(bit).unwrap_or(0)
        }
        let a = lowest_set_bit(value);
        debug_assert_ne!(0, a);
        let value_plus_a = value.wrapping_add(a);
        let b = lowest_set_bit(value_plus_a);
        let value_plus_a_minus_b = value_plus_a - b;
        let c = lowest_set_bit(value_plus_a_minus_b);

        let (d, clz_a, out_n, mask) = if c != 0 {
            // More than one run: d is the repeat period and N will be 0.
            let clz_a = a.leading_zeros();
            let clz_c = c.leading_zeros();
            let d = clz_a - clz_c;
            let mask = (1u64 << d) - 1;
            (d, clz_a, 0, mask)
        } else {
            (64, a.leading_zeros(), 1, u64::MAX)
        };

        // The repeat period must be a power of two.
        if !d.is_power_of_two() {
            return None;
        }

        if ((b.wrapping_sub(a)) & !mask) != 0 {
            // The run of ones does not fit within the repeat period.
            return None;
        }

        // Reconstruct the only candidate immediate with this (run, period)
        // pair and compare against the input.
        const MULTIPLIERS: [u64; 6] = [
            0x0000000000000001,
            0x0000000100000001,
            0x0001000100010001,
            0x0101010101010101,
            0x1111111111111111,
            0x5555555555555555,
        ];
        let multiplier = MULTIPLIERS[(u64::from(d).leading_zeros() - 57) as usize];
        let candidate = b.wrapping_sub(a).wrapping_mul(multiplier);
        if value != candidate {
            return None;
        }

        // clz(0) must behave as -1 for runs reaching bit 63.
        let clz_b = if b == 0 {
            u32::MAX
        } else {
            b.leading_zeros()
        };
        let s = clz_a.wrapping_sub(clz_b);

        // The rotate count places the low end of the run at position a; an
        // inverted input compensates via position b.
        let (s, r) = if inverted {
            (d - s, clz_b.wrapping_add(1) & (d - 1))
        } else {
            (s, (clz_a + 1) & (d - 1))
        };

        // imms encodes both the element size and the run length: the top
        // bits are (2 * -d), the low bits (s - 1).
        let s = ((d * 2).wrapping_neg() | (s - 1)) & 0x3f;
        Some(ImmLogic {
            value: original_value,
            n: out_n != 0,
            r: r as u8,
            s: s as u8,
            size,
        })
    }

    /// Bits ready for encoding: `N:immr:imms`, 13 bits.
    pub fn enc_bits(self) -> u32 {
        (u32::from(self.n) << 12) | (u32::from(self.r) << 6) | u32::from(self.s)
    }

    /// The represented value.
    pub fn value(self) -> u64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imm12_ranges() {
        assert_eq!(
            Imm12::maybe_from_u64(0),
            Some(Imm12 {
                bits: 0,
                shift12: false
            })
        );
        assert_eq!(
            Imm12::maybe_from_u64(4095),
            Some(Imm12 {
                bits: 4095,
                shift12: false
            })
        );
        assert_eq!(
            Imm12::maybe_from_u64(0x1000),
            Some(Imm12 {
                bits: 1,
                shift12: true
            })
        );
        assert_eq!(Imm12::maybe_from_u64(0x1001), None);
        assert_eq!(Imm12::maybe_from_u64(0x1_000_000), None);
    }

    #[test]
    fn move_wide_chunks() {
        let c = MoveWideConst::maybe_from_u64(0xffff).unwrap();
        assert_eq!((c.bits, c.shift), (0xffff, 0));
        let c = MoveWideConst::maybe_from_u64(0xffff_0000_0000).unwrap();
        assert_eq!((c.bits, c.shift), (0xffff, 2));
        assert!(MoveWideConst::maybe_from_u64(0x1_0001).is_none());
    }

    #[test]
    fn logical_immediates_match_known_encodings() {
        // 0xff -> size 8 repeat, s=0b111000|7? Spot-check against known
        // assembler output: `and x0, x1, #0xff` encodes immr=0, imms=0b000111,
        // N=0... (0xff = run of 8 ones repeated every 8 bits? No: 0xff in
        // 64-bit is a single run; N=1, imms=0b000111, immr=0.)
        let imm = ImmLogic::maybe_from_u64(0xff, OperandSize::Size64).unwrap();
        assert!(imm.n);
        assert_eq!(imm.r, 0);
        assert_eq!(imm.s, 0b000111);

        // 0x5555555555555555: alternating bits, period 2.
        let imm = ImmLogic::maybe_from_u64(0x5555_5555_5555_5555, OperandSize::Size64).unwrap();
        assert!(!imm.n);
        assert_eq!(imm.r, 0);
        assert_eq!(imm.s, 0b111100);

        // 0xf0f0f0f0 (32-bit): period 8, run 4, rotated.
        let imm = ImmLogic::maybe_from_u64(0xf0f0_f0f0, OperandSize::Size32).unwrap();
        assert!(!imm.n);
        assert_eq!(imm.r, 4);
        assert_eq!(imm.s, 0b110011);

        // Not encodable.
        assert!(ImmLogic::maybe_from_u64(0, OperandSize::Size64).is_none());
        assert!(ImmLogic::maybe_from_u64(u64::MAX, OperandSize::Size64).is_none());
        assert!(ImmLogic::maybe_from_u64(0x1234_5678, OperandSize::Size64).is_none());
    }
}
