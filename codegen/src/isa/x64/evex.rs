//! EVEX prefix assembly.
//!
//! AVX-512 instructions carry a fixed 4-byte prefix introduced by 0x62.
//! Beyond what VEX expresses it adds a second extension bit for the reg
//! and `vvvv` fields (reaching register encodings 16..=31), a third
//! vector length, an opmask selector with optional zeroing-masking, and
//! the `b` bit that requests embedded broadcast for a memory operand.

use crate::holder::CodeHolder;

/// The rm operand as the prefix sees it. For a register-direct rm, bit 3
/// of the encoding goes in B and bit 4 in X; for memory, B and X extend
/// the base and index encodings as usual.
#[derive(Clone, Copy, Debug)]
pub enum EvexRm {
    /// Register-direct rm with a full 5-bit encoding.
    Reg(u8),
    /// Memory rm with optional base and index encodings.
    Mem {
        base: Option<u8>,
        index: Option<u8>,
    },
}

/// Field values for one EVEX-encoded instruction.
#[derive(Clone, Copy, Debug)]
pub struct Evex {
    /// The register in the ModRM reg position, full 5-bit encoding.
    pub reg: u8,
    /// The `vvvv` source, full 5-bit encoding; 0 when unused.
    pub nds: u8,
    /// The rm operand.
    pub rm: EvexRm,
    /// Vector length: 0 = 128, 1 = 256, 2 = 512 bits. 3 is reserved and
    /// undefined to execute.
    pub len: u8,
    /// Implied legacy prefix, sharing the [`super::vex::pp`] values.
    pub pp: u8,
    /// Opcode map: 1 = 0F, 2 = 0F38, 3 = 0F3A.
    pub map: u8,
    /// The W bit; also marks the element width for compressed
    /// displacements.
    pub w: bool,
    /// Opmask register selector `aaa`; 0 leaves the operation unmasked.
    pub mask: u8,
    /// Zeroing-masking instead of merge-masking.
    pub zeroing: bool,
    /// Embedded broadcast of a memory element.
    ///
    /// TODO: with a register-direct rm this bit selects static rounding
    /// control instead; no mnemonic in the supported set drives that, so
    /// only the broadcast meaning is wired up.
    pub broadcast: bool,
}

impl Evex {
    /// Emit the 4 prefix bytes.
    pub fn emit(&self, holder: &mut CodeHolder) {
        debug_assert!(self.reg < 32);
        debug_assert!(self.nds < 32);
        debug_assert!(self.len < 3);
        debug_assert!(self.pp <= 0b11);
        debug_assert!(self.map <= 0b111);
        debug_assert!(self.mask < 8);

        // Every register-extension bit is stored inverted, like in VEX.
        let inv = |bit: u8| (!bit) & 1;
        let (b, x) = match self.rm {
            EvexRm::Reg(enc) => ((enc >> 3) & 1, (enc >> 4) & 1),
            EvexRm::Mem { base, index } => (
                base.map_or(0, |e| (e >> 3) & 1),
                index.map_or(0, |e| (e >> 3) & 1),
            ),
        };

        holder.put1(0x62);
        // R:X:B:R' over the map, with bit 3 fixed at zero.
        holder.put1(
            (inv((self.reg >> 3) & 1) << 7)
                | (inv(x) << 6)
                | (inv(b) << 5)
                | (inv((self.reg >> 4) & 1) << 4)
                | self.map,
        );
        // W over vvvv and pp; bit 2 reads as one.
        holder.put1((u8::from(self.w) << 7) | ((!self.nds & 0xF) << 3) | 0b100 | self.pp);
        // Masking, length, broadcast, and the vvvv extension V'.
        holder.put1(
            (u8::from(self.zeroing) << 7)
                | (self.len << 5)
                | (u8::from(self.broadcast) << 4)
                | (inv((self.nds >> 4) & 1) << 3)
                | self.mask,
        );
    }
}
