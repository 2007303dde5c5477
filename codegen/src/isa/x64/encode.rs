//! x64 memory-operand and padding emission.

use super::regs;
use super::rex::{Disp, RexFlags};
use crate::holder::CodeHolder;
use crate::ir::{MemOperand, RegOperand};
use crate::labels::{FixupKind, Label};
use crate::result::{CodegenError, CodegenResult};

// ModRM and SIB share a 2-3-3 bit split, but this assembler only ever
// builds three shapes of them, so each shape gets its own constructor.

/// ModRM selecting a register operand directly (mod = 0b11).
#[inline]
pub fn modrm_reg(reg: u8, rm: u8) -> u8 {
    0xC0 | ((reg & 7) << 3) | (rm & 7)
}

/// ModRM for a memory operand; `mode` is the displacement class from
/// [`Disp::mod_bits`].
#[inline]
pub fn modrm_mem(mode: u8, reg: u8, rm: u8) -> u8 {
    debug_assert!(mode < 0b11);
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// SIB from the index scale (as a left-shift amount) and the index/base
/// encodings.
#[inline]
pub fn sib(shift: u8, index: u8, base: u8) -> u8 {
    debug_assert!(shift < 4);
    (shift << 6) | ((index & 7) << 3) | (base & 7)
}

/// An x64 addressing mode with all registers physical, ready to encode.
#[derive(Clone, Copy, Debug)]
pub enum Amode {
    /// `[base + disp]`.
    ImmReg { base: u8, disp: i32 },
    /// `[base + index*scale + disp]`; `index` must not be RSP.
    ImmRegRegShift {
        base: u8,
        index: u8,
        shift: u8,
        disp: i32,
    },
    /// `[rip + label]`, resolved by a fixup.
    RipRelative { target: Label },
}

impl Amode {
    /// Lower an IR memory operand. Virtual registers must have been
    /// rewritten away by this point.
    pub fn from_mem(mem: &MemOperand, inst: &'static str, offset: u32) -> CodegenResult<Self> {
        let enc_of = |r: &RegOperand, what: &str| -> CodegenResult<u8> {
            match r {
                RegOperand::Phys(p) => Ok(p.enc),
                RegOperand::Virt(v) => Err(CodegenError::InvalidOperand {
                    inst,
                    operand: 0,
                    offset,
                    message: format!("{what} register {v} is still virtual"),
                }),
            }
        };
        if let Some(label) = mem.label {
            if mem.base.is_some() || mem.index.is_some() {
                return Err(CodegenError::InvalidOperand {
                    inst,
                    operand: 0,
                    offset,
                    message: "label-relative address cannot also have base/index".to_string(),
                });
            }
            return Ok(Amode::RipRelative { target: label });
        }
        match (&mem.base, &mem.index) {
            (Some(base), None) => Ok(Amode::ImmReg {
                base: enc_of(base, "base")?,
                disp: mem.disp,
            }),
            (Some(base), Some(index)) => {
                let index = enc_of(index, "index")?;
                if index == regs::RSP {
                    return Err(CodegenError::InvalidOperand {
                        inst,
                        operand: 0,
                        offset,
                        message: "rsp cannot be an index register".to_string(),
                    });
                }
                Ok(Amode::ImmRegRegShift {
                    base: enc_of(base, "base")?,
                    index,
                    shift: match mem.scale {
                        1 => 0,
                        2 => 1,
                        4 => 2,
                        8 => 3,
                        s => {
                            return Err(CodegenError::InvalidOperand {
                                inst,
                                operand: 0,
                                offset,
                                message: format!("invalid scale {s}"),
                            })
                        }
                    },
                    disp: mem.disp,
                })
            }
            (None, _) => Err(CodegenError::InvalidOperand {
                inst,
                operand: 0,
                offset,
                message: "memory operand needs a base register or a label".to_string(),
            }),
        }
    }

    /// The `(base, index)` encodings feeding REX/VEX/EVEX B and X bits.
    pub fn bx_encs(&self) -> (Option<u8>, Option<u8>) {
        match self {
            Amode::ImmReg { base, .. } => (Some(*base), None),
            Amode::ImmRegRegShift { base, index, .. } => (Some(*base), Some(*index)),
            Amode::RipRelative { .. } => (None, None),
        }
    }

    /// Emit the REX prefix for this mode with `enc_g` in the reg field.
    pub fn emit_rex_prefix(&self, rex: RexFlags, enc_g: u8, holder: &mut CodeHolder) {
        let (b, x) = self.bx_encs();
        rex.emit_for(holder, enc_g, x.unwrap_or(0), b.unwrap_or(0));
    }
}

/// Emit the ModRM/SIB/displacement sequence for a memory operand.
///
/// `bytes_at_end` counts immediate bytes that follow the displacement; the
/// RIP-relative displacement is measured from the end of the instruction, so
/// the fixup's PC base is pushed past them. `evex_scaling` is `Some(N)` for
/// EVEX compressed displacements.
pub fn emit_modrm_sib_disp(
    holder: &mut CodeHolder,
    enc_g: u8,
    mem_e: &Amode,
    bytes_at_end: u8,
    evex_scaling: Option<i8>,
) -> CodegenResult<()> {
    match *mem_e {
        Amode::ImmReg { base, disp } => {
            let enc_e = base;
            let mut imm = Disp::new(disp, evex_scaling);

            // Most base registers allow for a single ModRM byte plus an
            // optional immediate. If rsp is the base register a SIB byte
            // must be used.
            let enc_e_low3 = enc_e & 7;
            if enc_e_low3 == regs::RSP {
                // Displacement from RSP is encoded with a SIB byte where
                // the index and base are both RSP's encoding of 0b100,
                // meaning "no index".
                holder.put1(modrm_mem(imm.mod_bits(), enc_g, 0b100));
                holder.put1(sib(0, 0b100, 0b100));
                imm.emit(holder);
            } else {
                // Mod=00 with rbp/r13 as base means RIP-relative, so those
                // bases require an explicit zero displacement.
                if enc_e_low3 == regs::RBP {
                    imm.force_disp8();
                }
                holder.put1(modrm_mem(imm.mod_bits(), enc_g, enc_e));
                imm.emit(holder);
            }
        }

        Amode::ImmRegRegShift {
            base,
            index,
            shift,
            disp,
        } => {
            debug_assert!(index != regs::RSP);
            // A base whose low three bits are rbp's encoding requires an
            // explicit displacement in the SIB form as well.
            let mut imm = Disp::new(disp, evex_scaling);
            if base & 7 == regs::RBP {
                imm.force_disp8();
            }
            holder.put1(modrm_mem(imm.mod_bits(), enc_g, 0b100));
            holder.put1(sib(shift, index, base));
            imm.emit(holder);
        }

        Amode::RipRelative { target } => {
            // RIP-relative is mod=00, rm=101.
            holder.put1(modrm_mem(0b00, enc_g, 0b101));
            let at = holder.cur_offset();
            holder.put4(0);
            // The addressed location is relative to the end of the
            // instruction, which may include trailing immediate bytes.
            let pc_base = at + 4 + u32::from(bytes_at_end);
            holder.record_fixup(FixupKind::RipRel32, at, pc_base, target, 0)?;
        }
    }
    Ok(())
}

/// Canonical multi-byte NOP sequences (Intel SDM table 4-12), longest first.
static NOPS: &[&[u8]] = &[
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x00],
    &[0x66, 0x90],
    &[0x90],
];

/// Fill `len` bytes with the canonical NOP sequences.
pub fn emit_nops(holder: &mut CodeHolder, mut len: usize) {
    while len > 0 {
        let nop = NOPS.iter().find(|nop| nop.len() <= len).unwrap();
        holder.put_bytes(nop);
        len -= nop.len();
    }
}
