//! The AArch64 assembler: typed emitters over a code holder, plus the dense
//! dispatch from instruction nodes.

use super::emit::*;
use super::imms::{
    Imm12, ImmLogic, ImmShift, MoveWideConst, OperandSize, SImm7Scaled, SImm9, UImm12Scaled,
};
use super::inst::InstId;
use super::regs::{self, XZR};
use crate::buffer::CodeOffset;
use crate::env::Arch;
use crate::holder::CodeHolder;
use crate::ir::{Cond, InstNode, MemOperand, Operand, PhysReg, RegClass, RegOperand};
use crate::labels::{FixupKind, Label};
use crate::result::{CodegenError, CodegenResult};

/// Map an IR condition to the AArch64 condition field, if it exists there.
fn cond_enc(cond: Cond) -> Option<u32> {
    Some(match cond {
        Cond::Eq => 0b0000,
        Cond::Ne => 0b0001,
        Cond::UnsignedGe => 0b0010,
        Cond::UnsignedLt => 0b0011,
        Cond::Sign => 0b0100,
        Cond::NotSign => 0b0101,
        Cond::Overflow => 0b0110,
        Cond::NotOverflow => 0b0111,
        Cond::UnsignedGt => 0b1000,
        Cond::UnsignedLe => 0b1001,
        Cond::SignedGe => 0b1010,
        Cond::SignedLt => 0b1011,
        Cond::SignedGt => 0b1100,
        Cond::SignedLe => 0b1101,
        Cond::Parity | Cond::NotParity => return None,
    })
}

/// The AArch64 assembler. Every emitted instruction is exactly one 32-bit
/// little-endian word; branch displacements are recorded as
/// instruction-count fixups.
pub struct Assembler<'a> {
    holder: &'a mut CodeHolder,
}

impl<'a> Assembler<'a> {
    /// Wrap a holder whose environment targets AArch64.
    pub fn new(holder: &'a mut CodeHolder) -> Self {
        assert_eq!(holder.env().arch, Arch::Aarch64);
        Self { holder }
    }

    /// The underlying holder.
    pub fn holder(&mut self) -> &mut CodeHolder {
        self.holder
    }

    /// Read access to the underlying holder.
    pub fn holder_ref(&self) -> &CodeHolder {
        self.holder
    }

    fn offset(&self) -> CodeOffset {
        self.holder.cur_offset()
    }

    fn put(&mut self, word: u32) {
        debug_assert_eq!(self.holder.cur_offset() % 4, 0, "misaligned instruction");
        self.holder.put4(word);
    }

    fn bad_operand(
        &self,
        inst: &'static str,
        operand: usize,
        message: impl Into<String>,
    ) -> CodegenError {
        CodegenError::InvalidOperand {
            inst,
            operand,
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn need_cond(&self, inst: &'static str, cond: Option<Cond>) -> CodegenResult<u32> {
        let cond = cond.ok_or_else(|| self.bad_operand(inst, 0, "missing condition code"))?;
        cond_enc(cond).ok_or_else(|| {
            self.bad_operand(inst, 0, "condition has no AArch64 encoding")
        })
    }

    /// Emit a branch word with an empty offset field, then record the
    /// instruction-scaled fixup against it. The PC base is the
    /// instruction's own address; a bound target patches immediately.
    fn branch_word(&mut self, kind: FixupKind, target: Label, word: u32) -> CodegenResult<()> {
        let at = self.holder.cur_offset();
        self.put(word);
        self.holder.record_fixup(kind, at, at, target, 0)
    }

    // -- Moves and constants -----------------------------------------------

    /// `movz`/`movn` with an explicit 16-bit chunk and shift.
    pub fn mov_wide(
        &mut self,
        negated: bool,
        rd: PhysReg,
        imm: MoveWideConst,
    ) -> CodegenResult<()> {
        let op = if negated {
            MoveWideOp::MovN
        } else {
            MoveWideOp::MovZ
        };
        self.put(enc_move_wide(
            op,
            rd.enc,
            imm,
            OperandSize::from_bytes(rd.size),
        ));
        Ok(())
    }

    /// `movk`.
    pub fn movk(&mut self, rd: PhysReg, imm: MoveWideConst) -> CodegenResult<()> {
        self.put(enc_movk(rd.enc, imm, OperandSize::from_bytes(rd.size)));
        Ok(())
    }

    /// Register move. Moves to or from SP use the ADD-immediate alias, all
    /// others the ORR alias.
    pub fn mov_rr(&mut self, rd: PhysReg, rm: PhysReg) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        if rd.enc == regs::SP || rm.enc == regs::SP {
            let zero = Imm12::maybe_from_u64(0).unwrap();
            self.put(enc_add_sub_imm(false, false, size, zero, rm.enc, rd.enc));
        } else {
            self.put(enc_logical_shifted(LogicalOp::Orr, size, rd.enc, XZR, rm.enc, 0));
        }
        Ok(())
    }

    /// Materialize an arbitrary constant with the shortest movz/movn + movk
    /// sequence.
    pub fn load_const(&mut self, rd: PhysReg, value: u64) -> CodegenResult<()> {
        if let Some(imm) = MoveWideConst::maybe_from_u64(value) {
            return self.mov_wide(false, rd, imm);
        }
        if let Some(imm) = MoveWideConst::maybe_from_u64(!value) {
            return self.mov_wide(true, rd, imm);
        }
        if let Some(imm) = ImmLogic::maybe_from_u64(value, OperandSize::from_bytes(rd.size)) {
            self.put(enc_logical_imm(
                LogicalOp::Orr,
                imm.size,
                rd.enc,
                XZR,
                imm.enc_bits(),
            ));
            return Ok(());
        }
        // movz for the first non-zero chunk, movk for the rest.
        let mut first = true;
        for shift in 0..4u8 {
            let chunk = (value >> (16 * shift)) as u16;
            if chunk == 0 && !(first && shift == 3) {
                continue;
            }
            let imm = MoveWideConst { bits: chunk, shift };
            if first {
                self.mov_wide(false, rd, imm)?;
                first = false;
            } else {
                self.movk(rd, imm)?;
            }
        }
        Ok(())
    }

    // -- Integer arithmetic ------------------------------------------------

    /// `add`/`sub`(`s`) with a 12-bit immediate.
    pub fn add_sub_imm(
        &mut self,
        is_sub: bool,
        set_flags: bool,
        rd: PhysReg,
        rn: PhysReg,
        imm: u64,
    ) -> CodegenResult<()> {
        let name = if is_sub { "sub" } else { "add" };
        let imm12 = Imm12::maybe_from_u64(imm).ok_or_else(|| {
            self.bad_operand(name, 2, "immediate is not a shifted 12-bit value")
        })?;
        let size = OperandSize::from_bytes(rd.size);
        self.put(enc_add_sub_imm(is_sub, set_flags, size, imm12, rn.enc, rd.enc));
        Ok(())
    }

    /// `add`/`sub`(`s`) with a (possibly shifted) register operand.
    pub fn add_sub_rrr(
        &mut self,
        is_sub: bool,
        set_flags: bool,
        rd: PhysReg,
        rn: PhysReg,
        rm: PhysReg,
    ) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        self.put(enc_add_sub_shifted(
            is_sub, set_flags, size, rd.enc, rn.enc, rm.enc, 0, 0,
        ));
        Ok(())
    }

    /// `cmp rn, rm` (alias of `subs xzr`).
    pub fn cmp_rr(&mut self, rn: PhysReg, rm: PhysReg) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rn.size);
        self.put(enc_add_sub_shifted(true, true, size, XZR, rn.enc, rm.enc, 0, 0));
        Ok(())
    }

    /// `cmp rn, #imm` (alias of `subs xzr`).
    pub fn cmp_ri(&mut self, rn: PhysReg, imm: u64) -> CodegenResult<()> {
        let imm12 = Imm12::maybe_from_u64(imm).ok_or_else(|| {
            self.bad_operand("cmp", 1, "immediate is not a shifted 12-bit value")
        })?;
        let size = OperandSize::from_bytes(rn.size);
        self.put(enc_add_sub_imm(true, true, size, imm12, rn.enc, XZR));
        Ok(())
    }

    /// Logical op with a register operand.
    pub fn logical_rrr(
        &mut self,
        op: LogicalOp,
        rd: PhysReg,
        rn: PhysReg,
        rm: PhysReg,
    ) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        self.put(enc_logical_shifted(op, size, rd.enc, rn.enc, rm.enc, 0));
        Ok(())
    }

    /// Logical op with a bitmask immediate.
    pub fn logical_ri(
        &mut self,
        op: LogicalOp,
        rd: PhysReg,
        rn: PhysReg,
        imm: u64,
    ) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        let imm = ImmLogic::maybe_from_u64(imm, size).ok_or_else(|| {
            self.bad_operand("logical", 2, "value is not a bitmask immediate")
        })?;
        self.put(enc_logical_imm(op, size, rd.enc, rn.enc, imm.enc_bits()));
        Ok(())
    }

    /// `madd`/`msub`.
    pub fn madd_msub(
        &mut self,
        is_sub: bool,
        rd: PhysReg,
        rn: PhysReg,
        rm: PhysReg,
        ra: u8,
    ) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        let top11 = (size.sf_bit() << 10) | 0b0011011000;
        self.put(enc_arith_rrrr(
            top11,
            rm.enc,
            u32::from(is_sub),
            ra,
            rn.enc,
            rd.enc,
        ));
        Ok(())
    }

    /// `sdiv`/`udiv`.
    pub fn div(&mut self, signed: bool, rd: PhysReg, rn: PhysReg, rm: PhysReg) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        let top11 = (size.sf_bit() << 10) | 0b0011010110;
        let bits = if signed { 0b000011 } else { 0b000010 };
        self.put(enc_arith_rrr(top11, bits, rd.enc, rn.enc, rm.enc));
        Ok(())
    }

    /// Variable shift (`lslv`-family).
    pub fn shift_rrr(
        &mut self,
        id: InstId,
        rd: PhysReg,
        rn: PhysReg,
        rm: PhysReg,
    ) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        let top11 = (size.sf_bit() << 10) | 0b0011010110;
        let bits = match id {
            InstId::Lsl => 0b001000,
            InstId::Lsr => 0b001001,
            InstId::Asr => 0b001010,
            InstId::Ror => 0b001011,
            _ => unreachable!(),
        };
        self.put(enc_arith_rrr(top11, bits, rd.enc, rn.enc, rm.enc));
        Ok(())
    }

    /// Immediate shift via the UBFM/SBFM/EXTR aliases.
    pub fn shift_ri(&mut self, id: InstId, rd: PhysReg, rn: PhysReg, amount: u64) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        let shift = ImmShift::maybe_from_u64(amount, size)
            .ok_or_else(|| self.bad_operand("shift", 2, "shift amount out of range"))?;
        let sh = u32::from(shift.imm);
        let top = u32::from(size.bits()) - 1;
        match id {
            // lsl rd, rn, #sh == ubfm rd, rn, #(-sh mod size), #(size-1-sh)
            InstId::Lsl => {
                let immr = (u32::from(size.bits()) - sh) & top;
                self.put(enc_bitfield(0b10, size, rd.enc, rn.enc, immr, top - sh));
            }
            InstId::Lsr => self.put(enc_bitfield(0b10, size, rd.enc, rn.enc, sh, top)),
            InstId::Asr => self.put(enc_bitfield(0b00, size, rd.enc, rn.enc, sh, top)),
            // ror rd, rn, #sh == extr rd, rn, rn, #sh
            InstId::Ror => {
                let n = size.sf_bit();
                let word = (size.sf_bit() << 31)
                    | (0b00100111 << 23)
                    | (n << 22)
                    | (u32::from(rn.enc & 31) << 16)
                    | (sh << 10)
                    | (u32::from(rn.enc & 31) << 5)
                    | u32::from(rd.enc & 31);
                self.put(word);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// `csel`/`csinc`.
    pub fn csel(
        &mut self,
        id: InstId,
        cond: u32,
        rd: PhysReg,
        rn: PhysReg,
        rm: PhysReg,
    ) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        let op2 = match id {
            InstId::Csel => 0b00,
            InstId::Csinc => 0b01,
            _ => unreachable!(),
        };
        self.put(enc_csel(size, rd.enc, rn.enc, rm.enc, cond, op2));
        Ok(())
    }

    /// `cset rd, cond` (alias of `csinc rd, xzr, xzr, !cond`).
    pub fn cset(&mut self, cond: u32, rd: PhysReg) -> CodegenResult<()> {
        let size = OperandSize::from_bytes(rd.size);
        self.put(enc_csel(size, rd.enc, XZR, XZR, cond ^ 1, 0b01));
        Ok(())
    }

    // -- Loads and stores --------------------------------------------------

    /// The `(size, V, opc)` field for a scaled/unscaled single-register
    /// access; `load` selects the load direction.
    fn ldst_op(
        &self,
        id: InstId,
        reg: PhysReg,
        load: bool,
    ) -> CodegenResult<(u32, u8)> {
        // Returns (op_31_22 without the uimm12 bit, access size in bytes).
        let op = match id {
            InstId::Ldrb | InstId::Strb => (0b00_111_0_00_00 | u32::from(load), 1),
            InstId::Ldrh | InstId::Strh => (0b01_111_0_00_00 | u32::from(load), 2),
            InstId::Ldrsw => (0b10_111_0_00_10, 4),
            _ => match (reg.class, reg.size) {
                (RegClass::Gpr, 8) => (0b11_111_0_00_00 | u32::from(load), 8),
                (RegClass::Gpr, _) => (0b10_111_0_00_00 | u32::from(load), 4),
                (RegClass::Vec, 4) => (0b10_111_1_00_00 | u32::from(load), 4),
                (RegClass::Vec, 8) => (0b11_111_1_00_00 | u32::from(load), 8),
                (RegClass::Vec, 16) => (0b00_111_1_00_10 | u32::from(load), 16),
                _ => {
                    return Err(self.bad_operand("ldst", 0, "unsupported register for load/store"))
                }
            },
        };
        Ok(op)
    }

    /// Single-register load/store choosing among the unsigned-scaled,
    /// unscaled, and register-offset forms.
    pub fn ldst(
        &mut self,
        id: InstId,
        reg: PhysReg,
        mem: &MemOperand,
        load: bool,
    ) -> CodegenResult<()> {
        let name = id.info().name;
        if let Some(label) = mem.label {
            return self.ldr_lit(reg, label);
        }
        let base = self.mem_base(name, mem)?;
        let (op, access) = self.ldst_op(id, reg, load)?;
        if let Some(index) = &mem.index {
            let index = self.reg_enc(name, index)?;
            let scaled = mem.scale != 1;
            if scaled && u32::from(mem.scale) != u32::from(access) {
                return Err(self.bad_operand(name, 1, "scale must match the access size"));
            }
            if mem.disp != 0 {
                return Err(self.bad_operand(name, 1, "register-offset form cannot carry a displacement"));
            }
            self.put(enc_ldst_reg(op, base, index, scaled, reg.enc));
            return Ok(());
        }
        let off = i64::from(mem.disp);
        if let Some(uimm12) = UImm12Scaled::maybe_from_i64(off, access) {
            self.put(enc_ldst_uimm12(op, uimm12, base, reg.enc));
        } else if let Some(simm9) = SImm9::maybe_from_i64(off) {
            self.put(enc_ldst_simm9(op, simm9, 0b00, base, reg.enc));
        } else {
            return Err(CodegenError::InvalidDisplacement {
                disp: off,
                bits: 9,
                offset: self.offset(),
            });
        }
        Ok(())
    }

    /// `ldur`/`stur` (always unscaled).
    pub fn ldst_unscaled(
        &mut self,
        id: InstId,
        reg: PhysReg,
        mem: &MemOperand,
        load: bool,
    ) -> CodegenResult<()> {
        let name = id.info().name;
        let base = self.mem_base(name, mem)?;
        let (op, _) = self.ldst_op(id, reg, load)?;
        let simm9 = SImm9::maybe_from_i64(i64::from(mem.disp)).ok_or(
            CodegenError::InvalidDisplacement {
                disp: i64::from(mem.disp),
                bits: 9,
                offset: self.offset(),
            },
        )?;
        self.put(enc_ldst_simm9(op, simm9, 0b00, base, reg.enc));
        Ok(())
    }

    /// Pre-index store / post-index load of a single register
    /// (`str rt, [rn, #imm]!` / `ldr rt, [rn], #imm`).
    pub fn ldst_pre_post(
        &mut self,
        reg: PhysReg,
        mem: &MemOperand,
        load: bool,
    ) -> CodegenResult<()> {
        let name = if load { "ldr" } else { "str" };
        let base = self.mem_base(name, mem)?;
        let (op, _) = self.ldst_op(InstId::Ldr, reg, load)?;
        let simm9 = SImm9::maybe_from_i64(i64::from(mem.disp)).ok_or(
            CodegenError::InvalidDisplacement {
                disp: i64::from(mem.disp),
                bits: 9,
                offset: self.offset(),
            },
        )?;
        let op_11_10 = if load { 0b01 } else { 0b11 };
        self.put(enc_ldst_simm9(op, simm9, op_11_10, base, reg.enc));
        Ok(())
    }

    /// Register-pair access; the instruction id selects between the
    /// signed-offset, pre-index, and post-index addressing forms.
    pub fn ldst_pair(
        &mut self,
        id: InstId,
        rt: PhysReg,
        rt2: PhysReg,
        mem: &MemOperand,
    ) -> CodegenResult<()> {
        let name = id.info().name;
        let base = self.mem_base(name, mem)?;
        let (load, addr_bits) = match id {
            InstId::Ldp => (true, 0b010),
            InstId::Stp => (false, 0b010),
            InstId::StpPre => (false, 0b011),
            InstId::LdpPost => (true, 0b001),
            _ => unreachable!(),
        };
        let (opc_v, scale) = match (rt.class, rt.size) {
            (RegClass::Gpr, 8) => (0b10_101_0, 8),
            (RegClass::Gpr, _) => (0b00_101_0, 4),
            (RegClass::Vec, 8) => (0b01_101_1, 8),
            (RegClass::Vec, 16) => (0b10_101_1, 16),
            (RegClass::Vec, 4) => (0b00_101_1, 4),
            _ => return Err(self.bad_operand(name, 0, "unsupported pair register")),
        };
        let simm7 = SImm7Scaled::maybe_from_i64(i64::from(mem.disp), scale).ok_or(
            CodegenError::InvalidDisplacement {
                disp: i64::from(mem.disp),
                bits: 7,
                offset: self.offset(),
            },
        )?;
        let op_31_22 = (opc_v << 4) | (addr_bits << 1) | u32::from(load);
        self.put(enc_ldst_pair(op_31_22, simm7, base, rt.enc, rt2.enc));
        Ok(())
    }

    /// PC-relative literal load, resolved by a `Rel19` fixup.
    pub fn ldr_lit(&mut self, rt: PhysReg, target: Label) -> CodegenResult<()> {
        let op_31_24 = match (rt.class, rt.size) {
            (RegClass::Gpr, 8) => 0x58,
            (RegClass::Gpr, _) => 0x18,
            (RegClass::Vec, 4) => 0x1C,
            (RegClass::Vec, 8) => 0x5C,
            (RegClass::Vec, 16) => 0x9C,
            _ => return Err(self.bad_operand("ldr", 0, "unsupported literal register")),
        };
        self.branch_word(FixupKind::Rel19, target, enc_ldst_imm19(op_31_24, 0, rt.enc))
    }

    fn mem_base(&self, inst: &'static str, mem: &MemOperand) -> CodegenResult<u8> {
        match &mem.base {
            Some(base) => self.reg_enc(inst, base),
            None => Err(self.bad_operand(inst, 1, "memory operand needs a base register")),
        }
    }

    fn reg_enc(&self, inst: &'static str, reg: &RegOperand) -> CodegenResult<u8> {
        match reg {
            RegOperand::Phys(p) => Ok(p.enc),
            RegOperand::Virt(v) => {
                Err(self.bad_operand(inst, 1, format!("register {v} is still virtual")))
            }
        }
    }

    // -- Branches ----------------------------------------------------------

    /// `b` (rel26).
    pub fn b(&mut self, target: Label) -> CodegenResult<()> {
        self.branch_word(FixupKind::Rel26, target, enc_jump26(0b000101, 0))
    }

    /// `bl` (rel26).
    pub fn bl(&mut self, target: Label) -> CodegenResult<()> {
        self.branch_word(FixupKind::Rel26, target, enc_jump26(0b100101, 0))
    }

    /// `b.cond` (rel19).
    pub fn b_cond(&mut self, cond: u32, target: Label) -> CodegenResult<()> {
        self.branch_word(FixupKind::Rel19, target, enc_cbr(0b01010100, 0, 0b0, cond))
    }

    /// `cbz`/`cbnz` (rel19).
    pub fn cbz_cbnz(&mut self, is_nz: bool, rt: PhysReg, target: Label) -> CodegenResult<()> {
        let sf = OperandSize::from_bytes(rt.size).sf_bit();
        let op_31_24 = (sf << 7) | 0b0110100 | u32::from(is_nz);
        self.branch_word(FixupKind::Rel19, target, enc_cmpbr(op_31_24, 0, rt.enc))
    }

    /// `tbz`/`tbnz` (rel14).
    pub fn tbz_tbnz(&mut self, is_nz: bool, rt: PhysReg, bit: u8, target: Label) -> CodegenResult<()> {
        if bit >= 64 {
            return Err(self.bad_operand("tbz", 1, "bit number out of range"));
        }
        self.branch_word(FixupKind::Rel14, target, enc_tbr(0, is_nz, bit, 0, rt.enc))
    }

    /// `br`/`blr`/`ret` through a register.
    pub fn br_reg(&mut self, op: u32, rn: PhysReg) -> CodegenResult<()> {
        self.put(enc_br(op, rn.enc));
        Ok(())
    }

    /// `nop`.
    pub fn nop(&mut self) {
        self.put(NOP_WORD);
    }

    /// `brk #imm16`.
    pub fn brk(&mut self, imm: u16) {
        self.put(0xD420_0000 | (u32::from(imm) << 5));
    }

    /// `udf #imm16`, the permanently-undefined encoding.
    pub fn udf(&mut self, imm: u16) {
        self.put(u32::from(imm));
    }

    // -- Floating point ----------------------------------------------------

    /// Scalar FP arithmetic.
    pub fn fp_rrr(&mut self, id: InstId, rd: PhysReg, rn: PhysReg, rm: PhysReg) -> CodegenResult<()> {
        let ty = FpType::from_bytes(rd.size);
        let opcode = match id {
            InstId::Fadd => 0b001010,
            InstId::Fsub => 0b001110,
            InstId::Fmul => 0b000010,
            InstId::Fdiv => 0b000110,
            _ => unreachable!(),
        };
        self.put(enc_fp_rrr(ty, opcode, rd.enc, rn.enc, rm.enc));
        Ok(())
    }

    /// `fmov` between registers: FP-to-FP, or to/from a GPR by class.
    pub fn fmov(&mut self, rd: PhysReg, rn: PhysReg) -> CodegenResult<()> {
        match (rd.class, rn.class) {
            (RegClass::Vec, RegClass::Vec) => {
                let ty = FpType::from_bytes(rd.size);
                self.put(enc_fp_rr(ty, 0b10000, rd.enc, rn.enc));
            }
            (RegClass::Vec, RegClass::Gpr) => {
                let (sf, ty) = if rd.size == 8 {
                    (1, FpType::D)
                } else {
                    (0, FpType::S)
                };
                self.put(enc_int_fp_conv(sf, ty, 0b00111, rd.enc, rn.enc));
            }
            (RegClass::Gpr, RegClass::Vec) => {
                let (sf, ty) = if rn.size == 8 {
                    (1, FpType::D)
                } else {
                    (0, FpType::S)
                };
                self.put(enc_int_fp_conv(sf, ty, 0b00110, rd.enc, rn.enc));
            }
            _ => return Err(self.bad_operand("fmov", 0, "unsupported register combination")),
        }
        Ok(())
    }

    /// `fcmp`.
    pub fn fcmp(&mut self, rn: PhysReg, rm: PhysReg) -> CodegenResult<()> {
        self.put(enc_fcmp(FpType::from_bytes(rn.size), rn.enc, rm.enc));
        Ok(())
    }

    /// Int-to-FP conversions (`scvtf`/`ucvtf`).
    pub fn int_to_fp(&mut self, signed: bool, rd: PhysReg, rn: PhysReg) -> CodegenResult<()> {
        let sf = u32::from(rn.size == 8);
        let ty = FpType::from_bytes(rd.size);
        let opcode = if signed { 0b00010 } else { 0b00011 };
        self.put(enc_int_fp_conv(sf, ty, opcode, rd.enc, rn.enc));
        Ok(())
    }

    /// FP-to-int conversions (`fcvtzs`/`fcvtzu`).
    pub fn fp_to_int(&mut self, signed: bool, rd: PhysReg, rn: PhysReg) -> CodegenResult<()> {
        let sf = u32::from(rd.size == 8);
        let ty = FpType::from_bytes(rn.size);
        let opcode = if signed { 0b11000 } else { 0b11001 };
        self.put(enc_int_fp_conv(sf, ty, opcode, rd.enc, rn.enc));
        Ok(())
    }

    // -- Vector ------------------------------------------------------------

    /// Vector integer add/sub/orr; the arrangement derives from the element
    /// size hint carried in `rd.size` (16 = .4s here).
    pub fn vec_rrr(&mut self, id: InstId, rd: PhysReg, rn: PhysReg, rm: PhysReg) -> CodegenResult<()> {
        let (top11, bits) = match id {
            // add/sub .4s
            InstId::AddV => (0b01001110101, 0b100001),
            InstId::SubV => (0b01101110101, 0b100001),
            // orr .16b, also the canonical vector move
            InstId::OrrV => (0b01001110101, 0b000111),
            _ => unreachable!(),
        };
        self.put(enc_vec_rrr(top11, rm.enc, bits, rn.enc, rd.enc));
        Ok(())
    }

    /// `movi vd.16b, #imm8`.
    pub fn movi_16b(&mut self, rd: PhysReg, imm: u8) -> CodegenResult<()> {
        self.put(enc_movi_16b(rd.enc, imm));
        Ok(())
    }

    /// Align to a multiple of 4 (or more) with NOP words.
    pub fn align_code(&mut self, align: u32) {
        debug_assert!(align.is_power_of_two());
        let align = align.max(4);
        while self.holder.cur_offset() & (align - 1) != 0 {
            self.nop();
        }
    }
}

impl Assembler<'_> {
    /// Dense dispatch from an instruction node to the typed emitters.
    pub fn emit(&mut self, node: &InstNode) -> CodegenResult<()> {
        use Operand as O;
        let Some(id) = InstId::from_u16(node.opcode) else {
            return Err(CodegenError::UnsupportedInstruction {
                inst: "<unknown>",
                shape: format!("opcode {}", node.opcode),
            });
        };
        let name = id.info().name;
        let unsupported = || CodegenError::UnsupportedInstruction {
            inst: name,
            shape: crate::isa::shape_of(&node.operands),
        };
        let ops = &node.operands[..];
        match id {
            InstId::MovZ | InstId::MovN => match ops {
                [O::Phys(rd), O::Imm(imm)] => {
                    let value = if id == InstId::MovN {
                        !(imm.value as u64)
                    } else {
                        imm.value as u64
                    };
                    let c = MoveWideConst::maybe_from_u64(value)
                        .ok_or_else(|| self.bad_operand(name, 1, "not a move-wide immediate"))?;
                    self.mov_wide(id == InstId::MovN, *rd, c)
                }
                _ => Err(unsupported()),
            },
            InstId::MovK => match ops {
                [O::Phys(rd), O::Imm(imm)] => {
                    let c = MoveWideConst::maybe_from_u64(imm.value as u64)
                        .ok_or_else(|| self.bad_operand(name, 1, "not a move-wide immediate"))?;
                    self.movk(*rd, c)
                }
                _ => Err(unsupported()),
            },
            InstId::Mov => match ops {
                [O::Phys(rd), O::Phys(rm)] => self.mov_rr(*rd, *rm),
                [O::Phys(rd), O::Imm(imm)] => self.load_const(*rd, imm.value as u64),
                _ => Err(unsupported()),
            },
            InstId::Add | InstId::Sub | InstId::Adds | InstId::Subs => {
                let is_sub = matches!(id, InstId::Sub | InstId::Subs);
                let set_flags = matches!(id, InstId::Adds | InstId::Subs);
                match ops {
                    [O::Phys(rd), O::Phys(rn), O::Phys(rm)] => {
                        self.add_sub_rrr(is_sub, set_flags, *rd, *rn, *rm)
                    }
                    [O::Phys(rd), O::Phys(rn), O::Imm(imm)] => {
                        if imm.value < 0 {
                            self.add_sub_imm(!is_sub, set_flags, *rd, *rn, imm.value.unsigned_abs())
                        } else {
                            self.add_sub_imm(is_sub, set_flags, *rd, *rn, imm.value as u64)
                        }
                    }
                    _ => Err(unsupported()),
                }
            }
            InstId::Cmp => match ops {
                [O::Phys(rn), O::Phys(rm)] => self.cmp_rr(*rn, *rm),
                [O::Phys(rn), O::Imm(imm)] => self.cmp_ri(*rn, imm.value as u64),
                _ => Err(unsupported()),
            },
            InstId::Cmn => match ops {
                [O::Phys(rn), O::Phys(rm)] => {
                    let size = OperandSize::from_bytes(rn.size);
                    self.put(enc_add_sub_shifted(false, true, size, XZR, rn.enc, rm.enc, 0, 0));
                    Ok(())
                }
                _ => Err(unsupported()),
            },
            InstId::And | InstId::Orr | InstId::Eor | InstId::Ands => {
                let op = match id {
                    InstId::And => LogicalOp::And,
                    InstId::Orr => LogicalOp::Orr,
                    InstId::Eor => LogicalOp::Eor,
                    InstId::Ands => LogicalOp::Ands,
                    _ => unreachable!(),
                };
                match ops {
                    [O::Phys(rd), O::Phys(rn), O::Phys(rm)] => self.logical_rrr(op, *rd, *rn, *rm),
                    [O::Phys(rd), O::Phys(rn), O::Imm(imm)] => {
                        self.logical_ri(op, *rd, *rn, imm.value as u64)
                    }
                    _ => Err(unsupported()),
                }
            }
            InstId::Madd | InstId::Msub => match ops {
                [O::Phys(rd), O::Phys(rn), O::Phys(rm), O::Phys(ra)] => {
                    self.madd_msub(id == InstId::Msub, *rd, *rn, *rm, ra.enc)
                }
                _ => Err(unsupported()),
            },
            InstId::Mul => match ops {
                [O::Phys(rd), O::Phys(rn), O::Phys(rm)] => {
                    self.madd_msub(false, *rd, *rn, *rm, XZR)
                }
                _ => Err(unsupported()),
            },
            InstId::Sdiv | InstId::Udiv => match ops {
                [O::Phys(rd), O::Phys(rn), O::Phys(rm)] => {
                    self.div(id == InstId::Sdiv, *rd, *rn, *rm)
                }
                _ => Err(unsupported()),
            },
            InstId::Lsl | InstId::Lsr | InstId::Asr | InstId::Ror => match ops {
                [O::Phys(rd), O::Phys(rn), O::Phys(rm)] => self.shift_rrr(id, *rd, *rn, *rm),
                [O::Phys(rd), O::Phys(rn), O::Imm(imm)] => {
                    self.shift_ri(id, *rd, *rn, imm.value as u64)
                }
                _ => Err(unsupported()),
            },
            InstId::Csel | InstId::Csinc => match ops {
                [O::Phys(rd), O::Phys(rn), O::Phys(rm)] => {
                    let cond = self.need_cond(name, node.options.cond)?;
                    self.csel(id, cond, *rd, *rn, *rm)
                }
                _ => Err(unsupported()),
            },
            InstId::Cset => match ops {
                [O::Phys(rd)] => {
                    let cond = self.need_cond(name, node.options.cond)?;
                    self.cset(cond, *rd)
                }
                _ => Err(unsupported()),
            },
            InstId::Ldr | InstId::Ldrb | InstId::Ldrh | InstId::Ldrsw => match ops {
                [O::Phys(rt), O::Mem(mem)] => self.ldst(id, *rt, mem, true),
                [O::Phys(rt), O::Label(l)] => self.ldr_lit(*rt, *l),
                _ => Err(unsupported()),
            },
            InstId::Str | InstId::Strb | InstId::Strh => match ops {
                [O::Phys(rt), O::Mem(mem)] | [O::Mem(mem), O::Phys(rt)] => {
                    self.ldst(id, *rt, mem, false)
                }
                _ => Err(unsupported()),
            },
            InstId::Ldur => match ops {
                [O::Phys(rt), O::Mem(mem)] => self.ldst_unscaled(id, *rt, mem, true),
                _ => Err(unsupported()),
            },
            InstId::Stur => match ops {
                [O::Phys(rt), O::Mem(mem)] | [O::Mem(mem), O::Phys(rt)] => {
                    self.ldst_unscaled(id, *rt, mem, false)
                }
                _ => Err(unsupported()),
            },
            InstId::Ldp | InstId::Stp | InstId::StpPre | InstId::LdpPost => match ops {
                [O::Phys(rt), O::Phys(rt2), O::Mem(mem)] => self.ldst_pair(id, *rt, *rt2, mem),
                _ => Err(unsupported()),
            },
            InstId::StrPre => match ops {
                [O::Phys(rt), O::Mem(mem)] => self.ldst_pre_post(*rt, mem, false),
                _ => Err(unsupported()),
            },
            InstId::LdrPost => match ops {
                [O::Phys(rt), O::Mem(mem)] => self.ldst_pre_post(*rt, mem, true),
                _ => Err(unsupported()),
            },
            InstId::LdrLit => match ops {
                [O::Phys(rt), O::Label(l)] => self.ldr_lit(*rt, *l),
                _ => Err(unsupported()),
            },
            InstId::B => match ops {
                [O::Label(l)] => self.b(*l),
                _ => Err(unsupported()),
            },
            InstId::Bl => match ops {
                [O::Label(l)] => self.bl(*l),
                _ => Err(unsupported()),
            },
            InstId::Bcond => match ops {
                [O::Label(l)] => {
                    let cond = self.need_cond(name, node.options.cond)?;
                    self.b_cond(cond, *l)
                }
                _ => Err(unsupported()),
            },
            InstId::Cbz | InstId::Cbnz => match ops {
                [O::Phys(rt), O::Label(l)] => self.cbz_cbnz(id == InstId::Cbnz, *rt, *l),
                _ => Err(unsupported()),
            },
            InstId::Tbz | InstId::Tbnz => match ops {
                [O::Phys(rt), O::Imm(bit), O::Label(l)] => {
                    let bit = u8::try_from(bit.value)
                        .map_err(|_| self.bad_operand(name, 1, "bad bit number"))?;
                    self.tbz_tbnz(id == InstId::Tbnz, *rt, bit, *l)
                }
                _ => Err(unsupported()),
            },
            InstId::Br => match ops {
                [O::Phys(rn)] => self.br_reg(0b00, *rn),
                _ => Err(unsupported()),
            },
            InstId::Blr => match ops {
                [O::Phys(rn)] => self.br_reg(0b01, *rn),
                _ => Err(unsupported()),
            },
            InstId::Ret => match ops {
                [] => self.br_reg(0b10, regs::xreg(regs::LR)),
                [O::Phys(rn)] => self.br_reg(0b10, *rn),
                _ => Err(unsupported()),
            },
            InstId::Nop => {
                self.nop();
                Ok(())
            }
            InstId::Brk => match ops {
                [] => {
                    self.brk(0);
                    Ok(())
                }
                [O::Imm(imm)] => {
                    self.brk(imm.value as u16);
                    Ok(())
                }
                _ => Err(unsupported()),
            },
            InstId::Udf => {
                self.udf(0);
                Ok(())
            }
            InstId::Fmov => match ops {
                [O::Phys(rd), O::Phys(rn)] => self.fmov(*rd, *rn),
                _ => Err(unsupported()),
            },
            InstId::Fadd | InstId::Fsub | InstId::Fmul | InstId::Fdiv => match ops {
                [O::Phys(rd), O::Phys(rn), O::Phys(rm)] => self.fp_rrr(id, *rd, *rn, *rm),
                _ => Err(unsupported()),
            },
            InstId::Fcmp => match ops {
                [O::Phys(rn), O::Phys(rm)] => self.fcmp(*rn, *rm),
                _ => Err(unsupported()),
            },
            InstId::Scvtf | InstId::Ucvtf => match ops {
                [O::Phys(rd), O::Phys(rn)] => self.int_to_fp(id == InstId::Scvtf, *rd, *rn),
                _ => Err(unsupported()),
            },
            InstId::Fcvtzs | InstId::Fcvtzu => match ops {
                [O::Phys(rd), O::Phys(rn)] => self.fp_to_int(id == InstId::Fcvtzs, *rd, *rn),
                _ => Err(unsupported()),
            },
            InstId::AddV | InstId::SubV | InstId::OrrV => match ops {
                [O::Phys(rd), O::Phys(rn), O::Phys(rm)] => self.vec_rrr(id, *rd, *rn, *rm),
                _ => Err(unsupported()),
            },
            InstId::Movi => match ops {
                [O::Phys(rd), O::Imm(imm)] => {
                    let imm = u8::try_from(imm.value)
                        .map_err(|_| self.bad_operand(name, 1, "movi immediate must be a byte"))?;
                    self.movi_16b(*rd, imm)
                }
                _ => Err(unsupported()),
            },
        }
    }
}
