//! The x64 assembler: typed emitters over a code holder, plus the dense
//! dispatch from instruction nodes.

use super::encode::{emit_modrm_sib_disp, emit_nops, modrm_reg, Amode};
use super::evex::{Evex, EvexRm};
use super::inst::InstId;
use super::regs;
use super::rex::RexFlags;
use super::vex::{map, pp, Vex};
use crate::buffer::CodeOffset;
use crate::env::Arch;
use crate::features::CpuFeature;
use crate::holder::CodeHolder;
use crate::ir::{Cond, ImmOperand, InstNode, MemOperand, Operand, PhysReg, RegClass};
use crate::labels::{FixupKind, Label};
use crate::result::{CodegenError, CodegenResult};

/// Binary ALU operations sharing the `00..3D` opcode family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// Base opcode of the `r/m, r` form.
    fn base(self) -> u8 {
        match self {
            Self::Add => 0x00,
            Self::Or => 0x08,
            Self::Adc => 0x10,
            Self::Sbb => 0x18,
            Self::And => 0x20,
            Self::Sub => 0x28,
            Self::Xor => 0x30,
            Self::Cmp => 0x38,
        }
    }

    /// The `/n` digit of the `81/83` immediate forms.
    fn digit(self) -> u8 {
        (self.base() >> 3) & 7
    }
}

/// Unary `F7`-family operations.
#[derive(Clone, Copy, Debug)]
pub enum UnaryOp {
    Not,
    Neg,
    Mul,
    Imul,
    Div,
    Idiv,
}

impl UnaryOp {
    fn digit(self) -> u8 {
        match self {
            Self::Not => 2,
            Self::Neg => 3,
            Self::Mul => 4,
            Self::Imul => 5,
            Self::Div => 6,
            Self::Idiv => 7,
        }
    }
}

/// Shift and rotate operations of the `C1/D3` family.
#[derive(Clone, Copy, Debug)]
pub enum ShiftOp {
    Rol,
    Ror,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    fn digit(self) -> u8 {
        match self {
            Self::Rol => 0,
            Self::Ror => 1,
            Self::Shl => 4,
            Self::Shr => 5,
            Self::Sar => 7,
        }
    }
}

/// Map an IR condition to the x86 `cc` nibble.
fn cc_enc(cond: Cond) -> u8 {
    match cond {
        Cond::Overflow => 0x0,
        Cond::NotOverflow => 0x1,
        Cond::UnsignedLt => 0x2,
        Cond::UnsignedGe => 0x3,
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::UnsignedLe => 0x6,
        Cond::UnsignedGt => 0x7,
        Cond::Sign => 0x8,
        Cond::NotSign => 0x9,
        Cond::Parity => 0xA,
        Cond::NotParity => 0xB,
        Cond::SignedLt => 0xC,
        Cond::SignedGe => 0xD,
        Cond::SignedLe => 0xE,
        Cond::SignedGt => 0xF,
    }
}

/// The x64 assembler. A thin layer over the encoder that also records label
/// fixups and performs short-vs-near branch selection.
pub struct Assembler<'a> {
    holder: &'a mut CodeHolder,
}

impl<'a> Assembler<'a> {
    /// Wrap a holder whose environment targets x86-64.
    pub fn new(holder: &'a mut CodeHolder) -> Self {
        assert_eq!(holder.env().arch, Arch::X64);
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

    /// Adjust an 8-bit register for REX interaction: high-byte registers
    /// forbid REX and encode as 4..=7; SPL/BPL/SIL/DIL force REX.
    fn fix_byte_reg(enc: u8, size: u8, rex: &mut RexFlags) -> u8 {
        if size != 1 {
            return enc;
        }
        if regs::is_high_byte(enc) {
            rex.forbid();
            enc - regs::AH + 4
        } else {
            rex.require_for_byte_reg(enc);
            enc
        }
    }

    /// Refuse encodings that would need a REX prefix alongside a high-byte
    /// register.
    fn check_rex(
        &self,
        rex: RexFlags,
        inst: &'static str,
        enc_g: u8,
        enc_index: u8,
        enc_b: u8,
    ) -> CodegenResult<()> {
        if rex.is_forbidden() && rex.would_emit(enc_g, enc_index, enc_b) {
            return Err(CodegenError::IncompatibleOperands {
                inst,
                offset: self.offset(),
                message: "high-byte register cannot be combined with a REX prefix".to_string(),
            });
        }
        Ok(())
    }

    fn size_prefix(&mut self, size: u8) {
        if size == 2 {
            self.holder.put1(0x66);
        }
    }

    /// Core `op r/m, r` / `op r, r/m` register-direct emitter. `enc_e` is
    /// the `rm` operand, `enc_g` the `reg` operand.
    fn op_rr(
        &mut self,
        inst: &'static str,
        size: u8,
        opcode: &[u8],
        enc_g: u8,
        enc_e: u8,
    ) -> CodegenResult<()> {
        self.size_prefix(size);
        let mut rex = RexFlags::from_size(size);
        let enc_g = Self::fix_byte_reg(enc_g, size, &mut rex);
        let enc_e = Self::fix_byte_reg(enc_e, size, &mut rex);
        self.check_rex(rex, inst, enc_g, 0, enc_e)?;
        rex.emit_for(self.holder, enc_g, 0, enc_e);
        self.holder.put_bytes(opcode);
        self.holder.put1(modrm_reg(enc_g, enc_e));
        Ok(())
    }

    /// Like [`op_rr`](Self::op_rr) but with an opcode digit in the reg
    /// field; the digit never participates in byte-register REX rules.
    fn op_digit_r(
        &mut self,
        inst: &'static str,
        size: u8,
        opcode: &[u8],
        digit: u8,
        enc_e: u8,
    ) -> CodegenResult<()> {
        debug_assert!(digit < 8);
        self.size_prefix(size);
        let mut rex = RexFlags::from_size(size);
        let enc_e = Self::fix_byte_reg(enc_e, size, &mut rex);
        self.check_rex(rex, inst, 0, 0, enc_e)?;
        rex.emit_for(self.holder, 0, 0, enc_e);
        self.holder.put_bytes(opcode);
        self.holder.put1(modrm_reg(digit, enc_e));
        Ok(())
    }

    /// Digit-form emitter with a memory rm operand.
    fn op_digit_m(
        &mut self,
        inst: &'static str,
        size: u8,
        opcode: &[u8],
        digit: u8,
        mem: &MemOperand,
        bytes_at_end: u8,
    ) -> CodegenResult<()> {
        debug_assert!(digit < 8);
        let amode = Amode::from_mem(mem, inst, self.offset())?;
        self.size_prefix(size);
        let rex = RexFlags::from_size(size);
        amode.emit_rex_prefix(rex, digit, self.holder);
        self.holder.put_bytes(opcode);
        emit_modrm_sib_disp(self.holder, digit, &amode, bytes_at_end, None)
    }

    /// Core `op r/m(mem), reg` emitter.
    fn op_rm(
        &mut self,
        inst: &'static str,
        size: u8,
        opcode: &[u8],
        enc_g: u8,
        mem: &MemOperand,
        bytes_at_end: u8,
    ) -> CodegenResult<()> {
        let amode = Amode::from_mem(mem, inst, self.offset())?;
        self.size_prefix(size);
        let mut rex = RexFlags::from_size(size);
        let enc_g = Self::fix_byte_reg(enc_g, size, &mut rex);
        let (b, x) = amode.bx_encs();
        self.check_rex(rex, inst, enc_g, x.unwrap_or(0), b.unwrap_or(0))?;
        amode.emit_rex_prefix(rex, enc_g, self.holder);
        self.holder.put_bytes(opcode);
        emit_modrm_sib_disp(self.holder, enc_g, &amode, bytes_at_end, None)
    }

    // -- Data movement -----------------------------------------------------

    /// `mov reg, reg`; both operands must have the same size.
    pub fn mov_rr(&mut self, dst: PhysReg, src: PhysReg) -> CodegenResult<()> {
        self.check_sizes("mov", dst, src)?;
        let op: &[u8] = if dst.size == 1 { &[0x88] } else { &[0x89] };
        self.op_rr("mov", dst.size, op, src.enc, dst.enc)
    }

    /// `mov reg, [mem]`.
    pub fn mov_rm(&mut self, dst: PhysReg, mem: &MemOperand) -> CodegenResult<()> {
        let op: &[u8] = if dst.size == 1 { &[0x8A] } else { &[0x8B] };
        self.op_rm("mov", dst.size, op, dst.enc, mem, 0)
    }

    /// `mov [mem], reg`.
    pub fn mov_mr(&mut self, mem: &MemOperand, src: PhysReg) -> CodegenResult<()> {
        let op: &[u8] = if src.size == 1 { &[0x88] } else { &[0x89] };
        self.op_rm("mov", src.size, op, src.enc, mem, 0)
    }

    /// `mov reg, imm`, choosing the shortest legal form; a 64-bit move of a
    /// value outside the i32 range becomes `movabs`.
    pub fn mov_ri(&mut self, dst: PhysReg, imm: i64) -> CodegenResult<()> {
        match dst.size {
            8 => {
                if let Ok(imm32) = i32::try_from(imm) {
                    // REX.W C7 /0 id, sign-extended.
                    let mut rex = RexFlags::w64();
                    let enc = Self::fix_byte_reg(dst.enc, dst.size, &mut rex);
                    rex.emit_for(self.holder, 0, 0, enc);
                    self.holder.put1(0xC7);
                    self.holder.put1(modrm_reg(0, enc));
                    self.holder.put4(imm32 as u32);
                    Ok(())
                } else {
                    self.movabs(dst, imm as u64)
                }
            }
            4 | 2 => {
                self.size_prefix(dst.size);
                let rex = RexFlags::w_default();
                rex.emit_for(self.holder, 0, 0, dst.enc);
                self.holder.put1(0xB8 | (dst.enc & 7));
                if dst.size == 2 {
                    self.holder.put2(imm as u16);
                } else {
                    self.holder.put4(imm as u32);
                }
                Ok(())
            }
            1 => {
                let mut rex = RexFlags::w_default();
                let enc = Self::fix_byte_reg(dst.enc, 1, &mut rex);
                self.check_rex(rex, "mov", 0, 0, enc)?;
                rex.emit_for(self.holder, 0, 0, enc);
                self.holder.put1(0xB0 | (enc & 7));
                self.holder.put1(imm as u8);
                Ok(())
            }
            s => Err(self.bad_operand("mov", 0, format!("bad register size {s}"))),
        }
    }

    /// `movabs reg64, imm64`.
    pub fn movabs(&mut self, dst: PhysReg, imm: u64) -> CodegenResult<()> {
        if dst.size != 8 {
            return Err(self.bad_operand("movabs", 0, "destination must be 64-bit"));
        }
        RexFlags::w64().emit_for(self.holder, 0, 0, dst.enc);
        self.holder.put1(0xB8 | (dst.enc & 7));
        self.holder.put8(imm);
        Ok(())
    }

    /// `mov [mem], imm32` (sign-extended for 64-bit accesses).
    pub fn mov_mi(&mut self, mem: &MemOperand, imm: i32) -> CodegenResult<()> {
        let (op, imm_len): (&[u8], u8) = if mem.size == 1 {
            (&[0xC6], 1)
        } else if mem.size == 2 {
            (&[0xC7], 2)
        } else {
            (&[0xC7], 4)
        };
        self.op_digit_m("mov", mem.size, op, 0, mem, imm_len)?;
        match imm_len {
            1 => self.holder.put1(imm as u8),
            2 => self.holder.put2(imm as u16),
            _ => self.holder.put4(imm as u32),
        }
        Ok(())
    }

    /// `movzx`/`movsx` from an 8- or 16-bit register, and `movsxd` from a
    /// 32-bit register.
    pub fn movx_rr(&mut self, id: InstId, dst: PhysReg, src: PhysReg) -> CodegenResult<()> {
        let (name, opcode, src_size): (&'static str, &[u8], u8) = match id {
            InstId::Movzx8 => ("movzx", &[0x0F, 0xB6], 1),
            InstId::Movzx16 => ("movzx", &[0x0F, 0xB7], 2),
            InstId::Movsx8 => ("movsx", &[0x0F, 0xBE], 1),
            InstId::Movsx16 => ("movsx", &[0x0F, 0xBF], 2),
            InstId::Movsxd => ("movsxd", &[0x63], 4),
            _ => unreachable!(),
        };
        if src.size != src_size {
            return Err(self.bad_operand(name, 1, format!("source must be {src_size} bytes")));
        }
        self.size_prefix(dst.size);
        let mut rex = RexFlags::from_size(dst.size);
        let enc_e = Self::fix_byte_reg(src.enc, src.size, &mut rex);
        self.check_rex(rex, name, dst.enc, 0, enc_e)?;
        rex.emit_for(self.holder, dst.enc, 0, enc_e);
        self.holder.put_bytes(opcode);
        self.holder.put1(modrm_reg(dst.enc, enc_e));
        Ok(())
    }

    /// `lea reg, [mem]`.
    pub fn lea(&mut self, dst: PhysReg, mem: &MemOperand) -> CodegenResult<()> {
        self.op_rm("lea", dst.size, &[0x8D], dst.enc, mem, 0)
    }

    // -- ALU ---------------------------------------------------------------

    fn check_sizes(&self, inst: &'static str, a: PhysReg, b: PhysReg) -> CodegenResult<()> {
        let logical = |r: PhysReg| if regs::is_high_byte(r.enc) { 1 } else { r.size };
        if logical(a) != logical(b) {
            return Err(CodegenError::IncompatibleOperands {
                inst,
                offset: self.offset(),
                message: format!("operand sizes {} and {} differ", a.size, b.size),
            });
        }
        Ok(())
    }

    /// `op reg, reg` (the `r/m, r` form, so `mov rax, rcx` is `48 89 C8`).
    pub fn alu_rr(&mut self, op: AluOp, dst: PhysReg, src: PhysReg) -> CodegenResult<()> {
        self.check_sizes("alu", dst, src)?;
        let opcode = op.base() + u8::from(dst.size != 1);
        self.op_rr("alu", dst.size, &[opcode], src.enc, dst.enc)
    }

    /// `op reg, [mem]`.
    pub fn alu_rm(&mut self, op: AluOp, dst: PhysReg, mem: &MemOperand) -> CodegenResult<()> {
        let opcode = op.base() + 2 + u8::from(dst.size != 1);
        self.op_rm("alu", dst.size, &[opcode], dst.enc, mem, 0)
    }

    /// `op [mem], reg`.
    pub fn alu_mr(&mut self, op: AluOp, mem: &MemOperand, src: PhysReg) -> CodegenResult<()> {
        let opcode = op.base() + u8::from(src.size != 1);
        self.op_rm("alu", src.size, &[opcode], src.enc, mem, 0)
    }

    /// `op reg, imm`, preferring the sign-extended imm8 form. A width hint
    /// of 1 forces imm8 (failing if out of range); 4 forces imm32.
    pub fn alu_ri(&mut self, op: AluOp, dst: PhysReg, imm: ImmOperand) -> CodegenResult<()> {
        let value = imm.value;
        if dst.size == 1 {
            let imm8 = i8::try_from(value)
                .map_err(|_| self.bad_operand("alu", 1, "immediate does not fit in 8 bits"))?;
            self.op_digit_r("alu", 1, &[0x80], op.digit(), dst.enc)?;
            self.holder.put1(imm8 as u8);
            return Ok(());
        }
        let fits8 = i8::try_from(value).is_ok();
        let use8 = match imm.width {
            Some(1) => {
                if !fits8 {
                    return Err(self.bad_operand("alu", 1, "immediate does not fit in 8 bits"));
                }
                true
            }
            Some(_) => false,
            None => fits8,
        };
        if use8 {
            self.op_digit_r("alu", dst.size, &[0x83], op.digit(), dst.enc)?;
            self.holder.put1(value as i8 as u8);
        } else {
            if i32::try_from(value).is_err() {
                return Err(self.bad_operand("alu", 1, "immediate does not fit in 32 bits"));
            }
            self.op_digit_r("alu", dst.size, &[0x81], op.digit(), dst.enc)?;
            if dst.size == 2 {
                self.holder.put2(value as u16);
            } else {
                self.holder.put4(value as u32);
            }
        }
        Ok(())
    }

    /// `op [mem], imm`.
    pub fn alu_mi(&mut self, op: AluOp, mem: &MemOperand, imm: ImmOperand) -> CodegenResult<()> {
        let value = imm.value;
        let fits8 = i8::try_from(value).is_ok();
        if mem.size == 1 {
            self.op_digit_m("alu", 1, &[0x80], op.digit(), mem, 1)?;
            self.holder.put1(value as u8);
        } else if fits8 && imm.width != Some(4) {
            self.op_digit_m("alu", mem.size, &[0x83], op.digit(), mem, 1)?;
            self.holder.put1(value as i8 as u8);
        } else {
            let imm_len = if mem.size == 2 { 2 } else { 4 };
            self.op_digit_m("alu", mem.size, &[0x81], op.digit(), mem, imm_len)?;
            if mem.size == 2 {
                self.holder.put2(value as u16);
            } else {
                self.holder.put4(value as u32);
            }
        }
        Ok(())
    }

    /// `test reg, reg`.
    pub fn test_rr(&mut self, a: PhysReg, b: PhysReg) -> CodegenResult<()> {
        self.check_sizes("test", a, b)?;
        let op: &[u8] = if a.size == 1 { &[0x84] } else { &[0x85] };
        self.op_rr("test", a.size, op, b.enc, a.enc)
    }

    /// `test reg, imm`.
    pub fn test_ri(&mut self, reg: PhysReg, imm: i32) -> CodegenResult<()> {
        let op: &[u8] = if reg.size == 1 { &[0xF6] } else { &[0xF7] };
        self.op_digit_r("test", reg.size, op, 0, reg.enc)?;
        match reg.size {
            1 => self.holder.put1(imm as u8),
            2 => self.holder.put2(imm as u16),
            _ => self.holder.put4(imm as u32),
        }
        Ok(())
    }

    /// Unary `F7`-family op on a register (`not`, `neg`, `mul`, `div`, ...).
    pub fn unary_r(&mut self, op: UnaryOp, reg: PhysReg) -> CodegenResult<()> {
        let opcode: &[u8] = if reg.size == 1 { &[0xF6] } else { &[0xF7] };
        self.op_digit_r("unary", reg.size, opcode, op.digit(), reg.enc)
    }

    /// `imul reg, reg` (two-operand form).
    pub fn imul_rr(&mut self, dst: PhysReg, src: PhysReg) -> CodegenResult<()> {
        self.check_sizes("imul", dst, src)?;
        self.op_rr("imul", dst.size, &[0x0F, 0xAF], dst.enc, src.enc)
    }

    /// `imul reg, reg, imm` (three-operand form).
    pub fn imul_rri(&mut self, dst: PhysReg, src: PhysReg, imm: i32) -> CodegenResult<()> {
        self.check_sizes("imul", dst, src)?;
        if let Ok(imm8) = i8::try_from(imm) {
            self.op_rr("imul", dst.size, &[0x6B], dst.enc, src.enc)?;
            self.holder.put1(imm8 as u8);
        } else {
            self.op_rr("imul", dst.size, &[0x69], dst.enc, src.enc)?;
            if dst.size == 2 {
                self.holder.put2(imm as u16);
            } else {
                self.holder.put4(imm as u32);
            }
        }
        Ok(())
    }

    /// `cdq` (32-bit) or `cqo` (64-bit) sign extension into (R)DX.
    pub fn cdq_cqo(&mut self, size: u8) -> CodegenResult<()> {
        if size == 8 {
            RexFlags::w64().emit_for(self.holder, 0, 0, 0);
        }
        self.holder.put1(0x99);
        Ok(())
    }

    /// Shift or rotate by an immediate count; count 1 uses the short form.
    pub fn shift_ri(&mut self, op: ShiftOp, dst: PhysReg, count: u8) -> CodegenResult<()> {
        let one_form: &[u8] = if dst.size == 1 { &[0xD0] } else { &[0xD1] };
        let imm_form: &[u8] = if dst.size == 1 { &[0xC0] } else { &[0xC1] };
        if count == 1 {
            self.op_digit_r("shift", dst.size, one_form, op.digit(), dst.enc)
        } else {
            self.op_digit_r("shift", dst.size, imm_form, op.digit(), dst.enc)?;
            self.holder.put1(count);
            Ok(())
        }
    }

    /// Shift or rotate by the count in CL.
    pub fn shift_rcl(&mut self, op: ShiftOp, dst: PhysReg) -> CodegenResult<()> {
        let opcode: &[u8] = if dst.size == 1 { &[0xD2] } else { &[0xD3] };
        self.op_digit_r("shift", dst.size, opcode, op.digit(), dst.enc)
    }

    // -- Stack and control flow --------------------------------------------

    /// `push reg64`. Operand size defaults to 64 bits; no REX.W needed.
    pub fn push_r(&mut self, reg: PhysReg) -> CodegenResult<()> {
        RexFlags::w_default().emit_for(self.holder, 0, 0, reg.enc);
        self.holder.put1(0x50 | (reg.enc & 7));
        Ok(())
    }

    /// `pop reg64`.
    pub fn pop_r(&mut self, reg: PhysReg) -> CodegenResult<()> {
        RexFlags::w_default().emit_for(self.holder, 0, 0, reg.enc);
        self.holder.put1(0x58 | (reg.enc & 7));
        Ok(())
    }

    /// `push imm`.
    pub fn push_i(&mut self, imm: i32) -> CodegenResult<()> {
        if let Ok(imm8) = i8::try_from(imm) {
            self.holder.put1(0x6A);
            self.holder.put1(imm8 as u8);
        } else {
            self.holder.put1(0x68);
            self.holder.put4(imm as u32);
        }
        Ok(())
    }

    /// `call rel32` to a label.
    pub fn call_label(&mut self, target: Label) -> CodegenResult<()> {
        self.holder.put1(0xE8);
        let at = self.holder.cur_offset();
        self.holder.put4(0);
        self.holder.record_fixup(FixupKind::PcRel32, at, at + 4, target, 0)
    }

    /// `call reg`.
    pub fn call_r(&mut self, reg: PhysReg) -> CodegenResult<()> {
        RexFlags::w_default().emit_for(self.holder, 0, 0, reg.enc);
        self.holder.put1(0xFF);
        self.holder.put1(modrm_reg(2, reg.enc));
        Ok(())
    }

    /// `ret`.
    pub fn ret(&mut self) -> CodegenResult<()> {
        self.holder.put1(0xC3);
        Ok(())
    }

    /// Whether a short branch to `target` from an instruction of
    /// `short_len` bytes starting at the current offset is known to fit.
    fn short_branch_fits(&self, target: Label, short_len: u32) -> bool {
        match self.holder.label_offset(target) {
            Some((section, offset)) if section == self.holder.cur_section() => {
                let disp = i64::from(offset) - (i64::from(self.offset()) + i64::from(short_len));
                i8::try_from(disp).is_ok()
            }
            _ => false,
        }
    }

    /// `jmp` to a label: rel8 when the bound target fits (or is forced),
    /// rel32 otherwise.
    pub fn jmp_label(&mut self, target: Label, force_short: bool) -> CodegenResult<()> {
        if force_short || self.short_branch_fits(target, 2) {
            self.holder.put1(0xEB);
            let at = self.holder.cur_offset();
            self.holder.put1(0);
            self.holder.record_fixup(FixupKind::PcRel8, at, at + 1, target, 0)
        } else {
            self.holder.put1(0xE9);
            let at = self.holder.cur_offset();
            self.holder.put4(0);
            self.holder.record_fixup(FixupKind::PcRel32, at, at + 4, target, 0)
        }
    }

    /// `jmp reg`.
    pub fn jmp_r(&mut self, reg: PhysReg) -> CodegenResult<()> {
        RexFlags::w_default().emit_for(self.holder, 0, 0, reg.enc);
        self.holder.put1(0xFF);
        self.holder.put1(modrm_reg(4, reg.enc));
        Ok(())
    }

    /// Conditional branch to a label.
    pub fn jcc(&mut self, cond: Cond, target: Label, force_short: bool) -> CodegenResult<()> {
        let cc = cc_enc(cond);
        if force_short || self.short_branch_fits(target, 2) {
            self.holder.put1(0x70 | cc);
            let at = self.holder.cur_offset();
            self.holder.put1(0);
            self.holder.record_fixup(FixupKind::PcRel8, at, at + 1, target, 0)
        } else {
            self.holder.put1(0x0F);
            self.holder.put1(0x80 | cc);
            let at = self.holder.cur_offset();
            self.holder.put4(0);
            self.holder.record_fixup(FixupKind::PcRel32, at, at + 4, target, 0)
        }
    }

    /// `setcc reg8`.
    pub fn setcc(&mut self, cond: Cond, dst: PhysReg) -> CodegenResult<()> {
        if dst.size != 1 {
            return Err(self.bad_operand("setcc", 0, "destination must be a byte register"));
        }
        self.op_digit_r("setcc", 1, &[0x0F, 0x90 | cc_enc(cond)], 0, dst.enc)
    }

    /// `cmovcc reg, reg`.
    pub fn cmovcc(&mut self, cond: Cond, dst: PhysReg, src: PhysReg) -> CodegenResult<()> {
        self.check_sizes("cmovcc", dst, src)?;
        self.op_rr("cmovcc", dst.size, &[0x0F, 0x40 | cc_enc(cond)], dst.enc, src.enc)
    }

    /// Emit `len` bytes of canonical NOPs.
    pub fn nop(&mut self, len: usize) {
        emit_nops(self.holder, len);
    }

    /// `int3`.
    pub fn int3(&mut self) {
        self.holder.put1(0xCC);
    }

    /// `ud2`.
    pub fn ud2(&mut self) {
        self.holder.put_bytes(&[0x0F, 0x0B]);
    }

    // -- SSE ---------------------------------------------------------------

    /// Core legacy-SSE emitter, register-direct. The mandatory prefix (66,
    /// F2, F3) precedes REX; `enc_g` is the reg field, `enc_e` the rm.
    fn sse_rr(
        &mut self,
        prefix: Option<u8>,
        opcode: &[u8],
        enc_g: u8,
        enc_e: u8,
        w: bool,
    ) -> CodegenResult<()> {
        if let Some(prefix) = prefix {
            self.holder.put1(prefix);
        }
        let rex = if w { RexFlags::w64() } else { RexFlags::w_default() };
        rex.emit_for(self.holder, enc_g, 0, enc_e);
        self.holder.put_bytes(opcode);
        self.holder.put1(modrm_reg(enc_g, enc_e));
        Ok(())
    }

    /// Core legacy-SSE emitter with a memory rm operand.
    fn sse_rm(
        &mut self,
        inst: &'static str,
        prefix: Option<u8>,
        opcode: &[u8],
        enc_g: u8,
        mem: &MemOperand,
        w: bool,
    ) -> CodegenResult<()> {
        let amode = Amode::from_mem(mem, inst, self.offset())?;
        if let Some(prefix) = prefix {
            self.holder.put1(prefix);
        }
        let rex = if w { RexFlags::w64() } else { RexFlags::w_default() };
        amode.emit_rex_prefix(rex, enc_g, self.holder);
        self.holder.put_bytes(opcode);
        emit_modrm_sib_disp(self.holder, enc_g, &amode, 0, None)
    }

    /// An SSE op with an XMM destination in the reg field and an XMM or
    /// memory source, e.g. `addss xmm, xmm/m32`.
    pub fn sse_op(
        &mut self,
        inst: &'static str,
        prefix: Option<u8>,
        opcode: &[u8],
        dst: PhysReg,
        src: &Operand,
    ) -> CodegenResult<()> {
        match src {
            Operand::Phys(src) => self.sse_rr(prefix, opcode, dst.enc, src.enc, false),
            Operand::Mem(mem) => self.sse_rm(inst, prefix, opcode, dst.enc, mem, false),
            _ => Err(self.bad_operand(inst, 1, "expected register or memory")),
        }
    }

    /// `movd`/`movq` between a GPR and an XMM register; direction follows
    /// the operand classes.
    pub fn movd_movq(&mut self, dst: PhysReg, src: PhysReg, w: bool) -> CodegenResult<()> {
        match (dst.class, src.class) {
            (RegClass::Vec, RegClass::Gpr) => {
                self.sse_rr(Some(0x66), &[0x0F, 0x6E], dst.enc, src.enc, w)
            }
            (RegClass::Gpr, RegClass::Vec) => {
                self.sse_rr(Some(0x66), &[0x0F, 0x7E], src.enc, dst.enc, w)
            }
            _ => Err(self.bad_operand("movd", 0, "needs one GPR and one XMM operand")),
        }
    }

    /// `cvtsi2ss`/`cvtsi2sd`: GPR (or memory) source into an XMM register.
    pub fn cvtsi2(&mut self, prefix: u8, dst: PhysReg, src: PhysReg) -> CodegenResult<()> {
        self.sse_rr(Some(prefix), &[0x0F, 0x2A], dst.enc, src.enc, src.size == 8)
    }

    /// `cvttss2si`/`cvttsd2si`: XMM source into a GPR.
    pub fn cvtt2si(&mut self, prefix: u8, dst: PhysReg, src: PhysReg) -> CodegenResult<()> {
        self.sse_rr(Some(prefix), &[0x0F, 0x2C], dst.enc, src.enc, dst.size == 8)
    }

    // -- VEX / EVEX --------------------------------------------------------

    fn require_feature(&self, inst: &'static str, feature: CpuFeature) -> CodegenResult<()> {
        if !self.holder.features().contains(feature) {
            return Err(CodegenError::FeatureMissing {
                inst,
                feature: feature.name(),
            });
        }
        Ok(())
    }

    /// VEX-encoded op with three register operands (`reg`, `vvvv`, `rm`).
    #[allow(clippy::too_many_arguments)]
    pub fn vex_rrr(
        &mut self,
        opcode: u8,
        pp: u8,
        mmmmm: u8,
        w: bool,
        l: u8,
        dst: PhysReg,
        src1: PhysReg,
        src2: PhysReg,
    ) -> CodegenResult<()> {
        Vex {
            reg: dst.enc,
            nds: src1.enc,
            base: Some(src2.enc),
            index: None,
            l256: l != 0,
            pp,
            map: mmmmm,
            w,
        }
        .emit(self.holder);
        self.holder.put1(opcode);
        self.holder.put1(modrm_reg(dst.enc, src2.enc));
        Ok(())
    }

    /// VEX-encoded op whose rm operand is memory.
    #[allow(clippy::too_many_arguments)]
    pub fn vex_rrm(
        &mut self,
        inst: &'static str,
        opcode: u8,
        pp: u8,
        mmmmm: u8,
        w: bool,
        l: u8,
        dst: PhysReg,
        src1: PhysReg,
        mem: &MemOperand,
    ) -> CodegenResult<()> {
        let amode = Amode::from_mem(mem, inst, self.offset())?;
        let (base, index) = amode.bx_encs();
        Vex {
            reg: dst.enc,
            nds: src1.enc,
            base,
            index,
            l256: l != 0,
            pp,
            map: mmmmm,
            w,
        }
        .emit(self.holder);
        self.holder.put1(opcode);
        emit_modrm_sib_disp(self.holder, dst.enc, &amode, 0, None)
    }

    /// EVEX-encoded op with three register operands.
    #[allow(clippy::too_many_arguments)]
    fn evex_rrr(
        &mut self,
        opcode: u8,
        pp: u8,
        mmm: u8,
        w: bool,
        ll: u8,
        dst: PhysReg,
        src1: PhysReg,
        src2: PhysReg,
        aaa: u8,
        z: bool,
    ) -> CodegenResult<()> {
        Evex {
            reg: dst.enc,
            nds: src1.enc,
            rm: EvexRm::Reg(src2.enc),
            len: ll,
            pp,
            map: mmm,
            w,
            mask: aaa,
            zeroing: z,
            broadcast: false,
        }
        .emit(self.holder);
        self.holder.put1(opcode);
        self.holder.put1(modrm_reg(dst.enc, src2.enc));
        Ok(())
    }

    /// EVEX-encoded op whose rm operand is memory, with optional embedded
    /// broadcast. Displacements use the compressed disp8*N scheme.
    #[allow(clippy::too_many_arguments)]
    fn evex_rrm(
        &mut self,
        inst: &'static str,
        opcode: u8,
        pp: u8,
        mmm: u8,
        w: bool,
        ll: u8,
        dst: PhysReg,
        src1: PhysReg,
        mem: &MemOperand,
        aaa: u8,
        z: bool,
        broadcast: bool,
    ) -> CodegenResult<()> {
        let amode = Amode::from_mem(mem, inst, self.offset())?;
        let (base, index) = amode.bx_encs();
        Evex {
            reg: dst.enc,
            nds: src1.enc,
            rm: EvexRm::Mem { base, index },
            len: ll,
            pp,
            map: mmm,
            w,
            mask: aaa,
            zeroing: z,
            broadcast,
        }
        .emit(self.holder);
        self.holder.put1(opcode);
        let scaling = if broadcast {
            if w {
                8
            } else {
                4
            }
        } else {
            // "Full" tuple type: the whole vector length.
            16i8 << ll
        };
        emit_modrm_sib_disp(self.holder, dst.enc, &amode, 0, Some(scaling))
    }

    /// A packed-float AVX/AVX-512 three-operand op. Picks VEX when it can;
    /// switches to EVEX when a ZMM length, an opmask, zeroing, broadcast, or
    /// a register encoding of 16..=31 requires it.
    #[allow(clippy::too_many_arguments)]
    pub fn vec_3op(
        &mut self,
        inst: &'static str,
        opcode: u8,
        pp: u8,
        w: bool,
        dst: PhysReg,
        src1: PhysReg,
        src2: &Operand,
        mask: Option<u8>,
        zeroing: bool,
        broadcast: bool,
    ) -> CodegenResult<()> {
        let src2_enc = match src2 {
            Operand::Phys(r) => Some(r.enc),
            _ => None,
        };
        let ll = match dst.size {
            16 => 0,
            32 => 1,
            64 => 2,
            s => return Err(self.bad_operand(inst, 0, format!("bad vector size {s}"))),
        };
        let needs_evex = dst.size == 64
            || mask.is_some()
            || zeroing
            || broadcast
            || dst.enc >= 16
            || src1.enc >= 16
            || src2_enc.is_some_and(|e| e >= 16);
        if needs_evex {
            self.require_feature(inst, CpuFeature::Avx512f)?;
            if ll < 2 {
                self.require_feature(inst, CpuFeature::Avx512vl)?;
            }
            let aaa = mask.unwrap_or(0);
            match src2 {
                Operand::Phys(src2) => {
                    if broadcast {
                        return Err(self.bad_operand(
                            inst,
                            2,
                            "broadcast requires a memory operand",
                        ));
                    }
                    self.evex_rrr(opcode, pp, 1, w, ll, dst, src1, *src2, aaa, zeroing)
                }
                Operand::Mem(mem) => self.evex_rrm(
                    inst, opcode, pp, 1, w, ll, dst, src1, mem, aaa, zeroing, broadcast,
                ),
                _ => Err(self.bad_operand(inst, 2, "expected register or memory")),
            }
        } else {
            self.require_feature(inst, CpuFeature::Avx)?;
            // These packed forms ignore VEX.W; the canonical encoding keeps
            // it clear. `w` only marks the element width for EVEX.
            match src2 {
                Operand::Phys(src2) => {
                    self.vex_rrr(opcode, pp, map::OF, false, ll, dst, src1, *src2)
                }
                Operand::Mem(mem) => {
                    self.vex_rrm(inst, opcode, pp, map::OF, false, ll, dst, src1, mem)
                }
                _ => Err(self.bad_operand(inst, 2, "expected register or memory")),
            }
        }
    }

    // -- Alignment ---------------------------------------------------------

    /// Align with NOP fill (code) at the current position.
    pub fn align_code(&mut self, align: u32) {
        debug_assert!(align.is_power_of_two());
        let misalign = self.offset() & (align - 1);
        if misalign != 0 {
            self.nop((align - misalign) as usize);
        }
    }
}

use crate::isa::shape_of;

impl Assembler<'_> {
    /// Dense dispatch from an instruction node to the typed emitters. A
    /// missing `(id, shape)` entry reports `UnsupportedInstruction`.
    pub fn emit(&mut self, node: &InstNode) -> CodegenResult<()> {
        use Operand as O;
        let Some(id) = InstId::from_u16(node.opcode) else {
            return Err(CodegenError::UnsupportedInstruction {
                inst: "<unknown>",
                shape: format!("opcode {}", node.opcode),
            });
        };
        let name = id.info().name;
        if let Some(feature) = id.feature() {
            self.require_feature(name, feature)?;
        }
        let unsupported = || CodegenError::UnsupportedInstruction {
            inst: name,
            shape: shape_of(&node.operands),
        };
        let cur = self.offset();
        let need_cond = || {
            node.options.cond.ok_or(CodegenError::InvalidOperand {
                inst: name,
                operand: 0,
                offset: cur,
                message: "missing condition code".to_string(),
            })
        };
        if node.options.lock {
            // LOCK legal only on a memory destination RMW; checked loosely.
            self.holder.put1(0xF0);
        }
        let ops = &node.operands[..];
        match id {
            InstId::Mov => match ops {
                [O::Phys(d), O::Phys(s)] => self.mov_rr(*d, *s),
                [O::Phys(d), O::Mem(m)] => self.mov_rm(*d, m),
                [O::Mem(m), O::Phys(s)] => self.mov_mr(m, *s),
                [O::Phys(d), O::Imm(i)] => self.mov_ri(*d, i.value),
                [O::Mem(m), O::Imm(i)] => {
                    let imm = i32::try_from(i.value)
                        .map_err(|_| self.bad_operand(name, 1, "immediate too wide"))?;
                    self.mov_mi(m, imm)
                }
                _ => Err(unsupported()),
            },
            InstId::Movabs => match ops {
                [O::Phys(d), O::Imm(i)] => self.movabs(*d, i.value as u64),
                _ => Err(unsupported()),
            },
            InstId::Movzx8 | InstId::Movzx16 | InstId::Movsx8 | InstId::Movsx16
            | InstId::Movsxd => match ops {
                [O::Phys(d), O::Phys(s)] => self.movx_rr(id, *d, *s),
                _ => Err(unsupported()),
            },
            InstId::Lea => match ops {
                [O::Phys(d), O::Mem(m)] => self.lea(*d, m),
                _ => Err(unsupported()),
            },
            InstId::Add | InstId::Or | InstId::Adc | InstId::Sbb | InstId::And | InstId::Sub
            | InstId::Xor | InstId::Cmp => {
                let op = match id {
                    InstId::Add => AluOp::Add,
                    InstId::Or => AluOp::Or,
                    InstId::Adc => AluOp::Adc,
                    InstId::Sbb => AluOp::Sbb,
                    InstId::And => AluOp::And,
                    InstId::Sub => AluOp::Sub,
                    InstId::Xor => AluOp::Xor,
                    InstId::Cmp => AluOp::Cmp,
                    _ => unreachable!(),
                };
                match ops {
                    [O::Phys(d), O::Phys(s)] => self.alu_rr(op, *d, *s),
                    [O::Phys(d), O::Mem(m)] => self.alu_rm(op, *d, m),
                    [O::Mem(m), O::Phys(s)] => self.alu_mr(op, m, *s),
                    [O::Phys(d), O::Imm(i)] => self.alu_ri(op, *d, *i),
                    [O::Mem(m), O::Imm(i)] => self.alu_mi(op, m, *i),
                    _ => Err(unsupported()),
                }
            }
            InstId::Test => match ops {
                [O::Phys(a), O::Phys(b)] => self.test_rr(*a, *b),
                [O::Phys(a), O::Imm(i)] => {
                    let imm = i32::try_from(i.value)
                        .map_err(|_| self.bad_operand(name, 1, "immediate too wide"))?;
                    self.test_ri(*a, imm)
                }
                _ => Err(unsupported()),
            },
            InstId::Not | InstId::Neg | InstId::Mul | InstId::Div | InstId::Idiv => {
                let op = match id {
                    InstId::Not => UnaryOp::Not,
                    InstId::Neg => UnaryOp::Neg,
                    InstId::Mul => UnaryOp::Mul,
                    InstId::Div => UnaryOp::Div,
                    InstId::Idiv => UnaryOp::Idiv,
                    _ => unreachable!(),
                };
                match ops {
                    [O::Phys(r)] => self.unary_r(op, *r),
                    _ => Err(unsupported()),
                }
            }
            InstId::Imul => match ops {
                [O::Phys(d), O::Phys(s)] => self.imul_rr(*d, *s),
                _ => Err(unsupported()),
            },
            InstId::Imul3 => match ops {
                [O::Phys(d), O::Phys(s), O::Imm(i)] => {
                    let imm = i32::try_from(i.value)
                        .map_err(|_| self.bad_operand(name, 2, "immediate too wide"))?;
                    self.imul_rri(*d, *s, imm)
                }
                _ => Err(unsupported()),
            },
            InstId::Cdq => self.cdq_cqo(4),
            InstId::Cqo => self.cdq_cqo(8),
            InstId::Shl | InstId::Shr | InstId::Sar | InstId::Rol | InstId::Ror => {
                let op = match id {
                    InstId::Shl => ShiftOp::Shl,
                    InstId::Shr => ShiftOp::Shr,
                    InstId::Sar => ShiftOp::Sar,
                    InstId::Rol => ShiftOp::Rol,
                    InstId::Ror => ShiftOp::Ror,
                    _ => unreachable!(),
                };
                match ops {
                    [O::Phys(d), O::Imm(i)] => {
                        let count = u8::try_from(i.value)
                            .map_err(|_| self.bad_operand(name, 1, "bad shift count"))?;
                        self.shift_ri(op, *d, count)
                    }
                    // The register count form requires the count in CL.
                    [O::Phys(d), O::Phys(c)] => {
                        if c.enc != regs::RCX {
                            return Err(CodegenError::IncompatibleOperands {
                                inst: name,
                                offset: self.offset(),
                                message: "variable shift count must be in cl".to_string(),
                            });
                        }
                        self.shift_rcl(op, *d)
                    }
                    _ => Err(unsupported()),
                }
            }
            InstId::Push => match ops {
                [O::Phys(r)] => self.push_r(*r),
                [O::Imm(i)] => {
                    let imm = i32::try_from(i.value)
                        .map_err(|_| self.bad_operand(name, 0, "immediate too wide"))?;
                    self.push_i(imm)
                }
                _ => Err(unsupported()),
            },
            InstId::Pop => match ops {
                [O::Phys(r)] => self.pop_r(*r),
                _ => Err(unsupported()),
            },
            InstId::Call => match ops {
                [O::Label(l)] => self.call_label(*l),
                [O::Phys(r)] => self.call_r(*r),
                _ => Err(unsupported()),
            },
            InstId::Ret => self.ret(),
            InstId::Jmp => match ops {
                [O::Label(l)] => self.jmp_label(*l, node.options.force_short),
                [O::Phys(r)] => self.jmp_r(*r),
                _ => Err(unsupported()),
            },
            InstId::Jcc => match ops {
                [O::Label(l)] => {
                    let cond = need_cond()?;
                    self.jcc(cond, *l, node.options.force_short)
                }
                _ => Err(unsupported()),
            },
            InstId::Setcc => match ops {
                [O::Phys(d)] => {
                    let cond = need_cond()?;
                    self.setcc(cond, *d)
                }
                _ => Err(unsupported()),
            },
            InstId::Cmovcc => match ops {
                [O::Phys(d), O::Phys(s)] => {
                    let cond = need_cond()?;
                    self.cmovcc(cond, *d, *s)
                }
                _ => Err(unsupported()),
            },
            InstId::Nop => {
                let len = match ops {
                    [] => 1,
                    [O::Imm(i)] => i.value.clamp(1, 64) as usize,
                    _ => return Err(unsupported()),
                };
                self.nop(len);
                Ok(())
            }
            InstId::Int3 => {
                self.int3();
                Ok(())
            }
            InstId::Ud2 => {
                self.ud2();
                Ok(())
            }
            // SSE moves: direction follows the operand shape.
            InstId::Movss | InstId::Movsd | InstId::Movaps | InstId::Movups | InstId::Movdqa
            | InstId::Movdqu => {
                let (prefix, load, store): (Option<u8>, u8, u8) = match id {
                    InstId::Movss => (Some(0xF3), 0x10, 0x11),
                    InstId::Movsd => (Some(0xF2), 0x10, 0x11),
                    InstId::Movaps => (None, 0x28, 0x29),
                    InstId::Movups => (None, 0x10, 0x11),
                    InstId::Movdqa => (Some(0x66), 0x6F, 0x7F),
                    InstId::Movdqu => (Some(0xF3), 0x6F, 0x7F),
                    _ => unreachable!(),
                };
                match ops {
                    [O::Phys(d), O::Phys(s)] => {
                        self.sse_rr(prefix, &[0x0F, load], d.enc, s.enc, false)
                    }
                    [O::Phys(d), O::Mem(m)] => {
                        self.sse_rm(name, prefix, &[0x0F, load], d.enc, m, false)
                    }
                    [O::Mem(m), O::Phys(s)] => {
                        self.sse_rm(name, prefix, &[0x0F, store], s.enc, m, false)
                    }
                    _ => Err(unsupported()),
                }
            }
            InstId::Movd => match ops {
                [O::Phys(d), O::Phys(s)] => self.movd_movq(*d, *s, false),
                _ => Err(unsupported()),
            },
            InstId::Movq => match ops {
                [O::Phys(d), O::Phys(s)] => self.movd_movq(*d, *s, true),
                _ => Err(unsupported()),
            },
            InstId::Addss | InstId::Addsd | InstId::Addps | InstId::Addpd | InstId::Subss
            | InstId::Subsd | InstId::Subps | InstId::Subpd | InstId::Mulss | InstId::Mulsd
            | InstId::Mulps | InstId::Mulpd | InstId::Divss | InstId::Divsd | InstId::Divps
            | InstId::Divpd | InstId::Sqrtss | InstId::Sqrtsd | InstId::Ucomiss
            | InstId::Ucomisd | InstId::Xorps | InstId::Xorpd | InstId::Andps | InstId::Orps
            | InstId::Pxor | InstId::Paddd | InstId::Psubd => {
                let (prefix, opcode): (Option<u8>, u8) = match id {
                    InstId::Addss => (Some(0xF3), 0x58),
                    InstId::Addsd => (Some(0xF2), 0x58),
                    InstId::Addps => (None, 0x58),
                    InstId::Addpd => (Some(0x66), 0x58),
                    InstId::Subss => (Some(0xF3), 0x5C),
                    InstId::Subsd => (Some(0xF2), 0x5C),
                    InstId::Subps => (None, 0x5C),
                    InstId::Subpd => (Some(0x66), 0x5C),
                    InstId::Mulss => (Some(0xF3), 0x59),
                    InstId::Mulsd => (Some(0xF2), 0x59),
                    InstId::Mulps => (None, 0x59),
                    InstId::Mulpd => (Some(0x66), 0x59),
                    InstId::Divss => (Some(0xF3), 0x5E),
                    InstId::Divsd => (Some(0xF2), 0x5E),
                    InstId::Divps => (None, 0x5E),
                    InstId::Divpd => (Some(0x66), 0x5E),
                    InstId::Sqrtss => (Some(0xF3), 0x51),
                    InstId::Sqrtsd => (Some(0xF2), 0x51),
                    InstId::Ucomiss => (None, 0x2E),
                    InstId::Ucomisd => (Some(0x66), 0x2E),
                    InstId::Xorps => (None, 0x57),
                    InstId::Xorpd => (Some(0x66), 0x57),
                    InstId::Andps => (None, 0x54),
                    InstId::Orps => (None, 0x56),
                    InstId::Pxor => (Some(0x66), 0xEF),
                    InstId::Paddd => (Some(0x66), 0xFE),
                    InstId::Psubd => (Some(0x66), 0xFA),
                    _ => unreachable!(),
                };
                match ops {
                    [O::Phys(d), src] => self.sse_op(name, prefix, &[0x0F, opcode], *d, src),
                    _ => Err(unsupported()),
                }
            }
            InstId::Cvtsi2ss => match ops {
                [O::Phys(d), O::Phys(s)] => self.cvtsi2(0xF3, *d, *s),
                _ => Err(unsupported()),
            },
            InstId::Cvtsi2sd => match ops {
                [O::Phys(d), O::Phys(s)] => self.cvtsi2(0xF2, *d, *s),
                _ => Err(unsupported()),
            },
            InstId::Cvttss2si => match ops {
                [O::Phys(d), O::Phys(s)] => self.cvtt2si(0xF3, *d, *s),
                _ => Err(unsupported()),
            },
            InstId::Cvttsd2si => match ops {
                [O::Phys(d), O::Phys(s)] => self.cvtt2si(0xF2, *d, *s),
                _ => Err(unsupported()),
            },
            // AVX scalar 3-operand forms (always VEX; scalars have no
            // broadcast or 512-bit length).
            InstId::Vaddss | InstId::Vaddsd | InstId::Vsubss | InstId::Vsubsd | InstId::Vmulss
            | InstId::Vmulsd | InstId::Vdivss | InstId::Vdivsd => {
                let (pfx, opcode): (u8, u8) = match id {
                    InstId::Vaddss => (pp::PF3, 0x58),
                    InstId::Vaddsd => (pp::PF2, 0x58),
                    InstId::Vsubss => (pp::PF3, 0x5C),
                    InstId::Vsubsd => (pp::PF2, 0x5C),
                    InstId::Vmulss => (pp::PF3, 0x59),
                    InstId::Vmulsd => (pp::PF2, 0x59),
                    InstId::Vdivss => (pp::PF3, 0x5E),
                    InstId::Vdivsd => (pp::PF2, 0x5E),
                    _ => unreachable!(),
                };
                match ops {
                    [O::Phys(d), O::Phys(a), O::Phys(b)] => {
                        self.vex_rrr(opcode, pfx, map::OF, false, 0, *d, *a, *b)
                    }
                    [O::Phys(d), O::Phys(a), O::Mem(m)] => {
                        self.vex_rrm(name, opcode, pfx, map::OF, false, 0, *d, *a, m)
                    }
                    _ => Err(unsupported()),
                }
            }
            // Packed forms: VEX or EVEX depending on operands and options.
            InstId::Vaddps | InstId::Vaddpd | InstId::Vsubps | InstId::Vsubpd | InstId::Vmulps
            | InstId::Vmulpd | InstId::Vdivps | InstId::Vdivpd | InstId::Vxorps
            | InstId::Vpxor => {
                let (pfx, w, opcode): (u8, bool, u8) = match id {
                    InstId::Vaddps => (pp::NONE, false, 0x58),
                    InstId::Vaddpd => (pp::P66, true, 0x58),
                    InstId::Vsubps => (pp::NONE, false, 0x5C),
                    InstId::Vsubpd => (pp::P66, true, 0x5C),
                    InstId::Vmulps => (pp::NONE, false, 0x59),
                    InstId::Vmulpd => (pp::P66, true, 0x59),
                    InstId::Vdivps => (pp::NONE, false, 0x5E),
                    InstId::Vdivpd => (pp::P66, true, 0x5E),
                    InstId::Vxorps => (pp::NONE, false, 0x57),
                    InstId::Vpxor => (pp::P66, false, 0xEF),
                    _ => unreachable!(),
                };
                // Plain AVX forms ignore W; EVEX uses it to mark the element
                // width for compressed displacements.
                match ops {
                    [O::Phys(d), O::Phys(a), src2] => self.vec_3op(
                        name,
                        opcode,
                        pfx,
                        w,
                        *d,
                        *a,
                        src2,
                        node.options.mask,
                        node.options.zeroing,
                        node.options.broadcast,
                    ),
                    _ => Err(unsupported()),
                }
            }
            InstId::Vmovaps | InstId::Vmovups | InstId::Vmovdqu => {
                let (pfx, load, store): (u8, u8, u8) = match id {
                    InstId::Vmovaps => (pp::NONE, 0x28, 0x29),
                    InstId::Vmovups => (pp::NONE, 0x10, 0x11),
                    InstId::Vmovdqu => (pp::PF3, 0x6F, 0x7F),
                    _ => unreachable!(),
                };
                let mov_vex = |reg: &PhysReg, base, index| Vex {
                    reg: reg.enc,
                    nds: 0,
                    base,
                    index,
                    l256: reg.size == 32,
                    pp: pfx,
                    map: map::OF,
                    w: false,
                };
                match ops {
                    [O::Phys(d), O::Phys(s)] => {
                        mov_vex(d, Some(s.enc), None).emit(self.holder);
                        self.holder.put1(load);
                        self.holder.put1(modrm_reg(d.enc, s.enc));
                        Ok(())
                    }
                    [O::Phys(d), O::Mem(m)] => {
                        let amode = Amode::from_mem(m, name, self.offset())?;
                        let (base, index) = amode.bx_encs();
                        mov_vex(d, base, index).emit(self.holder);
                        self.holder.put1(load);
                        emit_modrm_sib_disp(self.holder, d.enc, &amode, 0, None)
                    }
                    [O::Mem(m), O::Phys(s)] => {
                        let amode = Amode::from_mem(m, name, self.offset())?;
                        let (base, index) = amode.bx_encs();
                        mov_vex(s, base, index).emit(self.holder);
                        self.holder.put1(store);
                        emit_modrm_sib_disp(self.holder, s.enc, &amode, 0, None)
                    }
                    _ => Err(unsupported()),
                }
            }
            InstId::Vfmadd213ss | InstId::Vfmadd213sd => {
                let w = id == InstId::Vfmadd213sd;
                match ops {
                    [O::Phys(d), O::Phys(a), O::Phys(b)] => {
                        self.vex_rrr(0xA9, pp::P66, map::OF38, w, 0, *d, *a, *b)
                    }
                    _ => Err(unsupported()),
                }
            }
            InstId::Andn => match ops {
                [O::Phys(d), O::Phys(a), O::Phys(b)] => {
                    self.vex_rrr(0xF2, pp::NONE, map::OF38, d.size == 8, 0, *d, *a, *b)
                }
                _ => Err(unsupported()),
            },
            // shlx/shrx/sarx place the count in vvvv and the value in rm.
            InstId::Shlx | InstId::Shrx | InstId::Sarx => {
                let pfx = match id {
                    InstId::Shlx => pp::P66,
                    InstId::Sarx => pp::PF3,
                    InstId::Shrx => pp::PF2,
                    _ => unreachable!(),
                };
                match ops {
                    [O::Phys(d), O::Phys(v), O::Phys(c)] => {
                        Vex {
                            reg: d.enc,
                            nds: c.enc,
                            base: Some(v.enc),
                            index: None,
                            l256: false,
                            pp: pfx,
                            map: map::OF38,
                            w: d.size == 8,
                        }
                        .emit(self.holder);
                        self.holder.put1(0xF7);
                        self.holder.put1(modrm_reg(d.enc, v.enc));
                        Ok(())
                    }
                    _ => Err(unsupported()),
                }
            }
        }
    }
}
