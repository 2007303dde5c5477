//! x64 instruction ids and their static metadata.

use super::regs;
use crate::features::CpuFeature;
use crate::ir::{InstInfo, OpUse};
use crate::isa::declare_inst_ids;

declare_inst_ids! {
    /// Dense x64 instruction ids. The operand shape (reg/mem/imm and
    /// direction) is carried by the operands themselves; one id covers every
    /// legal shape of its mnemonic.
    InstId {
        // Data movement.
        Mov,
        Movabs,
        Movzx8,
        Movzx16,
        Movsx8,
        Movsx16,
        Movsxd,
        Lea,
        // ALU.
        Add,
        Or,
        Adc,
        Sbb,
        And,
        Sub,
        Xor,
        Cmp,
        Test,
        Not,
        Neg,
        Imul,
        Imul3,
        Mul,
        Div,
        Idiv,
        Cdq,
        Cqo,
        Shl,
        Shr,
        Sar,
        Rol,
        Ror,
        // Stack, control flow.
        Push,
        Pop,
        Call,
        Ret,
        Jmp,
        Jcc,
        Setcc,
        Cmovcc,
        Nop,
        Int3,
        Ud2,
        // SSE2 and friends.
        Movss,
        Movsd,
        Movaps,
        Movups,
        Movdqa,
        Movdqu,
        Movd,
        Movq,
        Addss,
        Addsd,
        Addps,
        Addpd,
        Subss,
        Subsd,
        Subps,
        Subpd,
        Mulss,
        Mulsd,
        Mulps,
        Mulpd,
        Divss,
        Divsd,
        Divps,
        Divpd,
        Sqrtss,
        Sqrtsd,
        Ucomiss,
        Ucomisd,
        Cvtsi2ss,
        Cvtsi2sd,
        Cvttss2si,
        Cvttsd2si,
        Xorps,
        Xorpd,
        Andps,
        Orps,
        Pxor,
        Paddd,
        Psubd,
        // AVX (VEX-encoded); the wide forms switch to EVEX when a ZMM
        // register, opmask, broadcast, or an encoding >= 16 demands it.
        Vaddss,
        Vaddsd,
        Vaddps,
        Vaddpd,
        Vsubss,
        Vsubsd,
        Vsubps,
        Vsubpd,
        Vmulss,
        Vmulsd,
        Vmulps,
        Vmulpd,
        Vdivss,
        Vdivsd,
        Vdivps,
        Vdivpd,
        Vxorps,
        Vpxor,
        Vmovaps,
        Vmovups,
        Vmovdqu,
        Vfmadd213ss,
        Vfmadd213sd,
        // BMI.
        Andn,
        Shlx,
        Shrx,
        Sarx,
    }
}

const RW: &[OpUse] = &[OpUse::ReadWrite];
const RW_R: &[OpUse] = &[OpUse::ReadWrite, OpUse::Read];
const W_R: &[OpUse] = &[OpUse::Write, OpUse::Read];
const W_R_R: &[OpUse] = &[OpUse::Write, OpUse::Read, OpUse::Read];
const RW_R_R: &[OpUse] = &[OpUse::ReadWrite, OpUse::Read, OpUse::Read];
const R: &[OpUse] = &[OpUse::Read];
const R_R: &[OpUse] = &[OpUse::Read, OpUse::Read];
const W: &[OpUse] = &[OpUse::Write];
const NONE: &[OpUse] = &[];

impl InstId {
    /// Static use/def and implicit-register information for this opcode.
    pub fn info(self) -> InstInfo {
        use InstId::*;
        let (name, uses): (&'static str, &'static [OpUse]) = match self {
            Mov => ("mov", W_R),
            Movabs => ("movabs", W_R),
            Movzx8 => ("movzx", W_R),
            Movzx16 => ("movzx", W_R),
            Movsx8 => ("movsx", W_R),
            Movsx16 => ("movsx", W_R),
            Movsxd => ("movsxd", W_R),
            Lea => ("lea", W_R),
            Add => ("add", RW_R),
            Or => ("or", RW_R),
            Adc => ("adc", RW_R),
            Sbb => ("sbb", RW_R),
            And => ("and", RW_R),
            Sub => ("sub", RW_R),
            Xor => ("xor", RW_R),
            Cmp => ("cmp", R_R),
            Test => ("test", R_R),
            Not => ("not", RW),
            Neg => ("neg", RW),
            Imul => ("imul", RW_R),
            Imul3 => ("imul", W_R_R),
            Mul => ("mul", R),
            Div => ("div", R),
            Idiv => ("idiv", R),
            Cdq => ("cdq", NONE),
            Cqo => ("cqo", NONE),
            Shl => ("shl", RW_R),
            Shr => ("shr", RW_R),
            Sar => ("sar", RW_R),
            Rol => ("rol", RW_R),
            Ror => ("ror", RW_R),
            Push => ("push", R),
            Pop => ("pop", W),
            Call => ("call", R),
            Ret => ("ret", NONE),
            Jmp => ("jmp", R),
            Jcc => ("jcc", R),
            Setcc => ("setcc", W),
            Cmovcc => ("cmovcc", RW_R),
            Nop => ("nop", NONE),
            Int3 => ("int3", NONE),
            Ud2 => ("ud2", NONE),
            Movss => ("movss", W_R),
            Movsd => ("movsd", W_R),
            Movaps => ("movaps", W_R),
            Movups => ("movups", W_R),
            Movdqa => ("movdqa", W_R),
            Movdqu => ("movdqu", W_R),
            Movd => ("movd", W_R),
            Movq => ("movq", W_R),
            Addss => ("addss", RW_R),
            Addsd => ("addsd", RW_R),
            Addps => ("addps", RW_R),
            Addpd => ("addpd", RW_R),
            Subss => ("subss", RW_R),
            Subsd => ("subsd", RW_R),
            Subps => ("subps", RW_R),
            Subpd => ("subpd", RW_R),
            Mulss => ("mulss", RW_R),
            Mulsd => ("mulsd", RW_R),
            Mulps => ("mulps", RW_R),
            Mulpd => ("mulpd", RW_R),
            Divss => ("divss", RW_R),
            Divsd => ("divsd", RW_R),
            Divps => ("divps", RW_R),
            Divpd => ("divpd", RW_R),
            Sqrtss => ("sqrtss", RW_R),
            Sqrtsd => ("sqrtsd", RW_R),
            Ucomiss => ("ucomiss", R_R),
            Ucomisd => ("ucomisd", R_R),
            Cvtsi2ss => ("cvtsi2ss", RW_R),
            Cvtsi2sd => ("cvtsi2sd", RW_R),
            Cvttss2si => ("cvttss2si", W_R),
            Cvttsd2si => ("cvttsd2si", W_R),
            Xorps => ("xorps", RW_R),
            Xorpd => ("xorpd", RW_R),
            Andps => ("andps", RW_R),
            Orps => ("orps", RW_R),
            Pxor => ("pxor", RW_R),
            Paddd => ("paddd", RW_R),
            Psubd => ("psubd", RW_R),
            Vaddss => ("vaddss", W_R_R),
            Vaddsd => ("vaddsd", W_R_R),
            Vaddps => ("vaddps", W_R_R),
            Vaddpd => ("vaddpd", W_R_R),
            Vsubss => ("vsubss", W_R_R),
            Vsubsd => ("vsubsd", W_R_R),
            Vsubps => ("vsubps", W_R_R),
            Vsubpd => ("vsubpd", W_R_R),
            Vmulss => ("vmulss", W_R_R),
            Vmulsd => ("vmulsd", W_R_R),
            Vmulps => ("vmulps", W_R_R),
            Vmulpd => ("vmulpd", W_R_R),
            Vdivss => ("vdivss", W_R_R),
            Vdivsd => ("vdivsd", W_R_R),
            Vdivps => ("vdivps", W_R_R),
            Vdivpd => ("vdivpd", W_R_R),
            Vxorps => ("vxorps", W_R_R),
            Vpxor => ("vpxor", W_R_R),
            Vmovaps => ("vmovaps", W_R),
            Vmovups => ("vmovups", W_R),
            Vmovdqu => ("vmovdqu", W_R),
            Vfmadd213ss => ("vfmadd213ss", RW_R_R),
            Vfmadd213sd => ("vfmadd213sd", RW_R_R),
            Andn => ("andn", W_R_R),
            Shlx => ("shlx", W_R_R),
            Shrx => ("shrx", W_R_R),
            Sarx => ("sarx", W_R_R),
        };
        let implicit_gprs: &'static [u8] = match self {
            Mul | Div | Idiv | Cdq | Cqo => &[regs::RAX, regs::RDX],
            Shl | Shr | Sar | Rol | Ror => &[regs::RCX],
            _ => &[],
        };
        InstInfo {
            name,
            uses,
            implicit_gprs,
            is_ret: self == Ret,
            is_call: self == Call,
        }
    }

    /// The CPU extension this opcode is gated on, beyond the SSE2 baseline.
    pub fn feature(self) -> Option<CpuFeature> {
        use InstId::*;
        match self {
            Vaddss | Vaddsd | Vaddps | Vaddpd | Vsubss | Vsubsd | Vsubps | Vsubpd | Vmulss
            | Vmulsd | Vmulps | Vmulpd | Vdivss | Vdivsd | Vdivps | Vdivpd | Vxorps | Vpxor
            | Vmovaps | Vmovups | Vmovdqu => Some(CpuFeature::Avx),
            Vfmadd213ss | Vfmadd213sd => Some(CpuFeature::Fma),
            Andn => Some(CpuFeature::Bmi1),
            Shlx | Shrx | Sarx => Some(CpuFeature::Bmi2),
            _ => None,
        }
    }
}
