//! Golden-byte tests for the x64 encoder.
//!
//! Expected encodings are transcribed from the output of a standard
//! assembler (`as` with `objdump -d`) and cross-checked against the Intel
//! SDM tables. Each case drives the typed assembler surface; byte equality
//! is required, not mere decodability.

use super::asm::{AluOp, Assembler, ShiftOp, UnaryOp};
use super::regs::{self, gpr, gpr32, gpr8, xmm, zmm};
use crate::env::{Arch, Environment, Platform};
use crate::features::CpuFeatures;
use crate::holder::CodeHolder;
use crate::ir::{Cond, ImmOperand, MemOperand, Operand, PhysReg, RegOperand};
use crate::result::{CodegenError, CodegenResult};

fn holder() -> CodeHolder {
    CodeHolder::with_features(
        Environment::new(Arch::X64, Platform::Linux),
        CpuFeatures::all(),
    )
}

fn emit(f: impl FnOnce(&mut Assembler) -> CodegenResult<()>) -> Vec<u8> {
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    f(&mut asm).unwrap();
    h.finalize().unwrap().bytes().to_vec()
}

fn emit_err(f: impl FnOnce(&mut Assembler) -> CodegenResult<()>) -> CodegenError {
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    f(&mut asm).unwrap_err()
}

fn mem(base: u8, disp: i32, size: u8) -> MemOperand {
    MemOperand::base_disp(RegOperand::Phys(PhysReg::gpr(base, 8)), disp, size)
}

#[track_caller]
fn check(bytes: Vec<u8>, expected: &[u8], text: &str) {
    assert_eq!(bytes, expected, "encoding mismatch for `{text}`");
}

#[test]
fn mov_and_alu_rr() {
    check(
        emit(|a| a.mov_rr(gpr(regs::RAX), gpr(regs::RCX))),
        &[0x48, 0x89, 0xC8],
        "mov rax, rcx",
    );
    check(
        emit(|a| a.mov_rr(gpr(regs::RDI), gpr(regs::RSI))),
        &[0x48, 0x89, 0xF7],
        "mov rdi, rsi",
    );
    check(
        emit(|a| a.mov_rr(gpr(regs::R8), gpr(regs::R9))),
        &[0x4D, 0x89, 0xC8],
        "mov r8, r9",
    );
    check(
        emit(|a| a.mov_rr(gpr32(regs::RAX), gpr32(regs::RCX))),
        &[0x89, 0xC8],
        "mov eax, ecx",
    );
    check(
        emit(|a| a.alu_rr(AluOp::Add, gpr(regs::RAX), gpr(regs::RSI))),
        &[0x48, 0x01, 0xF0],
        "add rax, rsi",
    );
    check(
        emit(|a| a.alu_rr(AluOp::Xor, gpr32(regs::RAX), gpr32(regs::RAX))),
        &[0x31, 0xC0],
        "xor eax, eax",
    );
    check(
        emit(|a| a.alu_rr(AluOp::Cmp, gpr(regs::RDI), gpr(regs::RSI))),
        &[0x48, 0x39, 0xF7],
        "cmp rdi, rsi",
    );
    check(
        emit(|a| a.test_rr(gpr(regs::RCX), gpr(regs::RCX))),
        &[0x48, 0x85, 0xC9],
        "test rcx, rcx",
    );
}

#[test]
fn alu_immediates_pick_short_forms() {
    check(
        emit(|a| a.alu_ri(AluOp::Add, gpr(regs::RAX), ImmOperand::new(8))),
        &[0x48, 0x83, 0xC0, 0x08],
        "add rax, 8",
    );
    check(
        emit(|a| a.alu_ri(AluOp::Add, gpr(regs::RAX), ImmOperand::new(1000))),
        &[0x48, 0x81, 0xC0, 0xE8, 0x03, 0x00, 0x00],
        "add rax, 1000",
    );
    check(
        emit(|a| a.alu_ri(AluOp::Sub, gpr(regs::RSP), ImmOperand::new(32))),
        &[0x48, 0x83, 0xEC, 0x20],
        "sub rsp, 32",
    );
    // A width hint of 4 forces the long form even for a small value.
    check(
        emit(|a| {
            a.alu_ri(
                AluOp::Add,
                gpr(regs::RAX),
                ImmOperand {
                    value: 8,
                    width: Some(4),
                },
            )
        }),
        &[0x48, 0x81, 0xC0, 0x08, 0x00, 0x00, 0x00],
        "add rax, 8 (imm32)",
    );
}

#[test]
fn mov_immediates() {
    check(
        emit(|a| a.mov_ri(gpr32(regs::RAX), 1)),
        &[0xB8, 0x01, 0x00, 0x00, 0x00],
        "mov eax, 1",
    );
    check(
        emit(|a| a.mov_ri(gpr(regs::RAX), 1)),
        &[0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00],
        "mov rax, 1",
    );
    check(
        emit(|a| a.mov_ri(gpr(regs::RAX), 0x1122_3344_5566)),
        &[0x48, 0xB8, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0x00],
        "movabs rax, 0x112233445566",
    );
    check(
        emit(|a| a.mov_ri(gpr8(regs::RAX), 5)),
        &[0xB0, 0x05],
        "mov al, 5",
    );
    // SPL needs a REX prefix even with all extension bits clear.
    check(
        emit(|a| a.mov_ri(gpr8(regs::RSP), 5)),
        &[0x40, 0xB4, 0x05],
        "mov spl, 5",
    );
    // AH encodes without REX.
    check(
        emit(|a| a.mov_ri(gpr8(regs::AH), 1)),
        &[0xB4, 0x01],
        "mov ah, 1",
    );
}

#[test]
fn high_byte_with_rex_is_refused() {
    // `mov ah, sil` would need REX for SIL but AH forbids it.
    let err = emit_err(|a| a.mov_rr(gpr8(regs::AH), gpr8(regs::RSI)));
    assert!(matches!(err, CodegenError::IncompatibleOperands { .. }));
    // Same for an extended register alongside AH.
    let err = emit_err(|a| a.mov_rr(gpr8(regs::R8), gpr8(regs::AH)));
    assert!(matches!(err, CodegenError::IncompatibleOperands { .. }));
}

#[test]
fn memory_addressing() {
    check(
        emit(|a| a.mov_rm(gpr(regs::RAX), &mem(regs::RDI, 0, 8))),
        &[0x48, 0x8B, 0x07],
        "mov rax, [rdi]",
    );
    // rsp base forces a SIB byte.
    check(
        emit(|a| a.mov_rm(gpr(regs::RAX), &mem(regs::RSP, 8, 8))),
        &[0x48, 0x8B, 0x44, 0x24, 0x08],
        "mov rax, [rsp+8]",
    );
    // rbp base with no displacement requires an explicit zero disp8.
    check(
        emit(|a| a.mov_rm(gpr(regs::RAX), &mem(regs::RBP, 0, 8))),
        &[0x48, 0x8B, 0x45, 0x00],
        "mov rax, [rbp]",
    );
    check(
        emit(|a| a.mov_rm(gpr(regs::RAX), &mem(regs::R13, 0, 8))),
        &[0x49, 0x8B, 0x45, 0x00],
        "mov rax, [r13]",
    );
    check(
        emit(|a| {
            let m = MemOperand::base_index(
                RegOperand::Phys(gpr(regs::RDI)),
                RegOperand::Phys(gpr(regs::RSI)),
                4,
                16,
                8,
            );
            a.mov_rm(gpr(regs::RAX), &m)
        }),
        &[0x48, 0x8B, 0x44, 0xB7, 0x10],
        "mov rax, [rdi+rsi*4+16]",
    );
    check(
        emit(|a| a.mov_mr(&mem(regs::RDI, 128, 4), gpr32(regs::RDX))),
        &[0x89, 0x97, 0x80, 0x00, 0x00, 0x00],
        "mov [rdi+128], edx",
    );
}

#[test]
fn rip_relative_lea_resolves_through_fixup() {
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    let label = asm.holder().new_label();
    asm.lea(gpr(regs::RAX), &MemOperand::label(label, 8)).unwrap();
    asm.ret().unwrap();
    asm.holder().bind_label(label).unwrap();
    let image = h.finalize().unwrap();
    check(
        image.bytes().to_vec(),
        &[0x48, 0x8D, 0x05, 0x01, 0x00, 0x00, 0x00, 0xC3],
        "lea rax, [rip+L]; ret; L:",
    );
}

#[test]
fn stack_and_control_flow() {
    check(emit(|a| a.push_r(gpr(regs::RBP))), &[0x55], "push rbp");
    check(emit(|a| a.push_r(gpr(regs::R12))), &[0x41, 0x54], "push r12");
    check(emit(|a| a.pop_r(gpr(regs::RBP))), &[0x5D], "pop rbp");
    check(emit(|a| a.ret()), &[0xC3], "ret");
    check(emit(|a| a.call_r(gpr(regs::RAX))), &[0xFF, 0xD0], "call rax");
    check(emit(|a| a.jmp_r(gpr(regs::RAX))), &[0xFF, 0xE0], "jmp rax");
    check(
        emit(|a| {
            a.int3();
            Ok(())
        }),
        &[0xCC],
        "int3",
    );
    check(
        emit(|a| {
            a.ud2();
            Ok(())
        }),
        &[0x0F, 0x0B],
        "ud2",
    );
}

#[test]
fn mul_div_shift() {
    check(
        emit(|a| a.imul_rr(gpr(regs::RAX), gpr(regs::RSI))),
        &[0x48, 0x0F, 0xAF, 0xC6],
        "imul rax, rsi",
    );
    check(
        emit(|a| a.unary_r(UnaryOp::Idiv, gpr(regs::RSI))),
        &[0x48, 0xF7, 0xFE],
        "idiv rsi",
    );
    check(
        emit(|a| a.unary_r(UnaryOp::Neg, gpr(regs::RAX))),
        &[0x48, 0xF7, 0xD8],
        "neg rax",
    );
    check(emit(|a| a.cdq_cqo(8)), &[0x48, 0x99], "cqo");
    check(emit(|a| a.cdq_cqo(4)), &[0x99], "cdq");
    check(
        emit(|a| a.shift_ri(ShiftOp::Shl, gpr(regs::RAX), 3)),
        &[0x48, 0xC1, 0xE0, 0x03],
        "shl rax, 3",
    );
    check(
        emit(|a| a.shift_ri(ShiftOp::Shl, gpr(regs::RAX), 1)),
        &[0x48, 0xD1, 0xE0],
        "shl rax, 1",
    );
    check(
        emit(|a| a.shift_rcl(ShiftOp::Sar, gpr(regs::RAX))),
        &[0x48, 0xD3, 0xF8],
        "sar rax, cl",
    );
}

#[test]
fn widening_moves_and_conditionals() {
    check(
        emit(|a| a.movx_rr(super::InstId::Movzx8, gpr32(regs::RAX), gpr8(regs::RCX))),
        &[0x0F, 0xB6, 0xC1],
        "movzx eax, cl",
    );
    check(
        emit(|a| a.movx_rr(super::InstId::Movsxd, gpr(regs::RAX), gpr32(regs::RDI))),
        &[0x48, 0x63, 0xC7],
        "movsxd rax, edi",
    );
    check(
        emit(|a| a.setcc(Cond::Eq, gpr8(regs::RAX))),
        &[0x0F, 0x94, 0xC0],
        "sete al",
    );
    check(
        emit(|a| a.cmovcc(Cond::Eq, gpr(regs::RAX), gpr(regs::RSI))),
        &[0x48, 0x0F, 0x44, 0xC6],
        "cmove rax, rsi",
    );
}

#[test]
fn branch_forms() {
    // A backward branch in rel8 range uses the short form.
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    let top = asm.holder().new_label();
    asm.holder().bind_label(top).unwrap();
    asm.alu_rr(AluOp::Add, gpr(regs::RAX), gpr(regs::RSI)).unwrap();
    asm.jcc(Cond::Ne, top, false).unwrap();
    let image = h.finalize().unwrap();
    check(
        image.bytes().to_vec(),
        &[0x48, 0x01, 0xF0, 0x75, 0xFB],
        "L: add rax, rsi; jne L (short)",
    );

    // A forward branch emits the near form and patches at bind time.
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    let end = asm.holder().new_label();
    asm.jcc(Cond::Eq, end, false).unwrap();
    asm.mov_ri(gpr32(regs::RAX), 0).unwrap();
    asm.holder().bind_label(end).unwrap();
    asm.ret().unwrap();
    let image = h.finalize().unwrap();
    check(
        image.bytes().to_vec(),
        &[0x0F, 0x84, 0x05, 0x00, 0x00, 0x00, 0xB8, 0x00, 0x00, 0x00, 0x00, 0xC3],
        "je E; mov eax, 0; E: ret",
    );

    // An out-of-range forced-short branch is an error.
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    let top = asm.holder().new_label();
    asm.holder().bind_label(top).unwrap();
    for _ in 0..64 {
        asm.nop(4);
    }
    let err = asm.jmp_label(top, true).unwrap_err();
    assert!(matches!(err, CodegenError::InvalidDisplacement { bits: 8, .. }));
}

#[test]
fn nop_padding_is_canonical() {
    check(emit(|a| {
        a.nop(1);
        Ok(())
    }), &[0x90], "nop");
    check(
        emit(|a| {
            a.nop(2);
            Ok(())
        }),
        &[0x66, 0x90],
        "nop (2 bytes)",
    );
    check(
        emit(|a| {
            a.nop(3);
            Ok(())
        }),
        &[0x0F, 0x1F, 0x00],
        "nop (3 bytes)",
    );
    check(
        emit(|a| {
            a.nop(9);
            Ok(())
        }),
        &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        "nop (9 bytes)",
    );
    // Fill of 12 = 9 + 3.
    check(
        emit(|a| {
            a.nop(12);
            Ok(())
        }),
        &[
            0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0F, 0x1F, 0x00,
        ],
        "nop (12 bytes)",
    );
}

#[test]
fn sse_scalar_and_packed() {
    check(
        emit(|a| a.sse_op("movss", Some(0xF3), &[0x0F, 0x10], xmm(0), &Operand::Phys(xmm(1)))),
        &[0xF3, 0x0F, 0x10, 0xC1],
        "movss xmm0, xmm1",
    );
    check(
        emit(|a| a.sse_op("addss", Some(0xF3), &[0x0F, 0x58], xmm(0), &Operand::Phys(xmm(1)))),
        &[0xF3, 0x0F, 0x58, 0xC1],
        "addss xmm0, xmm1",
    );
    check(
        emit(|a| a.sse_op("addsd", Some(0xF2), &[0x0F, 0x58], xmm(2), &Operand::Phys(xmm(3)))),
        &[0xF2, 0x0F, 0x58, 0xD3],
        "addsd xmm2, xmm3",
    );
    check(
        emit(|a| a.sse_op("addps", None, &[0x0F, 0x58], xmm(0), &Operand::Phys(xmm(1)))),
        &[0x0F, 0x58, 0xC1],
        "addps xmm0, xmm1",
    );
    check(
        emit(|a| a.sse_op("pxor", Some(0x66), &[0x0F, 0xEF], xmm(0), &Operand::Phys(xmm(0)))),
        &[0x66, 0x0F, 0xEF, 0xC0],
        "pxor xmm0, xmm0",
    );
    check(
        emit(|a| a.sse_op("ucomisd", Some(0x66), &[0x0F, 0x2E], xmm(0), &Operand::Phys(xmm(1)))),
        &[0x66, 0x0F, 0x2E, 0xC1],
        "ucomisd xmm0, xmm1",
    );
    // An extended source register flips REX.B after the mandatory prefix.
    check(
        emit(|a| a.sse_op("movaps", None, &[0x0F, 0x28], xmm(0), &Operand::Phys(xmm(8)))),
        &[0x41, 0x0F, 0x28, 0xC0],
        "movaps xmm0, xmm8",
    );
    check(
        emit(|a| {
            let m = mem(regs::RSP, 0, 8);
            a.sse_op("movsd", Some(0xF2), &[0x0F, 0x11], xmm(0), &Operand::Mem(m))
        }),
        &[0xF2, 0x0F, 0x11, 0x04, 0x24],
        "movsd [rsp], xmm0",
    );
}

#[test]
fn gpr_xmm_transfers_and_conversions() {
    check(
        emit(|a| a.movd_movq(xmm(0), gpr32(regs::RAX), false)),
        &[0x66, 0x0F, 0x6E, 0xC0],
        "movd xmm0, eax",
    );
    check(
        emit(|a| a.movd_movq(xmm(0), gpr(regs::RAX), true)),
        &[0x66, 0x48, 0x0F, 0x6E, 0xC0],
        "movq xmm0, rax",
    );
    check(
        emit(|a| a.movd_movq(gpr(regs::RAX), xmm(0), true)),
        &[0x66, 0x48, 0x0F, 0x7E, 0xC0],
        "movq rax, xmm0",
    );
    check(
        emit(|a| a.cvtsi2(0xF2, xmm(0), gpr(regs::RDI))),
        &[0xF2, 0x48, 0x0F, 0x2A, 0xC7],
        "cvtsi2sd xmm0, rdi",
    );
    check(
        emit(|a| a.cvtt2si(0xF2, gpr(regs::RAX), xmm(1))),
        &[0xF2, 0x48, 0x0F, 0x2C, 0xC1],
        "cvttsd2si rax, xmm1",
    );
}

#[test]
fn vex_encodings() {
    use super::vex::{map, pp};
    check(
        emit(|a| a.vex_rrr(0x58, pp::PF3, map::OF, false, 0, xmm(0), xmm(1), xmm(2))),
        &[0xC5, 0xF2, 0x58, 0xC2],
        "vaddss xmm0, xmm1, xmm2",
    );
    // W=1 BMI forms require the 3-byte prefix.
    check(
        emit(|a| a.vex_rrr(0xF2, pp::NONE, map::OF38, true, 0, gpr(regs::RAX), gpr(regs::RSI), gpr(regs::RDI))),
        &[0xC4, 0xE2, 0xC8, 0xF2, 0xC7],
        "andn rax, rsi, rdi",
    );
    check(
        emit(|a| a.vex_rrr(0xA9, pp::P66, map::OF38, true, 0, xmm(0), xmm(1), xmm(2))),
        &[0xC4, 0xE2, 0xF1, 0xA9, 0xC2],
        "vfmadd213sd xmm0, xmm1, xmm2",
    );
}

#[test]
fn evex_encodings() {
    // ZMM operands force EVEX.512.
    check(
        emit(|a| {
            a.vec_3op(
                "vaddps",
                0x58,
                super::vex::pp::NONE,
                false,
                zmm(0),
                zmm(1),
                &Operand::Phys(zmm(2)),
                Some(1),
                true,
                false,
            )
        }),
        &[0x62, 0xF1, 0x74, 0xC9, 0x58, 0xC2],
        "vaddps zmm0 {k1}{z}, zmm1, zmm2",
    );
    // Broadcast memory form; the displacement compresses as disp8*N.
    check(
        emit(|a| {
            a.vec_3op(
                "vaddps",
                0x58,
                super::vex::pp::NONE,
                false,
                zmm(0),
                zmm(1),
                &Operand::Mem(mem(regs::RAX, 0, 4)),
                None,
                false,
                true,
            )
        }),
        &[0x62, 0xF1, 0x74, 0x58, 0x58, 0x00],
        "vaddps zmm0, zmm1, [rax]{1to16}",
    );
    check(
        emit(|a| {
            a.vec_3op(
                "vaddps",
                0x58,
                super::vex::pp::NONE,
                false,
                zmm(0),
                zmm(1),
                &Operand::Mem(mem(regs::RAX, 64, 64)),
                None,
                false,
                false,
            )
        }),
        &[0x62, 0xF1, 0x74, 0x48, 0x58, 0x40, 0x01],
        "vaddps zmm0, zmm1, [rax+64]",
    );
    // Without AVX-512 in the feature set, EVEX-demanding operands fail.
    let mut h = CodeHolder::new(Environment::new(Arch::X64, Platform::Linux));
    let mut asm = Assembler::new(&mut h);
    let err = asm
        .vec_3op(
            "vaddps",
            0x58,
            super::vex::pp::NONE,
            false,
            zmm(0),
            zmm(1),
            &Operand::Phys(zmm(2)),
            None,
            false,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, CodegenError::FeatureMissing { .. }));
}
