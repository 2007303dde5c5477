//! Golden-byte tests for the AArch64 encoder.
//!
//! N.B.: the architecture is little-endian, so when transcribing 32-bit
//! words from objdump one must swap the bytes: a `ret` prints as
//! `D65F03C0` but appears in memory as `C0 03 5F D6`.

use super::asm::Assembler;
use super::imms::MoveWideConst;
use super::inst::InstId;
use super::regs::{dreg, qreg, sreg, wreg, xreg, FP, LR, SP};
use crate::env::{Arch, Environment, Platform};
use crate::holder::CodeHolder;
use crate::ir::{Cond, InstNode, InstOptions, MemOperand, Operand, PhysReg, RegOperand};
use crate::result::CodegenResult;
use smallvec::smallvec;

fn holder() -> CodeHolder {
    CodeHolder::new(Environment::new(Arch::Aarch64, Platform::Linux))
}

fn emit(f: impl FnOnce(&mut Assembler) -> CodegenResult<()>) -> Vec<u8> {
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    f(&mut asm).unwrap();
    h.finalize().unwrap().bytes().to_vec()
}

fn node(id: InstId, operands: Vec<Operand>) -> InstNode {
    InstNode {
        opcode: id.into(),
        operands: operands.into_iter().collect(),
        options: InstOptions::default(),
    }
}

fn mem(base: PhysReg, disp: i32, size: u8) -> MemOperand {
    MemOperand::base_disp(RegOperand::Phys(base), disp, size)
}

#[track_caller]
fn check_word(bytes: Vec<u8>, word: u32, text: &str) {
    assert_eq!(bytes.len(), 4, "`{text}` must emit exactly one word");
    assert_eq!(
        u32::from_le_bytes(bytes.try_into().unwrap()),
        word,
        "encoding mismatch for `{text}`"
    );
}

#[test]
fn test_aarch64_binemit() {
    // (emit-thunk, expected word, disassembly) triples; words transcribed
    // from `aarch64-linux-gnu-as` output.
    let cases: Vec<(InstNode, u32, &str)> = vec![
        (node(InstId::Ret, vec![]), 0xD65F03C0, "ret"),
        (node(InstId::Nop, vec![]), 0xD503201F, "nop"),
        (
            node(
                InstId::Add,
                vec![xreg(4).into(), xreg(5).into(), xreg(6).into()],
            ),
            0x8B0600A4,
            "add x4, x5, x6",
        ),
        (
            node(
                InstId::Add,
                vec![wreg(1).into(), wreg(2).into(), wreg(3).into()],
            ),
            0x0B030041,
            "add w1, w2, w3",
        ),
        (
            node(
                InstId::Sub,
                vec![xreg(4).into(), xreg(5).into(), xreg(6).into()],
            ),
            0xCB0600A4,
            "sub x4, x5, x6",
        ),
        (
            node(
                InstId::Subs,
                vec![xreg(0).into(), xreg(1).into(), xreg(2).into()],
            ),
            0xEB020020,
            "subs x0, x1, x2",
        ),
        (
            node(
                InstId::Add,
                vec![xreg(0).into(), xreg(1).into(), Operand::imm(42)],
            ),
            0x9100A820,
            "add x0, x1, #42",
        ),
        (
            node(
                InstId::Add,
                vec![xreg(0).into(), xreg(1).into(), Operand::imm(1 << 12)],
            ),
            0x91400420,
            "add x0, x1, #4096",
        ),
        (
            node(
                InstId::Sub,
                vec![
                    PhysReg::gpr(SP, 8).into(),
                    PhysReg::gpr(SP, 8).into(),
                    Operand::imm(16),
                ],
            ),
            0xD10043FF,
            "sub sp, sp, #16",
        ),
        (
            node(
                InstId::Subs,
                vec![xreg(1).into(), xreg(1).into(), Operand::imm(1)],
            ),
            0xF1000421,
            "subs x1, x1, #1",
        ),
        (
            node(InstId::MovZ, vec![xreg(0).into(), Operand::imm(10)]),
            0xD2800140,
            "movz x0, #10",
        ),
        (
            node(InstId::MovK, vec![xreg(0).into(), Operand::imm(0x1_0000)]),
            0xF2A00020,
            "movk x0, #1, lsl #16",
        ),
        (
            node(InstId::Mov, vec![xreg(0).into(), xreg(1).into()]),
            0xAA0103E0,
            "mov x0, x1",
        ),
        (
            node(
                InstId::Mov,
                vec![PhysReg::gpr(FP, 8).into(), PhysReg::gpr(SP, 8).into()],
            ),
            0x910003FD,
            "mov fp, sp",
        ),
        (
            node(
                InstId::And,
                vec![xreg(0).into(), xreg(1).into(), Operand::imm(0xff)],
            ),
            0x92401C20,
            "and x0, x1, #0xff",
        ),
        (
            node(
                InstId::Orr,
                vec![xreg(0).into(), xreg(1).into(), xreg(2).into()],
            ),
            0xAA020020,
            "orr x0, x1, x2",
        ),
        (
            node(
                InstId::Eor,
                vec![wreg(1).into(), wreg(2).into(), wreg(3).into()],
            ),
            0x4A030041,
            "eor w1, w2, w3",
        ),
        (
            node(
                InstId::Madd,
                vec![
                    xreg(0).into(),
                    xreg(1).into(),
                    xreg(2).into(),
                    xreg(3).into(),
                ],
            ),
            0x9B020C20,
            "madd x0, x1, x2, x3",
        ),
        (
            node(
                InstId::Mul,
                vec![xreg(0).into(), xreg(1).into(), xreg(2).into()],
            ),
            0x9B027C20,
            "mul x0, x1, x2",
        ),
        (
            node(
                InstId::Sdiv,
                vec![xreg(0).into(), xreg(1).into(), xreg(2).into()],
            ),
            0x9AC20C20,
            "sdiv x0, x1, x2",
        ),
        (
            node(
                InstId::Udiv,
                vec![xreg(0).into(), xreg(1).into(), xreg(2).into()],
            ),
            0x9AC20820,
            "udiv x0, x1, x2",
        ),
        (
            node(
                InstId::Lsl,
                vec![xreg(0).into(), xreg(1).into(), Operand::imm(4)],
            ),
            0xD37CEC20,
            "lsl x0, x1, #4",
        ),
        (
            node(
                InstId::Lsr,
                vec![xreg(0).into(), xreg(1).into(), Operand::imm(4)],
            ),
            0xD344FC20,
            "lsr x0, x1, #4",
        ),
        (
            node(
                InstId::Asr,
                vec![wreg(0).into(), wreg(1).into(), Operand::imm(3)],
            ),
            0x13037C20,
            "asr w0, w1, #3",
        ),
        (
            node(
                InstId::Lsl,
                vec![xreg(0).into(), xreg(1).into(), xreg(2).into()],
            ),
            0x9AC22020,
            "lslv x0, x1, x2",
        ),
        (
            InstNode {
                opcode: InstId::Csel.into(),
                operands: smallvec![xreg(0).into(), xreg(1).into(), xreg(2).into()],
                options: InstOptions::with_cond(Cond::Eq),
            },
            0x9A820020,
            "csel x0, x1, x2, eq",
        ),
        (
            InstNode {
                opcode: InstId::Cset.into(),
                operands: smallvec![xreg(0).into()],
                options: InstOptions::with_cond(Cond::Ne),
            },
            0x9A9F07E0,
            "cset x0, ne",
        ),
        (
            node(
                InstId::Ldr,
                vec![xreg(0).into(), mem(xreg(1), 0, 8).into()],
            ),
            0xF9400020,
            "ldr x0, [x1]",
        ),
        (
            node(
                InstId::Ldr,
                vec![xreg(0).into(), mem(xreg(1), 16, 8).into()],
            ),
            0xF9400820,
            "ldr x0, [x1, #16]",
        ),
        (
            node(
                InstId::Str,
                vec![xreg(0).into(), mem(PhysReg::gpr(SP, 8), 8, 8).into()],
            ),
            0xF90007E0,
            "str x0, [sp, #8]",
        ),
        (
            node(
                InstId::Ldur,
                vec![xreg(0).into(), mem(xreg(1), -8, 8).into()],
            ),
            0xF85F8020,
            "ldur x0, [x1, #-8]",
        ),
        (
            node(
                InstId::Ldrb,
                vec![wreg(0).into(), mem(xreg(1), 0, 1).into()],
            ),
            0x39400020,
            "ldrb w0, [x1]",
        ),
        (
            node(
                InstId::Strh,
                vec![wreg(0).into(), mem(xreg(1), 2, 2).into()],
            ),
            0x79000420,
            "strh w0, [x1, #2]",
        ),
        (
            node(
                InstId::Ldrsw,
                vec![xreg(0).into(), mem(xreg(1), 4, 4).into()],
            ),
            0xB9800420,
            "ldrsw x0, [x1, #4]",
        ),
        (
            node(
                InstId::Ldr,
                vec![
                    xreg(0).into(),
                    MemOperand::base_index(
                        RegOperand::Phys(xreg(1)),
                        RegOperand::Phys(xreg(2)),
                        1,
                        0,
                        8,
                    )
                    .into(),
                ],
            ),
            0xF8626820,
            "ldr x0, [x1, x2]",
        ),
        (
            node(
                InstId::Ldr,
                vec![
                    xreg(0).into(),
                    MemOperand::base_index(
                        RegOperand::Phys(xreg(1)),
                        RegOperand::Phys(xreg(2)),
                        8,
                        0,
                        8,
                    )
                    .into(),
                ],
            ),
            0xF8627820,
            "ldr x0, [x1, x2, lsl #3]",
        ),
        (
            node(
                InstId::StpPre,
                vec![
                    PhysReg::gpr(FP, 8).into(),
                    PhysReg::gpr(LR, 8).into(),
                    mem(PhysReg::gpr(SP, 8), -16, 8).into(),
                ],
            ),
            0xA9BF7BFD,
            "stp fp, lr, [sp, #-16]!",
        ),
        (
            node(
                InstId::LdpPost,
                vec![
                    PhysReg::gpr(FP, 8).into(),
                    PhysReg::gpr(LR, 8).into(),
                    mem(PhysReg::gpr(SP, 8), 16, 8).into(),
                ],
            ),
            0xA8C17BFD,
            "ldp fp, lr, [sp], #16",
        ),
        (
            node(
                InstId::Stp,
                vec![
                    xreg(19).into(),
                    xreg(20).into(),
                    mem(PhysReg::gpr(SP, 8), 16, 8).into(),
                ],
            ),
            0xA90153F3,
            "stp x19, x20, [sp, #16]",
        ),
        (
            node(InstId::Br, vec![xreg(1).into()]),
            0xD61F0020,
            "br x1",
        ),
        (
            node(InstId::Blr, vec![xreg(1).into()]),
            0xD63F0020,
            "blr x1",
        ),
        (node(InstId::Brk, vec![]), 0xD4200000, "brk #0"),
        (
            node(
                InstId::Fadd,
                vec![sreg(0).into(), sreg(1).into(), sreg(2).into()],
            ),
            0x1E222820,
            "fadd s0, s1, s2",
        ),
        (
            node(
                InstId::Fadd,
                vec![dreg(0).into(), dreg(1).into(), dreg(2).into()],
            ),
            0x1E622820,
            "fadd d0, d1, d2",
        ),
        (
            node(
                InstId::Fdiv,
                vec![dreg(0).into(), dreg(1).into(), dreg(2).into()],
            ),
            0x1E621820,
            "fdiv d0, d1, d2",
        ),
        (
            node(InstId::Fmov, vec![dreg(0).into(), dreg(1).into()]),
            0x1E604020,
            "fmov d0, d1",
        ),
        (
            node(InstId::Fmov, vec![dreg(0).into(), xreg(1).into()]),
            0x9E670020,
            "fmov d0, x1",
        ),
        (
            node(InstId::Fmov, vec![xreg(0).into(), dreg(1).into()]),
            0x9E660020,
            "fmov x0, d1",
        ),
        (
            node(InstId::Scvtf, vec![dreg(0).into(), xreg(1).into()]),
            0x9E620020,
            "scvtf d0, x1",
        ),
        (
            node(InstId::Fcvtzs, vec![xreg(0).into(), dreg(1).into()]),
            0x9E780020,
            "fcvtzs x0, d1",
        ),
        (
            node(InstId::Fcmp, vec![dreg(0).into(), dreg(1).into()]),
            0x1E612000,
            "fcmp d0, d1",
        ),
        (
            node(
                InstId::AddV,
                vec![qreg(0).into(), qreg(1).into(), qreg(2).into()],
            ),
            0x4EA28420,
            "add v0.4s, v1.4s, v2.4s",
        ),
        (
            node(InstId::Movi, vec![qreg(0).into(), Operand::imm(0)]),
            0x4F00E400,
            "movi v0.16b, #0",
        ),
        (
            node(
                InstId::Str,
                vec![qreg(0).into(), mem(PhysReg::gpr(SP, 8), 0, 16).into()],
            ),
            0x3D8003E0,
            "str q0, [sp]",
        ),
    ];

    for (inst, word, text) in cases {
        let bytes = emit(|asm| asm.emit(&inst));
        check_word(bytes, word, text);
    }
}

#[test]
fn load_const_sequences() {
    // A single movz for one-chunk values.
    check_word(
        emit(|a| a.load_const(xreg(0), 10)),
        0xD2800140,
        "mov x0, #10",
    );
    // movn for inverted one-chunk values.
    check_word(
        emit(|a| a.load_const(xreg(0), !0u64)),
        0x92800000,
        "mov x0, #-1",
    );
    // Bitmask immediates go through orr.
    check_word(
        emit(|a| a.load_const(xreg(0), 0x5555_5555_5555_5555)),
        0xB200F3E0,
        "mov x0, #0x5555555555555555",
    );
    // Multi-chunk values chain movz/movk.
    let bytes = emit(|a| a.load_const(xreg(0), 0x0001_0002));
    assert_eq!(bytes.len(), 8, "two instructions expected");
    let w0 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let w1 = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    assert_eq!(w0, 0xD2800040, "movz x0, #2");
    assert_eq!(w1, 0xF2A00020, "movk x0, #1, lsl #16");
}

#[test]
fn branch_fixups_are_instruction_scaled() {
    // The S5 loop shape: each emitted word is 4 bytes and the b.ne fixup
    // lands as a rel19 of -2 instructions.
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    let top = asm.holder().new_label();
    asm.load_const(xreg(0), 0).unwrap();
    asm.load_const(xreg(1), 10).unwrap();
    asm.holder().bind_label(top).unwrap();
    asm.add_sub_rrr(false, false, xreg(0), xreg(0), xreg(1)).unwrap();
    asm.add_sub_imm(true, true, xreg(1), xreg(1), 1).unwrap();
    let cond_ne = 0b0001;
    asm.b_cond(cond_ne, top).unwrap();
    asm.br_reg(0b10, xreg(LR)).unwrap();
    let image = h.finalize().unwrap();
    let words: Vec<u32> = image
        .bytes()
        .chunks(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(
        words,
        vec![
            0xD2800000, // movz x0, #0
            0xD2800141, // movz x1, #10
            0x8B010000, // add x0, x0, x1
            0xF1000421, // subs x1, x1, #1
            0x54FFFFC1, // b.ne back 2 instructions
            0xD65F03C0, // ret
        ]
    );

    // Forward b resolves at bind time with a positive rel26.
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    let end = asm.holder().new_label();
    asm.b(end).unwrap();
    asm.nop();
    asm.holder().bind_label(end).unwrap();
    asm.br_reg(0b10, xreg(LR)).unwrap();
    let image = h.finalize().unwrap();
    let first = u32::from_le_bytes(image.bytes()[0..4].try_into().unwrap());
    assert_eq!(first, 0x1400_0002, "b +2 instructions");
}

#[test]
fn ldr_literal_uses_rel19() {
    let mut h = holder();
    let mut asm = Assembler::new(&mut h);
    let lit = asm.holder().new_label();
    asm.ldr_lit(xreg(0), lit).unwrap();
    asm.br_reg(0b10, xreg(LR)).unwrap();
    asm.holder().bind_label(lit).unwrap();
    asm.holder().put8(0x1122_3344_5566_7788);
    let image = h.finalize().unwrap();
    let first = u32::from_le_bytes(image.bytes()[0..4].try_into().unwrap());
    // ldr x0, +2 instructions.
    assert_eq!(first, 0x5800_0040);
}

#[test]
fn move_wide_rejects_multi_chunk_values() {
    assert!(MoveWideConst::maybe_from_u64(0x1_0001).is_none());
    let c = MoveWideConst::maybe_from_u64(0xABCD).unwrap();
    assert_eq!(c.value(), 0xABCD);
}
