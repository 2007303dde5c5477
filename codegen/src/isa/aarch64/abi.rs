//! AAPCS64 calling convention and allocator metadata.
//!
//! The frame model: the prologue pushes the {fp, lr} frame record with a
//! pre-indexed `stp`, establishes x29, pushes clobbered callee-saved pairs,
//! and finally drops SP by the spill size. Incoming stack arguments are
//! addressed off x29; spill slots off SP.
//!
//! TODO: variadic signatures are not modeled; AAPCS64's rules for them
//! (named-register anchoring vs. Apple's stack-only convention) are left
//! out until a caller needs them.

use super::inst::InstId;
use super::regs;
use crate::env::{Arch, CallConv};
use crate::ir::{
    InstInfo, InstNode, InstOptions, MemOperand, Operand, PhysReg, RegClass, RegOperand, Signature,
};
use crate::isa::{ArgLoc, FrameLayout, IsaInfo};
use crate::result::{CodegenError, CodegenResult};
use smallvec::SmallVec;

// x16/x17 are the allocator's scratch pair, x18 is the platform register,
// x29/x30 the frame record. Caller-saved registers first.
const ALLOC_GPR: &[u8] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28,
];

// v16/v17 are scratch; v8..v15 (callee-saved low halves) come last.
const ALLOC_VEC: &[u8] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 8, 9, 10, 11,
    12, 13, 14, 15,
];

/// The AArch64 backend's allocator/serializer metadata.
pub struct Aarch64;

impl IsaInfo for Aarch64 {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn inst_info(&self, opcode: u16) -> CodegenResult<InstInfo> {
        InstId::from_u16(opcode)
            .map(InstId::info)
            .ok_or_else(|| CodegenError::UnsupportedInstruction {
                inst: "<unknown>",
                shape: format!("aarch64 opcode {opcode}"),
            })
    }

    fn allocatable(&self, _call_conv: CallConv, class: RegClass) -> &'static [u8] {
        match class {
            RegClass::Gpr => ALLOC_GPR,
            RegClass::Vec => ALLOC_VEC,
            RegClass::Mask => &[],
        }
    }

    fn is_callee_saved(&self, _call_conv: CallConv, class: RegClass, enc: u8) -> bool {
        match class {
            RegClass::Gpr => (19..=28).contains(&enc) || enc == regs::FP,
            // Only the low 64 bits of v8..v15 are callee-saved; the
            // allocator preserves the d-register halves.
            RegClass::Vec => (8..=15).contains(&enc),
            RegClass::Mask => false,
        }
    }

    fn scratch(&self, class: RegClass) -> [u8; 2] {
        match class {
            RegClass::Gpr => [16, 17],
            RegClass::Vec => [16, 17],
            RegClass::Mask => [0, 0],
        }
    }

    fn arg_locs(&self, sig: &Signature) -> CodegenResult<Vec<ArgLoc>> {
        if sig.call_conv != CallConv::Aapcs64 {
            return Err(CodegenError::StateError(format!(
                "{} signature in an aarch64 function",
                sig.call_conv
            )));
        }
        let mut locs = Vec::with_capacity(sig.params.len());
        let mut next_int = 0u8;
        let mut next_vec = 0u8;
        let mut stack: i32 = 0;
        for &ty in &sig.params {
            let loc = match ty.reg_class() {
                RegClass::Gpr if next_int < 8 => {
                    let reg = next_int;
                    next_int += 1;
                    ArgLoc::Reg(PhysReg::gpr(reg, ty.bytes().max(4)))
                }
                RegClass::Vec if next_vec < 8 => {
                    let reg = next_vec;
                    next_vec += 1;
                    ArgLoc::Reg(PhysReg::vec(reg, ty.bytes()))
                }
                _ => {
                    let size = i32::from(ty.bytes().max(8));
                    stack = (stack + size - 1) & !(size - 1);
                    let loc = ArgLoc::Stack(stack);
                    stack += size;
                    loc
                }
            };
            locs.push(loc);
        }
        Ok(locs)
    }

    fn ret_loc(&self, sig: &Signature) -> Option<PhysReg> {
        sig.ret.map(|ty| match ty.reg_class() {
            RegClass::Gpr => PhysReg::gpr(0, ty.bytes().max(4)),
            _ => PhysReg::vec(0, ty.bytes()),
        })
    }

    fn fixed_operand(&self, _inst: &InstNode, _operand: usize) -> Option<u8> {
        None
    }

    fn gen_move(&self, class: RegClass, size: u8, dst: u8, src: u8) -> InstNode {
        match class {
            RegClass::Gpr => inst(
                InstId::Mov,
                [
                    Operand::Phys(PhysReg::gpr(dst, size.max(4))),
                    Operand::Phys(PhysReg::gpr(src, size.max(4))),
                ],
            ),
            RegClass::Vec if size <= 8 => inst(
                InstId::Fmov,
                [
                    Operand::Phys(PhysReg::vec(dst, size)),
                    Operand::Phys(PhysReg::vec(src, size)),
                ],
            ),
            RegClass::Vec => inst(
                InstId::OrrV,
                [
                    Operand::Phys(PhysReg::vec(dst, 16)),
                    Operand::Phys(PhysReg::vec(src, 16)),
                    Operand::Phys(PhysReg::vec(src, 16)),
                ],
            ),
            RegClass::Mask => unimplemented!("no mask registers on aarch64"),
        }
    }

    fn gen_spill_store(&self, class: RegClass, size: u8, src: u8, offset: i32) -> InstNode {
        let reg = match class {
            RegClass::Gpr => PhysReg::gpr(src, size.max(4)),
            RegClass::Vec => PhysReg::vec(src, size),
            RegClass::Mask => unimplemented!("no mask registers on aarch64"),
        };
        inst(InstId::Str, [Operand::Phys(reg), Operand::Mem(sp_slot(offset, size))])
    }

    fn gen_spill_load(&self, class: RegClass, size: u8, dst: u8, offset: i32) -> InstNode {
        let reg = match class {
            RegClass::Gpr => PhysReg::gpr(dst, size.max(4)),
            RegClass::Vec => PhysReg::vec(dst, size),
            RegClass::Mask => unimplemented!("no mask registers on aarch64"),
        };
        inst(InstId::Ldr, [Operand::Phys(reg), Operand::Mem(sp_slot(offset, size))])
    }

    fn gen_arg_load(&self, class: RegClass, size: u8, dst: u8, entry_offset: i32) -> InstNode {
        // After the frame record push, x29 + 16 is the entry SP.
        let mem = MemOperand::base_disp(
            RegOperand::Phys(PhysReg::gpr(regs::FP, 8)),
            16 + entry_offset,
            size,
        );
        let reg = match class {
            RegClass::Gpr => PhysReg::gpr(dst, size.max(4)),
            RegClass::Vec => PhysReg::vec(dst, size),
            RegClass::Mask => unimplemented!("no mask registers on aarch64"),
        };
        inst(InstId::Ldr, [Operand::Phys(reg), Operand::Mem(mem)])
    }

    fn compute_frame(
        &self,
        _call_conv: CallConv,
        spill_size: u32,
        preserved_gprs: Vec<u8>,
        preserved_vecs: Vec<u8>,
    ) -> FrameLayout {
        // Saves happen through pre-indexed pushes, so the SP adjustment
        // covers only the (already 16-byte-aligned) spill area.
        FrameLayout {
            preserved_gprs,
            preserved_vecs,
            spill_size,
            sp_adjust: spill_size,
            vec_save_offset: 0,
        }
    }

    fn gen_prologue(
        &self,
        _call_conv: CallConv,
        frame: &FrameLayout,
    ) -> SmallVec<[InstNode; 8]> {
        let mut insts = SmallVec::new();
        let sp = PhysReg::gpr(regs::SP, 8);
        let fp = PhysReg::gpr(regs::FP, 8);
        let lr = PhysReg::gpr(regs::LR, 8);
        // stp fp, lr, [sp, #-16]!
        insts.push(inst(
            InstId::StpPre,
            [
                Operand::Phys(fp),
                Operand::Phys(lr),
                Operand::Mem(pre_post_slot(-16)),
            ],
        ));
        // mov fp, sp
        insts.push(inst(InstId::Mov, [Operand::Phys(fp), Operand::Phys(sp)]));
        push_saves(&mut insts, &frame.preserved_gprs, RegClass::Gpr);
        push_saves(&mut insts, &frame.preserved_vecs, RegClass::Vec);
        if frame.sp_adjust > 0 {
            insts.push(inst(
                InstId::Sub,
                [
                    Operand::Phys(sp),
                    Operand::Phys(sp),
                    Operand::imm(i64::from(frame.sp_adjust)),
                ],
            ));
        }
        insts
    }

    fn gen_epilogue(
        &self,
        _call_conv: CallConv,
        frame: &FrameLayout,
    ) -> SmallVec<[InstNode; 8]> {
        let mut insts = SmallVec::new();
        let sp = PhysReg::gpr(regs::SP, 8);
        let fp = PhysReg::gpr(regs::FP, 8);
        let lr = PhysReg::gpr(regs::LR, 8);
        if frame.sp_adjust > 0 {
            insts.push(inst(
                InstId::Add,
                [
                    Operand::Phys(sp),
                    Operand::Phys(sp),
                    Operand::imm(i64::from(frame.sp_adjust)),
                ],
            ));
        }
        pop_saves(&mut insts, &frame.preserved_vecs, RegClass::Vec);
        pop_saves(&mut insts, &frame.preserved_gprs, RegClass::Gpr);
        // ldp fp, lr, [sp], #16
        insts.push(inst(
            InstId::LdpPost,
            [
                Operand::Phys(fp),
                Operand::Phys(lr),
                Operand::Mem(pre_post_slot(16)),
            ],
        ));
        insts
    }
}

fn inst(id: InstId, operands: impl IntoIterator<Item = Operand>) -> InstNode {
    InstNode {
        opcode: id.into(),
        operands: operands.into_iter().collect(),
        options: InstOptions::default(),
    }
}

fn sp_slot(offset: i32, size: u8) -> MemOperand {
    MemOperand::base_disp(
        RegOperand::Phys(PhysReg::gpr(regs::SP, 8)),
        offset,
        size,
    )
}

fn pre_post_slot(disp: i32) -> MemOperand {
    sp_slot(disp, 8)
}

fn save_reg(class: RegClass, enc: u8) -> PhysReg {
    match class {
        RegClass::Gpr => PhysReg::gpr(enc, 8),
        // Callee-saved vector registers preserve their low 64 bits.
        _ => PhysReg::vec(enc, 8),
    }
}

/// Push `regs` in pairs with pre-indexed stores; a trailing odd register
/// gets a single pre-indexed store so SP stays 16-byte aligned.
fn push_saves(insts: &mut SmallVec<[InstNode; 8]>, regs_list: &[u8], class: RegClass) {
    let mut chunks = regs_list.chunks_exact(2);
    for pair in &mut chunks {
        insts.push(inst(
            InstId::StpPre,
            [
                Operand::Phys(save_reg(class, pair[0])),
                Operand::Phys(save_reg(class, pair[1])),
                Operand::Mem(pre_post_slot(-16)),
            ],
        ));
    }
    if let [odd] = chunks.remainder() {
        insts.push(inst(
            InstId::StrPre,
            [
                Operand::Phys(save_reg(class, *odd)),
                Operand::Mem(pre_post_slot(-16)),
            ],
        ));
    }
}

fn pop_saves(insts: &mut SmallVec<[InstNode; 8]>, regs_list: &[u8], class: RegClass) {
    if let [.., odd] = regs_list {
        if regs_list.len() % 2 == 1 {
            insts.push(inst(
                InstId::LdrPost,
                [
                    Operand::Phys(save_reg(class, *odd)),
                    Operand::Mem(pre_post_slot(16)),
                ],
            ));
        }
    }
    for pair in regs_list.chunks_exact(2).rev() {
        insts.push(inst(
            InstId::LdpPost,
            [
                Operand::Phys(save_reg(class, pair[0])),
                Operand::Phys(save_reg(class, pair[1])),
                Operand::Mem(pre_post_slot(16)),
            ],
        ));
    }
}
