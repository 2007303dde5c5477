//! x64 calling conventions and allocator metadata.
//!
//! Two conventions are supported: System V AMD64 and Win64. The frame model
//! is the same for both: push rbp, establish rbp, push the clobbered
//! callee-saved GPRs, drop SP for spills (and, under Win64, the XMM save
//! area), with incoming stack arguments addressed off rbp.

use super::inst::InstId;
use super::regs;
use crate::env::{Arch, CallConv};
use crate::ir::{
    InstInfo, InstNode, InstOptions, MemOperand, Operand, PhysReg, RegClass, RegOperand,
    Signature,
};
use crate::isa::{ArgLoc, FrameLayout, IsaInfo};
use crate::result::{CodegenError, CodegenResult};
use smallvec::SmallVec;

/// System V integer argument registers, in order.
pub const SYSV_INT_ARGS: &[u8] = &[
    regs::RDI,
    regs::RSI,
    regs::RDX,
    regs::RCX,
    regs::R8,
    regs::R9,
];

/// Win64 integer argument registers, in order.
pub const WIN64_INT_ARGS: &[u8] = &[regs::RCX, regs::RDX, regs::R8, regs::R9];

const SYSV_ALLOC_GPR: &[u8] = &[
    regs::RAX,
    regs::RCX,
    regs::RDX,
    regs::RSI,
    regs::RDI,
    regs::R8,
    regs::R9,
    regs::RBX,
    regs::R12,
    regs::R13,
    regs::R14,
    regs::R15,
];

const WIN64_ALLOC_GPR: &[u8] = &[
    regs::RAX,
    regs::RCX,
    regs::RDX,
    regs::R8,
    regs::R9,
    regs::RBX,
    regs::RDI,
    regs::RSI,
    regs::R12,
    regs::R13,
    regs::R14,
    regs::R15,
];

const ALLOC_VEC: &[u8] = &[0, 1, 2, 3, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
const ALLOC_MASK: &[u8] = &[1, 2, 3, 4, 5];

/// The x64 backend's allocator/serializer metadata.
pub struct X64;

impl X64 {
    fn stack_args_base(call_conv: CallConv) -> i32 {
        match call_conv {
            // Return address at entry SP; 32 bytes of shadow space above it.
            CallConv::WindowsFastcall => 8 + 32,
            _ => 8,
        }
    }
}

impl IsaInfo for X64 {
    fn arch(&self) -> Arch {
        Arch::X64
    }

    fn inst_info(&self, opcode: u16) -> CodegenResult<InstInfo> {
        InstId::from_u16(opcode)
            .map(InstId::info)
            .ok_or_else(|| CodegenError::UnsupportedInstruction {
                inst: "<unknown>",
                shape: format!("x64 opcode {opcode}"),
            })
    }

    fn allocatable(&self, call_conv: CallConv, class: RegClass) -> &'static [u8] {
        match class {
            RegClass::Gpr => match call_conv {
                CallConv::WindowsFastcall => WIN64_ALLOC_GPR,
                _ => SYSV_ALLOC_GPR,
            },
            RegClass::Vec => ALLOC_VEC,
            RegClass::Mask => ALLOC_MASK,
        }
    }

    fn is_callee_saved(&self, call_conv: CallConv, class: RegClass, enc: u8) -> bool {
        match (call_conv, class) {
            (CallConv::WindowsFastcall, RegClass::Gpr) => matches!(
                enc,
                regs::RBX | regs::RBP | regs::RDI | regs::RSI | regs::R12..=regs::R15
            ),
            (CallConv::WindowsFastcall, RegClass::Vec) => (6..=15).contains(&enc),
            (_, RegClass::Gpr) => {
                matches!(enc, regs::RBX | regs::RBP | regs::R12..=regs::R15)
            }
            _ => false,
        }
    }

    fn scratch(&self, class: RegClass) -> [u8; 2] {
        match class {
            RegClass::Gpr => [regs::R10, regs::R11],
            RegClass::Vec => [4, 5],
            RegClass::Mask => [6, 7],
        }
    }

    fn arg_locs(&self, sig: &Signature) -> CodegenResult<Vec<ArgLoc>> {
        let mut locs = Vec::with_capacity(sig.params.len());
        let mut stack = Self::stack_args_base(sig.call_conv);
        match sig.call_conv {
            CallConv::WindowsFastcall => {
                // Win64 argument slots are positional across classes.
                for (i, &ty) in sig.params.iter().enumerate() {
                    let loc = if i < 4 {
                        match ty.reg_class() {
                            RegClass::Gpr => {
                                ArgLoc::Reg(PhysReg::gpr(WIN64_INT_ARGS[i], ty.bytes().max(4)))
                            }
                            _ => ArgLoc::Reg(PhysReg::vec(i as u8, 16)),
                        }
                    } else {
                        let loc = ArgLoc::Stack(stack);
                        stack += 8;
                        loc
                    };
                    locs.push(loc);
                }
            }
            CallConv::SystemV => {
                let mut next_int = 0;
                let mut next_vec = 0;
                for &ty in &sig.params {
                    let loc = match ty.reg_class() {
                        RegClass::Gpr if next_int < SYSV_INT_ARGS.len() => {
                            let reg = SYSV_INT_ARGS[next_int];
                            next_int += 1;
                            ArgLoc::Reg(PhysReg::gpr(reg, ty.bytes().max(4)))
                        }
                        RegClass::Vec if next_vec < 8 => {
                            let reg = next_vec as u8;
                            next_vec += 1;
                            ArgLoc::Reg(PhysReg::vec(reg, 16))
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
            }
            CallConv::Aapcs64 => {
                return Err(CodegenError::StateError(
                    "aapcs64 signature in an x64 function".to_string(),
                ))
            }
        }
        Ok(locs)
    }

    fn ret_loc(&self, sig: &Signature) -> Option<PhysReg> {
        sig.ret.map(|ty| match ty.reg_class() {
            RegClass::Gpr => PhysReg::gpr(regs::RAX, ty.bytes().max(4)),
            _ => PhysReg::vec(0, 16),
        })
    }

    fn fixed_operand(&self, inst: &InstNode, operand: usize) -> Option<u8> {
        let id = InstId::from_u16(inst.opcode)?;
        match id {
            // The variable shift count must live in CL.
            InstId::Shl | InstId::Shr | InstId::Sar | InstId::Rol | InstId::Ror
                if operand == 1 && matches!(inst.operands.get(1), Some(Operand::Virt(_))) =>
            {
                Some(regs::RCX)
            }
            _ => None,
        }
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
            RegClass::Vec if size <= 16 => inst(
                InstId::Movaps,
                [
                    Operand::Phys(PhysReg::vec(dst, 16)),
                    Operand::Phys(PhysReg::vec(src, 16)),
                ],
            ),
            RegClass::Vec => inst(
                InstId::Vmovaps,
                [
                    Operand::Phys(PhysReg::vec(dst, size)),
                    Operand::Phys(PhysReg::vec(src, size)),
                ],
            ),
            RegClass::Mask => unimplemented!("opmask moves are not in the allocator's scope"),
        }
    }

    fn gen_spill_store(&self, class: RegClass, size: u8, src: u8, offset: i32) -> InstNode {
        let slot = spill_slot(offset, size);
        match class {
            RegClass::Gpr => inst(
                InstId::Mov,
                [
                    Operand::Mem(slot),
                    Operand::Phys(PhysReg::gpr(src, size.max(4))),
                ],
            ),
            RegClass::Vec => {
                let (id, reg) = vec_mem_op(size, src);
                inst(id, [Operand::Mem(slot), Operand::Phys(reg)])
            }
            RegClass::Mask => unimplemented!("opmask spills are not in the allocator's scope"),
        }
    }

    fn gen_spill_load(&self, class: RegClass, size: u8, dst: u8, offset: i32) -> InstNode {
        let slot = spill_slot(offset, size);
        match class {
            RegClass::Gpr => inst(
                InstId::Mov,
                [
                    Operand::Phys(PhysReg::gpr(dst, size.max(4))),
                    Operand::Mem(slot),
                ],
            ),
            RegClass::Vec => {
                let (id, reg) = vec_mem_op(size, dst);
                inst(id, [Operand::Phys(reg), Operand::Mem(slot)])
            }
            RegClass::Mask => unimplemented!("opmask spills are not in the allocator's scope"),
        }
    }

    fn gen_arg_load(&self, class: RegClass, size: u8, dst: u8, entry_offset: i32) -> InstNode {
        // After `push rbp; mov rbp, rsp`, the entry SP is rbp + 8.
        let mem = MemOperand::base_disp(
            RegOperand::Phys(PhysReg::gpr(regs::RBP, 8)),
            8 + entry_offset,
            size,
        );
        match class {
            RegClass::Gpr => inst(
                InstId::Mov,
                [
                    Operand::Phys(PhysReg::gpr(dst, size.max(4))),
                    Operand::Mem(mem),
                ],
            ),
            RegClass::Vec => {
                let (id, reg) = vec_mem_op(size, dst);
                inst(id, [Operand::Phys(reg), Operand::Mem(mem)])
            }
            RegClass::Mask => unimplemented!("opmask arguments are not supported"),
        }
    }

    fn compute_frame(
        &self,
        _call_conv: CallConv,
        spill_size: u32,
        preserved_gprs: Vec<u8>,
        preserved_vecs: Vec<u8>,
    ) -> FrameLayout {
        // The XMM save area sits above the spill slots inside the SP
        // adjustment; an extra 8 bytes restores 16-byte alignment when the
        // push count (rbp plus preserved GPRs) is even, i.e. the number of
        // preserved GPRs is odd.
        let vec_save_offset = spill_size;
        let base = spill_size + 16 * preserved_vecs.len() as u32;
        let mut sp_adjust = (base + 15) & !15;
        if preserved_gprs.len() % 2 == 1 {
            sp_adjust += 8;
        }
        FrameLayout {
            preserved_gprs,
            preserved_vecs,
            spill_size,
            sp_adjust,
            vec_save_offset,
        }
    }

    fn gen_prologue(
        &self,
        _call_conv: CallConv,
        frame: &FrameLayout,
    ) -> SmallVec<[InstNode; 8]> {
        let mut insts = SmallVec::new();
        let rbp = PhysReg::gpr(regs::RBP, 8);
        let rsp = PhysReg::gpr(regs::RSP, 8);
        insts.push(inst(InstId::Push, [Operand::Phys(rbp)]));
        insts.push(inst(
            InstId::Mov,
            [Operand::Phys(rbp), Operand::Phys(rsp)],
        ));
        for &enc in &frame.preserved_gprs {
            insts.push(inst(InstId::Push, [Operand::Phys(PhysReg::gpr(enc, 8))]));
        }
        if frame.sp_adjust > 0 {
            insts.push(inst(
                InstId::Sub,
                [Operand::Phys(rsp), Operand::imm(i64::from(frame.sp_adjust))],
            ));
        }
        for (i, &enc) in frame.preserved_vecs.iter().enumerate() {
            let off = frame.vec_save_offset + 16 * i as u32;
            insts.push(inst(
                InstId::Movdqa,
                [
                    Operand::Mem(spill_slot(off as i32, 16)),
                    Operand::Phys(PhysReg::vec(enc, 16)),
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
        let rbp = PhysReg::gpr(regs::RBP, 8);
        let rsp = PhysReg::gpr(regs::RSP, 8);
        for (i, &enc) in frame.preserved_vecs.iter().enumerate() {
            let off = frame.vec_save_offset + 16 * i as u32;
            insts.push(inst(
                InstId::Movdqa,
                [
                    Operand::Phys(PhysReg::vec(enc, 16)),
                    Operand::Mem(spill_slot(off as i32, 16)),
                ],
            ));
        }
        if frame.sp_adjust > 0 {
            insts.push(inst(
                InstId::Add,
                [Operand::Phys(rsp), Operand::imm(i64::from(frame.sp_adjust))],
            ));
        }
        for &enc in frame.preserved_gprs.iter().rev() {
            insts.push(inst(InstId::Pop, [Operand::Phys(PhysReg::gpr(enc, 8))]));
        }
        insts.push(inst(InstId::Pop, [Operand::Phys(rbp)]));
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

fn spill_slot(offset: i32, size: u8) -> MemOperand {
    MemOperand::base_disp(
        RegOperand::Phys(PhysReg::gpr(regs::RSP, 8)),
        offset,
        size,
    )
}

fn vec_mem_op(size: u8, enc: u8) -> (InstId, PhysReg) {
    match size {
        4 => (InstId::Movss, PhysReg::vec(enc, 16)),
        8 => (InstId::Movsd, PhysReg::vec(enc, 16)),
        16 => (InstId::Movdqu, PhysReg::vec(enc, 16)),
        _ => (InstId::Vmovups, PhysReg::vec(enc, size)),
    }
}