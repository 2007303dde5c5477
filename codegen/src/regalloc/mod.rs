//! The register allocator: linear scan over the builder IR.
//!
//! `run` walks every function region in a builder, computes live intervals,
//! assigns physical registers or spill slots, shuffles the incoming
//! arguments into place, rewrites every instruction to physical form, and
//! inserts the prologue and epilogues. Afterwards no instruction node
//! references a virtual register.

pub mod linear;
pub mod liveness;
pub mod shuffle;

pub use linear::Loc;

use crate::env::Arch;
use crate::ir::{
    Builder, FuncData, InstNode, NodeData, NodeId, OpUse, Operand, RegClass, RegOperand, VReg,
};
use crate::isa::{ArgLoc, FrameLayout, IsaInfo};
use crate::result::{CodegenError, CodegenResult};
use linear::{Loc as RegLoc, ScanResult};
use rustc_hash::FxHashMap;
use shuffle::MoveEdge;
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Allocate every function region in `builder`. Returns the frame layout of
/// each function, in program order.
pub fn run(builder: &mut Builder, isa: &dyn IsaInfo) -> CodegenResult<Vec<FrameLayout>> {
    let regions = find_regions(builder)?;
    let mut frames = Vec::with_capacity(regions.len());
    for region in regions {
        frames.push(run_one(builder, isa, &region)?);
    }
    Ok(frames)
}

struct FuncRegion {
    begin: NodeId,
    /// Interior nodes, excluding the begin/end markers.
    body: Vec<NodeId>,
    func: FuncData,
}

fn find_regions(builder: &Builder) -> CodegenResult<Vec<FuncRegion>> {
    let mut regions = Vec::new();
    let mut current: Option<FuncRegion> = None;
    for node in builder.iter() {
        match builder.data(node) {
            NodeData::FuncBegin(func) => {
                if current.is_some() {
                    return Err(CodegenError::StateError(
                        "nested function regions".to_string(),
                    ));
                }
                current = Some(FuncRegion {
                    begin: node,
                    body: Vec::new(),
                    func: (**func).clone(),
                });
            }
            NodeData::FuncEnd => {
                let region = current.take().ok_or_else(|| {
                    CodegenError::StateError("function end without begin".to_string())
                })?;
                regions.push(region);
            }
            _ => {
                if let Some(region) = current.as_mut() {
                    region.body.push(node);
                }
            }
        }
    }
    if current.is_some() {
        return Err(CodegenError::StateError(
            "unterminated function region".to_string(),
        ));
    }
    Ok(regions)
}

fn run_one(
    builder: &mut Builder,
    isa: &dyn IsaInfo,
    region: &FuncRegion,
) -> CodegenResult<FrameLayout> {
    let call_conv = region.func.signature.call_conv;
    let live = liveness::collect(builder, isa, &region.body, &region.func.args, call_conv)?;

    // Per-class pools: allocatable order minus everything excluded.
    let mut pools: FxHashMap<RegClass, VecDeque<u8>> = FxHashMap::default();
    for class in [RegClass::Gpr, RegClass::Vec, RegClass::Mask] {
        let excluded: &[u8] = match class {
            RegClass::Gpr => &live.excluded_gprs,
            RegClass::Vec => &live.excluded_vecs,
            RegClass::Mask => &[],
        };
        let pool = isa
            .allocatable(call_conv, class)
            .iter()
            .copied()
            .filter(|enc| !excluded.contains(enc))
            .collect();
        pools.insert(class, pool);
    }

    let intervals: Vec<liveness::Interval> = live.intervals.values().cloned().collect();
    let ScanResult {
        locs,
        spill_size,
        used_regs,
    } = linear::scan(intervals, pools);

    // Callee-saved accounting: registers the allocator handed out plus any
    // explicitly written physical registers, minus the frame pointer (the
    // prologue handles it unconditionally).
    let fp_enc = match isa.arch() {
        #[cfg(feature = "x64")]
        Arch::X64 => crate::isa::x64::regs::RBP,
        #[cfg(feature = "aarch64")]
        Arch::Aarch64 => crate::isa::aarch64::regs::FP,
        #[allow(unreachable_patterns)]
        _ => u8::MAX,
    };
    let mut preserved_gprs = Vec::new();
    let mut preserved_vecs = Vec::new();
    for &(class, enc) in used_regs.iter().chain(&live.explicit_preserved) {
        if !isa.is_callee_saved(call_conv, class, enc) {
            continue;
        }
        let set = match class {
            RegClass::Gpr => {
                if enc == fp_enc {
                    continue;
                }
                &mut preserved_gprs
            }
            RegClass::Vec => &mut preserved_vecs,
            RegClass::Mask => continue,
        };
        if !set.contains(&enc) {
            set.push(enc);
        }
    }
    preserved_gprs.sort_unstable();
    preserved_vecs.sort_unstable();

    let frame = isa.compute_frame(call_conv, spill_size, preserved_gprs, preserved_vecs);
    log::debug!(
        "frame: {} gpr saves, {} vec saves, {} spill bytes, sp adjust {}",
        frame.preserved_gprs.len(),
        frame.preserved_vecs.len(),
        frame.spill_size,
        frame.sp_adjust
    );

    // Pass 6: rewrite instruction operands to physical form.
    for &node in &live.insts {
        rewrite_inst(builder, isa, node, &locs)?;
    }

    // Pass 5/7: prologue, argument shuffle, epilogues.
    let mut cursor = region.begin;
    for inst in isa.gen_prologue(call_conv, &frame) {
        cursor = builder.insert_after(cursor, NodeData::Inst(inst));
    }
    for inst in arg_shuffle(builder, isa, &region.func, &locs)? {
        cursor = builder.insert_after(cursor, NodeData::Inst(inst));
    }
    for &pos in &live.ret_positions {
        let ret_node = live.insts[pos as usize];
        for inst in isa.gen_epilogue(call_conv, &frame) {
            builder.insert_before(ret_node, NodeData::Inst(inst));
        }
    }

    Ok(frame)
}

/// Rewrite one instruction: virtual operands become physical registers, and
/// spilled virtuals gain reload/writeback traffic through the scratch
/// registers.
fn rewrite_inst(
    builder: &mut Builder,
    isa: &dyn IsaInfo,
    node: NodeId,
    locs: &FxHashMap<VReg, RegLoc>,
) -> CodegenResult<()> {
    let NodeData::Inst(inst) = builder.data(node) else {
        unreachable!();
    };
    let inst = inst.clone();
    let info = isa.inst_info(inst.opcode)?;

    let mut pre: SmallVec<[InstNode; 2]> = SmallVec::new();
    let mut post: SmallVec<[InstNode; 2]> = SmallVec::new();
    let mut scratch_used = 0usize;
    let mut new_inst = inst.clone();

    let loc_of = |vreg: VReg| -> RegLoc {
        *locs.get(&vreg).expect("vreg has a location after scanning")
    };

    let mut take_scratch = |class: RegClass, scratch_used: &mut usize| -> CodegenResult<u8> {
        let pair = isa.scratch(class);
        if *scratch_used >= 2 {
            return Err(CodegenError::InvalidOperand {
                inst: info.name,
                operand: 0,
                offset: 0,
                message: "more than two spilled operands in one instruction".to_string(),
            });
        }
        let enc = pair[*scratch_used];
        *scratch_used += 1;
        Ok(enc)
    };

    for (slot, operand) in inst.operands.iter().enumerate() {
        match operand {
            Operand::Virt(vreg) => {
                let class = builder.vreg_class(*vreg);
                let size = builder.vreg_size(*vreg);
                let use_kind = info.op_use(slot);

                if let Some(fixed) = isa.fixed_operand(&inst, slot) {
                    // A pinned operand: satisfy it with a move into the
                    // reserved encoding, which is excluded from the pools.
                    match loc_of(*vreg) {
                        RegLoc::Reg(enc) => pre.push(isa.gen_move(class, size, fixed, enc)),
                        RegLoc::Spill(off) => {
                            pre.push(isa.gen_spill_load(class, size, fixed, off as i32))
                        }
                    }
                    new_inst.operands[slot] = Operand::Phys(phys(class, fixed, size));
                    continue;
                }

                match loc_of(*vreg) {
                    RegLoc::Reg(enc) => {
                        new_inst.operands[slot] = Operand::Phys(phys(class, enc, size));
                    }
                    RegLoc::Spill(off) => {
                        let scratch = take_scratch(class, &mut scratch_used)?;
                        if use_kind != OpUse::Write {
                            pre.push(isa.gen_spill_load(class, size, scratch, off as i32));
                        }
                        if use_kind != OpUse::Read {
                            post.push(isa.gen_spill_store(class, size, scratch, off as i32));
                        }
                        new_inst.operands[slot] = Operand::Phys(phys(class, scratch, size));
                    }
                }
            }
            Operand::Mem(mem) => {
                let mut mem = *mem;
                for part in [&mut mem.base, &mut mem.index] {
                    let Some(RegOperand::Virt(vreg)) = part else {
                        continue;
                    };
                    let vreg = *vreg;
                    let class = builder.vreg_class(vreg);
                    let size = builder.vreg_size(vreg);
                    let enc = match loc_of(vreg) {
                        RegLoc::Reg(enc) => enc,
                        RegLoc::Spill(off) => {
                            let scratch = take_scratch(class, &mut scratch_used)?;
                            pre.push(isa.gen_spill_load(class, size, scratch, off as i32));
                            scratch
                        }
                    };
                    *part = Some(RegOperand::Phys(phys(class, enc, 8)));
                }
                new_inst.operands[slot] = Operand::Mem(mem);
            }
            _ => {}
        }
    }

    *builder.data_mut(node) = NodeData::Inst(new_inst);
    for inst in pre {
        builder.insert_before(node, NodeData::Inst(inst));
    }
    for inst in post {
        builder.insert_after(node, NodeData::Inst(inst));
    }
    Ok(())
}

fn phys(class: RegClass, enc: u8, size: u8) -> crate::ir::PhysReg {
    crate::ir::PhysReg { class, enc, size }
}

/// Pass 5: move every incoming argument from its ABI location to its
/// allocated home. Spill stores of register arguments run first (they only
/// read ABI registers), then the register permutation, then loads of stack
/// arguments (their destinations are dead as shuffle sources by then).
fn arg_shuffle(
    builder: &Builder,
    isa: &dyn IsaInfo,
    func: &FuncData,
    locs: &FxHashMap<VReg, RegLoc>,
) -> CodegenResult<SmallVec<[InstNode; 8]>> {
    let arg_locs = isa.arg_locs(&func.signature)?;
    let mut stores: SmallVec<[InstNode; 8]> = SmallVec::new();
    let mut edges: Vec<MoveEdge> = Vec::new();
    let mut loads: SmallVec<[InstNode; 8]> = SmallVec::new();

    for (vreg, abi) in func.args.iter().zip(&arg_locs) {
        let Some(loc) = locs.get(vreg) else {
            // The parameter is never used; no move needed.
            continue;
        };
        let class = builder.vreg_class(*vreg);
        let size = builder.vreg_size(*vreg);
        match (abi, loc) {
            (ArgLoc::Reg(src), RegLoc::Reg(dst)) => {
                if src.class != class {
                    return Err(CodegenError::StateError(format!(
                        "argument {vreg} class does not match its ABI location"
                    )));
                }
                edges.push(MoveEdge {
                    class,
                    size,
                    dst: *dst,
                    src: src.enc,
                });
            }
            (ArgLoc::Reg(src), RegLoc::Spill(off)) => {
                stores.push(isa.gen_spill_store(class, size, src.enc, *off as i32));
            }
            (ArgLoc::Stack(entry_off), RegLoc::Reg(dst)) => {
                loads.push(isa.gen_arg_load(class, size, *dst, *entry_off));
            }
            (ArgLoc::Stack(entry_off), RegLoc::Spill(off)) => {
                let scratch = isa.scratch(class)[0];
                loads.push(isa.gen_arg_load(class, size, scratch, *entry_off));
                loads.push(isa.gen_spill_store(class, size, scratch, *off as i32));
            }
        }
    }

    let mut out: SmallVec<[InstNode; 8]> = stores;
    out.extend(shuffle::resolve_parallel_moves(isa, edges));
    out.extend(loads);
    Ok(out)
}

#[cfg(test)]
#[cfg(feature = "x64")]
mod tests {
    use super::*;
    use crate::env::CallConv;
    use crate::ir::{AbiType, InstOptions, Signature};
    use crate::isa::x64::{regs, InstId, X64};

    fn sig(params: Vec<AbiType>, ret: Option<AbiType>) -> Signature {
        Signature {
            params,
            ret,
            call_conv: CallConv::SystemV,
        }
    }

    fn count_insts(builder: &Builder, opcode: InstId) -> usize {
        builder
            .iter()
            .filter(|&n| {
                matches!(builder.data(n), NodeData::Inst(inst) if inst.opcode == u16::from(opcode))
            })
            .count()
    }

    #[test]
    fn arguments_are_shuffled_into_allocated_registers() {
        let mut b = Builder::new();
        let a0 = b.new_vreg(RegClass::Gpr, 8);
        let a1 = b.new_vreg(RegClass::Gpr, 8);
        b.func_begin(sig(vec![AbiType::I64, AbiType::I64], Some(AbiType::I64)), &[a0, a1])
            .unwrap();
        b.inst(
            InstId::Add,
            [Operand::from(a0), Operand::from(a1)],
            InstOptions::default(),
        );
        b.inst(
            InstId::Mov,
            [
                Operand::from(crate::ir::PhysReg::gpr(regs::RAX, 8)),
                Operand::from(a0),
            ],
            InstOptions::default(),
        );
        b.inst(InstId::Ret, [], InstOptions::default());
        b.func_end().unwrap();

        let frames = run(&mut b, &X64).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].spill_size, 0);

        // No virtual operands survive and a prologue/epilogue was inserted.
        for node in b.iter() {
            if let NodeData::Inst(inst) = b.data(node) {
                assert!(!inst
                    .operands
                    .iter()
                    .any(|op| matches!(op, Operand::Virt(_))));
            }
        }
        assert!(count_insts(&b, InstId::Push) >= 1);
        assert!(count_insts(&b, InstId::Pop) >= 1);
    }

    #[test]
    fn loop_back_edges_keep_registers_live() {
        // v0 is initialized before the loop and used inside it; v1 is a
        // counter. Without back-edge extension v0's register could be
        // reused mid-loop.
        let mut b = Builder::new();
        b.func_begin(sig(vec![], Some(AbiType::I64)), &[]).unwrap();
        let v0 = b.new_vreg(RegClass::Gpr, 8);
        let v1 = b.new_vreg(RegClass::Gpr, 8);
        let v2 = b.new_vreg(RegClass::Gpr, 8);
        let top = b.new_label();
        b.inst(InstId::Mov, [Operand::from(v0), Operand::imm(7)], InstOptions::default());
        b.inst(InstId::Mov, [Operand::from(v1), Operand::imm(10)], InstOptions::default());
        b.bind(top);
        // A short-lived vreg inside the loop.
        b.inst(InstId::Mov, [Operand::from(v2), Operand::from(v0)], InstOptions::default());
        b.inst(
            InstId::Sub,
            [Operand::from(v1), Operand::imm(1)],
            InstOptions::default(),
        );
        b.inst(
            InstId::Jcc,
            [Operand::from(top)],
            InstOptions::with_cond(crate::ir::Cond::Ne),
        );
        b.inst(InstId::Ret, [], InstOptions::default());
        b.func_end().unwrap();

        let live = {
            let regions = find_regions(&b).unwrap();
            liveness::collect(&b, &X64, &regions[0].body, &[], CallConv::SystemV).unwrap()
        };
        // v0's interval must extend through the backward branch position.
        let v0_interval = &live.intervals[&v0];
        let branch_pos = live
            .insts
            .len() as u32
            - 2; // the jcc is the second-to-last instruction
        assert!(v0_interval.end >= branch_pos);

        run(&mut b, &X64).unwrap();
    }

    #[test]
    fn fixed_shift_count_moves_into_cl() {
        let mut b = Builder::new();
        let val = b.new_vreg(RegClass::Gpr, 8);
        let count = b.new_vreg(RegClass::Gpr, 8);
        b.func_begin(sig(vec![AbiType::I64, AbiType::I64], Some(AbiType::I64)), &[val, count])
            .unwrap();
        b.inst(
            InstId::Shl,
            [Operand::from(val), Operand::from(count)],
            InstOptions::default(),
        );
        b.inst(
            InstId::Mov,
            [
                Operand::from(crate::ir::PhysReg::gpr(regs::RAX, 8)),
                Operand::from(val),
            ],
            InstOptions::default(),
        );
        b.inst(InstId::Ret, [], InstOptions::default());
        b.func_end().unwrap();

        run(&mut b, &X64).unwrap();

        // The shift's count operand must now be RCX, and nothing else may
        // have been allocated to RCX.
        let mut saw_shift = false;
        for node in b.iter() {
            if let NodeData::Inst(inst) = b.data(node) {
                if inst.opcode == u16::from(InstId::Shl) {
                    saw_shift = true;
                    match inst.operands[1] {
                        Operand::Phys(reg) => assert_eq!(reg.enc, regs::RCX),
                        ref op => panic!("unexpected shift count operand {op:?}"),
                    }
                }
            }
        }
        assert!(saw_shift);
    }
}
