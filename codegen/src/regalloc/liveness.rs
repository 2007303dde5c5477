//! Pass 1–3: instruction numbering, use collection, and live-interval
//! construction.

use crate::ir::{Builder, NodeData, NodeId, OpUse, Operand, RegClass, VReg};
use crate::isa::IsaInfo;
use crate::labels::Label;
use crate::result::{CodegenError, CodegenResult};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// One recorded use of a virtual register.
#[derive(Clone, Copy, Debug)]
pub struct UseSite {
    /// Dense instruction position within the function.
    pub pos: u32,
    /// How the instruction touches the register.
    pub kind: OpUse,
}

/// A virtual register's live interval with its use list.
#[derive(Clone, Debug)]
pub struct Interval {
    pub vreg: VReg,
    pub class: RegClass,
    pub size: u8,
    pub start: u32,
    pub end: u32,
    pub uses: SmallVec<[UseSite; 4]>,
}

/// Everything the scan needs to know about one function region.
pub struct FuncLiveness {
    /// Instruction node ids in program order; index = position.
    pub insts: Vec<NodeId>,
    /// Intervals indexed by vreg, absent for vregs never used here.
    pub intervals: FxHashMap<VReg, Interval>,
    /// GPR encodings that must not be allocated: implicit instruction
    /// requirements, explicitly named physical registers, and (when the
    /// region contains a call) every caller-saved register.
    pub excluded_gprs: Vec<u8>,
    /// Same, for the vector class.
    pub excluded_vecs: Vec<u8>,
    /// Callee-saved registers explicitly written by physical-register
    /// operands; preserved even though the allocator never hands them out.
    pub explicit_preserved: Vec<(RegClass, u8)>,
    /// Positions of return instructions.
    pub ret_positions: Vec<u32>,
}

/// Collect liveness for the region `[begin, end)` given the function's
/// argument vregs (whose intervals are pinned to start at entry).
pub fn collect(
    builder: &Builder,
    isa: &dyn IsaInfo,
    region: &[NodeId],
    args: &[VReg],
    call_conv: crate::env::CallConv,
) -> CodegenResult<FuncLiveness> {
    let mut insts = Vec::new();
    let mut label_pos: FxHashMap<Label, u32> = FxHashMap::default();

    // Pass 1: numbering. Labels bind at the position of the following
    // instruction.
    for &node in region {
        match builder.data(node) {
            NodeData::Inst(_) => insts.push(node),
            NodeData::BindLabel(label) => {
                label_pos.insert(*label, insts.len() as u32);
            }
            _ => {}
        }
    }

    let mut intervals: FxHashMap<VReg, Interval> = FxHashMap::default();
    let mut excluded_gprs: Vec<u8> = Vec::new();
    let mut excluded_vecs: Vec<u8> = Vec::new();
    let mut explicit_preserved: Vec<(RegClass, u8)> = Vec::new();
    let mut ret_positions = Vec::new();
    let mut back_edges: Vec<(u32, u32)> = Vec::new();
    let mut has_call = false;

    let mut record = |intervals: &mut FxHashMap<VReg, Interval>,
                      vreg: VReg,
                      pos: u32,
                      kind: OpUse|
     -> CodegenResult<()> {
        let class = builder.vreg_class(vreg);
        let size = builder.vreg_size(vreg);
        let interval = intervals.entry(vreg).or_insert_with(|| Interval {
            vreg,
            class,
            size,
            start: pos,
            end: pos,
            uses: SmallVec::new(),
        });
        interval.start = interval.start.min(pos);
        interval.end = interval.end.max(pos);
        interval.uses.push(UseSite { pos, kind });
        Ok(())
    };

    // The incoming arguments are written by the entry shuffle, so their
    // intervals begin at position 0 regardless of the first explicit use.
    for &arg in args {
        record(&mut intervals, arg, 0, OpUse::Write)?;
    }

    // Pass 2: use collection.
    for (pos, &node) in insts.iter().enumerate() {
        let pos = pos as u32;
        let NodeData::Inst(inst) = builder.data(node) else {
            unreachable!();
        };
        let info = isa.inst_info(inst.opcode)?;
        if info.is_ret {
            ret_positions.push(pos);
        }
        if info.is_call {
            has_call = true;
        }
        for &enc in info.implicit_gprs {
            if !excluded_gprs.contains(&enc) {
                excluded_gprs.push(enc);
            }
        }
        for (slot, operand) in inst.operands.iter().enumerate() {
            match operand {
                Operand::Virt(vreg) => record(&mut intervals, *vreg, pos, info.op_use(slot))?,
                Operand::Phys(reg) => {
                    let excluded = match reg.class {
                        RegClass::Gpr => &mut excluded_gprs,
                        RegClass::Vec => &mut excluded_vecs,
                        RegClass::Mask => continue,
                    };
                    if !excluded.contains(&reg.enc) {
                        excluded.push(reg.enc);
                    }
                    if info.op_use(slot) != OpUse::Read
                        && isa.is_callee_saved(call_conv, reg.class, reg.enc)
                        && !explicit_preserved.contains(&(reg.class, reg.enc))
                    {
                        explicit_preserved.push((reg.class, reg.enc));
                    }
                }
                Operand::Mem(mem) => {
                    for reg in [&mem.base, &mem.index].into_iter().flatten() {
                        match reg {
                            crate::ir::RegOperand::Virt(vreg) => {
                                record(&mut intervals, *vreg, pos, OpUse::Read)?
                            }
                            crate::ir::RegOperand::Phys(reg) => {
                                let excluded = match reg.class {
                                    RegClass::Gpr => &mut excluded_gprs,
                                    RegClass::Vec => &mut excluded_vecs,
                                    RegClass::Mask => continue,
                                };
                                if !excluded.contains(&reg.enc) {
                                    excluded.push(reg.enc);
                                }
                            }
                        }
                    }
                }
                Operand::Label(label) => {
                    if let Some(&target) = label_pos.get(label) {
                        if target <= pos {
                            back_edges.push((target, pos));
                        }
                    }
                }
                Operand::Imm(_) => {}
            }
        }
    }

    if has_call {
        // A call clobbers every caller-saved register; rather than model
        // interference precisely, the pool shrinks to the callee-saved set.
        for class in [RegClass::Gpr, RegClass::Vec] {
            let excluded = match class {
                RegClass::Gpr => &mut excluded_gprs,
                _ => &mut excluded_vecs,
            };
            for &enc in isa.allocatable(call_conv, class) {
                if !isa.is_callee_saved(call_conv, class, enc) && !excluded.contains(&enc) {
                    excluded.push(enc);
                }
            }
        }
    }

    // Pass 3: close intervals over loops. A backward branch at p to a label
    // at q keeps every interval intersecting [q, p] live through p.
    let mut changed = true;
    while changed {
        changed = false;
        for &(q, p) in &back_edges {
            for interval in intervals.values_mut() {
                if interval.start <= p && interval.end >= q && interval.end < p {
                    interval.end = p;
                    changed = true;
                }
            }
        }
    }

    if intervals.len() > u32::MAX as usize {
        return Err(CodegenError::AllocationFailed(
            "too many virtual registers".to_string(),
        ));
    }

    log::trace!(
        "liveness: {} insts, {} intervals, {} back edges",
        insts.len(),
        intervals.len(),
        back_edges.len()
    );

    Ok(FuncLiveness {
        insts,
        intervals,
        excluded_gprs,
        excluded_vecs,
        explicit_preserved,
        ret_positions,
    })
}
