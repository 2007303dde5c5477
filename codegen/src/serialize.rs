//! Serialization of builder IR into an assembler.
//!
//! Walks the node list exactly once, in forward order. Builder labels live
//! in their own namespace, so the serializer first mirrors them into the
//! assembler's holder and translates every label operand on the way
//! through.

use crate::ir::{AlignMode, Builder, FuncData, InstNode, NodeVisitor, Operand};
use crate::isa::TargetAssembler;
use crate::labels::Label;
use crate::result::CodegenResult;

struct SerializeCtx<'a, A: TargetAssembler> {
    asm: &'a mut A,
    label_map: Vec<Label>,
}

impl<A: TargetAssembler> SerializeCtx<'_, A> {
    fn map_label(&self, label: Label) -> Label {
        self.label_map[label.index()]
    }
}

impl<A: TargetAssembler> NodeVisitor for SerializeCtx<'_, A> {
    fn on_label(&mut self, label: Label) -> CodegenResult<()> {
        self.asm.bind(self.map_label(label))
    }

    fn on_inst(&mut self, inst: &InstNode) -> CodegenResult<()> {
        let needs_map = inst.operands.iter().any(|op| {
            matches!(op, Operand::Label(_)) || matches!(op, Operand::Mem(m) if m.label.is_some())
        });
        if !needs_map {
            return self.asm.emit_inst(inst);
        }
        let mut mapped = inst.clone();
        for op in mapped.operands.iter_mut() {
            match op {
                Operand::Label(label) => *label = self.map_label(*label),
                Operand::Mem(mem) => {
                    if let Some(label) = mem.label.as_mut() {
                        *label = self.map_label(*label);
                    }
                }
                _ => {}
            }
        }
        self.asm.emit_inst(&mapped)
    }

    fn on_align(&mut self, mode: AlignMode, align: u32) -> CodegenResult<()> {
        match mode {
            AlignMode::Code => self.asm.align_code(align),
            AlignMode::Data => self.asm.align_data(align),
        }
        Ok(())
    }

    fn on_embed_data(&mut self, data: &[u8], _elem_size: u8) -> CodegenResult<()> {
        self.asm.embed(data);
        Ok(())
    }

    fn on_func_begin(&mut self, _func: &FuncData) -> CodegenResult<()> {
        // Function boundaries carry no bytes; the allocator has already
        // materialized the prologue as ordinary instructions.
        Ok(())
    }
}

/// Serialize `builder` into `asm`. Instruction nodes must contain only
/// physical operands; run the register allocator first if virtual registers
/// were used.
pub fn serialize(builder: &Builder, asm: &mut impl TargetAssembler) -> CodegenResult<()> {
    let label_map = (0..builder.label_count())
        .map(|_| asm.new_label())
        .collect();
    let mut ctx = SerializeCtx { asm, label_map };
    builder.visit(&mut ctx)
}
