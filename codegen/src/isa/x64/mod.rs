//! The x86-64 backend.

pub mod abi;
pub mod asm;
pub mod encode;
pub mod evex;
pub mod inst;
pub mod regs;
pub mod rex;
pub mod vex;

#[cfg(test)]
mod emit_tests;

pub use abi::X64;
pub use asm::{AluOp, Assembler, ShiftOp, UnaryOp};
pub use inst::InstId;

use crate::buffer::CodeOffset;
use crate::ir::InstNode;
use crate::isa::TargetAssembler;
use crate::labels::Label;
use crate::result::CodegenResult;

impl TargetAssembler for Assembler<'_> {
    fn new_label(&mut self) -> Label {
        self.holder().new_label()
    }

    fn bind(&mut self, label: Label) -> CodegenResult<()> {
        self.holder().bind_label(label)
    }

    fn emit_inst(&mut self, inst: &InstNode) -> CodegenResult<()> {
        self.emit(inst)
    }

    fn align_code(&mut self, align: u32) {
        Assembler::align_code(self, align);
    }

    fn align_data(&mut self, align: u32) {
        self.holder().align_to(align, 0);
    }

    fn embed(&mut self, data: &[u8]) {
        self.holder().put_bytes(data);
    }

    fn cur_offset(&self) -> CodeOffset {
        self.holder_ref().cur_offset()
    }
}
