//! Architecture backends.
//!
//! Each backend supplies two things: an [`Assembler`](TargetAssembler) that
//! turns instruction nodes into bytes in a code holder, and an
//! [`IsaInfo`] implementation that the register allocator and serializer
//! query for operand use patterns, register pools, and calling-convention
//! metadata. The builder IR and the allocator are generic over both.

#[cfg(feature = "aarch64")]
pub mod aarch64;
#[cfg(feature = "x64")]
pub mod x64;

use crate::buffer::CodeOffset;
use crate::env::{Arch, CallConv};
use crate::ir::{InstInfo, InstNode, Operand, PhysReg, RegClass, Signature};
use crate::labels::Label;
use crate::result::CodegenResult;
use smallvec::SmallVec;

/// Render an operand list for `UnsupportedInstruction` diagnostics.
pub(crate) fn shape_of(operands: &[Operand]) -> String {
    let mut out = String::new();
    for (i, op) in operands.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(match op {
            Operand::Phys(r) => match r.class {
                RegClass::Gpr => "reg",
                RegClass::Vec => "vec",
                RegClass::Mask => "mask",
            },
            Operand::Virt(_) => "vreg",
            Operand::Imm(_) => "imm",
            Operand::Mem(_) => "mem",
            Operand::Label(_) => "label",
        });
    }
    out
}

/// Declare a dense per-architecture instruction-id enum with a checked
/// conversion from the raw `u16` stored in instruction nodes.
macro_rules! declare_inst_ids {
    ($(#[$attr:meta])* $name:ident { $($variant:ident),* $(,)? }) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u16)]
        #[allow(missing_docs)]
        pub enum $name { $($variant),* }

        impl $name {
            const ALL: &'static [$name] = &[$($name::$variant),*];

            /// Convert a raw opcode id back to the enum, if in range.
            pub fn from_u16(raw: u16) -> Option<Self> {
                Self::ALL.get(raw as usize).copied()
            }
        }

        impl From<$name> for u16 {
            fn from(id: $name) -> u16 {
                id as u16
            }
        }
    };
}
pub(crate) use declare_inst_ids;

/// Where one incoming parameter lives at function entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgLoc {
    /// Passed in a register.
    Reg(PhysReg),
    /// Passed on the stack; the offset is relative to the stack pointer at
    /// function entry (so on x64 the first stack argument is at offset 8,
    /// just above the return address; on AArch64 at offset 0).
    Stack(i32),
}

/// Stack-frame shape computed by the register allocator and consumed by the
/// prologue/epilogue generators.
#[derive(Clone, Debug, Default)]
pub struct FrameLayout {
    /// Callee-saved GPR encodings actually clobbered, in ascending order.
    pub preserved_gprs: Vec<u8>,
    /// Callee-saved vector encodings actually clobbered, ascending.
    pub preserved_vecs: Vec<u8>,
    /// Bytes of spill area, 16-byte aligned.
    pub spill_size: u32,
    /// Total bytes the stack pointer moves down after the register saves;
    /// includes the spill area, vector save area, and alignment padding.
    pub sp_adjust: u32,
    /// Offset of the vector save area within the SP adjustment.
    pub vec_save_offset: u32,
}

/// Per-architecture metadata the register allocator and serializer need.
pub trait IsaInfo {
    /// The architecture this describes.
    fn arch(&self) -> Arch;

    /// Static information for an opcode; errors on an id that does not
    /// belong to this architecture.
    fn inst_info(&self, opcode: u16) -> CodegenResult<InstInfo>;

    /// Allocatable register encodings for a class, in preference order
    /// (caller-saved first). Excludes SP/FP and the per-class scratch
    /// registers.
    fn allocatable(&self, call_conv: CallConv, class: RegClass) -> &'static [u8];

    /// Whether a register is callee-saved under `call_conv`.
    fn is_callee_saved(&self, call_conv: CallConv, class: RegClass, enc: u8) -> bool;

    /// Two reserved scratch registers per class, used for spill traffic and
    /// shuffle cycle breaking. Never handed out by the allocator.
    fn scratch(&self, class: RegClass) -> [u8; 2];

    /// Where each parameter of `sig` arrives.
    fn arg_locs(&self, sig: &Signature) -> CodegenResult<Vec<ArgLoc>>;

    /// Where the return value leaves, if the signature has one.
    fn ret_loc(&self, sig: &Signature) -> Option<PhysReg>;

    /// The encoding a vreg operand of `inst` is pinned to, if any (e.g. the
    /// shift count in CL on x64).
    fn fixed_operand(&self, inst: &InstNode, operand: usize) -> Option<u8>;

    /// A register-to-register move.
    fn gen_move(&self, class: RegClass, size: u8, dst: u8, src: u8) -> InstNode;

    /// Store a register to its spill slot at `[sp + offset]`.
    fn gen_spill_store(&self, class: RegClass, size: u8, src: u8, offset: i32) -> InstNode;

    /// Load a register from its spill slot at `[sp + offset]`.
    fn gen_spill_load(&self, class: RegClass, size: u8, dst: u8, offset: i32) -> InstNode;

    /// Load an incoming stack argument into a register. `entry_offset` is
    /// the `ArgLoc::Stack` offset; the generator translates it to a
    /// frame-pointer-relative access valid after the prologue.
    fn gen_arg_load(&self, class: RegClass, size: u8, dst: u8, entry_offset: i32) -> InstNode;

    /// Compose the frame layout from the scan's results: spill-area size
    /// and the preserved register sets. Encodes the architecture's save
    /// strategy (x64 reserves SP-adjust space for XMM saves and pads for
    /// push parity; AArch64 saves everything with pre-indexed pushes).
    fn compute_frame(
        &self,
        call_conv: CallConv,
        spill_size: u32,
        preserved_gprs: Vec<u8>,
        preserved_vecs: Vec<u8>,
    ) -> FrameLayout;

    /// The function prologue for `frame`.
    fn gen_prologue(&self, call_conv: CallConv, frame: &FrameLayout)
        -> SmallVec<[InstNode; 8]>;

    /// The epilogue mirror of [`gen_prologue`](Self::gen_prologue), emitted
    /// immediately before every return.
    fn gen_epilogue(&self, call_conv: CallConv, frame: &FrameLayout)
        -> SmallVec<[InstNode; 8]>;
}

/// The emission side of a backend: binds labels and encodes instruction
/// nodes into a code holder.
pub trait TargetAssembler {
    /// Allocate a fresh label in the underlying holder.
    fn new_label(&mut self) -> Label;

    /// Bind `label` at the current position.
    fn bind(&mut self, label: Label) -> CodegenResult<()>;

    /// Encode one instruction node.
    fn emit_inst(&mut self, inst: &InstNode) -> CodegenResult<()>;

    /// Align with the architecture's canonical code padding.
    fn align_code(&mut self, align: u32);

    /// Align with zero padding.
    fn align_data(&mut self, align: u32);

    /// Append raw bytes.
    fn embed(&mut self, data: &[u8]);

    /// Current offset in the holder's current section.
    fn cur_offset(&self) -> CodeOffset;
}
