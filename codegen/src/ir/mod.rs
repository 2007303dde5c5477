//! The builder intermediate representation.
//!
//! A builder records intent as a doubly-linked list of typed nodes:
//! instructions, label binds, alignment, embedded data, comments, sentinels,
//! and function boundaries. Instruction operands may name virtual registers;
//! the register allocator rewrites them to physical registers or spill slots
//! before serialization.
//!
//! Nodes are arena-owned and addressed by stable indices, so the doubly
//! linked structure carries no ownership cycles.

mod builder;

pub use builder::Builder;

use crate::env::CallConv;
use crate::labels::Label;
use smallvec::SmallVec;
use std::fmt;

/// Register classes the allocator distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// General-purpose integer registers.
    Gpr,
    /// Vector/floating registers (XMM/YMM/ZMM or V0..V31).
    Vec,
    /// AVX-512 opmask registers.
    Mask,
}

/// A physical register: class, hardware encoding, and access size in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PhysReg {
    /// Register class.
    pub class: RegClass,
    /// Hardware encoding index, 0..31.
    pub enc: u8,
    /// Logical access size in bytes (1/2/4/8 for GPRs, up to 64 for
    /// vectors).
    pub size: u8,
}

impl PhysReg {
    /// A GPR with the given encoding and size.
    pub fn gpr(enc: u8, size: u8) -> Self {
        Self {
            class: RegClass::Gpr,
            enc,
            size,
        }
    }

    /// A vector register with the given encoding and size.
    pub fn vec(enc: u8, size: u8) -> Self {
        Self {
            class: RegClass::Vec,
            enc,
            size,
        }
    }

    /// An opmask register.
    pub fn mask(enc: u8) -> Self {
        Self {
            class: RegClass::Mask,
            enc,
            size: 8,
        }
    }
}

/// An allocator-managed symbolic register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

impl VReg {
    /// Dense index of this virtual register.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A register operand before allocation: physical or virtual.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegOperand {
    /// Already-physical register.
    Phys(PhysReg),
    /// Virtual register awaiting allocation.
    Virt(VReg),
}

/// An immediate with an optional width hint in bytes. Encoders choose the
/// smallest legal width unless the hint forces one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImmOperand {
    /// The signed value.
    pub value: i64,
    /// Forced width in bytes (1/2/4/8), if any.
    pub width: Option<u8>,
}

impl ImmOperand {
    /// An immediate with no width hint.
    pub fn new(value: i64) -> Self {
        Self { value, width: None }
    }
}

/// A memory operand. When `label` is set the reference is RIP/PC-relative
/// and `base`/`index` must be absent; it is resolved by a fixup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemOperand {
    /// Base register, if any.
    pub base: Option<RegOperand>,
    /// Index register, if any.
    pub index: Option<RegOperand>,
    /// Scale applied to the index: 1, 2, 4, or 8.
    pub scale: u8,
    /// Signed 32-bit displacement.
    pub disp: i32,
    /// Access size in bytes.
    pub size: u8,
    /// Symbolic target for RIP/PC-relative addressing.
    pub label: Option<Label>,
}

impl MemOperand {
    /// `[base + disp]` with the given access size.
    pub fn base_disp(base: RegOperand, disp: i32, size: u8) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            disp,
            size,
            label: None,
        }
    }

    /// `[base + index*scale + disp]`.
    pub fn base_index(base: RegOperand, index: RegOperand, scale: u8, disp: i32, size: u8) -> Self {
        debug_assert!(matches!(scale, 1 | 2 | 4 | 8));
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            disp,
            size,
            label: None,
        }
    }

    /// A RIP/PC-relative reference to `label`.
    pub fn label(label: Label, size: u8) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            disp: 0,
            size,
            label: Some(label),
        }
    }
}

/// An instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Physical register.
    Phys(PhysReg),
    /// Virtual register.
    Virt(VReg),
    /// Immediate value.
    Imm(ImmOperand),
    /// Memory reference.
    Mem(MemOperand),
    /// Direct label reference (branch targets).
    Label(Label),
}

impl Operand {
    /// Shorthand for an immediate operand without a width hint.
    pub fn imm(value: i64) -> Self {
        Self::Imm(ImmOperand::new(value))
    }
}

impl From<PhysReg> for Operand {
    fn from(reg: PhysReg) -> Self {
        Self::Phys(reg)
    }
}

impl From<VReg> for Operand {
    fn from(vreg: VReg) -> Self {
        Self::Virt(vreg)
    }
}

impl From<MemOperand> for Operand {
    fn from(mem: MemOperand) -> Self {
        Self::Mem(mem)
    }
}

impl From<Label> for Operand {
    fn from(label: Label) -> Self {
        Self::Label(label)
    }
}

/// Architecture-independent condition codes; each backend maps them to its
/// own encoding. `Parity`/`NotParity` exist only on x86-64.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    SignedLt,
    SignedLe,
    SignedGt,
    SignedGe,
    UnsignedLt,
    UnsignedLe,
    UnsignedGt,
    UnsignedGe,
    Overflow,
    NotOverflow,
    Sign,
    NotSign,
    Parity,
    NotParity,
}

/// Per-instruction option flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstOptions {
    /// Condition for Jcc/Setcc/Cmovcc/B.cond/CSEL-family instructions.
    pub cond: Option<Cond>,
    /// Require the short (rel8) branch form; emission fails if the
    /// displacement does not fit.
    pub force_short: bool,
    /// Emit an x86 LOCK prefix.
    pub lock: bool,
    /// EVEX opmask register k1..k7.
    pub mask: Option<u8>,
    /// EVEX zeroing-masking (`{z}`) instead of merge-masking.
    pub zeroing: bool,
    /// EVEX embedded broadcast for the memory operand.
    pub broadcast: bool,
}

impl InstOptions {
    /// Options with a condition code set.
    pub fn with_cond(cond: Cond) -> Self {
        Self {
            cond: Some(cond),
            ..Self::default()
        }
    }
}

/// An instruction node: a dense per-architecture opcode id, up to four
/// operand slots, and option flags.
#[derive(Clone, Debug)]
pub struct InstNode {
    /// Dense architecture-specific instruction id.
    pub opcode: u16,
    /// Operand slots in assembler order (destination first).
    pub operands: SmallVec<[Operand; 4]>,
    /// Option flags.
    pub options: InstOptions,
}

/// How an instruction uses one operand slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpUse {
    /// The operand is only read.
    Read,
    /// The operand is only written.
    Write,
    /// Read-modify-write.
    ReadWrite,
}

/// Static information about one opcode, consulted by the register allocator
/// and the serializer.
#[derive(Clone, Copy, Debug)]
pub struct InstInfo {
    /// Mnemonic, for diagnostics.
    pub name: &'static str,
    /// Use kind per operand slot; missing trailing slots default to `Read`.
    pub uses: &'static [OpUse],
    /// GPR encodings this opcode uses implicitly (e.g. RAX/RDX for divides,
    /// RCX for variable shifts). The allocator keeps these out of its pool.
    pub implicit_gprs: &'static [u8],
    /// Whether this is a return.
    pub is_ret: bool,
    /// Whether this is a call; a call clobbers all caller-saved registers.
    pub is_call: bool,
}

impl InstInfo {
    /// Use kind of operand slot `i`.
    pub fn op_use(&self, i: usize) -> OpUse {
        self.uses.get(i).copied().unwrap_or(OpUse::Read)
    }
}

/// Alignment padding flavor: code alignment uses the architecture's NOP
/// sequences, data alignment uses zero bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignMode {
    /// Pad with executable no-ops.
    Code,
    /// Pad with zeroes.
    Data,
}

/// Value types that can cross a function boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    V128,
}

impl AbiType {
    /// Size in bytes.
    pub fn bytes(self) -> u8 {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::I64 => 8,
            Self::F32 => 4,
            Self::F64 => 8,
            Self::V128 => 16,
        }
    }

    /// The register class values of this type travel in.
    pub fn reg_class(self) -> RegClass {
        match self {
            Self::F32 | Self::F64 | Self::V128 => RegClass::Vec,
            _ => RegClass::Gpr,
        }
    }
}

/// A function signature under a calling convention.
///
/// TODO: variadic AAPCS64 signatures are not modeled; the calling-convention
/// rules for them are not pinned down here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    /// Parameter types, in order.
    pub params: Vec<AbiType>,
    /// Return type, if the function returns a value.
    pub ret: Option<AbiType>,
    /// Calling convention.
    pub call_conv: CallConv,
}

/// Data attached to a function-begin node.
#[derive(Clone, Debug)]
pub struct FuncData {
    /// The function's signature.
    pub signature: Signature,
    /// Virtual registers that receive the incoming parameters, one per
    /// parameter.
    pub args: Vec<VReg>,
}

/// A node in the builder's linked list.
#[derive(Clone, Debug)]
pub enum NodeData {
    /// An instruction.
    Inst(InstNode),
    /// Bind a label at this position.
    BindLabel(Label),
    /// Align the emission offset.
    Align {
        /// Padding flavor.
        mode: AlignMode,
        /// Power-of-two alignment in bytes.
        align: u32,
    },
    /// Embed raw data verbatim.
    EmbedData {
        /// The bytes.
        data: Vec<u8>,
        /// Element size, for diagnostics/formatting only.
        elem_size: u8,
    },
    /// A no-op annotation.
    Comment(String),
    /// A user-defined marker; ignored by serialization.
    Sentinel(u32),
    /// Start of a function region.
    FuncBegin(Box<FuncData>),
    /// End of a function region.
    FuncEnd,
}

/// Stable index of a node within its builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Dense index of this node.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A visitor over builder nodes in program order. Concrete contexts are the
/// assembler serializer and the register allocator's rewriter.
pub trait NodeVisitor {
    /// A label is bound at the current position.
    fn on_label(&mut self, label: Label) -> crate::result::CodegenResult<()>;
    /// An instruction node.
    fn on_inst(&mut self, inst: &InstNode) -> crate::result::CodegenResult<()>;
    /// An alignment request.
    fn on_align(&mut self, mode: AlignMode, align: u32) -> crate::result::CodegenResult<()>;
    /// Embedded data.
    fn on_embed_data(&mut self, data: &[u8], elem_size: u8) -> crate::result::CodegenResult<()>;
    /// A comment; no-op by default.
    fn on_comment(&mut self, _text: &str) -> crate::result::CodegenResult<()> {
        Ok(())
    }
    /// A sentinel; no-op by default.
    fn on_sentinel(&mut self, _kind: u32) -> crate::result::CodegenResult<()> {
        Ok(())
    }
    /// A function-begin node; no-op by default.
    fn on_func_begin(&mut self, _func: &FuncData) -> crate::result::CodegenResult<()> {
        Ok(())
    }
    /// A function-end node; no-op by default.
    fn on_func_end(&mut self) -> crate::result::CodegenResult<()> {
        Ok(())
    }
}
