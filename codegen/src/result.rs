//! Result and error types reported by the code-generation pipeline.

use crate::labels::Label;
use std::fmt;

/// A error produced while emitting or finalizing machine code.
///
/// Every variant that originates at an emission site carries enough context
/// (mnemonic, operand index, byte offset) that a diagnostic can point back at
/// the offending call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// An operand shape is not accepted by this instruction form.
    InvalidOperand {
        /// Mnemonic of the instruction being emitted.
        inst: &'static str,
        /// Index of the offending operand.
        operand: usize,
        /// Byte offset in the current section at the time of emission.
        offset: u32,
        /// What was wrong with it.
        message: String,
    },

    /// Operands that are legal individually but illegal together, e.g. an
    /// x86 high-byte register (AH..BH) combined with a REX prefix.
    IncompatibleOperands {
        /// Mnemonic of the instruction being emitted.
        inst: &'static str,
        /// Byte offset in the current section at the time of emission.
        offset: u32,
        /// What the illegal combination was.
        message: String,
    },

    /// A branch or memory displacement is out of signed range for the chosen
    /// encoding.
    InvalidDisplacement {
        /// The displacement that did not fit.
        disp: i64,
        /// Width of the field, in bits.
        bits: u8,
        /// Byte offset of the field being patched.
        offset: u32,
    },

    /// A label was bound a second time.
    LabelAlreadyBound(Label),

    /// `finalize()` found a fixup whose target label was never bound.
    LabelNotBound(Label),

    /// The encoder has no entry for this `(instruction, operand-shape)` pair.
    UnsupportedInstruction {
        /// Mnemonic of the instruction.
        inst: &'static str,
        /// A short description of the operand shape, e.g. `"reg, imm"`.
        shape: String,
    },

    /// The instruction requires a CPU extension the environment does not
    /// advertise.
    FeatureMissing {
        /// Mnemonic of the instruction.
        inst: &'static str,
        /// Name of the missing feature.
        feature: &'static str,
    },

    /// Buffer growth or slot allocation failed.
    AllocationFailed(String),

    /// An operation was attempted in a state that forbids it, e.g. emitting
    /// into a holder that has already been finalized.
    StateError(String),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidOperand {
                inst,
                operand,
                offset,
                message,
            } => write!(
                f,
                "invalid operand {operand} for `{inst}` at offset {offset:#x}: {message}"
            ),
            Self::IncompatibleOperands {
                inst,
                offset,
                message,
            } => write!(
                f,
                "incompatible operands for `{inst}` at offset {offset:#x}: {message}"
            ),
            Self::InvalidDisplacement { disp, bits, offset } => write!(
                f,
                "displacement {disp} does not fit in {bits} signed bits at offset {offset:#x}"
            ),
            Self::LabelAlreadyBound(label) => write!(f, "{label} is already bound"),
            Self::LabelNotBound(label) => write!(f, "{label} was never bound"),
            Self::UnsupportedInstruction { inst, shape } => {
                write!(f, "no encoding for `{inst}` with operands ({shape})")
            }
            Self::FeatureMissing { inst, feature } => {
                write!(f, "`{inst}` requires the {feature} extension")
            }
            Self::AllocationFailed(what) => write!(f, "allocation failed: {what}"),
            Self::StateError(what) => write!(f, "invalid state: {what}"),
        }
    }
}

impl std::error::Error for CodegenError {}

/// A convenient alias for a `Result` that uses `CodegenError`.
pub type CodegenResult<T> = Result<T, CodegenError>;
