//! Machine-code emission for the opforge JIT assembler.
//!
//! The crate is organized as a pipeline:
//!
//! - [`ir::Builder`] records instructions, labels, data, and function
//!   boundaries as a node list, with operands over virtual registers;
//! - [`regalloc::run`] rewrites the node list to physical registers,
//!   inserting spill traffic, the argument shuffle, and the
//!   prologue/epilogue;
//! - [`serialize::serialize`] drives a per-architecture assembler
//!   ([`isa::x64`] or [`isa::aarch64`]) that encodes bytes into a
//!   [`holder::CodeHolder`];
//! - [`CodeHolder::finalize`](holder::CodeHolder::finalize) resolves every
//!   pending fixup and returns the flat byte image.
//!
//! The assemblers can also be driven directly, without the builder or the
//! allocator, when the caller manages physical registers itself.
//!
//! Nothing here allocates executable memory; that is the `opforge-jit`
//! crate's job.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod constant;
pub mod env;
pub mod features;
pub mod holder;
pub mod ir;
pub mod isa;
pub mod labels;
pub mod regalloc;
pub mod result;
pub mod serialize;

pub use buffer::{CodeBuffer, CodeOffset};
pub use constant::Constant;
pub use env::{Arch, CallConv, Environment, Platform};
pub use features::{CpuFeature, CpuFeatures};
pub use holder::{CodeHolder, CodeImage};
pub use ir::Cond;
pub use labels::{FixupKind, Label, SectionId};
pub use result::{CodegenError, CodegenResult};
