//! Executable-memory runtime for the opforge JIT assembler.
//!
//! This crate turns a finalized [`opforge_codegen::CodeHolder`] into
//! callable machine code: it obtains page-aligned RW memory, copies the
//! image, transitions the pages to RX under a write-xor-execute discipline,
//! synchronizes the instruction cache, and returns a reference-counted
//! [`FuncHandle`]. An optional content-addressed pipeline cache
//! deduplicates repeated compilations by caller-supplied key.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod icache;
pub mod memory;
pub mod runtime;

pub use memory::Block;
pub use runtime::{FuncHandle, JitRuntime};

use std::fmt;

/// Errors surfaced by the runtime.
#[derive(Debug)]
pub enum RuntimeError {
    /// The code holder failed to finalize.
    Codegen(opforge_codegen::CodegenError),
    /// The OS refused to provide memory.
    Allocation(String),
    /// The OS rejected the RX transition.
    Protection(String),
    /// An operation was attempted in a state that forbids it, e.g. writing
    /// to a block that is already executable.
    State(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Codegen(e) => write!(f, "code generation failed: {e}"),
            Self::Allocation(e) => write!(f, "memory allocation failed: {e}"),
            Self::Protection(e) => write!(f, "memory protection failed: {e}"),
            Self::State(e) => write!(f, "invalid state: {e}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codegen(e) => Some(e),
            _ => None,
        }
    }
}

impl From<opforge_codegen::CodegenError> for RuntimeError {
    fn from(e: opforge_codegen::CodegenError) -> Self {
        Self::Codegen(e)
    }
}
