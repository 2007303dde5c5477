//! Labels and fixups.
//!
//! A label names a position in a section that may not be known yet. Emitting
//! a reference to an unbound label records a fixup; binding the label (or
//! `finalize()`, for references created before the bind) patches the already
//! emitted bytes. A label binds at most once.

use crate::buffer::{CodeBuffer, CodeOffset};
use crate::result::{CodegenError, CodegenResult};
use smallvec::SmallVec;
use std::fmt;

/// A symbolic offset, identified by a dense non-negative integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl Label {
    /// The dense index of this label.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "label{}", self.0)
    }
}

/// Identifies a section within a code holder. Section 0 is always `.text`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SectionId(pub u32);

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "section{}", self.0)
    }
}

/// The kind of patch a fixup performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixupKind {
    /// 8-bit PC-relative byte displacement (x64 short branches).
    PcRel8,
    /// 32-bit PC-relative byte displacement (x64 near branches).
    PcRel32,
    /// 32-bit PC-relative displacement inside a ModR/M memory operand
    /// (x64 RIP-relative addressing).
    RipRel32,
    /// Absolute 64-bit address, applied once the image base is known.
    Abs64,
    /// 14-bit AArch64 branch field in instruction counts (TBZ/TBNZ).
    Rel14,
    /// 19-bit AArch64 branch field in instruction counts (B.cond, CBZ,
    /// LDR-literal).
    Rel19,
    /// 26-bit AArch64 branch field in instruction counts (B, BL).
    Rel26,
}

impl FixupKind {
    /// Width of the patched field in bits, for diagnostics.
    pub fn bits(self) -> u8 {
        match self {
            Self::PcRel8 => 8,
            Self::PcRel32 | Self::RipRel32 => 32,
            Self::Abs64 => 64,
            Self::Rel14 => 14,
            Self::Rel19 => 19,
            Self::Rel26 => 26,
        }
    }

    /// AArch64 branch fields count instructions, not bytes.
    pub fn is_insn_scaled(self) -> bool {
        matches!(self, Self::Rel14 | Self::Rel19 | Self::Rel26)
    }
}

/// A pending patch of already-emitted bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fixup {
    /// What to patch and how.
    pub kind: FixupKind,
    /// Section containing the bytes to patch.
    pub section: SectionId,
    /// Offset of the patched field within that section. For the
    /// instruction-scaled kinds this is the offset of the whole instruction
    /// word, whose branch field is OR-ed in.
    pub at: CodeOffset,
    /// The PC base the displacement is measured from: the byte after the
    /// patched field on x64, the instruction start on AArch64.
    pub pc_base: CodeOffset,
    /// Extra bytes added to the displacement.
    pub addend: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LabelState {
    Unbound,
    Bound {
        section: SectionId,
        offset: CodeOffset,
    },
}

struct LabelEntry {
    state: LabelState,
    /// Fixups recorded before the label was bound.
    pending: SmallVec<[Fixup; 2]>,
}

/// Table of label states with a backpatch list per label.
#[derive(Default)]
pub struct LabelManager {
    entries: Vec<LabelEntry>,
}

impl LabelManager {
    /// Create an empty label table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, unbound label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(u32::try_from(self.entries.len()).unwrap());
        self.entries.push(LabelEntry {
            state: LabelState::Unbound,
            pending: SmallVec::new(),
        });
        label
    }

    /// Number of labels allocated so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no labels have been allocated.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `label` has been bound.
    pub fn is_bound(&self, label: Label) -> bool {
        matches!(self.entries[label.index()].state, LabelState::Bound { .. })
    }

    /// The section and offset `label` is bound at, if bound.
    pub fn resolved(&self, label: Label) -> Option<(SectionId, CodeOffset)> {
        match self.entries[label.index()].state {
            LabelState::Bound { section, offset } => Some((section, offset)),
            LabelState::Unbound => None,
        }
    }

    /// Bind `label` to `(section, offset)` and drain its pending fixups for
    /// the caller to apply. A second bind is an error.
    pub fn bind(
        &mut self,
        label: Label,
        section: SectionId,
        offset: CodeOffset,
    ) -> CodegenResult<SmallVec<[Fixup; 2]>> {
        let entry = &mut self.entries[label.index()];
        if let LabelState::Bound { .. } = entry.state {
            return Err(CodegenError::LabelAlreadyBound(label));
        }
        entry.state = LabelState::Bound { section, offset };
        log::trace!("bind {label} -> {section}+{offset:#x}");
        Ok(std::mem::take(&mut entry.pending))
    }

    /// Record a fixup against a label that is not bound yet.
    pub fn push_pending(&mut self, label: Label, fixup: Fixup) {
        debug_assert!(!self.is_bound(label));
        self.entries[label.index()].pending.push(fixup);
    }

    /// The first label that still has pending fixups, if any. Used by
    /// `finalize()` to report dangling references.
    pub fn first_dangling(&self) -> Option<Label> {
        self.entries
            .iter()
            .position(|e| !e.pending.is_empty())
            .map(|i| Label(i as u32))
    }
}

/// Patch `fixup` in `buffer`, given the resolved target offset within the
/// same section. `Abs64` is not handled here; it is applied against the image
/// base after concatenation.
pub fn apply_fixup(buffer: &mut CodeBuffer, fixup: &Fixup, target: CodeOffset) -> CodegenResult<()> {
    let disp = i64::from(target) - i64::from(fixup.pc_base) + fixup.addend;
    let out_of_range = |bits| {
        Err(CodegenError::InvalidDisplacement {
            disp,
            bits,
            offset: fixup.at,
        })
    };
    match fixup.kind {
        FixupKind::PcRel8 => {
            let Ok(disp8) = i8::try_from(disp) else {
                return out_of_range(8);
            };
            buffer.patch1(fixup.at, disp8 as u8);
        }
        FixupKind::PcRel32 | FixupKind::RipRel32 => {
            let Ok(disp32) = i32::try_from(disp) else {
                return out_of_range(32);
            };
            buffer.patch4(fixup.at, disp32 as u32);
        }
        FixupKind::Rel14 | FixupKind::Rel19 | FixupKind::Rel26 => {
            assert!(disp % 4 == 0, "misaligned AArch64 branch displacement");
            let words = disp >> 2;
            let bits = fixup.kind.bits();
            let limit = 1i64 << (bits - 1);
            if words < -limit || words >= limit {
                return out_of_range(bits);
            }
            let field = (words as u32) & ((1 << bits) - 1);
            let insn = buffer.read4(fixup.at);
            let patched = match fixup.kind {
                FixupKind::Rel26 => insn | field,
                FixupKind::Rel19 | FixupKind::Rel14 => insn | (field << 5),
                _ => unreachable!(),
            };
            buffer.patch4(fixup.at, patched);
        }
        FixupKind::Abs64 => unreachable!("Abs64 fixups resolve against the image base"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_bind_is_an_error() {
        let mut labels = LabelManager::new();
        let l = labels.new_label();
        labels.bind(l, SectionId(0), 4).unwrap();
        assert_eq!(
            labels.bind(l, SectionId(0), 8),
            Err(CodegenError::LabelAlreadyBound(l))
        );
    }

    #[test]
    fn pcrel32_patch_matches_pc_relative_law() {
        // Branch field at offset 1, next instruction at offset 5, target 0x20.
        let mut buf = CodeBuffer::new();
        buf.put1(0xE9);
        buf.reserve(4);
        buf.reserve(0x20 - 5);
        let fixup = Fixup {
            kind: FixupKind::PcRel32,
            section: SectionId(0),
            at: 1,
            pc_base: 5,
            addend: 0,
        };
        apply_fixup(&mut buf, &fixup, 0x20).unwrap();
        assert_eq!(buf.read4(1), 0x20 - 5);
    }

    #[test]
    fn rel19_field_is_word_scaled() {
        let mut buf = CodeBuffer::new();
        // b.ne with an empty offset field.
        buf.put4(0x5400_0001);
        buf.put4(0xD503_201F);
        let fixup = Fixup {
            kind: FixupKind::Rel19,
            section: SectionId(0),
            at: 0,
            pc_base: 0,
            addend: 0,
        };
        apply_fixup(&mut buf, &fixup, 8).unwrap();
        assert_eq!(buf.read4(0), 0x5400_0001 | (2 << 5));
    }

    #[test]
    fn rel8_overflow_is_reported() {
        let mut buf = CodeBuffer::new();
        buf.reserve(1);
        let fixup = Fixup {
            kind: FixupKind::PcRel8,
            section: SectionId(0),
            at: 0,
            pc_base: 1,
            addend: 0,
        };
        let err = apply_fixup(&mut buf, &fixup, 0x4000).unwrap_err();
        assert!(matches!(err, CodegenError::InvalidDisplacement { bits: 8, .. }));
    }
}
