//! The code holder: sections, labels, constants, and finalization.
//!
//! A holder owns everything produced while assembling one unit of code. The
//! assemblers append bytes into its current section and record fixups;
//! `finalize()` resolves every remaining fixup, appends the constant pool,
//! concatenates the sections, and returns a flat byte image plus a
//! label-to-offset map.

use crate::buffer::{CodeBuffer, CodeOffset};
use crate::constant::{Constant, ConstantPool};
use crate::env::Environment;
use crate::features::CpuFeatures;
use crate::labels::{apply_fixup, Fixup, FixupKind, Label, LabelManager, SectionId};
use crate::result::{CodegenError, CodegenResult};

/// One named region of emitted bytes with its own alignment requirement.
pub struct Section {
    name: String,
    align: u32,
    buffer: CodeBuffer,
}

impl Section {
    /// The section's name, e.g. `".text"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Alignment requirement applied when sections are concatenated.
    pub fn align(&self) -> u32 {
        self.align
    }

    /// The section's byte buffer.
    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }
}

/// An absolute relocation left for the caller to apply once the image's base
/// address is known.
#[derive(Clone, Copy, Debug)]
pub struct AbsReloc {
    /// Offset of the 8-byte field within the image.
    pub at: u32,
    /// Image offset of the target; the patched value is `base + target`.
    pub target: u32,
    /// Addend applied to the patched value.
    pub addend: i64,
}

/// The flat output of `finalize()`.
#[derive(Debug)]
pub struct CodeImage {
    bytes: Vec<u8>,
    label_offsets: Vec<Option<u32>>,
    abs_relocs: Vec<AbsReloc>,
}

impl CodeImage {
    /// The finalized bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total image size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Absolute offset of a bound label within the image.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.label_offsets.get(label.index()).copied().flatten()
    }

    /// Number of labels the holder had allocated, bound or not.
    pub fn label_count(&self) -> usize {
        self.label_offsets.len()
    }

    /// Absolute relocations awaiting the image base address.
    pub fn abs_relocs(&self) -> &[AbsReloc] {
        &self.abs_relocs
    }

    /// Patch every absolute relocation, given the address the image will be
    /// placed at. Call this before the bytes are copied to their final home
    /// (or on the RW view of the final home).
    pub fn apply_base(&mut self, base: u64) {
        for reloc in std::mem::take(&mut self.abs_relocs) {
            let value = base
                .wrapping_add(u64::from(reloc.target))
                .wrapping_add(reloc.addend as u64);
            let at = reloc.at as usize;
            self.bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Owns sections, environment, label manager, and constant pool.
pub struct CodeHolder {
    env: Environment,
    features: CpuFeatures,
    sections: Vec<Section>,
    current: SectionId,
    labels: LabelManager,
    constants: ConstantPool,
    abs_relocs: Vec<(SectionId, CodeOffset, SectionId, CodeOffset, i64)>,
}

impl CodeHolder {
    /// Create a holder for `env` with the architecture's baseline feature
    /// set. The `.text` section exists from the start and is current.
    pub fn new(env: Environment) -> Self {
        Self::with_features(env, CpuFeatures::baseline(env.arch))
    }

    /// Create a holder advertising an explicit feature set.
    pub fn with_features(env: Environment, features: CpuFeatures) -> Self {
        Self {
            env,
            features,
            sections: vec![Section {
                name: ".text".to_string(),
                align: env.arch.insn_align(),
                buffer: CodeBuffer::new(),
            }],
            current: SectionId(0),
            labels: LabelManager::new(),
            constants: ConstantPool::new(),
            abs_relocs: Vec::new(),
        }
    }

    /// The holder's environment.
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The advertised CPU feature set.
    pub fn features(&self) -> &CpuFeatures {
        &self.features
    }

    /// The mandatory `.text` section.
    pub fn text_section() -> SectionId {
        SectionId(0)
    }

    /// Open a new section and make it current.
    pub fn add_section(&mut self, name: &str, align: u32) -> SectionId {
        debug_assert!(align.is_power_of_two());
        let id = SectionId(u32::try_from(self.sections.len()).unwrap());
        self.sections.push(Section {
            name: name.to_string(),
            align,
            buffer: CodeBuffer::new(),
        });
        self.current = id;
        id
    }

    /// Switch emission to an existing section.
    pub fn switch_section(&mut self, section: SectionId) {
        assert!((section.0 as usize) < self.sections.len());
        self.current = section;
    }

    /// The section currently being emitted into.
    pub fn cur_section(&self) -> SectionId {
        self.current
    }

    /// Read access to a section.
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0 as usize]
    }

    /// Offset of the next byte emitted into the current section.
    pub fn cur_offset(&self) -> CodeOffset {
        self.buf().cur_offset()
    }

    fn buf(&self) -> &CodeBuffer {
        &self.sections[self.current.0 as usize].buffer
    }

    fn buf_mut(&mut self) -> &mut CodeBuffer {
        &mut self.sections[self.current.0 as usize].buffer
    }

    /// Add 1 byte to the current section.
    pub fn put1(&mut self, v: u8) {
        self.buf_mut().put1(v);
    }

    /// Add 2 bytes, little-endian.
    pub fn put2(&mut self, v: u16) {
        self.buf_mut().put2(v);
    }

    /// Add 4 bytes, little-endian.
    pub fn put4(&mut self, v: u32) {
        self.buf_mut().put4(v);
    }

    /// Add 8 bytes, little-endian.
    pub fn put8(&mut self, v: u64) {
        self.buf_mut().put8(v);
    }

    /// Append raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf_mut().put_bytes(bytes);
    }

    /// Reserve `n` zero bytes in the current section.
    pub fn reserve(&mut self, n: usize) -> CodeOffset {
        self.buf_mut().reserve(n)
    }

    /// Pad the current section forward to `align` with `fill`.
    pub fn align_to(&mut self, align: u32, fill: u8) {
        self.buf_mut().align_to(align, fill);
    }

    /// Allocate a fresh label.
    pub fn new_label(&mut self) -> Label {
        self.labels.new_label()
    }

    /// Whether `label` has been bound.
    pub fn is_bound(&self, label: Label) -> bool {
        self.labels.is_bound(label)
    }

    /// The section-relative offset a label is bound at.
    pub fn label_offset(&self, label: Label) -> Option<(SectionId, CodeOffset)> {
        self.labels.resolved(label)
    }

    /// Bind `label` at the current offset of the current section, resolving
    /// any fixups that were waiting for it.
    pub fn bind_label(&mut self, label: Label) -> CodegenResult<()> {
        let section = self.current;
        let offset = self.cur_offset();
        let pending = self.labels.bind(label, section, offset)?;
        for fixup in pending {
            self.resolve_fixup(&fixup, section, offset)?;
        }
        Ok(())
    }

    /// Record a fixup at `at` in the current section referring to `target`.
    /// Resolves immediately if the target is already bound.
    pub fn record_fixup(
        &mut self,
        kind: FixupKind,
        at: CodeOffset,
        pc_base: CodeOffset,
        target: Label,
        addend: i64,
    ) -> CodegenResult<()> {
        let fixup = Fixup {
            kind,
            section: self.current,
            at,
            pc_base,
            addend,
        };
        match self.labels.resolved(target) {
            Some((section, offset)) => self.resolve_fixup(&fixup, section, offset),
            None => {
                self.labels.push_pending(target, fixup);
                Ok(())
            }
        }
    }

    fn resolve_fixup(
        &mut self,
        fixup: &Fixup,
        target_section: SectionId,
        target_offset: CodeOffset,
    ) -> CodegenResult<()> {
        if fixup.kind == FixupKind::Abs64 {
            self.abs_relocs.push((
                fixup.section,
                fixup.at,
                target_section,
                target_offset,
                fixup.addend,
            ));
            return Ok(());
        }
        // TODO: PC-relative references across sections would need the final
        // concatenation layout; they are rejected rather than guessed at.
        if fixup.section != target_section {
            return Err(CodegenError::StateError(format!(
                "pc-relative fixup in {} targets a label in {}",
                fixup.section, target_section
            )));
        }
        let buffer = &mut self.sections[fixup.section.0 as usize].buffer;
        apply_fixup(buffer, fixup, target_offset)
    }

    /// Intern `data` in the constant pool.
    pub fn add_constant(&mut self, data: &[u8], align: u32) -> Constant {
        let labels = &mut self.labels;
        self.constants.insert(data, align, || labels.new_label())
    }

    /// The label that will address `constant` once finalized.
    pub fn constant_label(&self, constant: Constant) -> Label {
        self.constants.label_of(constant)
    }

    /// Resolve all remaining fixups and produce the flat image.
    ///
    /// The constant pool is appended to the end of `.text` first, so
    /// PC-relative loads of constants resolve within one section. Sections
    /// are then concatenated in declaration order, each aligned to its own
    /// requirement.
    pub fn finalize(mut self) -> CodegenResult<CodeImage> {
        // Flush constants into `.text`.
        if !self.constants.is_empty() {
            self.current = Self::text_section();
            let pool = std::mem::take(&mut self.constants);
            for (label, align, data) in pool.iter() {
                self.align_to(align, 0);
                self.bind_label(label)?;
                self.put_bytes(data);
            }
        }

        // Every fixup must have found its label by now.
        if let Some(label) = self.labels.first_dangling() {
            return Err(CodegenError::LabelNotBound(label));
        }

        // Lay out sections in declaration order.
        let mut bases = Vec::with_capacity(self.sections.len());
        let mut total: u32 = 0;
        for section in &self.sections {
            let align = section.align.max(1);
            total = (total + align - 1) & !(align - 1);
            bases.push(total);
            total += section.buffer.cur_offset();
        }

        let mut bytes = Vec::with_capacity(total as usize);
        for (section, &base) in self.sections.iter().zip(&bases) {
            bytes.resize(base as usize, 0);
            bytes.extend_from_slice(section.buffer.data());
        }

        let label_offsets = (0..self.labels.len())
            .map(|i| {
                self.labels
                    .resolved(Label(i as u32))
                    .map(|(section, offset)| bases[section.0 as usize] + offset)
            })
            .collect();

        let abs_relocs = self
            .abs_relocs
            .iter()
            .map(|&(at_sec, at, tgt_sec, tgt, addend)| AbsReloc {
                at: bases[at_sec.0 as usize] + at,
                target: bases[tgt_sec.0 as usize] + tgt,
                addend,
            })
            .collect();

        log::debug!("finalized image: {} bytes, {} labels", bytes.len(), self.labels.len());
        Ok(CodeImage {
            bytes,
            label_offsets,
            abs_relocs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Arch, Environment, Platform};

    fn holder() -> CodeHolder {
        CodeHolder::new(Environment::new(Arch::X64, Platform::Linux))
    }

    #[test]
    fn finalize_fails_on_dangling_fixup() {
        let mut h = holder();
        let l = h.new_label();
        h.put1(0xE9);
        let at = h.reserve(4);
        h.record_fixup(FixupKind::PcRel32, at, at + 4, l, 0).unwrap();
        let err = h.finalize().unwrap_err();
        assert_eq!(err, CodegenError::LabelNotBound(l));
    }

    #[test]
    fn backward_fixup_resolves_at_emit_time() {
        let mut h = holder();
        let l = h.new_label();
        h.bind_label(l).unwrap();
        h.put1(0x90);
        h.put1(0xE9);
        let at = h.reserve(4);
        h.record_fixup(FixupKind::PcRel32, at, at + 4, l, 0).unwrap();
        let image = h.finalize().unwrap();
        let disp = i32::from_le_bytes(image.bytes()[2..6].try_into().unwrap());
        assert_eq!(disp, -6);
    }

    #[test]
    fn forward_fixup_resolves_at_bind_time() {
        let mut h = holder();
        let l = h.new_label();
        h.put1(0xE9);
        let at = h.reserve(4);
        h.record_fixup(FixupKind::PcRel32, at, at + 4, l, 0).unwrap();
        h.put1(0x90);
        h.bind_label(l).unwrap();
        h.put1(0xC3);
        let image = h.finalize().unwrap();
        let disp = i32::from_le_bytes(image.bytes()[1..5].try_into().unwrap());
        assert_eq!(disp, 1);
        assert_eq!(image.label_offset(l), Some(6));
    }

    #[test]
    fn sections_concatenate_in_order_with_alignment() {
        let mut h = holder();
        h.put1(0xC3);
        let rodata = h.add_section(".rodata", 16);
        h.put_bytes(&[1, 2, 3, 4]);
        h.switch_section(CodeHolder::text_section());
        let image = h.finalize().unwrap();
        assert_eq!(image.len(), 20);
        assert_eq!(image.bytes()[0], 0xC3);
        assert_eq!(&image.bytes()[16..], &[1, 2, 3, 4]);
        let _ = rodata;
    }

    #[test]
    fn constants_land_in_text_and_bind_their_labels() {
        let mut h = holder();
        h.put1(0xC3);
        let c = h.add_constant(&[0xAA; 8], 8);
        let l = h.constant_label(c);
        let image = h.finalize().unwrap();
        assert_eq!(image.label_offset(l), Some(8));
        assert_eq!(&image.bytes()[8..16], &[0xAA; 8]);
    }

    #[test]
    fn abs_reloc_waits_for_base() {
        let mut h = holder();
        let l = h.new_label();
        let at = h.reserve(8);
        h.record_fixup(FixupKind::Abs64, at, at, l, 0).unwrap();
        h.bind_label(l).unwrap();
        h.put1(0xC3);
        let mut image = h.finalize().unwrap();
        assert_eq!(image.abs_relocs().len(), 1);
        image.apply_base(0x1000);
        let value = u64::from_le_bytes(image.bytes()[0..8].try_into().unwrap());
        assert_eq!(value, 0x1008);
    }
}
