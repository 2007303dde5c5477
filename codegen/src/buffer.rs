//! Growable byte buffer that machine code is emitted into.
//!
//! All multi-byte writes are little-endian, matching both supported
//! architectures. The buffer supports in-place patching for backpatched
//! branch displacements and forward-only alignment padding.

/// Offset in bytes from the beginning of a section.
///
/// The library can be used as a cross assembler, so we don't use a type like
/// `usize` which depends on the *host* platform.
pub type CodeOffset = u32;

/// A growable, patchable container of emitted bytes.
#[derive(Clone, Debug, Default)]
pub struct CodeBuffer {
    data: Vec<u8>,
}

impl CodeBuffer {
    /// Create a new, empty buffer.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create a buffer with `capacity` bytes preallocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Current emission offset; the next byte written lands here.
    pub fn cur_offset(&self) -> CodeOffset {
        u32::try_from(self.data.len()).expect("section exceeds 4 GiB")
    }

    /// Whether nothing has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The emitted bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Add 1 byte.
    pub fn put1(&mut self, v: u8) {
        self.data.push(v);
    }

    /// Add 2 bytes, little-endian.
    pub fn put2(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Add 4 bytes, little-endian.
    pub fn put4(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Add 8 bytes, little-endian.
    pub fn put8(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a byte slice verbatim.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Reserve `n` zero bytes and return the offset of the first one.
    pub fn reserve(&mut self, n: usize) -> CodeOffset {
        let offset = self.cur_offset();
        self.data.resize(self.data.len() + n, 0);
        offset
    }

    /// Overwrite one byte at `offset`.
    pub fn patch1(&mut self, offset: CodeOffset, v: u8) {
        self.data[offset as usize] = v;
    }

    /// Overwrite 2 bytes at `offset`, little-endian.
    pub fn patch2(&mut self, offset: CodeOffset, v: u16) {
        self.data[offset as usize..offset as usize + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// Overwrite 4 bytes at `offset`, little-endian.
    pub fn patch4(&mut self, offset: CodeOffset, v: u32) {
        self.data[offset as usize..offset as usize + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Overwrite 8 bytes at `offset`, little-endian.
    pub fn patch8(&mut self, offset: CodeOffset, v: u64) {
        self.data[offset as usize..offset as usize + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Read back 4 little-endian bytes at `offset`; used when a fixup must
    /// OR its field into an already-emitted instruction word.
    pub fn read4(&self, offset: CodeOffset) -> u32 {
        let bytes: [u8; 4] = self.data[offset as usize..offset as usize + 4]
            .try_into()
            .unwrap();
        u32::from_le_bytes(bytes)
    }

    /// Pad forward with `fill` until the offset is a multiple of `align`.
    ///
    /// `align` must be a power of two. Alignment never truncates.
    pub fn align_to(&mut self, align: u32, fill: u8) {
        debug_assert!(align.is_power_of_two());
        let misalign = self.cur_offset() & (align - 1);
        if misalign != 0 {
            for _ in 0..(align - misalign) {
                self.data.push(fill);
            }
        }
    }

    /// Consume the buffer, returning the bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_puts() {
        let mut buf = CodeBuffer::new();
        buf.put1(0xAA);
        buf.put2(0x1122);
        buf.put4(0x3344_5566);
        buf.put8(0x8877_6655_4433_2211);
        assert_eq!(
            buf.data(),
            &[
                0xAA, 0x22, 0x11, 0x66, 0x55, 0x44, 0x33, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
                0x77, 0x88
            ]
        );
    }

    #[test]
    fn patch_roundtrip() {
        let mut buf = CodeBuffer::new();
        let at = buf.reserve(4);
        buf.put1(0xC3);
        buf.patch4(at, 0xDEAD_BEEF);
        assert_eq!(buf.data(), &[0xEF, 0xBE, 0xAD, 0xDE, 0xC3]);
        assert_eq!(buf.read4(at), 0xDEAD_BEEF);
    }

    #[test]
    fn align_pads_forward_only() {
        let mut buf = CodeBuffer::new();
        buf.put1(1);
        buf.align_to(4, 0x90);
        assert_eq!(buf.cur_offset(), 4);
        buf.align_to(4, 0x90);
        assert_eq!(buf.cur_offset(), 4);
        assert_eq!(buf.data(), &[1, 0x90, 0x90, 0x90]);
    }
}
