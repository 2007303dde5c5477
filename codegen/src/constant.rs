//! The constant pool.
//!
//! The pool lets a holder avoid emitting the same constant multiple times:
//! inserting the same bytes twice returns the same handle. Each constant
//! carries a label; the pool is flushed to the end of `.text` during
//! `finalize()`, which binds those labels, so PC-relative loads of constants
//! stay within one section.

use crate::labels::Label;
use rustc_hash::FxHashMap;
use std::fmt;

/// A handle to a deduplicated constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Constant(pub u32);

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "const{}", self.0)
    }
}

struct PoolEntry {
    data: Vec<u8>,
    align: u32,
    label: Label,
}

/// Deduplicating pool of constant data, keyed by the bytes themselves.
#[derive(Default)]
pub struct ConstantPool {
    entries: Vec<PoolEntry>,
    dedup: FxHashMap<Vec<u8>, Constant>,
}

impl ConstantPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `data` with the given alignment requirement, allocating the
    /// label through `new_label`. Returns an existing handle when the same
    /// bytes were inserted before; alignment is widened if the new request
    /// is stricter.
    pub fn insert(
        &mut self,
        data: &[u8],
        align: u32,
        new_label: impl FnOnce() -> Label,
    ) -> Constant {
        debug_assert!(align.is_power_of_two());
        if let Some(&existing) = self.dedup.get(data) {
            let entry = &mut self.entries[existing.0 as usize];
            entry.align = entry.align.max(align);
            return existing;
        }
        let id = Constant(u32::try_from(self.entries.len()).unwrap());
        self.entries.push(PoolEntry {
            data: data.to_vec(),
            align,
            label: new_label(),
        });
        self.dedup.insert(data.to_vec(), id);
        id
    }

    /// The label bound to `constant` once the pool is flushed.
    pub fn label_of(&self, constant: Constant) -> Label {
        self.entries[constant.0 as usize].label
    }

    /// Number of constants in the pool.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool holds no constants.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(label, align, bytes)` in insertion order for flushing.
    pub fn iter(&self) -> impl Iterator<Item = (Label, u32, &[u8])> {
        self.entries
            .iter()
            .map(|e| (e.label, e.align, e.data.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_share_a_handle() {
        let mut labels = crate::labels::LabelManager::new();
        let mut pool = ConstantPool::new();
        let a = pool.insert(&[1, 2, 3, 4], 4, || labels.new_label());
        let b = pool.insert(&[1, 2, 3, 4], 16, || labels.new_label());
        let c = pool.insert(&[5, 6, 7, 8], 4, || labels.new_label());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
        // The second insert widened the alignment.
        let (_, align, _) = pool.iter().next().unwrap();
        assert_eq!(align, 16);
    }
}
