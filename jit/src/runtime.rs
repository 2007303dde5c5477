//! The JIT pipeline and its content-addressed cache.
//!
//! `JitRuntime::add` takes a finalized-ready code holder, obtains RW pages,
//! copies the image (applying absolute relocations against the final base),
//! flips the pages to RX, synchronizes the instruction cache, and hands
//! back a [`FuncHandle`] whose address is callable under the host C ABI.

use crate::icache;
use crate::memory::Block;
use crate::RuntimeError;
use opforge_codegen::{CodeHolder, Label};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};

struct FinalizedBlock {
    block: Block,
    code_len: usize,
    label_offsets: Vec<Option<u32>>,
}

/// A callable unit of finalized code.
///
/// Handles are cheap to clone; every clone shares the same mapping, which
/// is released when the last handle drops. The contained address may be
/// called concurrently from any thread — a thread other than the creating
/// one must synchronize first (see [`icache::pipeline_flush_mt`]).
#[derive(Clone)]
pub struct FuncHandle {
    inner: Arc<FinalizedBlock>,
}

impl FuncHandle {
    /// The entry point: the first byte of the finalized image.
    ///
    /// Cast this to an `extern "C"` / `extern "win64"` function pointer
    /// matching the generated function's signature.
    pub fn address(&self) -> *const u8 {
        self.inner.block.exec_ptr()
    }

    /// Size of the finalized image in bytes.
    pub fn size(&self) -> usize {
        self.inner.code_len
    }

    /// The absolute address of a label bound in the generated code.
    pub fn label_address(&self, label: Label) -> Option<*const u8> {
        let offset = (*self.inner.label_offsets.get(label.index())?)?;
        Some(unsafe { self.address().add(offset as usize) })
    }

    /// The finalized bytes, readable through the executable mapping.
    pub fn bytes(&self) -> &[u8] {
        &self.inner.block.readable()[..self.inner.code_len]
    }
}

/// Composes the finalize → map → copy → protect → flush pipeline and owns
/// the optional pipeline cache.
///
/// The runtime may be shared across threads; the cache is guarded by an
/// internal mutex. Handles returned for the same cache key are
/// pointer-identical for as long as the entry lives.
#[derive(Default)]
pub struct JitRuntime {
    cache: Mutex<FxHashMap<String, FuncHandle>>,
}

impl JitRuntime {
    /// Create a runtime with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the pipeline on `holder` and return a handle to the executable
    /// image.
    ///
    /// Installing code for a foreign architecture is permitted (the bytes
    /// are still mapped and readable) but flagged, since calling it would
    /// be undefined.
    pub fn add(&self, holder: CodeHolder) -> Result<FuncHandle, RuntimeError> {
        let host = opforge_codegen::Environment::from_triple(&target_lexicon::Triple::host());
        if host.map(|env| env.arch) != Some(holder.env().arch) {
            log::warn!(
                "installing {} code on a foreign host; the handle must not be called",
                holder.env().arch
            );
        }
        let mut image = holder.finalize()?;
        let mut block = Block::alloc_rw(image.len().max(1))?;

        // Absolute relocations need the final base; the executable address
        // is known before protection, dual-mapping included.
        image.apply_base(block.exec_ptr() as u64);

        let code_len = image.len();
        block.writable()?[..code_len].copy_from_slice(image.bytes());
        block.protect_rx()?;
        icache::clear_cache(block.exec_ptr(), code_len);

        let label_offsets = (0..image.label_count())
            .map(|i| image.label_offset(Label(i as u32)))
            .collect();

        log::debug!("jit: installed {code_len} bytes at {:p}", block.exec_ptr());
        Ok(FuncHandle {
            inner: Arc::new(FinalizedBlock {
                block,
                code_len,
                label_offsets,
            }),
        })
    }

    /// Idempotent, cache-keyed variant of [`add`](Self::add): an existing
    /// entry under `key` is returned as-is (pointer-identical), otherwise
    /// the holder is compiled and stored.
    pub fn add_cached(
        &self,
        key: impl Into<String>,
        holder: CodeHolder,
    ) -> Result<FuncHandle, RuntimeError> {
        let key = key.into();
        let mut cache = self.cache.lock().expect("cache poisoned");
        if let Some(handle) = cache.get(&key) {
            return Ok(handle.clone());
        }
        let handle = self.add(holder)?;
        cache.insert(key, handle.clone());
        Ok(handle)
    }

    /// Release the cache's reference under `key`. The mapping itself lives
    /// until the last outstanding handle drops. Returns whether an entry
    /// existed.
    pub fn drop_cached(&self, key: &str) -> bool {
        self.cache
            .lock()
            .expect("cache poisoned")
            .remove(key)
            .is_some()
    }
}
