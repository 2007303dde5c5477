//! Page-granular executable memory under a write-xor-execute discipline.
//!
//! A [`Block`] starts readable and writable, never executable. Once
//! [`Block::protect_rx`] transitions it, the writable view is gone: the
//! safe API reports `State` errors and the pages themselves trap raw
//! writes.
//!
//! With the `selinux-fix` feature the provider never toggles one mapping
//! between W and X. It instead dual-maps a memfd: an RW view for the writer
//! and an RX view for callers; `protect_rx` simply drops the RW view.

use crate::RuntimeError;

fn page_size() -> usize {
    region::page::size()
}

fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    size.checked_add(page - 1).expect("size overflow") & !(page - 1)
}

enum Backing {
    /// One anonymous mapping whose protection is flipped in place.
    Single(region::Allocation),
    /// Two views of the same pages; `rw` is dropped on protect.
    #[cfg(feature = "selinux-fix")]
    Dual {
        rw: Option<memmap2::MmapMut>,
        rx: memmap2::Mmap,
        _file: std::fs::File,
    },
}

/// A page-aligned region of memory that is first RW and later RX.
pub struct Block {
    backing: Backing,
    len: usize,
    executable: bool,
}

impl Block {
    /// Allocate `size` bytes, rounded up to the system page size. The block
    /// is readable and writable, not executable.
    pub fn alloc_rw(size: usize) -> Result<Block, RuntimeError> {
        let len = round_up_to_page(size.max(1));
        let backing = Self::alloc_backing(len)?;
        log::debug!("allocated {len} rw bytes");
        Ok(Block {
            backing,
            len,
            executable: false,
        })
    }

    #[cfg(not(feature = "selinux-fix"))]
    fn alloc_backing(len: usize) -> Result<Backing, RuntimeError> {
        let alloc = region::alloc(len, region::Protection::READ_WRITE)
            .map_err(|e| RuntimeError::Allocation(e.to_string()))?;
        Ok(Backing::Single(alloc))
    }

    #[cfg(feature = "selinux-fix")]
    fn alloc_backing(len: usize) -> Result<Backing, RuntimeError> {
        use std::os::fd::FromRawFd;

        // An anonymous memfd backs both views.
        let fd = unsafe {
            libc::memfd_create(
                b"opforge-code\0".as_ptr().cast::<libc::c_char>(),
                libc::MFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(RuntimeError::Allocation(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        file.set_len(len as u64)
            .map_err(|e| RuntimeError::Allocation(e.to_string()))?;
        let rw = unsafe { memmap2::MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| RuntimeError::Allocation(e.to_string()))?;
        let rx = unsafe { memmap2::MmapOptions::new().len(len).map_exec(&file) }
            .map_err(|e| RuntimeError::Allocation(e.to_string()))?;
        Ok(Backing::Dual {
            rw: Some(rw),
            rx,
            _file: file,
        })
    }

    /// Length in bytes (page-rounded).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the block is empty. It never is; allocation rounds up to at
    /// least one page.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether [`protect_rx`](Self::protect_rx) has run.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// The address code will execute from. Valid before `protect_rx` so
    /// that absolute relocations can be applied against the final base.
    pub fn exec_ptr(&self) -> *const u8 {
        match &self.backing {
            Backing::Single(alloc) => alloc.as_ptr::<u8>(),
            #[cfg(feature = "selinux-fix")]
            Backing::Dual { rx, .. } => rx.as_ptr(),
        }
    }

    /// The writable view. Fails with a `State` error once the block has
    /// been protected.
    pub fn writable(&mut self) -> Result<&mut [u8], RuntimeError> {
        if self.executable {
            return Err(RuntimeError::State(
                "write to a block that is already executable".to_string(),
            ));
        }
        let ptr = match &mut self.backing {
            Backing::Single(alloc) => alloc.as_mut_ptr::<u8>(),
            #[cfg(feature = "selinux-fix")]
            Backing::Dual { rw, .. } => rw
                .as_mut()
                .expect("rw view present before protect")
                .as_mut_ptr(),
        };
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.len) })
    }

    /// The readable view of the executable address range.
    pub fn readable(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.exec_ptr(), self.len) }
    }

    /// Atomically transition the block to read+execute. Further writes are
    /// a programming error; the safe API refuses them and the hardware will
    /// trap raw ones.
    pub fn protect_rx(&mut self) -> Result<(), RuntimeError> {
        if self.executable {
            return Err(RuntimeError::State(
                "block is already executable".to_string(),
            ));
        }
        match &mut self.backing {
            Backing::Single(alloc) => {
                let (ptr, len) = (alloc.as_ptr::<u8>(), alloc.len());
                unsafe { region::protect(ptr, len, region::Protection::READ_EXECUTE) }
                    .map_err(|e| RuntimeError::Protection(e.to_string()))?;
            }
            #[cfg(feature = "selinux-fix")]
            Backing::Dual { rw, .. } => {
                // The RX alias has existed all along; dropping the RW view
                // enforces W^X from here on.
                *rw = None;
            }
        }
        self.executable = true;
        log::debug!("protected {} bytes rx", self.len);
        Ok(())
    }
}

// The mapping is released when the backing drops; `region::Allocation` and
// the mmap views both unmap in their own `Drop`.

// `region::Allocation` wraps a raw pointer, which makes it !Send/!Sync by
// default. The pages it owns carry no thread affinity: the spec mandates
// that finalized handles be callable concurrently from any thread (see
// `FuncHandle`), so `Block` must be both.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_page_aligned_and_writable() {
        let mut block = Block::alloc_rw(100).unwrap();
        assert_eq!(block.len() % region::page::size(), 0);
        assert_eq!(block.exec_ptr() as usize % region::page::size(), 0);
        block.writable().unwrap()[0] = 0xC3;
    }

    #[test]
    fn write_after_protect_is_a_state_error() {
        let mut block = Block::alloc_rw(16).unwrap();
        block.writable().unwrap()[0] = 0xC3;
        block.protect_rx().unwrap();
        assert!(matches!(block.writable(), Err(RuntimeError::State(_))));
        assert!(matches!(block.protect_rx(), Err(RuntimeError::State(_))));
    }

    #[test]
    fn protected_bytes_read_back_exactly() {
        let payload = [0x48u8, 0x89, 0xC8, 0xC3];
        let mut block = Block::alloc_rw(payload.len()).unwrap();
        block.writable().unwrap()[..payload.len()].copy_from_slice(&payload);
        block.protect_rx().unwrap();
        assert_eq!(&block.readable()[..payload.len()], &payload);
    }
}
