//! Memory-mapped UIO register region
//!
//! Maps one `/dev/uioN` map into the process and exposes bounds-checked
//! 32-bit volatile access. Block transfers are performed one word at a time:
//! a `memcpy` may split or merge bus transactions, which the soft IP on the
//! other side of the bridge does not tolerate.

use crate::error::{DlaError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;

/// Size of one register word
const WORD: usize = std::mem::size_of::<u32>();

/// One mapped UIO region
#[derive(Debug)]
pub struct MmapRegion {
    base: NonNull<u8>,
    map_len: usize,
    /// Start of the register block within the mapping (sysfs `offset`)
    data_offset: usize,
    /// Usable bytes from `data_offset` (sysfs `size`)
    size: usize,
    file: File,
    name: String,
}

impl MmapRegion {
    /// Map region `map_index` of the UIO device node `dev_path`
    ///
    /// `size` and `offset` are the values published under
    /// `/sys/class/uio/uioN/maps/mapK/`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The device node cannot be opened
    /// - `size` is zero
    /// - mmap fails
    pub fn map_uio(dev_path: &Path, map_index: usize, size: usize, offset: usize) -> Result<Self> {
        tracing::debug!("Mapping UIO region: {} map{map_index}", dev_path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev_path)
            .map_err(|e| {
                DlaError::transfer_failed(format!("Cannot open {}: {e}", dev_path.display()))
            })?;

        if size == 0 {
            return Err(DlaError::invalid_access(format!(
                "UIO map{map_index} of {} has size 0",
                dev_path.display()
            )));
        }

        let map_len = size
            .checked_add(offset)
            .ok_or_else(|| DlaError::invalid_access("UIO map size overflows"))?;
        // UIO selects map K through an mmap offset of K pages
        let page_offset = (map_index * rustix::param::page_size()) as u64;

        // SAFETY: mmap is unsafe but we validate all preconditions:
        // - File descriptor is valid (just opened via OpenOptions)
        // - Length is non-zero (size checked above)
        // - PROT_READ|PROT_WRITE for register access, MAP_SHARED for device memory
        // - The offset selects the UIO map; the kernel validates it against the map table
        // - The file is stored in the struct so the fd outlives the mapping
        // - The mapping is released in Drop
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                page_offset,
            )
        }
        .map_err(|e| DlaError::transfer_failed(format!("mmap failed: {e}")))?;

        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| DlaError::transfer_failed("mmap returned a null mapping"))?;

        let name = dev_path.display().to_string();
        tracing::info!("Mapped {name} map{map_index} ({size:#x} bytes at {base:p})");

        Ok(Self {
            base,
            map_len,
            data_offset: offset,
            size,
            file,
            name,
        })
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset % WORD != 0 || len % WORD != 0 {
            return Err(DlaError::invalid_access(format!(
                "{}: unaligned access offset={offset:#x} len={len:#x}",
                self.name
            )));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(DlaError::invalid_access(format!(
                "{}: out of bounds access offset={offset:#x} len={len:#x} limit={:#x}",
                self.name, self.size
            )));
        }
        Ok(())
    }

    fn word_ptr(&self, offset: usize) -> *mut u32 {
        // SAFETY: callers have bounds-checked `offset` against `size`, and
        // `data_offset + size == map_len`, so the result stays inside the mapping.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.base.as_ptr().add(self.data_offset + offset).cast::<u32>()
        }
    }

    /// Read the register word at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if offset is misaligned or out of bounds
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset, WORD)?;

        // SAFETY: Volatile read from a memory-mapped register.
        // - Bounds and 4-byte alignment validated above
        // - The mapping is page aligned and data_offset comes from the kernel's map table
        // - read_volatile keeps the compiler from eliding or merging the bus access
        let value = unsafe { self.word_ptr(offset).read_volatile() };

        tracing::trace!("{} read @ {offset:#x} = {value:#x}", self.name);
        Ok(value)
    }

    /// Write the register word at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if offset is misaligned or out of bounds
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset, WORD)?;
        tracing::trace!("{} write @ {offset:#x} = {value:#x}", self.name);

        // SAFETY: Volatile write to a memory-mapped register.
        // - Bounds and 4-byte alignment validated above
        // - write_volatile issues exactly one 32-bit bus write
        unsafe { self.word_ptr(offset).write_volatile(value) };
        Ok(())
    }

    /// Copy `buf.len()` bytes from the region, one word at a time
    ///
    /// # Errors
    ///
    /// Returns error if offset or length is not word aligned, or out of bounds
    pub fn read_block(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        for (i, chunk) in buf.chunks_exact_mut(WORD).enumerate() {
            // SAFETY: bounds and alignment validated above; each word lies in range
            let word = unsafe { self.word_ptr(offset + i * WORD).read_volatile() };
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    /// Copy `data` into the region, one word at a time
    ///
    /// # Errors
    ///
    /// Returns error if offset or length is not word aligned, or out of bounds
    pub fn write_block(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        for (i, chunk) in data.chunks_exact(WORD).enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // SAFETY: bounds and alignment validated above; each word lies in range
            unsafe { self.word_ptr(offset + i * WORD).write_volatile(word) };
        }
        Ok(())
    }

    /// Usable region size in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// The UIO device file backing the mapping
    pub const fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        tracing::debug!("Unmapping {} ({:#x} bytes)", self.name, self.map_len);

        // SAFETY: munmap requires:
        // - addr was returned by mmap (self.base, from map_uio)
        // - length matches the mapped length (self.map_len)
        // - No references into the mapping outlive self (all accessors copy values out)
        unsafe {
            if let Err(e) = munmap(self.base.as_ptr().cast(), self.map_len) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: Send implementation is safe because:
// - MmapRegion owns the mapping exclusively (no other in-process references)
// - The mapping stays valid for the lifetime of the MmapRegion (file kept open)
// - Moving the owner between threads doesn't invalidate the mapping
unsafe impl Send for MmapRegion {}

// SAFETY: Sync implementation is safe because:
// - All accesses are bounds-checked, aligned, single-word volatile operations
// - Each 32-bit register access is one bus transaction; concurrent accesses
//   are serialised by the interconnect, not by host memory
// - No host-side mutable state exists (base, sizes, file are immutable)
unsafe impl Sync for MmapRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_node() {
        let err = MmapRegion::map_uio(Path::new("/nonexistent/uio99"), 0, 4096, 0).unwrap_err();
        assert!(matches!(err, DlaError::TransferFailed { .. }));
    }

    #[test]
    fn test_zero_size_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let err = MmapRegion::map_uio(tmp.path(), 0, 0, 0).unwrap_err();
        assert!(matches!(err, DlaError::InvalidAccess { .. }));
    }

    #[test]
    fn test_file_backed_word_access() {
        // A regular file stands in for the device node
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(4096).unwrap();

        let region = MmapRegion::map_uio(tmp.path(), 0, 4096, 0).unwrap();
        region.write_u32(0x204, 0xdead_beef).unwrap();
        assert_eq!(region.read_u32(0x204).unwrap(), 0xdead_beef);

        region.write_block(0x10, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut buf = [0u8; 8];
        region.read_block(0x10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

        assert!(region.read_u32(0x202).is_err());
        assert!(region.read_u32(4096).is_err());
        assert!(region.write_block(0, &[0u8; 3]).is_err());
    }
}
