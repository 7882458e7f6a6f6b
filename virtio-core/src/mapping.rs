//! Page-granular mappings of DMA-capable memory objects.

use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::hw::MemoryObject;
use crate::VirtioError;

/// Hardware page size assumed throughout the transport layer.
pub const PAGE_SIZE: usize = 4096;

/// A window of a [`MemoryObject`] mapped into the process.
///
/// Construction maps whole pages covering `[offset, offset + size)`;
/// [`get`](PhysicalMapping::get) returns a pointer adjusted back to the
/// unaligned offset. The window is unmapped when the value drops, on every
/// exit path.
pub struct PhysicalMapping {
    object: Arc<dyn MemoryObject>,
    base: NonNull<u8>,
    misalign: usize,
    mapped_size: usize,
    size: usize,
}

impl PhysicalMapping {
    /// Map `size` bytes of `object` starting at `offset`.
    pub fn new(
        object: Arc<dyn MemoryObject>,
        offset: usize,
        size: usize,
    ) -> Result<PhysicalMapping, VirtioError> {
        let page_offset = offset & !(PAGE_SIZE - 1);
        let misalign = offset & (PAGE_SIZE - 1);
        let mapped_size = (misalign + size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        let base = object.map(page_offset, mapped_size)?;
        Ok(PhysicalMapping {
            object,
            base,
            misalign,
            mapped_size,
            size,
        })
    }

    /// Pointer to the first byte of the requested window.
    pub fn get(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.misalign) }
    }

    /// Size of the requested window in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for PhysicalMapping {
    fn drop(&mut self) {
        self.object.unmap(self.base, self.mapped_size);
    }
}
