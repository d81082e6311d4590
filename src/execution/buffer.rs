use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Zeroed, aligned host allocation backing one region
pub struct RegionBuffer {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// The buffer exclusively owns its allocation
unsafe impl Send for RegionBuffer {}
unsafe impl Sync for RegionBuffer {}

impl RegionBuffer {
    /// Allocate `size` zeroed bytes aligned to `alignment`
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        // zero-sized regions still get a real, aligned address
        let layout = Layout::from_size_align(size.max(1), alignment).map_err(|e| {
            Error::AllocationError(format!(
                "Invalid region layout: size={}, alignment={}: {}",
                size, alignment, e
            ))
        })?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::AllocationError(format!(
                "Failed to allocate memory: size={}, alignment={}",
                size, alignment
            ))
        })?;

        Ok(Self { ptr, size, layout })
    }

    /// Base address handed to a grantor
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for RegionBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for RegionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionBuffer")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("alignment", &self.layout.align())
            .finish()
    }
}
