//! Page-aligned heap buffers for direct (unbuffered) I/O.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Alignment required by direct-I/O write paths.
pub const PAGE_ALIGNMENT: usize = 4096;

/// Round `len` up to the next multiple of the page size.
pub fn page_align(len: usize) -> usize {
    len.div_ceil(PAGE_ALIGNMENT) * PAGE_ALIGNMENT
}

/// A zero-initialized, page-aligned, fixed-size heap buffer.
///
/// Length is always a multiple of [`PAGE_ALIGNMENT`]. Owned exclusively by
/// one session; never shared across threads while borrowed mutably, so the
/// manual `Send` below is sound.
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuf {
    /// Allocate `len` bytes (rounded up to the page size), zero-filled.
    pub fn zeroed(len: usize) -> Self {
        assert!(len > 0, "aligned buffer must be non-empty");
        let len = page_align(len);
        let layout = Layout::from_size_align(len, PAGE_ALIGNMENT)
            .expect("page-aligned layout is always valid for non-zero sizes");
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };
        AlignedBuf { ptr, len, layout }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// The buffer is plain bytes behind a unique owner.
unsafe impl Send for AlignedBuf {}
