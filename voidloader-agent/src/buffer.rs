//! Host-allocated class buffers
//!
//! Every buffer handed back to the host must come from the host's allocator
//! and outlive the returning call. [`HostBuffer`] owns one such allocation and
//! releases it on drop unless ownership is transferred with
//! [`HostBuffer::into_raw`].

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use thiserror::Error;

/// Errors that can occur while allocating a host buffer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("Host refused to allocate {len} bytes (code {code})")]
    Refused { len: usize, code: i32 },

    #[error("Zero-length host buffers are not allowed")]
    ZeroLength,

    #[error("Buffer of {0} bytes exceeds the host size limit")]
    TooLarge(usize),
}

/// Allocation contract supplied by the host
///
/// # Safety
/// `allocate` must return a pointer valid for `len` writable bytes, and
/// `release` must accept exactly the pointers `allocate` produced.
pub unsafe trait HostAllocator: Send + Sync {
    /// Allocate `len` bytes in host-managed memory
    fn allocate(&self, len: usize) -> Result<NonNull<u8>, AllocError>;

    /// Return a buffer that was never handed to the host
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same `len`,
    /// and must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, len: usize);
}

/// A class buffer living in host-allocated memory
pub struct HostBuffer<'a> {
    ptr: NonNull<u8>,
    len: usize,
    allocator: &'a dyn HostAllocator,
}

impl<'a> HostBuffer<'a> {
    /// Allocate a fresh buffer and copy `bytes` into it
    pub fn copy_from(allocator: &'a dyn HostAllocator, bytes: &[u8]) -> Result<Self, AllocError> {
        if bytes.is_empty() {
            return Err(AllocError::ZeroLength);
        }
        if bytes.len() > i32::MAX as usize {
            return Err(AllocError::TooLarge(bytes.len()));
        }

        let ptr = allocator.allocate(bytes.len())?;
        // SAFETY: `ptr` is valid for `bytes.len()` writable bytes and is a new
        // allocation, so it cannot overlap `bytes`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }

        Ok(Self {
            ptr,
            len: bytes.len(),
            allocator,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation holds `len` initialized bytes for our lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hand the allocation to the host
    ///
    /// The caller becomes responsible for the memory; it is no longer
    /// released by this buffer.
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let parts = (self.ptr, self.len);
        std::mem::forget(self);
        parts
    }
}

impl Drop for HostBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `allocator.allocate(len)` and ownership was
        // never transferred (otherwise `into_raw` forgot `self`).
        unsafe { self.allocator.release(self.ptr, self.len) }
    }
}

impl fmt::Debug for HostBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Allocator backed by the process heap
///
/// Used where no host is attached, such as tests and embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

unsafe impl HostAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
        if len == 0 {
            return Err(AllocError::ZeroLength);
        }
        let layout = Layout::from_size_align(len, 1).map_err(|_| AllocError::TooLarge(len))?;
        // SAFETY: `layout` has non-zero size.
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError::Refused { len, code: -1 })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
        if let Ok(layout) = Layout::from_size_align(len, 1) {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}

impl HeapAllocator {
    /// Free memory obtained through [`HostBuffer::into_raw`] on this allocator
    ///
    /// # Safety
    /// Same contract as [`HostAllocator::release`].
    pub unsafe fn reclaim(&self, ptr: NonNull<u8>, len: usize) {
        self.release(ptr, len)
    }
}
