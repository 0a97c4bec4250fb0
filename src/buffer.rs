//! Aligned, padded byte buffers for SIMD scanning.
//!
//! Every scan in this crate reads the input in 64-byte blocks, including a
//! one-byte lookahead for CRLF detection. [`PaddedBuffer`] guarantees that
//! reads up to 64 bytes past the logical end stay inside the allocation, so
//! the block loops need no tail special-casing.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::ptr::NonNull;

/// Number of readable slack bytes past the logical end of the data.
pub const SIMD_PADDING: usize = 64;

/// A byte buffer with 64-byte alignment and [`SIMD_PADDING`] bytes of
/// readable slack past the logical end.
///
/// The slack bytes are zeroed; block scans may read them but must discard
/// lanes at or beyond [`len`](PaddedBuffer::len).
pub struct PaddedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The buffer is plain bytes behind a unique owner.
unsafe impl Send for PaddedBuffer {}
unsafe impl Sync for PaddedBuffer {}

impl PaddedBuffer {
    fn layout(len: usize) -> Layout {
        // 64-byte alignment matches both the cache line and the widest block
        // load used by the scanners.
        Layout::from_size_align(len + SIMD_PADDING, 64).expect("buffer layout")
    }

    fn alloc(len: usize) -> Self {
        let layout = Self::layout(len);
        // Zeroed so the padding is initialized; its contents are never
        // interpreted, only loaded.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };
        Self { ptr, len }
    }

    /// Copy `data` into a fresh padded allocation.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::alloc(data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), buf.ptr.as_ptr(), data.len());
        }
        buf.len = data.len();
        buf
    }

    /// Read an entire file into a padded allocation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len() as usize;
        let buf = Self::alloc(size);
        let dest = unsafe { std::slice::from_raw_parts_mut(buf.ptr.as_ptr(), size) };
        file.read_exact(dest)?;
        Ok(buf)
    }

    /// Logical length in bytes (excluding padding).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The logical bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The logical bytes plus the trailing slack.
    ///
    /// Block scans slice this so that a full 64-byte window starting at any
    /// offset `< len` is in bounds.
    #[inline]
    pub fn padded(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len + SIMD_PADDING) }
    }
}

impl Drop for PaddedBuffer {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), Self::layout(self.len));
        }
    }
}

impl std::fmt::Debug for PaddedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaddedBuffer").field("len", &self.len).finish()
    }
}

impl From<&[u8]> for PaddedBuffer {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<Vec<u8>> for PaddedBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_slice(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        let buf = PaddedBuffer::from_slice(b"a,b,c\n");
        assert_eq!(buf.data().as_ptr() as usize % 64, 0);
    }

    #[test]
    fn test_padding_is_readable_and_zeroed() {
        let buf = PaddedBuffer::from_slice(b"xyz");
        let padded = buf.padded();
        assert_eq!(padded.len(), 3 + SIMD_PADDING);
        assert_eq!(&padded[..3], b"xyz");
        assert!(padded[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty() {
        let buf = PaddedBuffer::from_slice(b"");
        assert!(buf.is_empty());
        assert_eq!(buf.padded().len(), SIMD_PADDING);
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("csvidx_buffer_test.csv");
        std::fs::write(&path, b"a,b\n1,2\n").unwrap();
        let buf = PaddedBuffer::from_file(&path).unwrap();
        assert_eq!(buf.data(), b"a,b\n1,2\n");
        std::fs::remove_file(&path).ok();
    }
}
