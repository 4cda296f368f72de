//! Fixed-capacity buffers for reuse. They back the pooled slots that hold partially received
//!  messages and pending writes, and the scratch buffer outbound frames are encoded into.
//!
//! Their salient points are:
//!
//! * backed by a fixed-length, pre-allocated buffer that never grows
//! * implement `BufMut` to fit into the `bytes` ecosystem
//! * support consuming data from the front, keeping the remainder at offset 0
//!

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

/// A fixed-length dynamically allocated buffer
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}
impl FixedBuf {
    /// create a new FixedBuffer instance with the given buffer capacity
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are reused aggressively, so there is no real benefit in lazy initialization
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// the entire underlying buffer regardless of `len`, e.g. as an encoding target
    pub fn as_full_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// the unused part of the buffer, to be filled by a read and then claimed with
    ///  [`FixedBuf::commit`]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    pub fn commit(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity(), "this is a bug: committing {} bytes with {} of {} used", cnt, self.len, self.capacity());
        self.len += cnt;
    }

    /// removes `cnt` bytes from the front, moving the remainder to the start of the buffer
    pub fn consume(&mut self, cnt: usize) {
        assert!(cnt <= self.len, "this is a bug: consuming {} bytes of {}", cnt, self.len);
        self.buf.copy_within(cnt..self.len, 0);
        self.len -= cnt;
    }

    /// This is a convenience function for test code
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FixedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
