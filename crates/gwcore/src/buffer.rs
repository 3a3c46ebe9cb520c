//! Appendable, sliceable byte buffer.
//!
//! `ByteBuffer` backs both halves of a `Connection`: the unread input
//! lies in `buffer[start..]` and the unwritten output likewise, with the
//! caller (not the buffer) tracking the `start` cursor. The buffer itself
//! only knows how to grow, search, and shed a consumed prefix.

use std::io::{self, Write};

/// A growable byte buffer with the primitives the connection layer needs:
/// append, byte search, prefix deletion (compaction), and writing a slice
/// of itself to any `Write` sink (a non-blocking socket, in practice).
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create an empty buffer with room for at least `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Total number of bytes currently stored (including any already
    /// "consumed" prefix the caller hasn't asked us to delete yet).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append `bytes` to the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// The full backing slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The backing slice starting at `start` (clamped to the buffer's
    /// length; out-of-range `start` yields an empty slice).
    #[inline]
    pub fn tail(&self, start: usize) -> &[u8] {
        if start >= self.data.len() {
            &[]
        } else {
            &self.data[start..]
        }
    }

    /// Find the first occurrence of `needle` at or after `from`, returning
    /// its absolute index.
    pub fn find_byte(&self, needle: u8, from: usize) -> Option<usize> {
        if from >= self.data.len() {
            return None;
        }
        self.data[from..]
            .iter()
            .position(|&b| b == needle)
            .map(|i| i + from)
    }

    /// Delete the first `n` bytes, shifting the remainder down to index 0.
    /// `n` is clamped to the buffer's length.
    pub fn delete_prefix(&mut self, n: usize) {
        let n = n.min(self.data.len());
        if n == 0 {
            return;
        }
        self.data.drain(0..n);
    }

    /// Copy out `len` bytes starting at `start` as an owned `Vec<u8>`.
    /// Panics if the range is out of bounds; callers are expected to have
    /// already checked availability.
    pub fn copy_range(&self, start: usize, len: usize) -> Vec<u8> {
        self.data[start..start + len].to_vec()
    }

    /// Write `self.data[start..]` to `writer` in a single call, returning
    /// the number of bytes actually written. Intended for non-blocking
    /// sinks: a partial write is not an error, it's the caller's job to
    /// advance `start` by the return value.
    pub fn write_tail_to<W: Write>(&self, start: usize, writer: &mut W) -> io::Result<usize> {
        if start >= self.data.len() {
            return Ok(0);
        }
        writer.write(&self.data[start..])
    }

    /// Drop everything, resetting to empty. Used when compaction would
    /// otherwise leave a zero-length but still-allocated tail.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}
