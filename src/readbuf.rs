//! Read Buffer: the fixed-size scratch array the driver fills with
//! concatenated return frames.

use std::os::raw::c_void;

/// Large enough to hold several transactions' worth of interleaved
/// ref-count and reply frames without the kernel ever needing to split a
/// read across calls in ordinary use.
pub const READ_BUFFER_CAPACITY: usize = 8 * 1024;

pub struct ReadBuffer {
    data: [u8; READ_BUFFER_CAPACITY],
    len: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            data: [0u8; READ_BUFFER_CAPACITY],
            len: 0,
        }
    }

    /// Pointer to the first unused byte, for the kernel to write into.
    pub(crate) fn tail_mut_ptr(&mut self) -> *mut c_void {
        unsafe { self.data.as_mut_ptr().add(self.len) as *mut c_void }
    }

    pub(crate) fn remaining_capacity(&self) -> usize {
        READ_BUFFER_CAPACITY - self.len
    }

    /// Record that the kernel filled in `n` more bytes at the tail.
    pub(crate) fn extend_len(&mut self, n: usize) {
        self.len += n;
    }

    /// Test-only convenience: append bytes as if the kernel had written
    /// them, truncating to whatever capacity remains.
    #[cfg(test)]
    pub(crate) fn push_bytes(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining_capacity());
        self.data[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// The bytes filled so far (both already-dispatched and pending).
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Drop `consumed` bytes from the front, sliding any partial trailing
    /// frame down to offset zero so the next read can append to it.
    pub(crate) fn compact(&mut self, consumed: usize) {
        debug_assert!(consumed <= self.len);
        let remaining = self.len - consumed;
        if remaining > 0 {
            self.data.copy_within(consumed..self.len, 0);
        }
        self.len = remaining;
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_moves_partial_tail_to_front() {
        let mut buf = ReadBuffer::new();
        buf.data[0..8].copy_from_slice(b"AAAABBBB");
        buf.extend_len(8);
        buf.compact(4);
        assert_eq!(&buf.filled(), b"BBBB");
    }

    #[test]
    fn full_consumption_leaves_buffer_empty() {
        let mut buf = ReadBuffer::new();
        buf.extend_len(4);
        buf.compact(4);
        assert!(buf.filled().is_empty());
    }
}
