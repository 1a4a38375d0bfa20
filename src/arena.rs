//! Arena buffer lifecycle: every inbound transaction's payload is a
//! pointer into the driver-owned mmap arena that must be returned with
//! `BC_FREE_BUFFER` exactly once. Modeled as a move-only RAII handle
//! instead of a raw pointer held directly on the transaction data, so
//! every path that discards a transaction frees exactly once.

use std::slice;

use crate::session::SessionHandle;

/// Owns a slice of the mmap arena and the object-reference offsets that
/// fall within it. Frees the slice back to the driver on drop, so every
/// path that discards a transaction -- success, early return, or panic
/// unwind -- frees exactly once.
pub struct ArenaBuffer {
    session: SessionHandle,
    ptr: u64,
    len: usize,
    offsets: Vec<usize>,
    freed: bool,
}

impl ArenaBuffer {
    pub(crate) fn new(session: SessionHandle, ptr: u64, len: usize, offsets: Vec<usize>) -> Self {
        Self {
            session,
            ptr,
            len,
            offsets,
            freed: false,
        }
    }

    /// The payload bytes, borrowed from the arena for this buffer's
    /// lifetime.
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
        }
    }

    /// Byte offsets of embedded object references within `as_slice()`.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn raw_ptr(&self) -> u64 {
        self.ptr
    }
}

impl Drop for ArenaBuffer {
    fn drop(&mut self) {
        if !self.freed {
            self.freed = true;
            if let Err(err) = self.session.free_buffer(self.ptr) {
                log::warn!("BC_FREE_BUFFER for {:#x} failed: {}", self.ptr, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ABI_64;
    use crate::device::mock::{MockDevice, MockStep};

    #[test]
    fn drop_emits_exactly_one_free_buffer() {
        let device = MockDevice::new(ABI_64, vec![MockStep::Deliver(vec![]), MockStep::Deliver(vec![])]);
        let session = SessionHandle::from_raw_device(&ABI_64, device.clone());
        {
            let buf = ArenaBuffer::new(session.clone(), 0x1000, 4, vec![]);
            drop(buf);
        }
        assert_eq!(device.free_buffer_calls(), vec![0x1000]);
    }

    #[test]
    fn zero_length_buffer_still_frees_once() {
        let device = MockDevice::new(ABI_64, vec![MockStep::Deliver(vec![])]);
        let session = SessionHandle::from_raw_device(&ABI_64, device.clone());
        let buf = ArenaBuffer::new(session.clone(), 0, 0, vec![]);
        assert!(buf.is_empty());
        drop(buf);
        // A null/zero-length payload still carries a pointer value in this
        // model; real-world callers skip constructing a buffer at all when
        // data_size is zero (see cmdloop::decode_incoming_payload).
        assert_eq!(device.free_buffer_calls(), vec![0]);
    }
}
