//! Object Registry and the collaborator traits the Command Loop
//! dispatches into. These are narrow, generic seams for the object
//! model and RPC dispatch a caller builds on top; `service.rs` is one
//! concrete implementation of them.

use std::sync::Arc;

use crate::abi::TransactionFlags;
use crate::arena::ArenaBuffer;
use crate::error::Result;

/// What a [`LocalObject`] does with a given inbound transaction code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSupport {
    /// No handler recognizes this code.
    None,
    /// The framework itself answers (e.g. an interface-name query).
    Looper,
    /// Dispatch to the application-supplied [`Handler`].
    Application,
}

/// What a [`LocalObject`] or [`Handler`] hands back for a reply: flat
/// payload bytes, embedded-object offsets, and the size of any
/// out-of-line extras.
#[derive(Debug, Clone, Default)]
pub struct OutgoingReply {
    pub payload: Vec<u8>,
    pub offsets: Vec<usize>,
    pub extra_buffers_size: u64,
}

impl OutgoingReply {
    pub fn from_bytes(payload: Vec<u8>) -> Self {
        Self {
            payload,
            offsets: Vec::new(),
            extra_buffers_size: 0,
        }
    }
}

/// An inbound transaction, decoded and ready for dispatch. Owns the
/// arena buffer backing the payload, if any; dropping it frees the
/// arena slot.
pub struct IncomingRequest {
    pub sender_pid: u32,
    pub sender_euid: u32,
    pub code: u32,
    pub flags: u32,
    payload: Option<ArenaBuffer>,
}

impl IncomingRequest {
    pub(crate) fn new(
        sender_pid: u32,
        sender_euid: u32,
        code: u32,
        flags: u32,
        payload: Option<ArenaBuffer>,
    ) -> Self {
        Self {
            sender_pid,
            sender_euid,
            code,
            flags,
            payload,
        }
    }

    pub fn is_one_way(&self) -> bool {
        TransactionFlags::from_bits_truncate(self.flags).contains(TransactionFlags::ONE_WAY)
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_ref().map(ArenaBuffer::as_slice).unwrap_or(&[])
    }

    pub fn offsets(&self) -> &[usize] {
        self.payload.as_ref().map(ArenaBuffer::offsets).unwrap_or(&[])
    }
}

/// A locally hosted object that can receive incoming transactions and
/// reference-count notifications.
pub trait LocalObject: Send + Sync {
    fn interface_name(&self) -> &str;

    fn handle_increfs(&self) {}
    fn handle_decrefs(&self) {}
    fn handle_acquire(&self) {}
    fn handle_release(&self) {}

    fn can_handle_transaction(&self, iface: &str, code: u32) -> TransactionSupport;

    /// Framework-level ("looper") handling, e.g. an interface-name
    /// query. Only invoked when `can_handle_transaction` returned
    /// [`TransactionSupport::Looper`].
    fn handle_looper_transaction(&self, req: &IncomingRequest) -> Result<(Option<OutgoingReply>, i32)>;
}

/// A proxy for a remote object this process holds a handle to.
pub trait RemoteObject: Send + Sync {
    fn handle_death_notification(&self);
}

/// Application-side dispatch for transactions a [`LocalObject`] reports
/// as [`TransactionSupport::Application`].
pub trait Handler: Send + Sync {
    fn transact(&self, obj: &dyn LocalObject, req: &IncomingRequest) -> Result<(Option<OutgoingReply>, i32)>;
}

/// Resolves cookies and handles to the objects the Command Loop
/// dispatches into.
pub trait ObjectRegistry: Send + Sync {
    fn get_local(&self, cookie: u64) -> Option<Arc<dyn LocalObject>>;
    fn get_remote(&self, handle: u32) -> Option<Arc<dyn RemoteObject>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_no_payload_reports_empty_slices() {
        let req = IncomingRequest::new(1, 2, 3, 0, None);
        assert!(req.payload_bytes().is_empty());
        assert!(req.offsets().is_empty());
        assert!(!req.is_one_way());
    }

    #[test]
    fn one_way_flag_is_detected() {
        let req = IncomingRequest::new(1, 2, 3, TransactionFlags::ONE_WAY.bits(), None);
        assert!(req.is_one_way());
    }
}
