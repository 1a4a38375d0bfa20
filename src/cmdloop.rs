//! Command Loop: the transactional state machine driving `write_read`,
//! interpreting concatenated return frames, dispatching into the Object
//! Registry / Handler, and releasing arena buffers. Built around the
//! sum-type [`ReturnFrame`](crate::codec::ReturnFrame) and a move-only
//! [`ArenaBuffer`], rather than looping over a single flat buffer
//! tracking its own read cursor.

use std::sync::Arc;

use crate::abi::TransactionFlags;
use crate::arena::ArenaBuffer;
use crate::codec::{
    encode_bare, encode_handle, encode_ptr_cookie, encode_transaction, unpack_offsets, ReturnFrame, TransactionHeader,
};
use crate::error::{BinderError, Result};
use crate::readbuf::ReadBuffer;
use crate::registry::{Handler, IncomingRequest, LocalObject, ObjectRegistry, OutgoingReply, TransactionSupport};
use crate::session::SessionHandle;

/// Android's `UNKNOWN_TRANSACTION` status: what this engine replies with
/// when no local object answers for a code.
pub const STATUS_UNKNOWN_TRANSACTION: i32 = -74;

/// Inputs to an outgoing transaction.
pub struct OutgoingRequest {
    pub target: u32,
    pub code: u32,
    pub flags: u32,
    pub payload: Vec<u8>,
    pub offsets: Vec<usize>,
    pub extra_buffers_size: u64,
}

impl OutgoingRequest {
    pub fn new(target: u32, code: u32, payload: Vec<u8>) -> Self {
        Self {
            target,
            code,
            flags: 0,
            payload,
            offsets: Vec::new(),
            extra_buffers_size: 0,
        }
    }
}

/// A `BR_REPLY`'s payload, still owned by the arena until dropped.
pub struct ReplyPayload {
    buffer: Option<ArenaBuffer>,
}

impl ReplyPayload {
    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_ref().map(ArenaBuffer::as_slice).unwrap_or(&[])
    }

    pub fn offsets(&self) -> &[usize] {
        self.buffer.as_ref().map(ArenaBuffer::offsets).unwrap_or(&[])
    }
}

/// Whether the generic dispatch path is being run while a `transact`
/// call on this thread awaits its terminal frame, or as the
/// steady-state drain/passive-read pump with nothing outstanding.
enum DispatchContext<'a> {
    Awaiting {
        one_way: bool,
        status: &'a mut Option<Result<i32>>,
        reply: &'a mut Option<ReplyPayload>,
    },
    Draining,
}

/// Drives the binder protocol for one Device Session: issues
/// transactions, pumps the passive read loop, and dispatches inbound
/// traffic into the supplied collaborators.
///
/// Holds no mutable state beyond the `SessionHandle`'s own reference
/// count; every call's Read Buffer and transaction bookkeeping lives on
/// the stack, so a handler invoked from dispatch may itself call
/// `transact` re-entrantly.
pub struct CommandLoop {
    session: SessionHandle,
    registry: Arc<dyn ObjectRegistry>,
    handler: Arc<dyn Handler>,
}

impl CommandLoop {
    pub fn new(session: SessionHandle, registry: Arc<dyn ObjectRegistry>, handler: Arc<dyn Handler>) -> Self {
        Self {
            session,
            registry,
            handler,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// `BC_ENTER_LOOPER`: the caller is dedicating this thread to the
    /// passive read pump.
    pub fn enter_looper(&self) -> Result<()> {
        self.write_only(encode_bare(self.session.abi().bc_enter_looper()))
    }

    pub fn exit_looper(&self) -> Result<()> {
        self.write_only(encode_bare(self.session.abi().bc_exit_looper()))
    }

    fn write_only(&self, frame: Vec<u8>) -> Result<()> {
        self.session.write_only(&frame)
    }

    /// Outgoing transaction. `want_reply = false` makes this a one-way
    /// send: it returns as soon as `BR_TRANSACTION_COMPLETE` is
    /// observed, with no reply payload.
    pub fn transact(&self, req: OutgoingRequest, want_reply: bool) -> Result<(i32, Option<ReplyPayload>)> {
        let abi = self.session.abi();
        let mut flags = TransactionFlags::from_bits_truncate(req.flags);
        if !want_reply {
            flags |= TransactionFlags::ONE_WAY;
        }
        let header = TransactionHeader {
            target: req.target,
            code: req.code,
            flags: flags.bits(),
            payload: &req.payload,
            offsets: &req.offsets,
            extra_buffers_size: req.extra_buffers_size,
        };
        let (frame_bytes, _offsets_buf) = encode_transaction(abi, false, &header);

        let mut read_buf = ReadBuffer::new();
        let mut status: Option<Result<i32>> = None;
        let mut reply: Option<ReplyPayload> = None;

        let mut write_buf = frame_bytes.as_slice();
        loop {
            self.session.write_read(write_buf, &mut read_buf)?;
            write_buf = &[];
            {
                let mut ctx = DispatchContext::Awaiting {
                    one_way: !want_reply,
                    status: &mut status,
                    reply: &mut reply,
                };
                self.process_available(&mut read_buf, &mut ctx)?;
            }
            if status.is_some() {
                break;
            }
        }

        // Drain anything else already buffered or still arriving, using
        // the generic (non-terminal) path. A frame can be left
        // incomplete in the buffer (its tail not yet delivered), so the
        // fetch is keyed on whether a pass made progress, not on whether
        // the buffer happens to be empty -- otherwise a partial trailing
        // frame would spin `process_available` forever without ever
        // issuing the `write_read` that would complete it.
        loop {
            let mut ctx = DispatchContext::Draining;
            let processed = self.process_available(&mut read_buf, &mut ctx)?;
            if processed == 0 {
                let (_, read_n) = self.session.write_read(&[], &mut read_buf)?;
                if read_n == 0 {
                    break;
                }
            }
        }

        let outcome = status.unwrap_or(Ok(0))?;
        Ok((outcome, reply))
    }

    /// Passive read pump for caller-owned looper threads: issue a
    /// zero-write `write_read`, dispatch everything it returns, and keep
    /// going as long as the last read produced data.
    pub fn read(&self) -> Result<()> {
        let mut read_buf = ReadBuffer::new();
        loop {
            let (_, read_n) = self.session.write_read(&[], &mut read_buf)?;
            let mut ctx = DispatchContext::Draining;
            self.process_available(&mut read_buf, &mut ctx)?;
            if read_n == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Decode and dispatch every complete frame currently at the front
    /// of `read_buf`, compacting after each pass. Returns the number of
    /// frames processed.
    fn process_available(&self, read_buf: &mut ReadBuffer, ctx: &mut DispatchContext) -> Result<usize> {
        let mut processed = 0;
        let mut consumed_total = 0;
        loop {
            let remaining = &read_buf.filled()[consumed_total..];
            match crate::codec::decode_next(self.session.abi(), remaining) {
                Some((frame, consumed)) => {
                    self.dispatch_frame(frame, ctx)?;
                    consumed_total += consumed;
                    processed += 1;
                    if let DispatchContext::Awaiting { status, .. } = ctx {
                        if status.is_some() {
                            break;
                        }
                    }
                }
                None => break,
            }
        }
        read_buf.compact(consumed_total);
        Ok(processed)
    }

    fn dispatch_frame(&self, frame: ReturnFrame, ctx: &mut DispatchContext) -> Result<()> {
        match frame {
            ReturnFrame::Noop | ReturnFrame::Ok | ReturnFrame::SpawnLooper | ReturnFrame::Finished
            | ReturnFrame::ClearDeathNotificationDone => {
                log::trace!("return frame {:?} -- no action", frame);
            }
            ReturnFrame::IncRefs { ptr, cookie } => {
                self.write_only(encode_ptr_cookie(self.session.abi(), self.session.abi().bc_increfs_done(), ptr, cookie))?;
                self.notify_local(cookie, |o| o.handle_increfs());
            }
            ReturnFrame::Acquire { ptr, cookie } => {
                self.write_only(encode_ptr_cookie(self.session.abi(), self.session.abi().bc_acquire_done(), ptr, cookie))?;
                self.notify_local(cookie, |o| o.handle_acquire());
            }
            ReturnFrame::DecRefs { cookie, .. } => {
                self.notify_local(cookie, |o| o.handle_decrefs());
            }
            ReturnFrame::Release { cookie, .. } => {
                self.notify_local(cookie, |o| o.handle_release());
            }
            ReturnFrame::Transaction(data) => {
                self.dispatch_inbound_transaction(data)?;
            }
            ReturnFrame::TransactionComplete => {
                if let DispatchContext::Awaiting { one_way: true, status, .. } = ctx {
                    **status = Some(Ok(0));
                }
            }
            ReturnFrame::DeadReply => {
                if let DispatchContext::Awaiting { status, .. } = ctx {
                    **status = Some(Err(BinderError::DeadObject));
                } else {
                    log::warn!("BR_DEAD_REPLY with no pending transaction on this thread");
                }
            }
            ReturnFrame::FailedReply => {
                if let DispatchContext::Awaiting { status, .. } = ctx {
                    **status = Some(Err(BinderError::Failed));
                } else {
                    log::warn!("BR_FAILED_REPLY with no pending transaction on this thread");
                }
            }
            ReturnFrame::Reply(data) => {
                if let DispatchContext::Awaiting { status, reply, .. } = ctx {
                    **reply = self.take_reply_payload(&data);
                    **status = Some(Ok(0));
                } else {
                    log::warn!("BR_REPLY with no pending transaction on this thread");
                }
            }
            ReturnFrame::DeadBinder { cookie } => {
                if let Some(remote) = self.registry.get_remote(cookie as u32) {
                    remote.handle_death_notification();
                } else {
                    log::warn!("BR_DEAD_BINDER for unknown remote {:#x}", cookie);
                }
            }
            ReturnFrame::Unknown { opcode } => {
                log::warn!("unexpected return opcode {:#x}, skipping by declared size", opcode);
            }
        }
        Ok(())
    }

    fn notify_local(&self, cookie: u64, f: impl FnOnce(&dyn LocalObject)) {
        match self.registry.get_local(cookie) {
            Some(obj) => f(obj.as_ref()),
            None => log::warn!("ref-count notification for unknown local object cookie {:#x}", cookie),
        }
    }

    /// Wrap a decoded `BR_REPLY`'s arena payload, if any, into a
    /// [`ReplyPayload`] that will free it on drop -- or free it
    /// immediately and return `None` for an empty payload, which never
    /// carries an arena ownership transfer.
    fn take_reply_payload(&self, data: &crate::codec::RawTransactionData) -> Option<ReplyPayload> {
        if data.data_size == 0 {
            return None;
        }
        let offsets = self.read_arena_offsets(data.offsets_ptr, data.offsets_size);
        let buffer = ArenaBuffer::new(self.session.clone(), data.data_ptr, data.data_size as usize, offsets);
        Some(ReplyPayload { buffer: Some(buffer) })
    }

    fn read_arena_offsets(&self, offsets_ptr: u64, offsets_size: u64) -> Vec<usize> {
        if offsets_size == 0 || offsets_ptr == 0 {
            return Vec::new();
        }
        let raw = unsafe { std::slice::from_raw_parts(offsets_ptr as *const u8, offsets_size as usize) };
        unpack_offsets(self.session.abi(), raw)
    }

    fn dispatch_inbound_transaction(&self, data: crate::codec::RawTransactionData) -> Result<()> {
        let payload = if data.data_size == 0 {
            None
        } else {
            let offsets = self.read_arena_offsets(data.offsets_ptr, data.offsets_size);
            Some(ArenaBuffer::new(self.session.clone(), data.data_ptr, data.data_size as usize, offsets))
        };
        let req = IncomingRequest::new(data.sender_pid, data.sender_euid, data.code, data.flags, payload);
        let one_way = req.is_one_way();

        let local = self.registry.get_local(data.cookie);
        let support = match &local {
            Some(obj) => obj.can_handle_transaction(obj.interface_name(), data.code),
            None => TransactionSupport::None,
        };

        let (reply, status): (Option<OutgoingReply>, i32) = match support {
            TransactionSupport::None => (None, STATUS_UNKNOWN_TRANSACTION),
            TransactionSupport::Looper => local.as_deref().unwrap().handle_looper_transaction(&req)?,
            TransactionSupport::Application => self.handler.transact(local.as_deref().unwrap(), &req)?,
        };

        if !one_way {
            self.send_reply(reply, status)?;
        }
        Ok(())
    }

    fn send_reply(&self, reply: Option<OutgoingReply>, status: i32) -> Result<()> {
        let abi = self.session.abi();
        let (payload, offsets, extra_buffers_size, flags) = match reply {
            Some(r) => (r.payload, r.offsets, r.extra_buffers_size, 0u32),
            None => (status.to_le_bytes().to_vec(), Vec::new(), 0u64, TransactionFlags::STATUS_CODE.bits()),
        };
        let header = TransactionHeader {
            target: 0,
            code: 0,
            flags,
            payload: &payload,
            offsets: &offsets,
            extra_buffers_size,
        };
        let (frame_bytes, _offsets_buf) = encode_transaction(abi, true, &header);
        self.write_only(frame_bytes)
    }

    /// Echo reference-count and acquire calls toward a handle the
    /// caller holds (`BC_INCREFS`/`BC_ACQUIRE`/etc, argument is an
    /// opaque handle).
    pub fn increfs(&self, handle: i32) -> Result<()> {
        self.write_only(encode_handle(self.session.abi().bc_increfs(), handle))
    }

    pub fn decrefs(&self, handle: i32) -> Result<()> {
        self.write_only(encode_handle(self.session.abi().bc_decrefs(), handle))
    }

    pub fn acquire(&self, handle: i32) -> Result<()> {
        self.write_only(encode_handle(self.session.abi().bc_acquire(), handle))
    }

    pub fn release(&self, handle: i32) -> Result<()> {
        self.write_only(encode_handle(self.session.abi().bc_release(), handle))
    }

    /// `BC_REQUEST_DEATH_NOTIFICATION`: ask the driver to emit
    /// `BR_DEAD_BINDER` with `cookie` if `handle`'s process dies.
    pub fn request_death_notification(&self, handle: u32, cookie: u64) -> Result<()> {
        self.write_only(crate::codec::encode_handle_cookie(
            self.session.abi(),
            self.session.abi().bc_request_death_notification(),
            handle,
            cookie,
        ))
    }

    pub fn clear_death_notification(&self, handle: u32, cookie: u64) -> Result<()> {
        self.write_only(crate::codec::encode_handle_cookie(
            self.session.abi(),
            self.session.abi().bc_clear_death_notification(),
            handle,
            cookie,
        ))
    }
}
