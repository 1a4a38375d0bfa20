//! Wire Codec: stateless `BC_*` encoders and `BR_*` decoders, parameterized
//! by an [`IoAbi`](crate::abi::IoAbi).

use byteorder::{LittleEndian, WriteBytesExt};

use crate::abi::{ioc_size, BinderType, IoAbi};
use crate::error::{BinderError, Result};

/// Decoded `binder_transaction_data`, with every pointer-width field
/// widened to `u64` regardless of which ABI produced it.
#[derive(Debug, Clone, Copy)]
pub struct RawTransactionData {
    pub target: u32,
    pub cookie: u64,
    pub code: u32,
    pub flags: u32,
    pub sender_pid: u32,
    pub sender_euid: u32,
    pub data_size: u64,
    pub offsets_size: u64,
    pub data_ptr: u64,
    pub offsets_ptr: u64,
}

/// One decoded `BR_*` return frame.
#[derive(Debug)]
pub enum ReturnFrame {
    Noop,
    Ok,
    SpawnLooper,
    Finished,
    ClearDeathNotificationDone,
    IncRefs { ptr: u64, cookie: u64 },
    Acquire { ptr: u64, cookie: u64 },
    DecRefs { ptr: u64, cookie: u64 },
    Release { ptr: u64, cookie: u64 },
    Transaction(RawTransactionData),
    Reply(RawTransactionData),
    TransactionComplete,
    DeadReply,
    FailedReply,
    DeadBinder { cookie: u64 },
    /// Any `BR_*` opcode this engine does not interpret (e.g. `BR_ERROR`,
    /// `BR_ATTEMPT_ACQUIRE`): logged by the caller and skipped by its
    /// declared `_IOC_SIZE`.
    Unknown { opcode: u32 },
}

fn read_ptr_field(abi: &IoAbi, buf: &[u8], at: usize) -> u64 {
    if abi.pointer_size == 4 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()) as u64
    } else {
        u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
    }
}

fn write_ptr_field(out: &mut Vec<u8>, abi: &IoAbi, value: u64) {
    if abi.pointer_size == 4 {
        out.write_u32::<LittleEndian>(value as u32).unwrap();
    } else {
        out.write_u64::<LittleEndian>(value).unwrap();
    }
}

fn decode_transaction_data(abi: &IoAbi, buf: &[u8]) -> RawTransactionData {
    let p = abi.pointer_size;
    let target = read_ptr_field(abi, buf, 0) as u32;
    let cookie = read_ptr_field(abi, buf, p);
    let mut off = 2 * p;
    let code = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let flags = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let sender_pid = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let sender_euid = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let data_size = read_ptr_field(abi, buf, off);
    off += p;
    let offsets_size = read_ptr_field(abi, buf, off);
    off += p;
    let data_ptr = read_ptr_field(abi, buf, off);
    off += p;
    let offsets_ptr = read_ptr_field(abi, buf, off);

    RawTransactionData {
        target,
        cookie,
        code,
        flags,
        sender_pid,
        sender_euid,
        data_size,
        offsets_size,
        data_ptr,
        offsets_ptr,
    }
}

/// Decode the next complete return frame from `buf`, returning the frame
/// and the number of bytes it occupied (`4 + _IOC_SIZE(opcode)`), or
/// `None` if `buf` holds fewer bytes than the declared frame length --
/// the caller should stop and wait for more data to arrive.
pub(crate) fn decode_next(abi: &IoAbi, buf: &[u8]) -> Option<(ReturnFrame, usize)> {
    if buf.len() < 4 {
        return None;
    }
    let opcode = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let size = ioc_size(opcode);
    let total = 4 + size;
    if buf.len() < total {
        return None;
    }
    let payload = &buf[4..total];

    let frame = if opcode == abi.br_noop() {
        ReturnFrame::Noop
    } else if opcode == abi.br_ok() {
        ReturnFrame::Ok
    } else if opcode == abi.br_spawn_looper() {
        ReturnFrame::SpawnLooper
    } else if opcode == abi.br_finished() {
        ReturnFrame::Finished
    } else if opcode == abi.br_clear_death_notification_done() {
        ReturnFrame::ClearDeathNotificationDone
    } else if opcode == abi.br_incrrefs() {
        ReturnFrame::IncRefs {
            ptr: read_ptr_field(abi, payload, 0),
            cookie: read_ptr_field(abi, payload, abi.pointer_size),
        }
    } else if opcode == abi.br_acquire() {
        ReturnFrame::Acquire {
            ptr: read_ptr_field(abi, payload, 0),
            cookie: read_ptr_field(abi, payload, abi.pointer_size),
        }
    } else if opcode == abi.br_decrefs() {
        ReturnFrame::DecRefs {
            ptr: read_ptr_field(abi, payload, 0),
            cookie: read_ptr_field(abi, payload, abi.pointer_size),
        }
    } else if opcode == abi.br_release() {
        ReturnFrame::Release {
            ptr: read_ptr_field(abi, payload, 0),
            cookie: read_ptr_field(abi, payload, abi.pointer_size),
        }
    } else if opcode == abi.br_transaction() {
        ReturnFrame::Transaction(decode_transaction_data(abi, payload))
    } else if opcode == abi.br_reply() {
        ReturnFrame::Reply(decode_transaction_data(abi, payload))
    } else if opcode == abi.br_transaction_complete() {
        ReturnFrame::TransactionComplete
    } else if opcode == abi.br_dead_reply() {
        ReturnFrame::DeadReply
    } else if opcode == abi.br_failed_reply() {
        ReturnFrame::FailedReply
    } else if opcode == abi.br_dead_binder() {
        ReturnFrame::DeadBinder {
            cookie: read_ptr_field(abi, payload, 0),
        }
    } else {
        ReturnFrame::Unknown { opcode }
    };

    Some((frame, total))
}

/// The fields needed to build an outgoing `BC_TRANSACTION`/`BC_REPLY`
/// frame.
pub struct TransactionHeader<'a> {
    pub target: u32,
    pub code: u32,
    pub flags: u32,
    pub payload: &'a [u8],
    pub offsets: &'a [usize],
    pub extra_buffers_size: u64,
}

fn pack_offsets(abi: &IoAbi, offsets: &[usize]) -> Vec<u8> {
    let mut out = Vec::with_capacity(offsets.len() * abi.pointer_size);
    for &o in offsets {
        write_ptr_field(&mut out, abi, o as u64);
    }
    out
}

/// Inverse of `pack_offsets`: unpack a raw offsets-array buffer (as the
/// kernel lays it out in the arena alongside an inbound transaction's
/// payload) into native-width offsets.
pub(crate) fn unpack_offsets(abi: &IoAbi, buf: &[u8]) -> Vec<usize> {
    buf.chunks_exact(abi.pointer_size)
        .map(|chunk| read_ptr_field(abi, chunk, 0) as usize)
        .collect()
}

/// Encode `BC_TRANSACTION`/`BC_TRANSACTION_SG` (or the `_REPLY` variants)
/// plus the packed offsets array the header points at. The offsets buffer
/// must be kept alive until after the `write_read` that consumes the
/// returned header bytes; callers get it back alongside the header so its
/// lifetime is visible at the call site.
pub(crate) fn encode_transaction(
    abi: &IoAbi,
    is_reply: bool,
    h: &TransactionHeader<'_>,
) -> (Vec<u8>, Vec<u8>) {
    let offsets_buf = pack_offsets(abi, h.offsets);
    let sg = h.extra_buffers_size > 0;
    let opcode = match (is_reply, sg) {
        (false, false) => abi.bc_transaction(),
        (false, true) => abi.bc_transaction_sg(),
        (true, false) => abi.bc_reply(),
        (true, true) => abi.bc_reply_sg(),
    };

    let mut out = Vec::with_capacity(4 + abi.transaction_data_sg_size());
    out.write_u32::<LittleEndian>(opcode).unwrap();
    write_ptr_field(&mut out, abi, h.target as u64);
    write_ptr_field(&mut out, abi, 0); // cookie: unused on outgoing frames
    out.write_u32::<LittleEndian>(h.code).unwrap();
    out.write_u32::<LittleEndian>(h.flags).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap(); // sender_pid: filled by the kernel
    out.write_u32::<LittleEndian>(0).unwrap(); // sender_euid: filled by the kernel
    write_ptr_field(&mut out, abi, h.payload.len() as u64);
    write_ptr_field(&mut out, abi, offsets_buf.len() as u64);
    let data_ptr = if h.payload.is_empty() {
        0
    } else {
        h.payload.as_ptr() as u64
    };
    let offsets_ptr = if offsets_buf.is_empty() {
        0
    } else {
        offsets_buf.as_ptr() as u64
    };
    write_ptr_field(&mut out, abi, data_ptr);
    write_ptr_field(&mut out, abi, offsets_ptr);
    if sg {
        write_ptr_field(&mut out, abi, h.extra_buffers_size);
    }

    (out, offsets_buf)
}

/// Encode a bare opcode frame (`BC_ENTER_LOOPER`, `BC_EXIT_LOOPER`).
pub(crate) fn encode_bare(opcode: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.write_u32::<LittleEndian>(opcode).unwrap();
    out
}

/// Encode opcode + 32-bit handle (`BC_INCREFS`/`BC_DECREFS`/`BC_ACQUIRE`/`BC_RELEASE`).
pub(crate) fn encode_handle(opcode: u32, handle: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.write_u32::<LittleEndian>(opcode).unwrap();
    out.write_i32::<LittleEndian>(handle).unwrap();
    out
}

/// Encode opcode + ABI-sized pointer (`BC_FREE_BUFFER`).
pub(crate) fn encode_pointer(abi: &IoAbi, opcode: u32, ptr: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + abi.pointer_size);
    out.write_u32::<LittleEndian>(opcode).unwrap();
    write_ptr_field(&mut out, abi, ptr);
    out
}

/// Encode opcode + ptr/cookie pair (`BC_INCREFS_DONE`/`BC_ACQUIRE_DONE`),
/// echoing exactly the payload the triggering `BR_INCREFS`/`BR_ACQUIRE`
/// carried.
pub(crate) fn encode_ptr_cookie(abi: &IoAbi, opcode: u32, ptr: u64, cookie: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + abi.ptr_cookie_size());
    out.write_u32::<LittleEndian>(opcode).unwrap();
    write_ptr_field(&mut out, abi, ptr);
    write_ptr_field(&mut out, abi, cookie);
    out
}

/// Encode opcode + handle/cookie death-notification descriptor.
pub(crate) fn encode_handle_cookie(abi: &IoAbi, opcode: u32, handle: u32, cookie: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + abi.handle_cookie_size());
    out.write_u32::<LittleEndian>(opcode).unwrap();
    out.write_u32::<LittleEndian>(handle).unwrap();
    let pad = abi.pointer_size - 4;
    for _ in 0..pad {
        out.write_u8(0).unwrap();
    }
    write_ptr_field(&mut out, abi, cookie);
    out
}

/// Encode a flat in-payload object reference: `{ type; flags; handle/ptr;
/// cookie }`. `handle_or_ptr` is a handle for `BinderType::Handle`, or the
/// local object's cookie for `BinderType::Binder`.
pub(crate) fn encode_flat_binder(abi: &IoAbi, binder_type: BinderType, handle_or_ptr: u64, cookie: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(abi.flat_object_size());
    out.write_u32::<LittleEndian>(binder_type as u32).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap(); // flags
    write_ptr_field(&mut out, abi, handle_or_ptr);
    write_ptr_field(&mut out, abi, cookie);
    out
}

/// Decode a flat in-payload object reference, returning its type tag plus
/// the handle/ptr and cookie fields, or `None` if `buf` is too short or the
/// type tag is unrecognized.
pub(crate) fn decode_flat_binder(abi: &IoAbi, buf: &[u8]) -> Option<(BinderType, u64, u64)> {
    if buf.len() < abi.flat_object_size() {
        return None;
    }
    let binder_type = BinderType::from_u32(u32::from_le_bytes(buf[0..4].try_into().unwrap()))?;
    let mut off = 8;
    let handle_or_ptr = read_ptr_field(abi, buf, off);
    off += abi.pointer_size;
    let cookie = read_ptr_field(abi, buf, off);
    Some((binder_type, handle_or_ptr, cookie))
}

/// Map a decoded `BR_DEAD_REPLY`/`BR_FAILED_REPLY`/`BR_REPLY` status into a
/// [`BinderError`], or `Ok(status)` on success.
pub(crate) fn status_to_result(status: i32) -> Result<i32> {
    if status < 0 {
        Err(BinderError::Failed)
    } else {
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ABI_64;

    #[test]
    fn encode_then_decode_transaction_round_trips() {
        let payload = b"AB".to_vec();
        let offsets = vec![0usize];
        let header = TransactionHeader {
            target: 7,
            code: 3,
            flags: 0,
            payload: &payload,
            offsets: &offsets,
            extra_buffers_size: 0,
        };
        let (bytes, offsets_buf) = encode_transaction(&ABI_64, false, &header);
        assert_eq!(offsets_buf.len(), 8);

        // Re-decode using the frame-skipping logic: flip the opcode field
        // to a BR_TRANSACTION so decode_next interprets the body.
        let mut frame_bytes = bytes.clone();
        let br_transaction = ABI_64.br_transaction().to_le_bytes();
        frame_bytes[0..4].copy_from_slice(&br_transaction);

        let (frame, consumed) = decode_next(&ABI_64, &frame_bytes).unwrap();
        assert_eq!(consumed, frame_bytes.len());
        match frame {
            ReturnFrame::Transaction(data) => {
                assert_eq!(data.target, 7);
                assert_eq!(data.code, 3);
                assert_eq!(data.data_size, 2);
                assert_eq!(data.offsets_size, 8);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn short_buffer_yields_none() {
        // Claims a real transaction opcode but supplies no payload bytes.
        let short = ABI_64.br_transaction().to_le_bytes().to_vec();
        assert!(decode_next(&ABI_64, &short).is_none());

        // A bare opcode with no declared payload decodes immediately.
        let complete = ABI_64.br_transaction_complete().to_le_bytes().to_vec();
        assert!(decode_next(&ABI_64, &complete).is_some());
    }

    #[test]
    fn offsets_pack_unpack_round_trips() {
        let offsets = vec![0usize, 4, 12];
        let packed = pack_offsets(&ABI_64, &offsets);
        assert_eq!(unpack_offsets(&ABI_64, &packed), offsets);
    }

    #[test]
    fn flat_binder_object_round_trips() {
        let encoded = encode_flat_binder(&ABI_64, BinderType::Handle, 9, 0);
        assert_eq!(encoded.len(), ABI_64.flat_object_size());
        let (ty, handle, cookie) = decode_flat_binder(&ABI_64, &encoded).unwrap();
        assert_eq!(ty, BinderType::Handle);
        assert_eq!(handle, 9);
        assert_eq!(cookie, 0);
    }

    #[test]
    fn unknown_opcode_is_skipped_by_declared_size() {
        let abi = ABI_64;
        // BR_ERROR: _IOR('r', 0, int32_t) -- not interpreted by this codec.
        let opcode = abi.br_error();
        let mut buf = Vec::new();
        buf.extend_from_slice(&opcode.to_le_bytes());
        buf.extend_from_slice(&(-1i32).to_le_bytes());
        let (frame, consumed) = decode_next(&abi, &buf).unwrap();
        assert_eq!(consumed, buf.len());
        matches!(frame, ReturnFrame::Unknown { .. });
    }
}
