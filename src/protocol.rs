//! RPC Protocol Descriptor: writes an interface-name header into an
//! outgoing request's payload before the caller's own arguments.
//! Device-path -> protocol selection is an external lookup; this crate
//! ships the one real mapping most binder nodes need -- Android's
//! interface-token framing -- and lets callers plug in others.

use crate::payload::Payload;

pub trait RpcProtocol: Send + Sync {
    fn write_rpc_header(&self, payload: &mut Payload, iface_name: &str);
}

/// Android's binder interface-token framing: a strict-mode policy mask,
/// a work-source uid, a header marker, then the UTF-16 interface name.
pub struct AndroidBinderProtocol;

const STRICT_MODE_POLICY: i32 = (1i32 << 31) | 0x4200_0004u32 as i32;
const UNSET_WORK_SOURCE: i32 = -1;
const RPC_HEADER_MARKER: i32 = 0x5359_5354; // "SYST"

impl RpcProtocol for AndroidBinderProtocol {
    fn write_rpc_header(&self, payload: &mut Payload, iface_name: &str) {
        payload.write_i32(STRICT_MODE_POLICY);
        payload.write_i32(UNSET_WORK_SOURCE);
        payload.write_i32(RPC_HEADER_MARKER);
        payload.write_str16(iface_name);
    }
}

/// Selects an [`RpcProtocol`] for a device path. Every `/dev/binder`
/// family node this crate has seen speaks the Android protocol; a
/// caller targeting some other binder-like node supplies its own
/// [`RpcProtocol`] impl directly to `SessionHandle` rather than going
/// through this lookup.
pub fn protocol_for_device_path(_path: &str) -> &'static dyn RpcProtocol {
    &AndroidBinderProtocol
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_four_byte_aligned() {
        let mut payload = Payload::new();
        AndroidBinderProtocol.write_rpc_header(&mut payload, "IMyService");
        assert_eq!(payload.len() % 4, 0);
    }
}
