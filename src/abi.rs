//! The two fixed ABI descriptors and the `BC_*`/`BR_*` opcode tables.
//!
//! Binder opcodes follow the Linux `_IOC` convention: direction, size and a
//! per-direction type character are packed into the same `u32` as the
//! command number, which is how the driver return loop can know a frame's
//! length from its opcode alone. The two structs whose size is
//! ABI-dependent are `binder_transaction_data` and the `ptr`/`cookie` and
//! `handle`/`cookie` pairs, all built from `pointer_size` below.

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | (((size as u32) & 0x3fff) << 16) | ((ty as u32) << 8) | (nr as u32)
}

const fn io_(ty: u8, nr: u8) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_WRITE, ty, nr, size)
}

const fn ior(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ, ty, nr, size)
}

/// Extract the payload length a return frame's opcode declares.
pub(crate) const fn ioc_size(opcode: u32) -> usize {
    ((opcode >> 16) & 0x3fff) as usize
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// A fixed, process-lifetime ABI descriptor: either the 32-bit or the
/// 64-bit binder wire layout, chosen once at `Session` construction from
/// the kernel's reported `BINDER_VERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAbi {
    pub name: &'static str,
    pub version: i32,
    pub pointer_size: usize,
}

pub static ABI_32: IoAbi = IoAbi {
    name: "binder32",
    version: 7,
    pointer_size: 4,
};

pub static ABI_64: IoAbi = IoAbi {
    name: "binder64",
    version: 8,
    pointer_size: 8,
};

/// Select the static descriptor whose declared version matches the
/// kernel's `BINDER_VERSION` reply, or `None` if it matches neither.
pub fn abi_for_version(version: i32) -> Option<&'static IoAbi> {
    if version == ABI_32.version {
        Some(&ABI_32)
    } else if version == ABI_64.version {
        Some(&ABI_64)
    } else {
        None
    }
}

impl IoAbi {
    pub(crate) const fn ptr_cookie_size(&self) -> usize {
        2 * self.pointer_size
    }

    /// `{ u32 handle; binder_uintptr_t cookie; }`, cookie aligned to a
    /// pointer-size boundary.
    pub(crate) const fn handle_cookie_size(&self) -> usize {
        round_up(4, self.pointer_size) + self.pointer_size
    }

    /// `binder_transaction_data`: target/cookie (pointer-sized), code,
    /// flags, sender_pid, sender_euid (4 bytes each), data_size,
    /// offsets_size (pointer-sized), and a 2-pointer-sized data union.
    pub(crate) const fn transaction_data_size(&self) -> usize {
        6 * self.pointer_size + 16
    }

    pub(crate) const fn transaction_data_sg_size(&self) -> usize {
        self.transaction_data_size() + self.pointer_size
    }

    // -- BC_* (command) opcodes --------------------------------------

    pub(crate) fn bc_transaction(&self) -> u32 {
        iow(b'c', 0, self.transaction_data_size())
    }
    pub(crate) fn bc_reply(&self) -> u32 {
        iow(b'c', 1, self.transaction_data_size())
    }
    pub(crate) fn bc_free_buffer(&self) -> u32 {
        iow(b'c', 3, self.pointer_size)
    }
    pub(crate) fn bc_increfs(&self) -> u32 {
        iow(b'c', 4, 4)
    }
    pub(crate) fn bc_acquire(&self) -> u32 {
        iow(b'c', 5, 4)
    }
    pub(crate) fn bc_release(&self) -> u32 {
        iow(b'c', 6, 4)
    }
    pub(crate) fn bc_decrefs(&self) -> u32 {
        iow(b'c', 7, 4)
    }
    pub(crate) fn bc_increfs_done(&self) -> u32 {
        iow(b'c', 8, self.ptr_cookie_size())
    }
    pub(crate) fn bc_acquire_done(&self) -> u32 {
        iow(b'c', 9, self.ptr_cookie_size())
    }
    pub(crate) fn bc_enter_looper(&self) -> u32 {
        io_(b'c', 12)
    }
    pub(crate) fn bc_exit_looper(&self) -> u32 {
        io_(b'c', 13)
    }
    pub(crate) fn bc_request_death_notification(&self) -> u32 {
        iow(b'c', 14, self.handle_cookie_size())
    }
    pub(crate) fn bc_clear_death_notification(&self) -> u32 {
        iow(b'c', 15, self.handle_cookie_size())
    }
    pub(crate) fn bc_transaction_sg(&self) -> u32 {
        iow(b'c', 17, self.transaction_data_sg_size())
    }
    pub(crate) fn bc_reply_sg(&self) -> u32 {
        iow(b'c', 18, self.transaction_data_sg_size())
    }

    // -- BR_* (return) opcodes ----------------------------------------

    pub(crate) fn br_noop(&self) -> u32 {
        io_(b'r', 12)
    }
    pub(crate) fn br_ok(&self) -> u32 {
        io_(b'r', 1)
    }
    pub(crate) fn br_spawn_looper(&self) -> u32 {
        io_(b'r', 13)
    }
    pub(crate) fn br_finished(&self) -> u32 {
        io_(b'r', 14)
    }
    pub(crate) fn br_clear_death_notification_done(&self) -> u32 {
        ior(b'r', 16, self.pointer_size)
    }
    pub(crate) fn br_incrrefs(&self) -> u32 {
        ior(b'r', 7, self.ptr_cookie_size())
    }
    pub(crate) fn br_acquire(&self) -> u32 {
        ior(b'r', 8, self.ptr_cookie_size())
    }
    pub(crate) fn br_release(&self) -> u32 {
        ior(b'r', 9, self.ptr_cookie_size())
    }
    pub(crate) fn br_decrefs(&self) -> u32 {
        ior(b'r', 10, self.ptr_cookie_size())
    }
    pub(crate) fn br_transaction(&self) -> u32 {
        ior(b'r', 2, self.transaction_data_size())
    }
    pub(crate) fn br_reply(&self) -> u32 {
        ior(b'r', 3, self.transaction_data_size())
    }
    pub(crate) fn br_transaction_complete(&self) -> u32 {
        io_(b'r', 6)
    }
    pub(crate) fn br_dead_reply(&self) -> u32 {
        io_(b'r', 5)
    }
    pub(crate) fn br_failed_reply(&self) -> u32 {
        io_(b'r', 17)
    }
    pub(crate) fn br_dead_binder(&self) -> u32 {
        ior(b'r', 15, self.pointer_size)
    }

    /// `BR_ERROR`: a legitimate kernel opcode this engine never interprets
    /// specially (the generic "any other opcode" path covers it).
    /// Exposed so the generic-skip path has something real to test against.
    pub(crate) fn br_error(&self) -> u32 {
        ior(b'r', 0, 4)
    }

    /// The flat in-payload object representation (`BinderType::Binder` /
    /// `BinderType::Handle`): `{ u32 type; u32 flags; ptr handle/binder;
    /// ptr cookie; }`.
    pub(crate) const fn flat_object_size(&self) -> usize {
        8 + 2 * self.pointer_size
    }
}

const BINDER_TYPE_LARGE: u8 = 0x85;

macro_rules! pack_chars {
    ($c1:expr, $c2:expr, $c3:expr, $c4:expr) => {
        ((($c1 as u32) << 24) | (($c2 as u32) << 16) | (($c3 as u32) << 8) | ($c4 as u32))
    };
}

/// The flat-object type tag embedded alongside each offset in the offsets
/// array.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
pub enum BinderType {
    Binder = pack_chars!(b's', b'b', b'*', BINDER_TYPE_LARGE),
    WeakBinder = pack_chars!(b'w', b'b', b'*', BINDER_TYPE_LARGE),
    Handle = pack_chars!(b's', b'h', b'*', BINDER_TYPE_LARGE),
    WeakHandle = pack_chars!(b'w', b'h', b'*', BINDER_TYPE_LARGE),
    Fd = pack_chars!(b'f', b'd', b'*', BINDER_TYPE_LARGE),
}

impl BinderType {
    pub(crate) fn from_u32(value: u32) -> Option<Self> {
        Self::try_from(value).ok()
    }
}

bitflags! {
    /// `BC_TRANSACTION`/`BC_REPLY` header flags.
    pub struct TransactionFlags: u32 {
        const ONE_WAY = 1;
        const ROOT_OBJECT = 4;
        const STATUS_CODE = 8;
        const ACCEPT_FDS = 16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_selection_matches_declared_descriptor() {
        assert_eq!(abi_for_version(7).unwrap().pointer_size, 4);
        assert_eq!(abi_for_version(8).unwrap().pointer_size, 8);
        assert!(abi_for_version(42).is_none());
    }

    #[test]
    fn transaction_data_sizes_match_known_kernel_layouts() {
        assert_eq!(ABI_64.transaction_data_size(), 64);
        assert_eq!(ABI_32.transaction_data_size(), 40);
    }

    #[test]
    fn opcode_size_round_trips_through_ioc_size() {
        let abi = ABI_64;
        assert_eq!(ioc_size(abi.bc_transaction()), abi.transaction_data_size());
        assert_eq!(ioc_size(abi.bc_free_buffer()), 8);
        assert_eq!(ioc_size(abi.br_transaction_complete()), 0);
    }
}
