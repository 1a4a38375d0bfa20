//! Device Session: opens the binder device node, negotiates the ABI,
//! memory-maps the receive arena, and best-effort configures the
//! worker-thread ceiling. Generalized from a single hard-coded device
//! into a tagged-ABI, trait-seamed shape that can target either pointer
//! width and be driven by a scripted device in tests.

use std::ffi::c_void;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::{sysconf, SysconfVar};

use crate::abi::{abi_for_version, IoAbi};
use crate::device::{
    binder_read_version, binder_set_max_threads, write_read_with_retry, NixDevice, RawBinderVersion, RawDevice,
    Readiness,
};
use crate::error::{BinderError, Result};
use crate::protocol::{protocol_for_device_path, RpcProtocol};
use crate::readbuf::ReadBuffer;

pub const DEFAULT_DEVICE_PATH: &str = "/dev/binder";

/// Arena size used for every session: `1 MiB - 2 * page_size`.
fn default_arena_size() -> usize {
    let page_size = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .unwrap_or(4096) as usize;
    (1024 * 1024) - 2 * page_size
}

/// Operational settings for opening a [`SessionHandle`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub device_path: PathBuf,
    pub max_threads: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            max_threads: 0,
        }
    }
}

impl SessionConfig {
    pub fn new<P: Into<PathBuf>>(device_path: P) -> Self {
        Self {
            device_path: device_path.into(),
            ..Self::default()
        }
    }

    pub fn with_max_threads(mut self, max_threads: u32) -> Self {
        self.max_threads = max_threads;
        self
    }
}

struct Inner {
    device: Box<dyn RawDevice>,
    arena_ptr: *mut c_void,
    arena_len: usize,
    abi: &'static IoAbi,
    protocol: &'static dyn RpcProtocol,
    device_path: PathBuf,
}

// `arena_ptr` is a read-only mapping never touched concurrently except
// through the kernel's own writes; `device` is required `Send + Sync` by
// the `RawDevice` bound.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.arena_len > 0 {
            if let Err(err) = unsafe { munmap(self.arena_ptr, self.arena_len) } {
                log::warn!("munmap of binder arena at {:p} failed: {}", self.arena_ptr, err);
            }
        }
    }
}

/// A shared handle to an open Device Session. Cloning is an explicit
/// `ref`; dropping the last clone is `unref` and tears the session down
/// -- arena first, then the device handle.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl SessionHandle {
    /// Open a device node, negotiate its ABI, and map the arena. Any
    /// failure aborts construction with no state retained.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_CLOEXEC.bits())
            .open(&config.device_path)?;
        let device = NixDevice::new(file);
        let abi = negotiate_abi(&device)?;
        set_max_threads_best_effort(&device, config.max_threads);
        let (arena_ptr, arena_len) = map_arena(device.raw_fd())?;
        let protocol = protocol_for_device_path(&config.device_path.to_string_lossy());

        Ok(Self {
            inner: Arc::new(Inner {
                device: Box::new(device),
                arena_ptr,
                arena_len,
                abi,
                protocol,
                device_path: config.device_path,
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_raw_device(abi: &'static IoAbi, device: impl RawDevice + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                device: Box::new(device),
                arena_ptr: ptr::null_mut(),
                arena_len: 0,
                abi,
                protocol: protocol_for_device_path(DEFAULT_DEVICE_PATH),
                device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            }),
        }
    }

    pub fn abi(&self) -> &'static IoAbi {
        self.inner.abi
    }

    pub fn protocol(&self) -> &'static dyn RpcProtocol {
        self.inner.protocol
    }

    pub fn device_path(&self) -> &std::path::Path {
        &self.inner.device_path
    }

    /// Number of live handles sharing this session.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// One retrying `ioctl(BINDER_WRITE_READ)` round-trip: EAGAIN is
    /// absorbed transparently.
    pub(crate) fn write_read(&self, write_buf: &[u8], read_buf: &mut ReadBuffer) -> Result<(usize, usize)> {
        write_read_with_retry(self.inner.device.as_ref(), write_buf, read_buf, true)
    }

    /// A write-only round-trip: `read_size` is zero, so the call cannot
    /// block waiting for unrelated inbound traffic and cannot silently
    /// swallow any. For one-way command frames (`BC_ENTER_LOOPER`,
    /// ref-count acks, `BC_FREE_BUFFER`, ...) that have nothing to say
    /// about a reply.
    pub(crate) fn write_only(&self, write_buf: &[u8]) -> Result<()> {
        let mut scratch = ReadBuffer::new();
        write_read_with_retry(self.inner.device.as_ref(), write_buf, &mut scratch, false)?;
        Ok(())
    }

    /// Issue a write-only `BC_FREE_BUFFER` for an arena payload.
    /// Zero-read, fire-and-forget: the kernel acknowledges nothing.
    pub(crate) fn free_buffer(&self, ptr: u64) -> Result<()> {
        let frame = crate::codec::encode_pointer(self.inner.abi, self.inner.abi.bc_free_buffer(), ptr);
        self.write_only(&frame)
    }

    /// Block until the session handle (and, if given, an extra
    /// caller-supplied fd) is readable, erroring, or hung up.
    pub fn poll(&self, extra: Option<std::os::unix::io::RawFd>, timeout_ms: i32) -> Result<Readiness> {
        self.inner
            .device
            .poll(extra, timeout_ms)
            .map_err(BinderError::Errno)
    }

}

fn negotiate_abi(device: &NixDevice) -> Result<&'static IoAbi> {
    let mut raw = RawBinderVersion { protocol_version: 0 };
    unsafe { binder_read_version(device.raw_fd(), &mut raw)? };
    abi_for_version(raw.protocol_version).ok_or(BinderError::UnsupportedAbiVersion {
        reported: raw.protocol_version,
    })
}

/// `BINDER_SET_MAX_THREADS` is advisory: a failure is logged, not fatal.
fn set_max_threads_best_effort(device: &NixDevice, max_threads: u32) {
    if let Err(err) = unsafe { binder_set_max_threads(device.raw_fd(), &max_threads) } {
        log::warn!("BINDER_SET_MAX_THREADS({}) failed: {}", max_threads, err);
    }
}

fn map_arena(fd: std::os::unix::io::RawFd) -> Result<(*mut c_void, usize)> {
    let len = default_arena_size();
    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
            fd,
            0,
        )?
    };
    Ok((ptr, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ABI_64;
    use crate::device::mock::{MockDevice, MockStep};

    #[test]
    fn ref_count_tracks_clones() {
        let device = MockDevice::new(ABI_64, vec![]);
        let session = SessionHandle::from_raw_device(&ABI_64, device);
        assert_eq!(session.ref_count(), 1);
        let second = session.clone();
        assert_eq!(session.ref_count(), 2);
        drop(second);
        assert_eq!(session.ref_count(), 1);
    }

    #[test]
    fn free_buffer_emits_bc_free_buffer_once() {
        let device = MockDevice::new(ABI_64, vec![MockStep::Deliver(vec![])]);
        let session = SessionHandle::from_raw_device(&ABI_64, device.clone());
        session.free_buffer(0x1000).unwrap();
        assert_eq!(device.free_buffer_calls(), vec![0x1000]);
    }
}
