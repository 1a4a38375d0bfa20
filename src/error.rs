use thiserror::Error;

/// Errors surfaced by the driver engine.
///
/// Open/version/mmap failures abort construction, driver errors propagate
/// the kernel's negative return value, and the transaction-terminal kinds
/// (`DeadObject`, `Failed`) are the decoded status of a completed
/// `transact` call.
#[derive(Error, Debug)]
pub enum BinderError {
    #[error("binder ABI version {reported} matched neither the 32-bit nor 64-bit descriptor")]
    UnsupportedAbiVersion { reported: i32 },

    #[error("remote object is dead")]
    DeadObject,

    #[error("transaction failed in the driver")]
    Failed,

    #[error("local object refused transaction: bad message")]
    BadMessage,

    #[error("remote call failed: status {status:#x} ({message})")]
    RemoteCallFailed { status: i32, message: String },

    #[error("read buffer ended mid-frame")]
    Truncated,

    #[error("read buffer frame exceeds the fixed scratch capacity")]
    FrameTooLarge,

    #[error("kernel syscall failed")]
    Errno(#[from] nix::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("utf-16 decoding error")]
    Utf16(#[from] std::string::FromUtf16Error),

    #[error("utf-8 decoding error")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, BinderError>;
