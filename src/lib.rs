//! User-space driver engine for Android Binder IPC: opens `/dev/binder`,
//! negotiates the wire ABI, and drives the `BC_*`/`BR_*` command loop, with
//! thin trait seams (`registry`, `protocol`) for the object model and RPC
//! framing a caller builds on top. `service` is a worked reference
//! implementation of those seams against the real `IServiceManager`
//! protocol; the engine itself does not require it.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

mod abi;
mod arena;
mod cmdloop;
mod codec;
mod device;
mod error;
mod payload;
mod protocol;
mod readbuf;
mod registry;
mod service;
mod session;

pub use abi::{BinderType, IoAbi, TransactionFlags, ABI_32, ABI_64};
pub use arena::ArenaBuffer;
pub use cmdloop::{CommandLoop, OutgoingRequest, ReplyPayload, STATUS_UNKNOWN_TRANSACTION};
pub use device::Readiness;
pub use error::{BinderError, Result};
pub use payload::Payload;
pub use protocol::{protocol_for_device_path, AndroidBinderProtocol, RpcProtocol};
pub use registry::{
    Handler, IncomingRequest, LocalObject, ObjectRegistry, OutgoingReply, RemoteObject, TransactionSupport,
};
pub use service::{BinderService, PublishedService, ServiceManager, ServiceProxy};
pub use session::{SessionConfig, SessionHandle, DEFAULT_DEVICE_PATH};
