//! Service Manager protocol: a worked reference for wiring the Command
//! Loop to a concrete Object Registry -- the external collaborator
//! traits are generic; this module supplies one real implementation of
//! them, built on `CommandLoop`/`SessionHandle`/`Payload`.
//!
//! Talks Android's real `IServiceManager` wire protocol: `PING_TRANSACTION`,
//! the interface-name query every binder object answers, and the
//! `getService`/`addService` calls needed to find or publish a service.

use std::sync::Arc;

use crate::abi::BinderType;
use crate::cmdloop::{CommandLoop, OutgoingRequest};
use crate::codec::{decode_flat_binder, encode_flat_binder};
use crate::error::{BinderError, Result};
use crate::payload::Payload;
use crate::registry::{
    Handler, IncomingRequest, LocalObject, ObjectRegistry, OutgoingReply, RemoteObject, TransactionSupport,
};
use crate::session::SessionHandle;

const SERVICE_MANAGER_HANDLE: u32 = 0;
const SERVICE_MANAGER_INTERFACE: &str = "android.os.IServiceManager";

/// Every binder object answers this code with its interface name,
/// regardless of what it otherwise does.
const INTERFACE_TRANSACTION: u32 = 1_598_968_902;
const FIRST_CALL_TRANSACTION: u32 = 1;
const LAST_CALL_TRANSACTION: u32 = 16_777_215;

const fn pack_chars(c1: u8, c2: u8, c3: u8, c4: u8) -> u32 {
    ((c1 as u32) << 24) | ((c2 as u32) << 16) | ((c3 as u32) << 8) | (c4 as u32)
}

const PING_TRANSACTION: u32 = pack_chars(b'_', b'P', b'N', b'G');

#[repr(u32)]
enum ServiceManagerFunction {
    GetService = 1,
    AddService = 3,
}

/// The local object published under [`ServiceManager::register_service`]
/// always gets this cookie: one `ServiceManager` hosts at most one service.
const HOSTED_SERVICE_COOKIE: u64 = 1;

/// What a published service answers application-level calls with.
pub trait BinderService: Send + Sync {
    fn process_request(&self, code: u32, data: &mut Payload) -> Payload;
}

/// A remote handle obtained from [`ServiceManager::get_service`].
pub struct ServiceProxy {
    cmdloop: Arc<CommandLoop>,
    handle: u32,
    interface_name: String,
}

impl ServiceProxy {
    /// Issue a call, writing the interface-token header before `args` and
    /// decoding the Android in-band exception header before handing back
    /// the remainder of the reply.
    pub fn call(&self, code: u32, args: &Payload) -> Result<Payload> {
        let mut body = Payload::new();
        self.cmdloop.session().protocol().write_rpc_header(&mut body, &self.interface_name);
        body.write_bytes(args.bytes());

        let req = OutgoingRequest::new(self.handle, code, body.into_bytes());
        let (status, reply) = self.cmdloop.transact(req, true)?;
        if status != 0 {
            return Err(BinderError::RemoteCallFailed {
                status,
                message: "transaction status".to_string(),
            });
        }

        let reply_bytes = reply.map(|r| r.bytes().to_vec()).unwrap_or_default();
        let mut reply_payload = Payload::from_bytes(reply_bytes);
        let exception = reply_payload.read_u32().unwrap_or(0);
        if exception != 0 {
            let tag = reply_payload.read_str16().unwrap_or_default();
            let sub_code = reply_payload.read_u32().unwrap_or(0);
            let message = reply_payload.read_str16().unwrap_or_default();
            return Err(BinderError::RemoteCallFailed {
                status: exception as i32,
                message: format!("{tag} #{sub_code}: {message}"),
            });
        }
        Ok(reply_payload)
    }
}

/// The `LocalObject` backing a published service: answers the interface
/// query itself and forwards every other in-range code to the delegate.
struct HostedService<BS: BinderService> {
    interface_name: String,
    delegate: Arc<BS>,
}

impl<BS: BinderService> LocalObject for HostedService<BS> {
    fn interface_name(&self) -> &str {
        &self.interface_name
    }

    fn can_handle_transaction(&self, _iface: &str, code: u32) -> TransactionSupport {
        if code == INTERFACE_TRANSACTION || (FIRST_CALL_TRANSACTION..=LAST_CALL_TRANSACTION).contains(&code) {
            TransactionSupport::Looper
        } else {
            TransactionSupport::None
        }
    }

    fn handle_looper_transaction(&self, req: &IncomingRequest) -> Result<(Option<OutgoingReply>, i32)> {
        if req.code == INTERFACE_TRANSACTION {
            let mut reply = Payload::new();
            reply.write_u32(0);
            reply.write_str16(&self.interface_name);
            return Ok((Some(OutgoingReply::from_bytes(reply.into_bytes())), 0));
        }

        let mut incoming = Payload::from_bytes(req.payload_bytes().to_vec());
        // Strip the header write_rpc_header wrote on the caller's side:
        // strict-mode policy, work-source uid, header marker, interface name.
        let _ = incoming.read_i32();
        let _ = incoming.read_i32();
        let _ = incoming.read_i32();
        let _ = incoming.read_str16();

        let reply = self.delegate.process_request(req.code, &mut incoming);
        Ok((Some(OutgoingReply::from_bytes(reply.into_bytes())), 0))
    }
}

struct HostedServiceRegistry<BS: BinderService> {
    entry: Arc<HostedService<BS>>,
}

impl<BS: BinderService> ObjectRegistry for HostedServiceRegistry<BS> {
    fn get_local(&self, cookie: u64) -> Option<Arc<dyn LocalObject>> {
        if cookie == HOSTED_SERVICE_COOKIE {
            Some(self.entry.clone() as Arc<dyn LocalObject>)
        } else {
            None
        }
    }

    fn get_remote(&self, _handle: u32) -> Option<Arc<dyn RemoteObject>> {
        None
    }
}

/// Registry for the outgoing-only `CommandLoop` a `ServiceManager` uses for
/// its own `getService`/`addService` calls: it hosts nothing, so any inbound
/// dispatch here would mean the driver sent a transaction for an object we
/// never registered.
struct NoHostedObjects;

impl ObjectRegistry for NoHostedObjects {
    fn get_local(&self, _cookie: u64) -> Option<Arc<dyn LocalObject>> {
        None
    }
    fn get_remote(&self, _handle: u32) -> Option<Arc<dyn RemoteObject>> {
        None
    }
}

struct UnreachableHandler;

impl Handler for UnreachableHandler {
    fn transact(&self, _obj: &dyn LocalObject, _req: &IncomingRequest) -> Result<(Option<OutgoingReply>, i32)> {
        Ok((None, 0))
    }
}

/// A running published service. `run` pumps the passive read loop,
/// dispatching calls into the delegate supplied to
/// [`ServiceManager::register_service`].
pub struct PublishedService<BS: BinderService> {
    cmdloop: CommandLoop,
    _entry: Arc<HostedService<BS>>,
}

impl<BS: BinderService> PublishedService<BS> {
    pub fn run(&self) -> Result<()> {
        self.cmdloop.read()
    }
}

/// A handle to the system's service manager.
pub struct ServiceManager {
    session: SessionHandle,
    client_loop: Arc<CommandLoop>,
}

impl ServiceManager {
    /// Open a connection to the service manager over `session` and confirm
    /// it is alive with a ping.
    pub fn new(session: SessionHandle) -> Result<Self> {
        let client_loop = Arc::new(CommandLoop::new(
            session.clone(),
            Arc::new(NoHostedObjects),
            Arc::new(UnreachableHandler),
        ));
        let manager = Self { session, client_loop };
        manager.ping()?;
        Ok(manager)
    }

    fn ping(&self) -> Result<()> {
        let req = OutgoingRequest::new(SERVICE_MANAGER_HANDLE, PING_TRANSACTION, Vec::new());
        self.client_loop.transact(req, true)?;
        Ok(())
    }

    /// Look up `service_name`, acquiring a strong reference to the returned
    /// handle so it survives for the life of the [`ServiceProxy`].
    pub fn get_service(&self, service_name: &str, interface_name: &str) -> Result<ServiceProxy> {
        let mut payload = Payload::new();
        self.session.protocol().write_rpc_header(&mut payload, SERVICE_MANAGER_INTERFACE);
        payload.write_str16(service_name);

        let req = OutgoingRequest::new(
            SERVICE_MANAGER_HANDLE,
            ServiceManagerFunction::GetService as u32,
            payload.into_bytes(),
        );
        let (status, reply) = self.client_loop.transact(req, true)?;
        if status != 0 {
            return Err(BinderError::RemoteCallFailed {
                status,
                message: format!("getService({service_name})"),
            });
        }
        let reply = reply.ok_or(BinderError::BadMessage)?;
        let mut reply_payload = Payload::from_bytes(reply.bytes().to_vec());
        let _exception = reply_payload.read_u32()?;

        let flat_size = self.session.abi().flat_object_size();
        let flat_bytes = reply_payload.read_bytes(flat_size)?;
        let (binder_type, handle, _cookie) =
            decode_flat_binder(self.session.abi(), &flat_bytes).ok_or(BinderError::BadMessage)?;
        if binder_type != BinderType::Handle {
            return Err(BinderError::BadMessage);
        }
        let handle = handle as u32;

        self.client_loop.acquire(handle as i32)?;
        Ok(ServiceProxy {
            cmdloop: self.client_loop.clone(),
            handle,
            interface_name: interface_name.to_string(),
        })
    }

    /// Publish `delegate` under `name`/`interface_name` and enter looper
    /// mode on a fresh `CommandLoop` dedicated to serving it.
    pub fn register_service<BS>(
        &self,
        name: &str,
        interface_name: &str,
        delegate: Arc<BS>,
    ) -> Result<PublishedService<BS>>
    where
        BS: BinderService + 'static,
    {
        let entry = Arc::new(HostedService {
            interface_name: interface_name.to_string(),
            delegate,
        });
        let registry = Arc::new(HostedServiceRegistry { entry: entry.clone() });
        let cmdloop = CommandLoop::new(self.session.clone(), registry, Arc::new(UnreachableHandler));
        cmdloop.enter_looper()?;

        let mut payload = Payload::new();
        self.session.protocol().write_rpc_header(&mut payload, SERVICE_MANAGER_INTERFACE);
        payload.write_str16(name);
        payload.mark_object_offset();
        let flat = encode_flat_binder(self.session.abi(), BinderType::Binder, HOSTED_SERVICE_COOKIE, HOSTED_SERVICE_COOKIE);
        payload.write_bytes(&flat);
        payload.write_i32(0); // allow_isolated: false
        payload.write_u32(0); // dump priority: default

        let offsets = payload.offsets().to_vec();
        let mut req = OutgoingRequest::new(
            SERVICE_MANAGER_HANDLE,
            ServiceManagerFunction::AddService as u32,
            payload.into_bytes(),
        );
        req.offsets = offsets;

        let (status, _reply) = self.client_loop.transact(req, true)?;
        if status != 0 {
            return Err(BinderError::RemoteCallFailed {
                status,
                message: format!("addService({name})"),
            });
        }

        Ok(PublishedService { cmdloop, _entry: entry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ABI_64;
    use crate::device::mock::{MockDevice, MockStep};
    use std::sync::Mutex;

    fn br_frame(opcode: u32, body: &[u8]) -> Vec<u8> {
        let mut out = opcode.to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn empty_transaction_data() -> Vec<u8> {
        let mut b = Vec::new();
        for _ in 0..6 {
            b.extend_from_slice(&0u32.to_le_bytes());
        }
        for _ in 0..4 {
            b.extend_from_slice(&0u64.to_le_bytes());
        }
        b
    }

    /// A `BR_REPLY` whose arena payload is `data`, fabricated on the heap
    /// standing in for the arena (the mock Session never maps real memory).
    fn reply_frame_with_payload(data: &[u8]) -> Vec<u8> {
        let ptr = data.as_ptr() as u64;
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // target
        body.extend_from_slice(&0u64.to_le_bytes()); // cookie
        body.extend_from_slice(&0u32.to_le_bytes()); // code
        body.extend_from_slice(&0u32.to_le_bytes()); // flags
        body.extend_from_slice(&0u32.to_le_bytes()); // sender_pid
        body.extend_from_slice(&0u32.to_le_bytes()); // sender_euid
        body.extend_from_slice(&(data.len() as u64).to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes()); // offsets_size
        body.extend_from_slice(&ptr.to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes()); // offsets_ptr
        br_frame(ABI_64.br_reply(), &body)
    }

    #[test]
    fn new_pings_service_manager_once() {
        let mut script = br_frame(ABI_64.br_transaction_complete(), &[]);
        script.extend(br_frame(ABI_64.br_reply(), &empty_transaction_data()));
        let device = MockDevice::new(ABI_64, vec![MockStep::Deliver(script)]);
        let session = SessionHandle::from_raw_device(&ABI_64, device);
        ServiceManager::new(session).unwrap();
    }

    #[test]
    fn get_service_decodes_handle_and_acquires_it() {
        let mut reply_body = Vec::new();
        reply_body.extend_from_slice(&0u32.to_le_bytes()); // no exception
        reply_body.extend_from_slice(&encode_flat_binder(&ABI_64, BinderType::Handle, 5, 0));

        let mut script = br_frame(ABI_64.br_transaction_complete(), &[]);
        script.extend(reply_frame_with_payload(&reply_body));
        script.extend(br_frame(ABI_64.br_transaction_complete(), &[])); // for the acquire() call

        let device = MockDevice::new(ABI_64, vec![MockStep::Deliver(script)]);
        let session = SessionHandle::from_raw_device(&ABI_64, device);
        let client_loop = Arc::new(CommandLoop::new(
            session.clone(),
            Arc::new(NoHostedObjects),
            Arc::new(UnreachableHandler),
        ));
        let manager = ServiceManager { session, client_loop };

        let proxy = manager.get_service("media.audio", "IAudioService").unwrap();
        assert_eq!(proxy.handle, 5);
    }

    #[test]
    fn hosted_service_answers_interface_query_without_delegate() {
        struct Echo;
        impl BinderService for Echo {
            fn process_request(&self, _code: u32, _data: &mut Payload) -> Payload {
                Payload::new()
            }
        }

        let entry = HostedService {
            interface_name: "IEcho".to_string(),
            delegate: Arc::new(Echo),
        };
        let req = IncomingRequest::new(1, 1, INTERFACE_TRANSACTION, 0, None);
        let (reply, status) = entry.handle_looper_transaction(&req).unwrap();
        assert_eq!(status, 0);
        let mut body = Payload::from_bytes(reply.unwrap().payload);
        assert_eq!(body.read_u32().unwrap(), 0);
        assert_eq!(body.read_str16().unwrap(), "IEcho");
    }

    #[test]
    fn hosted_service_forwards_call_codes_to_delegate() {
        struct Counter(Mutex<u32>);
        impl BinderService for Counter {
            fn process_request(&self, code: u32, _data: &mut Payload) -> Payload {
                *self.0.lock().unwrap() += 1;
                let mut reply = Payload::new();
                reply.write_u32(0);
                reply.write_u32(code);
                reply
            }
        }

        let delegate = Arc::new(Counter(Mutex::new(0)));
        let entry = HostedService {
            interface_name: "ICounter".to_string(),
            delegate: delegate.clone(),
        };

        assert_eq!(entry.can_handle_transaction("ICounter", FIRST_CALL_TRANSACTION), TransactionSupport::Looper);

        let req = IncomingRequest::new(1, 1, FIRST_CALL_TRANSACTION, 0, None);
        let (reply, status) = entry.handle_looper_transaction(&req).unwrap();
        assert_eq!(status, 0);
        assert_eq!(*delegate.0.lock().unwrap(), 1);
        let mut body = Payload::from_bytes(reply.unwrap().payload);
        assert_eq!(body.read_u32().unwrap(), 0);
        assert_eq!(body.read_u32().unwrap(), FIRST_CALL_TRANSACTION);
    }
}
