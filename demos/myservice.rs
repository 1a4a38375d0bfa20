/// A service that echoes any string it receives. Requires root to run.
use std::sync::Arc;

use binder_engine::{BinderService, Payload, SessionConfig, SessionHandle, ServiceManager};

#[macro_use]
extern crate num_derive;
use num_traits::FromPrimitive;

#[repr(u32)]
#[derive(Debug, FromPrimitive)]
enum MyServiceCommand {
    Echo = 1,
}

struct MyService;

impl BinderService for MyService {
    fn process_request(&self, code: u32, data: &mut Payload) -> Payload {
        let mut reply = Payload::new();
        match MyServiceCommand::from_u32(code) {
            Some(MyServiceCommand::Echo) => {
                let text = data.read_str16().unwrap_or_default();
                log::info!("echo: {text}");
                reply.write_u32(0); // status
                reply.write_str16(&text);
            }
            None => {
                log::warn!("unknown command {code}");
                reply.write_u32(u32::MAX);
            }
        }
        reply
    }
}

fn main() {
    env_logger::init();

    let session = SessionHandle::open(SessionConfig::default()).expect("open /dev/binder");
    let service_manager = ServiceManager::new(session).expect("ping service manager");

    let published = service_manager
        .register_service("myservice", "com.example.IMyService", Arc::new(MyService))
        .expect("register myservice");

    published.run().expect("service loop");
}
