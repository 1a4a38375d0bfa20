/// Looks up "myservice" through the service manager and calls its echo
/// command. Requires root and a registered `myservice` (see myservice.rs)
/// to get a non-error reply.
use binder_engine::{Payload, SessionConfig, SessionHandle, ServiceManager};

fn main() {
    env_logger::init();

    let session = SessionHandle::open(SessionConfig::default()).expect("open /dev/binder");
    let service_manager = ServiceManager::new(session).expect("ping service manager");

    let myservice = service_manager
        .get_service("myservice", "com.example.IMyService")
        .expect("get myservice");

    let mut args = Payload::new();
    args.write_str16("Hello World");
    let mut reply = myservice.call(1, &args).expect("echo call");
    println!("response: {:?}", reply.read_str16());
}
