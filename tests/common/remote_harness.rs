//! In-process remote: a dispatcher served on its own Link event loop,
//! reachable through the returned socket descriptor.

use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use devproxy::memory_sync::MemoryView;
use devproxy::remote::{RemoteDevice, RemoteDispatcher};
use devproxy::{Link, LinkConfig};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Served {
    pub link: Arc<Link>,
    pub memory: MemoryView,
    /// Orchestrator end, ready to be handed over as `Transport::Fd`.
    pub fd: RawFd,
}

pub fn serve<D: RemoteDevice + 'static>(device: D) -> Served {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let link = Link::create("test-remote", LinkConfig::new().call_timeout(TEST_TIMEOUT)).unwrap();
    link.attach_channel(OwnedFd::from(theirs)).unwrap();

    let dispatcher = RemoteDispatcher::new(device, link.handle());
    let memory = dispatcher.memory_view();
    dispatcher.install(&link);
    link.spawn_event_loop().unwrap();

    Served {
        link,
        memory,
        fd: OwnedFd::from(ours).into_raw_fd(),
    }
}
