//! devproxy: out-of-process device models for KVM virtual machines
//!
//! A device model can run in its own process while the guest sees an
//! ordinary bus device. The orchestrator keeps a [`ProxyDevice`] stand-in
//! that forwards configuration-space and window accesses to the remote
//! process over a Unix socket, keeps the remote mapping the same guest RAM
//! ([`memory_sync`]), and hands it interrupt event objects so it can raise
//! interrupts without going through the socket ([`irq`]).
//!
//! # Layers
//!
//! - [`devproxy_protocol`]: wire format and validation
//! - [`channel`]: one socket, blocking or cooperative framed I/O with fds
//! - [`call`]: request/reply pairing on a channel, with a uniform timeout
//! - [`link`]: channels, the event loop and the remote process
//! - [`proxy`] and [`machine`]: orchestrator side
//! - [`remote`]: remote-process side
//!
//! # Example: serving a device in-process
//!
//! ```no_run
//! use std::os::fd::{IntoRawFd, OwnedFd};
//! use std::os::unix::net::UnixStream;
//!
//! use devproxy::config::{DeviceSpec, ProxyConfig, Transport};
//! use devproxy::link::Link;
//! use devproxy::machine::Machine;
//! use devproxy::remote::{RemoteDispatcher, ScratchDevice};
//!
//! fn main() -> devproxy::Result<()> {
//!     let (ours, theirs) = UnixStream::pair()?;
//!
//!     let spec = DeviceSpec::scratch(0x1b36, 0x0010);
//!     let remote = Link::create("remote", spec.link_config())?;
//!     remote.attach_channel(OwnedFd::from(theirs))?;
//!     RemoteDispatcher::new(ScratchDevice::new(spec), remote.handle()).install(&remote);
//!     remote.spawn_event_loop()?;
//!
//!     let machine = Machine::new();
//!     let fd = OwnedFd::from(ours).into_raw_fd();
//!     let device = machine.add_proxy(ProxyConfig::new("scratch0", Transport::Fd(fd)))?;
//!     println!("{:?}", device.identity());
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod channel;
pub mod config;
pub mod error;
pub mod irq;
pub mod link;
pub mod machine;
pub mod memory_sync;
pub mod proxy;
pub mod regs;
pub mod remote;

// Re-exports for convenience
pub use channel::Channel;
pub use config::{DeviceSpec, LinkConfig, ProxyConfig, Transport};
pub use error::{Error, Result};
pub use link::{Dispatch, Link, LinkEvent};
pub use machine::Machine;
pub use proxy::{ProxyDevice, ProxyState, WindowInfo};

pub use devproxy_protocol;
