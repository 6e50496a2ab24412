//! Remote dispatcher: the remote-process end of a proxied device.
//!
//! Each validated request is executed against the device and guest memory
//! that live only in this process, and answered with exactly one reply.
//! Out-of-range or malformed accesses are answered with the all-ones
//! sentinel and the channel stays usable. A reply-type message, a message
//! that fails validation, or a hangup ends the dispatch loop.

pub mod device;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use devproxy_protocol::{
    is_valid_access_size, ConfigAccess, IrqSetup, Message, Payload, SyncEntry, WindowAccess,
    ALL_ONES,
};
use std::os::fd::OwnedFd;
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::irq::RemoteIrq;
use crate::link::{Dispatch, Link, LinkEvent};
use crate::memory_sync::{MemoryView, RemoteMemory};

pub use device::{RemoteDevice, ScratchDevice};

/// Dispatch loop state for one device.
pub struct RemoteDispatcher<D: RemoteDevice> {
    device: D,
    memory: RemoteMemory,
    irq: Option<Arc<RemoteIrq>>,
    handle: Handle,
    shutdown: Arc<AtomicBool>,
}

impl<D: RemoteDevice> RemoteDispatcher<D> {
    /// `handle` is the runtime the interrupt resample task runs on.
    pub fn new(mut device: D, handle: Handle) -> Self {
        let memory = RemoteMemory::new();
        device.set_memory(memory.view());
        Self {
            device,
            memory,
            irq: None,
            handle,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn memory_view(&self) -> MemoryView {
        self.memory.view()
    }

    /// Set once the dispatcher has given up on its peer.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Install this dispatcher as the Link's dispatch callback.
    pub fn install(self, link: &Link)
    where
        D: 'static,
    {
        let mut dispatcher = self;
        link.set_dispatch_callback(move |channel, event| dispatcher.handle_event(channel, event));
    }

    pub fn handle_event(&mut self, channel: &Channel, event: LinkEvent) -> Dispatch {
        match event {
            LinkEvent::Message(msg) => self.handle_message(msg),
            LinkEvent::Hangup(e) => {
                if e.is_fatal() && !matches!(e, crate::Error::ChannelClosed(_)) {
                    error!(channel = %channel.name(), "protocol failure, stopping: {}", e);
                } else {
                    info!(channel = %channel.name(), "peer went away: {}", e);
                }
                self.request_shutdown()
            }
        }
    }

    /// Execute one request and produce its reply.
    pub fn handle_message(&mut self, msg: Message) -> Dispatch {
        let command = msg.command();
        trace!(?command, "dispatch");
        let reply = match msg.payload {
            Payload::ConfigRead(access) => Message::ret(self.config_read(access)),
            Payload::ConfigWrite(access) => Message::ret(self.config_write(access)),
            Payload::WindowRead(access) => Message::ret(self.window_read(access)),
            Payload::WindowWrite(access) => Message::ret(self.window_write(access)),
            Payload::SyncMemory(entries) => Message::ret(self.sync_memory(&entries, msg.fds)),
            Payload::SetIrqObjects(setup) => Message::ret(self.set_irq_objects(setup, msg.fds)),
            Payload::GetIdentity => Message::new(Payload::Identity(self.device.identity())),
            Payload::Ping => Message::ret(0),
            Payload::DeviceReset => {
                self.device.reset();
                Message::ret(0)
            }
            Payload::ConfigSnapshot => Message::new(Payload::ConfigSpace(self.device.config_bytes())),
            Payload::Ret(_) | Payload::Identity(_) | Payload::ConfigSpace(_) => {
                error!(?command, "reply received where a request was expected");
                return self.request_shutdown();
            }
        };
        Dispatch::Reply(reply)
    }

    fn request_shutdown(&mut self) -> Dispatch {
        self.shutdown.store(true, Ordering::SeqCst);
        Dispatch::Shutdown
    }

    fn config_range(&self, addr: u32, len: i32) -> Option<u32> {
        let len = u32::try_from(len).ok()?;
        if !is_valid_access_size(len) {
            return None;
        }
        let end = addr.checked_add(len)? as usize;
        (end <= self.device.config_size() && addr % len == 0).then_some(len)
    }

    fn config_read(&mut self, access: ConfigAccess) -> u64 {
        match self.config_range(access.addr, access.len) {
            Some(len) => self.device.config_read(access.addr, len),
            None => {
                debug!(addr = access.addr, len = access.len, "config read out of range");
                ALL_ONES
            }
        }
    }

    fn config_write(&mut self, access: ConfigAccess) -> u64 {
        match self.config_range(access.addr, access.len) {
            Some(len) => {
                self.device.config_write(access.addr, len, access.val);
                0
            }
            None => {
                debug!(addr = access.addr, len = access.len, "config write out of range");
                ALL_ONES
            }
        }
    }

    fn window_target(&self, access: &WindowAccess) -> Option<(usize, u64)> {
        if !is_valid_access_size(access.size) || access.addr % access.size as u64 != 0 {
            return None;
        }
        let (window, offset, size) = self.device.decode_window(access.addr, access.memory)?;
        (offset + access.size as u64 <= size).then_some((window, offset))
    }

    fn window_read(&mut self, access: WindowAccess) -> u64 {
        match self.window_target(&access) {
            Some((window, offset)) => self.device.window_read(window, offset, access.size),
            None => {
                debug!(addr = access.addr, size = access.size, "window read not decoded");
                ALL_ONES
            }
        }
    }

    fn window_write(&mut self, access: WindowAccess) -> u64 {
        match self.window_target(&access) {
            Some((window, offset)) => {
                self.device.window_write(window, offset, access.size, access.val);
                0
            }
            None => {
                debug!(addr = access.addr, size = access.size, "window write not decoded");
                ALL_ONES
            }
        }
    }

    fn sync_memory(&mut self, entries: &[SyncEntry], fds: Vec<OwnedFd>) -> u64 {
        match self.memory.apply_snapshot(entries, fds) {
            Ok(()) => 0,
            Err(e) => {
                warn!("memory snapshot rejected: {}", e);
                ALL_ONES
            }
        }
    }

    fn set_irq_objects(&mut self, setup: IrqSetup, fds: Vec<OwnedFd>) -> u64 {
        if self.irq.is_some() {
            warn!("interrupt objects already installed");
            return ALL_ONES;
        }
        match RemoteIrq::from_setup(setup, fds, &self.handle) {
            Ok(irq) => {
                let irq = Arc::new(irq);
                self.device.set_irq(irq.clone());
                self.irq = Some(irq);
                0
            }
            Err(e) => {
                warn!("failed to install interrupt objects: {}", e);
                ALL_ONES
            }
        }
    }
}
