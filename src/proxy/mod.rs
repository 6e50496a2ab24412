//! Proxy device: the orchestrator-side stand-in for a device whose real
//! implementation runs in a remote process.
//!
//! Lifecycle:
//!
//! ```text
//! Unattached -> Attaching -> Attached -> Active -> Detaching -> Detached
//! ```
//!
//! Attaching creates the Link, fetches identity and configuration space, and
//! sizes the windows. Activating hands the interrupt objects to the remote
//! and sends the first memory snapshot, after which the device is visible on
//! the bus. Configuration and window accesses are forwarded as calls.
//!
//! Configuration space is kept as an optimistic local shadow: local writes
//! land in the shadow before the remote has applied them, and reads through
//! [`ProxyDevice::config_read`] refresh it from the remote. The remote is
//! authoritative; the shadow may briefly disagree with it.
//!
//! A fatal channel error makes the device unavailable. Every later access
//! returns all-ones, and if the device was active the machine is asked to
//! shut down.

mod registry;

pub use registry::ProxyRegistry;

use std::fmt;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use devproxy_protocol::{
    all_ones, fd_is_open, is_valid_access_size, ConfigAccess, DeviceIdentity, Message, Payload,
    WindowAccess,
};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::call::{call_unlocked, ret_value};
use crate::channel::Channel;
use crate::config::{ProxyConfig, Transport, MAX_WINDOWS};
use crate::irq::{intx_route, IrqObjects};
use crate::link::Link;
use crate::machine::memory::{ListenerId, MemoryListener, RegionInfo};
use crate::machine::{MachineContext, ShutdownHandle};
use crate::memory_sync::MemorySync;
use crate::regs;
use crate::{Error, Result};

/// Lifecycle state of a proxy device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Unattached,
    Attaching,
    Attached,
    Active,
    Detaching,
    Detached,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyState::Unattached => "unattached",
            ProxyState::Attaching => "attaching",
            ProxyState::Attached => "attached",
            ProxyState::Active => "active",
            ProxyState::Detaching => "detaching",
            ProxyState::Detached => "detached",
        };
        f.write_str(s)
    }
}

/// What window probing found behind one base address register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowInfo {
    pub present: bool,
    pub is_memory: bool,
    pub size: u64,
}

impl WindowInfo {
    /// Decode the value read back after writing all-ones to a BAR.
    pub fn from_bar_mask(mask: u32) -> Self {
        if mask == 0 {
            return Self::default();
        }
        let is_memory = mask & regs::BAR_IO == 0;
        let addr_bits = if is_memory { mask & !0xf } else { mask & !0x3 };
        let size = (!addr_bits).wrapping_add(1) as u64;
        if size == 0 {
            return Self::default();
        }
        Self {
            present: true,
            is_memory,
            size,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowSlot {
    info: WindowInfo,
    base: Option<u64>,
}

/// Shared record of whether the device can still reach its remote.
struct Liveness {
    id: String,
    lost: AtomicBool,
    active: AtomicBool,
    shutdown: ShutdownHandle,
}

impl Liveness {
    /// Record `err`. A fatal error makes the device unavailable for good.
    fn fail(&self, err: Error) -> Error {
        if err.is_fatal() && !self.lost.swap(true, Ordering::SeqCst) {
            error!(device = %self.id, "device unavailable: {}", err);
            if self.active.load(Ordering::SeqCst) {
                self.shutdown
                    .request(format!("proxy device '{}' lost its remote: {}", self.id, err));
            }
        }
        err
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

/// Memory Sync listener whose fatal errors take the device down. Once the
/// device is lost it ignores further changes until detach unregisters it.
struct DeviceMemorySync {
    sync: MemorySync,
    liveness: Arc<Liveness>,
}

impl DeviceMemorySync {
    fn deliver(&self, notify: impl FnOnce(&MemorySync) -> Result<()>) -> Result<()> {
        if self.liveness.is_lost() {
            return Ok(());
        }
        notify(&self.sync).map_err(|e| self.liveness.fail(e))
    }
}

impl MemoryListener for DeviceMemorySync {
    fn region_added(&self, region: &RegionInfo, current: &[RegionInfo]) -> Result<()> {
        self.deliver(|sync| sync.region_added(region, current))
    }

    fn region_removed(&self, region: &RegionInfo, current: &[RegionInfo]) -> Result<()> {
        self.deliver(|sync| sync.region_removed(region, current))
    }

    fn replay(&self, regions: &[RegionInfo]) -> Result<()> {
        self.deliver(|sync| sync.replay(regions))
    }
}

pub struct ProxyDevice {
    config: ProxyConfig,
    ctx: MachineContext,
    state: Mutex<ProxyState>,
    liveness: Arc<Liveness>,
    link: Mutex<Option<Arc<Link>>>,
    channel: Mutex<Option<Arc<Channel>>>,
    identity: Mutex<Option<DeviceIdentity>>,
    shadow: Mutex<Vec<u8>>,
    windows: Mutex<Vec<WindowSlot>>,
    irq: Mutex<Option<IrqObjects>>,
    memory_listener: Mutex<Option<ListenerId>>,
    blocked: AtomicBool,
}

impl fmt::Debug for ProxyDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDevice")
            .field("id", &self.config.id)
            .field("transport", &self.config.transport)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl ProxyDevice {
    pub fn new(config: ProxyConfig, ctx: MachineContext) -> Result<Arc<Self>> {
        config.validate()?;
        let liveness = Arc::new(Liveness {
            id: config.id.clone(),
            lost: AtomicBool::new(false),
            active: AtomicBool::new(false),
            shutdown: ctx.shutdown.clone(),
        });
        Ok(Arc::new(Self {
            config,
            ctx,
            state: Mutex::new(ProxyState::Unattached),
            liveness,
            link: Mutex::new(None),
            channel: Mutex::new(None),
            identity: Mutex::new(None),
            shadow: Mutex::new(Vec::new()),
            windows: Mutex::new(Vec::new()),
            irq: Mutex::new(None),
            memory_listener: Mutex::new(None),
            blocked: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    /// False once the channel to the remote has failed.
    pub fn is_available(&self) -> bool {
        !self.liveness.is_lost()
    }

    /// Identity fetched at attach time.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        *self.identity.lock()
    }

    /// Probed window descriptors, indexed by BAR number.
    pub fn windows(&self) -> Vec<WindowInfo> {
        self.windows.lock().iter().map(|w| w.info).collect()
    }

    /// Process id of the remote, when this device spawned it.
    pub fn remote_pid(&self) -> Option<u32> {
        self.link.lock().as_ref().and_then(|link| link.remote_pid())
    }

    fn blocker_name(&self) -> String {
        format!("devproxy:{}", self.config.id)
    }

    fn set_state(&self, next: ProxyState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if prev != next {
            info!(device = %self.config.id, "{} -> {}", prev, next);
        }
    }

    fn expect_state(&self, operation: &'static str, expected: ProxyState) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(Error::InvalidState {
                operation,
                state: state.to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Connect to the remote and learn what it is. On failure every
    /// resource acquired so far is released and the device is detached.
    pub fn attach(&self) -> Result<()> {
        self.expect_state("attach", ProxyState::Unattached)?;
        self.set_state(ProxyState::Attaching);

        match self.connect_and_probe() {
            Ok(()) => {
                self.set_state(ProxyState::Attached);
                Ok(())
            }
            Err(e) => {
                error!(device = %self.config.id, "attach failed: {}", e);
                if let Err(release_err) = self.release() {
                    warn!(device = %self.config.id, "cleanup after failed attach: {}", release_err);
                }
                self.set_state(ProxyState::Detached);
                Err(e)
            }
        }
    }

    fn connect_and_probe(&self) -> Result<()> {
        let link_name = format!("proxy-{}", self.config.id);
        let link = match &self.config.transport {
            Transport::Fd(raw) => {
                if !fd_is_open(*raw) {
                    return Err(Error::Config(format!("transport fd {} is not open", raw)));
                }
                let link = Link::create(link_name, self.config.link)?;
                // SAFETY: the fd property hands ownership of an open,
                // otherwise unused descriptor to this device.
                let fd = unsafe { OwnedFd::from_raw_fd(*raw) };
                link.attach_channel(fd)?;
                link
            }
            Transport::Spawn { program, args } => {
                Link::spawn_remote(link_name, program, args, self.config.link)?
            }
        };
        let channel = link.control()?;
        *self.link.lock() = Some(link);
        *self.channel.lock() = Some(channel.clone());

        let identity = channel.call_identity().map_err(|e| self.liveness.fail(e))?;
        let config = channel.call_config_snapshot().map_err(|e| self.liveness.fail(e))?;
        if config.len() != 256 && config.len() != 4096 {
            return Err(Error::Device(format!(
                "remote configuration space is {} bytes",
                config.len()
            )));
        }
        info!(
            device = %self.config.id,
            "remote is {:04x}:{:04x} class {:04x}",
            identity.vendor_id,
            identity.device_id,
            identity.class_code
        );
        *self.identity.lock() = Some(identity);
        *self.shadow.lock() = config;

        self.probe_windows()?;

        self.ctx.blockers.add(&self.blocker_name())?;
        self.blocked.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn probe_windows(&self) -> Result<()> {
        let mut slots = Vec::with_capacity(MAX_WINDOWS);
        for index in 0..MAX_WINDOWS {
            let bar = regs::bar(index);
            let saved = self.config_call(bar, 4, None)?;
            self.config_call(bar, 4, Some(0xffff_ffff))?;
            let mask = self.config_call(bar, 4, None)? as u32;
            self.config_call(bar, 4, Some(saved))?;

            let info = WindowInfo::from_bar_mask(mask);
            if info.present {
                debug!(
                    device = %self.config.id,
                    index,
                    size = info.size,
                    memory = info.is_memory,
                    "window"
                );
            }
            slots.push(WindowSlot { info, base: None });
        }
        *self.windows.lock() = slots;
        Ok(())
    }

    /// Bind interrupts and memory, then expose the device to the guest.
    pub fn activate(&self) -> Result<()> {
        self.expect_state("activate", ProxyState::Attached)?;
        let channel = self.channel()?;

        let pin = self.shadow_read(regs::INTERRUPT_PIN, 1) as u8;
        match intx_route(self.config.slot, pin, self.ctx.intx_base_gsi) {
            Some(gsi) => {
                let objects = IrqObjects::new(gsi, pin as i32 - 1)?;
                self.ctx.irqchip.register_irqfd(&objects)?;
                let request = objects.to_message()?;
                *self.irq.lock() = Some(objects);

                let ack = channel.call_ret(request).map_err(|e| self.liveness.fail(e))?;
                if ack != 0 {
                    return Err(Error::Device(format!(
                        "remote refused interrupt objects ({:#x})",
                        ack
                    )));
                }
                self.config_call(regs::INTERRUPT_LINE, 1, Some(gsi as u64 & 0xff))?;
                debug!(device = %self.config.id, gsi, pin, "interrupt fast path bound");
            }
            None => debug!(device = %self.config.id, "device has no interrupt pin"),
        }

        let listener = Arc::new(DeviceMemorySync {
            sync: MemorySync::new(channel),
            liveness: self.liveness.clone(),
        });
        let id = self.ctx.address_space.register_listener(listener)?;
        *self.memory_listener.lock() = Some(id);

        self.liveness.active.store(true, Ordering::SeqCst);
        self.set_state(ProxyState::Active);
        Ok(())
    }

    /// Tear the device down. Safe to call in any state; later calls are
    /// no-ops.
    pub fn detach(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ProxyState::Detaching | ProxyState::Detached => return Ok(()),
                ProxyState::Unattached => {
                    *state = ProxyState::Detached;
                    return Ok(());
                }
                _ => {}
            }
        }
        self.set_state(ProxyState::Detaching);
        self.liveness.active.store(false, Ordering::SeqCst);
        let result = self.release();
        self.set_state(ProxyState::Detached);
        result
    }

    /// Release the memory listener, interrupt objects, Link and migration
    /// blocker. Every step runs; the first error is returned.
    fn release(&self) -> Result<()> {
        let mut first_err = None;

        if let Some(id) = self.memory_listener.lock().take() {
            self.ctx.address_space.unregister_listener(id);
        }
        if let Some(objects) = self.irq.lock().take() {
            if let Err(e) = self.ctx.irqchip.unregister_irqfd(&objects) {
                warn!(device = %self.config.id, "failed to unbind interrupt: {}", e);
                first_err.get_or_insert(e);
            }
        }
        self.channel.lock().take();
        if let Some(link) = self.link.lock().take() {
            link.destroy();
        }
        if self.blocked.swap(false, Ordering::SeqCst) {
            self.ctx.blockers.remove(&self.blocker_name());
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Forwarding
    // -----------------------------------------------------------------------

    fn channel(&self) -> Result<Arc<Channel>> {
        if self.liveness.is_lost() {
            return Err(Error::ChannelBroken(format!("{}: remote unavailable", self.config.id)));
        }
        match self.state() {
            ProxyState::Attaching | ProxyState::Attached | ProxyState::Active => {}
            state => {
                return Err(Error::InvalidState {
                    operation: "forward",
                    state: state.to_string(),
                })
            }
        }
        self.channel
            .lock()
            .clone()
            .ok_or_else(|| Error::ChannelClosed(format!("{}: no channel", self.config.id)))
    }

    fn forward(&self, request: Message) -> Result<u64> {
        let channel = self.channel()?;
        channel.call_ret(request).map_err(|e| self.liveness.fail(e))
    }

    fn forward_unlocked(&self, bus: &mut MutexGuard<'_, ()>, request: Message) -> Result<u64> {
        let channel = self.channel()?;
        channel
            .fail(call_unlocked(bus, &channel, request).and_then(ret_value))
            .map_err(|e| self.liveness.fail(e))
    }

    /// One configuration access with the shadow kept in step. `write` of
    /// `None` is a read.
    fn config_call(&self, addr: u32, len: u32, write: Option<u64>) -> Result<u64> {
        let mut access = ConfigAccess {
            addr,
            val: 0,
            len: len as i32,
        };
        match write {
            Some(val) => {
                self.shadow_store(addr, len, val);
                access.val = val;
                let status = self.forward(Message::new(Payload::ConfigWrite(access)))?;
                if status != 0 {
                    debug!(device = %self.config.id, addr, len, "remote rejected config write");
                }
                Ok(status)
            }
            None => {
                let val = self.forward(Message::new(Payload::ConfigRead(access)))? & all_ones(len);
                self.shadow_store(addr, len, val);
                Ok(val)
            }
        }
    }

    /// Read `len` bytes of configuration space at `addr` from the remote.
    pub fn config_read(&self, addr: u32, len: u32) -> u64 {
        if !is_valid_access_size(len) {
            return all_ones(len);
        }
        self.config_call(addr, len, None).unwrap_or_else(|_| all_ones(len))
    }

    /// Write configuration space. The shadow is updated before the remote
    /// applies the write.
    pub fn config_write(&self, addr: u32, val: u64, len: u32) {
        if !is_valid_access_size(len) {
            return;
        }
        if let Err(e) = self.config_call(addr, len, Some(val & all_ones(len))) {
            debug!(device = %self.config.id, addr, "config write not forwarded: {}", e);
        }
    }

    /// Read the local configuration shadow without a round trip.
    pub fn shadow_read(&self, addr: u32, len: u32) -> u64 {
        if !is_valid_access_size(len) {
            return all_ones(len);
        }
        let shadow = self.shadow.lock();
        let start = addr as usize;
        let end = start + len as usize;
        if end > shadow.len() {
            return all_ones(len);
        }
        let mut buf = [0u8; 8];
        buf[..len as usize].copy_from_slice(&shadow[start..end]);
        u64::from_le_bytes(buf)
    }

    fn shadow_store(&self, addr: u32, len: u32, val: u64) {
        let mut shadow = self.shadow.lock();
        let start = addr as usize;
        let end = start + len as usize;
        if end <= shadow.len() {
            shadow[start..end].copy_from_slice(&val.to_le_bytes()[..len as usize]);
        }
    }

    /// Program window `index` at bus address `base` and enable decoding of
    /// its address space.
    pub fn assign_window(&self, index: usize, base: u64) -> Result<()> {
        let info = self
            .windows
            .lock()
            .get(index)
            .map(|slot| slot.info)
            .filter(|info| info.present)
            .ok_or_else(|| Error::Config(format!("{}: no window {}", self.config.id, index)))?;
        let fits = base
            .checked_add(info.size)
            .is_some_and(|end| end <= u32::MAX as u64 + 1);
        if base % info.size != 0 || !fits {
            return Err(Error::Config(format!(
                "{}: window {} cannot be placed at {:#x}",
                self.config.id, index, base
            )));
        }

        self.config_call(regs::bar(index), 4, Some(base))?;
        let enable = if info.is_memory {
            regs::COMMAND_MEMORY
        } else {
            regs::COMMAND_IO
        };
        let command = self.config_call(regs::COMMAND, 2, None)? as u16;
        self.config_call(regs::COMMAND, 2, Some((command | enable) as u64))?;

        if let Some(slot) = self.windows.lock().get_mut(index) {
            slot.base = Some(base);
        }
        debug!(device = %self.config.id, index, base, "window assigned");
        Ok(())
    }

    /// The window and offset that decode bus address `addr`, if the device
    /// is active and claims it.
    pub fn window_at(&self, addr: u64, memory: bool) -> Option<(usize, u64)> {
        if self.state() != ProxyState::Active {
            return None;
        }
        self.windows.lock().iter().enumerate().find_map(|(index, slot)| {
            let base = slot.base?;
            let hit = slot.info.present
                && slot.info.is_memory == memory
                && addr >= base
                && addr - base < slot.info.size;
            hit.then(|| (index, addr - base))
        })
    }

    fn window_request(&self, window: usize, offset: u64, size: u32, write: Option<u64>) -> Option<Message> {
        if !is_valid_access_size(size) {
            return None;
        }
        let slot = *self.windows.lock().get(window)?;
        let base = slot.base?;
        if !slot.info.present || offset.checked_add(size as u64)? > slot.info.size {
            return None;
        }
        let access = WindowAccess {
            addr: base + offset,
            val: write.unwrap_or(0) & all_ones(size),
            size,
            memory: slot.info.is_memory,
        };
        Some(Message::new(match write {
            Some(_) => Payload::WindowWrite(access),
            None => Payload::WindowRead(access),
        }))
    }

    /// Forward a window read.
    pub fn window_read(&self, window: usize, offset: u64, size: u32) -> u64 {
        match self.window_request(window, offset, size, None) {
            Some(request) => self
                .forward(request)
                .map(|val| val & all_ones(size))
                .unwrap_or_else(|_| all_ones(size)),
            None => all_ones(size),
        }
    }

    /// Forward a window write.
    pub fn window_write(&self, window: usize, offset: u64, size: u32, val: u64) {
        if let Some(request) = self.window_request(window, offset, size, Some(val)) {
            if let Err(e) = self.forward(request) {
                debug!(device = %self.config.id, window, offset, "window write not forwarded: {}", e);
            }
        }
    }

    /// [`ProxyDevice::window_read`] for a caller holding the machine's bus
    /// lock. The lock is released while the call is outstanding.
    pub fn window_read_locked(&self, bus: &mut MutexGuard<'_, ()>, window: usize, offset: u64, size: u32) -> u64 {
        match self.window_request(window, offset, size, None) {
            Some(request) => self
                .forward_unlocked(bus, request)
                .map(|val| val & all_ones(size))
                .unwrap_or_else(|_| all_ones(size)),
            None => all_ones(size),
        }
    }

    /// [`ProxyDevice::window_write`] for a caller holding the bus lock.
    pub fn window_write_locked(
        &self,
        bus: &mut MutexGuard<'_, ()>,
        window: usize,
        offset: u64,
        size: u32,
        val: u64,
    ) {
        if let Some(request) = self.window_request(window, offset, size, Some(val)) {
            if let Err(e) = self.forward_unlocked(bus, request) {
                debug!(device = %self.config.id, window, offset, "window write not forwarded: {}", e);
            }
        }
    }

    /// Reset the remote device and re-prime the shadow from it. Window
    /// placements are forgotten, as the reset clears them remotely.
    pub fn reset(&self) -> Result<()> {
        let status = self.forward(Message::new(Payload::DeviceReset))?;
        if status != 0 {
            return Err(Error::Device(format!("remote reset failed ({:#x})", status)));
        }
        let channel = self.channel()?;
        let config = channel.call_config_snapshot().map_err(|e| self.liveness.fail(e))?;
        *self.shadow.lock() = config;
        for slot in self.windows.lock().iter_mut() {
            slot.base = None;
        }
        info!(device = %self.config.id, "device reset");
        Ok(())
    }

    /// Liveness probe.
    pub fn ping(&self) -> Result<()> {
        match self.forward(Message::new(Payload::Ping))? {
            0 => Ok(()),
            other => Err(Error::Device(format!("unexpected ping reply {:#x}", other))),
        }
    }
}

impl Drop for ProxyDevice {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!(device = %self.config.id, "detach on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::SoftIrqChip;
    use crate::machine::memory::AddressSpace;
    use crate::machine::MigrationBlockers;

    fn context() -> MachineContext {
        MachineContext {
            address_space: Arc::new(AddressSpace::new()),
            irqchip: Arc::new(SoftIrqChip::new()),
            blockers: Arc::new(MigrationBlockers::new()),
            shutdown: ShutdownHandle::new(),
            intx_base_gsi: 16,
        }
    }

    #[test]
    fn test_bar_mask_decoding() {
        assert_eq!(WindowInfo::from_bar_mask(0), WindowInfo::default());
        assert_eq!(
            WindowInfo::from_bar_mask(0xffff_f000),
            WindowInfo {
                present: true,
                is_memory: true,
                size: 0x1000
            }
        );
        assert_eq!(
            WindowInfo::from_bar_mask(0xffff_ffe1),
            WindowInfo {
                present: true,
                is_memory: false,
                size: 0x20
            }
        );
    }

    #[test]
    fn test_unattached_device_reads_all_ones() {
        let device = ProxyDevice::new(ProxyConfig::new("idle", Transport::Fd(1000)), context()).unwrap();
        assert_eq!(device.state(), ProxyState::Unattached);
        assert_eq!(device.config_read(0, 4), 0xffff_ffff);
        assert_eq!(device.config_read(0, 3), 0xff_ffff);
        assert_eq!(device.window_read(0, 0, 2), 0xffff);
        assert!(device.window_at(0, true).is_none());
        assert!(device.ping().is_err());
    }

    #[test]
    fn test_attach_rejects_closed_fd() {
        let ctx = context();
        let device = ProxyDevice::new(ProxyConfig::new("bad", Transport::Fd(9999)), ctx.clone()).unwrap();
        assert!(matches!(device.attach(), Err(Error::Config(_))));
        assert_eq!(device.state(), ProxyState::Detached);
        assert!(!ctx.blockers.is_blocked());
        assert!(device.attach().is_err());
    }

    #[test]
    fn test_detach_is_idempotent() {
        let device = ProxyDevice::new(ProxyConfig::new("d", Transport::Fd(1000)), context()).unwrap();
        device.detach().unwrap();
        device.detach().unwrap();
        assert_eq!(device.state(), ProxyState::Detached);
    }
}
