//! Orchestrator-side machine model
//!
//! This module contains the pieces of the virtual machine that proxy devices
//! plug into:
//! - Guest address space and RAM regions
//! - Host interrupt controller (KVM or software)
//! - Proxy device registry and MMIO dispatch
//! - Migration blockers and shutdown requests

pub mod kvm;
pub mod memory;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use devproxy_protocol::all_ones;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::irq::{InterruptController, SoftIrqChip};
use crate::proxy::{ProxyDevice, ProxyRegistry};
use crate::{Error, Result};

use self::memory::AddressSpace;

/// First GSI of the four INTx lines.
pub const INTX_BASE_GSI: u32 = 16;

/// Latched request for an orderly guest shutdown.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. The first reason sticks.
    pub fn request(&self, reason: impl Into<String>) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            let reason = reason.into();
            error!("guest shutdown requested: {}", reason);
            *self.reason.lock() = Some(reason);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// Named reasons the machine cannot be migrated right now.
#[derive(Debug, Default)]
pub struct MigrationBlockers {
    names: Mutex<BTreeSet<String>>,
}

impl MigrationBlockers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str) -> Result<()> {
        if !self.names.lock().insert(name.to_string()) {
            return Err(Error::Config(format!("migration blocker '{}' already set", name)));
        }
        info!("migration blocked: {}", name);
        Ok(())
    }

    pub fn remove(&self, name: &str) {
        if self.names.lock().remove(name) {
            info!("migration blocker removed: {}", name);
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.names.lock().is_empty()
    }

    pub fn list(&self) -> Vec<String> {
        self.names.lock().iter().cloned().collect()
    }
}

/// Machine services a proxy device uses over its lifetime.
#[derive(Clone)]
pub struct MachineContext {
    pub address_space: Arc<AddressSpace>,
    pub irqchip: Arc<dyn InterruptController>,
    pub blockers: Arc<MigrationBlockers>,
    pub shutdown: ShutdownHandle,
    pub intx_base_gsi: u32,
}

/// A virtual machine hosting proxy devices
pub struct Machine {
    ctx: MachineContext,
    registry: ProxyRegistry,
    /// Coarse lock held around device dispatch, released while a proxy
    /// waits on its remote.
    bus: Mutex<()>,
    vm: Option<Arc<kvm::Vm>>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// A machine with a software interrupt controller and no KVM.
    pub fn new() -> Self {
        Self::with_parts(Arc::new(SoftIrqChip::new()))
    }

    fn with_parts(irqchip: Arc<dyn InterruptController>) -> Self {
        Self {
            ctx: MachineContext {
                address_space: Arc::new(AddressSpace::new()),
                irqchip,
                blockers: Arc::new(MigrationBlockers::new()),
                shutdown: ShutdownHandle::new(),
                intx_base_gsi: INTX_BASE_GSI,
            },
            registry: ProxyRegistry::new(),
            bus: Mutex::new(()),
            vm: None,
        }
    }

    /// A machine backed by a KVM VM with an in-kernel irqchip. RAM regions
    /// become KVM memory slots and proxy interrupts become irqfds.
    pub fn with_kvm() -> Result<Self> {
        let vm = Arc::new(kvm::Vm::new()?);
        let mut machine = Self::with_parts(vm.clone());
        machine
            .ctx
            .address_space
            .register_listener(Arc::new(kvm::KvmMemorySlots::new(vm.clone())))?;
        machine.vm = Some(vm);
        Ok(machine)
    }

    pub fn vm(&self) -> Option<&Arc<kvm::Vm>> {
        self.vm.as_ref()
    }

    pub fn context(&self) -> &MachineContext {
        &self.ctx
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.ctx.address_space
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    pub fn blockers(&self) -> &MigrationBlockers {
        &self.ctx.blockers
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.ctx.shutdown.clone()
    }

    /// Create, attach and activate a proxy device, then register it.
    pub fn add_proxy(&self, config: ProxyConfig) -> Result<Arc<ProxyDevice>> {
        if self.registry.get(&config.id).is_some() {
            return Err(Error::Config(format!("proxy '{}' already exists", config.id)));
        }
        let device = ProxyDevice::new(config, self.ctx.clone())?;
        device.attach()?;
        if let Err(e) = device.activate() {
            if let Err(detach_err) = device.detach() {
                warn!(device = %device.id(), "detach after failed activation: {}", detach_err);
            }
            return Err(e);
        }
        self.registry.insert(device.clone())?;
        Ok(device)
    }

    /// Detach and unregister a proxy device.
    pub fn remove_proxy(&self, id: &str) -> Result<()> {
        let device = self
            .registry
            .remove(id)
            .ok_or_else(|| Error::Config(format!("no proxy '{}'", id)))?;
        device.detach()
    }

    /// Guest read from a device window at bus address `addr`.
    pub fn mmio_read(&self, addr: u64, size: u32, memory: bool) -> u64 {
        let mut bus = self.bus.lock();
        match self.registry.lookup_window(addr, memory) {
            Some((device, window, offset)) => device.window_read_locked(&mut bus, window, offset, size),
            None => all_ones(size),
        }
    }

    /// Guest write to a device window at bus address `addr`.
    pub fn mmio_write(&self, addr: u64, size: u32, memory: bool, val: u64) {
        let mut bus = self.bus.lock();
        if let Some((device, window, offset)) = self.registry.lookup_window(addr, memory) {
            device.window_write_locked(&mut bus, window, offset, size, val);
        }
    }

    /// Detach every proxy device.
    pub fn teardown(&self) {
        for device in self.registry.drain() {
            if let Err(e) = device.detach() {
                warn!(device = %device.id(), "detach failed: {}", e);
            }
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_first_reason_sticks() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_requested());
        handle.request("link lost");
        handle.clone().request("second");
        assert!(handle.is_requested());
        assert_eq!(handle.reason().as_deref(), Some("link lost"));
    }

    #[test]
    fn test_migration_blockers() {
        let blockers = MigrationBlockers::new();
        blockers.add("devproxy:nvme0").unwrap();
        assert!(blockers.add("devproxy:nvme0").is_err());
        assert!(blockers.is_blocked());
        blockers.remove("devproxy:nvme0");
        assert!(!blockers.is_blocked());
    }

    #[test]
    fn test_unclaimed_mmio_reads_all_ones() {
        let machine = Machine::new();
        assert_eq!(machine.mmio_read(0xfe00_0000, 4, true), 0xffff_ffff);
        machine.mmio_write(0xfe00_0000, 4, true, 1);
    }
}
