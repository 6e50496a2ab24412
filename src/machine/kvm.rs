//! KVM setup: the VM, its in-kernel irqchip, irqfd routing and memory slots

use std::collections::BTreeMap;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{Kvm, VmFd};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::memory::{MemoryListener, RegionInfo};
use crate::irq::{InterruptController, IrqObjects};
use crate::{Error, Result};

/// Represents a KVM virtual machine
pub struct Vm {
    /// KVM system handle
    kvm: Kvm,
    /// VM file descriptor
    vm_fd: VmFd,
}

impl Vm {
    /// Create a KVM VM with an in-kernel interrupt controller
    pub fn new() -> Result<Self> {
        // Open /dev/kvm
        let kvm = Kvm::new().map_err(Error::Kvm)?;
        debug!("KVM API version: {}", kvm.get_api_version());

        Self::check_extensions(&kvm)?;

        let vm_fd = kvm.create_vm().map_err(Error::Kvm)?;
        debug!("Created KVM VM");

        vm_fd.create_irq_chip().map_err(Error::Kvm)?;
        debug!("Created IRQ chip");

        #[cfg(target_arch = "x86_64")]
        {
            use kvm_bindings::{kvm_pit_config, KVM_PIT_SPEAKER_DUMMY};
            let pit_config = kvm_pit_config {
                flags: KVM_PIT_SPEAKER_DUMMY,
                ..Default::default()
            };
            vm_fd.create_pit2(pit_config).map_err(Error::Kvm)?;
            debug!("Created PIT");
        }

        Ok(Self { kvm, vm_fd })
    }

    /// Check that required KVM extensions are available
    fn check_extensions(kvm: &Kvm) -> Result<()> {
        use kvm_ioctls::Cap;

        let required_caps = [
            (Cap::Irqchip, "IRQCHIP"),
            (Cap::UserMemory, "USER_MEMORY"),
            (Cap::Irqfd, "IRQFD"),
        ];

        for (cap, name) in required_caps {
            if !kvm.check_extension(cap) {
                return Err(Error::Kvm(kvm_ioctls::Error::new(libc::ENOTSUP)));
            }
            debug!("KVM capability {} available", name);
        }

        Ok(())
    }

    /// Get reference to the KVM handle
    pub fn kvm(&self) -> &Kvm {
        &self.kvm
    }

    /// Get reference to the VM file descriptor
    pub fn vm_fd(&self) -> &VmFd {
        &self.vm_fd
    }
}

impl InterruptController for Vm {
    fn register_irqfd(&self, objects: &IrqObjects) -> Result<()> {
        self.vm_fd
            .register_irqfd_with_resample(&objects.trigger, &objects.resample, objects.gsi)
            .map_err(Error::Kvm)?;
        debug!("Registered irqfd for GSI {}", objects.gsi);
        Ok(())
    }

    fn unregister_irqfd(&self, objects: &IrqObjects) -> Result<()> {
        self.vm_fd
            .unregister_irqfd(&objects.trigger, objects.gsi)
            .map_err(Error::Kvm)?;
        debug!("Unregistered irqfd for GSI {}", objects.gsi);
        Ok(())
    }
}

#[derive(Default)]
struct Slots {
    by_addr: BTreeMap<u64, u32>,
    free: Vec<u32>,
    next: u32,
}

/// Memory listener that mirrors RAM regions into KVM memory slots.
pub struct KvmMemorySlots {
    vm: Arc<Vm>,
    slots: Mutex<Slots>,
}

impl KvmMemorySlots {
    pub fn new(vm: Arc<Vm>) -> Self {
        Self {
            vm,
            slots: Mutex::new(Slots::default()),
        }
    }

    fn set_region(&self, slot: u32, region: &RegionInfo, memory_size: u64) -> Result<()> {
        let memory_region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: region.guest_addr,
            memory_size,
            userspace_addr: region.host_addr,
            flags: 0,
        };

        // SAFETY: the mapping at `host_addr` is owned by the address space
        // and outlives the slot; removal clears the slot before unmapping.
        unsafe {
            self.vm
                .vm_fd
                .set_user_memory_region(memory_region)
                .map_err(Error::Kvm)?;
        }
        Ok(())
    }
}

impl MemoryListener for KvmMemorySlots {
    fn region_added(&self, region: &RegionInfo, _current: &[RegionInfo]) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = match slots.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = slots.next;
                slots.next += 1;
                slot
            }
        };
        if let Err(e) = self.set_region(slot, region, region.size) {
            slots.free.push(slot);
            return Err(e);
        }
        slots.by_addr.insert(region.guest_addr, slot);
        debug!(
            "Registered memory region {}: addr={:#x}, size={:#x}",
            slot, region.guest_addr, region.size
        );
        Ok(())
    }

    fn region_removed(&self, region: &RegionInfo, _current: &[RegionInfo]) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .by_addr
            .remove(&region.guest_addr)
            .ok_or_else(|| Error::Memory(format!("no KVM slot for {:#x}", region.guest_addr)))?;
        self.set_region(slot, region, 0)?;
        slots.free.push(slot);
        debug!("Released memory slot {} at {:#x}", slot, region.guest_addr);
        Ok(())
    }
}
