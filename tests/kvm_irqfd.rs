//! Proxy devices on a KVM-backed machine: RAM becomes memory slots and the
//! interrupt objects become irqfds in the in-kernel irqchip.
//!
//! Run with: cargo test --test kvm_irqfd -- --ignored

#![cfg(target_os = "linux")]

#[path = "common/remote_harness.rs"]
mod remote_harness;
#[path = "common/vm_preflight.rs"]
mod vm_preflight;

use devproxy::config::DeviceSpec;
use devproxy::irq::{InterruptController, IrqObjects};
use devproxy::regs;
use devproxy::remote::ScratchDevice;
use devproxy::{LinkConfig, Machine, ProxyConfig, ProxyState, Transport};
use remote_harness::{serve, TEST_TIMEOUT};

const MIB: u64 = 1 << 20;

fn kvm_machine() -> Option<Machine> {
    if let Err(e) = vm_preflight::require_kvm_usable() {
        eprintln!("skipping: {}", e);
        return None;
    }
    Some(Machine::with_kvm().expect("Failed to create KVM machine"))
}

fn proxy(id: &str, fd: i32, slot: u8) -> ProxyConfig {
    ProxyConfig::new(id, Transport::Fd(fd))
        .slot(slot)
        .link(LinkConfig::new().call_timeout(TEST_TIMEOUT))
}

fn spec() -> DeviceSpec {
    let mut spec = DeviceSpec::scratch(0x1b36, 0x0005);
    spec.call_timeout = TEST_TIMEOUT;
    spec
}

#[test]
#[ignore] // Requires KVM
fn test_kvm_machine_tracks_ram() {
    let Some(machine) = kvm_machine() else { return };
    let space = machine.address_space();

    space.add_ram(0, 16 * MIB).unwrap();
    space.add_ram(0x1_0000_0000, 2 * MIB).unwrap();
    space.remove_region(0).unwrap();
    // The freed slot is reused.
    space.add_ram(0x2000_0000, MIB).unwrap();
    assert_eq!(space.regions().len(), 2);
}

#[test]
#[ignore] // Requires KVM
fn test_proxy_irqfd_bound_and_released() {
    let Some(machine) = kvm_machine() else { return };
    machine.address_space().add_ram(0, 16 * MIB).unwrap();

    let served = serve(ScratchDevice::new(spec()));
    let device = machine.add_proxy(proxy("kvm0", served.fd, 0)).unwrap();
    assert_eq!(device.state(), ProxyState::Active);
    assert_eq!(device.config_read(regs::INTERRUPT_LINE, 1), 16);
    assert_eq!(served.memory.table().entries().len(), 1);

    machine.address_space().write(0x100, b"kvm").unwrap();
    assert_eq!(served.memory.read(0x100, 3).unwrap(), b"kvm");

    machine.remove_proxy("kvm0").unwrap();
    served.link.destroy();

    // The line is free again once the proxy is gone.
    let served = serve(ScratchDevice::new(spec()));
    let device = machine.add_proxy(proxy("kvm1", served.fd, 0)).unwrap();
    assert_eq!(device.config_read(regs::INTERRUPT_LINE, 1), 16);

    machine.teardown();
    served.link.destroy();
}

#[test]
#[ignore] // Requires KVM
fn test_irqfd_rebinds_after_unregister() {
    let Some(machine) = kvm_machine() else { return };
    let vm = machine.vm().expect("KVM machine has a VM");

    let objects = IrqObjects::new(17, 1).unwrap();
    vm.register_irqfd(&objects).unwrap();
    // The trigger fires straight into the irqchip.
    objects.trigger.write(1).unwrap();
    vm.unregister_irqfd(&objects).unwrap();

    let again = IrqObjects::new(17, 1).unwrap();
    vm.register_irqfd(&again).unwrap();
    vm.unregister_irqfd(&again).unwrap();
}
