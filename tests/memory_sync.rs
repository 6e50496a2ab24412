//! Memory Sync between an orchestrator address space and a remote process.

#[path = "common/remote_harness.rs"]
mod remote_harness;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use devproxy::devproxy_protocol::{Message, Payload, SyncEntry};
use devproxy::machine::memory::{AddressSpace, MemoryListener};
use devproxy::memory_sync::MemorySync;
use devproxy::remote::ScratchDevice;
use devproxy::{Channel, LinkConfig, Machine, ProxyConfig, Transport};
use remote_harness::{serve, TEST_TIMEOUT};

const MIB: u64 = 1 << 20;

fn entry(address: u64, size: u64) -> SyncEntry {
    SyncEntry {
        address,
        size,
        fd_offset: 0,
    }
}

fn proxy_config(fd: i32) -> ProxyConfig {
    ProxyConfig::new("mem0", Transport::Fd(fd)).link(LinkConfig::new().call_timeout(TEST_TIMEOUT))
}

fn scratch() -> ScratchDevice {
    ScratchDevice::new(devproxy::DeviceSpec::scratch(0x1b36, 0x0005))
}

/// Accept SYNC_MEMORY requests until the peer hangs up, recording each
/// snapshot and checking it carries one descriptor per entry.
fn spawn_sync_recorder(server: Channel) -> thread::JoinHandle<Vec<Vec<SyncEntry>>> {
    thread::spawn(move || {
        let mut snapshots = Vec::new();
        while let Ok(msg) = server.recv() {
            let Payload::SyncMemory(entries) = &msg.payload else {
                panic!("unexpected request {:?}", msg.command());
            };
            assert_eq!(entries.len(), msg.fds.len());
            snapshots.push(entries.clone());
            server.send(&Message::ret(0)).unwrap();
        }
        snapshots
    })
}

#[test]
fn test_existing_regions_replayed_on_attach() {
    let machine = Machine::new();
    let space = machine.address_space();
    space.add_ram(0, 2 * MIB).unwrap();
    space.add_ram(0x1000_0000, MIB).unwrap();
    space.add_ram(0x4000_0000, 4 * MIB).unwrap();

    let served = serve(scratch());
    machine.add_proxy(proxy_config(served.fd)).unwrap();

    assert_eq!(
        served.memory.table().entries(),
        &[
            entry(0, 2 * MIB),
            entry(0x1000_0000, MIB),
            entry(0x4000_0000, 4 * MIB)
        ]
    );

    machine.teardown();
    served.link.destroy();
}

#[test]
fn test_region_changes_follow_the_address_space() {
    let machine = Machine::new();
    let served = serve(scratch());
    machine.add_proxy(proxy_config(served.fd)).unwrap();
    // Nothing mapped yet: the first snapshot is empty.
    assert!(served.memory.table().is_empty());

    let space = machine.address_space();
    space.add_ram(0x10_0000, MIB).unwrap();
    space.add_ram(0, 0x8_0000).unwrap();
    assert_eq!(
        served.memory.table().entries(),
        &[entry(0, 0x8_0000), entry(0x10_0000, MIB)]
    );

    space.remove_region(0).unwrap();
    assert_eq!(served.memory.table().entries(), &[entry(0x10_0000, MIB)]);

    space.remove_region(0x10_0000).unwrap();
    assert!(served.memory.table().is_empty());

    machine.teardown();
    served.link.destroy();
}

#[test]
fn test_remote_shares_guest_ram() {
    let machine = Machine::new();
    let space = machine.address_space();
    space.add_ram(0, MIB).unwrap();

    let served = serve(scratch());
    machine.add_proxy(proxy_config(served.fd)).unwrap();

    space.write(0x1234, b"guest data").unwrap();
    assert_eq!(served.memory.read(0x1234, 10).unwrap(), b"guest data");

    served.memory.write(0x8000, b"dma").unwrap();
    assert_eq!(space.read(0x8000, 3).unwrap(), b"dma");

    // Outside any synced region.
    assert!(served.memory.read(MIB, 1).is_err());

    machine.teardown();
    served.link.destroy();
}

#[test]
fn test_unchanged_region_not_resent() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let (client, server) = Channel::pair(rt.handle(), Duration::from_secs(5)).unwrap();
    let recorder = spawn_sync_recorder(server);

    let space = AddressSpace::new();
    let region = space.add_ram(0x2000_0000, MIB).unwrap();

    let sync = Arc::new(MemorySync::new(Arc::new(client)));
    let id = space.register_listener(sync.clone()).unwrap();
    assert_eq!(sync.snapshot(), vec![entry(0x2000_0000, MIB)]);

    // Re-announcing an identical region is a no-op.
    sync.region_added(&region, &space.regions()).unwrap();

    space.add_ram(0, MIB).unwrap();
    space.remove_region(0x2000_0000).unwrap();
    space.unregister_listener(id);
    drop(sync);

    let snapshots = recorder.join().unwrap();
    assert_eq!(
        snapshots,
        vec![
            vec![entry(0x2000_0000, MIB)],
            vec![entry(0, MIB), entry(0x2000_0000, MIB)],
            vec![entry(0, MIB)],
        ]
    );
}

#[test]
fn test_rejected_snapshot_keeps_previous_set() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let (client, server) = Channel::pair(rt.handle(), Duration::from_secs(5)).unwrap();
    let responder = thread::spawn(move || {
        // Accept the initial snapshot, refuse the next one.
        for ack in [0u64, 1] {
            let msg = server.recv().unwrap();
            assert!(matches!(msg.payload, Payload::SyncMemory(_)));
            server.send(&Message::ret(ack)).unwrap();
        }
        server
    });

    let space = AddressSpace::new();
    let sync = Arc::new(MemorySync::new(Arc::new(client)));
    space.register_listener(sync.clone()).unwrap();
    assert!(sync.snapshot().is_empty());

    assert!(space.add_ram(0, MIB).is_err());
    assert!(sync.snapshot().is_empty());

    drop(responder.join().unwrap());
}

#[test]
fn test_next_change_resends_rejected_region() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let (client, server) = Channel::pair(rt.handle(), Duration::from_secs(5)).unwrap();
    let responder = thread::spawn(move || {
        // Accept the initial snapshot, refuse the next, accept the third.
        let mut seen = Vec::new();
        for ack in [0u64, 1, 0] {
            let msg = server.recv().unwrap();
            let Payload::SyncMemory(entries) = msg.payload else {
                panic!("unexpected request {:?}", msg.command());
            };
            assert_eq!(entries.len(), msg.fds.len());
            seen.push(entries);
            server.send(&Message::ret(ack)).unwrap();
        }
        (server, seen)
    });

    let space = AddressSpace::new();
    let sync = Arc::new(MemorySync::new(Arc::new(client)));
    space.register_listener(sync.clone()).unwrap();

    assert!(space.add_ram(0, MIB).is_err());
    space.add_ram(0x100_0000, MIB).unwrap();

    let expected = vec![entry(0, MIB), entry(0x100_0000, MIB)];
    assert_eq!(sync.snapshot(), expected);

    let (server, seen) = responder.join().unwrap();
    assert_eq!(seen, vec![vec![], vec![entry(0, MIB)], expected]);
    drop(server);
}

#[test]
fn test_lost_remote_does_not_block_other_devices() {
    let machine = Machine::new();
    let lost = serve(scratch());
    let healthy = serve(scratch());
    let a = machine
        .add_proxy(
            ProxyConfig::new("a", Transport::Fd(lost.fd))
                .link(LinkConfig::new().call_timeout(TEST_TIMEOUT)),
        )
        .unwrap();
    machine
        .add_proxy(
            ProxyConfig::new("b", Transport::Fd(healthy.fd))
                .slot(1)
                .link(LinkConfig::new().call_timeout(TEST_TIMEOUT)),
        )
        .unwrap();

    lost.link.destroy();

    // The change reaches b even though a's remote is gone.
    let space = machine.address_space();
    assert!(space.add_ram(0, MIB).is_err());
    assert!(!a.is_available());
    assert_eq!(healthy.memory.table().entries(), &[entry(0, MIB)]);

    // Once a is marked lost it no longer fails region changes.
    space.add_ram(0x10_0000, MIB).unwrap();
    assert_eq!(
        healthy.memory.table().entries(),
        &[entry(0, MIB), entry(0x10_0000, MIB)]
    );

    machine.teardown();
    healthy.link.destroy();
}
