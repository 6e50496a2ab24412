//! Guest address space: memfd-backed RAM regions plus change listeners

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vm_memory::{Address, Bytes, FileOffset, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::{Error, Result};

/// One RAM region as seen by listeners.
#[derive(Debug, Clone)]
pub struct RegionInfo {
    /// Guest physical address
    pub guest_addr: u64,
    /// Size in bytes
    pub size: u64,
    /// Where the region is mapped in this process
    pub host_addr: u64,
    /// Backing file shared with anyone who needs the same memory
    pub file: Arc<File>,
    /// Offset of the region within `file`
    pub file_offset: u64,
}

impl RegionInfo {
    pub fn end(&self) -> u64 {
        self.guest_addr + self.size
    }
}

/// Observer of region changes. Called with the address-space lock held, so
/// notifications arrive in the order the changes happened. `current` is the
/// whole region set after the change, ordered by guest address.
pub trait MemoryListener: Send + Sync {
    fn region_added(&self, region: &RegionInfo, current: &[RegionInfo]) -> Result<()>;

    fn region_removed(&self, region: &RegionInfo, current: &[RegionInfo]) -> Result<()>;

    /// Called once at registration with every existing region.
    fn replay(&self, regions: &[RegionInfo]) -> Result<()> {
        for (i, region) in regions.iter().enumerate() {
            self.region_added(region, &regions[..=i])?;
        }
        Ok(())
    }
}

/// Handle returned by [`AddressSpace::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct RamRegion {
    info: RegionInfo,
    // Keeps `info.host_addr` mapped.
    memory: GuestMemoryMmap,
}

#[derive(Default)]
struct Inner {
    regions: BTreeMap<u64, RamRegion>,
    listeners: Vec<(ListenerId, Arc<dyn MemoryListener>)>,
    next_listener: u64,
}

impl Inner {
    fn current(&self) -> Vec<RegionInfo> {
        self.regions.values().map(|r| r.info.clone()).collect()
    }
}

/// Deliver one change to every listener. A failing listener does not keep
/// the change from the others; the first error is returned.
fn notify_all<F>(listeners: &[(ListenerId, Arc<dyn MemoryListener>)], mut notify: F) -> Result<()>
where
    F: FnMut(&dyn MemoryListener) -> Result<()>,
{
    let mut first_err = None;
    for (id, listener) in listeners {
        if let Err(e) = notify(listener.as_ref()) {
            warn!("memory listener {:?} failed: {}", id, e);
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Guest physical address space of the orchestrator.
#[derive(Default)]
pub struct AddressSpace {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AddressSpace")
            .field("regions", &inner.regions.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a RAM region backed by a fresh memfd and notify listeners.
    pub fn add_ram(&self, guest_addr: u64, size: u64) -> Result<RegionInfo> {
        if size == 0 || guest_addr.checked_add(size).is_none() {
            return Err(Error::Memory(format!(
                "invalid region {:#x}+{:#x}",
                guest_addr, size
            )));
        }

        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .regions
            .values()
            .find(|r| guest_addr < r.info.end() && r.info.guest_addr < guest_addr + size)
        {
            return Err(Error::Memory(format!(
                "region {:#x}+{:#x} overlaps {:#x}+{:#x}",
                guest_addr, size, existing.info.guest_addr, existing.info.size
            )));
        }

        let fd = memfd_create(c"devproxy-ram", MemFdCreateFlag::MFD_CLOEXEC)?;
        let file = File::from(fd);
        file.set_len(size)?;

        let memory: GuestMemoryMmap = GuestMemoryMmap::from_ranges_with_files(&[(
            GuestAddress(guest_addr),
            size as usize,
            Some(FileOffset::new(file.try_clone()?, 0)),
        )])
        .map_err(|e| Error::Memory(format!("Failed to map guest memory: {}", e)))?;
        let host_addr = memory
            .get_host_address(GuestAddress(guest_addr))
            .map_err(|e| Error::Memory(format!("Failed to resolve host address: {}", e)))?
            as u64;

        let info = RegionInfo {
            guest_addr,
            size,
            host_addr,
            file: Arc::new(file),
            file_offset: 0,
        };
        inner.regions.insert(
            guest_addr,
            RamRegion {
                info: info.clone(),
                memory,
            },
        );
        info!("Added RAM region {:#x}+{:#x}", guest_addr, size);

        let current = inner.current();
        notify_all(&inner.listeners, |listener| listener.region_added(&info, &current))?;
        Ok(info)
    }

    /// Remove the region starting at `guest_addr` and notify listeners.
    pub fn remove_region(&self, guest_addr: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let region = inner
            .regions
            .remove(&guest_addr)
            .ok_or_else(|| Error::Memory(format!("no region at {:#x}", guest_addr)))?;
        info!("Removed RAM region {:#x}+{:#x}", guest_addr, region.info.size);

        let current = inner.current();
        notify_all(&inner.listeners, |listener| listener.region_removed(&region.info, &current))
    }

    /// Register a listener; it is first replayed with every current region.
    pub fn register_listener(&self, listener: Arc<dyn MemoryListener>) -> Result<ListenerId> {
        let mut inner = self.inner.lock();
        listener.replay(&inner.current())?;

        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, listener));
        debug!("Registered memory listener {:?}", id);
        Ok(id)
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        self.inner.lock().listeners.retain(|(l, _)| *l != id);
    }

    /// Snapshot of all regions, ordered by guest address.
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.inner.lock().current()
    }

    /// A combined mapping of all RAM. The view shares backing with the
    /// regions, so writes through either are visible in both.
    pub fn guest_memory(&self) -> Result<GuestMemoryMmap> {
        let inner = self.inner.lock();
        let mut ranges = Vec::with_capacity(inner.regions.len());
        for region in inner.regions.values() {
            ranges.push((
                GuestAddress(region.info.guest_addr),
                region.info.size as usize,
                Some(FileOffset::new(region.info.file.try_clone()?, region.info.file_offset)),
            ));
        }
        GuestMemoryMmap::from_ranges_with_files(&ranges)
            .map_err(|e| Error::Memory(format!("Failed to create guest memory view: {}", e)))
    }

    /// Write `data` at `addr`; the range must fall within one region.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let inner = self.inner.lock();
        let region = find_region(&inner, addr, data.len())?;
        write_to_guest(&region.memory, GuestAddress(addr), data)
    }

    /// Read `size` bytes at `addr`; the range must fall within one region.
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let region = find_region(&inner, addr, size)?;
        read_from_guest(&region.memory, GuestAddress(addr), size)
    }
}

fn find_region(inner: &Inner, addr: u64, size: usize) -> Result<&RamRegion> {
    let (_, region) = inner
        .regions
        .range(..=addr)
        .next_back()
        .ok_or_else(|| Error::Memory(format!("no RAM at {:#x}", addr)))?;
    check_guest_address(&region.memory, GuestAddress(addr), size)?;
    Ok(region)
}

/// Write data to guest memory at the specified address
pub fn write_to_guest(memory: &GuestMemoryMmap, addr: GuestAddress, data: &[u8]) -> Result<()> {
    memory.write_slice(data, addr).map_err(|e| {
        Error::Memory(format!(
            "Failed to write to guest memory at {:#x}: {}",
            addr.raw_value(),
            e
        ))
    })
}

/// Read data from guest memory at the specified address
pub fn read_from_guest(memory: &GuestMemoryMmap, addr: GuestAddress, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    memory.read_slice(&mut buf, addr).map_err(|e| {
        Error::Memory(format!(
            "Failed to read from guest memory at {:#x}: {}",
            addr.raw_value(),
            e
        ))
    })?;
    Ok(buf)
}

/// Check if an address range fits within guest memory
pub fn check_guest_address(memory: &GuestMemoryMmap, addr: GuestAddress, size: usize) -> Result<()> {
    let end_addr = addr
        .raw_value()
        .checked_add(size as u64)
        .ok_or_else(|| Error::Memory("Address overflow".into()))?;

    if !memory.address_in_range(addr) || !memory.address_in_range(GuestAddress(end_addr.saturating_sub(1))) {
        return Err(Error::Memory(format!(
            "Address range {:#x}-{:#x} outside guest memory",
            addr.raw_value(),
            end_addr
        )));
    }

    Ok(())
}
