//! Memory Sync: keep the remote process mapping the same guest RAM.
//!
//! The orchestrator side is a [`MemoryListener`] that recomputes the full set
//! of `(address, size, fd, fd_offset)` mappings on every change and sends it
//! as one SYNC_MEMORY snapshot. Snapshots are never diffs.
//!
//! The remote side maps a snapshot into a fresh [`MappingTable`] and swaps
//! it in whole, so a reader holds either the old table or the new one.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use devproxy_protocol::{Message, Payload, SyncEntry, MAX_FDS};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use vm_memory::{FileOffset, GuestAddress, GuestMemoryMmap};

use crate::channel::Channel;
use crate::machine::memory::{
    check_guest_address, read_from_guest, write_to_guest, MemoryListener, RegionInfo,
};
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Orchestrator side
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Mapping {
    size: u64,
    file: Arc<File>,
    file_offset: u64,
}

impl Mapping {
    fn same_as(&self, other: &Mapping) -> bool {
        self.size == other.size
            && self.file_offset == other.file_offset
            && Arc::ptr_eq(&self.file, &other.file)
    }
}

/// Listener that mirrors the address space to one remote process.
pub struct MemorySync {
    channel: Arc<Channel>,
    /// The set the remote last acknowledged; `None` until the first ack.
    acked: Mutex<Option<BTreeMap<u64, Mapping>>>,
}

impl MemorySync {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            acked: Mutex::new(None),
        }
    }

    /// The snapshot the remote currently holds, ordered by address.
    pub fn snapshot(&self) -> Vec<SyncEntry> {
        self.acked
            .lock()
            .iter()
            .flatten()
            .map(|(&address, m)| SyncEntry {
                address,
                size: m.size,
                fd_offset: m.file_offset,
            })
            .collect()
    }

    /// Recompute the mapping set from `current` and send it unless the
    /// remote already holds exactly that set. A failed or rejected send
    /// leaves the acknowledged set alone, so the next change resends
    /// everything that is missing.
    fn sync_to(&self, current: &[RegionInfo]) -> Result<()> {
        let next: BTreeMap<u64, Mapping> = current
            .iter()
            .map(|region| {
                (
                    region.guest_addr,
                    Mapping {
                        size: region.size,
                        file: region.file.clone(),
                        file_offset: region.file_offset,
                    },
                )
            })
            .collect();

        let mut acked = self.acked.lock();
        if let Some(held) = acked.as_ref() {
            let unchanged = held.len() == next.len()
                && held
                    .iter()
                    .zip(&next)
                    .all(|((a, ma), (b, mb))| a == b && ma.same_as(mb));
            if unchanged {
                return Ok(());
            }
        }
        if next.len() > MAX_FDS {
            return Err(Error::Memory(format!(
                "{} memory regions exceed the {} a snapshot can carry",
                next.len(),
                MAX_FDS
            )));
        }

        let msg = snapshot_message(&next)?;
        let ack = self.channel.call_ret(msg)?;
        if ack != 0 {
            return Err(Error::Memory(format!("remote rejected memory snapshot ({:#x})", ack)));
        }
        debug!(channel = %self.channel.name(), regions = next.len(), "memory synced");
        *acked = Some(next);
        Ok(())
    }
}

fn snapshot_message(mappings: &BTreeMap<u64, Mapping>) -> Result<Message> {
    let mut entries = Vec::with_capacity(mappings.len());
    let mut fds = Vec::with_capacity(mappings.len());
    for (&address, m) in mappings {
        entries.push(SyncEntry {
            address,
            size: m.size,
            fd_offset: m.file_offset,
        });
        fds.push(m.file.as_fd().try_clone_to_owned()?);
    }
    Ok(Message::with_fds(Payload::SyncMemory(entries), fds))
}

impl MemoryListener for MemorySync {
    fn region_added(&self, _region: &RegionInfo, current: &[RegionInfo]) -> Result<()> {
        self.sync_to(current)
    }

    fn region_removed(&self, _region: &RegionInfo, current: &[RegionInfo]) -> Result<()> {
        self.sync_to(current)
    }

    /// The first snapshot is sent even when empty.
    fn replay(&self, regions: &[RegionInfo]) -> Result<()> {
        self.sync_to(regions)
    }
}

// ---------------------------------------------------------------------------
// Remote side
// ---------------------------------------------------------------------------

/// Guest memory as currently mapped by the remote process.
#[derive(Debug)]
pub struct MappingTable {
    entries: Vec<SyncEntry>,
    memory: Option<GuestMemoryMmap>,
}

impl MappingTable {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            memory: None,
        }
    }

    /// Mappings ordered by guest address.
    pub fn entries(&self) -> &[SyncEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn memory(&self, addr: u64, len: usize) -> Result<&GuestMemoryMmap> {
        let memory = self
            .memory
            .as_ref()
            .ok_or_else(|| Error::Memory("no guest memory mapped".into()))?;
        check_guest_address(memory, GuestAddress(addr), len)?;
        Ok(memory)
    }
}

/// Writer half, owned by the dispatcher.
#[derive(Debug)]
pub struct RemoteMemory {
    current: Arc<RwLock<Arc<MappingTable>>>,
}

impl Default for RemoteMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteMemory {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(MappingTable::empty()))),
        }
    }

    /// Reader handle for device code doing DMA.
    pub fn view(&self) -> MemoryView {
        MemoryView {
            current: self.current.clone(),
        }
    }

    /// Replace the whole mapping table with the one described by `entries`,
    /// each backed by the descriptor at the same index.
    pub fn apply_snapshot(&self, entries: &[SyncEntry], fds: Vec<OwnedFd>) -> Result<()> {
        if entries.len() != fds.len() {
            return Err(Error::Memory(format!(
                "{} mapping entries but {} descriptors",
                entries.len(),
                fds.len()
            )));
        }

        let mut ordered: Vec<(SyncEntry, OwnedFd)> = entries.iter().copied().zip(fds).collect();
        ordered.sort_by_key(|(e, _)| e.address);
        for pair in ordered.windows(2) {
            let (a, b) = (&pair[0].0, &pair[1].0);
            if a.address.saturating_add(a.size) > b.address {
                return Err(Error::Memory(format!(
                    "mapping {:#x}+{:#x} overlaps {:#x}",
                    a.address, a.size, b.address
                )));
            }
        }

        let mut ranges = Vec::with_capacity(ordered.len());
        let mut table_entries = Vec::with_capacity(ordered.len());
        for (entry, fd) in ordered {
            let size = usize::try_from(entry.size)
                .map_err(|_| Error::Memory(format!("mapping size {:#x} too large", entry.size)))?;
            ranges.push((
                GuestAddress(entry.address),
                size,
                Some(FileOffset::new(File::from(fd), entry.fd_offset)),
            ));
            table_entries.push(entry);
        }

        let memory = if ranges.is_empty() {
            None
        } else {
            let memory: GuestMemoryMmap = GuestMemoryMmap::from_ranges_with_files(&ranges)
                .map_err(|e| Error::Memory(format!("Failed to map snapshot: {}", e)))?;
            Some(memory)
        };

        let table = Arc::new(MappingTable {
            entries: table_entries,
            memory,
        });
        info!(regions = table.entries.len(), "guest memory table replaced");
        *self.current.write() = table;
        Ok(())
    }
}

/// Cheap, cloneable read handle over the current mapping table.
#[derive(Debug, Clone)]
pub struct MemoryView {
    current: Arc<RwLock<Arc<MappingTable>>>,
}

impl MemoryView {
    /// The table in effect now. Holding it keeps its mappings alive even if
    /// a newer snapshot replaces it.
    pub fn table(&self) -> Arc<MappingTable> {
        self.current.read().clone()
    }

    /// Read guest memory at `addr`.
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let table = self.table();
        read_from_guest(table.memory(addr, len)?, GuestAddress(addr), len)
    }

    /// Write guest memory at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let table = self.table();
        write_to_guest(table.memory(addr, data.len())?, GuestAddress(addr), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn backing(size: u64) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size).unwrap();
        file
    }

    #[test]
    fn test_apply_snapshot_maps_entries() {
        let remote = RemoteMemory::new();
        let view = remote.view();
        let mut file = backing(0x3000);
        file.seek(SeekFrom::Start(0x1000)).unwrap();
        file.write_all(b"remote").unwrap();

        let entries = [SyncEntry {
            address: 0x8000,
            size: 0x2000,
            fd_offset: 0x1000,
        }];
        remote
            .apply_snapshot(&entries, vec![OwnedFd::from(file.try_clone().unwrap())])
            .unwrap();

        assert_eq!(view.table().entries(), &entries);
        assert_eq!(view.read(0x8000, 6).unwrap(), b"remote");

        view.write(0x8010, b"dma").unwrap();
        let mut buf = [0u8; 3];
        file.seek(SeekFrom::Start(0x1010)).unwrap();
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"dma");

        assert!(view.read(0xa000, 1).is_err());
    }

    #[test]
    fn test_empty_snapshot_unmaps() {
        let remote = RemoteMemory::new();
        let view = remote.view();
        let entries = [SyncEntry {
            address: 0,
            size: 0x1000,
            fd_offset: 0,
        }];
        remote
            .apply_snapshot(&entries, vec![OwnedFd::from(backing(0x1000))])
            .unwrap();
        let old = view.table();

        remote.apply_snapshot(&[], Vec::new()).unwrap();
        assert!(view.table().is_empty());
        assert!(view.read(0, 1).is_err());
        // A reader that grabbed the old table still sees it.
        assert_eq!(old.entries().len(), 1);
    }

    #[test]
    fn test_overlapping_snapshot_rejected() {
        let remote = RemoteMemory::new();
        let entries = [
            SyncEntry {
                address: 0,
                size: 0x2000,
                fd_offset: 0,
            },
            SyncEntry {
                address: 0x1000,
                size: 0x1000,
                fd_offset: 0,
            },
        ];
        let fds = vec![OwnedFd::from(backing(0x2000)), OwnedFd::from(backing(0x1000))];
        assert!(remote.apply_snapshot(&entries, fds).is_err());
        assert!(remote.view().table().is_empty());
    }

    #[test]
    fn test_entry_fd_count_mismatch() {
        let remote = RemoteMemory::new();
        let entries = [SyncEntry {
            address: 0,
            size: 0x1000,
            fd_offset: 0,
        }];
        assert!(remote.apply_snapshot(&entries, Vec::new()).is_err());
    }
}
