//! Registry of live proxy devices, owned by the machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::ProxyDevice;
use crate::{Error, Result};

#[derive(Default)]
pub struct ProxyRegistry {
    devices: RwLock<BTreeMap<String, Arc<ProxyDevice>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device under its id. Ids are unique.
    pub fn insert(&self, device: Arc<ProxyDevice>) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(device.id()) {
            return Err(Error::Config(format!("proxy '{}' already registered", device.id())));
        }
        devices.insert(device.id().to_string(), device);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ProxyDevice>> {
        self.devices.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxyDevice>> {
        self.devices.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Find the device and window that decode bus address `addr`.
    pub fn lookup_window(&self, addr: u64, memory: bool) -> Option<(Arc<ProxyDevice>, usize, u64)> {
        self.devices.read().values().find_map(|device| {
            device
                .window_at(addr, memory)
                .map(|(window, offset)| (device.clone(), window, offset))
        })
    }

    /// Remove and return every device, for teardown.
    pub fn drain(&self) -> Vec<Arc<ProxyDevice>> {
        std::mem::take(&mut *self.devices.write()).into_values().collect()
    }
}
