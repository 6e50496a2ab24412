//! Device models served by the remote dispatcher.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use devproxy_protocol::DeviceIdentity;
use tracing::{debug, warn};

use crate::config::{DeviceSpec, WindowKind};
use crate::irq::RemoteIrq;
use crate::memory_sync::MemoryView;
use crate::regs;

/// Device state behind the dispatcher. Offsets and sizes passed in have been
/// bounds- and alignment-checked already.
pub trait RemoteDevice: Send {
    /// Size of configuration space in bytes.
    fn config_size(&self) -> usize;

    fn config_read(&mut self, offset: u32, len: u32) -> u64;

    fn config_write(&mut self, offset: u32, len: u32, val: u64);

    /// The whole configuration space.
    fn config_bytes(&self) -> Vec<u8>;

    /// Map a bus address to `(window, offset, window_size)`.
    fn decode_window(&self, addr: u64, memory: bool) -> Option<(usize, u64, u64)>;

    fn window_read(&mut self, window: usize, offset: u64, size: u32) -> u64;

    fn window_write(&mut self, window: usize, offset: u64, size: u32, val: u64);

    fn identity(&self) -> DeviceIdentity;

    fn reset(&mut self);

    fn set_irq(&mut self, _irq: Arc<RemoteIrq>) {}

    fn set_memory(&mut self, _memory: MemoryView) {}
}

#[derive(Debug)]
struct Window {
    kind: WindowKind,
    size: u64,
    data: Vec<u8>,
}

/// A device built from a [`DeviceSpec`]: a type-0 header with the declared
/// windows backed by plain memory, and free-form registers from 0x40 up.
/// Writing a non-zero value at offset 0 of the doorbell window raises the
/// interrupt line; writing zero lowers it.
#[derive(Debug)]
pub struct ScratchDevice {
    spec: DeviceSpec,
    config: Vec<u8>,
    write_mask: Vec<u8>,
    windows: Vec<Window>,
    irq: Option<Arc<RemoteIrq>>,
    memory: Option<MemoryView>,
}

impl ScratchDevice {
    pub fn new(spec: DeviceSpec) -> Self {
        let windows = spec
            .windows
            .iter()
            .map(|w| Window {
                kind: w.kind,
                size: w.size,
                data: vec![0u8; w.size as usize],
            })
            .collect();
        let mut device = Self {
            config: Vec::new(),
            write_mask: Vec::new(),
            windows,
            irq: None,
            memory: None,
            spec,
        };
        device.reset_config();
        device
    }

    /// The guest memory view, once the orchestrator has synced memory.
    pub fn memory(&self) -> Option<&MemoryView> {
        self.memory.as_ref()
    }

    fn reset_config(&mut self) {
        let spec = &self.spec;
        let mut config = vec![0u8; spec.config_size];
        let mut mask = vec![0u8; spec.config_size];

        LittleEndian::write_u16(&mut config[regs::VENDOR_ID as usize..], spec.vendor_id);
        LittleEndian::write_u16(&mut config[regs::DEVICE_ID as usize..], spec.device_id);
        config[regs::REVISION as usize] = spec.revision;
        LittleEndian::write_u16(&mut config[regs::CLASS_CODE as usize..], spec.class_code);
        config[regs::HEADER_TYPE as usize] = 0;
        LittleEndian::write_u16(&mut config[regs::SUBSYSTEM_ID as usize..], spec.subsystem_id);
        config[regs::INTERRUPT_PIN as usize] = spec.interrupt_pin;

        LittleEndian::write_u16(&mut mask[regs::COMMAND as usize..], regs::COMMAND_WRITABLE);
        mask[regs::INTERRUPT_LINE as usize] = 0xff;
        for (i, window) in spec.windows.iter().enumerate() {
            let (flags, low_bits) = match window.kind {
                WindowKind::Memory => (0u32, 0xfu32),
                WindowKind::Io => (regs::BAR_IO, 0x3u32),
            };
            let bar = regs::bar(i) as usize;
            LittleEndian::write_u32(&mut config[bar..], flags);
            let size_mask = !(window.size as u32).wrapping_sub(1) & !low_bits;
            LittleEndian::write_u32(&mut mask[bar..], size_mask);
        }
        for byte in &mut mask[regs::DEVICE_SPECIFIC as usize..] {
            *byte = 0xff;
        }

        self.config = config;
        self.write_mask = mask;
    }

    fn command(&self) -> u16 {
        LittleEndian::read_u16(&self.config[regs::COMMAND as usize..])
    }

    fn bar_base(&self, index: usize) -> u64 {
        let raw = LittleEndian::read_u32(&self.config[regs::bar(index) as usize..]);
        match self.windows[index].kind {
            WindowKind::Memory => (raw & !0xf) as u64,
            WindowKind::Io => (raw & !0x3) as u64,
        }
    }

    fn doorbell(&self, window: usize, offset: u64, val: u64) {
        if self.spec.doorbell != Some(window) || offset != 0 {
            return;
        }
        match &self.irq {
            Some(irq) => {
                if let Err(e) = irq.set_level(val != 0) {
                    warn!("doorbell interrupt failed: {}", e);
                }
            }
            None => debug!("doorbell rung before interrupt objects arrived"),
        }
    }
}

fn read_le(bytes: &[u8], len: u32) -> u64 {
    let mut buf = [0u8; 8];
    buf[..len as usize].copy_from_slice(&bytes[..len as usize]);
    u64::from_le_bytes(buf)
}

fn write_le(bytes: &mut [u8], len: u32, val: u64) {
    bytes[..len as usize].copy_from_slice(&val.to_le_bytes()[..len as usize]);
}

impl RemoteDevice for ScratchDevice {
    fn config_size(&self) -> usize {
        self.config.len()
    }

    fn config_read(&mut self, offset: u32, len: u32) -> u64 {
        read_le(&self.config[offset as usize..], len)
    }

    fn config_write(&mut self, offset: u32, len: u32, val: u64) {
        let start = offset as usize;
        let bytes = val.to_le_bytes();
        for i in 0..len as usize {
            let mask = self.write_mask[start + i];
            let old = self.config[start + i];
            self.config[start + i] = (old & !mask) | (bytes[i] & mask);
        }
    }

    fn config_bytes(&self) -> Vec<u8> {
        self.config.clone()
    }

    fn decode_window(&self, addr: u64, memory: bool) -> Option<(usize, u64, u64)> {
        let enable = if memory { regs::COMMAND_MEMORY } else { regs::COMMAND_IO };
        if self.command() & enable == 0 {
            return None;
        }
        self.windows.iter().enumerate().find_map(|(i, window)| {
            if (window.kind == WindowKind::Memory) != memory {
                return None;
            }
            let base = self.bar_base(i);
            (addr >= base && addr - base < window.size).then(|| (i, addr - base, window.size))
        })
    }

    fn window_read(&mut self, window: usize, offset: u64, size: u32) -> u64 {
        read_le(&self.windows[window].data[offset as usize..], size)
    }

    fn window_write(&mut self, window: usize, offset: u64, size: u32, val: u64) {
        write_le(&mut self.windows[window].data[offset as usize..], size, val);
        self.doorbell(window, offset, val);
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.spec.vendor_id,
            device_id: self.spec.device_id,
            class_code: self.spec.class_code,
            subsystem_id: self.spec.subsystem_id,
        }
    }

    fn reset(&mut self) {
        self.reset_config();
        for window in &mut self.windows {
            window.data.fill(0);
        }
        if let Some(irq) = &self.irq {
            if let Err(e) = irq.set_level(false) {
                warn!("failed to lower interrupt on reset: {}", e);
            }
        }
        debug!(device = %self.spec.name, "device reset");
    }

    fn set_irq(&mut self, irq: Arc<RemoteIrq>) {
        self.irq = Some(irq);
    }

    fn set_memory(&mut self, memory: MemoryView) {
        self.memory = Some(memory);
    }
}
