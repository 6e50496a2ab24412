//! Standard configuration-space register offsets and bits.

pub const VENDOR_ID: u32 = 0x00;
pub const DEVICE_ID: u32 = 0x02;
pub const COMMAND: u32 = 0x04;
pub const REVISION: u32 = 0x08;
pub const CLASS_CODE: u32 = 0x0a;
pub const HEADER_TYPE: u32 = 0x0e;
pub const BAR0: u32 = 0x10;
pub const SUBSYSTEM_ID: u32 = 0x2e;
pub const INTERRUPT_LINE: u32 = 0x3c;
pub const INTERRUPT_PIN: u32 = 0x3d;
/// First device-specific register.
pub const DEVICE_SPECIFIC: u32 = 0x40;

pub const COMMAND_IO: u16 = 1 << 0;
pub const COMMAND_MEMORY: u16 = 1 << 1;
pub const COMMAND_WRITABLE: u16 = 0x0407;

pub const BAR_IO: u32 = 1 << 0;

pub fn bar(index: usize) -> u32 {
    BAR0 + 4 * index as u32
}
