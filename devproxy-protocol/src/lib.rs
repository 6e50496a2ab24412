//! Shared wire-format types for devproxy orchestrator ↔ remote process communication.
//!
//! This crate is the single source of truth for the message protocol used
//! between the orchestrator-side proxy (`devproxy`) and the remote device
//! process (`remote-agent`). It is a pure transform: nothing here touches a
//! socket.
//!
//! ## Wire Format
//!
//! Every message is framed as:
//!
//! ```text
//! ┌───────────────┬──────────┬──────────────┬────────────┬───────────────────┐
//! │ command (4 B) │ kind (1B)│ reserved (3B)│ size (4 B) │ payload (size B)  │
//! └───────────────┴──────────┴──────────────┴────────────┴───────────────────┘
//! ```
//!
//! - **command**: `u32` little-endian, mapping to [`Command`].
//! - **kind**: one byte mapping to [`PayloadKind`]; must agree with the command.
//! - **size**: `u32` little-endian, size of the payload only.
//! - **payload**: fixed binary layout selected by `command`.
//!
//! File descriptors travel as `SCM_RIGHTS` ancillary data on the same write
//! as the header, at most [`MAX_FDS`] per message.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use byteorder::{ByteOrder, LittleEndian};
use nix::fcntl::{fcntl, FcntlArg};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding, decoding or validating a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The command code does not map to a known [`Command`].
    #[error("unknown command code {0}")]
    UnknownCommand(u32),

    /// The payload kind byte is unknown or disagrees with the command.
    #[error("payload kind {actual} does not match command {command:?}")]
    KindMismatch { command: Command, actual: u8 },

    /// Declared payload size exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload of {0} bytes exceeds maximum of 4096")]
    Oversize(usize),

    /// Declared payload size differs from the size the command mandates.
    #[error("{command:?} requires a {expected} byte payload, got {actual}")]
    SizeMismatch {
        command: Command,
        expected: usize,
        actual: usize,
    },

    /// The frame body length differs from the header's size field.
    #[error("frame truncated: header declares {declared} bytes, body has {actual}")]
    Truncated { declared: usize, actual: usize },

    /// More than [`MAX_FDS`] descriptors attached.
    #[error("{0} file descriptors attached, maximum is 8")]
    TooManyFds(usize),

    /// The number of descriptors differs from what the command carries.
    #[error("{command:?} carries {expected} file descriptors, got {actual}")]
    FdCountMismatch {
        command: Command,
        expected: &'static str,
        actual: usize,
    },

    /// An attached descriptor is not open.
    #[error("attached file descriptor {0} is not open")]
    StaleFd(RawFd),

    /// An external-payload command arrived without its buffer.
    #[error("{0:?} requires an external payload buffer")]
    MissingExternalPayload(Command),

    /// A header buffer was shorter than [`HEADER_SIZE`].
    #[error("header too short: {0} bytes")]
    ShortHeader(usize),
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 4 (command) + 1 (kind) + 3 (reserved) + 4 (size).
pub const HEADER_SIZE: usize = 12;

/// Maximum number of descriptors attached to one message.
pub const MAX_FDS: usize = 8;

/// Maximum payload size in bytes (inline or external).
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Widest scalar a configuration or window access may carry, in bytes.
pub const MAX_ACCESS_SIZE: u32 = 8;

/// Sentinel value answered for any failed access.
pub const ALL_ONES: u64 = u64::MAX;

/// Encoded size of one [`SyncEntry`].
pub const SYNC_ENTRY_SIZE: usize = 24;

const CONFIG_ACCESS_SIZE: usize = 16;
const WINDOW_ACCESS_SIZE: usize = 24;
const IRQ_SETUP_SIZE: usize = 4;
const IDENTITY_SIZE: usize = 8;
const RET_SIZE: usize = 8;

/// Descriptors carried by SET_IRQ_OBJECTS: injection event then resample event.
pub const IRQ_OBJECT_FDS: usize = 2;

/// Returns true when `size` is a legal access width: a power of two no wider
/// than [`MAX_ACCESS_SIZE`].
pub fn is_valid_access_size(size: u32) -> bool {
    size.is_power_of_two() && size <= MAX_ACCESS_SIZE
}

/// Truncate the all-ones sentinel to an access width in bytes.
pub fn all_ones(size: u32) -> u64 {
    if size >= 8 {
        ALL_ONES
    } else {
        (1u64 << (size * 8)) - 1
    }
}

// ---------------------------------------------------------------------------
// Command / PayloadKind
// ---------------------------------------------------------------------------

/// Where a command's payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    /// Fixed layout selected by the command.
    Inline = 0,
    /// Variable-length buffer fully described by `size`.
    External = 1,
}

impl TryFrom<u8> for PayloadKind {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(PayloadKind::Inline),
            1 => Ok(PayloadKind::External),
            other => Err(other),
        }
    }
}

/// Command codes exchanged between orchestrator and remote process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Full snapshot of guest memory mappings, one fd per entry. An empty
    /// snapshot unmaps everything.
    SyncMemory = 1,
    /// Scalar reply to any request
    Ret = 2,
    /// Configuration-space write
    ConfigWrite = 3,
    /// Configuration-space read
    ConfigRead = 4,
    /// Window (BAR) write
    WindowWrite = 5,
    /// Window (BAR) read
    WindowRead = 6,
    /// Interrupt event objects for the direct injection path
    SetIrqObjects = 7,
    /// Reset the remote device
    DeviceReset = 8,
    /// Ask for vendor/device/class/subsystem
    GetIdentity = 9,
    /// Identity reply
    Identity = 10,
    /// Liveness probe
    Ping = 11,
    /// Ask for the whole configuration space
    ConfigSnapshot = 12,
    /// Configuration space bytes (external payload)
    ConfigSpace = 13,
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Command::SyncMemory),
            2 => Ok(Command::Ret),
            3 => Ok(Command::ConfigWrite),
            4 => Ok(Command::ConfigRead),
            5 => Ok(Command::WindowWrite),
            6 => Ok(Command::WindowRead),
            7 => Ok(Command::SetIrqObjects),
            8 => Ok(Command::DeviceReset),
            9 => Ok(Command::GetIdentity),
            10 => Ok(Command::Identity),
            11 => Ok(Command::Ping),
            12 => Ok(Command::ConfigSnapshot),
            13 => Ok(Command::ConfigSpace),
            _ => Err(ProtocolError::UnknownCommand(code)),
        }
    }
}

impl Command {
    /// Payload kind this command must be framed with.
    pub fn payload_kind(self) -> PayloadKind {
        match self {
            Command::ConfigSpace => PayloadKind::External,
            _ => PayloadKind::Inline,
        }
    }

    /// True for commands only ever sent as replies.
    pub fn is_reply(self) -> bool {
        matches!(self, Command::Ret | Command::Identity | Command::ConfigSpace)
    }

    /// Exact inline payload size for this command given `fd_count` attached
    /// descriptors. `None` for external-payload commands.
    pub fn expected_size(self, fd_count: usize) -> Option<usize> {
        match self {
            Command::SyncMemory => Some(SYNC_ENTRY_SIZE * fd_count),
            Command::Ret => Some(RET_SIZE),
            Command::ConfigWrite | Command::ConfigRead => Some(CONFIG_ACCESS_SIZE),
            Command::WindowWrite | Command::WindowRead => Some(WINDOW_ACCESS_SIZE),
            Command::SetIrqObjects => Some(IRQ_SETUP_SIZE),
            Command::Identity => Some(IDENTITY_SIZE),
            Command::DeviceReset
            | Command::GetIdentity
            | Command::Ping
            | Command::ConfigSnapshot => Some(0),
            Command::ConfigSpace => None,
        }
    }

    fn check_fd_count(self, count: usize) -> Result<(), ProtocolError> {
        let (ok, expected) = match self {
            Command::SyncMemory => (count <= MAX_FDS, "0 to 8"),
            Command::SetIrqObjects => (count == IRQ_OBJECT_FDS, "exactly 2"),
            _ => (count == 0, "no"),
        };
        if ok {
            Ok(())
        } else {
            Err(ProtocolError::FdCountMismatch {
                command: self,
                expected,
                actual: count,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Raw message header as read off the wire.
///
/// Fields are kept untyped so that validation can report exactly what a
/// misbehaving peer sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw command code.
    pub command: u32,
    /// Raw payload kind byte.
    pub payload_kind: u8,
    /// Payload size in bytes.
    pub size: u32,
}

impl Header {
    /// Encode into the fixed header region.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.command);
        buf[4] = self.payload_kind;
        LittleEndian::write_u32(&mut buf[8..12], self.size);
        buf
    }

    /// Decode the fixed header region. Only the length of `data` is checked;
    /// contents are judged by [`validate`].
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortHeader(data.len()));
        }
        Ok(Self {
            command: LittleEndian::read_u32(&data[0..4]),
            payload_kind: data[4],
            size: LittleEndian::read_u32(&data[8..12]),
        })
    }

    /// Reject sizes a receiver must not allocate for.
    pub fn check_size(&self) -> Result<usize, ProtocolError> {
        let size = self.size as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Oversize(size));
        }
        Ok(size)
    }
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// One guest memory mapping in a SYNC_MEMORY snapshot. The backing fd is the
/// attached descriptor at the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncEntry {
    /// Guest physical address of the region.
    pub address: u64,
    /// Region size in bytes.
    pub size: u64,
    /// Offset of the region within its backing fd.
    pub fd_offset: u64,
}

/// Configuration-space access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigAccess {
    /// Offset into configuration space.
    pub addr: u32,
    /// Value written (ignored for reads).
    pub val: u64,
    /// Access width in bytes.
    pub len: i32,
}

/// Window (BAR) access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAccess {
    /// Absolute bus address of the access.
    pub addr: u64,
    /// Value written (ignored for reads).
    pub val: u64,
    /// Access width in bytes.
    pub size: u32,
    /// True for a memory window, false for an I/O window.
    pub memory: bool,
}

/// Interrupt fast-path setup. The two attached fds are the injection event
/// and the resample event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqSetup {
    /// INTx line (0 = INTA .. 3 = INTD).
    pub intx_line: i32,
}

/// Bus identity of the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u16,
    pub subsystem_id: u16,
}

/// Message body, one variant per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    SyncMemory(Vec<SyncEntry>),
    Ret(u64),
    ConfigWrite(ConfigAccess),
    ConfigRead(ConfigAccess),
    WindowWrite(WindowAccess),
    WindowRead(WindowAccess),
    SetIrqObjects(IrqSetup),
    DeviceReset,
    GetIdentity,
    Identity(DeviceIdentity),
    Ping,
    ConfigSnapshot,
    ConfigSpace(Vec<u8>),
}

impl Payload {
    /// Command code selected by this payload.
    pub fn command(&self) -> Command {
        match self {
            Payload::SyncMemory(_) => Command::SyncMemory,
            Payload::Ret(_) => Command::Ret,
            Payload::ConfigWrite(_) => Command::ConfigWrite,
            Payload::ConfigRead(_) => Command::ConfigRead,
            Payload::WindowWrite(_) => Command::WindowWrite,
            Payload::WindowRead(_) => Command::WindowRead,
            Payload::SetIrqObjects(_) => Command::SetIrqObjects,
            Payload::DeviceReset => Command::DeviceReset,
            Payload::GetIdentity => Command::GetIdentity,
            Payload::Identity(_) => Command::Identity,
            Payload::Ping => Command::Ping,
            Payload::ConfigSnapshot => Command::ConfigSnapshot,
            Payload::ConfigSpace(_) => Command::ConfigSpace,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Payload::SyncMemory(entries) => {
                let mut buf = vec![0u8; entries.len() * SYNC_ENTRY_SIZE];
                for (entry, chunk) in entries.iter().zip(buf.chunks_exact_mut(SYNC_ENTRY_SIZE)) {
                    LittleEndian::write_u64(&mut chunk[0..8], entry.address);
                    LittleEndian::write_u64(&mut chunk[8..16], entry.size);
                    LittleEndian::write_u64(&mut chunk[16..24], entry.fd_offset);
                }
                buf
            }
            Payload::Ret(val) => val.to_le_bytes().to_vec(),
            Payload::ConfigWrite(access) | Payload::ConfigRead(access) => {
                let mut buf = vec![0u8; CONFIG_ACCESS_SIZE];
                LittleEndian::write_u32(&mut buf[0..4], access.addr);
                LittleEndian::write_i32(&mut buf[4..8], access.len);
                LittleEndian::write_u64(&mut buf[8..16], access.val);
                buf
            }
            Payload::WindowWrite(access) | Payload::WindowRead(access) => {
                let mut buf = vec![0u8; WINDOW_ACCESS_SIZE];
                LittleEndian::write_u64(&mut buf[0..8], access.addr);
                LittleEndian::write_u64(&mut buf[8..16], access.val);
                LittleEndian::write_u32(&mut buf[16..20], access.size);
                buf[20] = access.memory as u8;
                buf
            }
            Payload::SetIrqObjects(setup) => setup.intx_line.to_le_bytes().to_vec(),
            Payload::Identity(id) => {
                let mut buf = vec![0u8; IDENTITY_SIZE];
                LittleEndian::write_u16(&mut buf[0..2], id.vendor_id);
                LittleEndian::write_u16(&mut buf[2..4], id.device_id);
                LittleEndian::write_u16(&mut buf[4..6], id.class_code);
                LittleEndian::write_u16(&mut buf[6..8], id.subsystem_id);
                buf
            }
            Payload::DeviceReset
            | Payload::GetIdentity
            | Payload::Ping
            | Payload::ConfigSnapshot => Vec::new(),
            Payload::ConfigSpace(bytes) => bytes.clone(),
        }
    }

    /// Parse a body whose size has already been validated for `command`.
    fn decode_body(command: Command, body: &[u8]) -> Self {
        match command {
            Command::SyncMemory => Payload::SyncMemory(
                body.chunks_exact(SYNC_ENTRY_SIZE)
                    .map(|chunk| SyncEntry {
                        address: LittleEndian::read_u64(&chunk[0..8]),
                        size: LittleEndian::read_u64(&chunk[8..16]),
                        fd_offset: LittleEndian::read_u64(&chunk[16..24]),
                    })
                    .collect(),
            ),
            Command::Ret => Payload::Ret(LittleEndian::read_u64(body)),
            Command::ConfigWrite | Command::ConfigRead => {
                let access = ConfigAccess {
                    addr: LittleEndian::read_u32(&body[0..4]),
                    len: LittleEndian::read_i32(&body[4..8]),
                    val: LittleEndian::read_u64(&body[8..16]),
                };
                if command == Command::ConfigWrite {
                    Payload::ConfigWrite(access)
                } else {
                    Payload::ConfigRead(access)
                }
            }
            Command::WindowWrite | Command::WindowRead => {
                let access = WindowAccess {
                    addr: LittleEndian::read_u64(&body[0..8]),
                    val: LittleEndian::read_u64(&body[8..16]),
                    size: LittleEndian::read_u32(&body[16..20]),
                    memory: body[20] != 0,
                };
                if command == Command::WindowWrite {
                    Payload::WindowWrite(access)
                } else {
                    Payload::WindowRead(access)
                }
            }
            Command::SetIrqObjects => Payload::SetIrqObjects(IrqSetup {
                intx_line: LittleEndian::read_i32(body),
            }),
            Command::DeviceReset => Payload::DeviceReset,
            Command::GetIdentity => Payload::GetIdentity,
            Command::Identity => Payload::Identity(DeviceIdentity {
                vendor_id: LittleEndian::read_u16(&body[0..2]),
                device_id: LittleEndian::read_u16(&body[2..4]),
                class_code: LittleEndian::read_u16(&body[4..6]),
                subsystem_id: LittleEndian::read_u16(&body[6..8]),
            }),
            Command::Ping => Payload::Ping,
            Command::ConfigSnapshot => Payload::ConfigSnapshot,
            Command::ConfigSpace => Payload::ConfigSpace(body.to_vec()),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Probe that `fd` refers to an open descriptor.
pub fn fd_is_open(fd: RawFd) -> bool {
    fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

/// Validate a message before it is acted on.
///
/// `body_len` is the number of payload bytes actually supplied with the
/// header. Failures are reported, never repaired.
pub fn validate(header: &Header, body_len: usize, fds: &[RawFd]) -> Result<Command, ProtocolError> {
    let command = Command::try_from(header.command)?;

    let kind_ok = PayloadKind::try_from(header.payload_kind)
        .map(|kind| kind == command.payload_kind())
        .unwrap_or(false);
    if !kind_ok {
        return Err(ProtocolError::KindMismatch {
            command,
            actual: header.payload_kind,
        });
    }

    let size = header.check_size()?;

    if fds.len() > MAX_FDS {
        return Err(ProtocolError::TooManyFds(fds.len()));
    }
    if let Some(&stale) = fds.iter().find(|&&fd| !fd_is_open(fd)) {
        return Err(ProtocolError::StaleFd(stale));
    }
    command.check_fd_count(fds.len())?;

    match command.expected_size(fds.len()) {
        Some(expected) if expected != size => {
            return Err(ProtocolError::SizeMismatch {
                command,
                expected,
                actual: size,
            });
        }
        Some(_) => {}
        None if size == 0 || body_len == 0 => {
            return Err(ProtocolError::MissingExternalPayload(command));
        }
        None => {}
    }

    if body_len != size {
        return Err(ProtocolError::Truncated {
            declared: size,
            actual: body_len,
        });
    }

    Ok(command)
}

// ---------------------------------------------------------------------------
// Frame (partially decoded message)
// ---------------------------------------------------------------------------

/// A message as received: header, raw body and owned descriptors, not yet
/// validated or interpreted.
#[derive(Debug)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl Frame {
    /// Run [`validate`] over this frame.
    pub fn validate(&self) -> Result<Command, ProtocolError> {
        let raw: Vec<RawFd> = self.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        validate(&self.header, self.body.len(), &raw)
    }

    /// Boolean form of [`Frame::validate`].
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A decoded protocol message: typed payload plus the descriptors it carries.
#[derive(Debug)]
pub struct Message {
    pub payload: Payload,
    pub fds: Vec<OwnedFd>,
}

/// Wire image of a message, ready for a single transport write.
#[derive(Debug)]
pub struct Encoded {
    pub header: [u8; HEADER_SIZE],
    pub payload: Vec<u8>,
    pub fds: Vec<RawFd>,
}

impl Message {
    /// A message without descriptors.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            fds: Vec::new(),
        }
    }

    /// A message carrying `fds` as ancillary data.
    pub fn with_fds(payload: Payload, fds: Vec<OwnedFd>) -> Self {
        Self { payload, fds }
    }

    /// Shorthand for a `RET` reply.
    pub fn ret(val: u64) -> Self {
        Self::new(Payload::Ret(val))
    }

    /// Command code of this message.
    pub fn command(&self) -> Command {
        self.payload.command()
    }

    /// Encode into header bytes, payload bytes and the fd list. The result is
    /// validated so a malformed message is never put on the wire.
    pub fn encode(&self) -> Result<Encoded, ProtocolError> {
        let command = self.command();
        let payload = self.payload.encode_body();
        let header = Header {
            command: command as u32,
            payload_kind: command.payload_kind() as u8,
            size: u32::try_from(payload.len())
                .map_err(|_| ProtocolError::Oversize(payload.len()))?,
        };
        let fds: Vec<RawFd> = self.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        validate(&header, payload.len(), &fds)?;
        Ok(Encoded {
            header: header.encode(),
            payload,
            fds,
        })
    }

    /// Validate a received frame and interpret its body.
    pub fn decode(frame: Frame) -> Result<Self, ProtocolError> {
        let command = frame.validate()?;
        Ok(Self {
            payload: Payload::decode_body(command, &frame.body),
            fds: frame.fds,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
