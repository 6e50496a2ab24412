//! Configuration for links, proxy devices and remote device models

use std::fmt;
use std::fs;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default bound on every call and channel wait.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of windows a device may declare.
pub const MAX_WINDOWS: usize = 6;

/// Configuration shared by every channel of a Link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Uniform timeout for calls, sends and receives. Expiry is fatal.
    pub call_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl LinkConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the call timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(Error::Config("call timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// How a proxy device reaches its remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// An already-connected stream socket inherited by this process.
    Fd(RawFd),
    /// Spawn `program` with a fresh socket pair on descriptor 3.
    Spawn { program: PathBuf, args: Vec<String> },
}

impl Transport {
    /// Parse the "fd" device property. Accepts a bare integer or a string
    /// holding one, optionally prefixed with `fd=`.
    pub fn from_property(value: &str) -> Result<Self> {
        value.parse()
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let raw = raw.strip_prefix("fd=").unwrap_or(raw);
        let fd: RawFd = raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid fd property '{}'", s)))?;
        if fd < 0 {
            return Err(Error::Config(format!("invalid fd property '{}'", s)));
        }
        Ok(Transport::Fd(fd))
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Fd(fd) => write!(f, "fd={}", fd),
            Transport::Spawn { program, .. } => write!(f, "spawn:{}", program.display()),
        }
    }
}

/// Configuration for one proxy device on the orchestrator side
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Unique device id, used as the registry key
    pub id: String,
    /// Transport to the remote process
    pub transport: Transport,
    /// Link settings
    pub link: LinkConfig,
    /// Bus slot, used to route the interrupt pin
    pub slot: u8,
}

impl ProxyConfig {
    /// Create a configuration for device `id` over `transport`
    pub fn new<S: Into<String>>(id: S, transport: Transport) -> Self {
        Self {
            id: id.into(),
            transport,
            link: LinkConfig::default(),
            slot: 0,
        }
    }

    /// Set the link configuration
    pub fn link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Set the bus slot
    pub fn slot(mut self, slot: u8) -> Self {
        self.slot = slot;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Config("proxy id must not be empty".into()));
        }
        if self.slot >= 32 {
            return Err(Error::Config(format!("slot {} out of range 0..32", self.slot)));
        }
        if let Transport::Spawn { program, .. } = &self.transport {
            if program.as_os_str().is_empty() {
                return Err(Error::Config("spawn transport needs a program".into()));
            }
        }
        self.link.validate()
    }
}

// ---------------------------------------------------------------------------
// Remote device model description
// ---------------------------------------------------------------------------

/// Address space a window decodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    #[default]
    Memory,
    Io,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowSpec {
    pub size: u64,
    #[serde(default)]
    pub kind: WindowKind,
}

/// Device model served by a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSpec {
    #[serde(default = "default_name")]
    pub name: String,
    pub vendor_id: u16,
    pub device_id: u16,
    #[serde(default)]
    pub class_code: u16,
    #[serde(default)]
    pub subsystem_id: u16,
    #[serde(default)]
    pub revision: u8,
    /// 0 = no interrupt, 1..=4 = INTA..INTD
    #[serde(default = "default_interrupt_pin")]
    pub interrupt_pin: u8,
    #[serde(default = "default_config_size")]
    pub config_size: usize,
    #[serde(default)]
    pub windows: Vec<WindowSpec>,
    /// Index of a window whose writes at offset 0 raise the interrupt.
    #[serde(default)]
    pub doorbell: Option<usize>,
    #[serde(default = "default_call_timeout", with = "duration_str")]
    pub call_timeout: Duration,
}

fn default_name() -> String {
    "scratch".to_string()
}

fn default_interrupt_pin() -> u8 {
    1
}

fn default_config_size() -> usize {
    256
}

fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl DeviceSpec {
    /// A minimal device with one 4 KiB memory window.
    pub fn scratch(vendor_id: u16, device_id: u16) -> Self {
        Self {
            name: default_name(),
            vendor_id,
            device_id,
            class_code: 0x00ff,
            subsystem_id: 0,
            revision: 1,
            interrupt_pin: default_interrupt_pin(),
            config_size: default_config_size(),
            windows: vec![WindowSpec {
                size: 0x1000,
                kind: WindowKind::Memory,
            }],
            doorbell: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Validate the device description
    pub fn validate(&self) -> Result<()> {
        if self.vendor_id == 0xffff {
            return Err(Error::Config("vendor id 0xffff is reserved".into()));
        }
        if self.config_size != 256 && self.config_size != 4096 {
            return Err(Error::Config(format!(
                "config_size must be 256 or 4096, got {}",
                self.config_size
            )));
        }
        if self.interrupt_pin > 4 {
            return Err(Error::Config(format!(
                "interrupt_pin must be 0..=4, got {}",
                self.interrupt_pin
            )));
        }
        if self.windows.len() > MAX_WINDOWS {
            return Err(Error::Config(format!(
                "at most {} windows supported, got {}",
                MAX_WINDOWS,
                self.windows.len()
            )));
        }
        for (i, window) in self.windows.iter().enumerate() {
            if window.size == 0 || !window.size.is_power_of_two() {
                return Err(Error::Config(format!(
                    "window {} size {:#x} is not a power of two",
                    i, window.size
                )));
            }
            let (min, max) = match window.kind {
                WindowKind::Memory => (16, 1u64 << 31),
                WindowKind::Io => (4, 256),
            };
            if window.size < min || window.size > max {
                return Err(Error::Config(format!(
                    "window {} size {:#x} outside {:#x}..={:#x}",
                    i, window.size, min, max
                )));
            }
        }
        if let Some(doorbell) = self.doorbell {
            if doorbell >= self.windows.len() {
                return Err(Error::Config(format!(
                    "doorbell window {} does not exist",
                    doorbell
                )));
            }
        }
        if self.call_timeout.is_zero() {
            return Err(Error::Config("call_timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Link configuration derived from this description.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig::new().call_timeout(self.call_timeout)
    }
}

/// Load a device description from YAML (`.yaml`/`.yml`) or JSON.
pub fn load_device_spec(path: &Path) -> Result<DeviceSpec> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let spec: DeviceSpec = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML spec {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON spec {}: {}", path.display(), e)))?
    };

    spec.validate()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_transport_property() {
        assert_eq!(Transport::from_property("7").unwrap(), Transport::Fd(7));
        assert_eq!(Transport::from_property(" fd=12 ").unwrap(), Transport::Fd(12));
        assert!(Transport::from_property("-1").is_err());
        assert!(Transport::from_property("socket").is_err());
    }

    #[test]
    fn test_proxy_config_builder() {
        let config = ProxyConfig::new("nvme0", Transport::Fd(5))
            .slot(4)
            .link(LinkConfig::new().call_timeout(Duration::from_millis(250)));
        assert_eq!(config.slot, 4);
        assert_eq!(config.link.call_timeout, Duration::from_millis(250));
        assert!(config.validate().is_ok());

        assert!(ProxyConfig::new("", Transport::Fd(5)).validate().is_err());
        assert!(ProxyConfig::new("x", Transport::Fd(5)).slot(32).validate().is_err());
    }

    #[test]
    fn test_scratch_spec_is_valid() {
        assert!(DeviceSpec::scratch(0x1b36, 0x0005).validate().is_ok());
    }

    #[test]
    fn test_spec_validation() {
        let mut spec = DeviceSpec::scratch(0x1b36, 0x0005);
        spec.config_size = 512;
        assert!(spec.validate().is_err());

        let mut spec = DeviceSpec::scratch(0x1b36, 0x0005);
        spec.windows[0].size = 0x1800;
        assert!(spec.validate().is_err());

        let mut spec = DeviceSpec::scratch(0x1b36, 0x0005);
        spec.interrupt_pin = 5;
        assert!(spec.validate().is_err());

        let mut spec = DeviceSpec::scratch(0x1b36, 0x0005);
        spec.windows = vec![spec.windows[0].clone(); 7];
        assert!(spec.validate().is_err());

        let mut spec = DeviceSpec::scratch(0x1b36, 0x0005);
        spec.doorbell = Some(1);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_load_yaml_spec() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "vendor_id: 6966\ndevice_id: 16\nclass_code: 264\nconfig_size: 4096\n\
             windows:\n  - size: 16384\n  - size: 32\n    kind: io\ndoorbell: 0\ncall_timeout: 750ms"
        )
        .unwrap();

        let spec = load_device_spec(file.path()).unwrap();
        assert_eq!(spec.vendor_id, 0x1b36);
        assert_eq!(spec.config_size, 4096);
        assert_eq!(spec.windows[1].kind, WindowKind::Io);
        assert_eq!(spec.interrupt_pin, 1);
        assert_eq!(spec.call_timeout, Duration::from_millis(750));
        assert_eq!(spec.link_config().call_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_load_json_spec_rejects_invalid() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"vendor_id": 1, "device_id": 2, "config_size": 100}}"#).unwrap();
        assert!(matches!(load_device_spec(file.path()), Err(Error::Config(_))));
    }
}
