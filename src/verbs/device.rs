//! Device configuration, attributes and ports.

use std::fs::File;
use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::verbs::error::{Result, VerbsError};
use crate::verbs::type_alias::*;

/// Configuration of a software HCA instance.
///
/// Constructible in code, from a TOML file, or from a TOML string. All
/// fields except the device name have defaults, so a minimal config
/// file is just `name = "softib0"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, used in log messages.
    pub name: String,

    /// Number of ports exposed by the device. Must be at least 1.
    #[serde(default = "default_num_ports")]
    pub num_ports: PortNum,

    /// Device capability limits.
    #[serde(default)]
    pub attr: DeviceAttr,

    /// Interval of the catastrophic-error watchdog, in milliseconds.
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_interval_ms: u64,

    /// Whether memory registration pins pages with the OS
    /// (`mlock`/`munlock`). The software device performs no DMA, so
    /// pinning is off by default; enable it to reproduce the resource
    /// accounting of a real HCA (requires `RLIMIT_MEMLOCK` headroom).
    #[serde(default)]
    pub pin_memory: bool,
}

fn default_num_ports() -> PortNum {
    1
}

fn default_watchdog_ms() -> u64 {
    1000
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "softib0".to_string(),
            num_ports: default_num_ports(),
            attr: DeviceAttr::default(),
            watchdog_interval_ms: default_watchdog_ms(),
            pin_memory: false,
        }
    }
}

impl DeviceConfig {
    /// Create a configuration with the given device name and defaults
    /// for everything else.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load_toml(config_file: &str) -> Result<Self> {
        let mut file =
            File::open(config_file).map_err(|e| VerbsError::Config(e.to_string()))?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)
            .map_err(|e| VerbsError::Config(e.to_string()))?;
        Self::from_toml_str(&toml_str)
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| VerbsError::Config(e.to_string()))
    }

    /// Get the watchdog interval as a [`Duration`].
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

/// Device capability limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceAttr {
    /// Maximum number of outstanding work requests on any work queue.
    pub max_qp_wr: u32,

    /// Maximum number of scatter/gather elements per work request.
    pub max_sge: u32,

    /// Maximum capacity of a completion queue.
    pub max_cqe: u32,

    /// Maximum number of queue pairs on the device.
    pub max_qp: u32,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            max_qp_wr: 16384,
            max_sge: 16,
            max_cqe: 65536,
            max_qp: 1024,
        }
    }
}

/// State of a device port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// The port is up and usable.
    Active,
    /// The port link is down.
    Down,
}

/// A port on the software device.
#[derive(Debug, Clone, Copy)]
pub struct Port {
    num: PortNum,
    state: PortState,
}

impl Port {
    pub(crate) fn new(num: PortNum) -> Self {
        Self {
            num,
            state: PortState::Active,
        }
    }

    /// Get the port number.
    #[inline]
    pub fn num(&self) -> PortNum {
        self.num
    }

    /// Get the state of the port.
    #[inline]
    pub fn state(&self) -> PortState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_str() {
        let config = DeviceConfig::from_toml_str(
            r#"
            name = "softib1"
            num_ports = 2
            watchdog_interval_ms = 50

            [attr]
            max_qp_wr = 64
            max_sge = 4
            max_cqe = 256
            max_qp = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "softib1");
        assert_eq!(config.num_ports, 2);
        assert_eq!(config.attr.max_sge, 4);
        assert_eq!(config.watchdog_interval(), Duration::from_millis(50));
        assert!(!config.pin_memory);
    }

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::from_toml_str(r#"name = "softib0""#).unwrap();
        assert_eq!(config.num_ports, 1);
        assert_eq!(config.attr.max_qp_wr, DeviceAttr::default().max_qp_wr);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            DeviceConfig::from_toml_str("num_ports = []"),
            Err(VerbsError::Config(_))
        ));
    }
}
