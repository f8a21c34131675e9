//! Device configuration.
//!
//! The device path and the control-code numbers are plain data injected
//! at construction, so a harness can point the client at a different
//! node (or a different kernel's numbering) without touching the core.

use ksancov_protocol::{
    KSANCOV_IOC_COUNTERS, KSANCOV_IOC_MAP, KSANCOV_IOC_MAP_EDGEMAP, KSANCOV_IOC_NEDGES,
    KSANCOV_IOC_START, KSANCOV_IOC_TRACE, KSANCOV_PATH,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Request numbers for each device control operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlCodes {
    pub trace: u64,
    pub counters: u64,
    pub map: u64,
    pub map_edgemap: u64,
    pub start: u64,
    pub nedges: u64,
}

impl Default for ControlCodes {
    fn default() -> Self {
        Self {
            trace: KSANCOV_IOC_TRACE,
            counters: KSANCOV_IOC_COUNTERS,
            map: KSANCOV_IOC_MAP,
            map_edgemap: KSANCOV_IOC_MAP_EDGEMAP,
            start: KSANCOV_IOC_START,
            nedges: KSANCOV_IOC_NEDGES,
        }
    }
}

/// Where the device lives and how to talk to it.
///
/// Missing fields take their defaults when deserialized, so a harness
/// config only needs to name what it overrides:
///
/// ```
/// use ksancov::DeviceConfig;
///
/// let config: DeviceConfig = serde_json::from_str(r#"{"path": "/dev/ksancov1"}"#).unwrap();
/// assert_eq!(config.path.to_str(), Some("/dev/ksancov1"));
/// assert_eq!(config.codes, Default::default());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Path of the device node.
    pub path: PathBuf,
    /// Control-code numbering.
    pub codes: ControlCodes,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(KSANCOV_PATH),
            codes: ControlCodes::default(),
        }
    }
}

impl DeviceConfig {
    /// Use a different device node.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Use a different control-code numbering.
    pub fn with_codes(mut self, codes: ControlCodes) -> Self {
        self.codes = codes;
        self
    }
}
