//! Device model: per-job configuration snapshots and fleet-side records.

use crate::ids::{Hostname, JobId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Device configuration as rendered for one job.
///
/// Rendered from the device template when the job is started and treated as
/// read-only for the lifetime of the job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub commands: DeviceCommands,
    #[serde(default)]
    pub actions: DeviceActions,
    /// Device-family constants (prompts, load addresses, ...).
    #[serde(default)]
    pub constants: HashMap<String, String>,
}

/// Shell command templates for power and connection control.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_reset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_reset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_off: Option<String>,
    /// Command used to reach the device console.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,
    /// Named connections, e.g. `uart0 -> telnet localhost 4001`.
    #[serde(default)]
    pub connections: HashMap<String, String>,
    /// Operator-defined commands addressable from a job.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

/// Supported deploy and boot methods for this device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceActions {
    #[serde(default)]
    pub deploy: MethodList,
    #[serde(default)]
    pub boot: MethodList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MethodList {
    #[serde(default)]
    pub methods: Vec<String>,
}

impl DeviceConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid device configuration: {}", e)))
    }

    pub fn has_deploy_method(&self, method: &str) -> bool {
        self.actions.deploy.methods.iter().any(|m| m == method)
    }

    pub fn has_boot_method(&self, method: &str) -> bool {
        self.actions.boot.methods.iter().any(|m| m == method)
    }

    pub fn constant(&self, key: &str) -> Option<&str> {
        self.constants.get(key).map(String::as_str)
    }
}

/// Scheduling state of a device in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Idle,
    Reserved,
    Running,
    Offline,
}

/// Operational health of a device, maintained by health-check jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHealth {
    Good,
    Unknown,
    Bad,
}

/// Fleet-side device record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub hostname: Hostname,
    pub device_type: String,
    /// Worker this device is wired to.
    pub worker: Hostname,
    pub state: DeviceState,
    pub health: DeviceHealth,
    pub current_job: Option<JobId>,
    /// Template text rendered into a `DeviceConfig` per job.
    pub config_template: String,
}

impl Device {
    pub fn is_idle(&self) -> bool {
        self.state == DeviceState::Idle
    }

    /// Whether this device can accept the given kind of job.
    pub fn accepts(&self, health_check: bool) -> bool {
        match self.health {
            DeviceHealth::Good => true,
            // Devices of unknown health only run health checks.
            DeviceHealth::Unknown => health_check,
            DeviceHealth::Bad => false,
        }
    }
}
