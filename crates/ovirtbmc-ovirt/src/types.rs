//! VM identity, status and boot device types

use std::fmt;

/// A VM resolved by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    pub name: String,
    pub id: String,
}

impl VmIdentity {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Status of a VM as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    Up,
    PoweringUp,
    WaitForLaunch,
    PoweringDown,
    Down,
    /// Any other status (paused, suspended, migrating, ...)
    Other(String),
}

impl VmStatus {
    /// Parse the engine's status string
    pub fn from_remote(status: &str) -> Self {
        match status {
            "up" => VmStatus::Up,
            "powering_up" => VmStatus::PoweringUp,
            "wait_for_launch" => VmStatus::WaitForLaunch,
            "powering_down" => VmStatus::PoweringDown,
            "down" => VmStatus::Down,
            other => VmStatus::Other(other.to_string()),
        }
    }

    /// The engine's status string
    pub fn as_str(&self) -> &str {
        match self {
            VmStatus::Up => "up",
            VmStatus::PoweringUp => "powering_up",
            VmStatus::WaitForLaunch => "wait_for_launch",
            VmStatus::PoweringDown => "powering_down",
            VmStatus::Down => "down",
            VmStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First boot device of a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootDevice {
    Network,
    Disk,
    /// A device outside network/disk, or `none` for an empty list
    Unsupported(String),
}

impl BootDevice {
    /// Parse the engine's device name
    pub fn from_remote(device: &str) -> Self {
        match device {
            "network" => BootDevice::Network,
            "hd" => BootDevice::Disk,
            other => BootDevice::Unsupported(other.to_string()),
        }
    }

    /// The engine's device name
    pub fn as_remote(&self) -> &str {
        match self {
            BootDevice::Network => "network",
            BootDevice::Disk => "hd",
            BootDevice::Unsupported(s) => s,
        }
    }
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_remote())
    }
}
