//! Error types for BMC sessions and the fleet

use ovirtbmc_ipmi::IpmiError;
use ovirtbmc_ovirt::LifecycleError;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or lacks required keys
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is present but unusable
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    /// No VM sections
    #[error("no VM sections configured")]
    NoInstances,
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from power operations
///
/// Conflicts never surface here; they are absorbed by the state machine.
#[derive(Debug, Clone, Error)]
pub enum PowerError {
    /// The remote call failed
    #[error("remote operation failed: {0}")]
    Remote(#[from] LifecycleError),

    /// The operation is not implemented for VMs
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Errors creating or running BMC sessions
#[derive(Debug, Error)]
pub enum BmcError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// VM could not be resolved at startup
    #[error("failed to resolve VM {vm}: {source}")]
    Lookup {
        vm: String,
        #[source]
        source: LifecycleError,
    },

    /// IPMI listener could not be set up or failed
    #[error("IPMI listener for VM {vm} failed: {source}")]
    Listener {
        vm: String,
        #[source]
        source: IpmiError,
    },

    /// Session task panicked or was aborted
    #[error("session task for VM {vm} failed: {reason}")]
    Task { vm: String, reason: String },

    /// None of the configured sessions could be created
    #[error("no BMC session could be started ({failed} failed)")]
    NoSessions { failed: usize },
}

/// Result type for BMC operations
pub type Result<T> = std::result::Result<T, BmcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::invalid("vmA.port", "must be non-zero");
        assert_eq!(err.to_string(), "invalid value for vmA.port: must be non-zero");

        let err = BmcError::Lookup {
            vm: "vmA".to_string(),
            source: LifecycleError::NotFound("vmA".to_string()),
        };
        assert_eq!(err.to_string(), "failed to resolve VM vmA: VM not found: vmA");

        let err = BmcError::NoSessions { failed: 2 };
        assert_eq!(err.to_string(), "no BMC session could be started (2 failed)");

        let err = PowerError::Unsupported("power cycle");
        assert_eq!(err.to_string(), "unsupported operation: power cycle");
    }
}
