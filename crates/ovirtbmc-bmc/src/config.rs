//! Configuration file
//!
//! The file is TOML with one `[DEFAULT]` table for the engine connection
//! and one table per managed VM, named after the VM:
//!
//! ```toml
//! [DEFAULT]
//! ovirt_username = "admin@internal"
//! ovirt_password = "secret"
//! ovirt_fqdn = "engine.example.com"
//! listen = "::"
//!
//! [vmA]
//! username = "admin"
//! password = "password"
//! port = 6230
//! ```

use crate::error::ConfigError;
use crate::lookup::LookupPolicy;
use ovirtbmc_ipmi::auth::CREDENTIAL_LEN;
use ovirtbmc_ipmi::{Credentials, IpmiError};
use ovirtbmc_ovirt::OvirtConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default config file path
pub const DEFAULT_CONFIG_PATH: &str = "bmc.conf";

fn default_insecure() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_lookup_attempts() -> u32 {
    5
}

fn default_lookup_backoff_ms() -> u64 {
    500
}

/// The `[DEFAULT]` table
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    pub ovirt_username: String,
    pub ovirt_password: String,
    /// Engine FQDN or full API URL
    pub ovirt_fqdn: String,
    pub listen: String,
    #[serde(default = "default_insecure")]
    pub ovirt_insecure: bool,
    #[serde(default = "default_timeout_secs")]
    pub ovirt_timeout_secs: u64,
    #[serde(default = "default_lookup_attempts")]
    pub lookup_attempts: u32,
    #[serde(default = "default_lookup_backoff_ms")]
    pub lookup_backoff_ms: u64,
}

impl fmt::Debug for Defaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defaults")
            .field("ovirt_username", &self.ovirt_username)
            .field("ovirt_fqdn", &self.ovirt_fqdn)
            .field("listen", &self.listen)
            .field("ovirt_insecure", &self.ovirt_insecure)
            .field("ovirt_timeout_secs", &self.ovirt_timeout_secs)
            .field("lookup_attempts", &self.lookup_attempts)
            .field("lookup_backoff_ms", &self.lookup_backoff_ms)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct VmSection {
    username: String,
    password: String,
    port: u16,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(rename = "DEFAULT")]
    defaults: Defaults,
    #[serde(flatten)]
    vms: BTreeMap<String, VmSection>,
}

/// One emulated BMC
#[derive(Clone, PartialEq, Eq)]
pub struct BmcInstanceConfig {
    pub vm_name: String,
    pub listen: IpAddr,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl BmcInstanceConfig {
    /// Socket address to bind
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    /// IPMI credentials
    pub fn credentials(&self) -> Result<Credentials, IpmiError> {
        Credentials::new(&self.username, &self.password)
    }
}

impl fmt::Debug for BmcInstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmcInstanceConfig")
            .field("vm_name", &self.vm_name)
            .field("listen", &self.listen)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct BmcConfig {
    pub defaults: Defaults,
    /// One entry per VM section, ordered by VM name
    pub instances: Vec<BmcInstanceConfig>,
}

impl BmcConfig {
    /// Read and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate config text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        let defaults = raw.defaults;

        if defaults.ovirt_fqdn.trim().is_empty() {
            return Err(ConfigError::invalid("DEFAULT.ovirt_fqdn", "must not be empty"));
        }
        if defaults.ovirt_timeout_secs == 0 {
            return Err(ConfigError::invalid("DEFAULT.ovirt_timeout_secs", "must be positive"));
        }
        if defaults.lookup_attempts == 0 {
            return Err(ConfigError::invalid("DEFAULT.lookup_attempts", "must be at least 1"));
        }
        let listen = listen_address(&defaults.listen)?;

        if raw.vms.is_empty() {
            return Err(ConfigError::NoInstances);
        }

        let mut ports: HashMap<u16, &str> = HashMap::new();
        let mut instances = Vec::with_capacity(raw.vms.len());
        for (name, section) in &raw.vms {
            if section.port == 0 {
                return Err(ConfigError::invalid(format!("{}.port", name), "must be non-zero"));
            }
            if let Some(other) = ports.insert(section.port, name) {
                return Err(ConfigError::invalid(
                    format!("{}.port", name),
                    format!("port {} is already used by {}", section.port, other),
                ));
            }
            check_width(name, "username", &section.username)?;
            check_width(name, "password", &section.password)?;

            instances.push(BmcInstanceConfig {
                vm_name: name.clone(),
                listen,
                port: section.port,
                username: section.username.clone(),
                password: section.password.clone(),
            });
        }

        Ok(Self {
            defaults,
            instances,
        })
    }

    /// Engine connection settings
    pub fn ovirt_config(&self) -> OvirtConfig {
        OvirtConfig::new(
            &self.defaults.ovirt_fqdn,
            self.defaults.ovirt_username.clone(),
            self.defaults.ovirt_password.clone(),
        )
        .with_insecure(self.defaults.ovirt_insecure)
        .with_timeout(Duration::from_secs(self.defaults.ovirt_timeout_secs))
    }

    /// Retry policy for VM lookup
    pub fn lookup_policy(&self) -> LookupPolicy {
        LookupPolicy::new(
            self.defaults.lookup_attempts,
            Duration::from_millis(self.defaults.lookup_backoff_ms),
        )
    }
}

fn check_width(vm: &str, field: &str, value: &str) -> Result<(), ConfigError> {
    if value.len() > CREDENTIAL_LEN {
        return Err(ConfigError::invalid(
            format!("{}.{}", vm, field),
            format!("at most {} bytes allowed, got {}", CREDENTIAL_LEN, value.len()),
        ));
    }
    Ok(())
}

/// Address to bind for a `listen` value
///
/// Values without `:` are IPv4 and become IPv4-mapped IPv6 addresses so
/// every listener is a dual-stack IPv6 socket. Anything else must be an
/// IPv6 literal, optionally in brackets.
pub fn listen_address(listen: &str) -> Result<IpAddr, ConfigError> {
    let value = listen.trim();
    if !value.contains(':') {
        let v4: Ipv4Addr = value
            .parse()
            .map_err(|e| ConfigError::invalid("DEFAULT.listen", format!("{}: {}", value, e)))?;
        return Ok(IpAddr::V6(v4.to_ipv6_mapped()));
    }

    let literal = value.trim_start_matches('[').trim_end_matches(']');
    let v6: Ipv6Addr = literal
        .parse()
        .map_err(|e| ConfigError::invalid("DEFAULT.listen", format!("{}: {}", value, e)))?;
    Ok(IpAddr::V6(v6))
}
