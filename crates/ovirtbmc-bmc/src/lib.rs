//! Virtual BMCs for oVirt virtual machines
//!
//! Each configured VM gets its own emulated IPMI BMC on its own UDP port.
//! IPMI tools can then power VMs on and off, request a soft shutdown or
//! reset, and switch between network and disk boot as if the VMs were
//! physical hosts.
//!
//! ```text
//! UDP datagram
//!   -> IpmiServer (ovirtbmc-ipmi)
//!   -> BmcHandler            (session)
//!   -> PowerStateMachine     (power)
//!   -> VmLifecycle           (ovirtbmc-ovirt)
//!   -> oVirt engine
//! ```
//!
//! - [`config`]: TOML configuration file
//! - [`lookup`]: VM resolution with bounded retry
//! - [`power`]: IPMI power semantics on top of the VM lifecycle
//! - [`session`]: one emulated BMC
//! - [`fleet`]: all BMCs of the process

pub mod config;
pub mod error;
pub mod fleet;
pub mod lookup;
pub mod power;
pub mod session;

pub use config::{listen_address, BmcConfig, BmcInstanceConfig, Defaults, DEFAULT_CONFIG_PATH};
pub use error::{BmcError, ConfigError, PowerError, Result};
pub use fleet::{BmcFleet, SessionExit, SessionReport, StopHandle};
pub use lookup::{resolve_vm, LookupPolicy};
pub use power::{PowerOutcome, PowerStateMachine, PowerView};
pub use session::{BmcHandler, BmcSession};
