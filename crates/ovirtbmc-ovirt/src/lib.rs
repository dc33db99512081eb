//! VM lifecycle client for oVirt / RHV
//!
//! This crate is the thin layer between the emulated BMCs and the
//! virtualization manager:
//!
//! - [`VmLifecycle`]: lookup, status, start/stop/shutdown/reset and boot
//!   device operations on a VM
//! - [`OvirtClient`]: implementation against the engine's v4 REST API
//! - [`MemoryVmLifecycle`]: in-memory implementation for tests
//!
//! # Example
//!
//! ```ignore
//! use ovirtbmc_ovirt::{OvirtClient, OvirtConfig, VmLifecycle};
//!
//! let client = OvirtClient::connect(OvirtConfig::new("engine.example.com", "admin@internal", "secret")).await?;
//! let vm = client.find_by_name("vmA").await?;
//! client.start(&vm.id).await?;
//! ```

pub mod client;
pub mod error;
pub mod memory;
pub mod ovirt;
pub mod types;

pub use client::VmLifecycle;
pub use error::{LifecycleError, Result};
pub use memory::{Call, MemoryVmLifecycle, Operation};
pub use ovirt::{api_url, OvirtClient, OvirtConfig};
pub use types::{BootDevice, VmIdentity, VmStatus};
