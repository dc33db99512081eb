//! The VM lifecycle seam
//!
//! Everything above this crate talks to the virtualization manager through
//! [`VmLifecycle`], so the power logic can be exercised against
//! [`crate::MemoryVmLifecycle`] as well as the real engine.

use crate::error::Result;
use crate::types::{BootDevice, VmIdentity, VmStatus};
use async_trait::async_trait;

/// Lifecycle operations on remote VMs
///
/// Every call is a live round trip; implementations never cache status.
#[async_trait]
pub trait VmLifecycle: Send + Sync {
    /// Resolve a VM by exact name
    ///
    /// Returns `NotFound` when nothing matches and `Ambiguous` when more
    /// than one VM carries the name.
    async fn find_by_name(&self, name: &str) -> Result<VmIdentity>;

    /// Current status of a VM
    async fn get_status(&self, id: &str) -> Result<VmStatus>;

    /// Start a VM
    async fn start(&self, id: &str) -> Result<()>;

    /// Hard power-off
    async fn stop(&self, id: &str) -> Result<()>;

    /// Request a graceful (guest) shutdown; does not wait for it
    async fn shutdown(&self, id: &str) -> Result<()>;

    /// Hard reset of a running VM
    async fn reset(&self, id: &str) -> Result<()>;

    /// Make `device` the only boot device
    async fn set_boot_device(&self, id: &str, device: &BootDevice) -> Result<()>;

    /// First configured boot device
    async fn get_boot_device(&self, id: &str) -> Result<BootDevice>;
}
