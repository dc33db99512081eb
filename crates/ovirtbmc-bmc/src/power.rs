//! Power state machine
//!
//! Maps IPMI power and boot requests onto VM lifecycle calls. The remote
//! status is always fetched live and collapsed into a binary [`PowerView`];
//! requests that are already satisfied become no-ops instead of errors.
//!
//! The only local state is the graceful-shutdown memo (`target_status`).
//! It stops a repeated soft-off from issuing another shutdown while the VM
//! is in transition, and is cleared when:
//!
//! - a status fetch observes a settled state, `down` or `up`
//! - power on or hard reset issues a new intent
//! - the shutdown request itself fails
//!
//! Soft-off always fetches the status before consulting the memo, so a VM
//! that was powered back on by someone else gets a fresh shutdown.

use crate::error::PowerError;
use ovirtbmc_ovirt::{BootDevice, LifecycleError, VmIdentity, VmLifecycle, VmStatus};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Binary power view exposed over IPMI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerView {
    On,
    Off,
}

impl PowerView {
    /// `up`, `wait_for_launch` and `powering_up` count as on
    pub fn classify(status: &VmStatus) -> Self {
        match status {
            VmStatus::Up | VmStatus::WaitForLaunch | VmStatus::PoweringUp => PowerView::On,
            _ => PowerView::Off,
        }
    }

    pub fn is_on(self) -> bool {
        self == PowerView::On
    }
}

/// Result of a power request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOutcome {
    /// The remote operation was issued (or the remote said it already happened)
    Done,
    /// Nothing to do; the VM is already in the requested state
    AlreadySatisfied,
}

/// Per-VM power logic
pub struct PowerStateMachine {
    vm: VmIdentity,
    lifecycle: Arc<dyn VmLifecycle>,
    target_status: Mutex<Option<PowerView>>,
}

impl PowerStateMachine {
    pub fn new(vm: VmIdentity, lifecycle: Arc<dyn VmLifecycle>) -> Self {
        Self {
            vm,
            lifecycle,
            target_status: Mutex::new(None),
        }
    }

    /// The managed VM
    pub fn vm(&self) -> &VmIdentity {
        &self.vm
    }

    /// Fetch the current power state
    pub async fn query_power(&self) -> Result<PowerView, PowerError> {
        let status = self.lifecycle.get_status(&self.vm.id).await?;
        if matches!(status, VmStatus::Down | VmStatus::Up) {
            self.target_status.lock().await.take();
        }
        Ok(PowerView::classify(&status))
    }

    pub async fn power_on(&self) -> Result<PowerOutcome, PowerError> {
        self.target_status.lock().await.take();

        if self.query_power().await?.is_on() {
            info!(vm = %self.vm.name, "VM is already on");
            return Ok(PowerOutcome::AlreadySatisfied);
        }

        let result = self.lifecycle.start(&self.vm.id).await;
        self.absorb_conflict(result, "start")?;
        info!(vm = %self.vm.name, vm_id = %self.vm.id, "Powered on");
        Ok(PowerOutcome::Done)
    }

    /// Hard power-off
    pub async fn power_off(&self) -> Result<PowerOutcome, PowerError> {
        if !self.query_power().await?.is_on() {
            info!(vm = %self.vm.name, "VM is already off");
            return Ok(PowerOutcome::AlreadySatisfied);
        }

        let result = self.lifecycle.stop(&self.vm.id).await;
        self.absorb_conflict(result, "stop")?;
        info!(vm = %self.vm.name, vm_id = %self.vm.id, "Powered off");
        Ok(PowerOutcome::Done)
    }

    /// Soft shutdown through the guest
    pub async fn graceful_shutdown(&self) -> Result<PowerOutcome, PowerError> {
        let view = self.query_power().await?;

        if *self.target_status.lock().await == Some(PowerView::Off) {
            info!(vm = %self.vm.name, "Shutdown already requested");
            return Ok(PowerOutcome::AlreadySatisfied);
        }

        if !view.is_on() {
            info!(vm = %self.vm.name, "VM is already off");
            return Ok(PowerOutcome::AlreadySatisfied);
        }

        *self.target_status.lock().await = Some(PowerView::Off);
        let result = self.lifecycle.shutdown(&self.vm.id).await;
        if let Err(e) = self.absorb_conflict(result, "shutdown") {
            self.target_status.lock().await.take();
            return Err(e);
        }
        info!(vm = %self.vm.name, vm_id = %self.vm.id, "Requested graceful shutdown");
        Ok(PowerOutcome::Done)
    }

    /// Hard reset of a running VM
    pub async fn power_reset(&self) -> Result<PowerOutcome, PowerError> {
        if !self.query_power().await?.is_on() {
            info!(vm = %self.vm.name, "Reset requested while off");
            return Ok(PowerOutcome::AlreadySatisfied);
        }

        self.target_status.lock().await.take();
        let result = self.lifecycle.reset(&self.vm.id).await;
        self.absorb_conflict(result, "reset")?;
        info!(vm = %self.vm.name, vm_id = %self.vm.id, "Reset");
        Ok(PowerOutcome::Done)
    }

    /// Power cycle is not offered for VMs
    pub async fn power_cycle(&self) -> Result<PowerOutcome, PowerError> {
        warn!(vm = %self.vm.name, "Power cycle is not supported");
        Err(PowerError::Unsupported("power cycle"))
    }

    /// Cold reset of the emulated BMC; the VM is left untouched
    pub fn cold_reset(&self) -> PowerOutcome {
        info!(vm = %self.vm.name, "BMC cold reset requested, VM left untouched");
        PowerOutcome::Done
    }

    pub async fn get_boot_device(&self) -> Result<BootDevice, PowerError> {
        let device = self.lifecycle.get_boot_device(&self.vm.id).await?;
        info!(vm = %self.vm.name, device = %device, "Reporting boot device");
        Ok(device)
    }

    pub async fn set_boot_device(&self, device: BootDevice) -> Result<PowerOutcome, PowerError> {
        self.lifecycle.set_boot_device(&self.vm.id, &device).await?;
        info!(vm = %self.vm.name, device = %device, "Set boot device");
        Ok(PowerOutcome::Done)
    }

    /// Treat a conflict as success: the VM is already where we want it
    fn absorb_conflict(
        &self,
        result: Result<(), LifecycleError>,
        action: &'static str,
    ) -> Result<(), PowerError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => {
                info!(vm = %self.vm.name, action, error = %e, "Ignoring conflict");
                Ok(())
            }
            Err(e) => {
                warn!(vm = %self.vm.name, action, error = %e, "Remote operation failed");
                Err(e.into())
            }
        }
    }
}
