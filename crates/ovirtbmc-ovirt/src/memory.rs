//! In-memory VM lifecycle
//!
//! A [`VmLifecycle`] backed by a map of VMs, used for tests and dry runs.
//! State transitions are immediate: `start` makes a VM `up`, `stop` makes
//! it `down` and `shutdown` leaves it `powering_down` until the test moves
//! it on with [`MemoryVmLifecycle::set_status`]. Every call is recorded.

use crate::client::VmLifecycle;
use crate::error::{LifecycleError, Result};
use crate::types::{BootDevice, VmIdentity, VmStatus};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lifecycle operation, for call recording and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FindByName,
    GetStatus,
    Start,
    Stop,
    Shutdown,
    Reset,
    SetBootDevice,
    GetBootDevice,
}

/// A recorded call: operation plus VM id (or name, for lookups)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    pub target: String,
}

#[derive(Debug, Clone)]
struct MemoryVm {
    name: String,
    status: VmStatus,
    boot: Vec<String>,
}

/// In-memory VM lifecycle
#[derive(Debug, Default)]
pub struct MemoryVmLifecycle {
    vms: Mutex<HashMap<String, MemoryVm>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<Operation, VecDeque<LifecycleError>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_running(status: &VmStatus) -> bool {
    matches!(
        status,
        VmStatus::Up | VmStatus::PoweringUp | VmStatus::WaitForLaunch
    )
}

impl MemoryVmLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a VM booting from disk
    pub fn add_vm(&self, name: &str, id: &str, status: VmStatus) -> VmIdentity {
        lock(&self.vms).insert(
            id.to_string(),
            MemoryVm {
                name: name.to_string(),
                status,
                boot: vec!["hd".to_string()],
            },
        );
        VmIdentity::new(name, id)
    }

    /// Force the status of a VM
    pub fn set_status(&self, id: &str, status: VmStatus) {
        if let Some(vm) = lock(&self.vms).get_mut(id) {
            vm.status = status;
        }
    }

    /// Current status of a VM
    pub fn status(&self, id: &str) -> Option<VmStatus> {
        lock(&self.vms).get(id).map(|vm| vm.status.clone())
    }

    /// Replace the configured boot devices of a VM
    pub fn set_boot_devices(&self, id: &str, devices: &[&str]) {
        if let Some(vm) = lock(&self.vms).get_mut(id) {
            vm.boot = devices.iter().map(|d| d.to_string()).collect();
        }
    }

    /// Make the next call of `operation` fail with `error`
    ///
    /// Injected failures queue up and are consumed one per call.
    pub fn fail_next(&self, operation: Operation, error: LifecycleError) {
        lock(&self.failures)
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// All recorded calls, oldest first
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Number of calls of `operation` against `target`
    pub fn call_count(&self, operation: Operation, target: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation && c.target == target)
            .count()
    }

    fn record(&self, operation: Operation, target: &str) -> Result<()> {
        lock(&self.calls).push(Call {
            operation,
            target: target.to_string(),
        });
        match lock(&self.failures)
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn with_vm<T>(&self, id: &str, f: impl FnOnce(&mut MemoryVm) -> Result<T>) -> Result<T> {
        let mut vms = lock(&self.vms);
        let vm = vms
            .get_mut(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        f(vm)
    }
}

#[async_trait]
impl VmLifecycle for MemoryVmLifecycle {
    async fn find_by_name(&self, name: &str) -> Result<VmIdentity> {
        self.record(Operation::FindByName, name)?;
        let vms = lock(&self.vms);
        let matches: Vec<&String> = vms
            .iter()
            .filter(|(_, vm)| vm.name == name)
            .map(|(id, _)| id)
            .collect();
        match matches.as_slice() {
            [] => Err(LifecycleError::NotFound(name.to_string())),
            [id] => Ok(VmIdentity::new(name, id.as_str())),
            many => Err(LifecycleError::Ambiguous {
                name: name.to_string(),
                count: many.len(),
            }),
        }
    }

    async fn get_status(&self, id: &str) -> Result<VmStatus> {
        self.record(Operation::GetStatus, id)?;
        self.with_vm(id, |vm| Ok(vm.status.clone()))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(Operation::Start, id)?;
        self.with_vm(id, |vm| {
            if is_running(&vm.status) {
                return Err(LifecycleError::Conflict("VM is running".to_string()));
            }
            vm.status = VmStatus::Up;
            Ok(())
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.record(Operation::Stop, id)?;
        self.with_vm(id, |vm| {
            if vm.status == VmStatus::Down {
                return Err(LifecycleError::Conflict("VM is down".to_string()));
            }
            vm.status = VmStatus::Down;
            Ok(())
        })
    }

    async fn shutdown(&self, id: &str) -> Result<()> {
        self.record(Operation::Shutdown, id)?;
        self.with_vm(id, |vm| {
            if vm.status == VmStatus::Down {
                return Err(LifecycleError::Conflict("VM is down".to_string()));
            }
            vm.status = VmStatus::PoweringDown;
            Ok(())
        })
    }

    async fn reset(&self, id: &str) -> Result<()> {
        self.record(Operation::Reset, id)?;
        self.with_vm(id, |vm| {
            if vm.status != VmStatus::Up {
                return Err(LifecycleError::Conflict("VM is not running".to_string()));
            }
            Ok(())
        })
    }

    async fn set_boot_device(&self, id: &str, device: &BootDevice) -> Result<()> {
        self.record(Operation::SetBootDevice, id)?;
        if let BootDevice::Unsupported(name) = device {
            return Err(LifecycleError::InvalidConfig(format!(
                "cannot set unsupported boot device {}",
                name
            )));
        }
        self.with_vm(id, |vm| {
            vm.boot = vec![device.as_remote().to_string()];
            Ok(())
        })
    }

    async fn get_boot_device(&self, id: &str) -> Result<BootDevice> {
        self.record(Operation::GetBootDevice, id)?;
        self.with_vm(id, |vm| {
            Ok(vm
                .boot
                .first()
                .map(|d| BootDevice::from_remote(d))
                .unwrap_or_else(|| BootDevice::Unsupported("none".to_string())))
        })
    }
}
