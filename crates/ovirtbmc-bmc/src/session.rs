//! One emulated BMC
//!
//! A [`BmcSession`] binds one UDP endpoint and one credential pair to one
//! VM. Chassis callbacks from the IPMI listener go through [`BmcHandler`],
//! which drives the VM's [`PowerStateMachine`] and turns every outcome into
//! a completion code:
//!
//! | Outcome | Completion code |
//! |---------|-----------------|
//! | done, or power on/off already satisfied | `0x00` |
//! | shutdown or reset while already off | `0xd5` |
//! | power cycle | `0xc1` |
//! | unknown boot selector | `0xcc` |
//! | remote boot device other than network/disk | `0x80` |
//! | remote failure | `0xff` |

use crate::config::BmcInstanceConfig;
use crate::error::{BmcError, PowerError, Result};
use crate::lookup::{resolve_vm, LookupPolicy};
use crate::power::{PowerOutcome, PowerStateMachine};
use async_trait::async_trait;
use ovirtbmc_ipmi::{
    bind_udp, BootSelector, ChassisHandler, CommandResult, CompletionCode, IpmiError, IpmiServer,
    ServerExit,
};
use ovirtbmc_ovirt::{BootDevice, VmIdentity, VmLifecycle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// `ChassisHandler` for one VM
pub struct BmcHandler {
    power: PowerStateMachine,
    port: u16,
}

impl BmcHandler {
    pub fn new(power: PowerStateMachine, port: u16) -> Self {
        Self { power, port }
    }

    fn vm(&self) -> &str {
        &self.power.vm().name
    }

    fn log_command(&self, command: &'static str) {
        info!(vm = %self.vm(), port = self.port, command, "IPMI command");
    }

    fn fail(&self, command: &'static str, err: PowerError) -> CompletionCode {
        let code = match &err {
            PowerError::Remote(_) => CompletionCode::UNSPECIFIED_ERROR,
            PowerError::Unsupported(_) => CompletionCode::INVALID_COMMAND,
        };
        warn!(vm = %self.vm(), port = self.port, command, error = %err, code = %code, "IPMI command failed");
        code
    }
}

#[async_trait]
impl ChassisHandler for BmcHandler {
    async fn get_power_state(&self) -> CommandResult<bool> {
        debug!(vm = %self.vm(), port = self.port, command = "get_power_state", "IPMI command");
        self.power
            .query_power()
            .await
            .map(|view| view.is_on())
            .map_err(|e| self.fail("get_power_state", e))
    }

    async fn power_on(&self) -> CommandResult {
        self.log_command("power_on");
        self.power
            .power_on()
            .await
            .map(|_| ())
            .map_err(|e| self.fail("power_on", e))
    }

    async fn power_off(&self) -> CommandResult {
        self.log_command("power_off");
        self.power
            .power_off()
            .await
            .map(|_| ())
            .map_err(|e| self.fail("power_off", e))
    }

    async fn power_cycle(&self) -> CommandResult {
        self.log_command("power_cycle");
        self.power
            .power_cycle()
            .await
            .map(|_| ())
            .map_err(|e| self.fail("power_cycle", e))
    }

    async fn power_reset(&self) -> CommandResult {
        self.log_command("power_reset");
        match self.power.power_reset().await {
            Ok(PowerOutcome::Done) => Ok(()),
            Ok(PowerOutcome::AlreadySatisfied) => Err(CompletionCode::NOT_SUPPORTED_IN_PRESENT_STATE),
            Err(e) => Err(self.fail("power_reset", e)),
        }
    }

    async fn power_shutdown(&self) -> CommandResult {
        self.log_command("power_shutdown");
        match self.power.graceful_shutdown().await {
            Ok(PowerOutcome::Done) => Ok(()),
            Ok(PowerOutcome::AlreadySatisfied) => Err(CompletionCode::NOT_SUPPORTED_IN_PRESENT_STATE),
            Err(e) => Err(self.fail("power_shutdown", e)),
        }
    }

    async fn cold_reset(&self) -> CommandResult {
        self.log_command("cold_reset");
        self.power.cold_reset();
        Ok(())
    }

    async fn get_boot_device(&self) -> CommandResult<BootSelector> {
        self.log_command("get_boot_device");
        match self.power.get_boot_device().await {
            Ok(BootDevice::Network) => Ok(BootSelector::Pxe),
            Ok(BootDevice::Disk) => Ok(BootSelector::Disk),
            Ok(BootDevice::Unsupported(name)) => {
                warn!(vm = %self.vm(), port = self.port, device = %name, "Boot device has no IPMI equivalent");
                Err(CompletionCode::PARAMETER_NOT_SUPPORTED)
            }
            Err(e) => Err(self.fail("get_boot_device", e)),
        }
    }

    async fn set_boot_device(&self, device: BootSelector) -> CommandResult {
        self.log_command("set_boot_device");
        let target = match device {
            BootSelector::NoOverride => {
                debug!(vm = %self.vm(), "No boot override requested");
                return Ok(());
            }
            BootSelector::Pxe => BootDevice::Network,
            BootSelector::Disk => BootDevice::Disk,
            other => {
                warn!(vm = %self.vm(), port = self.port, device = ?other, "Unsupported boot device");
                return Err(CompletionCode::INVALID_DATA_FIELD);
            }
        };
        self.power
            .set_boot_device(target)
            .await
            .map(|_| ())
            .map_err(|e| self.fail("set_boot_device", e))
    }
}

/// Bind, falling back to plain IPv4 for IPv4-mapped addresses
///
/// Hosts without an IPv6 stack cannot bind `::ffff:a.b.c.d`.
fn bind_listener(addr: SocketAddr) -> std::result::Result<UdpSocket, IpmiError> {
    match bind_udp(addr) {
        Ok(socket) => Ok(socket),
        Err(e) => {
            let mapped = match addr {
                SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped(),
                SocketAddr::V4(_) => None,
            };
            match mapped {
                Some(v4) => {
                    let fallback = SocketAddr::new(v4.into(), addr.port());
                    warn!(addr = %addr, fallback = %fallback, error = %e, "IPv6 bind failed, using IPv4");
                    bind_udp(fallback)
                }
                None => Err(e),
            }
        }
    }
}

/// One emulated BMC bound to one VM
pub struct BmcSession {
    vm: VmIdentity,
    port: u16,
    local_addr: SocketAddr,
    server: IpmiServer,
}

impl BmcSession {
    /// Resolve the VM, build its state machine and bind the listener
    pub async fn create(
        config: &BmcInstanceConfig,
        lifecycle: Arc<dyn VmLifecycle>,
        policy: &LookupPolicy,
    ) -> Result<Self> {
        let listener_error = |source| BmcError::Listener {
            vm: config.vm_name.clone(),
            source,
        };

        let vm = resolve_vm(lifecycle.as_ref(), &config.vm_name, policy)
            .await
            .map_err(|source| BmcError::Lookup {
                vm: config.vm_name.clone(),
                source,
            })?;

        let credentials = config.credentials().map_err(listener_error)?;
        let handler = Arc::new(BmcHandler::new(
            PowerStateMachine::new(vm.clone(), lifecycle),
            config.port,
        ));

        let socket = bind_listener(config.bind_addr()).map_err(listener_error)?;
        let server = IpmiServer::new(socket, credentials, handler);
        let local_addr = server.local_addr().map_err(listener_error)?;

        info!(vm = %vm.name, vm_id = %vm.id, addr = %local_addr, "BMC listening");
        Ok(Self {
            vm,
            port: config.port,
            local_addr,
            server,
        })
    }

    /// The managed VM
    pub fn vm(&self) -> &VmIdentity {
        &self.vm
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve IPMI until shutdown or cold reset
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<ServerExit> {
        let vm = self.vm.name;
        let port = self.port;
        let exit = self
            .server
            .run(shutdown)
            .await
            .map_err(|source| BmcError::Listener {
                vm: vm.clone(),
                source,
            })?;
        info!(vm = %vm, port, exit = ?exit, "BMC stopped");
        Ok(exit)
    }
}
