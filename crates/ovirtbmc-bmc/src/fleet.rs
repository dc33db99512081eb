//! Fleet of emulated BMCs
//!
//! [`BmcFleet`] owns every [`BmcSession`] of the process. Sessions are
//! created one after another; an entry whose VM cannot be resolved or whose
//! port cannot be bound is reported and skipped. Once started, each session
//! runs on its own task and all of them share one shutdown signal.

use crate::config::BmcInstanceConfig;
use crate::error::{BmcError, Result};
use crate::lookup::LookupPolicy;
use crate::session::BmcSession;
use ovirtbmc_ipmi::ServerExit;
use ovirtbmc_ovirt::VmLifecycle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tracing::{error, info, warn};

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// Fleet-wide shutdown
    Shutdown,
    /// The BMC received a cold reset
    ColdReset,
    /// The listener failed
    Failed(String),
}

/// Exit report of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub vm_name: String,
    pub exit: SessionExit,
}

/// Handle that stops every session of a fleet
#[derive(Debug, Clone)]
pub struct StopHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Signal shutdown to every session
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Owner of all BMC sessions
pub struct BmcFleet {
    pending: Vec<BmcSession>,
    local_addrs: Vec<(String, SocketAddr)>,
    failures: Vec<BmcError>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: JoinSet<SessionReport>,
    task_names: HashMap<Id, String>,
}

impl BmcFleet {
    /// Create one session per instance
    ///
    /// Fails only when no session at all could be created.
    pub async fn build(
        instances: &[BmcInstanceConfig],
        lifecycle: Arc<dyn VmLifecycle>,
        policy: &LookupPolicy,
    ) -> Result<Self> {
        let mut pending = Vec::with_capacity(instances.len());
        let mut failures = Vec::new();

        for instance in instances {
            match BmcSession::create(instance, lifecycle.clone(), policy).await {
                Ok(session) => pending.push(session),
                Err(e) => {
                    error!(vm = %instance.vm_name, port = instance.port, error = %e, "Failed to create BMC");
                    failures.push(e);
                }
            }
        }

        if pending.is_empty() {
            return Err(BmcError::NoSessions {
                failed: failures.len(),
            });
        }

        let local_addrs = pending
            .iter()
            .map(|s| (s.vm().name.clone(), s.local_addr()))
            .collect();
        let (shutdown, _) = watch::channel(false);

        info!(
            sessions = pending.len(),
            failed = failures.len(),
            "BMC fleet created"
        );

        Ok(Self {
            pending,
            local_addrs,
            failures,
            shutdown: Arc::new(shutdown),
            tasks: JoinSet::new(),
            task_names: HashMap::new(),
        })
    }

    /// Entries that could not be created
    pub fn failures(&self) -> &[BmcError] {
        &self.failures
    }

    /// Bound address of every created session, by VM name
    pub fn local_addrs(&self) -> &[(String, SocketAddr)] {
        &self.local_addrs
    }

    /// Bound address of one VM's BMC
    pub fn local_addr(&self, vm_name: &str) -> Option<SocketAddr> {
        self.local_addrs
            .iter()
            .find(|(name, _)| name == vm_name)
            .map(|(_, addr)| *addr)
    }

    /// Spawn every created session on its own task
    pub fn start_all(&mut self) {
        for session in self.pending.drain(..) {
            let vm_name = session.vm().name.clone();
            let shutdown = self.shutdown.subscribe();
            let name = vm_name.clone();

            let handle = self.tasks.spawn(async move {
                let exit = match session.run(shutdown).await {
                    Ok(ServerExit::Shutdown) => SessionExit::Shutdown,
                    Ok(ServerExit::ColdReset) => SessionExit::ColdReset,
                    Err(e) => {
                        error!(vm = %name, error = %e, "BMC session failed");
                        SessionExit::Failed(e.to_string())
                    }
                };
                SessionReport {
                    vm_name: name,
                    exit,
                }
            });
            self.task_names.insert(handle.id(), vm_name);
        }
        info!(sessions = self.tasks.len(), "BMC fleet started");
    }

    /// Handle for stopping the fleet from another task
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Signal shutdown to every session
    pub fn stop_all(&self) {
        info!("Stopping BMC fleet");
        self.shutdown.send_replace(true);
    }

    /// Wait for every started session to end
    ///
    /// Reports are ordered by VM name.
    pub async fn await_all(&mut self) -> Vec<SessionReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next_with_id().await {
            let report = match joined {
                Ok((id, report)) => {
                    self.task_names.remove(&id);
                    report
                }
                Err(e) => {
                    let vm_name = self
                        .task_names
                        .remove(&e.id())
                        .unwrap_or_else(|| "unknown".to_string());
                    warn!(vm = %vm_name, error = %e, "BMC session task did not complete");
                    let reason = BmcError::Task {
                        vm: vm_name.clone(),
                        reason: e.to_string(),
                    };
                    SessionReport {
                        vm_name,
                        exit: SessionExit::Failed(reason.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        reports.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
        reports
    }
}
