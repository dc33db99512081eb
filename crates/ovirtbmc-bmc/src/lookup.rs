//! VM lookup with bounded retry

use ovirtbmc_ovirt::{LifecycleError, VmIdentity, VmLifecycle};
use std::time::Duration;
use tracing::{info, warn};

/// Retry policy for resolving a VM at session startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay after the first failure; doubles after each further failure
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LookupPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl LookupPolicy {
    pub fn new(attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Delay before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Resolve a VM by name, retrying transient failures
///
/// `NotFound` and `Ambiguous` are definitive and returned immediately.
pub async fn resolve_vm(
    lifecycle: &dyn VmLifecycle,
    name: &str,
    policy: &LookupPolicy,
) -> Result<VmIdentity, LifecycleError> {
    let mut attempt = 1;
    loop {
        match lifecycle.find_by_name(name).await {
            Ok(vm) => {
                info!(vm = %vm.name, vm_id = %vm.id, "Managing VM");
                return Ok(vm);
            }
            Err(e) if !e.is_retryable() || attempt >= policy.attempts => return Err(e),
            Err(e) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    vm = %name,
                    error = %e,
                    attempt,
                    attempts = policy.attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "VM lookup failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
