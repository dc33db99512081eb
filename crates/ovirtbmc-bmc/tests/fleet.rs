mod common;

use common::IpmiTestClient;
use ovirtbmc_bmc::{
    listen_address, BmcFleet, BmcInstanceConfig, LookupPolicy, SessionExit, SessionReport,
};
use ovirtbmc_ipmi::CompletionCode;
use ovirtbmc_ovirt::{LifecycleError, MemoryVmLifecycle, Operation, VmStatus};
use std::sync::Arc;
use std::time::Duration;

fn instance(name: &str, username: &str, password: &str) -> BmcInstanceConfig {
    BmcInstanceConfig {
        vm_name: name.to_string(),
        listen: listen_address("127.0.0.1").unwrap(),
        port: 0,
        username: username.to_string(),
        password: password.to_string(),
    }
}

async fn fleet(lifecycle: &Arc<MemoryVmLifecycle>) -> BmcFleet {
    let instances = [
        instance("vmA", "admin", "password"),
        instance("vmB", "operator", "hunter2"),
    ];
    let mut fleet = BmcFleet::build(&instances, lifecycle.clone(), &LookupPolicy::default())
        .await
        .unwrap();
    fleet.start_all();
    fleet
}

async fn open(fleet: &BmcFleet, vm: &str, username: &str, password: &str) -> IpmiTestClient {
    let addr = fleet.local_addr(vm).unwrap();
    IpmiTestClient::open(addr, username, password)
        .await
        .expect("session should open")
}

async fn finish(mut fleet: BmcFleet) -> Vec<SessionReport> {
    fleet.stop_all();
    tokio::time::timeout(Duration::from_secs(5), fleet.await_all())
        .await
        .unwrap()
}

fn two_vms() -> Arc<MemoryVmLifecycle> {
    let lifecycle = Arc::new(MemoryVmLifecycle::new());
    lifecycle.add_vm("vmA", "id-a", VmStatus::Down);
    lifecycle.add_vm("vmB", "id-b", VmStatus::Down);
    lifecycle
}

#[tokio::test]
async fn power_on_reaches_only_the_addressed_vm() {
    let lifecycle = two_vms();
    let fleet = fleet(&lifecycle).await;

    let mut vm_a = open(&fleet, "vmA", "admin", "password").await;
    let mut vm_b = open(&fleet, "vmB", "operator", "hunter2").await;

    assert_eq!(vm_a.power_state().await, Ok(false));
    assert_eq!(vm_a.chassis_control(0x01).await, Some(CompletionCode::NORMAL));
    assert_eq!(vm_a.power_state().await, Ok(true));

    assert_eq!(lifecycle.status("id-a"), Some(VmStatus::Up));
    assert_eq!(lifecycle.status("id-b"), Some(VmStatus::Down));
    assert_eq!(lifecycle.call_count(Operation::Start, "id-a"), 1);
    assert_eq!(lifecycle.call_count(Operation::Start, "id-b"), 0);
    assert_eq!(vm_b.power_state().await, Ok(false));

    // Already on: accepted without another start
    assert_eq!(vm_a.chassis_control(0x01).await, Some(CompletionCode::NORMAL));
    assert_eq!(lifecycle.call_count(Operation::Start, "id-a"), 1);

    finish(fleet).await;
}

#[tokio::test]
async fn soft_off_reset_and_cycle_codes() {
    let lifecycle = two_vms();
    lifecycle.set_status("id-a", VmStatus::Up);
    let fleet = fleet(&lifecycle).await;
    let mut vm_a = open(&fleet, "vmA", "admin", "password").await;

    assert_eq!(vm_a.chassis_control(0x05).await, Some(CompletionCode::NORMAL));
    assert_eq!(
        vm_a.chassis_control(0x05).await,
        Some(CompletionCode::NOT_SUPPORTED_IN_PRESENT_STATE)
    );
    assert_eq!(lifecycle.call_count(Operation::Shutdown, "id-a"), 1);

    assert_eq!(
        vm_a.chassis_control(0x02).await,
        Some(CompletionCode::INVALID_COMMAND)
    );

    lifecycle.set_status("id-a", VmStatus::Down);
    assert_eq!(
        vm_a.chassis_control(0x03).await,
        Some(CompletionCode::NOT_SUPPORTED_IN_PRESENT_STATE)
    );
    assert_eq!(lifecycle.call_count(Operation::Reset, "id-a"), 0);

    finish(fleet).await;
}

#[tokio::test]
async fn boot_device_over_ipmi() {
    let lifecycle = two_vms();
    let fleet = fleet(&lifecycle).await;
    let mut vm_a = open(&fleet, "vmA", "admin", "password").await;

    assert_eq!(vm_a.set_boot_device(0x1).await, Some(CompletionCode::NORMAL));
    assert_eq!(vm_a.boot_device().await, Ok(0x1));

    assert_eq!(vm_a.set_boot_device(0x2).await, Some(CompletionCode::NORMAL));
    assert_eq!(vm_a.boot_device().await, Ok(0x2));

    lifecycle.set_boot_devices("id-a", &["cdrom"]);
    assert_eq!(
        vm_a.boot_device().await,
        Err(CompletionCode::PARAMETER_NOT_SUPPORTED)
    );

    finish(fleet).await;
}

#[tokio::test]
async fn remote_failure_keeps_session_alive() {
    let lifecycle = two_vms();
    let fleet = fleet(&lifecycle).await;
    let mut vm_a = open(&fleet, "vmA", "admin", "password").await;

    lifecycle.fail_next(
        Operation::GetStatus,
        LifecycleError::Network("connection reset".to_string()),
    );
    assert_eq!(
        vm_a.power_state().await,
        Err(CompletionCode::UNSPECIFIED_ERROR)
    );
    assert_eq!(vm_a.power_state().await, Ok(false));

    finish(fleet).await;
}

#[tokio::test]
async fn cold_reset_stops_one_bmc() {
    let lifecycle = two_vms();
    lifecycle.set_status("id-a", VmStatus::Up);
    let fleet = fleet(&lifecycle).await;

    let mut vm_a = open(&fleet, "vmA", "admin", "password").await;
    let mut vm_b = open(&fleet, "vmB", "operator", "hunter2").await;

    assert_eq!(vm_a.cold_reset().await, Some(CompletionCode::NORMAL));
    assert_eq!(vm_b.power_state().await, Ok(false));

    // The VM itself is untouched
    assert_eq!(lifecycle.status("id-a"), Some(VmStatus::Up));

    let reports = finish(fleet).await;
    assert_eq!(
        reports,
        vec![
            SessionReport {
                vm_name: "vmA".to_string(),
                exit: SessionExit::ColdReset,
            },
            SessionReport {
                vm_name: "vmB".to_string(),
                exit: SessionExit::Shutdown,
            },
        ]
    );
}

#[tokio::test]
async fn wrong_password_is_ignored() {
    let lifecycle = two_vms();
    let fleet = fleet(&lifecycle).await;

    let addr = fleet.local_addr("vmA").unwrap();
    assert!(IpmiTestClient::open(addr, "admin", "wrong").await.is_none());
    // vmB's credentials do not open vmA
    assert!(IpmiTestClient::open(addr, "operator", "hunter2").await.is_none());
    assert!(lifecycle
        .calls()
        .iter()
        .all(|c| c.operation == Operation::FindByName));

    finish(fleet).await;
}

#[tokio::test]
async fn missing_vm_does_not_stop_the_fleet() {
    let lifecycle = two_vms();
    let instances = [
        instance("vmA", "admin", "password"),
        instance("vmZ", "admin", "password"),
    ];
    let mut fleet = BmcFleet::build(&instances, lifecycle.clone(), &LookupPolicy::default())
        .await
        .unwrap();
    assert_eq!(fleet.failures().len(), 1);
    fleet.start_all();

    let mut vm_a = open(&fleet, "vmA", "admin", "password").await;
    assert_eq!(vm_a.power_state().await, Ok(false));

    let reports = finish(fleet).await;
    assert_eq!(reports.len(), 1);
}
