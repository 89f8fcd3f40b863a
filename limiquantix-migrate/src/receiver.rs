//! Destination-side migration choreography (the receiver).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{instrument, warn};

use crate::collaborators::{AbortSource, ClusterDb, HypervisorOps, StorageOps, TaskSink};
use crate::error::{MigrationError, Result};
use crate::faults::{FaultInjector, FaultPoint};
use crate::ledger::DestLedger;
use crate::model::{MigrationSession, VbdMode, VmPowerState, VmRef};
use crate::wire;

#[derive(Clone)]
pub struct ReceiverDeps {
    pub cluster: Arc<dyn ClusterDb>,
    pub storage: Arc<dyn StorageOps>,
    pub hypervisor: Arc<dyn HypervisorOps>,
    pub task: Arc<dyn TaskSink>,
    pub abort: Arc<dyn AbortSource>,
    pub faults: Arc<dyn FaultInjector>,
}

/// Drive the destination side of a live migration for `vm`, landing it on
/// `this_host`.
///
/// On any failure before Barrier [1] is sent, the peer is told why over
/// `stream` so its own Barrier [1] wait fails promptly instead of timing
/// out against a silently closed connection.
#[instrument(skip(deps, stream), fields(vm = %vm.id, host = %this_host))]
pub async fn receive<S>(
    deps: &ReceiverDeps,
    session: &MigrationSession,
    vm: &VmRef,
    this_host: &str,
    stream: &mut S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let rw_vbds: Vec<_> = vm
        .vbds
        .iter()
        .filter(|v| v.mode == VbdMode::Rw)
        .collect();

    let mut ledger = DestLedger::new();

    if let Err(e) = attach_all(deps, &rw_vbds, &mut ledger).await {
        wire::send_error(stream, e.to_string()).await.ok();
        release(deps, &ledger).await;
        return Err(e);
    }

    let mut needs_activate = false;
    for vbd in &rw_vbds {
        match deps.storage.sr_has_activate_capability(&vbd.vdi.sr_id).await {
            Ok(true) => needs_activate = true,
            Ok(false) => {}
            Err(e) => {
                wire::send_error(stream, e.to_string()).await.ok();
                release(deps, &ledger).await;
                return Err(e);
            }
        }
    }
    // When the SR needs an explicit activate step, device restore must wait
    // until after activation -- the frontend devices aren't meaningful
    // against a disk that's only attached, not yet active.
    let delay_device_create = needs_activate;

    let domain = match deps.hypervisor.domain_create(&vm.boot_record).await {
        Ok(d) => d,
        Err(e) => {
            wire::send_error(stream, e.to_string()).await.ok();
            release(deps, &ledger).await;
            return Err(e);
        }
    };
    ledger.record_domain_created(domain.domid);

    if let Err(e) = deps
        .hypervisor
        .memory_reserve(domain.domid, vm.boot_record.memory_static_max_kib)
        .await
    {
        wire::send_error(stream, e.to_string()).await.ok();
        release(deps, &ledger).await;
        return Err(e);
    }

    if !delay_device_create {
        if let Err(e) = deps.hypervisor.restore_devices(domain.domid).await {
            wire::send_error(stream, e.to_string()).await.ok();
            release(deps, &ledger).await;
            return Err(e);
        }
    }

    // Barrier [1]: storage is attached and the domain shell exists --
    // the source may now suspend and start streaming the memory image.
    wire::send_success(stream).await?;

    if deps.faults.is_active(FaultPoint::BeforeMemoryRestore) {
        release(deps, &ledger).await;
        return Err(MigrationError::migrate_failed(
            &vm.id,
            this_host,
            this_host,
            "fault injection point 4 (before memory restore)",
        ));
    }

    if let Err(e) = deps.hypervisor.domain_restore(domain.domid, stream).await {
        release(deps, &ledger).await;
        return Err(e);
    }

    // Barrier [3]: the source has finished the disk handoff and the
    // domain here may unpause.
    if let Err(e) = wire::recv_success(stream).await {
        release(deps, &ledger).await;
        return Err(e);
    }

    if let Err(e) = activate_and_restore(deps, session, &rw_vbds, &mut ledger, domain.domid, delay_device_create).await
    {
        release_after_activate(deps, &ledger, session.is_localhost).await;
        return Err(e);
    }

    if let Err(e) = adopt(deps, session, vm, this_host, domain.domid).await {
        // Activation rollback is separate; detach is the outer cleanup --
        // the domain is adopted or mid-adopt here, never torn down again.
        release_detach_only(deps, &ledger).await;
        return Err(e);
    }

    // Barrier [4]: this side is fully running the VM.
    if let Err(e) = wire::send_success(stream).await {
        release_detach_only(deps, &ledger).await;
        return Err(e);
    }

    Ok(())
}

/// If not localhost, activate every VDI whose SR needs an explicit
/// activate step, recording each success so a later failure only
/// deactivates what was actually activated. Then, if device restore was
/// deferred until after activation, run it now.
async fn activate_and_restore(
    deps: &ReceiverDeps,
    session: &MigrationSession,
    rw_vbds: &[&crate::model::VbdRef],
    ledger: &mut DestLedger,
    domid: u32,
    delay_device_create: bool,
) -> Result<()> {
    if !session.is_localhost {
        for vbd in rw_vbds {
            if deps
                .storage
                .sr_has_activate_capability(&vbd.vdi.sr_id)
                .await
                .unwrap_or(false)
            {
                deps.storage.activate(&vbd.vdi.sr_id, &vbd.vdi.id).await?;
                ledger.record_activated(vbd.vdi.sr_id.clone(), vbd.vdi.id.clone());
            }
        }
    }

    if delay_device_create {
        deps.hypervisor.restore_devices(domid).await?;
    }

    Ok(())
}

async fn attach_all(
    deps: &ReceiverDeps,
    rw_vbds: &[&crate::model::VbdRef],
    ledger: &mut DestLedger,
) -> Result<()> {
    for vbd in rw_vbds {
        deps.storage
            .attach(&vbd.vdi.sr_id, &vbd.vdi.id, vbd.mode)
            .await?;
        ledger.record_attached(vbd.vdi.sr_id.clone(), vbd.vdi.id.clone());
    }
    Ok(())
}

async fn adopt(
    deps: &ReceiverDeps,
    session: &MigrationSession,
    vm: &VmRef,
    this_host: &str,
    domid: u32,
) -> Result<()> {
    deps.hypervisor.domain_unpause(domid).await?;

    if let Some(device) = &session.pci_device_to_unplug {
        deps.hypervisor.pci_plug(domid, device).await?;
    }

    deps.cluster.set_resident_on(&vm.id, this_host).await?;
    deps.cluster.set_domid(&vm.id, Some(domid)).await?;
    deps.cluster.set_power_state(&vm.id, VmPowerState::Running).await?;
    deps.cluster.set_protected(&vm.id, true).await?;

    if let Err(e) = deps.hypervisor.memory_rebalance().await {
        warn!(vm = %vm.id, error = %e, "memory rebalance after adopt failed (best effort)");
    }

    deps.task.set_progress(1.0).await?;
    Ok(())
}

/// Guaranteed-release path for a failed attach/create/pre-activate phase:
/// nothing has been activated yet, so this is destroy-domain + detach-all,
/// no deactivate.
async fn release(deps: &ReceiverDeps, ledger: &DestLedger) {
    if let Some(domid) = ledger.created_domid {
        if let Err(e) = deps.hypervisor.domain_destroy(domid, false).await {
            warn!(domid, error = %e, "domain destroy during release failed");
        }
    }
    for (sr_id, vdi_id) in &ledger.attached_vdis {
        if let Err(e) = deps.storage.detach(sr_id, vdi_id).await {
            warn!(vdi = %vdi_id, error = %e, "detach during release failed");
        }
    }
}

/// Guaranteed-release path for a failure during or right after
/// activation: best-effort deactivate whatever this side activated
/// (skipped on localhost, where the domain being destroyed is the only
/// consumer of that activation), then destroy the domain and detach all.
async fn release_after_activate(deps: &ReceiverDeps, ledger: &DestLedger, is_localhost: bool) {
    if !is_localhost {
        for (sr_id, vdi_id) in &ledger.activated_vdis {
            if let Err(e) = deps.storage.deactivate(sr_id, vdi_id).await {
                warn!(vdi = %vdi_id, error = %e, "deactivate during release failed");
            }
        }
    }
    if let Some(domid) = ledger.created_domid {
        if let Err(e) = deps.hypervisor.domain_destroy(domid, false).await {
            warn!(domid, error = %e, "domain destroy during release failed");
        }
    }
    for (sr_id, vdi_id) in &ledger.attached_vdis {
        if let Err(e) = deps.storage.detach(sr_id, vdi_id).await {
            warn!(vdi = %vdi_id, error = %e, "detach during release failed");
        }
    }
}

/// Guaranteed-release path for a failure at or after adopt: the domain is
/// adopted or in the process of being adopted on this side, so it is not
/// torn down here. Only detach runs -- the outer cleanup for storage this
/// side attached, regardless of what happens to the domain.
async fn release_detach_only(deps: &ReceiverDeps, ledger: &DestLedger) {
    for (sr_id, vdi_id) in &ledger.attached_vdis {
        if let Err(e) = deps.storage.detach(sr_id, vdi_id).await {
            warn!(vdi = %vdi_id, error = %e, "detach during release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mock::{
        MockAbortSource, MockClusterDb, MockHypervisorOps, MockStorageOps, MockTaskSink,
    };
    use crate::faults::NoFaults;
    use crate::model::{BootRecord, VbdRef, VdiRef};
    use std::collections::HashMap;
    use tokio::io::duplex;

    fn vm_fixture() -> VmRef {
        VmRef {
            id: "vm-1".into(),
            power_state: VmPowerState::Suspended,
            resident_on: "host-a".into(),
            domid: None,
            boot_record: BootRecord {
                name: "vm-1".into(),
                memory_static_max_kib: 1024 * 1024,
                vcpus: 2,
                hvm: true,
            },
            vbds: vec![VbdRef {
                id: "vbd-1".into(),
                vdi: VdiRef {
                    id: "vdi-1".into(),
                    sr_id: "sr-1".into(),
                    sr_has_activate_capability: false,
                },
                mode: VbdMode::Rw,
                currently_attached: false,
                empty: false,
                paused: false,
                device: None,
            }],
            other_config: HashMap::new(),
        }
    }

    fn deps() -> (ReceiverDeps, Arc<MockClusterDb>, Arc<MockStorageOps>) {
        let cluster = Arc::new(MockClusterDb::new());
        let storage = Arc::new(MockStorageOps::new());
        let deps = ReceiverDeps {
            cluster: cluster.clone(),
            storage: storage.clone(),
            hypervisor: Arc::new(MockHypervisorOps::default()),
            task: Arc::new(MockTaskSink::new()),
            abort: Arc::new(MockAbortSource::new()),
            faults: Arc::new(NoFaults),
        };
        (deps, cluster, storage)
    }

    #[tokio::test]
    async fn happy_path_lands_vm_running_here() {
        let (deps, cluster, _storage) = deps();
        let vm = vm_fixture();
        cluster.insert_vm(vm.clone());
        let session = MigrationSession::new("vm-1", false, true);

        let (mut local, mut remote) = duplex(256);
        let driver = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            wire::recv_success(&mut remote).await.unwrap(); // Barrier [1]
            remote.write_all(b"MEMIMG").await.unwrap(); // memory image
            remote.flush().await.unwrap();
            wire::send_success(&mut remote).await.unwrap(); // Barrier [3]
            wire::recv_success(&mut remote).await.unwrap(); // Barrier [4]
        });

        receive(&deps, &session, &vm, "host-b", &mut local).await.unwrap();
        driver.await.unwrap();

        let updated = cluster.get_vm("vm-1").await.unwrap();
        assert_eq!(updated.power_state, VmPowerState::Running);
        assert_eq!(updated.resident_on, "host-b");
    }

    #[tokio::test]
    async fn attach_failure_notifies_peer_and_never_creates_domain() {
        let (deps, cluster, storage) = deps();
        storage.fail_attach_for("vdi-1");
        let vm = vm_fixture();
        cluster.insert_vm(vm.clone());
        let session = MigrationSession::new("vm-1", false, true);

        let (mut local, mut remote) = duplex(256);
        let err = receive(&deps, &session, &vm, "host-b", &mut local).await.unwrap_err();
        assert!(matches!(err, MigrationError::StorageFailed { .. }));

        let handshake = wire::recv(&mut remote).await.unwrap();
        assert!(matches!(handshake, wire::Handshake::Error(_)));
    }

    #[tokio::test]
    async fn fault_point_4_destroys_domain_and_detaches() {
        let (mut deps, cluster, storage) = deps();
        let cfg = HashMap::from([(
            crate::faults::OtherConfigFaultInjector::KEY.to_string(),
            "4".to_string(),
        )]);
        deps.faults = Arc::new(crate::faults::OtherConfigFaultInjector::from_other_config(&cfg));
        let hv = Arc::new(MockHypervisorOps::default());
        deps.hypervisor = hv.clone();
        let vm = vm_fixture();
        cluster.insert_vm(vm.clone());
        let session = MigrationSession::new("vm-1", false, true);

        let (mut local, mut remote) = duplex(256);
        let driver = tokio::spawn(async move {
            wire::recv_success(&mut remote).await.unwrap(); // Barrier [1]
        });

        let err = receive(&deps, &session, &vm, "host-b", &mut local).await.unwrap_err();
        driver.await.unwrap();

        assert!(matches!(err, MigrationError::VmMigrateFailed { .. }));
        assert!(!storage.is_attached("sr-1", "vdi-1"));
        assert!(!hv.has_domain(1), "proto-domain must be destroyed on a pre-activate failure");
    }

    #[tokio::test]
    async fn activate_failure_deactivates_destroys_and_detaches() {
        let (mut deps, cluster, storage) = deps();
        storage.set_activate_capability("sr-1", true);
        storage.fail_activate_for("vdi-1");
        let hv = Arc::new(MockHypervisorOps::default());
        deps.hypervisor = hv.clone();
        let vm = vm_fixture();
        cluster.insert_vm(vm.clone());
        let session = MigrationSession::new("vm-1", false, true);

        let (mut local, mut remote) = duplex(256);
        let driver = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            wire::recv_success(&mut remote).await.unwrap(); // Barrier [1]
            remote.write_all(b"MEMIMG").await.unwrap();
            remote.flush().await.unwrap();
            wire::send_success(&mut remote).await.unwrap(); // Barrier [3]
        });

        let err = receive(&deps, &session, &vm, "host-b", &mut local).await.unwrap_err();
        driver.await.unwrap();

        assert!(matches!(err, MigrationError::StorageFailed { .. }));
        assert!(!storage.is_attached("sr-1", "vdi-1"));
        assert!(!storage.is_activated("sr-1", "vdi-1"));
        assert!(!hv.has_domain(1), "domain must be destroyed on an activate-phase failure");
    }

    /// Scenario S5: the destination crashes after restore. The source
    /// still completes through Barrier [3], the receiver continues, and
    /// `domain_unpause` inside `adopt` observes the crashed domain. The
    /// terminal status is failure, and only detach runs -- the domain
    /// itself is left alone for adopt-phase rollback.
    #[tokio::test]
    async fn destination_crash_after_restore_detaches_without_destroying_domain() {
        let (mut deps, cluster, storage) = deps();
        let cfg = HashMap::from([(
            crate::faults::OtherConfigFaultInjector::KEY.to_string(),
            "5".to_string(),
        )]);
        let injector = crate::faults::OtherConfigFaultInjector::from_other_config(&cfg);
        let hv = Arc::new(MockHypervisorOps::new(Box::new(injector)));
        deps.hypervisor = hv.clone();
        let vm = vm_fixture();
        cluster.insert_vm(vm.clone());
        let session = MigrationSession::new("vm-1", false, true);

        let (mut local, mut remote) = duplex(256);
        let driver = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            wire::recv_success(&mut remote).await.unwrap(); // Barrier [1]
            remote.write_all(b"MEMIMG").await.unwrap();
            remote.flush().await.unwrap();
            wire::send_success(&mut remote).await.unwrap(); // Barrier [3]
        });

        let err = receive(&deps, &session, &vm, "host-b", &mut local).await.unwrap_err();
        driver.await.unwrap();

        assert!(matches!(err, MigrationError::DomainShutdownForWrongReason(_)));
        assert!(!storage.is_attached("sr-1", "vdi-1"));
        assert!(hv.has_domain(1), "adopt-phase rollback must not destroy the domain");
    }
}
