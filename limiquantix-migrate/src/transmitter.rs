//! Source-side migration choreography (the transmitter).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{instrument, warn};

use crate::collaborators::{
    AbortSource, ClusterDb, HypervisorOps, PreShutdownCallback, ProgressCallback, StorageOps,
    TaskSink, TelemetrySink,
};
use crate::error::{MigrationError, Result, ShutdownReason};
use crate::faults::{FaultInjector, FaultPoint};
use crate::ledger::SourceLedger;
use crate::model::{MigrationSession, VbdMode, VmPowerState, VmRef};
use crate::progress::suspend_ack_channel;
use crate::wire;

/// Progress fraction past which a one-shot best-effort PCI hot-unplug
/// fires, absent an `other_config["pci-hotunplug-time"]` override.
const DEFAULT_PCI_HOTUNPLUG_TIME: f64 = 0.8;

/// Collaborators the transmitter needs, shared by `Arc` the same way
/// `limiquantix-hypervisor`'s `StorageManager` hands backends around --
/// cheap to clone into the callbacks the hypervisor invokes mid-suspend.
#[derive(Clone)]
pub struct TransmitterDeps {
    pub cluster: Arc<dyn ClusterDb>,
    pub storage: Arc<dyn StorageOps>,
    pub hypervisor: Arc<dyn HypervisorOps>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub task: Arc<dyn TaskSink>,
    pub abort: Arc<dyn AbortSource>,
    pub faults: Arc<dyn FaultInjector>,
}

/// Drive the source side of a live migration for `vm` to `dest_host` over
/// an already-connected `stream`.
///
/// Returns once the destination has confirmed the domain is running there
/// (Barrier [4]), or raises on any failure. Either way, this side's disks
/// and cluster-db record are left consistent -- the guaranteed-release
/// path runs on every error exit after the pre-suspend phase.
#[instrument(skip(deps, session, stream), fields(vm = %vm.id, dest = %dest_host))]
pub async fn transmit<S>(
    deps: &TransmitterDeps,
    session: &MigrationSession,
    vm: &VmRef,
    dest_host: &str,
    stream: &mut S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let domid = deps.hypervisor.resolve_domid(&vm.id).await?.ok_or_else(|| {
        MigrationError::InternalError(format!("VM {} has no running domain", vm.id))
    })?;

    let rw_vbds: Vec<_> = vm
        .vbds
        .iter()
        .filter(|v| v.mode == VbdMode::Rw && v.currently_attached)
        .collect();
    let rw_vdi_ids: Vec<String> = rw_vbds.iter().map(|v| v.vdi.id.clone()).collect();
    let extra_xenstore_paths: Vec<String> = Vec::new();

    if deps.faults.is_active(FaultPoint::BeforeSuspend) {
        return Err(MigrationError::migrate_failed(
            &vm.id,
            &vm.resident_on,
            dest_host,
            "fault injection point 1 (before suspend)",
        ));
    }

    let mut ledger = SourceLedger::new(session.is_localhost, rw_vdi_ids);

    // Barrier [1]: the destination has attached storage and created the
    // domain shell, and is ready to receive the memory image.
    wire::recv_success(stream)
        .await
        .map_err(|e| MigrationError::migrate_failed(&vm.id, &vm.resident_on, dest_host, e.to_string()))?;

    let result = run_guarded(deps, session, vm, dest_host, domid, stream, &rw_vbds, &extra_xenstore_paths, &mut ledger).await;

    // Guaranteed release: runs on every exit from the guarded block above,
    // success or failure alike -- the source's own domain is now defunct
    // either way (the destination owns the guest on success; nothing owns
    // it on failure past this point).
    release(deps, vm, &ledger, domid, session.is_localhost).await;

    result
}

async fn run_guarded<S>(
    deps: &TransmitterDeps,
    session: &MigrationSession,
    vm: &VmRef,
    dest_host: &str,
    domid: u32,
    stream: &mut S,
    rw_vbds: &[&crate::model::VbdRef],
    extra_xenstore_paths: &[String],
    ledger: &mut SourceLedger,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    suspend_and_flush(deps, session, vm, dest_host, domid, stream).await?;

    if deps.faults.is_active(FaultPoint::AfterSuspendBeforeFlush) {
        return Err(MigrationError::migrate_failed(
            &vm.id,
            &vm.resident_on,
            dest_host,
            "fault injection point 3 (after suspend, before flush)",
        ));
    }

    for vbd in rw_vbds {
        deps.hypervisor
            .vbd_hard_shutdown(&vbd.id, extra_xenstore_paths)
            .await?;
    }

    if ledger.deactivate_in_finally {
        for vbd in rw_vbds {
            deps.storage.deactivate(&vbd.vdi.sr_id, &vbd.vdi.id).await?;
        }
        ledger.deactivate_in_finally = false;
    }

    // Barrier [3]: memory image and disk handoff are both done; the
    // destination may unpause.
    wire::send_success(stream).await?;

    if ledger.detach_in_finally {
        for vbd in rw_vbds {
            deps.storage.detach(&vbd.vdi.sr_id, &vbd.vdi.id).await?;
        }
        ledger.detach_in_finally = false;
    }

    if let Err(e) = deps.telemetry.push_rrd(&vm.id, b"").await {
        warn!(vm = %vm.id, error = %e, "RRD telemetry push failed (best effort)");
    }

    // Barrier [4]: the destination confirms the domain is running there.
    match wire::recv_success(stream).await {
        Ok(()) => {
            deps.cluster.set_power_state(&vm.id, VmPowerState::Halted).await?;
            Ok(())
        }
        Err(e) => {
            // The handoff already happened: disks and memory are gone from
            // here regardless of whether the destination's ack made it
            // back. Force the local record to Halted rather than leave it
            // claiming a domain that no longer exists on this host.
            warn!(vm = %vm.id, error = %e, "barrier [4] failed after handoff; forcing local record to Halted");
            deps.cluster.set_power_state(&vm.id, VmPowerState::Halted).await.ok();
            Err(e)
        }
    }
}

async fn suspend_and_flush<S>(
    deps: &TransmitterDeps,
    session: &MigrationSession,
    vm: &VmRef,
    dest_host: &str,
    domid: u32,
    stream: &mut S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // One-shot guard: the PCI device may be unplugged either by the
    // progress-threshold trigger below or by the pre-shutdown wait,
    // whichever fires first -- never both.
    let pci_unplug_done = Arc::new(AtomicBool::new(false));
    let pci_threshold = vm
        .other_config_get("pci-hotunplug-time")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(DEFAULT_PCI_HOTUNPLUG_TIME);

    let progress_cb: ProgressCallback<'_> = Box::new({
        let task = deps.task.clone();
        let hypervisor = deps.hypervisor.clone();
        let pci_device = session.pci_device_to_unplug.clone();
        let pci_unplug_done = pci_unplug_done.clone();
        move |frac: f64| {
            let task = task.clone();
            let scaled = MigrationSession::scale_progress(frac);
            tokio::spawn(async move {
                if let Err(e) = task.set_progress(scaled).await {
                    warn!(error = %e, "progress report failed");
                }
            });

            if frac > pci_threshold {
                if let Some(device) = pci_device.clone() {
                    if pci_unplug_done
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let hypervisor = hypervisor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = hypervisor.pci_unplug(domid, &device).await {
                                warn!(error = %e, "progress-threshold PCI unplug failed (best effort)");
                            }
                        });
                    }
                }
            }
        }
    });

    let pre_shutdown_cb: PreShutdownCallback<'_> = Box::new({
        let hypervisor = deps.hypervisor.clone();
        let abort = deps.abort.clone();
        let pci_device = session.pci_device_to_unplug.clone();
        let pci_unplug_done = pci_unplug_done.clone();
        move || {
            let hypervisor = hypervisor.clone();
            let abort = abort.clone();
            let pci_device = pci_device.clone();
            let pci_unplug_done = pci_unplug_done.clone();
            Box::pin(async move {
                let (ack_tx, ack_rx) = suspend_ack_channel();

                if let Some(device) = pci_device {
                    if pci_unplug_done
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        hypervisor.pci_unplug(domid, &device).await?;
                    }

                    let watch_hv = hypervisor.clone();
                    let watch_device = device.clone();
                    tokio::spawn(async move {
                        loop {
                            match watch_hv.pci_list(domid).await {
                                Ok(present) if !present.iter().any(|d| d == &watch_device) => {
                                    ack_tx.ack();
                                    return;
                                }
                                Ok(_) => {}
                                Err(_) => return,
                            }
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    });
                } else {
                    // No PCI device pending removal: nothing to wait for,
                    // but the bounded wait still runs so the shape of this
                    // call is identical regardless of PCI involvement.
                    ack_tx.ack();
                }

                ack_rx.wait(abort.as_ref()).await
            })
        }
    });

    let outcome = deps
        .hypervisor
        .domain_suspend(domid, stream, session.is_live, progress_cb, pre_shutdown_cb)
        .await;

    match outcome {
        Ok(()) => {
            deps.task.set_progress(MigrationSession::scale_progress(1.0)).await?;
            Ok(())
        }
        Err(MigrationError::DomainShutdownForWrongReason(ShutdownReason::Crashed)) => {
            Err(MigrationError::migrate_failed(
                &vm.id,
                &vm.resident_on,
                dest_host,
                "Domain crashed while suspending",
            ))
        }
        Err(MigrationError::DomainShutdownForWrongReason(reason)) => Err(MigrationError::migrate_failed(
            &vm.id,
            &vm.resident_on,
            dest_host,
            format!("domain shut down during suspend for the wrong reason: {reason:?}"),
        )),
        Err(e) => Err(e),
    }
}

/// Guaranteed-release path: undo exactly what the ledger says is still
/// owed, then destroy this side's own domain -- the source never keeps a
/// live domain around once it has handed off, win or lose. Every step
/// here is best-effort: logged and swallowed rather than letting a
/// cleanup error mask the original one.
async fn release(deps: &TransmitterDeps, vm: &VmRef, ledger: &SourceLedger, domid: u32, is_localhost: bool) {
    let rw_vbds = vm.vbds.iter().filter(|v| v.mode == VbdMode::Rw);

    if ledger.deactivate_in_finally {
        for vbd in rw_vbds.clone() {
            if let Err(e) = deps.storage.deactivate(&vbd.vdi.sr_id, &vbd.vdi.id).await {
                warn!(vdi = %vbd.vdi.id, error = %e, "deactivate during release failed");
            }
        }
    }
    if ledger.detach_in_finally {
        for vbd in rw_vbds {
            if let Err(e) = deps.storage.detach(&vbd.vdi.sr_id, &vbd.vdi.id).await {
                warn!(vdi = %vbd.vdi.id, error = %e, "detach during release failed");
            }
        }
    }

    // Localhost migrations hand the same xenstore entries straight to the
    // destination's domain create; preserve them rather than tearing down
    // state the receiver is about to reuse.
    if let Err(e) = deps.hypervisor.domain_destroy(domid, is_localhost).await {
        warn!(vm = %vm.id, domid, error = %e, "domain destroy during release failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mock::{
        MockAbortSource, MockClusterDb, MockHypervisorOps, MockStorageOps, MockTaskSink,
        MockTelemetrySink,
    };
    use crate::faults::NoFaults;
    use crate::model::{BootRecord, VbdRef, VdiRef};
    use std::collections::HashMap;
    use tokio::io::duplex;

    fn vm_fixture() -> VmRef {
        VmRef {
            id: "vm-1".into(),
            power_state: VmPowerState::Running,
            resident_on: "host-a".into(),
            domid: Some(7),
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
                currently_attached: true,
                empty: false,
                paused: false,
                device: Some("xvda".into()),
            }],
            other_config: HashMap::new(),
        }
    }

    fn deps() -> (TransmitterDeps, Arc<MockClusterDb>, Arc<MockStorageOps>, Arc<MockHypervisorOps>) {
        let cluster = Arc::new(MockClusterDb::new());
        let storage = Arc::new(MockStorageOps::new());
        let hypervisor = Arc::new(MockHypervisorOps::default());
        let deps = TransmitterDeps {
            cluster: cluster.clone(),
            storage: storage.clone(),
            hypervisor: hypervisor.clone(),
            telemetry: Arc::new(MockTelemetrySink::new()),
            task: Arc::new(MockTaskSink::new()),
            abort: Arc::new(MockAbortSource::new()),
            faults: Arc::new(NoFaults),
        };
        (deps, cluster, storage, hypervisor)
    }

    #[tokio::test]
    async fn happy_path_releases_disks_and_halts_locally() {
        let (deps, cluster, storage, hv) = deps();
        let vm = vm_fixture();
        cluster.insert_vm(vm.clone());
        storage.attach("sr-1", "vdi-1", VbdMode::Rw).await.unwrap();
        hv.set_domid_for("vm-1", 7);

        let session = MigrationSession::new("vm-1", false, true);
        let (mut local, mut remote) = duplex(256);

        let driver = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            wire::send_success(&mut remote).await.unwrap(); // Barrier [1]
            let mut image = [0u8; 6];
            remote.read_exact(&mut image).await.unwrap(); // the memory image
            wire::recv_success(&mut remote).await.unwrap(); // Barrier [3]
            wire::send_success(&mut remote).await.unwrap(); // Barrier [4]
        });

        transmit(&deps, &session, &vm, "host-b", &mut local).await.unwrap();
        driver.await.unwrap();

        assert!(!storage.is_attached("sr-1", "vdi-1"));
        assert_eq!(cluster.get_vm("vm-1").await.unwrap().power_state, VmPowerState::Halted);
        assert!(!hv.has_domain(7), "source domain must be destroyed after handoff");
    }

    #[tokio::test]
    async fn fault_point_1_aborts_before_any_barrier() {
        let (mut deps, cluster, _storage, hv) = deps();
        deps.faults = Arc::new({
            let cfg = HashMap::from([(
                crate::faults::OtherConfigFaultInjector::KEY.to_string(),
                "1".to_string(),
            )]);
            crate::faults::OtherConfigFaultInjector::from_other_config(&cfg)
        });
        let vm = vm_fixture();
        cluster.insert_vm(vm.clone());
        hv.set_domid_for("vm-1", 7);

        let session = MigrationSession::new("vm-1", false, true);
        let (mut local, _remote) = duplex(256);

        let err = transmit(&deps, &session, &vm, "host-b", &mut local).await.unwrap_err();
        assert!(matches!(err, MigrationError::VmMigrateFailed { .. }));
    }

    #[tokio::test]
    async fn crash_during_suspend_releases_and_reports_wrong_reason() {
        let (mut deps, cluster, storage, _hv) = deps();
        let cfg = HashMap::from([(
            crate::faults::OtherConfigFaultInjector::KEY.to_string(),
            "2".to_string(),
        )]);
        let injector = crate::faults::OtherConfigFaultInjector::from_other_config(&cfg);
        let hv = Arc::new(MockHypervisorOps::new(Box::new(injector)));
        hv.set_domid_for("vm-1", 7);
        deps.hypervisor = hv.clone();
        let vm = vm_fixture();
        cluster.insert_vm(vm.clone());
        storage.attach("sr-1", "vdi-1", VbdMode::Rw).await.unwrap();

        let session = MigrationSession::new("vm-1", false, true);
        let (mut local, mut remote) = duplex(256);

        let driver = tokio::spawn(async move {
            wire::send_success(&mut remote).await.unwrap(); // Barrier [1]
        });

        let err = transmit(&deps, &session, &vm, "host-b", &mut local).await.unwrap_err();
        driver.await.unwrap();

        assert!(matches!(err, MigrationError::VmMigrateFailed { reason, .. } if reason.contains("crashed")));
        assert!(!storage.is_attached("sr-1", "vdi-1"));
        assert!(!hv.has_domain(7), "source domain must still be destroyed on a crash exit");
    }
}
