//! Entry points: admission checks, dispatch on power state, and the
//! cross-pool stub.

use std::sync::Arc;
use std::time::Duration;

use limiquantix_common::{log_error, log_vm};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, instrument, warn};

use crate::collaborators::{AbortSource, ClusterDb, HypervisorOps};
use crate::error::{MigrationError, Result};
use crate::model::{MigrationSession, VmPowerState, VmRef};
use crate::receiver::{self, ReceiverDeps};
use crate::transmitter::{self, TransmitterDeps};

const VBD_PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const VBD_PAUSE_MAX_POLLS: u32 = 5;

/// `options.live`, the only migration option this core understands --
/// everything else named by a caller is accepted and ignored, same as
/// the original `VM.migrate` surface.
pub fn parse_live_option(options: &std::collections::HashMap<String, String>) -> bool {
    options
        .get("live")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Source-side entry point. Rejects on an administratively disabled
/// destination, then dispatches on the VM's current power state: halted
/// or suspended VMs just move affinity (there is no running domain to
/// migrate), running VMs take the live path, anything else (e.g.
/// `Paused`) is not a supported starting state.
#[instrument(skip(cluster, hypervisor, abort, stream), fields(vm = %vm.id, dest = %dest_host))]
pub async fn pool_migrate<S>(
    cluster: &Arc<dyn ClusterDb>,
    hypervisor: &Arc<dyn HypervisorOps>,
    abort: &Arc<dyn AbortSource>,
    vm: &VmRef,
    dest_host: &str,
    stream: Option<&mut S>,
    deps: Option<&TransmitterDeps>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if cluster.is_host_disabled(dest_host).await? {
        return Err(MigrationError::HostDisabled(dest_host.to_string()));
    }

    match vm.power_state {
        VmPowerState::Halted | VmPowerState::Suspended => {
            cluster.set_affinity(&vm.id, dest_host).await?;
            Ok(())
        }
        VmPowerState::Running => {
            let (stream, deps) = match (stream, deps) {
                (Some(s), Some(d)) => (s, d),
                _ => {
                    return Err(MigrationError::InternalError(
                        "live migration requires an open transport and transmitter deps".to_string(),
                    ))
                }
            };

            admission_gate(hypervisor, abort, vm).await?;

            let session = MigrationSession::new(vm.id.clone(), false, true);
            match transmitter::transmit(deps, &session, vm, dest_host, stream).await {
                Ok(()) => {
                    log_vm!("migrate", vm.id.as_str(), "live migration to {dest_host} completed");
                    Ok(())
                }
                Err(e) => {
                    log_error!("migrate", e, "live migration of {} to {dest_host} failed", vm.id);
                    Err(e)
                }
            }
        }
        VmPowerState::Paused => Err(MigrationError::InternalError(format!(
            "VM {} cannot be migrated while paused",
            vm.id
        ))),
    }
}

/// Admission gate: no in-flight VBD pause may be outstanding when
/// migration starts. Polled every 5s, up to 5 times, before giving up --
/// matches the bounded retry shape used elsewhere in the choreography
/// rather than failing on the first transient pause.
async fn admission_gate(
    hypervisor: &Arc<dyn HypervisorOps>,
    abort: &Arc<dyn AbortSource>,
    vm: &VmRef,
) -> Result<()> {
    let gated_vbds = vm.vbds.iter().filter(|v| v.currently_attached && !v.empty);
    for vbd in gated_vbds {
        let mut attempt = 0;
        loop {
            if abort.is_aborted() {
                return Err(MigrationError::Aborted);
            }
            if !hypervisor.vbd_is_paused(&vbd.id).await? {
                break;
            }
            attempt += 1;
            if attempt >= VBD_PAUSE_MAX_POLLS {
                return Err(MigrationError::OtherOperationInProgress(
                    "VBD".to_string(),
                    vbd.id.clone(),
                ));
            }
            warn!(vbd = %vbd.id, attempt, "VBD paused, waiting before migration admission");
            tokio::time::sleep(VBD_PAUSE_POLL_INTERVAL).await;
        }
    }
    Ok(())
}

/// Destination-side admission: decide whether this is a localhost
/// migration (source and destination are the same host), acquire the
/// per-VM lock unless the sender already holds it, then run the receiver.
#[instrument(skip(cluster, deps, stream), fields(vm = %vm.id, host = %this_host))]
pub async fn admit_and_receive<S>(
    cluster: &Arc<dyn ClusterDb>,
    deps: &ReceiverDeps,
    vm: &VmRef,
    this_host: &str,
    sender_host: &str,
    sender_already_holds_lock: bool,
    stream: &mut S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // The VM record this side acts on may not be the one the source
    // identified (protected-VM subsystems keep their own shadow record);
    // everything from here on -- locking, attach, adopt -- uses the
    // remapped identity.
    let vm = &cluster.peer_lookup(vm).await?;

    let is_localhost = sender_host == this_host;
    let acquired = if sender_already_holds_lock {
        false
    } else {
        cluster.lock_vm(&vm.id).await?
    };

    let session = MigrationSession::new(vm.id.clone(), is_localhost, true);
    info!(localhost = is_localhost, "admitted migration");

    let result = receiver::receive(deps, &session, vm, this_host, stream).await;

    if acquired {
        cluster.unlock_vm(&vm.id).await.ok();
    }

    match &result {
        Ok(()) => log_vm!("migrate", vm.id.as_str(), "admitted live migration from {sender_host} landed"),
        Err(e) => log_error!("migrate", e, "admitted live migration of {} from {sender_host} failed", vm.id),
    }

    result
}

/// Cross-pool migration is out of scope for this engine; the original
/// surface always accepted the call and always rejected it downstream.
pub async fn migrate(vm_id: &str) -> Result<()> {
    Err(MigrationError::NotImplemented(format!(
        "VM.migrate (cross-pool) for {vm_id}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mock::{MockAbortSource, MockClusterDb, MockHypervisorOps};
    use crate::model::{BootRecord, VmPowerState};
    use std::collections::HashMap;

    fn vm_fixture(state: VmPowerState) -> VmRef {
        VmRef {
            id: "vm-1".into(),
            power_state: state,
            resident_on: "host-a".into(),
            domid: None,
            boot_record: BootRecord {
                name: "vm-1".into(),
                memory_static_max_kib: 1024,
                vcpus: 1,
                hvm: true,
            },
            vbds: Vec::new(),
            other_config: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn halted_vm_just_moves_affinity() {
        let cluster_concrete = MockClusterDb::new();
        let vm = vm_fixture(VmPowerState::Halted);
        cluster_concrete.insert_vm(vm.clone());
        let cluster: Arc<dyn ClusterDb> = Arc::new(cluster_concrete);
        let hypervisor: Arc<dyn HypervisorOps> = Arc::new(MockHypervisorOps::default());
        let abort: Arc<dyn AbortSource> = Arc::new(MockAbortSource::new());

        let result: Result<()> = pool_migrate::<tokio::io::DuplexStream>(
            &cluster,
            &hypervisor,
            &abort,
            &vm,
            "host-b",
            None,
            None,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejects_disabled_destination() {
        let cluster_concrete = MockClusterDb::new();
        let vm = vm_fixture(VmPowerState::Halted);
        cluster_concrete.insert_vm(vm.clone());
        cluster_concrete.disable_host("host-b");
        let cluster: Arc<dyn ClusterDb> = Arc::new(cluster_concrete);
        let hypervisor: Arc<dyn HypervisorOps> = Arc::new(MockHypervisorOps::default());
        let abort: Arc<dyn AbortSource> = Arc::new(MockAbortSource::new());

        let err = pool_migrate::<tokio::io::DuplexStream>(
            &cluster,
            &hypervisor,
            &abort,
            &vm,
            "host-b",
            None,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MigrationError::HostDisabled(_)));
    }

    #[tokio::test]
    async fn paused_vm_is_rejected() {
        let cluster_concrete = MockClusterDb::new();
        let vm = vm_fixture(VmPowerState::Paused);
        cluster_concrete.insert_vm(vm.clone());
        let cluster: Arc<dyn ClusterDb> = Arc::new(cluster_concrete);
        let hypervisor: Arc<dyn HypervisorOps> = Arc::new(MockHypervisorOps::default());
        let abort: Arc<dyn AbortSource> = Arc::new(MockAbortSource::new());

        let err = pool_migrate::<tokio::io::DuplexStream>(
            &cluster,
            &hypervisor,
            &abort,
            &vm,
            "host-b",
            None,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MigrationError::InternalError(_)));
    }

    #[tokio::test]
    async fn cross_pool_migrate_is_not_implemented() {
        let err = migrate("vm-1").await.unwrap_err();
        assert!(matches!(err, MigrationError::NotImplemented(_)));
    }

    #[test]
    fn parse_live_option_defaults_false() {
        assert!(!parse_live_option(&HashMap::new()));
        let opts = HashMap::from([("live".to_string(), "true".to_string())]);
        assert!(parse_live_option(&opts));
    }

    #[tokio::test]
    async fn admission_remaps_through_peer_lookup() {
        use crate::collaborators::mock::{MockStorageOps, MockTaskSink};
        use crate::faults::NoFaults;
        use crate::model::{BootRecord, VmPowerState};

        let cluster_concrete = MockClusterDb::new();
        let source_side_vm = vm_fixture(VmPowerState::Suspended);
        // A shadow record under a different id is what this host actually
        // tracks for the VM the source identified.
        let shadow_vm = VmRef {
            id: "vm-1-shadow".into(),
            power_state: VmPowerState::Suspended,
            resident_on: "host-a".into(),
            domid: None,
            boot_record: BootRecord {
                name: "vm-1-shadow".into(),
                memory_static_max_kib: 1024,
                vcpus: 1,
                hvm: true,
            },
            vbds: Vec::new(),
            other_config: HashMap::new(),
        };
        cluster_concrete.insert_vm(source_side_vm.clone());
        cluster_concrete.insert_vm(shadow_vm);
        cluster_concrete.remap_peer("vm-1", "vm-1-shadow");
        let cluster: Arc<dyn ClusterDb> = Arc::new(cluster_concrete);

        let deps = ReceiverDeps {
            cluster: cluster.clone(),
            storage: Arc::new(MockStorageOps::new()),
            hypervisor: Arc::new(MockHypervisorOps::default()),
            task: Arc::new(MockTaskSink::new()),
            abort: Arc::new(MockAbortSource::new()),
            faults: Arc::new(NoFaults),
        };

        let (mut local, mut remote) = tokio::io::duplex(256);
        let driver = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            crate::wire::recv_success(&mut remote).await.unwrap(); // Barrier [1]
            remote.write_all(b"MEMIMG").await.unwrap();
            remote.flush().await.unwrap();
            crate::wire::send_success(&mut remote).await.unwrap(); // Barrier [3]
            crate::wire::recv_success(&mut remote).await.unwrap(); // Barrier [4]
        });

        admit_and_receive(&cluster, &deps, &source_side_vm, "host-b", "host-a", false, &mut local)
            .await
            .unwrap();
        driver.await.unwrap();

        // The shadow record landed here, not the id the source named.
        let landed = cluster.get_vm("vm-1-shadow").await.unwrap();
        assert_eq!(landed.resident_on, "host-b");
        assert_eq!(landed.power_state, VmPowerState::Running);
    }
}
