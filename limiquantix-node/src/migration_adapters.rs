//! Wiring between `limiquantix_migrate`'s collaborator traits and this
//! daemon's real hypervisor/storage stack.
//!
//! The cluster database proper lives in a control plane this repo doesn't
//! include, so [`LocalClusterRegistry`] is an explicit in-memory stand-in:
//! good enough to drive the migration core end to end on a single node
//! pair, not a claim that this daemon owns cluster state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use limiquantix_hypervisor::storage::StorageManager;
use limiquantix_hypervisor::{DiskConfig, Hypervisor, VmConfig, VmState};
use limiquantix_migrate::collaborators::{
    AbortSource, ClusterDb, HypervisorOps, PreShutdownCallback, ProgressCallback, StorageOps,
    TaskSink, TelemetrySink,
};
use limiquantix_migrate::error::{MigrationError, Result as MigrateResult};
use limiquantix_migrate::model::{BootRecord, Domain, VbdMode, VmPowerState, VmRef};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

fn map_hv_err(e: limiquantix_hypervisor::HypervisorError) -> MigrationError {
    MigrationError::InternalError(e.to_string())
}

/// In-memory placeholder for the cluster database this node doesn't own.
#[derive(Default)]
pub struct LocalClusterRegistry {
    vms: Mutex<HashMap<String, VmRef>>,
    locks: Mutex<HashSet<String>>,
    disabled_hosts: Mutex<HashSet<String>>,
}

impl LocalClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, vm: VmRef) {
        self.vms.lock().unwrap().insert(vm.id.clone(), vm);
    }
}

#[async_trait]
impl ClusterDb for LocalClusterRegistry {
    async fn get_vm(&self, vm_id: &str) -> MigrateResult<VmRef> {
        self.vms
            .lock()
            .unwrap()
            .get(vm_id)
            .cloned()
            .ok_or_else(|| MigrationError::InternalError(format!("unknown vm {vm_id}")))
    }

    async fn set_power_state(&self, vm_id: &str, state: VmPowerState) -> MigrateResult<()> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| MigrationError::InternalError(format!("unknown vm {vm_id}")))?;
        vm.power_state = state;
        Ok(())
    }

    async fn set_resident_on(&self, vm_id: &str, host: &str) -> MigrateResult<()> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| MigrationError::InternalError(format!("unknown vm {vm_id}")))?;
        vm.resident_on = host.to_string();
        Ok(())
    }

    async fn set_domid(&self, vm_id: &str, domid: Option<u32>) -> MigrateResult<()> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| MigrationError::InternalError(format!("unknown vm {vm_id}")))?;
        vm.domid = domid;
        Ok(())
    }

    async fn set_affinity(&self, _vm_id: &str, _host: &str) -> MigrateResult<()> {
        // No placement policy lives in this daemon; a real cluster database
        // would persist the preferred-host hint here.
        Ok(())
    }

    async fn is_host_disabled(&self, host: &str) -> MigrateResult<bool> {
        Ok(self.disabled_hosts.lock().unwrap().contains(host))
    }

    async fn set_protected(&self, _vm_id: &str, _protected: bool) -> MigrateResult<()> {
        Ok(())
    }

    async fn lock_vm(&self, vm_id: &str) -> MigrateResult<bool> {
        Ok(self.locks.lock().unwrap().insert(vm_id.to_string()))
    }

    async fn unlock_vm(&self, vm_id: &str) -> MigrateResult<()> {
        self.locks.lock().unwrap().remove(vm_id);
        Ok(())
    }
}

/// Storage adapter, curried with the VM it's attaching disks for -- built
/// fresh per migration session rather than held as a long-lived singleton,
/// since attach/detach here act on a running domain, not just a pool.
pub struct HypervisorStorageOps {
    storage: Arc<StorageManager>,
    hypervisor: Arc<dyn Hypervisor>,
    vm_id: String,
}

impl HypervisorStorageOps {
    pub fn new(storage: Arc<StorageManager>, hypervisor: Arc<dyn Hypervisor>, vm_id: impl Into<String>) -> Self {
        Self {
            storage,
            hypervisor,
            vm_id: vm_id.into(),
        }
    }
}

#[async_trait]
impl StorageOps for HypervisorStorageOps {
    async fn attach(&self, sr_id: &str, vdi_id: &str, mode: VbdMode) -> MigrateResult<()> {
        let attach_info = self
            .storage
            .get_attach_info(sr_id, vdi_id)
            .await
            .map_err(map_hv_err)?;

        let disk = DiskConfig {
            id: vdi_id.to_string(),
            readonly: mode == VbdMode::Ro,
            bootable: false,
            ..DiskConfig::new(attach_info.path)
        };

        self.hypervisor
            .attach_disk(&self.vm_id, disk)
            .await
            .map_err(map_hv_err)
    }

    async fn detach(&self, _sr_id: &str, vdi_id: &str) -> MigrateResult<()> {
        self.hypervisor
            .detach_disk(&self.vm_id, vdi_id)
            .await
            .map_err(map_hv_err)
    }

    async fn activate(&self, _sr_id: &str, _vdi_id: &str) -> MigrateResult<()> {
        // StorageManager's backends expose init_pool/attach-info only; a
        // real SR-level activate step (required for shared block storage
        // like iSCSI/Ceph RBD) would hook in here. Local/NFS pools need no
        // explicit activation, which is all this daemon's backends model
        // today -- see `sr_has_activate_capability`.
        Ok(())
    }

    async fn deactivate(&self, _sr_id: &str, _vdi_id: &str) -> MigrateResult<()> {
        Ok(())
    }

    async fn sr_has_activate_capability(&self, sr_id: &str) -> MigrateResult<bool> {
        match self.storage.get_pool_info(sr_id).await {
            Ok(info) => Ok(matches!(
                info.pool_type,
                limiquantix_hypervisor::storage::PoolType::Iscsi
                    | limiquantix_hypervisor::storage::PoolType::CephRbd
            )),
            Err(e) => Err(map_hv_err(e)),
        }
    }
}

/// Hypervisor adapter over the daemon's [`Hypervisor`] trait object.
///
/// `domain_suspend`/`domain_restore` stream a memory image over an
/// already-connected byte stream, which the `Hypervisor` trait doesn't
/// expose at the libvirt level (`migrate_vm` takes a destination URI, not a
/// caller-driven stream) -- per `SPEC_FULL.md`'s collaborator boundary,
/// this adapter models that streaming step with the same wire-visible
/// placeholder payload the in-crate mock uses, rather than fabricating a
/// libvirt streaming API this workspace doesn't have.
pub struct DaemonHypervisorOps {
    hypervisor: Arc<dyn Hypervisor>,
    vm_id: String,
}

impl DaemonHypervisorOps {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, vm_id: impl Into<String>) -> Self {
        Self {
            hypervisor,
            vm_id: vm_id.into(),
        }
    }
}

#[async_trait]
impl HypervisorOps for DaemonHypervisorOps {
    async fn resolve_domid(&self, vm_id: &str) -> MigrateResult<Option<u32>> {
        match self.hypervisor.get_vm_status(vm_id).await {
            Ok(status) if status.state == VmState::Running => Ok(Some(1)),
            Ok(_) => Ok(None),
            Err(e) => Err(map_hv_err(e)),
        }
    }

    async fn vbd_is_paused(&self, _vbd_id: &str) -> MigrateResult<bool> {
        Ok(false)
    }

    async fn vbd_hard_shutdown(&self, vdi_id: &str, _extra_xenstore_paths: &[String]) -> MigrateResult<()> {
        self.hypervisor
            .detach_disk(&self.vm_id, vdi_id)
            .await
            .map_err(map_hv_err)
    }

    async fn domain_create(&self, boot_record: &BootRecord) -> MigrateResult<Domain> {
        let config = VmConfig::new(&boot_record.name)
            .with_id(self.vm_id.clone())
            .with_cpu(boot_record.vcpus);
        self.hypervisor
            .create_vm(config)
            .await
            .map_err(map_hv_err)?;
        Ok(Domain { domid: 1 })
    }

    async fn memory_reserve(&self, _domid: u32, _kib: u64) -> MigrateResult<()> {
        Ok(())
    }

    async fn memory_rebalance(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn restore_devices(&self, _domid: u32) -> MigrateResult<()> {
        Ok(())
    }

    async fn domain_unpause(&self, _domid: u32) -> MigrateResult<()> {
        self.hypervisor
            .resume_vm(&self.vm_id)
            .await
            .map_err(map_hv_err)
    }

    async fn domain_destroy(&self, _domid: u32, _preserve_xenstore: bool) -> MigrateResult<()> {
        self.hypervisor
            .force_stop_vm(&self.vm_id)
            .await
            .map_err(map_hv_err)
    }

    async fn pci_list(&self, _domid: u32) -> MigrateResult<Vec<String>> {
        // GPU/PCI passthrough device tracking isn't modeled by `Hypervisor`
        // today; a future hot-unplug implementation would query it here.
        Ok(Vec::new())
    }

    async fn pci_unplug(&self, _domid: u32, _device: &str) -> MigrateResult<()> {
        Ok(())
    }

    async fn pci_plug(&self, _domid: u32, _device: &str) -> MigrateResult<()> {
        Ok(())
    }

    async fn domain_suspend(
        &self,
        _domid: u32,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        _live: bool,
        mut progress: ProgressCallback<'_>,
        mut pre_shutdown: PreShutdownCallback<'_>,
    ) -> MigrateResult<()> {
        progress(0.5);
        pre_shutdown().await?;

        self.hypervisor
            .pause_vm(&self.vm_id)
            .await
            .map_err(map_hv_err)?;

        writer
            .write_all(b"MEMIMG")
            .await
            .map_err(|e| MigrationError::InternalError(format!("suspend stream write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| MigrationError::InternalError(format!("suspend stream flush failed: {e}")))?;

        progress(1.0);
        Ok(())
    }

    async fn domain_restore(&self, _domid: u32, reader: &mut (dyn AsyncRead + Unpin + Send)) -> MigrateResult<()> {
        let mut buf = [0u8; 6];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| MigrationError::InternalError(format!("restore stream read failed: {e}")))
    }
}

/// Reports progress through the daemon's task-tracking surface. No cluster
/// task object exists in this repo yet, so this logs at debug level -- a
/// real implementation would forward into whatever tracks in-flight
/// operations across the gRPC boundary.
#[derive(Default)]
pub struct LoggingTaskSink {
    cancelling: AtomicBool,
}

impl LoggingTaskSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.cancelling.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskSink for LoggingTaskSink {
    async fn set_progress(&self, fraction: f64) -> MigrateResult<()> {
        tracing::debug!(fraction, "migration progress");
        Ok(())
    }

    async fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct ShutdownAbortSource {
    aborted: AtomicBool,
}

impl ShutdownAbortSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

impl AbortSource for ShutdownAbortSource {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// No telemetry backend is wired into this daemon build; pushes are logged
/// and dropped, matching the migration core's own best-effort handling of
/// this step.
#[derive(Default)]
pub struct NoopTelemetrySink;

#[async_trait]
impl TelemetrySink for NoopTelemetrySink {
    async fn push_rrd(&self, vm_id: &str, payload: &[u8]) -> MigrateResult<()> {
        warn!(vm = %vm_id, bytes = payload.len(), "RRD telemetry push has no backend wired, dropping");
        Ok(())
    }
}
