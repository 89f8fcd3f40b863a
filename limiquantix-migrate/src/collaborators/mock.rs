//! In-memory collaborator implementations, used only by this crate's own
//! tests to exercise the transmitter/receiver/coordinator choreography
//! without a real cluster database, storage backend or hypervisor.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    AbortSource, ClusterDb, HypervisorOps, PreShutdownCallback, ProgressCallback, StorageOps,
    TaskSink, TelemetrySink,
};
use crate::error::{MigrationError, Result, ShutdownReason};
use crate::faults::{FaultInjector, FaultPoint, NoFaults};
use crate::model::{BootRecord, Domain, VbdMode, VmPowerState, VmRef};

/// A single in-memory VM record plus its migration lock state.
struct VmEntry {
    vm: VmRef,
    locked: bool,
}

#[derive(Default)]
pub struct MockClusterDb {
    vms: Mutex<HashMap<String, VmEntry>>,
    hosts_disabled: Mutex<HashSet<String>>,
    peer_map: Mutex<HashMap<String, String>>,
}

impl MockClusterDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_vm(&self, vm: VmRef) {
        let mut vms = self.vms.lock().unwrap();
        vms.insert(vm.id.clone(), VmEntry { vm, locked: false });
    }

    pub fn disable_host(&self, host: impl Into<String>) {
        self.hosts_disabled.lock().unwrap().insert(host.into());
    }

    /// Route `peer_lookup(from)` to the VM record already inserted under
    /// `to`, simulating a protected-VM subsystem that keeps its own shadow
    /// record of the VM the source identified.
    pub fn remap_peer(&self, from: impl Into<String>, to: impl Into<String>) {
        self.peer_map.lock().unwrap().insert(from.into(), to.into());
    }
}

#[async_trait]
impl ClusterDb for MockClusterDb {
    async fn get_vm(&self, vm_id: &str) -> Result<VmRef> {
        self.vms
            .lock()
            .unwrap()
            .get(vm_id)
            .map(|e| e.vm.clone())
            .ok_or_else(|| MigrationError::InternalError(format!("unknown vm {vm_id}")))
    }

    async fn set_power_state(&self, vm_id: &str, state: VmPowerState) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let entry = vms
            .get_mut(vm_id)
            .ok_or_else(|| MigrationError::InternalError(format!("unknown vm {vm_id}")))?;
        entry.vm.power_state = state;
        Ok(())
    }

    async fn set_resident_on(&self, vm_id: &str, host: &str) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let entry = vms
            .get_mut(vm_id)
            .ok_or_else(|| MigrationError::InternalError(format!("unknown vm {vm_id}")))?;
        entry.vm.resident_on = host.to_string();
        Ok(())
    }

    async fn set_domid(&self, vm_id: &str, domid: Option<u32>) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let entry = vms
            .get_mut(vm_id)
            .ok_or_else(|| MigrationError::InternalError(format!("unknown vm {vm_id}")))?;
        entry.vm.domid = domid;
        Ok(())
    }

    async fn set_affinity(&self, _vm_id: &str, _host: &str) -> Result<()> {
        Ok(())
    }

    async fn is_host_disabled(&self, host: &str) -> Result<bool> {
        Ok(self.hosts_disabled.lock().unwrap().contains(host))
    }

    async fn set_protected(&self, _vm_id: &str, _protected: bool) -> Result<()> {
        Ok(())
    }

    async fn lock_vm(&self, vm_id: &str) -> Result<bool> {
        let mut vms = self.vms.lock().unwrap();
        let entry = vms
            .get_mut(vm_id)
            .ok_or_else(|| MigrationError::InternalError(format!("unknown vm {vm_id}")))?;
        if entry.locked {
            return Ok(false);
        }
        entry.locked = true;
        Ok(true)
    }

    async fn unlock_vm(&self, vm_id: &str) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        if let Some(entry) = vms.get_mut(vm_id) {
            entry.locked = false;
        }
        Ok(())
    }

    async fn peer_lookup(&self, vm: &VmRef) -> Result<VmRef> {
        let target_id = self
            .peer_map
            .lock()
            .unwrap()
            .get(&vm.id)
            .cloned()
            .unwrap_or_else(|| vm.id.clone());
        if target_id == vm.id {
            return Ok(vm.clone());
        }
        self.get_vm(&target_id).await
    }
}

#[derive(Default)]
pub struct MockStorageOps {
    attached: Mutex<HashSet<(String, String)>>,
    activated: Mutex<HashSet<(String, String)>>,
    capability: Mutex<HashMap<String, bool>>,
    fail_attach: Mutex<HashSet<String>>,
    fail_activate: Mutex<HashSet<String>>,
}

impl MockStorageOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_activate_capability(&self, sr_id: impl Into<String>, has_it: bool) {
        self.capability.lock().unwrap().insert(sr_id.into(), has_it);
    }

    /// Make `attach` fail for this VDI, to test destination rollback.
    pub fn fail_attach_for(&self, vdi_id: impl Into<String>) {
        self.fail_attach.lock().unwrap().insert(vdi_id.into());
    }

    /// Make `activate` fail for this VDI, to test the activate-phase
    /// rollback (deactivate + domain destroy + detach).
    pub fn fail_activate_for(&self, vdi_id: impl Into<String>) {
        self.fail_activate.lock().unwrap().insert(vdi_id.into());
    }

    pub fn is_attached(&self, sr_id: &str, vdi_id: &str) -> bool {
        self.attached
            .lock()
            .unwrap()
            .contains(&(sr_id.to_string(), vdi_id.to_string()))
    }

    pub fn is_activated(&self, sr_id: &str, vdi_id: &str) -> bool {
        self.activated
            .lock()
            .unwrap()
            .contains(&(sr_id.to_string(), vdi_id.to_string()))
    }
}

#[async_trait]
impl StorageOps for MockStorageOps {
    async fn attach(&self, sr_id: &str, vdi_id: &str, _mode: VbdMode) -> Result<()> {
        if self.fail_attach.lock().unwrap().contains(vdi_id) {
            return Err(MigrationError::StorageFailed {
                pool: sr_id.to_string(),
                volume: vdi_id.to_string(),
                reason: "injected attach failure".to_string(),
            });
        }
        self.attached
            .lock()
            .unwrap()
            .insert((sr_id.to_string(), vdi_id.to_string()));
        Ok(())
    }

    async fn detach(&self, sr_id: &str, vdi_id: &str) -> Result<()> {
        self.attached
            .lock()
            .unwrap()
            .remove(&(sr_id.to_string(), vdi_id.to_string()));
        Ok(())
    }

    async fn activate(&self, sr_id: &str, vdi_id: &str) -> Result<()> {
        if self.fail_activate.lock().unwrap().contains(vdi_id) {
            return Err(MigrationError::StorageFailed {
                pool: sr_id.to_string(),
                volume: vdi_id.to_string(),
                reason: "injected activate failure".to_string(),
            });
        }
        self.activated
            .lock()
            .unwrap()
            .insert((sr_id.to_string(), vdi_id.to_string()));
        Ok(())
    }

    async fn deactivate(&self, sr_id: &str, vdi_id: &str) -> Result<()> {
        self.activated
            .lock()
            .unwrap()
            .remove(&(sr_id.to_string(), vdi_id.to_string()));
        Ok(())
    }

    async fn sr_has_activate_capability(&self, sr_id: &str) -> Result<bool> {
        Ok(*self.capability.lock().unwrap().get(sr_id).unwrap_or(&false))
    }
}

pub struct MockHypervisorOps {
    next_domid: AtomicU32,
    domains: Mutex<HashSet<u32>>,
    domids_by_vm: Mutex<HashMap<String, u32>>,
    crashed_domids: Mutex<HashSet<u32>>,
    fault_injector: Box<dyn FaultInjector>,
}

impl Default for MockHypervisorOps {
    fn default() -> Self {
        Self::new(Box::new(NoFaults))
    }
}

impl MockHypervisorOps {
    pub fn new(fault_injector: Box<dyn FaultInjector>) -> Self {
        Self {
            next_domid: AtomicU32::new(1),
            domains: Mutex::new(HashSet::new()),
            domids_by_vm: Mutex::new(HashMap::new()),
            crashed_domids: Mutex::new(HashSet::new()),
            fault_injector,
        }
    }

    /// Seed the domid `resolve_domid` returns for `vm_id`, as if that
    /// domain were already running on this host before the migration
    /// started (the source side never calls `domain_create` itself -- it
    /// only ever resolves an already-running domain).
    pub fn set_domid_for(&self, vm_id: impl Into<String>, domid: u32) {
        self.domids_by_vm.lock().unwrap().insert(vm_id.into(), domid);
        self.domains.lock().unwrap().insert(domid);
    }

    pub fn has_domain(&self, domid: u32) -> bool {
        self.domains.lock().unwrap().contains(&domid)
    }
}

#[async_trait]
impl HypervisorOps for MockHypervisorOps {
    async fn resolve_domid(&self, vm_id: &str) -> Result<Option<u32>> {
        Ok(self.domids_by_vm.lock().unwrap().get(vm_id).copied())
    }

    async fn vbd_is_paused(&self, _vbd_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn vbd_hard_shutdown(&self, _vbd_id: &str, _extra_xenstore_paths: &[String]) -> Result<()> {
        Ok(())
    }

    async fn domain_create(&self, _boot_record: &BootRecord) -> Result<Domain> {
        let domid = self.next_domid.fetch_add(1, Ordering::SeqCst);
        self.domains.lock().unwrap().insert(domid);
        Ok(Domain { domid })
    }

    async fn memory_reserve(&self, _domid: u32, _kib: u64) -> Result<()> {
        Ok(())
    }

    async fn memory_rebalance(&self) -> Result<()> {
        Ok(())
    }

    async fn restore_devices(&self, _domid: u32) -> Result<()> {
        Ok(())
    }

    async fn domain_unpause(&self, domid: u32) -> Result<()> {
        if self.crashed_domids.lock().unwrap().contains(&domid) {
            return Err(MigrationError::DomainShutdownForWrongReason(
                ShutdownReason::Crashed,
            ));
        }
        Ok(())
    }

    async fn domain_destroy(&self, domid: u32, _preserve_xenstore: bool) -> Result<()> {
        self.domains.lock().unwrap().remove(&domid);
        self.crashed_domids.lock().unwrap().remove(&domid);
        Ok(())
    }

    async fn pci_list(&self, _domid: u32) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn pci_unplug(&self, _domid: u32, _device: &str) -> Result<()> {
        Ok(())
    }

    async fn pci_plug(&self, _domid: u32, _device: &str) -> Result<()> {
        Ok(())
    }

    async fn domain_suspend(
        &self,
        _domid: u32,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        _live: bool,
        mut progress: ProgressCallback<'_>,
        mut pre_shutdown: PreShutdownCallback<'_>,
    ) -> Result<()> {
        progress(0.5);

        if self.fault_injector.is_active(FaultPoint::CrashDuringSuspend) {
            return Err(MigrationError::DomainShutdownForWrongReason(
                ShutdownReason::Crashed,
            ));
        }

        pre_shutdown().await?;

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

    async fn domain_restore(
        &self,
        domid: u32,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()> {
        let mut buf = [0u8; 6];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| MigrationError::InternalError(format!("restore stream read failed: {e}")))?;

        if self
            .fault_injector
            .is_active(FaultPoint::DestinationCrashAfterRestore)
        {
            self.crashed_domids.lock().unwrap().insert(domid);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTaskSink {
    progress: Mutex<f64>,
    cancelling: AtomicBool,
}

impl MockTaskSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.cancelling.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> f64 {
        *self.progress.lock().unwrap()
    }
}

#[async_trait]
impl TaskSink for MockTaskSink {
    async fn set_progress(&self, fraction: f64) -> Result<()> {
        *self.progress.lock().unwrap() = fraction;
        Ok(())
    }

    async fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockAbortSource {
    aborted: AtomicBool,
}

impl MockAbortSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

impl AbortSource for MockAbortSource {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockTelemetrySink {
    pushed: Mutex<Vec<(String, usize)>>,
}

impl MockTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushes(&self) -> Vec<(String, usize)> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelemetrySink for MockTelemetrySink {
    async fn push_rrd(&self, vm_id: &str, payload: &[u8]) -> Result<()> {
        self.pushed
            .lock()
            .unwrap()
            .push((vm_id.to_string(), payload.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cluster_db_lock_is_exclusive() {
        let db = MockClusterDb::new();
        db.insert_vm(VmRef {
            id: "vm-1".into(),
            power_state: VmPowerState::Running,
            resident_on: "host-a".into(),
            domid: Some(3),
            boot_record: BootRecord {
                name: "vm-1".into(),
                memory_static_max_kib: 1024,
                vcpus: 1,
                hvm: true,
            },
            vbds: Vec::new(),
            other_config: HashMap::new(),
        });

        assert!(db.lock_vm("vm-1").await.unwrap());
        assert!(!db.lock_vm("vm-1").await.unwrap());
        db.unlock_vm("vm-1").await.unwrap();
        assert!(db.lock_vm("vm-1").await.unwrap());
    }

    #[tokio::test]
    async fn storage_ops_rejects_injected_attach_failure() {
        let storage = MockStorageOps::new();
        storage.fail_attach_for("vdi-1");
        let err = storage.attach("sr-1", "vdi-1", VbdMode::Rw).await.unwrap_err();
        assert!(matches!(err, MigrationError::StorageFailed { .. }));
        assert!(!storage.is_attached("sr-1", "vdi-1"));
    }

    #[tokio::test]
    async fn hypervisor_crash_during_suspend_short_circuits_pre_shutdown() {
        use crate::faults::OtherConfigFaultInjector;

        let cfg = HashMap::from([(OtherConfigFaultInjector::KEY.to_string(), "2".to_string())]);
        let hv = MockHypervisorOps::new(Box::new(OtherConfigFaultInjector::from_other_config(&cfg)));
        let mut sink = tokio::io::sink();
        let called = std::sync::Arc::new(AtomicBool::new(false));
        let called2 = called.clone();

        let err = hv
            .domain_suspend(
                1,
                &mut sink,
                true,
                Box::new(|_| {}),
                Box::new(move || {
                    called2.store(true, Ordering::SeqCst);
                    Box::pin(async { Ok(()) })
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MigrationError::DomainShutdownForWrongReason(ShutdownReason::Crashed)
        ));
        assert!(!called.load(Ordering::SeqCst));
    }
}
