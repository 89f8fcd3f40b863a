//! External interfaces the migration core consumes.
//!
//! None of these traits own their backing resource: the cluster database,
//! the storage backend and the hypervisor control layer are all implemented
//! elsewhere (see `SPEC_FULL.md`'s Non-goals) and reached only through the
//! seams defined here. Production wiring lives in the node daemon; this
//! crate only ships the [`mock`] implementations used by its own tests.

pub mod mock;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::model::{BootRecord, Domain, VbdMode, VmPowerState, VmRef};

/// Cluster database: the single source of truth for VM placement and
/// power state. Reads and writes here are assumed to already be protected
/// by whatever cluster-wide locking exists outside this crate -- `lock_vm`
/// / `unlock_vm` below are the migration-specific per-VM operation lock,
/// not a replacement for that.
#[async_trait]
pub trait ClusterDb: Send + Sync {
    async fn get_vm(&self, vm_id: &str) -> Result<VmRef>;
    async fn set_power_state(&self, vm_id: &str, state: VmPowerState) -> Result<()>;
    async fn set_resident_on(&self, vm_id: &str, host: &str) -> Result<()>;
    async fn set_domid(&self, vm_id: &str, domid: Option<u32>) -> Result<()>;
    async fn set_affinity(&self, vm_id: &str, host: &str) -> Result<()>;
    async fn is_host_disabled(&self, host: &str) -> Result<bool>;
    async fn set_protected(&self, vm_id: &str, protected: bool) -> Result<()>;

    /// Acquire the per-VM migration operation lock. Returns `true` if this
    /// call acquired it, `false` if the caller already held it (the
    /// localhost-migration case, where source and destination share a
    /// thread of control and must not deadlock on their own lock).
    async fn lock_vm(&self, vm_id: &str) -> Result<bool>;
    async fn unlock_vm(&self, vm_id: &str) -> Result<()>;

    /// Protected-VM peer remap: the destination side may route a migration
    /// to a different local VM record than the one the source identified
    /// (a protected-VM subsystem keeping its own shadow record). Defaults
    /// to identity; locking and all further receiver-side operations use
    /// whatever this returns.
    async fn peer_lookup(&self, vm: &VmRef) -> Result<VmRef> {
        Ok(vm.clone())
    }
}

/// Storage backend, consumed strictly through the four lifecycle verbs plus
/// the capability probe -- see `SPEC_FULL.md`'s VDI lifecycle note.
#[async_trait]
pub trait StorageOps: Send + Sync {
    async fn attach(&self, sr_id: &str, vdi_id: &str, mode: VbdMode) -> Result<()>;
    async fn detach(&self, sr_id: &str, vdi_id: &str) -> Result<()>;
    async fn activate(&self, sr_id: &str, vdi_id: &str) -> Result<()>;
    async fn deactivate(&self, sr_id: &str, vdi_id: &str) -> Result<()>;
    async fn sr_has_activate_capability(&self, sr_id: &str) -> Result<bool>;
}

/// Progress callback invoked from inside the hypervisor's save routine.
pub type ProgressCallback<'a> = Box<dyn FnMut(f64) + Send + 'a>;

/// Pre-shutdown callback run just before the domain is actually paused for
/// the final memory flush -- this is where the suspend-ack protocol and
/// any PCI hot-unplug choreography happen. The returned future borrows no
/// longer than the callback itself, since the hypervisor backend is
/// expected to await it in place rather than detach it onto another task.
pub type PreShutdownCallback<'a> = Box<dyn (FnMut() -> BoxFuture<'a, Result<()>>) + Send + 'a>;

/// Hypervisor control layer, consumed strictly through domain-level verbs.
#[async_trait]
pub trait HypervisorOps: Send + Sync {
    async fn resolve_domid(&self, vm_id: &str) -> Result<Option<u32>>;
    async fn vbd_is_paused(&self, vbd_id: &str) -> Result<bool>;
    async fn vbd_hard_shutdown(&self, vbd_id: &str, extra_xenstore_paths: &[String]) -> Result<()>;

    async fn domain_create(&self, boot_record: &BootRecord) -> Result<Domain>;
    async fn memory_reserve(&self, domid: u32, kib: u64) -> Result<()>;
    async fn memory_rebalance(&self) -> Result<()>;
    async fn restore_devices(&self, domid: u32) -> Result<()>;
    async fn domain_unpause(&self, domid: u32) -> Result<()>;
    async fn domain_destroy(&self, domid: u32, preserve_xenstore: bool) -> Result<()>;

    async fn pci_list(&self, domid: u32) -> Result<Vec<String>>;
    async fn pci_unplug(&self, domid: u32, device: &str) -> Result<()>;
    async fn pci_plug(&self, domid: u32, device: &str) -> Result<()>;

    /// Suspend `domid`, streaming the memory image to `writer`. `progress`
    /// and `pre_shutdown` are invoked from inside the save routine, not by
    /// the caller -- callers must not assume ordering relative to their own
    /// code beyond "before this call returns".
    async fn domain_suspend(
        &self,
        domid: u32,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        live: bool,
        progress: ProgressCallback<'_>,
        pre_shutdown: PreShutdownCallback<'_>,
    ) -> Result<()>;

    /// Restore a domain's memory image from `reader`.
    async fn domain_restore(
        &self,
        domid: u32,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()>;
}

/// Reports progress and cooperative cancellation back to whatever surfaces
/// the migration as a cluster task -- out of scope here, see Non-goals.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn set_progress(&self, fraction: f64) -> Result<()>;
    async fn is_cancelling(&self) -> bool;
}

/// External abort signal, polled at the choreography's checkpoints.
pub trait AbortSource: Send + Sync {
    fn is_aborted(&self) -> bool;
}

/// RRD/telemetry push, fired once per migration on a best-effort basis so
/// the destination's monitoring history doesn't show a gap at handoff.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn push_rrd(&self, vm_id: &str, payload: &[u8]) -> Result<()>;
}
