//! Error taxonomy for the migration engine.

use thiserror::Error;

/// Errors surfaced by the migration core.
///
/// Every variant maps to one of the structured exit codes a caller (the
/// node daemon, and beyond it the control plane task object) needs to
/// report a terminal status. Cleanup failures are never wrapped here --
/// they are logged and dropped per the best-effort/fatal split.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// The migration protocol itself failed; carries vm/src/dst identity
    /// and the first error encountered (remote or local).
    #[error("Migration of VM {vm} from {src} to {dst} failed: {reason}")]
    VmMigrateFailed {
        vm: String,
        src: String,
        dst: String,
        reason: String,
    },

    /// Destination host is administratively disabled.
    #[error("Host disabled, cannot migrate VM {0} to it")]
    HostDisabled(String),

    /// Could not establish the migration transport to the destination host.
    #[error("Host offline: {0}")]
    HostOffline(String),

    /// A resource required before migration can proceed is busy.
    #[error("Operation already in progress on {0} {1}")]
    OtherOperationInProgress(String, String),

    /// The surrounding cluster task was cancelled.
    #[error("Migration task cancelled")]
    TaskCancelled,

    /// Cross-pool migration, or any other explicitly unsupported path.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Anything that doesn't fit a structured code above.
    #[error("Internal error: {0}")]
    InternalError(String),

    /// The peer reported a framing-level failure on the handshake channel,
    /// or the channel closed unexpectedly.
    #[error("Remote failed: {0}")]
    RemoteFailed(String),

    /// The hypervisor shut the domain down for a reason other than the one
    /// the caller requested (e.g. `Suspend`).
    #[error("Domain shutdown for wrong reason: {0:?}")]
    DomainShutdownForWrongReason(ShutdownReason),

    /// A storage backend operation (attach/detach/activate/deactivate)
    /// failed, with SR/VDI context attached.
    #[error("Storage operation failed for volume {volume} on pool {pool}: {reason}")]
    StorageFailed {
        pool: String,
        volume: String,
        reason: String,
    },

    /// The external abort signal fired.
    #[error("Migration aborted externally")]
    Aborted,
}

/// Reason a domain shutdown was observed, used to distinguish a clean
/// suspend from a guest crash or an administrator-initiated shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Suspend,
    Crashed,
    Destroyed,
    Other,
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

impl MigrationError {
    /// Build a `VmMigrateFailed` from an already-known reason string --
    /// the shape used at every barrier failure in the transmitter/receiver.
    pub fn migrate_failed(
        vm: impl Into<String>,
        src: impl Into<String>,
        dst: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::VmMigrateFailed {
            vm: vm.into(),
            src: src.into(),
            dst: dst.into(),
            reason: reason.into(),
        }
    }
}
