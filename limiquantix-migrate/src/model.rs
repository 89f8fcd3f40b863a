//! Data model: VM/VBD/VDI/Domain references and the transient migration session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Opaque identity of the guest in the cluster database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRef {
    pub id: String,
    pub power_state: VmPowerState,
    /// Host currently running (or last known to run) this VM.
    pub resident_on: String,
    /// Current hypervisor domain id, if the VM is running anywhere.
    pub domid: Option<u32>,
    /// Snapshot used as the create template on the destination.
    pub boot_record: BootRecord,
    pub vbds: Vec<VbdRef>,
    /// Fault-injection and tunable knobs (see `crate::faults` and
    /// `crate::coordinator::knobs`).
    pub other_config: HashMap<String, String>,
}

impl VmRef {
    pub fn other_config_get(&self, key: &str) -> Option<&str> {
        self.other_config.get(key).map(|s| s.as_str())
    }
}

/// VM power state, as tracked by the cluster database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmPowerState {
    Halted,
    Suspended,
    Running,
    Paused,
}

/// Snapshot of VM configuration used to re-create the domain on the
/// destination host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootRecord {
    pub name: String,
    pub memory_static_max_kib: u64,
    pub vcpus: u32,
    pub hvm: bool,
}

/// Guest disk attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VbdRef {
    pub id: String,
    pub vdi: VdiRef,
    pub mode: VbdMode,
    pub currently_attached: bool,
    pub empty: bool,
    pub paused: bool,
    /// Hypervisor device handle, e.g. "xvda" -- populated once attached.
    pub device: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VbdMode {
    Ro,
    Rw,
}

/// Virtual disk image. The 4-state lifecycle
/// (Detached -> Attached -> Activated -> Attached -> Detached) is enforced
/// by the transmitter/receiver choreography, not by this type itself --
/// `VdiRef` is a plain reference, the state lives in the resource ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdiRef {
    pub id: String,
    pub sr_id: String,
    /// Whether the storage repository backing this VDI requires an
    /// explicit activate step after attach (`VDI_ACTIVATE` capability).
    pub sr_has_activate_capability: bool,
}

/// Hypervisor-local running instance of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Domain {
    pub domid: u32,
}

/// Transient, one-per-in-flight-migration session state.
#[derive(Debug, Clone)]
pub struct MigrationSession {
    pub vm_id: String,
    pub is_localhost: bool,
    pub is_live: bool,
    pub session_id: String,
    pub progress: f64,
    pub pci_unplug_started: bool,
    pub pci_device_to_unplug: Option<String>,
}

impl MigrationSession {
    pub fn new(vm_id: impl Into<String>, is_localhost: bool, is_live: bool) -> Self {
        Self {
            vm_id: vm_id.into(),
            is_localhost,
            is_live,
            session_id: uuid::Uuid::new_v4().to_string(),
            progress: 0.0,
            pci_unplug_started: false,
            pci_device_to_unplug: None,
        }
    }

    /// Scale hypervisor-reported progress `x` in `[0, 1]` to the external
    /// progress sink's `0.95 * x`, per spec: the remaining 5% is adoption.
    pub fn scale_progress(x: f64) -> f64 {
        0.95 * x.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_progress_clamps_and_scales() {
        assert_eq!(MigrationSession::scale_progress(0.0), 0.0);
        assert_eq!(MigrationSession::scale_progress(1.0), 0.95);
        assert_eq!(MigrationSession::scale_progress(1.5), 0.95);
        assert_eq!(MigrationSession::scale_progress(-0.5), 0.0);
    }

    #[test]
    fn other_config_lookup() {
        let vm = VmRef {
            id: "vm-1".into(),
            power_state: VmPowerState::Running,
            resident_on: "host-a".into(),
            domid: Some(3),
            boot_record: BootRecord {
                name: "vm-1".into(),
                memory_static_max_kib: 1024 * 1024,
                vcpus: 2,
                hvm: true,
            },
            vbds: Vec::new(),
            other_config: HashMap::from([("pci-hotunplug-time".to_string(), "0.7".to_string())]),
        };
        assert_eq!(vm.other_config_get("pci-hotunplug-time"), Some("0.7"));
        assert_eq!(vm.other_config_get("missing"), None);
    }
}
