//! Deterministic failure-injection hooks, keyed by VM metadata.
//!
//! Points 1 and 3 are checked directly by the transmitter, point 4 by the
//! receiver -- these are pure protocol-timing faults. Points 2 and 5 model
//! simulated hypervisor-level misbehaviour (a guest crashing mid-suspend,
//! a domain crashing after restore) and are consulted by the mock
//! hypervisor backend in [`crate::collaborators::mock`] instead, the same
//! way a real crash would only be visible through hypervisor state, not
//! through the protocol code driving it.

use std::collections::HashMap;

/// One of the five deterministic fault points spec'd for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Source: before suspend.
    BeforeSuspend,
    /// Source: force domain crash during suspend.
    CrashDuringSuspend,
    /// Source: after suspend, before flush.
    AfterSuspendBeforeFlush,
    /// Destination: before memory restore.
    BeforeMemoryRestore,
    /// Destination: simulated crash after restore (continues).
    DestinationCrashAfterRestore,
}

impl FaultPoint {
    fn from_other_config_value(v: &str) -> Option<Self> {
        match v.trim() {
            "1" => Some(Self::BeforeSuspend),
            "2" => Some(Self::CrashDuringSuspend),
            "3" => Some(Self::AfterSuspendBeforeFlush),
            "4" => Some(Self::BeforeMemoryRestore),
            "5" => Some(Self::DestinationCrashAfterRestore),
            _ => None,
        }
    }
}

/// Decides whether a given fault point should fire for this migration.
pub trait FaultInjector: Send + Sync {
    fn active_point(&self) -> Option<FaultPoint>;

    fn is_active(&self, point: FaultPoint) -> bool {
        self.active_point() == Some(point)
    }
}

/// Production default: never injects a fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn active_point(&self) -> Option<FaultPoint> {
        None
    }
}

/// Reads `migration_failure_test_key` from a VM's `other_config`.
#[derive(Debug, Clone)]
pub struct OtherConfigFaultInjector {
    point: Option<FaultPoint>,
}

impl OtherConfigFaultInjector {
    pub const KEY: &'static str = "migration_failure_test_key";

    pub fn from_other_config(other_config: &HashMap<String, String>) -> Self {
        let point = other_config
            .get(Self::KEY)
            .and_then(|v| FaultPoint::from_other_config_value(v));
        Self { point }
    }
}

impl FaultInjector for OtherConfigFaultInjector {
    fn active_point(&self) -> Option<FaultPoint> {
        self.point
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_points() {
        let cfg = HashMap::from([(OtherConfigFaultInjector::KEY.to_string(), "2".to_string())]);
        let injector = OtherConfigFaultInjector::from_other_config(&cfg);
        assert!(injector.is_active(FaultPoint::CrashDuringSuspend));
        assert!(!injector.is_active(FaultPoint::BeforeSuspend));
    }

    #[test]
    fn ignores_out_of_range_or_missing() {
        let cfg = HashMap::from([(OtherConfigFaultInjector::KEY.to_string(), "9".to_string())]);
        assert!(OtherConfigFaultInjector::from_other_config(&cfg)
            .active_point()
            .is_none());
        assert!(OtherConfigFaultInjector::from_other_config(&HashMap::new())
            .active_point()
            .is_none());
    }

    #[test]
    fn no_faults_never_fires() {
        assert!(!NoFaults.is_active(FaultPoint::BeforeSuspend));
    }
}
