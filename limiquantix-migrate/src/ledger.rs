//! Resource ledger: tracks, per side, which disks are attached/activated
//! and which domain is created, so the guaranteed-release path can undo
//! exactly what was done and nothing else.

/// Source-side ledger. Starts assuming the worst (everything still needs
/// releasing) and is narrowed as the transmitter makes progress.
#[derive(Debug, Clone)]
pub struct SourceLedger {
    pub deactivate_in_finally: bool,
    pub detach_in_finally: bool,
    /// VDIs this side still owns (i.e. has not yet handed off or released).
    pub vdis: Vec<String>,
}

impl SourceLedger {
    /// `is_localhost` mirrors the spec's initial values: localhost
    /// migrations never deactivate (there is nothing to hand off), but
    /// always start assuming a detach is owed.
    pub fn new(is_localhost: bool, vdis: Vec<String>) -> Self {
        Self {
            deactivate_in_finally: !is_localhost,
            detach_in_finally: true,
            vdis,
        }
    }
}

/// Destination-side ledger. Tracks `(sr_id, vdi_id)` pairs so a rollback
/// can detach through the same SR the attach used.
#[derive(Debug, Clone, Default)]
pub struct DestLedger {
    pub attached_vdis: Vec<(String, String)>,
    /// Subset of `attached_vdis` that has also been activated -- only
    /// these need a deactivate call during rollback, never a plain detach.
    pub activated_vdis: Vec<(String, String)>,
    pub created_domid: Option<u32>,
}

impl DestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attached(&mut self, sr_id: impl Into<String>, vdi_id: impl Into<String>) {
        self.attached_vdis.push((sr_id.into(), vdi_id.into()));
    }

    pub fn record_activated(&mut self, sr_id: impl Into<String>, vdi_id: impl Into<String>) {
        self.activated_vdis.push((sr_id.into(), vdi_id.into()));
    }

    pub fn record_domain_created(&mut self, domid: u32) {
        self.created_domid = Some(domid);
    }

    pub fn clear_domain(&mut self) {
        self.created_domid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ledger_localhost_skips_deactivate() {
        let l = SourceLedger::new(true, vec!["vdi-1".into()]);
        assert!(!l.deactivate_in_finally);
        assert!(l.detach_in_finally);
    }

    #[test]
    fn source_ledger_remote_requires_deactivate() {
        let l = SourceLedger::new(false, vec!["vdi-1".into()]);
        assert!(l.deactivate_in_finally);
        assert!(l.detach_in_finally);
    }

    #[test]
    fn dest_ledger_tracks_created_domain() {
        let mut l = DestLedger::new();
        assert!(l.created_domid.is_none());
        l.record_domain_created(42);
        assert_eq!(l.created_domid, Some(42));
        l.clear_domain();
        assert!(l.created_domid.is_none());
    }
}
