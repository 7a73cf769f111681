//! In-memory audit sink.

use std::sync::RwLock;

use shell_broker_core::{AuditRecord, AuditSink, SessionId};

/// Keeps every record in memory.
///
/// Useful for tests and single-process inspection. Data is lost on restart.
#[derive(Default)]
pub struct MemoryAudit {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAudit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in arrival order.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .read()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Records belonging to one session.
    #[must_use]
    pub fn for_session(&self, id: SessionId) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.session_id() == id)
            .collect()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.write() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use shell_broker_core::{ConnectOutcome, ConnectTarget, config::AuditConfig};

    use super::*;

    #[test]
    fn test_records_by_session() {
        let audit = MemoryAudit::new();
        let a = SessionId::new_v4();
        let b = SessionId::new_v4();
        let target = ConnectTarget {
            host: "h".into(),
            port: 22,
            username: "u".into(),
        };

        audit.record(AuditRecord::connect_attempt(
            a,
            "alice",
            &target,
            ConnectOutcome::Connected,
        ));
        audit.record(AuditRecord::input(b, "bob", b"ls\n", &AuditConfig::default()));
        audit.record(AuditRecord::input(a, "alice", b"pwd\n", &AuditConfig::default()));

        assert_eq!(audit.records().len(), 3);
        assert_eq!(audit.for_session(a).len(), 2);
        assert_eq!(audit.for_session(b).len(), 1);
    }
}
