//! Bounded, non-blocking audit queue.

use std::sync::Arc;

use shell_broker_core::{AuditRecord, AuditSink};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::warn;

/// Hands records to a background task that forwards them to an inner sink.
///
/// `record` never blocks: when the queue is full the record is dropped.
pub struct QueuedAudit {
    tx: mpsc::Sender<AuditRecord>,
}

impl QueuedAudit {
    /// Start the drain task. It exits once every `QueuedAudit` handle is
    /// dropped and the queue is empty.
    #[must_use]
    pub fn spawn(inner: Arc<dyn AuditSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                inner.record(record);
            }
        });
        (Self { tx }, handle)
    }
}

impl AuditSink for QueuedAudit {
    fn record(&self, record: AuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!(session_id = %record.session_id(), "Audit queue full, dropping record");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Audit drain task stopped, dropping record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use shell_broker_core::{SessionId, config::AuditConfig};
    use tokio_test::assert_ok;

    use super::*;
    use crate::audit::MemoryAudit;

    fn input(id: SessionId) -> AuditRecord {
        AuditRecord::input(id, "alice", b"ls\n", &AuditConfig::default())
    }

    #[tokio::test]
    async fn test_records_reach_inner_sink() {
        let memory = Arc::new(MemoryAudit::new());
        let (queue, handle) = QueuedAudit::spawn(Arc::clone(&memory) as Arc<dyn AuditSink>, 8);
        let id = SessionId::new_v4();

        queue.record(input(id));
        queue.record(input(id));
        drop(queue);
        assert_ok!(handle.await);

        assert_eq!(memory.for_session(id).len(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let memory = Arc::new(MemoryAudit::new());
        let (queue, handle) = QueuedAudit::spawn(Arc::clone(&memory) as Arc<dyn AuditSink>, 2);
        let id = SessionId::new_v4();

        // The current-thread runtime has not polled the drain task yet.
        for _ in 0..10 {
            queue.record(input(id));
        }
        drop(queue);
        assert_ok!(handle.await);

        assert_eq!(memory.records().len(), 2);
    }
}
