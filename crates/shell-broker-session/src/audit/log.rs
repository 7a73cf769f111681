//! Audit sink writing to the `audit` tracing target.

use shell_broker_core::{AuditRecord, AuditSink, ConnectOutcome};
use tracing::{info, warn};

/// Logs every record as a structured event under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, record: AuditRecord) {
        match record {
            AuditRecord::ConnectAttempt {
                session_id,
                owner,
                host,
                port,
                username,
                outcome,
                at,
            } => match outcome {
                ConnectOutcome::Connected => info!(
                    target: "audit",
                    %session_id, owner = %owner, host = %host, port, username = %username, at,
                    "SSH connection established"
                ),
                ConnectOutcome::Failed { kind, reason } => warn!(
                    target: "audit",
                    %session_id, owner = %owner, host = %host, port, username = %username,
                    kind = kind.as_str(), reason = %reason, at,
                    "SSH connection failed"
                ),
            },
            AuditRecord::Input {
                session_id,
                owner,
                bytes,
                content,
                dangerous,
                at,
            } => {
                let content = content.as_deref();
                if dangerous {
                    warn!(target: "audit", %session_id, owner = %owner, bytes, content, at, "Potentially dangerous command");
                } else {
                    info!(target: "audit", %session_id, owner = %owner, bytes, content, at, "Terminal input");
                }
            }
        }
    }
}
