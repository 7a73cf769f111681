//! Audit records for connect attempts and input events.

use std::{
    sync::LazyLock,
    time::{SystemTime, UNIX_EPOCH},
};

use regex::Regex;
use serde::Serialize;

use crate::{ConnectTarget, ErrorKind, SessionId, config::AuditConfig};

/// Patterns for commands worth flagging in the audit trail.
const DANGEROUS_COMMANDS: &[&str] = &[
    r"rm\s+-rf\s+/",
    r"format\s+",
    r"fdisk\s+",
    r"mkfs\.",
    r"dd\s+if=/dev/zero",
    r":\(\)\{\s*:\|:&\s*\};",
    r"shutdown\s+",
    r"reboot\s+",
    r"poweroff\s+",
    r"halt\s+",
];

static DANGEROUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    DANGEROUS_COMMANDS
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
        .collect()
});

/// Outcome of a connect attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConnectOutcome {
    Connected,
    Failed { kind: ErrorKind, reason: String },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditRecord {
    ConnectAttempt {
        session_id: SessionId,
        owner: String,
        host: String,
        port: u16,
        username: String,
        outcome: ConnectOutcome,
        /// Unix epoch seconds.
        at: i64,
    },
    Input {
        session_id: SessionId,
        owner: String,
        bytes: usize,
        /// Sanitized content, only when the policy records it.
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        dangerous: bool,
        at: i64,
    },
}

impl AuditRecord {
    #[must_use]
    pub fn connect_attempt(
        session_id: SessionId,
        owner: &str,
        target: &ConnectTarget,
        outcome: ConnectOutcome,
    ) -> Self {
        Self::ConnectAttempt {
            session_id,
            owner: owner.to_string(),
            host: target.host.clone(),
            port: target.port,
            username: target.username.clone(),
            outcome,
            at: unix_now(),
        }
    }

    /// Build an input record according to the audit policy.
    #[must_use]
    pub fn input(session_id: SessionId, owner: &str, data: &[u8], policy: &AuditConfig) -> Self {
        let text = String::from_utf8_lossy(data);
        let dangerous = policy.flag_dangerous_commands && is_dangerous_command(&text);
        let content = policy
            .record_input_content
            .then(|| sanitize_content(&text, policy.content_limit));

        Self::Input {
            session_id,
            owner: owner.to_string(),
            bytes: data.len(),
            content,
            dangerous,
            at: unix_now(),
        }
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        match self {
            Self::ConnectAttempt { session_id, .. } | Self::Input { session_id, .. } => *session_id,
        }
    }
}

/// Whether the text contains a command from the dangerous list.
#[must_use]
pub fn is_dangerous_command(command: &str) -> bool {
    DANGEROUS_PATTERNS.iter().any(|p| p.is_match(command))
}

/// Strip NUL bytes and cap the length at `limit` characters.
#[must_use]
pub fn sanitize_content(input: &str, limit: usize) -> String {
    let cleaned: String = input.chars().filter(|c| *c != '\0').collect();
    if cleaned.chars().count() > limit {
        let mut truncated: String = cleaned.chars().take(limit).collect();
        truncated.push_str("... (truncated)");
        truncated
    } else {
        cleaned
    }
}

/// Current time as Unix epoch seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
