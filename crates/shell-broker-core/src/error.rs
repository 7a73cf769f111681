//! Error taxonomy shared by every broker layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SessionId;

/// Error category reported to the caller on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad credentials, rejected key or password.
    Auth,
    /// Unreachable host, network drop, handshake timeout.
    Connection,
    /// Shell channel read/write failure after the session was established.
    Command,
    /// Malformed geometry, missing host/username, identifier already active.
    Validation,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Connection => "connection",
            Self::Command => "command",
            Self::Validation => "validation",
        }
    }
}

/// Why a session in `Connecting` ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    HostUnreachable,
    AuthRejected,
    Timeout,
    ChannelOpenFailed,
}

/// Remote shell client error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShellError {
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),
    #[error("Authentication rejected")]
    AuthRejected,
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to open shell channel: {0}")]
    ChannelOpenFailed(String),
    #[error("Shell channel closed")]
    ChannelClosed,
    #[error("Shell channel I/O error: {0}")]
    Io(String),
}

impl ShellError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthRejected => ErrorKind::Auth,
            Self::HostUnreachable(_) | Self::Timeout(_) | Self::ChannelOpenFailed(_) => {
                ErrorKind::Connection
            }
            Self::ChannelClosed | Self::Io(_) => ErrorKind::Command,
        }
    }

    /// The `Connecting` failure cause, if this error can happen during the handshake.
    #[must_use]
    pub const fn cause(&self) -> Option<FailureCause> {
        match self {
            Self::HostUnreachable(_) => Some(FailureCause::HostUnreachable),
            Self::AuthRejected => Some(FailureCause::AuthRejected),
            Self::Timeout(_) => Some(FailureCause::Timeout),
            Self::ChannelOpenFailed(_) => Some(FailureCause::ChannelOpenFailed),
            Self::ChannelClosed | Self::Io(_) => None,
        }
    }

    /// Caller-facing text. Auth and reachability details stay in the logs.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::AuthRejected => {
                "Authentication failed. Please check your username and password.".to_string()
            }
            Self::HostUnreachable(_) => {
                "Connection failed. Please verify the host and port.".to_string()
            }
            Self::Timeout(_) => {
                "Connection timed out. The server may be unreachable.".to_string()
            }
            Self::ChannelOpenFailed(detail) => {
                format!("The remote host did not open a shell ({detail})")
            }
            Self::ChannelClosed => "The remote shell is no longer available.".to_string(),
            Self::Io(detail) => format!("Error talking to the remote shell ({detail})"),
        }
    }
}

/// Broker operation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Authentication required")]
    Unauthenticated,
    #[error("Session {0} already has an active connection")]
    AlreadyActive(SessionId),
    #[error("Caller {0} already has an active session")]
    OwnerBusy(String),
    #[error("Session limit of {0} reached")]
    CapacityReached(usize),
    #[error("{0}")]
    InvalidParams(String),
    #[error("Invalid terminal size {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },
    #[error("No active SSH connection")]
    NotConnected,
    #[error("Terminal resize failed: {0}")]
    ResizeFailed(ShellError),
    #[error("Connection attempt cancelled")]
    Cancelled,
    /// The operation ended the session; the teardown path already reported it.
    #[error("Session ended: {0}")]
    Terminated(ShellError),
}

impl BrokerError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated => ErrorKind::Auth,
            Self::AlreadyActive(_)
            | Self::OwnerBusy(_)
            | Self::CapacityReached(_)
            | Self::InvalidParams(_)
            | Self::InvalidGeometry { .. } => ErrorKind::Validation,
            Self::NotConnected | Self::Cancelled => ErrorKind::Connection,
            Self::ResizeFailed(_) => ErrorKind::Command,
            Self::Terminated(e) => e.kind(),
        }
    }

    /// Whether the session teardown already emitted the events for this error.
    #[must_use]
    pub const fn already_reported(&self) -> bool {
        matches!(self, Self::Terminated(_) | Self::Cancelled)
    }

    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Terminated(e) => e.user_message(),
            Self::ResizeFailed(e) => format!("Terminal resize failed: {}", e.user_message()),
            other => other.to_string(),
        }
    }
}
