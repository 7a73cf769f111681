//! Core traits for the remote shell capability and the audit sink.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AuditRecord, ConnectTarget, Credential, Geometry, ShellError};

/// Session identifier, one per transport channel connection.
pub type SessionId = Uuid;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Handshake and shell-channel open in progress.
    Connecting,
    /// Shell channel open, output relay running.
    Connected,
    /// Disconnect initiated, connection release requested.
    Closing,
    /// Cleanly closed.
    Closed,
    /// Ended by an error.
    Failed,
}

impl SessionState {
    /// `Closed` or `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Counts against the one-session-per-identifier rule.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Opens authenticated connections to remote hosts.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Connect and authenticate.
    ///
    /// # Errors
    /// `HostUnreachable`, `AuthRejected` or `Timeout`.
    async fn open(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
    ) -> Result<Box<dyn ShellConnection>, ShellError>;
}

/// An authenticated connection to one remote host.
#[async_trait]
pub trait ShellConnection: Send + Sync {
    /// Open an interactive shell with a pty of the given size.
    ///
    /// # Errors
    /// `ChannelOpenFailed` if the remote side refuses the pty or shell.
    async fn open_shell(&self, geometry: Geometry) -> Result<Arc<dyn ShellChannel>, ShellError>;

    /// Tear the connection down. Called once per connection.
    async fn close(&self);
}

/// Byte stream to and from a remote shell.
///
/// `read` is called from a single reader; `write`, `resize` and `close`
/// may be called concurrently with it.
#[async_trait]
pub trait ShellChannel: Send + Sync {
    /// Next chunk of shell output. `Ok(None)` is end-of-stream.
    ///
    /// A pending read must return once `close` is called.
    ///
    /// # Errors
    /// Returns error if the channel broke.
    async fn read(&self) -> Result<Option<Bytes>, ShellError>;

    /// Write raw bytes to the shell.
    ///
    /// # Errors
    /// Returns error if the channel is closed or the write failed.
    async fn write(&self, data: &[u8]) -> Result<(), ShellError>;

    /// Propagate a new terminal size to the remote pty.
    ///
    /// # Errors
    /// Returns error if the remote side rejected the window change.
    async fn resize(&self, geometry: Geometry) -> Result<(), ShellError>;

    /// Close the channel, unblocking any pending `read`.
    async fn close(&self);
}

/// Fire-and-forget audit record sink.
///
/// Implementations must not block the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}
