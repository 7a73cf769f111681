//! Core abstractions for the remote shell session broker.
//!
//! This crate provides the fundamental building blocks:
//! - `RemoteShell` / `ShellConnection` / `ShellChannel` - the remote shell capability
//! - `EventSink` and `BrokerEvent` - outbound events for one transport channel
//! - `ConnectParams` and `Geometry` - validated connect and resize input
//! - `AuditSink` and `AuthGate` - collaborator seams
//! - `BrokerConfig` - TOML configuration

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod params;
#[cfg(feature = "testing")]
pub mod testing;
pub mod traits;

pub use audit::{AuditRecord, ConnectOutcome};
pub use auth::{AuthGate, Caller, OpenGate, RequestContext, TokenGate};
pub use config::BrokerConfig;
pub use error::{BrokerError, ErrorKind, FailureCause, ShellError};
pub use events::{BrokerEvent, EventSink, SessionSnapshot, StatusState};
pub use params::{AuthMethod, ConnectParams, ConnectTarget, Credential, Geometry};
pub use traits::{AuditSink, RemoteShell, SessionId, SessionState, ShellChannel, ShellConnection};
