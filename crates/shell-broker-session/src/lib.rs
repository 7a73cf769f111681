//! Session lifecycle for the remote shell broker.
//!
//! Provides:
//! - `Session` - one bridged remote shell and its state machine
//! - `Registry` - live sessions by identifier
//! - `OutputRelay` - per-session shell output reader
//! - `IdleSweeper` - periodic idle teardown
//! - `Broker` - the operations a transport channel requests
//! - Audit sinks (memory, tracing, bounded queue)

pub mod audit;
pub mod broker;
pub mod registry;
pub mod relay;
pub mod session;
pub mod sweeper;

pub use broker::{Broker, PendingConnect};
pub use registry::{Registry, RegistryError, RegistryPolicy};
pub use relay::OutputRelay;
pub use session::{Ending, Session, status_event};
pub use sweeper::IdleSweeper;
