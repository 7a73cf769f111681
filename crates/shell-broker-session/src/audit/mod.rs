//! Audit sink implementations.

pub mod log;
pub mod memory;
pub mod queue;

pub use log::TracingAudit;
pub use memory::MemoryAudit;
pub use queue::QueuedAudit;
