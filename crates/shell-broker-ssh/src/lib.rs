//! Remote shell backends for the shell broker.
//!
//! Provides:
//! - `SimulatedShell` - in-process echo shell for demos and local development
//! - `RusshShell` - password-authenticated SSH via russh (feature: russh)

#[cfg(feature = "russh")]
pub mod client;
pub mod simulated;

#[cfg(feature = "russh")]
pub use client::RusshShell;
pub use simulated::SimulatedShell;
