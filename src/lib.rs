//! Sandboxed snippet execution against a curated catalog of service
//! capabilities.
//!
//! Callers discover what services exist ([`Sandbox::discover`]), compose a
//! snippet against them, and run it with [`Sandbox::execute`] under a
//! deadline and an output cap.

pub mod capabilities;
pub mod config;
pub mod frontend;
pub mod sandbox;

pub use capabilities::{Catalog, CapabilityRegistry, RegistryBuilder, Tier};
pub use config::Config;
pub use sandbox::{ExecutionRequest, ExecutionResult, ExecutionStatus, Sandbox};
