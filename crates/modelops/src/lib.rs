//! Model variants, device capability probing and the variant selection policy.
//!
//! Everything here is free of I/O except [`DeviceCapabilityProfile::detect`],
//! which probes the host once per process.

pub mod error;
pub mod inventory;
pub mod policy;
pub mod profile;
pub mod schema;

pub use error::*;
pub use inventory::*;
pub use policy::*;
pub use profile::*;
pub use schema::*;
