//! Memory management
//!
//! Provides:
//! - The simulated address space (backed mappings and guard reservations)
//! - Executable memory providers for the thunk compiler
//! - Allocation shims that strip trust and restrict sharing
//!
//! # Security Principles
//! - Every access is capability-checked
//! - Fresh memory is zeroed, released memory is scrubbed
//! - Holders of a buffer cannot unmap it

pub mod address_space;
pub mod provider;
pub mod shim;

pub use address_space::{AddressSpace, Fault, MapError, Prot};
pub use provider::{ArenaProvider, MappedProvider, MemoryProvider, ProviderError};
pub use shim::{acquire_at_level, restrict_level, Level, TrustStripping};
