//! Capability Abstraction
//!
//! Thin logical layer over tagged, bounded, permissioned references.
//!
//! # Design
//! - `Capability` is a plain value; derivation returns a new value
//! - Violations clear the tag instead of failing
//! - Bounds compression is modelled by `representable`
//!
//! # Security Properties
//! - Bounds and permissions are monotonic under derivation
//! - Sealed capabilities can only be invoked
//! - Unsealing is not exposed outside the crate

pub mod capability;
pub mod representable;

pub use capability::{Capability, Perms, Sealing};
pub use representable::{
    align_up, representable_alignment, representable_alignment_mask, representable_length,
};
