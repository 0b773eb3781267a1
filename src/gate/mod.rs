//! Gate/token authorisation
//!
//! A gate exchanges tokens for capabilities. Each gate class reserves a
//! token space: an address range with no backing, sized to the object.
//! Holders derive tokens by narrowing the root token, and a gate object
//! turns a token into a capability over the same offset, length and
//! permissions of its private data.
//!
//! # Design
//! - No lookup tables: the mapping is pure address arithmetic in the
//!   compiled dispatch code
//! - No revocation: tokens can only be narrowed, never widened
//! - `GateRegistry` owns the live gate classes behind one mutex
//!
//! # Security Properties
//! - A token outside the token space or the object yields an untagged
//!   capability, never one outside the object
//! - Results never carry execute, trust or unmap permissions
//! - Gates refuse destruction while objects are live; token space
//!   addresses are never reused

pub mod class;
pub mod registry;
pub mod token;

pub use class::{GateClass, GateMetaclass, GATE_METACLASS, MAX_GATE_PERMS};
pub use registry::GateRegistry;
pub use token::{derive_field_token, Token};

use core::fmt;

use crate::mm::MapError;
use crate::thunk::ThunkError;

/// Error type for gate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// Compiling, allocating or freeing a gate object failed.
    Thunk(ThunkError),
    /// Reserving or releasing the token space failed.
    Map(MapError),
    /// The gate has been destroyed.
    Destroyed,
    /// The gate still has live objects.
    Busy { live: usize },
    /// The object is not a trusted thunk.
    Untrusted,
    /// The gate is not registered here.
    UnknownGate,
    /// The token space lies above what the dispatch code can address.
    TokenSpaceTooHigh(usize),
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thunk(e) => write!(f, "gate object: {}", e),
            Self::Map(e) => write!(f, "token space: {}", e),
            Self::Destroyed => write!(f, "gate destroyed"),
            Self::Busy { live } => write!(f, "gate busy with {} live objects", live),
            Self::Untrusted => write!(f, "object is not a trusted gate"),
            Self::UnknownGate => write!(f, "unknown gate"),
            Self::TokenSpaceTooHigh(base) => write!(f, "token space at {:#x} out of reach", base),
        }
    }
}

impl From<ThunkError> for GateError {
    fn from(e: ThunkError) -> Self {
        match e {
            ThunkError::Untrusted => Self::Untrusted,
            other => Self::Thunk(other),
        }
    }
}

impl From<MapError> for GateError {
    fn from(e: MapError) -> Self {
        Self::Map(e)
    }
}
