//! Thunk compilation engine
//!
//! A thunk is a small piece of patched code bound to a private data region.
//! Its only handle is a sealed entry capability: holders can call it, but
//! cannot read or write the code or the data behind it.
//!
//! # Design
//! - `Metaclass`: static template plus relocation descriptors
//! - `ThunkClass`: metaclass bound to a layout and resolved values
//! - `Compiler`: copies, relocates, constructs and seals objects
//!
//! # Security Properties
//! - Objects are zeroed before use and scrubbed before release
//! - A failed compilation never yields a capability
//! - Trust in an entry rests on the `THUNK` permission, which only memory
//!   from an executable provider carries

pub mod class;
pub mod compiler;
pub mod metaclass;
pub mod reloc;

pub use class::{ClassId, Constructor, Destructor, ObjectLayout, ThunkClass, ThunkObject};
pub use compiler::Compiler;
pub use metaclass::{Metaclass, MetaclassError, Template};
pub use reloc::{Reloc, RelocEncoder, RelocError, RelocKind, RelocValue};

use core::fmt;

use crate::cap::{Capability, Perms};
use crate::mm::{Fault, ProviderError};
use crate::vm::Trap;

/// Error type for class construction and compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThunkError {
    /// The metaclass is malformed.
    Metaclass(MetaclassError),
    /// A relocation could not be applied.
    Reloc(RelocError),
    /// The executable memory provider failed.
    Provider(ProviderError),
    /// Access to the object faulted.
    Fault(Fault),
    /// The constructor faulted.
    Constructor(Fault),
    /// The thunk trapped during invocation.
    Trap(Trap),
    /// Zero or oversized data size.
    InvalidSize(usize),
    /// The object leaves no room for data after the code.
    ObjectTooSmall { object_size: usize, code_size: usize },
    /// The data region cannot be described exactly.
    Unrepresentable { data_offset: usize, object_size: usize },
    /// The layout was computed for different code.
    CodeSizeMismatch { expected: usize, found: usize },
    /// The class supplies the wrong number of relocation values.
    RelocCount { expected: usize, found: usize },
    /// The destination buffer is unusable for an object of this class.
    BadBuffer,
    /// The object belongs to a different class.
    ClassMismatch { expected: ClassId, found: ClassId },
    /// The object is not live in this compiler.
    UnknownObject,
    /// The object capability is untagged.
    Invalid,
    /// The object capability is not sealed.
    NotSealed,
    /// The object does not carry the trusted thunk marking.
    Untrusted,
}

impl fmt::Display for ThunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metaclass(e) => write!(f, "malformed metaclass: {}", e),
            Self::Reloc(e) => write!(f, "relocation failed: {}", e),
            Self::Provider(e) => write!(f, "executable memory: {}", e),
            Self::Fault(e) => write!(f, "object access: {}", e),
            Self::Constructor(e) => write!(f, "constructor: {}", e),
            Self::Trap(e) => write!(f, "thunk trapped: {}", e),
            Self::InvalidSize(size) => write!(f, "invalid data size {:#x}", size),
            Self::ObjectTooSmall {
                object_size,
                code_size,
            } => write!(
                f,
                "object size {:#x} leaves no data after {:#x} bytes of code",
                object_size, code_size
            ),
            Self::Unrepresentable {
                data_offset,
                object_size,
            } => write!(
                f,
                "data region at {:#x} in {:#x}-byte object is not representable",
                data_offset, object_size
            ),
            Self::CodeSizeMismatch { expected, found } => {
                write!(f, "layout for {:#x} bytes of code, template has {:#x}", found, expected)
            }
            Self::RelocCount { expected, found } => {
                write!(f, "expected {} relocation values, found {}", expected, found)
            }
            Self::BadBuffer => write!(f, "destination buffer unusable"),
            Self::ClassMismatch { expected, found } => {
                write!(f, "object of {} used as {}", found, expected)
            }
            Self::UnknownObject => write!(f, "object is not live"),
            Self::Invalid => write!(f, "object capability is invalid"),
            Self::NotSealed => write!(f, "object capability is not sealed"),
            Self::Untrusted => write!(f, "object is not a trusted thunk"),
        }
    }
}

impl From<MetaclassError> for ThunkError {
    fn from(e: MetaclassError) -> Self {
        Self::Metaclass(e)
    }
}

impl From<RelocError> for ThunkError {
    fn from(e: RelocError) -> Self {
        Self::Reloc(e)
    }
}

impl From<ProviderError> for ThunkError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

impl From<Fault> for ThunkError {
    fn from(e: Fault) -> Self {
        Self::Fault(e)
    }
}

impl From<Trap> for ThunkError {
    fn from(e: Trap) -> Self {
        Self::Trap(e)
    }
}

/// Check that `entry` is a valid, sealed, trusted thunk entry.
///
/// `seal_entry` is unprivileged, so sealing alone proves nothing; the entry
/// must also carry `THUNK`, which general-purpose memory never has.
pub fn is_trusted(entry: &Capability) -> bool {
    entry.is_valid() && entry.is_sealed() && entry.perms().contains(Perms::THUNK | Perms::EXECUTE)
}
