//! Relocations
//!
//! A relocation names one instruction word inside a template and says how a
//! class-specific value is spliced into it. Applying the bits is the job of
//! an architecture back-end implementing [`RelocEncoder`].

use core::fmt;

/// How a resolved value is inserted into an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// A 16-bit chunk goes into the immediate field of a move-wide.
    MovImm,
    /// The value is an offset from the start of the code buffer; the
    /// displacement from the patch point to it goes into a PC-relative
    /// address computation.
    Adr,
}

/// A patch point: kind plus byte offset of the word inside the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    pub kind: RelocKind,
    pub offset: usize,
}

impl Reloc {
    pub const fn new(kind: RelocKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

/// Resolved value bound to one relocation of a class.
pub type RelocValue = u64;

/// Error type for relocation processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocError {
    /// The encoder does not implement this kind.
    Unsupported(RelocKind),
    /// The PC-relative displacement does not fit the instruction.
    DisplacementOutOfRange(i64),
    /// The value does not fit the immediate field.
    ValueOutOfRange(u64),
    /// The patch point lies outside the code.
    PatchOutOfBounds(usize),
    /// The patch point is not on an instruction boundary.
    Misaligned(usize),
    /// The word at the patch point is not the instruction the kind expects.
    InstructionMismatch { offset: usize, word: u32 },
}

impl fmt::Display for RelocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(kind) => write!(f, "unsupported relocation {:?}", kind),
            Self::DisplacementOutOfRange(d) => write!(f, "displacement {:#x} out of range", d),
            Self::ValueOutOfRange(v) => write!(f, "relocation value {:#x} out of range", v),
            Self::PatchOutOfBounds(o) => write!(f, "patch point {:#x} outside code", o),
            Self::Misaligned(o) => write!(f, "misaligned patch point {:#x}", o),
            Self::InstructionMismatch { offset, word } => {
                write!(f, "unexpected instruction {:#010x} at patch point {:#x}", word, offset)
            }
        }
    }
}

/// Architecture back-end that knows the bit layout of each relocation.
pub trait RelocEncoder: Send + Sync {
    /// Check whether `kind` is implemented.
    fn supports(&self, kind: RelocKind) -> bool;

    /// Return `word` with `value` applied.
    ///
    /// `patch_addr` is the address of the word inside the freshly copied
    /// code and `code_base` the address of the code buffer.
    fn apply(
        &self,
        kind: RelocKind,
        patch_addr: usize,
        code_base: usize,
        value: RelocValue,
        word: u32,
    ) -> Result<u32, RelocError>;
}

impl<E: RelocEncoder + ?Sized> RelocEncoder for &E {
    fn supports(&self, kind: RelocKind) -> bool {
        (**self).supports(kind)
    }

    fn apply(
        &self,
        kind: RelocKind,
        patch_addr: usize,
        code_base: usize,
        value: RelocValue,
        word: u32,
    ) -> Result<u32, RelocError> {
        (**self).apply(kind, patch_addr, code_base, value, word)
    }
}
