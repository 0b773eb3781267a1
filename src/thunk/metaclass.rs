//! Templates and Metaclasses
//!
//! A metaclass is one kind of thunk: a read-only code template plus the
//! patch points every instance of that kind fills in. Metaclasses are
//! `static` and never change after the program is built.

use core::fmt;

use super::reloc::Reloc;

/// Error type for malformed templates and metaclasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaclassError {
    /// The template end does not match the template's own extent.
    SizeMismatch { end: usize, len: usize },
    /// The template holds no code.
    EmptyTemplate,
    /// A patch point lies outside the template.
    PatchOutOfBounds(usize),
    /// A patch point is not on an instruction boundary.
    MisalignedPatch(usize),
    /// Two relocations share a patch point.
    DuplicatePatch(usize),
}

impl fmt::Display for MetaclassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { end, len } => {
                write!(f, "template end {:#x} does not match template size {:#x}", end, len)
            }
            Self::EmptyTemplate => write!(f, "empty template"),
            Self::PatchOutOfBounds(o) => write!(f, "patch point {:#x} outside template", o),
            Self::MisalignedPatch(o) => write!(f, "misaligned patch point {:#x}", o),
            Self::DuplicatePatch(o) => write!(f, "duplicate patch point {:#x}", o),
        }
    }
}

/// Immutable, position-independent code plus its end boundary.
#[derive(Debug)]
pub struct Template {
    words: &'static [u32],
    end: usize,
}

impl Template {
    /// Describe `words`, ending `end` bytes from the start.
    pub const fn new(words: &'static [u32], end: usize) -> Self {
        Self { words, end }
    }

    /// Instruction words.
    pub fn words(&self) -> &'static [u32] {
        self.words
    }

    /// Code size in bytes, cross-checked against the words themselves.
    pub fn code_size(&self) -> Result<usize, MetaclassError> {
        let len = self.words.len() * 4;
        if self.end != len {
            return Err(MetaclassError::SizeMismatch { end: self.end, len });
        }
        if len == 0 {
            return Err(MetaclassError::EmptyTemplate);
        }
        Ok(len)
    }
}

/// A thunk kind: template and relocation descriptors.
#[derive(Debug)]
pub struct Metaclass {
    name: &'static str,
    template: &'static Template,
    relocs: &'static [Reloc],
}

impl Metaclass {
    pub const fn new(name: &'static str, template: &'static Template, relocs: &'static [Reloc]) -> Self {
        Self {
            name,
            template,
            relocs,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn template(&self) -> &'static Template {
        self.template
    }

    /// Relocation descriptors, in the order classes supply values.
    pub fn relocs(&self) -> &'static [Reloc] {
        self.relocs
    }

    /// Code size of the template.
    pub fn code_size(&self) -> Result<usize, MetaclassError> {
        self.template.code_size()
    }

    /// Check the template and every patch point, returning the code size.
    pub fn validate(&self) -> Result<usize, MetaclassError> {
        let code_size = self.code_size()?;
        for (i, reloc) in self.relocs.iter().enumerate() {
            if reloc.offset % 4 != 0 {
                return Err(MetaclassError::MisalignedPatch(reloc.offset));
            }
            if reloc.offset >= code_size {
                return Err(MetaclassError::PatchOutOfBounds(reloc.offset));
            }
            if self.relocs[..i].iter().any(|r| r.offset == reloc.offset) {
                return Err(MetaclassError::DuplicatePatch(reloc.offset));
            }
        }
        Ok(code_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::insn::{movz, ret};
    use crate::thunk::reloc::RelocKind;

    static WORDS: [u32; 2] = [movz(0, 0, 0), ret()];
    static GOOD: Template = Template::new(&WORDS, 8);
    static SHORT: Template = Template::new(&WORDS, 4);
    static RELOC: [Reloc; 1] = [Reloc::new(RelocKind::MovImm, 0)];
    static OUTSIDE: [Reloc; 1] = [Reloc::new(RelocKind::MovImm, 8)];
    static SKEWED: [Reloc; 1] = [Reloc::new(RelocKind::MovImm, 2)];
    static TWICE: [Reloc; 2] = [Reloc::new(RelocKind::MovImm, 0), Reloc::new(RelocKind::MovImm, 0)];

    #[test]
    fn test_code_size_cross_check() {
        assert_eq!(GOOD.code_size(), Ok(8));
        assert_eq!(SHORT.code_size(), Err(MetaclassError::SizeMismatch { end: 4, len: 8 }));
    }

    #[test]
    fn test_validate_patch_points() {
        assert_eq!(Metaclass::new("ok", &GOOD, &RELOC).validate(), Ok(8));
        assert_eq!(
            Metaclass::new("outside", &GOOD, &OUTSIDE).validate(),
            Err(MetaclassError::PatchOutOfBounds(8))
        );
        assert_eq!(
            Metaclass::new("skewed", &GOOD, &SKEWED).validate(),
            Err(MetaclassError::MisalignedPatch(2))
        );
        assert_eq!(
            Metaclass::new("twice", &GOOD, &TWICE).validate(),
            Err(MetaclassError::DuplicatePatch(0))
        );
        assert!(Metaclass::new("short", &SHORT, &RELOC).validate().is_err());
    }
}
