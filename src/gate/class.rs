//! Gate Classes
//!
//! A gate class is a thunk class of the gate dispatch metaclass, bound to
//! one token space. The token space is a guard reservation exactly as
//! aligned as the object's data region, so token offsets map one to one
//! onto data offsets.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::templates::{GATE_RELOCS, GATE_TEMPLATE};
use crate::cap::{Capability, Perms};
use crate::thunk::{ClassId, Metaclass, RelocValue, ThunkClass};

use super::token::Token;
use super::GateError;

/// Most a gate will ever grant over its object.
pub const MAX_GATE_PERMS: Perms = Perms::LOAD
    .union(Perms::STORE)
    .union(Perms::LOAD_CAP)
    .union(Perms::STORE_CAP)
    .union(Perms::GLOBAL)
    .union(Perms::STORE_LOCAL_CAP)
    .union(Perms::MUTABLE_LOAD);

/// The gate dispatch metaclass.
///
/// Same header as every metaclass; the gate relocations are, in order, the
/// token space base split into 16-bit chunks (low first, with the top chunk
/// last when `large-token-space` is enabled) and the data offset.
#[derive(Debug)]
pub struct GateMetaclass {
    header: Metaclass,
}

impl GateMetaclass {
    const fn new(header: Metaclass) -> Self {
        Self { header }
    }

    /// Common metaclass header.
    pub fn header(&'static self) -> &'static Metaclass {
        &self.header
    }

    /// Resolve the relocation values for a token space and data offset.
    pub fn reloc_values(&self, token_base: usize, data_offset: usize) -> Result<Vec<RelocValue>, GateError> {
        let base = token_base as u64;
        let mut values = vec![
            base & 0xFFFF,
            (base >> 16) & 0xFFFF,
            (base >> 32) & 0xFFFF,
            data_offset as u64,
        ];
        if cfg!(feature = "large-token-space") {
            values.push(base >> 48);
        } else if base >> 48 != 0 {
            return Err(GateError::TokenSpaceTooHigh(token_base));
        }
        debug_assert_eq!(values.len(), self.header.relocs().len());
        Ok(values)
    }
}

/// The one gate dispatch metaclass.
pub static GATE_METACLASS: GateMetaclass =
    GateMetaclass::new(Metaclass::new("gate", &GATE_TEMPLATE, &GATE_RELOCS));

/// A live gate class.
pub struct GateClass {
    class: ThunkClass,
    size: usize,
    token_space: Capability,
    root: Token,
    live_objects: AtomicUsize,
}

impl GateClass {
    pub(super) fn new(class: ThunkClass, size: usize, token_space: Capability, root: Token) -> Self {
        Self {
            class,
            size,
            token_space,
            root,
            live_objects: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> ClassId {
        self.class.id()
    }

    /// Object size the gate was created for.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The token covering the whole object with the maximum permissions.
    #[inline]
    pub fn root_token(&self) -> Token {
        self.root
    }

    #[inline]
    pub fn token_space_base(&self) -> usize {
        self.token_space.base()
    }

    /// Objects allocated from this gate and not yet freed.
    #[inline]
    pub fn live_objects(&self) -> usize {
        self.live_objects.load(Ordering::Acquire)
    }

    #[inline]
    pub fn thunk_class(&self) -> &ThunkClass {
        &self.class
    }

    /// Root of the reservation, with the authority to unmap it.
    pub(super) fn token_space(&self) -> Capability {
        self.token_space
    }

    pub(super) fn retain(&self) {
        self.live_objects.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn release(&self) {
        self.live_objects.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for GateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateClass")
            .field("id", &self.id())
            .field("size", &self.size)
            .field("token_space", &format_args!("{:#x}", self.token_space.base()))
            .field("live_objects", &self.live_objects())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::templates::{GATE_DATA_OFFSET, GATE_TOKEN_BASE_0};
    use crate::thunk::RelocKind;

    #[test]
    fn test_gate_metaclass_shape() {
        let meta = GATE_METACLASS.header();
        assert_eq!(meta.validate(), Ok(84));
        let relocs = meta.relocs();
        assert_eq!(relocs[0].kind, RelocKind::MovImm);
        assert_eq!(relocs[0].offset, GATE_TOKEN_BASE_0);
        assert_eq!(relocs[3].kind, RelocKind::Adr);
        assert_eq!(relocs[3].offset, GATE_DATA_OFFSET);
    }

    #[test]
    fn test_token_base_is_split_low_first() {
        let values = GATE_METACLASS.reloc_values(0x0000_1234_5678_9000, 0x60).unwrap();
        assert_eq!(&values[..4], &[0x9000, 0x5678, 0x1234, 0x60]);
    }

    #[cfg(not(feature = "large-token-space"))]
    #[test]
    fn test_high_token_space_needs_feature() {
        assert_eq!(
            GATE_METACLASS.reloc_values(1 << 48, 0x60),
            Err(GateError::TokenSpaceTooHigh(1 << 48))
        );
    }

    #[cfg(feature = "large-token-space")]
    #[test]
    fn test_large_token_space_top_chunk() {
        let values = GATE_METACLASS.reloc_values(0xABCD_0000_0000_0000, 0x60).unwrap();
        assert_eq!(values, vec![0, 0, 0, 0x60, 0xABCD]);
    }

    #[test]
    fn test_max_gate_perms_exclude_execute_and_trust() {
        assert!(!MAX_GATE_PERMS.contains(Perms::EXECUTE));
        assert!(!MAX_GATE_PERMS.contains(Perms::THUNK));
        assert!(!MAX_GATE_PERMS.contains(Perms::VMEM));
    }
}
