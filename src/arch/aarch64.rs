//! Plain A64 relocation back-end.
//!
//! Without capabilities there is no PC-relative derivation worth patching,
//! so only move-wide immediates are implemented.

use crate::thunk::reloc::{RelocEncoder, RelocError, RelocKind, RelocValue};

use super::patch_move_wide;

/// Relocation encoder for plain A64 code.
#[derive(Debug, Clone, Copy, Default)]
pub struct A64Encoder;

impl RelocEncoder for A64Encoder {
    fn supports(&self, kind: RelocKind) -> bool {
        matches!(kind, RelocKind::MovImm)
    }

    fn apply(
        &self,
        kind: RelocKind,
        patch_addr: usize,
        code_base: usize,
        value: RelocValue,
        word: u32,
    ) -> Result<u32, RelocError> {
        match kind {
            RelocKind::MovImm => patch_move_wide(patch_addr.wrapping_sub(code_base), value, word),
            other => Err(RelocError::Unsupported(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::insn::{adr, movz};

    #[test]
    fn test_adr_is_unsupported() {
        let enc = A64Encoder;
        assert!(enc.supports(RelocKind::MovImm));
        assert!(!enc.supports(RelocKind::Adr));
        assert_eq!(
            enc.apply(RelocKind::Adr, 0x1004, 0x1000, 0x40, adr(0, 0)),
            Err(RelocError::Unsupported(RelocKind::Adr))
        );
    }

    #[test]
    fn test_move_wide() {
        let enc = A64Encoder;
        let word = enc.apply(RelocKind::MovImm, 0x1000, 0x1000, 0x1234, movz(5, 0, 0)).unwrap();
        assert_eq!(word, movz(5, 0x1234, 0));
    }
}
