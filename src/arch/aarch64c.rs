//! Capability A64 (C64) relocation back-end.
//!
//! `ADR` in C64 derives a capability from PCC, so patching its displacement
//! is how a template reaches the data region of its own object.

use crate::thunk::reloc::{RelocEncoder, RelocError, RelocKind, RelocValue};

use super::insn::{is_adr, with_adr_disp, ADR_RANGE};
use super::patch_move_wide;

/// Relocation encoder for C64 code.
#[derive(Debug, Clone, Copy, Default)]
pub struct C64Encoder;

impl RelocEncoder for C64Encoder {
    fn supports(&self, kind: RelocKind) -> bool {
        matches!(kind, RelocKind::MovImm | RelocKind::Adr)
    }

    fn apply(
        &self,
        kind: RelocKind,
        patch_addr: usize,
        code_base: usize,
        value: RelocValue,
        word: u32,
    ) -> Result<u32, RelocError> {
        let offset = patch_addr.wrapping_sub(code_base);
        match kind {
            RelocKind::MovImm => patch_move_wide(offset, value, word),
            RelocKind::Adr => {
                if !is_adr(word) {
                    return Err(RelocError::InstructionMismatch { offset, word });
                }
                let target = i64::try_from(value).map_err(|_| RelocError::ValueOutOfRange(value))?;
                let disp = target - offset as i64;
                if !(-ADR_RANGE..ADR_RANGE).contains(&disp) {
                    return Err(RelocError::DisplacementOutOfRange(disp));
                }
                log::trace!("reloc: adr at +{:#x} -> +{:#x} (disp {})", offset, target, disp);
                Ok(with_adr_disp(word, disp as i32))
            }
        }
    }
}
