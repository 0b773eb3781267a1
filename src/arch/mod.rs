//! Architecture back-ends
//!
//! Instruction encodings, relocation encoders and the code templates of the
//! built-in thunk kinds. Everything above this module treats instruction
//! words as opaque and goes through [`RelocEncoder`].
//!
//! [`RelocEncoder`]: crate::thunk::RelocEncoder

pub mod aarch64;
pub mod aarch64c;
pub mod insn;
pub mod templates;

pub use aarch64::A64Encoder;
pub use aarch64c::C64Encoder;

use crate::thunk::reloc::{RelocError, RelocValue};

/// Splice a 16-bit chunk into the move-wide at `offset`.
fn patch_move_wide(offset: usize, value: RelocValue, word: u32) -> Result<u32, RelocError> {
    if !insn::is_move_wide(word) {
        return Err(RelocError::InstructionMismatch { offset, word });
    }
    let chunk = u16::try_from(value).map_err(|_| RelocError::ValueOutOfRange(value))?;
    log::trace!("reloc: mov imm at +{:#x} = {:#06x}", offset, chunk);
    Ok(insn::with_imm16(word, chunk))
}
