//! Instruction Encodings
//!
//! The subset of A64 used by thunk templates, plus a capability group for
//! the C64 operations the gate dispatch needs.
//!
//! # Encoding Reference
//! ```text
//! MOVZ  Xd, #imm16, LSL #hw*16   1101 0010 1hwi iiii iiii iiii iiid dddd
//! MOVK  Xd, #imm16, LSL #hw*16   1111 0010 1hwi iiii iiii iiii iiid dddd
//! ADR   Cd, #imm21               0ll1 0000 hhhh hhhh hhhh hhhh hhhd dddd
//! SUB   Xd, Xn, Xm               1100 1011 000m mmmm 0000 00nn nnnd dddd
//! CBZ   Xt, #imm19*4             1011 0100 iiii iiii iiii iiii iiit tttt
//! RET                            1101 0110 0101 1111 0000 0011 1100 0000
//! CAP   op, d, n, m              1100 0010 110m mmmm oooo oonn nnnd dddd
//! ```
//!
//! `MOVZ`/`MOVK` carry their 16-bit immediate in bits 5-20. `ADR` splits its
//! signed 21-bit displacement into `immlo` (bits 29-30) and `immhi`
//! (bits 5-23).

/// Register number 31: reads as zero in the integer view.
pub const XZR: u8 = 31;

/// Displacement reach of `ADR`: the target must lie in `[-RANGE, RANGE)`.
pub const ADR_RANGE: i64 = 1 << 20;

const MOVZ: u32 = 0xD280_0000;
const MOVK: u32 = 0xF280_0000;
const MOVW_MASK: u32 = 0xFF80_0000;
const ADR: u32 = 0x1000_0000;
const ADR_MASK: u32 = 0x9F00_0000;
const SUB: u32 = 0xCB00_0000;
const SUB_MASK: u32 = 0xFFE0_FC00;
const CBZ: u32 = 0xB400_0000;
const CBZ_MASK: u32 = 0xFF00_0000;
const RET: u32 = 0xD65F_0000;
const RET_MASK: u32 = 0xFFFF_FC1F;
const CAP: u32 = 0xC2C0_0000;
const CAP_MASK: u32 = 0xFFE0_0000;

/// Bit field of the `MOVZ`/`MOVK` immediate.
pub const IMM16_FIELD: u32 = 0xFFFF << 5;

/// Bit fields of the `ADR` displacement.
pub const ADR_FIELD: u32 = (0x3 << 29) | (0x7FFFF << 5);

/// Operations of the capability instruction group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CapOp {
    /// `Xd = base(Cn)`
    GetBase = 0x01,
    /// `Xd = length(Cn)`
    GetLen = 0x02,
    /// `Xd = top(Cn)`
    GetLimit = 0x03,
    /// `Xd = address(Cn)`
    GetValue = 0x04,
    /// `Xd = perms(Cn)`
    GetPerm = 0x05,
    /// `Xd = tag(Cn)`
    GetTag = 0x06,
    /// `Cd = Cn + Xm`
    Add = 0x08,
    /// `Cd = Cn` with exact bounds `[address, address + Xm)`
    SetBoundsExact = 0x09,
    /// `Cd = Cn` with bounds `[address, address + Xm)`, rounded outwards
    SetBounds = 0x0A,
    /// `Cd = Cn` with perms `perms(Cn) & Xm`
    AndPerm = 0x0B,
    /// `Cd = Cn` untagged
    ClearTag = 0x0C,
    /// `Cd = Cn`
    Mov = 0x0D,
}

impl CapOp {
    fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0x01 => Self::GetBase,
            0x02 => Self::GetLen,
            0x03 => Self::GetLimit,
            0x04 => Self::GetValue,
            0x05 => Self::GetPerm,
            0x06 => Self::GetTag,
            0x08 => Self::Add,
            0x09 => Self::SetBoundsExact,
            0x0A => Self::SetBounds,
            0x0B => Self::AndPerm,
            0x0C => Self::ClearTag,
            0x0D => Self::Mov,
            _ => return None,
        })
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    Movz { rd: u8, imm16: u16, shift: u32 },
    Movk { rd: u8, imm16: u16, shift: u32 },
    Adr { rd: u8, disp: i64 },
    Sub { rd: u8, rn: u8, rm: u8 },
    Cbz { rt: u8, disp: i64 },
    Ret,
    Cap { op: CapOp, rd: u8, rn: u8, rm: u8 },
}

#[inline]
const fn reg(r: u8) -> u32 {
    (r & 0x1F) as u32
}

/// `MOVZ Xd, #imm16, LSL #(hw * 16)`
pub const fn movz(rd: u8, imm16: u16, hw: u32) -> u32 {
    MOVZ | ((hw & 3) << 21) | ((imm16 as u32) << 5) | reg(rd)
}

/// `MOVK Xd, #imm16, LSL #(hw * 16)`
pub const fn movk(rd: u8, imm16: u16, hw: u32) -> u32 {
    MOVK | ((hw & 3) << 21) | ((imm16 as u32) << 5) | reg(rd)
}

/// `ADR Cd, #disp`
pub const fn adr(rd: u8, disp: i32) -> u32 {
    with_adr_disp(ADR | reg(rd), disp)
}

/// `SUB Xd, Xn, Xm`
pub const fn sub(rd: u8, rn: u8, rm: u8) -> u32 {
    SUB | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd)
}

/// `CBZ Xt, #disp`, `disp` in bytes.
pub const fn cbz(rt: u8, disp: i32) -> u32 {
    CBZ | ((((disp >> 2) as u32) & 0x7FFFF) << 5) | reg(rt)
}

/// `RET`
pub const fn ret() -> u32 {
    RET | (30 << 5)
}

/// Capability group instruction.
pub const fn cap(op: CapOp, rd: u8, rn: u8, rm: u8) -> u32 {
    CAP | (reg(rm) << 16) | ((op as u32) << 10) | (reg(rn) << 5) | reg(rd)
}

/// Replace the 16-bit immediate of a `MOVZ`/`MOVK`.
#[inline]
pub const fn with_imm16(word: u32, imm16: u16) -> u32 {
    (word & !IMM16_FIELD) | ((imm16 as u32) << 5)
}

/// Replace the displacement of an `ADR`. Bits above 21 are dropped.
#[inline]
pub const fn with_adr_disp(word: u32, disp: i32) -> u32 {
    let disp = disp as u32;
    (word & !ADR_FIELD) | ((disp & 0x3) << 29) | ((disp & 0x1F_FFFC) << 3)
}

/// Check whether `word` is a `MOVZ` or `MOVK`.
#[inline]
pub const fn is_move_wide(word: u32) -> bool {
    let op = word & MOVW_MASK;
    op == MOVZ || op == MOVK
}

/// Check whether `word` is an `ADR`.
#[inline]
pub const fn is_adr(word: u32) -> bool {
    word & ADR_MASK == ADR
}

/// Sign-extend the low `bits` bits of `value`.
#[inline]
const fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// Decode one instruction word.
pub fn decode(word: u32) -> Option<Insn> {
    let rd = (word & 0x1F) as u8;
    let rn = ((word >> 5) & 0x1F) as u8;
    let rm = ((word >> 16) & 0x1F) as u8;

    let insn = match word {
        w if w & MOVW_MASK == MOVZ || w & MOVW_MASK == MOVK => {
            let imm16 = ((w >> 5) & 0xFFFF) as u16;
            let shift = ((w >> 21) & 3) * 16;
            if w & MOVW_MASK == MOVZ {
                Insn::Movz { rd, imm16, shift }
            } else {
                Insn::Movk { rd, imm16, shift }
            }
        }
        w if is_adr(w) => {
            let imm = (((w >> 5) & 0x7FFFF) << 2) | ((w >> 29) & 0x3);
            Insn::Adr {
                rd,
                disp: sign_extend(imm, 21),
            }
        }
        w if w & SUB_MASK == SUB => Insn::Sub { rd, rn, rm },
        w if w & CBZ_MASK == CBZ => Insn::Cbz {
            rt: rd,
            disp: sign_extend((w >> 5) & 0x7FFFF, 19) * 4,
        },
        w if w & RET_MASK == RET => Insn::Ret,
        w if w & CAP_MASK == CAP => Insn::Cap {
            op: CapOp::from_bits((w >> 10) & 0x3F)?,
            rd,
            rn,
            rm,
        },
        _ => return None,
    };
    Some(insn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architectural_encodings() {
        assert_eq!(movz(1, 0, 0), 0xD280_0001);
        assert_eq!(movk(1, 0, 1), 0xF2A0_0001);
        assert_eq!(ret(), 0xD65F_03C0);
        assert_eq!(adr(2, 0), 0x1000_0002);
    }

    #[test]
    fn test_imm16_field() {
        let word = with_imm16(movk(1, 0, 2), 0xBEEF);
        assert_eq!(
            decode(word),
            Some(Insn::Movk {
                rd: 1,
                imm16: 0xBEEF,
                shift: 32
            })
        );
        assert_eq!(word & !IMM16_FIELD, movk(1, 0, 2));
    }

    #[test]
    fn test_adr_displacement_fields() {
        for disp in [0i32, 1, 3, 84, -4, -1, (1 << 20) - 1, -(1 << 20)] {
            let word = adr(2, disp);
            assert_eq!(decode(word), Some(Insn::Adr { rd: 2, disp: disp as i64 }), "disp={disp}");
        }
    }

    #[test]
    fn test_branch_and_cap_group() {
        assert_eq!(decode(cbz(8, 52)), Some(Insn::Cbz { rt: 8, disp: 52 }));
        assert_eq!(decode(cbz(8, -8)), Some(Insn::Cbz { rt: 8, disp: -8 }));
        assert_eq!(decode(sub(6, 6, 7)), Some(Insn::Sub { rd: 6, rn: 6, rm: 7 }));
        assert_eq!(
            decode(cap(CapOp::SetBoundsExact, 0, 2, 4)),
            Some(Insn::Cap {
                op: CapOp::SetBoundsExact,
                rd: 0,
                rn: 2,
                rm: 4
            })
        );
    }

    #[test]
    fn test_undefined_words() {
        assert_eq!(decode(0), None);
        assert_eq!(decode(0xC2C0_0000 | (0x3F << 10)), None);
    }
}
