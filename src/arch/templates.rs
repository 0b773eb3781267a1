//! Built-in thunk templates.
//!
//! Templates are position independent: the only absolute values they need
//! are spliced in through the patch points listed next to them.

use crate::thunk::metaclass::Template;
use crate::thunk::reloc::{Reloc, RelocKind};

use super::insn::{adr, cap, cbz, movk, movz, ret, sub, CapOp};

// =============================================================================
// GATE DISPATCH
// =============================================================================
//
// In:  c0 = token
// Out: c0 = capability over the matching slice of the data region,
//           or an untagged capability if the token is not authorised
//
//  0  movz    x1, #tb0               ; x1 = token space base
//  4  movk    x1, #tb16, lsl #16
//  8  movk    x1, #tb32, lsl #32
// 12  movk    x1, #tb48, lsl #48
// 16  adr     c2, #data              ; c2 = PCC, cursor at the data region
// 20  gctag   x8, c0
// 24  cbz     x8, reject
// 28  gclim   x6, c2                 ; c2 = [data, top)
// 32  gcvalue x7, c2
// 36  sub     x6, x6, x7
// 40  scbndse c2, c2, x6
// 44  gcbase  x3, c0                 ; x3 = token offset
// 48  sub     x3, x3, x1
// 52  gclen   x4, c0
// 56  gcperm  x5, c0
// 60  cadd    c2, c2, x3
// 64  scbndse c0, c2, x4             ; untagged unless inside [data, top)
// 68  andperm c0, c0, x5
// 72  ret
// 76  clrtag  c0, c0                 ; reject:
// 80  ret

pub const GATE_TOKEN_BASE_0: usize = 0;
pub const GATE_TOKEN_BASE_16: usize = 4;
pub const GATE_TOKEN_BASE_32: usize = 8;
pub const GATE_TOKEN_BASE_48: usize = 12;
pub const GATE_DATA_OFFSET: usize = 16;

static GATE_WORDS: [u32; 21] = [
    movz(1, 0, 0),
    movk(1, 0, 1),
    movk(1, 0, 2),
    movk(1, 0, 3),
    adr(2, 0),
    cap(CapOp::GetTag, 8, 0, 0),
    cbz(8, 52),
    cap(CapOp::GetLimit, 6, 2, 0),
    cap(CapOp::GetValue, 7, 2, 0),
    sub(6, 6, 7),
    cap(CapOp::SetBoundsExact, 2, 2, 6),
    cap(CapOp::GetBase, 3, 0, 0),
    sub(3, 3, 1),
    cap(CapOp::GetLen, 4, 0, 0),
    cap(CapOp::GetPerm, 5, 0, 0),
    cap(CapOp::Add, 2, 2, 3),
    cap(CapOp::SetBoundsExact, 0, 2, 4),
    cap(CapOp::AndPerm, 0, 0, 5),
    ret(),
    cap(CapOp::ClearTag, 0, 0, 0),
    ret(),
];

pub static GATE_TEMPLATE: Template = Template::new(&GATE_WORDS, 84);

/// Patch points of the gate dispatch, in relocation value order.
#[cfg(not(feature = "large-token-space"))]
pub static GATE_RELOCS: [Reloc; 4] = [
    Reloc::new(RelocKind::MovImm, GATE_TOKEN_BASE_0),
    Reloc::new(RelocKind::MovImm, GATE_TOKEN_BASE_16),
    Reloc::new(RelocKind::MovImm, GATE_TOKEN_BASE_32),
    Reloc::new(RelocKind::Adr, GATE_DATA_OFFSET),
];

/// Patch points of the gate dispatch, in relocation value order.
#[cfg(feature = "large-token-space")]
pub static GATE_RELOCS: [Reloc; 5] = [
    Reloc::new(RelocKind::MovImm, GATE_TOKEN_BASE_0),
    Reloc::new(RelocKind::MovImm, GATE_TOKEN_BASE_16),
    Reloc::new(RelocKind::MovImm, GATE_TOKEN_BASE_32),
    Reloc::new(RelocKind::Adr, GATE_DATA_OFFSET),
    Reloc::new(RelocKind::MovImm, GATE_TOKEN_BASE_48),
];

// =============================================================================
// DATA EXPOSURE
// =============================================================================
//
// Out: c0 = the whole data region, restricted to the class's permissions
//
//  0  adr     c0, #data
//  4  gclim   x6, c0
//  8  gcvalue x7, c0
// 12  sub     x6, x6, x7
// 16  scbndse c0, c0, x6
// 20  movz    x5, #perms
// 24  andperm c0, c0, x5
// 28  ret

pub const EXPOSE_DATA_OFFSET: usize = 0;
pub const EXPOSE_PERMS: usize = 20;

static EXPOSE_WORDS: [u32; 8] = [
    adr(0, 0),
    cap(CapOp::GetLimit, 6, 0, 0),
    cap(CapOp::GetValue, 7, 0, 0),
    sub(6, 6, 7),
    cap(CapOp::SetBoundsExact, 0, 0, 6),
    movz(5, 0, 0),
    cap(CapOp::AndPerm, 0, 0, 5),
    ret(),
];

pub static EXPOSE_TEMPLATE: Template = Template::new(&EXPOSE_WORDS, 32);

/// Patch points of the data exposure thunk, in relocation value order.
pub static EXPOSE_RELOCS: [Reloc; 2] = [
    Reloc::new(RelocKind::Adr, EXPOSE_DATA_OFFSET),
    Reloc::new(RelocKind::MovImm, EXPOSE_PERMS),
];
