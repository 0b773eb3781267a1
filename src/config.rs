//! Compile-time configuration.
//!
//! Layout of the simulated address space, capability encoding precision
//! and resource limits shared by every subsystem.

// =============================================================================
// ADDRESS SPACE LAYOUT
// =============================================================================

/// Page size (4 KiB). Mappings are page-granular.
pub const PAGE_SIZE: usize = 4096;

/// First address handed out by the mapping allocator.
pub const MAP_WINDOW_BASE: usize = 0x4000_0000;

/// End of the mapping window (48-bit virtual addresses).
pub const MAP_WINDOW_LIMIT: usize = 0x0000_FFFF_FFFF_F000;

/// Unmapped gap left after every mapping.
pub const MAP_GUARD_GAP: usize = PAGE_SIZE;

// =============================================================================
// CAPABILITY ENCODING
// =============================================================================

/// Mantissa precision of the compressed bounds encoding.
///
/// Lengths below `2^CAP_PRECISION_BITS` are always exact.
pub const CAP_PRECISION_BITS: u32 = 12;

/// Size and natural alignment of a capability in memory.
pub const CAP_SIZE: usize = 16;

/// Largest object length the encoding is asked to represent.
pub const MAX_OBJECT_SIZE: usize = 1 << 47;

/// Most backed memory one address space holds at a time (4 GiB).
///
/// Guard reservations cost nothing and are not counted.
pub const MAX_BACKED_BYTES: usize = 1 << 32;

// =============================================================================
// JIT RESOURCES
// =============================================================================

/// Default size of the executable arena used by `ArenaProvider`.
pub const DEFAULT_ARENA_SIZE: usize = 1024 * 1024;

/// Largest alignment the arena can honour.
pub const ARENA_ALIGN: usize = 64 * 1024;

/// Instruction budget for a single thunk invocation.
pub const VM_STEP_BUDGET: usize = 256;
