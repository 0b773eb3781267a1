//! Capability Values and Permissions
//!
//! Software model of a hardware capability: an address together with the
//! bounds and permissions that authorise its use, plus a validity tag and a
//! sealing state.
//!
//! # Capability Structure
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Capability                         │
//! ├──────────────────────────────────────────────────────────┤
//! │  address: usize   - Cursor, may roam outside bounds      │
//! │  base/length      - Authorised byte range                │
//! │  perms: Perms     - Permitted operations                 │
//! │  tag: bool        - Validity; cleared on any violation   │
//! │  seal: Sealing    - Unsealed, or call-only sentry        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Properties
//! - Derivation only shrinks bounds and permissions
//! - A violation never errors: it yields an untagged capability
//! - An untagged capability authorises nothing
//! - Sealed capabilities cannot be modified or dereferenced

use core::fmt;

use super::representable::{align_down, align_up, is_exact, representable_alignment};

bitflags::bitflags! {
    /// Permissions carried by a capability.
    ///
    /// When deriving a capability, permissions can only be removed.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct Perms: u32 {
        /// May be stored through non-local authority.
        const GLOBAL = 1 << 0;
        /// Instruction fetch.
        const EXECUTE = 1 << 1;
        /// Data load.
        const LOAD = 1 << 2;
        /// Data store.
        const STORE = 1 << 3;
        /// Capability load.
        const LOAD_CAP = 1 << 4;
        /// Capability store.
        const STORE_CAP = 1 << 5;
        /// Store of non-global capabilities.
        const STORE_LOCAL_CAP = 1 << 6;
        /// Loaded capabilities keep their store permissions.
        const MUTABLE_LOAD = 1 << 7;
        /// Access to system registers.
        const SYSTEM = 1 << 8;
        /// Software: authority to unmap the backing region.
        const VMEM = 1 << 12;
        /// Software: marks trusted thunk code.
        const THUNK = 1 << 13;
    }
}

impl Perms {
    /// Read-only data access.
    pub const READ_ONLY: Self = Self::LOAD.union(Self::LOAD_CAP);

    /// Read/write data access, including capabilities.
    pub const DATA: Self = Self::LOAD
        .union(Self::STORE)
        .union(Self::LOAD_CAP)
        .union(Self::STORE_CAP)
        .union(Self::STORE_LOCAL_CAP)
        .union(Self::MUTABLE_LOAD);

    /// Everything a freshly mapped region grants.
    pub const ROOT: Self = Self::all();
}

/// Sealing state of a capability.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Sealing {
    /// Ordinary, dereferenceable capability.
    Unsealed,
    /// Sealed entry: can only be branched to.
    Sentry,
}

/// A capability: an unforgeable, bounded, permissioned reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    address: usize,
    base: usize,
    length: usize,
    perms: Perms,
    tag: bool,
    seal: Sealing,
}

impl Capability {
    /// The null capability: untagged, no bounds, no permissions.
    pub const fn null() -> Self {
        Self::from_address(0)
    }

    /// An untagged capability carrying only an integer address.
    pub const fn from_address(address: usize) -> Self {
        Self {
            address,
            base: 0,
            length: 0,
            perms: Perms::empty(),
            tag: false,
            seal: Sealing::Unsealed,
        }
    }

    /// Mint a root capability over a freshly mapped region.
    ///
    /// Only the address space creates roots; everything else is derived.
    pub(crate) const fn root(base: usize, length: usize, perms: Perms) -> Self {
        Self {
            address: base,
            base,
            length,
            perms,
            tag: true,
            seal: Sealing::Unsealed,
        }
    }

    /// Check if the validity tag is set.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.tag
    }

    /// Check if the capability is sealed.
    #[inline]
    pub const fn is_sealed(&self) -> bool {
        !matches!(self.seal, Sealing::Unsealed)
    }

    /// Get the sealing state.
    #[inline]
    pub const fn sealing(&self) -> Sealing {
        self.seal
    }

    /// Get the cursor address.
    #[inline]
    pub const fn address(&self) -> usize {
        self.address
    }

    /// Get the lowest authorised address.
    #[inline]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Get the length of the authorised range.
    #[inline]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// Get the first address past the authorised range.
    #[inline]
    pub const fn top(&self) -> usize {
        self.base.wrapping_add(self.length)
    }

    /// Get the cursor offset from the base.
    #[inline]
    pub const fn offset(&self) -> usize {
        self.address.wrapping_sub(self.base)
    }

    /// Get the permissions.
    #[inline]
    pub const fn perms(&self) -> Perms {
        self.perms
    }

    /// Check if the capability is valid and carries all of `required`.
    #[inline]
    pub const fn has_perms(&self, required: Perms) -> bool {
        self.tag && self.perms.contains(required)
    }

    /// Check if `[addr, addr + len)` lies within the bounds.
    #[inline]
    pub const fn covers(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.top(),
            None => false,
        }
    }

    /// Check if this capability authorises nothing beyond `other`.
    pub fn is_subset_of(&self, other: &Capability) -> bool {
        self.base >= other.base
            && self.top() <= other.top()
            && other.perms.contains(self.perms)
    }

    /// Clear the tag.
    #[inline]
    pub const fn invalidate(self) -> Self {
        Self { tag: false, ..self }
    }

    /// Move the cursor. Bounds are unaffected.
    pub const fn with_address(self, address: usize) -> Self {
        if self.is_sealed() {
            return Self { address, ..self }.invalidate();
        }
        Self { address, ..self }
    }

    /// Move the cursor by a signed byte delta.
    #[inline]
    pub const fn offset_by(self, delta: isize) -> Self {
        self.with_address(self.address.wrapping_add_signed(delta))
    }

    /// Narrow to `[base + offset, base + offset + length)`.
    ///
    /// Large lengths round outwards to their representable granule; the
    /// result is untagged if the rounded range leaves the current bounds.
    pub fn bounds_narrow(self, offset: usize, length: usize) -> Self {
        self.narrow_at(self.base.wrapping_add(offset), length, false)
    }

    /// Narrow to exactly `[base + offset, base + offset + length)`.
    ///
    /// The result is untagged unless the range is representable without
    /// rounding and lies within the current bounds.
    pub fn bounds_narrow_exact(self, offset: usize, length: usize) -> Self {
        self.narrow_at(self.base.wrapping_add(offset), length, true)
    }

    /// Narrow to `[address, address + length)`, rounding if needed.
    pub fn set_bounds(self, length: usize) -> Self {
        self.narrow_at(self.address, length, false)
    }

    /// Narrow to exactly `[address, address + length)`.
    pub fn set_bounds_exact(self, length: usize) -> Self {
        self.narrow_at(self.address, length, true)
    }

    fn narrow_at(self, new_base: usize, length: usize, exact: bool) -> Self {
        let Some(new_top) = new_base.checked_add(length) else {
            return self.with_address(new_base).invalidate();
        };

        let (base, top) = if exact {
            (new_base, new_top)
        } else {
            let align = representable_alignment(length);
            (align_down(new_base, align), align_up(new_top, align))
        };

        let narrowed = Self {
            address: new_base,
            base,
            length: top - base,
            ..self
        };

        let in_bounds = base >= self.base && top <= self.top();
        if !self.tag || self.is_sealed() || !in_bounds || (exact && !is_exact(base, length)) {
            return narrowed.invalidate();
        }
        narrowed
    }

    /// Intersect the permissions with `mask`.
    pub fn permission_intersect(self, mask: Perms) -> Self {
        let narrowed = Self {
            perms: self.perms.intersection(mask),
            ..self
        };
        if self.is_sealed() {
            return narrowed.invalidate();
        }
        narrowed
    }

    /// Remove the permissions in `mask`.
    #[inline]
    pub fn clear_perms(self, mask: Perms) -> Self {
        self.permission_intersect(mask.complement())
    }

    /// Seal as an entry capability.
    ///
    /// Like the hardware instruction, this needs no special authority;
    /// trust in an entry rests on the `THUNK` permission it carries.
    pub fn seal_entry(self) -> Self {
        let sealed = Self {
            seal: Sealing::Sentry,
            ..self
        };
        if self.is_sealed() || !self.perms.contains(Perms::EXECUTE) {
            return sealed.invalidate();
        }
        sealed
    }

    /// Unseal an entry capability, as a branch to it does.
    pub(crate) fn unseal_entry(self) -> Option<Self> {
        match self.seal {
            Sealing::Sentry if self.tag => Some(Self {
                seal: Sealing::Unsealed,
                ..self
            }),
            _ => None,
        }
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tag && self.length == 0 && self.perms.is_empty() {
            return write!(f, "Cap(null, addr={:#x})", self.address);
        }
        write!(
            f,
            "Cap({:#x} [{:#x}..{:#x}) {:?}{}{})",
            self.address,
            self.base,
            self.top(),
            self.perms,
            if self.is_sealed() { " sealed" } else { "" },
            if self.tag { "" } else { " untagged" },
        )
    }
}
