//! Tokens
//!
//! A token is an ordinary capability whose bounds lie in a gate's token
//! space. Its base is unmapped, so it is useless as a pointer, but its
//! offset, length and permissions fully determine what a gate hands out in
//! exchange for it.
//!
//! Deriving a token is pure capability narrowing: no registry, no lookup,
//! and nothing a holder derives can exceed the token it started from.

use core::mem::size_of;

use crate::cap::{Capability, Perms};

/// Authorisation token for a gate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct Token(Capability);

impl Token {
    /// Treat `cap` as a token. Nothing is checked; the gate decides.
    #[inline]
    pub const fn from_capability(cap: Capability) -> Self {
        Self(cap)
    }

    #[inline]
    pub const fn capability(&self) -> Capability {
        self.0
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0.is_valid()
    }

    #[inline]
    pub const fn base(&self) -> usize {
        self.0.base()
    }

    #[inline]
    pub const fn length(&self) -> usize {
        self.0.length()
    }

    #[inline]
    pub const fn perms(&self) -> Perms {
        self.0.perms()
    }

    /// Narrow to `[offset, offset + len)` relative to this token.
    #[inline]
    pub fn narrow(&self, offset: usize, len: usize) -> Self {
        derive_field_token(self, offset, len)
    }

    /// Drop every permission not in `mask`.
    #[inline]
    pub fn restrict(&self, mask: Perms) -> Self {
        Self(self.0.permission_intersect(mask))
    }

    /// Check whether this token grants nothing beyond `other`.
    pub fn is_subset_of(&self, other: &Token) -> bool {
        self.0.is_subset_of(&other.0)
    }
}

/// Derive the token for one field from a token over the whole object.
///
/// The bounds must be exact: the gate maps token offsets byte for byte.
pub fn derive_field_token(root: &Token, offset: usize, len: usize) -> Token {
    Token(root.0.bounds_narrow_exact(offset, len))
}

/// Size of the field selected by `field`.
#[doc(hidden)]
pub fn field_size<T, F>(_field: fn(&T) -> &F) -> usize {
    size_of::<F>()
}

/// Derive the token for `$field` of `$ty` from the token `$root`.
///
/// ```ignore
/// let b = token_for!(root, Pair, b);
/// ```
#[macro_export]
macro_rules! token_for {
    ($root:expr, $ty:ty, $field:ident) => {
        $crate::gate::derive_field_token(
            &$root,
            ::core::mem::offset_of!($ty, $field),
            $crate::gate::token::field_size::<$ty, _>(|v: &$ty| &v.$field),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[repr(C)]
    struct Header {
        magic: u32,
        flags: u16,
        kind: u16,
        len: u64,
    }

    fn root() -> Token {
        Token(Capability::root(0x7000_0000, 0x1000, Perms::DATA).bounds_narrow_exact(0, 16))
    }

    #[test]
    fn test_field_tokens_narrow() {
        let root = root();
        let len = crate::token_for!(root, Header, len);
        assert_eq!(len.base(), root.base() + 8);
        assert_eq!(len.length(), 8);
        assert!(len.is_subset_of(&root));

        let kind = crate::token_for!(root, Header, kind);
        assert_eq!(kind.base(), root.base() + 6);
        assert_eq!(kind.length(), 2);

        let magic = crate::token_for!(root, Header, magic);
        assert_eq!((magic.base(), magic.length()), (root.base(), 4));
    }

    #[test]
    fn test_derivation_is_monotonic() {
        let root = root();
        for offset in 0..16 {
            for len in 0..=(16 - offset) {
                let t = root.narrow(offset, len);
                assert!(t.is_valid());
                assert!(t.is_subset_of(&root));
            }
        }
        assert!(!root.narrow(8, 9).is_valid());
        assert!(!root.narrow(17, 0).is_valid());

        let ro = root.restrict(Perms::READ_ONLY);
        assert!(ro.is_subset_of(&root));
        assert_eq!(ro.restrict(Perms::DATA).perms(), Perms::READ_ONLY);
    }
}
