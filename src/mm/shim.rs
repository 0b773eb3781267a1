//! Allocation Shims
//!
//! Memory handed to ordinary code must never carry the `THUNK` permission;
//! otherwise a caller could seal its own buffer and pass it off as trusted
//! thunk code. `TrustStripping` wraps any provider and clears it.
//!
//! `restrict_level` narrows a buffer for the sharing level its owner asked
//! for: private buffers cannot escape through global stores, shareable ones
//! cannot hold local capabilities.

use crate::cap::{Capability, Perms};

use super::provider::{MemoryProvider, ProviderError};

/// Provider adapter that removes `THUNK` from every buffer it returns.
pub struct TrustStripping<P> {
    inner: P,
}

impl<P: MemoryProvider> TrustStripping<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: MemoryProvider> MemoryProvider for TrustStripping<P> {
    fn acquire(&self, size: usize) -> Result<Capability, ProviderError> {
        self.inner
            .acquire(size)
            .map(|buf| buf.clear_perms(Perms::THUNK))
    }

    fn release(&self, buf: Capability) -> Result<(), ProviderError> {
        self.inner.release(buf)
    }

    fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }
}

/// Sharing level of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Only reachable from the owner's local capabilities.
    Private,
    /// May be shared freely; must not hold local capabilities.
    Shareable,
}

/// Restrict `buf` to the given sharing level.
pub fn restrict_level(buf: Capability, level: Level) -> Capability {
    match level {
        Level::Private => buf.clear_perms(Perms::GLOBAL),
        Level::Shareable => buf.clear_perms(Perms::STORE_LOCAL_CAP),
    }
}

/// Acquire a buffer from `provider` and restrict it to `level`.
pub fn acquire_at_level<P: MemoryProvider + ?Sized>(
    provider: &P,
    size: usize,
    level: Level,
) -> Result<Capability, ProviderError> {
    provider.acquire(size).map(|buf| restrict_level(buf, level))
}
