//! Scrubbing of Released Memory
//!
//! Memory handed back to the address space may have held a thunk's private
//! data region. It is overwritten before the backing storage is dropped so
//! the bytes never reach the host allocator intact.
//!
//! # Design
//! - `Zeroize` trait for byte storage that can be securely cleared
//! - `ScrubbedBytes` owns a region's backing and zeroes it on drop
//! - Volatile writes keep the compiler from eliding the clear

use alloc::collections::TryReserveError;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

/// Types that can be securely zeroed.
pub trait Zeroize {
    /// Overwrite this value with zeros in a way that is not optimised away.
    fn zeroize(&mut self);
}

impl Zeroize for [u8] {
    fn zeroize(&mut self) {
        for byte in self.iter_mut() {
            // SAFETY: `byte` is a valid, exclusive reference.
            unsafe { ptr::write_volatile(byte, 0) };
        }
        compiler_fence(Ordering::SeqCst);
    }
}

/// Backing storage of a mapped region, zeroed when dropped.
pub struct ScrubbedBytes {
    bytes: Vec<u8>,
}

impl ScrubbedBytes {
    /// Allocate `len` zeroed bytes, reporting host allocator failure.
    pub fn try_zeroed(len: usize) -> Result<Self, TryReserveError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len)?;
        bytes.resize(len, 0);
        Ok(Self { bytes })
    }
}

impl Deref for ScrubbedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for ScrubbedBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for ScrubbedBytes {
    fn drop(&mut self) {
        self.bytes.as_mut_slice().zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroize_slice() {
        let mut data = [0x42u8; 16];
        data.zeroize();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_scrubbed_bytes_start_zeroed() {
        let mut bytes = ScrubbedBytes::try_zeroed(32).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[3] = 0xff;
        bytes.zeroize();
        assert_eq!(bytes[3], 0);
    }

    #[test]
    fn test_oversized_backing_is_an_error() {
        assert!(ScrubbedBytes::try_zeroed(usize::MAX).is_err());
        assert!(ScrubbedBytes::try_zeroed(isize::MAX as usize + 1).is_err());
    }
}
