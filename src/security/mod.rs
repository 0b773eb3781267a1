//! Security Primitives
//!
//! - Scrubbing of memory released by the address space
//!
//! # Security Properties
//! - Private data regions are zeroed before their storage is reused
//! - Clearing uses volatile writes that cannot be optimised away

pub mod zeroize;

pub use zeroize::{ScrubbedBytes, Zeroize};
