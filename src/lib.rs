//! thunkgate - JIT-assembled thunks and gate tokens for capability machines
//!
//! Small code templates are copied into executable memory, patched with
//! per-class constants and sealed as entry capabilities. Holders of such an
//! object can call it but cannot look inside.
//!
//! The main client is the gate/token protocol: a gate hands out
//! capabilities over slices of its private object data in exchange for
//! tokens, which are unbacked capabilities narrowed from a root token.
//!
//! # Layers
//! - `cap`: software capabilities with compressed-bounds representability
//! - `mm`: address space, executable memory providers, trust shim
//! - `arch`: instruction encodings, templates and relocation encoders
//! - `thunk`: metaclasses, classes and the compiler
//! - `vm`: the interpreter that invokes sealed entries
//! - `gate`, `expose`: classes built on the compiler
//!
//! # Security Properties
//! - Every capability handed out is derived from another by narrowing
//! - Objects are only reachable through sealed entries
//! - Trusted entries come only from executable providers
//! - Memory is zeroed before reuse and scrubbed on release

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod cap;
pub mod config;
pub mod expose;
pub mod gate;
pub mod mm;
pub mod security;
pub mod thunk;
pub mod vm;

pub use cap::{Capability, Perms};
pub use expose::ExposeClass;
pub use gate::{derive_field_token, GateClass, GateError, GateRegistry, Token};
pub use mm::{AddressSpace, MemoryProvider};
pub use thunk::{Compiler, ThunkClass, ThunkError, ThunkObject};
