//! Thunk invocation
//!
//! A sealed entry capability can only be branched to. Branching unseals it
//! into PCC, so the callee runs with the rights of its whole object while
//! the caller never holds an unsealed copy.

mod cpu;

pub use cpu::Cpu;

use core::fmt;

use crate::cap::Capability;
use crate::mm::{AddressSpace, Fault};

/// Abnormal end of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// A fetch faulted.
    Fault { pc: usize, fault: Fault },
    /// The word at `pc` is not an implemented instruction.
    Undefined { pc: usize, word: u32 },
    /// The call did not return within its instruction budget.
    StepBudget,
    /// The branch target is not a valid sealed entry.
    BadEntry,
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault { pc, fault } => write!(f, "{} at pc {:#x}", fault, pc),
            Self::Undefined { pc, word } => {
                write!(f, "undefined instruction {:#010x} at pc {:#x}", word, pc)
            }
            Self::StepBudget => write!(f, "instruction budget exhausted"),
            Self::BadEntry => write!(f, "branch to non-entry capability"),
        }
    }
}

/// Call `entry` with `args` in `c0`, `c1`, ... and return `c0`.
pub fn call(space: &AddressSpace, entry: Capability, args: &[Capability]) -> Result<Capability, Trap> {
    let mut cpu = Cpu::new(space);
    for (n, arg) in args.iter().take(8).enumerate() {
        cpu.set(n as u8, *arg);
    }
    cpu.call(entry)
}
