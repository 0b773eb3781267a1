//! Capability CPU
//!
//! Executes thunk code out of the address space. Every fetch goes through
//! PCC and every capability operation goes through [`Capability`], so the
//! code gets exactly the rights its entry capability carries.

use crate::arch::insn::{decode, CapOp, Insn, XZR};
use crate::cap::{Capability, Perms};
use crate::config::VM_STEP_BUDGET;
use crate::mm::AddressSpace;

use super::Trap;

/// Register file and program counter capability of one invocation.
pub struct Cpu<'a> {
    space: &'a AddressSpace,
    regs: [Capability; 32],
    pcc: Capability,
    steps: usize,
    budget: usize,
}

impl<'a> Cpu<'a> {
    /// Create a CPU with all registers null.
    pub fn new(space: &'a AddressSpace) -> Self {
        Self {
            space,
            regs: [Capability::null(); 32],
            pcc: Capability::null(),
            steps: 0,
            budget: VM_STEP_BUDGET,
        }
    }

    /// Limit the number of instructions one call may execute.
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    /// Set capability register `n`.
    pub fn set(&mut self, n: u8, value: Capability) {
        if n != XZR {
            self.regs[n as usize] = value;
        }
    }

    /// Read capability register `n`.
    pub fn get(&self, n: u8) -> Capability {
        if n == XZR {
            Capability::null()
        } else {
            self.regs[n as usize]
        }
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Integer view of register `n`.
    #[inline]
    fn x(&self, n: u8) -> u64 {
        self.get(n).address() as u64
    }

    /// Integer write: the register loses its tag.
    #[inline]
    fn set_x(&mut self, n: u8, value: u64) {
        self.set(n, Capability::from_address(value as usize));
    }

    /// Branch to the sealed entry `entry` and run until `RET`.
    ///
    /// Returns the contents of `c0` at return.
    pub fn call(&mut self, entry: Capability) -> Result<Capability, Trap> {
        self.pcc = entry.unseal_entry().ok_or(Trap::BadEntry)?;

        loop {
            if self.steps >= self.budget {
                return Err(Trap::StepBudget);
            }
            let pc = self.pcc.address();
            let word = self
                .space
                .fetch(&self.pcc)
                .map_err(|fault| Trap::Fault { pc, fault })?;
            let insn = decode(word).ok_or(Trap::Undefined { pc, word })?;
            self.steps += 1;

            let mut next = pc.wrapping_add(4);
            match insn {
                Insn::Movz { rd, imm16, shift } => self.set_x(rd, (imm16 as u64) << shift),
                Insn::Movk { rd, imm16, shift } => {
                    let value = (self.x(rd) & !(0xFFFFu64 << shift)) | ((imm16 as u64) << shift);
                    self.set_x(rd, value);
                }
                Insn::Adr { rd, disp } => {
                    let target = pc.wrapping_add_signed(disp as isize);
                    self.set(rd, self.pcc.with_address(target));
                }
                Insn::Sub { rd, rn, rm } => self.set_x(rd, self.x(rn).wrapping_sub(self.x(rm))),
                Insn::Cbz { rt, disp } => {
                    if self.x(rt) == 0 {
                        next = pc.wrapping_add_signed(disp as isize);
                    }
                }
                Insn::Ret => {
                    log::trace!("vm: ret after {} steps", self.steps);
                    return Ok(self.get(0));
                }
                Insn::Cap { op, rd, rn, rm } => self.exec_cap(op, rd, rn, rm),
            }
            self.pcc = self.pcc.with_address(next);
        }
    }

    fn exec_cap(&mut self, op: CapOp, rd: u8, rn: u8, rm: u8) {
        let cn = self.get(rn);
        let xm = self.x(rm);
        match op {
            CapOp::GetBase => self.set_x(rd, cn.base() as u64),
            CapOp::GetLen => self.set_x(rd, cn.length() as u64),
            CapOp::GetLimit => self.set_x(rd, cn.top() as u64),
            CapOp::GetValue => self.set_x(rd, cn.address() as u64),
            CapOp::GetPerm => self.set_x(rd, cn.perms().bits() as u64),
            CapOp::GetTag => self.set_x(rd, cn.is_valid() as u64),
            CapOp::Add => self.set(rd, cn.with_address(cn.address().wrapping_add(xm as usize))),
            CapOp::SetBoundsExact => self.set(rd, cn.set_bounds_exact(xm as usize)),
            CapOp::SetBounds => self.set(rd, cn.set_bounds(xm as usize)),
            CapOp::AndPerm => {
                let mask = Perms::from_bits_truncate(xm as u32);
                self.set(rd, cn.permission_intersect(mask));
            }
            CapOp::ClearTag => self.set(rd, cn.invalidate()),
            CapOp::Mov => self.set(rd, cn),
        }
    }
}
