//! The interrupt module contains the supervisor interrupt kinds and their
//! delivery.

use crate::cpu::Cpu;
use crate::exception::enter_supervisor_trap;
use crate::reg::csr::CAUSE_INTERRUPT_BIT;

/// All the supervisor interrupt kinds, in delivery priority order:
/// external > software > timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorExternal,
    SupervisorSoftware,
    SupervisorTimer,
}

impl Interrupt {
    /// The cause code of this interrupt, without the interrupt bit.
    pub fn code(&self) -> u32 {
        match self {
            Interrupt::SupervisorSoftware => 1,
            Interrupt::SupervisorTimer => 5,
            Interrupt::SupervisorExternal => 9,
        }
    }

    /// Update CSRs, privilege and the program counter for this interrupt.
    /// sepc receives the address of the interrupted (not yet executed)
    /// instruction. Vectored stvec dispatch applies.
    pub fn take_trap(&self, cpu: &mut Cpu) {
        tracing::trace!(pc = cpu.pc, cause = ?self, "interrupt");
        enter_supervisor_trap(cpu, CAUSE_INTERRUPT_BIT | self.code(), 0, true);
    }
}
