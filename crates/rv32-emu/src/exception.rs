//! The exception module contains all the exception kinds and the delivery of
//! traps into supervisor mode.

use crate::cpu::{Cpu, Mode};
use crate::reg::csr::{
    SCAUSE, SEPC, SSTATUS, SSTATUS_SIE, SSTATUS_SPIE, SSTATUS_SPP, STVAL, STVEC,
};
use thiserror::Error;

/// All the synchronous exception kinds. The payload is the value that ends up
/// in `stval`: the faulting virtual address for memory exceptions, the
/// offending instruction word for illegal instructions, the address of the
/// breakpoint for `ebreak`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("instruction address misaligned at {0:#010x}")]
    InstructionAddressMisaligned(u32),
    #[error("instruction access fault at {0:#010x}")]
    InstructionAccessFault(u32),
    #[error("illegal instruction {0:#010x}")]
    IllegalInstruction(u32),
    #[error("breakpoint at {0:#010x}")]
    Breakpoint(u32),
    #[error("load address misaligned at {0:#010x}")]
    LoadAddressMisaligned(u32),
    #[error("load access fault at {0:#010x}")]
    LoadAccessFault(u32),
    #[error("store/AMO address misaligned at {0:#010x}")]
    StoreAMOAddressMisaligned(u32),
    #[error("store/AMO access fault at {0:#010x}")]
    StoreAMOAccessFault(u32),
    #[error("environment call from U-mode")]
    EnvironmentCallFromUMode,
    #[error("environment call from S-mode")]
    EnvironmentCallFromSMode,
    #[error("instruction page fault at {0:#010x}")]
    InstructionPageFault(u32),
    #[error("load page fault at {0:#010x}")]
    LoadPageFault(u32),
    #[error("store/AMO page fault at {0:#010x}")]
    StoreAMOPageFault(u32),
}

/// The typed error channel between the interpreter and the main loop. A
/// raised guest exception is recoverable through the trap engine; a fatal
/// error is an internal invariant violation the main loop must never retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error(transparent)]
    Exception(#[from] Exception),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Exception {
    /// The scause code of this exception.
    pub fn code(&self) -> u32 {
        match self {
            Exception::InstructionAddressMisaligned(_) => 0,
            Exception::InstructionAccessFault(_) => 1,
            Exception::IllegalInstruction(_) => 2,
            Exception::Breakpoint(_) => 3,
            Exception::LoadAddressMisaligned(_) => 4,
            Exception::LoadAccessFault(_) => 5,
            Exception::StoreAMOAddressMisaligned(_) => 6,
            Exception::StoreAMOAccessFault(_) => 7,
            Exception::EnvironmentCallFromUMode => 8,
            Exception::EnvironmentCallFromSMode => 9,
            Exception::InstructionPageFault(_) => 12,
            Exception::LoadPageFault(_) => 13,
            Exception::StoreAMOPageFault(_) => 15,
        }
    }

    /// The value written to stval when this exception is delivered.
    pub fn tval(&self) -> u32 {
        match *self {
            Exception::InstructionAddressMisaligned(addr)
            | Exception::InstructionAccessFault(addr)
            | Exception::IllegalInstruction(addr)
            | Exception::Breakpoint(addr)
            | Exception::LoadAddressMisaligned(addr)
            | Exception::LoadAccessFault(addr)
            | Exception::StoreAMOAddressMisaligned(addr)
            | Exception::StoreAMOAccessFault(addr)
            | Exception::InstructionPageFault(addr)
            | Exception::LoadPageFault(addr)
            | Exception::StoreAMOPageFault(addr) => addr,
            Exception::EnvironmentCallFromUMode | Exception::EnvironmentCallFromSMode => 0,
        }
    }

    /// Update CSRs, privilege and the program counter for this exception.
    ///
    /// The interpreter does not advance the PC when it raises, so `cpu.pc`
    /// still addresses the faulting instruction and becomes sepc directly.
    pub fn take_trap(&self, cpu: &mut Cpu) {
        tracing::trace!(pc = cpu.pc, cause = %self, "exception");
        enter_supervisor_trap(cpu, self.code(), self.tval(), false);
    }
}

/// Common S-mode trap entry used for both exceptions and interrupts.
///
/// 4.1.1 Supervisor Status Register (sstatus)
/// "When a trap is taken, SPIE is set to SIE, and SIE is set to 0. When an
/// SRET instruction is executed, SIE is set to SPIE, then SPIE is set to 1."
/// "When a trap is taken, SPP is set to 0 if the trap originated from user
/// mode, or 1 otherwise."
pub(crate) fn enter_supervisor_trap(cpu: &mut Cpu, cause: u32, tval: u32, vectored: bool) {
    let prev_mode = cpu.mode;
    cpu.mode = Mode::Supervisor;

    cpu.state.write(SCAUSE, cause);
    cpu.state.write(STVAL, tval);
    // "The low bit of sepc (sepc[0]) is always zero."
    cpu.state.write(SEPC, cpu.pc & !1);

    // stvec[1:0] encodes the vector mode: 0 = direct, 1 = vectored. Vectored
    // dispatch applies to interrupts only.
    let stvec = cpu.state.read(STVEC);
    let base = stvec & !0b11;
    cpu.pc = if vectored && stvec & 0b11 == 1 {
        base.wrapping_add(4 * (cause & !crate::reg::csr::CAUSE_INTERRUPT_BIT))
    } else {
        base
    };

    let sie = cpu.state.read_bit(SSTATUS, SSTATUS_SIE);
    cpu.state.write_bit(SSTATUS, SSTATUS_SPIE, sie);
    cpu.state.write_bit(SSTATUS, SSTATUS_SIE, false);
    cpu.state
        .write_bit(SSTATUS, SSTATUS_SPP, prev_mode == Mode::Supervisor);

    // Any trap invalidates an outstanding load reservation.
    cpu.reservation = None;
}
