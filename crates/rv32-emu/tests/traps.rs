//! Trap delivery: CSR bookkeeping on entry, sret restore, interrupt
//! selection and vectored dispatch.

mod common;

use common::*;
use rv32_emu::cpu::Mode;
use rv32_emu::interrupt::Interrupt;
use rv32_emu::reg::csr::{
    SCAUSE, SEPC, SIE, SIP, SSIP_BIT, SSTATUS, SSTATUS_SIE, SSTATUS_SPIE, SSTATUS_SPP,
};

#[test]
fn unaligned_load_reports_the_address() {
    let mut emu = boot(&[lw(5, 6, 0)]);
    emu.cpu.x_regs.write(6, 0x1001);

    emu.step().unwrap();

    assert_eq!(emu.cpu.state.read(SCAUSE), 4);
    assert_eq!(emu.cpu.state.read(rv32_emu::reg::csr::STVAL), 0x1001);
    assert_eq!(emu.cpu.state.read(SEPC), 0);
}

#[test]
fn trap_entry_saves_state_and_sret_restores_it() {
    let mut emu = boot(&[EBREAK]);
    let stvec = 0x100;
    emu.cpu.state.write(rv32_emu::reg::csr::STVEC, stvec);
    emu.cpu.state.write_bit(SSTATUS, SSTATUS_SIE, true);
    emu.load_at(stvec, &SRET.to_le_bytes()).unwrap();

    emu.step().unwrap();

    // After entering the vector: SIE = 0, SPIE = prior SIE, SPP = prior
    // privilege (supervisor).
    assert_eq!(emu.cpu.pc, stvec);
    assert!(!emu.cpu.state.read_bit(SSTATUS, SSTATUS_SIE));
    assert!(emu.cpu.state.read_bit(SSTATUS, SSTATUS_SPIE));
    assert!(emu.cpu.state.read_bit(SSTATUS, SSTATUS_SPP));
    assert_eq!(emu.cpu.state.read(SEPC), 0);

    emu.step().unwrap();

    // sret restores SIE from SPIE, sets SPIE, resets SPP to U, and
    // returns to sepc.
    assert_eq!(emu.cpu.pc, 0);
    assert!(emu.cpu.state.read_bit(SSTATUS, SSTATUS_SIE));
    assert!(emu.cpu.state.read_bit(SSTATUS, SSTATUS_SPIE));
    assert!(!emu.cpu.state.read_bit(SSTATUS, SSTATUS_SPP));
    assert_eq!(emu.cpu.mode, Mode::Supervisor);
}

#[test]
fn ecall_from_user_mode_traps_with_cause_8() {
    let mut emu = boot(&[ECALL]);
    emu.cpu.mode = Mode::User;

    emu.step().unwrap();

    assert_eq!(emu.cpu.state.read(SCAUSE), 8);
    assert_eq!(emu.cpu.mode, Mode::Supervisor);
    assert!(!emu.cpu.state.read_bit(SSTATUS, SSTATUS_SPP));
}

#[test]
fn user_mode_access_to_supervisor_csrs_is_illegal() {
    let inst = csrrw(1, 0x140, 0); // sscratch
    let mut emu = boot(&[inst]);
    emu.cpu.mode = Mode::User;

    emu.step().unwrap();

    assert_eq!(emu.cpu.state.read(SCAUSE), 2);
    assert_eq!(emu.cpu.state.read(rv32_emu::reg::csr::STVAL), inst);
}

#[test]
fn software_interrupt_uses_the_vectored_entry() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    let base = 0x200;
    // Vectored mode: stvec[1:0] = 1.
    emu.cpu.state.write(rv32_emu::reg::csr::STVEC, base | 1);
    emu.cpu.state.write_bit(SSTATUS, SSTATUS_SIE, true);
    emu.cpu.state.write(SIE, SSIP_BIT);
    emu.cpu.state.write(SIP, SSIP_BIT);
    // The handler slot for cause 1 holds a real instruction.
    emu.load_at(base + 4, &addi(7, 0, 7).to_le_bytes()).unwrap();

    emu.step().unwrap();

    // Cause 1 lands at base + 4, and the step then executed the handler
    // word, advancing the PC once more.
    assert_eq!(emu.cpu.state.read(SCAUSE), 0x8000_0001);
    assert_eq!(emu.cpu.pc, base + 4 + 4);
    assert_eq!(emu.cpu.x_regs.read(7), 7);
    assert_eq!(emu.cpu.state.read(SEPC), 0);
}

#[test]
fn timer_interrupt_fires_once_the_counter_passes_the_deadline() {
    let mut emu = boot(&[addi(1, 0, 1), addi(2, 0, 2), addi(3, 0, 3)]);
    emu.cpu.state.write_bit(SSTATUS, SSTATUS_SIE, true);
    emu.cpu.state.write(SIE, 1 << 5);
    emu.cpu.timer = 2;

    emu.step().unwrap();
    emu.step().unwrap();
    assert_eq!(emu.cpu.state.read(SCAUSE), 0);

    // insn_count is now 2 >= timer, so the next step traps first.
    emu.step().unwrap();
    assert_eq!(emu.cpu.state.read(SCAUSE), 0x8000_0005);
    assert_eq!(emu.cpu.state.read(SEPC), 8);
    assert_eq!(emu.cpu.x_regs.read(3), 0);
}

#[test]
fn interrupts_stay_masked_while_sie_is_clear_in_s_mode() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    emu.cpu.state.write(SIE, SSIP_BIT);
    emu.cpu.state.write(SIP, SSIP_BIT);

    assert_eq!(emu.cpu.pending_interrupt(), None);

    // U-mode never masks supervisor interrupts.
    emu.cpu.mode = Mode::User;
    assert_eq!(
        emu.cpu.pending_interrupt(),
        Some(Interrupt::SupervisorSoftware)
    );
}

#[test]
fn external_beats_software_beats_timer() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    emu.cpu.state.write_bit(SSTATUS, SSTATUS_SIE, true);
    emu.cpu.state.write(SIE, (1 << 9) | (1 << 5) | SSIP_BIT);
    emu.cpu.state.write(SIP, SSIP_BIT);
    emu.cpu.timer = 0;
    emu.cpu.bus.plic.enable = 1 << 1;
    emu.cpu.bus.plic.set_active(1, true);
    emu.cpu.bus.plic.update();

    assert_eq!(
        emu.cpu.pending_interrupt(),
        Some(Interrupt::SupervisorExternal)
    );

    emu.cpu.bus.plic.set_active(1, false);
    assert_eq!(
        emu.cpu.pending_interrupt(),
        Some(Interrupt::SupervisorSoftware)
    );

    emu.cpu.state.write(SIP, 0);
    assert_eq!(emu.cpu.pending_interrupt(), Some(Interrupt::SupervisorTimer));
}
