//! CPU module for the RV32 emulator: hart state, the Sv32 walker and the
//! per-step interrupt selection.
use crate::{
    bus::Bus,
    cpu::execute::execute_inner,
    exception::{Exception, VmError},
    interrupt::Interrupt,
    primitives::constants::{HALFWORD, RAM_SIZE, WORD},
    reg::{
        csr::{
            state::State, CsrAddress, CYCLE, CYCLEH, INSTRET, INSTRETH, SATP, SATP_MODE_SV32,
            SATP_PPN_MASK, SCAUSE, SCOUNTEREN, SEIP_BIT, SEPC, SIE, SIP, SSCRATCH, SSIP_BIT,
            SSTATUS, SSTATUS_MXR, SSTATUS_SIE, SSTATUS_SUM, STIMECMP, STIMECMPH, STIP_BIT, STVAL,
            STVEC, TIME, TIMEH,
        },
        IntRegister,
    },
};

pub mod execute;

/// Access type that is used in the virtual address translation process. It
/// decides which page-fault exception is raised.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AccessType {
    /// Raises InstructionPageFault. It is used for an instruction fetch.
    Instruction,
    /// Raises LoadPageFault.
    Load,
    /// Raises StoreAMOPageFault.
    Store,
}

/// The privileged mode. Machine mode is not modelled; the emulator itself
/// plays the role of M-mode through the SBI dispatcher.
#[derive(Debug, PartialEq, PartialOrd, Eq, Copy, Clone)]
pub enum Mode {
    User = 0b00,
    Supervisor = 0b01,
}

pub struct Cpu {
    /// Integer registers.
    pub x_regs: IntRegister,
    /// Program counter.
    pub pc: u32,
    /// Control and status registers (CSR).
    pub state: State,
    /// Privilege level.
    pub mode: Mode,
    /// System bus.
    pub bus: Bus,
    /// Sv32 paging flag, derived from satp.
    enable_paging: bool,
    /// Physical address of the root page table, satp.PPN × 4096.
    page_table: u32,
    /// Word address held by an outstanding LR reservation. Cleared by SC,
    /// by any store, and by any trap.
    pub reservation: Option<u32>,
    /// Monotonic count of retired instructions; also the time base.
    pub insn_count: u64,
    /// Timer deadline: a supervisor timer interrupt becomes pending once
    /// `insn_count >= timer`. Reachable as the stimecmp CSR pair and via
    /// the SBI set-timer call.
    pub timer: u64,
}

impl Cpu {
    /// Create a new `Cpu` object with an empty bus.
    pub fn new() -> Cpu {
        Cpu {
            x_regs: IntRegister::new(),
            pc: 0,
            state: State::new(),
            mode: Mode::Supervisor,
            bus: Bus::new(),
            enable_paging: false,
            page_table: 0,
            reservation: None,
            insn_count: 0,
            timer: u64::MAX,
        }
    }

    /// Select the interrupt to deliver before the next fetch, if any.
    ///
    /// The derived sip lines are refreshed first so the guest observes a
    /// consistent pending view per step: SEIP mirrors the PLIC gating,
    /// STIP mirrors the timer comparison. Priority order is
    /// external > software > timer.
    pub fn pending_interrupt(&mut self) -> Option<Interrupt> {
        self.state
            .set_pending(SEIP_BIT, self.bus.plic.interrupt_pending());
        self.state
            .set_pending(STIP_BIT, self.insn_count >= self.timer);

        // "When a hart is executing in privilege mode x, interrupts are
        // globally enabled when xIE=1 and globally disabled when xIE=0.
        // Interrupts for higher-privilege modes are always globally
        // enabled" - so U-mode never masks supervisor interrupts.
        if self.mode == Mode::Supervisor && !self.state.read_bit(SSTATUS, SSTATUS_SIE) {
            return None;
        }

        let pending = self.state.read(SIE) & self.state.read(SIP);
        if pending & SEIP_BIT != 0 {
            return Some(Interrupt::SupervisorExternal);
        }
        if pending & SSIP_BIT != 0 {
            return Some(Interrupt::SupervisorSoftware);
        }
        if pending & STIP_BIT != 0 {
            return Some(Interrupt::SupervisorTimer);
        }
        None
    }

    /// Update the root page table address and the translation mode from
    /// satp.
    pub fn update_paging(&mut self) {
        let satp = self.state.read(SATP);
        self.page_table = (satp & SATP_PPN_MASK) << 12;
        self.enable_paging = satp & SATP_MODE_SV32 != 0;
    }

    /// Translate a virtual address to a physical address through the
    /// two-level Sv32 walk. There is no TLB; every access walks.
    fn translate(&mut self, addr: u32, access: AccessType) -> Result<u32, VmError> {
        if !self.enable_paging {
            return Ok(addr);
        }

        let vpn = [(addr >> 12) & 0x3ff, (addr >> 22) & 0x3ff];

        // 1. Let a be satp.ppn × PAGESIZE, and let i = LEVELS − 1. (For
        //    Sv32, PAGESIZE=4096 and LEVELS=2.)
        let mut a = self.page_table;
        let mut i: i32 = 1;
        let (pte, pte_addr) = loop {
            // 2. Let pte be the value of the PTE at address
            //    a + va.vpn[i] × PTESIZE. (For Sv32, PTESIZE=4.)
            let pte_addr = a.wrapping_add(vpn[i as usize] * 4);
            if pte_addr >= RAM_SIZE {
                return Err(access_fault(access, addr));
            }
            let pte = self
                .bus
                .ram
                .read(pte_addr, WORD)
                .ok_or_else(|| access_fault(access, addr))?;

            // 3. If pte.v = 0, or if pte.r = 0 and pte.w = 1, stop and
            //    raise a page-fault exception corresponding to the
            //    original access type.
            let v = pte & 1;
            let r = (pte >> 1) & 1;
            let w = (pte >> 2) & 1;
            let x = (pte >> 3) & 1;
            if v == 0 || (r == 0 && w == 1) {
                return Err(page_fault(access, addr));
            }

            // 4. Otherwise, the PTE is valid. If pte.r = 1 or pte.x = 1,
            //    go to step 5. Otherwise, this PTE is a pointer to the
            //    next level of the page table.
            if r == 1 || x == 1 {
                break (pte, pte_addr);
            }
            i -= 1;
            if i < 0 {
                return Err(page_fault(access, addr));
            }
            a = ((pte >> 10) & 0x3f_ffff) << 12;
        };

        // 5. A leaf PTE has been found. Determine if the requested memory
        //    access is allowed by the pte.r, pte.w, pte.x, and pte.u bits,
        //    given the current privilege mode and the value of the SUM and
        //    MXR fields of the sstatus register.
        let r = (pte >> 1) & 1;
        let w = (pte >> 2) & 1;
        let x = (pte >> 3) & 1;
        let u = (pte >> 4) & 1;

        let mxr = self.state.read_bit(SSTATUS, SSTATUS_MXR);
        let permitted = match access {
            AccessType::Instruction => x == 1,
            AccessType::Load => r == 1 || (mxr && x == 1),
            AccessType::Store => w == 1,
        };
        if !permitted {
            return Err(page_fault(access, addr));
        }

        let sum = self.state.read_bit(SSTATUS, SSTATUS_SUM);
        match self.mode {
            // Non-U pages are forbidden from U-mode.
            Mode::User => {
                if u == 0 {
                    return Err(page_fault(access, addr));
                }
            }
            // U pages are forbidden from S-mode unless SUM, and are never
            // executable from S-mode.
            Mode::Supervisor => {
                if u == 1 && (!sum || access == AccessType::Instruction) {
                    return Err(page_fault(access, addr));
                }
            }
        }

        // 6. If i > 0 and pte.ppn[i−1:0] != 0, this is a misaligned
        //    megapage; stop and raise a page-fault exception.
        if i == 1 && (pte >> 10) & 0x3ff != 0 {
            return Err(page_fault(access, addr));
        }

        // 7. Set pte.a to 1 and, if the memory access is a store, also set
        //    pte.d to 1. Single-threaded core, so a plain read-modify-write
        //    of the PTE word is atomic enough.
        let mut new_pte = pte | (1 << 6);
        if access == AccessType::Store {
            new_pte |= 1 << 7;
        }
        if new_pte != pte {
            self.bus
                .ram
                .write(pte_addr, WORD, new_pte)
                .ok_or_else(|| access_fault(access, addr))?;
        }

        // 8. The translation is successful.
        let offset = addr & 0xfff;
        let pa = match i {
            0 => (((pte >> 10) & 0x3f_ffff) << 12) | offset,
            // Megapage: pa.ppn[0] comes from the virtual address.
            _ => (((pte >> 20) & 0xfff) << 22) | (vpn[0] << 12) | offset,
        };
        Ok(pa)
    }

    /// Read `width` bits from the virtual address.
    pub fn read(&mut self, v_addr: u32, width: u8) -> Result<u32, VmError> {
        match width {
            HALFWORD if v_addr & 1 != 0 => {
                return Err(Exception::LoadAddressMisaligned(v_addr).into())
            }
            WORD if v_addr & 3 != 0 => {
                return Err(Exception::LoadAddressMisaligned(v_addr).into())
            }
            _ => {}
        }
        let p_addr = self.translate(v_addr, AccessType::Load)?;
        self.bus.read(p_addr, width)
    }

    /// Write the low `width` bits of `value` to the virtual address.
    pub fn write(&mut self, v_addr: u32, width: u8, value: u32) -> Result<(), VmError> {
        match width {
            HALFWORD if v_addr & 1 != 0 => {
                return Err(Exception::StoreAMOAddressMisaligned(v_addr).into())
            }
            WORD if v_addr & 3 != 0 => {
                return Err(Exception::StoreAMOAddressMisaligned(v_addr).into())
            }
            _ => {}
        }
        // Any store by this hart invalidates the reservation.
        self.reservation = None;
        let p_addr = self.translate(v_addr, AccessType::Store)?;
        self.bus.write(p_addr, width, value)
    }

    /// Fetch the instruction word at the current program counter.
    pub fn fetch(&mut self) -> Result<u32, VmError> {
        if self.pc & 3 != 0 {
            return Err(Exception::InstructionAddressMisaligned(self.pc).into());
        }
        let p_pc = self.translate(self.pc, AccessType::Instruction)?;
        self.bus.fetch(p_pc).map_err(Into::into)
    }

    /// Execute one instruction: fetch, decode, execute, advance the PC.
    /// On a raised exception the PC is left at the faulting instruction
    /// for the trap engine to consume.
    pub fn step(&mut self) -> Result<(), VmError> {
        let inst = self.fetch()?;
        execute_inner(self, inst)?;
        self.pc = self.pc.wrapping_add(4);
        Ok(())
    }

    /// Read a CSR, checking privilege and implementation.
    pub fn csr_read(&mut self, addr: CsrAddress, inst: u32) -> Result<u32, VmError> {
        self.check_csr_privilege(addr, inst)?;
        let value = match addr {
            STIMECMP => self.timer as u32,
            STIMECMPH => (self.timer >> 32) as u32,
            // The retired-instruction counter doubles as cycle and time
            // base; scounteren is implemented but inert, so reads are
            // never gated.
            CYCLE | TIME | INSTRET => self.insn_count as u32,
            CYCLEH | TIMEH | INSTRETH => (self.insn_count >> 32) as u32,
            SSTATUS | SIE | STVEC | SCOUNTEREN | SSCRATCH | SEPC | SCAUSE | STVAL | SIP | SATP => {
                self.state.read(addr)
            }
            _ => return Err(Exception::IllegalInstruction(inst).into()),
        };
        Ok(value)
    }

    /// Write a CSR, checking privilege, implementation and read-only
    /// space; applies the side effects of satp and stimecmp writes.
    pub fn csr_write(&mut self, addr: CsrAddress, value: u32, inst: u32) -> Result<(), VmError> {
        self.check_csr_privilege(addr, inst)?;
        // CSRs whose top address bits are 0b11 are read-only.
        if (addr >> 10) & 0b11 == 0b11 {
            return Err(Exception::IllegalInstruction(inst).into());
        }
        match addr {
            STIMECMP => {
                self.timer = (self.timer & !0xffff_ffff) | u64::from(value);
            }
            STIMECMPH => {
                self.timer = (self.timer & 0xffff_ffff) | u64::from(value) << 32;
            }
            SATP => {
                self.state.write(SATP, value);
                self.update_paging();
            }
            SSTATUS | SIE | STVEC | SCOUNTEREN | SSCRATCH | SEPC | SCAUSE | STVAL | SIP => {
                self.state.write(addr, value);
            }
            _ => return Err(Exception::IllegalInstruction(inst).into()),
        }
        Ok(())
    }

    fn check_csr_privilege(&self, addr: CsrAddress, inst: u32) -> Result<(), VmError> {
        // csr[9:8] encodes the lowest privilege that may access the
        // register.
        let required = (addr >> 8) & 0b11;
        if self.mode == Mode::User && required != 0 {
            return Err(Exception::IllegalInstruction(inst).into());
        }
        Ok(())
    }

    /// Render the architectural state for fatal-error diagnostics.
    pub fn dump(&self) -> String {
        let mut out = format!(
            "pc={:#010x} mode={:?} insn_count={}\n{}\n",
            self.pc, self.mode, self.insn_count, self.state
        );
        for i in 0..32 {
            out.push_str(&format!(
                "x{i:<2}={:#010x}{}",
                self.x_regs.read(i),
                if i % 4 == 3 { "\n" } else { " " }
            ));
        }
        out
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

fn page_fault(access: AccessType, addr: u32) -> VmError {
    match access {
        AccessType::Instruction => Exception::InstructionPageFault(addr).into(),
        AccessType::Load => Exception::LoadPageFault(addr).into(),
        AccessType::Store => Exception::StoreAMOPageFault(addr).into(),
    }
}

fn access_fault(access: AccessType, addr: u32) -> VmError {
    match access {
        AccessType::Instruction => Exception::InstructionAccessFault(addr).into(),
        AccessType::Load => Exception::LoadAccessFault(addr).into(),
        AccessType::Store => Exception::StoreAMOAccessFault(addr).into(),
    }
}
