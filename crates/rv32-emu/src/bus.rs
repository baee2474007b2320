//! Physical address decoder.
//!
//! RAM sits at the bottom of the address space and is the only executable
//! region. MMIO occupies the top nibble `0xF`, carved into 1 MiB regions
//! selected by the next address byte. MMIO registers are word-wide;
//! narrower accesses see the low bytes of the register and writes are
//! zero-extended before they reach the device.

use crate::devices::plic::Plic;
use crate::devices::uart::{Uart, UART_IRQ};
use crate::devices::virtio::blk::{VirtioBlk, VBLK_IRQ};
use crate::devices::virtio::net::{VirtioNet, VNET_IRQ};
use crate::exception::{Exception, VmError};
use crate::mem::Ram;
use crate::primitives::constants::{BYTE, HALFWORD, RAM_SIZE, WORD};

// MMIO regions: (addr >> 20) & 0xff inside the 0xF top nibble.
const REGION_PLIC_END: u32 = 0x3f;
const REGION_UART: u32 = 0x40;
const REGION_VNET: u32 = 0x41;
const REGION_VBLK: u32 = 0x42;

/// In-region offset masks.
const PLIC_OFFSET_MASK: u32 = 0x3ff_ffff;
const DEV_OFFSET_MASK: u32 = 0xf_ffff;

pub struct Bus {
    pub ram: Ram,
    pub plic: Plic,
    pub uart: Uart,
    /// Optional peripherals, attached at construction time.
    pub vnet: Option<VirtioNet>,
    pub vblk: Option<VirtioBlk>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            ram: Ram::new(),
            plic: Plic::new(),
            uart: Uart::new(),
            vnet: None,
            vblk: None,
        }
    }

    /// Fetch an instruction word. Only RAM is executable.
    pub fn fetch(&self, addr: u32) -> Result<u32, Exception> {
        if addr >= RAM_SIZE {
            return Err(Exception::InstructionAccessFault(addr));
        }
        self.ram
            .read(addr, WORD)
            .ok_or(Exception::InstructionAccessFault(addr))
    }

    /// Load `width` bits from the physical address.
    pub fn read(&mut self, addr: u32, width: u8) -> Result<u32, VmError> {
        check_width(width)?;

        if addr < RAM_SIZE {
            return self
                .ram
                .read(addr, width)
                .ok_or_else(|| Exception::LoadAccessFault(addr).into());
        }

        if addr >> 28 == 0xf {
            let word = match (addr >> 20) & 0xff {
                0x00..=REGION_PLIC_END => {
                    let v = self.plic.read(addr & PLIC_OFFSET_MASK);
                    self.plic.update();
                    v
                }
                REGION_UART => self.uart.read(addr & DEV_OFFSET_MASK),
                REGION_VNET => match self.vnet.as_mut() {
                    Some(vnet) => vnet.read(addr & DEV_OFFSET_MASK),
                    None => return Err(Exception::LoadAccessFault(addr).into()),
                },
                REGION_VBLK => match self.vblk.as_mut() {
                    Some(vblk) => vblk.read(addr & DEV_OFFSET_MASK),
                    None => return Err(Exception::LoadAccessFault(addr).into()),
                },
                _ => return Err(Exception::LoadAccessFault(addr).into()),
            };
            self.update_irq_lines();
            return Ok(truncate(word, width));
        }

        Err(Exception::LoadAccessFault(addr).into())
    }

    /// Store the low `width` bits of `value` at the physical address.
    pub fn write(&mut self, addr: u32, width: u8, value: u32) -> Result<(), VmError> {
        check_width(width)?;

        if addr < RAM_SIZE {
            return self
                .ram
                .write(addr, width, value)
                .ok_or_else(|| Exception::StoreAMOAccessFault(addr).into());
        }

        if addr >> 28 == 0xf {
            let value = truncate(value, width);
            match (addr >> 20) & 0xff {
                0x00..=REGION_PLIC_END => {
                    self.plic.write(addr & PLIC_OFFSET_MASK, value);
                    self.plic.update();
                }
                REGION_UART => self.uart.write(addr & DEV_OFFSET_MASK, value),
                REGION_VNET => match self.vnet.as_mut() {
                    Some(vnet) => vnet.write(&mut self.ram, addr & DEV_OFFSET_MASK, value),
                    None => return Err(Exception::StoreAMOAccessFault(addr).into()),
                },
                REGION_VBLK => match self.vblk.as_mut() {
                    Some(vblk) => vblk.write(&mut self.ram, addr & DEV_OFFSET_MASK, value),
                    None => return Err(Exception::StoreAMOAccessFault(addr).into()),
                },
                _ => return Err(Exception::StoreAMOAccessFault(addr).into()),
            }
            self.update_irq_lines();
            return Ok(());
        }

        Err(Exception::StoreAMOAccessFault(addr).into())
    }

    /// Propagate device interrupt lines into the PLIC aggregate.
    pub fn update_irq_lines(&mut self) {
        self.plic.set_active(UART_IRQ, self.uart.interrupting());
        if let Some(vnet) = &self.vnet {
            self.plic.set_active(VNET_IRQ, vnet.interrupting());
        }
        if let Some(vblk) = &self.vblk {
            self.plic.set_active(VBLK_IRQ, vblk.interrupting());
        }
        self.plic.update();
    }

    /// Main-loop device poll: pull console input, deliver pending network
    /// frames, refresh the interrupt aggregation.
    pub fn poll(&mut self) {
        self.uart.check_ready();
        if let Some(vnet) = self.vnet.as_mut() {
            vnet.refresh_rx(&mut self.ram);
        }
        self.update_irq_lines();
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

fn check_width(width: u8) -> Result<(), VmError> {
    match width {
        BYTE | HALFWORD | WORD => Ok(()),
        _ => Err(VmError::Fatal(format!(
            "unsupported bus access width: {width}"
        ))),
    }
}

/// Keep the low `width` bits of an MMIO register value.
fn truncate(value: u32, width: u8) -> u32 {
    match width {
        BYTE => value & 0xff,
        HALFWORD => value & 0xffff,
        _ => value,
    }
}
