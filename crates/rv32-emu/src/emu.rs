//! Emulator module: the machine value and its cooperative main loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cpu::{Cpu, Mode};
use crate::devices::virtio::blk::VirtioBlk;
use crate::devices::virtio::net::{NetBackend, VirtioNet};
use crate::exception::{Exception, VmError};
use crate::primitives::constants::DTB_ADDR;
use crate::reg::{A0, A1};
use crate::sbi;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmuError {
    #[error("guest image of {size} bytes does not fit at {addr:#010x}")]
    ImageTooLarge { addr: u32, size: usize },
    #[error("fatal interpreter error: {reason}\n{state}")]
    Fatal { reason: String, state: String },
}

/// The whole machine: one hart, RAM, devices, and the stop flags. The main
/// loop owns it exclusively; devices are polled cooperatively between
/// steps.
pub struct Emu {
    pub cpu: Cpu,
    /// Set by the SBI system-reset call; the loop exits at the next step.
    pub stopped: bool,
    /// Set from outside (e.g. a signal handler) to request a clean stop so
    /// the checkpoint still gets written.
    stop_request: Arc<AtomicBool>,
}

impl Emu {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            stopped: false,
            stop_request: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle the host can flip to stop the loop at the next poll
    /// boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_request)
    }

    /// Put the hart into the fresh-boot state: supervisor mode at address
    /// zero, hart id in `a0`, the DTB address in `a1`, the timer parked.
    pub fn reset_boot(&mut self) {
        self.cpu.pc = 0;
        self.cpu.mode = Mode::Supervisor;
        self.cpu.timer = u64::MAX;
        self.cpu.x_regs.write(A0, 0);
        self.cpu.x_regs.write(A1, DTB_ADDR);
    }

    /// Copy a guest image (kernel, DTB, initrd) into RAM.
    pub fn load_at(&mut self, addr: u32, image: &[u8]) -> Result<(), EmuError> {
        self.cpu
            .bus
            .ram
            .load_image(addr, image)
            .ok_or(EmuError::ImageTooLarge {
                addr,
                size: image.len(),
            })
    }

    /// Attach a block device backed by the given disk image.
    pub fn attach_disk(&mut self, disk: Vec<u8>) {
        self.cpu.bus.vblk = Some(VirtioBlk::new(disk));
    }

    /// Detach the block device and hand back its disk contents so the host
    /// can write them out.
    pub fn take_disk(&mut self) -> Option<Vec<u8>> {
        self.cpu.bus.vblk.take().map(VirtioBlk::into_disk)
    }

    /// Attach a network device over the given host backend.
    pub fn attach_net(&mut self, backend: Box<dyn NetBackend>) {
        self.cpu.bus.vnet = Some(VirtioNet::new(backend));
    }

    /// Poll the devices: console input, pending network frames, interrupt
    /// aggregation.
    pub fn poll(&mut self) {
        self.cpu.bus.poll();
    }

    /// One main-loop iteration: select a pending interrupt, step the
    /// interpreter, and consume its error channel. Supervisor ecalls are
    /// serviced here rather than trapped, since the emulator itself plays
    /// the machine-mode SBI runtime; the trap engine never advanced the
    /// PC, so it is advanced past the ecall once handled.
    pub fn step(&mut self) -> Result<(), EmuError> {
        if let Some(interrupt) = self.cpu.pending_interrupt() {
            interrupt.take_trap(&mut self.cpu);
        }

        let result = self.cpu.step();
        self.cpu.insn_count = self.cpu.insn_count.wrapping_add(1);
        match result {
            Ok(()) => Ok(()),
            Err(VmError::Exception(Exception::EnvironmentCallFromSMode)) => {
                sbi::handle_ecall(self);
                self.cpu.pc = self.cpu.pc.wrapping_add(4);
                Ok(())
            }
            Err(VmError::Exception(exception)) => {
                exception.take_trap(&mut self.cpu);
                Ok(())
            }
            Err(VmError::Fatal(reason)) => Err(EmuError::Fatal {
                reason,
                state: self.cpu.dump(),
            }),
        }
    }

    /// Run until the guest requests a reset, the host requests a stop, or
    /// a fatal error surfaces. Devices are polled every 256 steps; the
    /// `u8` counter wraps at exactly that interval.
    pub fn run(&mut self) -> Result<(), EmuError> {
        let mut poll_ctr: u8 = 0;
        while !self.stopped {
            if poll_ctr == 0 {
                self.poll();
                if self.stop_request.load(Ordering::Relaxed) {
                    tracing::info!("external stop requested");
                    self.stopped = true;
                    break;
                }
            }
            poll_ctr = poll_ctr.wrapping_add(1);
            self.step()?;
        }
        tracing::info!(insn_count = self.cpu.insn_count, "emulator stopped");
        Ok(())
    }
}

impl Default for Emu {
    fn default() -> Self {
        Self::new()
    }
}
