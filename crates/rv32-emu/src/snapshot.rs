//! Checkpoint codec.
//!
//! Serialises the full architectural state plus device state to a byte
//! stream with a stable, versioned little-endian layout:
//!
//! 1. magic + version word
//! 2. hart state: pc, 32 registers, privilege, the supervisor CSRs, the
//!    instruction counter, the timer, the LR reservation
//! 3. PLIC state
//! 4. UART state (host endpoints excluded)
//! 5. virtio-net / virtio-blk presence flags and state (host backing
//!    excluded)
//! 6. RAM contents as a flat byte blob, its size implied by `RAM_SIZE`
//!
//! The loader validates the whole layout before touching the machine, so a
//! rejected blob leaves the caller free to fall back to a fresh boot.

use crate::cpu::Mode;
use crate::emu::Emu;
use crate::primitives::constants::RAM_SIZE;
use crate::reg::csr::{
    CsrAddress, SATP, SCAUSE, SCOUNTEREN, SEPC, SIE, SIP, SSCRATCH, SSTATUS, STVAL, STVEC,
};
use thiserror::Error;

/// "RV32" in big-endian byte order.
pub const SNAPSHOT_MAGIC: u32 = 0x5256_3332;
pub const SNAPSHOT_VERSION: u32 = 1;

/// The CSRs the hart section carries, in layout order.
const SAVED_CSRS: [CsrAddress; 10] = [
    SSTATUS, SIE, SIP, STVEC, SSCRATCH, SEPC, SCAUSE, STVAL, SATP, SCOUNTEREN,
];

const HART_BYTES: usize = 4 + 32 * 4 + 1 + SAVED_CSRS.len() * 4 + 8 + 8 + 1 + 4;
const PLIC_BYTES: usize = 4 * 4;
const UART_BYTES: usize = 7 + 1 + 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("bad magic {found:#010x}, expected {SNAPSHOT_MAGIC:#010x}")]
    BadMagic { found: u32 },
    #[error("unsupported snapshot version {found}, expected {SNAPSHOT_VERSION}")]
    BadVersion { found: u32 },
    #[error("snapshot truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("snapshot device layout does not match the machine configuration")]
    DeviceMismatch,
    #[error("{extra} trailing bytes after the RAM blob")]
    TrailingBytes { extra: usize },
}

/// Little-endian byte sink.
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

/// Little-endian byte cursor.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let chunk = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(SnapshotError::Truncated { offset: self.pos })?;
        self.pos += n;
        Ok(chunk)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, SnapshotError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, SnapshotError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, SnapshotError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn skip(&mut self, n: usize) -> Result<(), SnapshotError> {
        self.take(n).map(|_| ())
    }
}

/// Serialise the machine to a fresh byte vector.
pub fn save(emu: &Emu) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(SNAPSHOT_MAGIC);
    w.u32(SNAPSHOT_VERSION);

    // Hart state.
    let cpu = &emu.cpu;
    w.u32(cpu.pc);
    for i in 0..32 {
        w.u32(cpu.x_regs.read(i));
    }
    w.u8(cpu.mode as u8);
    for csr in SAVED_CSRS {
        w.u32(cpu.state.read(csr));
    }
    w.u64(cpu.insn_count);
    w.u64(cpu.timer);
    w.u8(cpu.reservation.is_some() as u8);
    w.u32(cpu.reservation.unwrap_or(0));

    // PLIC.
    let plic = &cpu.bus.plic;
    w.u32(plic.active);
    w.u32(plic.pending);
    w.u32(plic.enable);
    w.u32(plic.masked);

    // UART, minus host endpoints.
    for reg in cpu.bus.uart.snapshot_regs() {
        w.u8(reg);
    }
    w.u8(cpu.bus.uart.in_ready() as u8);
    w.u8(cpu.bus.uart.in_char());

    // Optional virtio devices, minus host backing.
    w.u8(cpu.bus.vnet.is_some() as u8);
    if let Some(vnet) = &cpu.bus.vnet {
        vnet.mmio.snapshot(&mut w);
    }
    w.u8(cpu.bus.vblk.is_some() as u8);
    if let Some(vblk) = &cpu.bus.vblk {
        vblk.mmio.snapshot(&mut w);
    }

    // RAM blob.
    w.bytes(cpu.bus.ram.bytes());
    w.buf
}

/// Restore the machine from a snapshot blob.
///
/// The layout is fully validated first; on any error the machine is left
/// untouched so the caller can proceed with a fresh boot. Returns the
/// number of bytes consumed on success.
pub fn load(emu: &mut Emu, bytes: &[u8]) -> Result<usize, SnapshotError> {
    check(emu, bytes)?;
    apply(emu, bytes)
}

/// Walk the layout without mutating anything.
fn check(emu: &Emu, bytes: &[u8]) -> Result<(), SnapshotError> {
    let mut r = Reader::new(bytes);
    let magic = r.u32()?;
    if magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic { found: magic });
    }
    let version = r.u32()?;
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::BadVersion { found: version });
    }

    r.skip(HART_BYTES + PLIC_BYTES + UART_BYTES)?;

    let has_vnet = r.u8()? != 0;
    if has_vnet != emu.cpu.bus.vnet.is_some() {
        return Err(SnapshotError::DeviceMismatch);
    }
    if let Some(vnet) = &emu.cpu.bus.vnet {
        r.skip(transport_bytes(vnet.mmio.num_queues()))?;
    }
    let has_vblk = r.u8()? != 0;
    if has_vblk != emu.cpu.bus.vblk.is_some() {
        return Err(SnapshotError::DeviceMismatch);
    }
    if let Some(vblk) = &emu.cpu.bus.vblk {
        r.skip(transport_bytes(vblk.mmio.num_queues()))?;
    }

    r.skip(RAM_SIZE as usize)?;
    let extra = bytes.len() - r.pos;
    if extra != 0 {
        return Err(SnapshotError::TrailingBytes { extra });
    }
    Ok(())
}

/// Re-walk a validated blob, restoring every field in layout order.
fn apply(emu: &mut Emu, bytes: &[u8]) -> Result<usize, SnapshotError> {
    let mut r = Reader::new(bytes);
    r.skip(8)?; // magic + version, already validated

    let cpu = &mut emu.cpu;
    cpu.pc = r.u32()?;
    for i in 0..32 {
        let v = r.u32()?;
        cpu.x_regs.write(i, v);
    }
    cpu.mode = if r.u8()? == Mode::Supervisor as u8 {
        Mode::Supervisor
    } else {
        Mode::User
    };
    for csr in SAVED_CSRS {
        let v = r.u32()?;
        cpu.state.restore(csr, v);
    }
    cpu.insn_count = r.u64()?;
    cpu.timer = r.u64()?;
    let has_reservation = r.u8()? != 0;
    let reservation = r.u32()?;
    cpu.reservation = has_reservation.then_some(reservation);
    cpu.update_paging();

    let plic = &mut cpu.bus.plic;
    plic.active = r.u32()?;
    plic.pending = r.u32()?;
    plic.enable = r.u32()?;
    plic.masked = r.u32()?;

    let mut regs = [0u8; 7];
    for reg in &mut regs {
        *reg = r.u8()?;
    }
    let in_ready = r.u8()? != 0;
    let in_char = r.u8()?;
    cpu.bus.uart.restore_regs(regs, in_ready, in_char);

    r.skip(1)?;
    if let Some(vnet) = cpu.bus.vnet.as_mut() {
        vnet.mmio.restore(&mut r)?;
    }
    r.skip(1)?;
    if let Some(vblk) = cpu.bus.vblk.as_mut() {
        vblk.mmio.restore(&mut r)?;
    }

    let ram = r.take(RAM_SIZE as usize)?;
    cpu.bus.ram.bytes_mut().copy_from_slice(ram);

    emu.stopped = false;
    tracing::debug!(bytes = r.pos, "snapshot restored");
    Ok(r.pos)
}

/// Serialised size of one virtio transport section.
fn transport_bytes(num_queues: usize) -> usize {
    7 * 4 + num_queues * (3 * 4 + 2)
}
