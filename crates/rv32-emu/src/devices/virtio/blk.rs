//! Legacy virtio block device.
//!
//! Single request queue. Each request chain carries a 16-byte header
//! (type, reserved, sector), the data buffers, and a trailing
//! device-writable status byte. The disk is an in-memory byte vector the
//! host loads from and writes back to its backing file.

use crate::devices::virtio::{DescChain, MmioEvent, MmioTransport, INT_USED_RING, REG_CONFIG};
use crate::mem::Ram;

/// PLIC source number of the block device.
pub const VBLK_IRQ: u32 = 3;

/// Virtio device id of a block device.
const DEVICE_ID_BLK: u32 = 2;

/// Bytes per sector of the virtio block protocol.
pub const SECTOR_SIZE: u32 = 512;

// Request types.
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

// Request status codes.
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

pub struct VirtioBlk {
    pub mmio: MmioTransport,
    disk: Vec<u8>,
}

impl VirtioBlk {
    /// Create a block device over the given disk image. The image is
    /// rounded down to whole sectors for the advertised capacity.
    pub fn new(disk: Vec<u8>) -> Self {
        Self {
            mmio: MmioTransport::new(DEVICE_ID_BLK, 0, 1),
            disk,
        }
    }

    /// Capacity in sectors, as presented in the config space.
    fn capacity(&self) -> u64 {
        self.disk.len() as u64 / u64::from(SECTOR_SIZE)
    }

    /// Whether the device is asserting its interrupt line.
    pub fn interrupting(&self) -> bool {
        self.mmio.interrupting()
    }

    /// Give back the disk contents so the host can write them to the
    /// backing file.
    pub fn into_disk(self) -> Vec<u8> {
        self.disk
    }

    pub fn read(&mut self, offset: u32) -> u32 {
        if offset >= REG_CONFIG {
            // Config space: capacity in sectors, 64-bit little-endian.
            return match offset - REG_CONFIG {
                0 => self.capacity() as u32,
                4 => (self.capacity() >> 32) as u32,
                _ => 0,
            };
        }
        self.mmio.read(offset)
    }

    pub fn write(&mut self, ram: &mut Ram, offset: u32, value: u32) {
        match self.mmio.write(offset, value) {
            MmioEvent::QueueNotify(0) => self.process_queue(ram),
            _ => {}
        }
    }

    /// Drain the request queue, servicing each chain against the disk.
    fn process_queue(&mut self, ram: &mut Ram) {
        let page_size = self.mmio.guest_page_size;
        let mut queue = self.mmio.queues[0];
        let mut used_any = false;

        while let Some(chain) = queue.pop(ram, page_size) {
            let written = self.service(ram, &chain);
            if queue.push_used(ram, page_size, chain.head, written).is_none() {
                tracing::warn!("virtio-blk used ring outside RAM");
                break;
            }
            used_any = true;
        }

        self.mmio.queues[0] = queue;
        if used_any {
            self.mmio.interrupt_status |= INT_USED_RING;
        }
    }

    /// Service one request chain. Returns the number of bytes the device
    /// wrote into the chain (data for reads plus the status byte).
    fn service(&mut self, ram: &mut Ram, chain: &DescChain) -> u32 {
        if chain.descs.len() < 2 {
            tracing::warn!("virtio-blk request chain too short");
            return 0;
        }
        let header = chain.descs[0];
        let status_desc = chain.descs[chain.descs.len() - 1];
        if !status_desc.is_writable() || status_desc.len < 1 {
            tracing::warn!("virtio-blk status descriptor not writable");
            return 0;
        }

        let (req_type, mut sector) = match (ram.read_u32(header.addr), ram.read_u32(header.addr + 8), ram.read_u32(header.addr + 12)) {
            (Some(t), Some(lo), Some(hi)) => (t, u64::from(lo) | u64::from(hi) << 32),
            _ => return 0,
        };

        let data = &chain.descs[1..chain.descs.len() - 1];
        let mut written = 0u32;
        let mut status = VIRTIO_BLK_S_OK;

        match req_type {
            VIRTIO_BLK_T_IN => {
                for desc in data {
                    if !desc.is_writable() {
                        status = VIRTIO_BLK_S_IOERR;
                        break;
                    }
                    match (
                        disk_range(self.disk.len(), sector, desc.len),
                        ram.slice_mut(desc.addr, desc.len),
                    ) {
                        (Some(range), Some(dst)) => dst.copy_from_slice(&self.disk[range]),
                        _ => {
                            status = VIRTIO_BLK_S_IOERR;
                            break;
                        }
                    }
                    written += desc.len;
                    sector += u64::from(desc.len / SECTOR_SIZE);
                }
            }
            VIRTIO_BLK_T_OUT => {
                for desc in data {
                    match (
                        disk_range(self.disk.len(), sector, desc.len),
                        ram.slice(desc.addr, desc.len),
                    ) {
                        (Some(range), Some(src)) => self.disk[range].copy_from_slice(src),
                        _ => {
                            status = VIRTIO_BLK_S_IOERR;
                            break;
                        }
                    }
                    sector += u64::from(desc.len / SECTOR_SIZE);
                }
            }
            VIRTIO_BLK_T_FLUSH => {}
            _ => status = VIRTIO_BLK_S_UNSUPP,
        }

        if ram
            .write(status_desc.addr, crate::primitives::constants::BYTE, u32::from(status))
            .is_some()
        {
            written += 1;
        }
        written
    }
}

/// Byte range of the disk covered by `len` bytes starting at `sector`, or
/// `None` when the request runs past the end of the disk.
fn disk_range(disk_len: usize, sector: u64, len: u32) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(sector).ok()?.checked_mul(SECTOR_SIZE as usize)?;
    let end = start.checked_add(len as usize)?;
    (end <= disk_len).then_some(start..end)
}
