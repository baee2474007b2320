//! Flat physical RAM backing store.
//!
//! RAM occupies the bottom of the physical address space and is the only
//! executable region. All accessors are bounds-checked and return `None`
//! past the end; the bus turns that into the matching access fault, the
//! virtio devices treat it as a malformed ring.

use crate::primitives::constants::{BYTE, HALFWORD, RAM_SIZE, WORD};

pub struct Ram {
    data: Vec<u8>,
}

impl Ram {
    /// Allocate the fixed-size RAM, zero-filled.
    pub fn new() -> Self {
        Self {
            data: vec![0; RAM_SIZE as usize],
        }
    }

    /// Read `width` bits starting at `addr`, little-endian.
    pub fn read(&self, addr: u32, width: u8) -> Option<u32> {
        let addr = addr as usize;
        match width {
            BYTE => self.data.get(addr).map(|b| u32::from(*b)),
            HALFWORD => {
                let bytes = self.data.get(addr..addr + 2)?;
                Some(u32::from(u16::from_le_bytes([bytes[0], bytes[1]])))
            }
            WORD => {
                let bytes = self.data.get(addr..addr + 4)?;
                Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            _ => None,
        }
    }

    /// Write the low `width` bits of `value` at `addr`, little-endian.
    pub fn write(&mut self, addr: u32, width: u8, value: u32) -> Option<()> {
        let addr = addr as usize;
        match width {
            BYTE => {
                *self.data.get_mut(addr)? = value as u8;
            }
            HALFWORD => {
                self.data
                    .get_mut(addr..addr + 2)?
                    .copy_from_slice(&(value as u16).to_le_bytes());
            }
            WORD => {
                self.data
                    .get_mut(addr..addr + 4)?
                    .copy_from_slice(&value.to_le_bytes());
            }
            _ => return None,
        }
        Some(())
    }

    /// Read a 16-bit little-endian value. Convenience for ring walking.
    pub fn read_u16(&self, addr: u32) -> Option<u16> {
        self.read(addr, HALFWORD).map(|v| v as u16)
    }

    /// Read a 32-bit little-endian value. Convenience for ring walking.
    pub fn read_u32(&self, addr: u32) -> Option<u32> {
        self.read(addr, WORD)
    }

    /// Write a 16-bit little-endian value.
    pub fn write_u16(&mut self, addr: u32, value: u16) -> Option<()> {
        self.write(addr, HALFWORD, u32::from(value))
    }

    /// Write a 32-bit little-endian value.
    pub fn write_u32(&mut self, addr: u32, value: u32) -> Option<()> {
        self.write(addr, WORD, value)
    }

    /// Borrow `len` bytes starting at `addr`.
    pub fn slice(&self, addr: u32, len: u32) -> Option<&[u8]> {
        self.data.get(addr as usize..(addr as usize).checked_add(len as usize)?)
    }

    /// Mutably borrow `len` bytes starting at `addr`.
    pub fn slice_mut(&mut self, addr: u32, len: u32) -> Option<&mut [u8]> {
        self.data
            .get_mut(addr as usize..(addr as usize).checked_add(len as usize)?)
    }

    /// Copy a guest image into RAM at `addr`. Returns `None` when the image
    /// does not fit.
    pub fn load_image(&mut self, addr: u32, image: &[u8]) -> Option<()> {
        self.slice_mut(addr, image.len() as u32)?.copy_from_slice(image);
        Some(())
    }

    /// The whole RAM contents, for snapshotting and sidecar dumps.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the whole RAM contents, for snapshot restore.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for Ram {
    fn default() -> Self {
        Self::new()
    }
}
