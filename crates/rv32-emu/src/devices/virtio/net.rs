//! Legacy virtio network device.
//!
//! Queue 0 receives, queue 1 transmits. Frames cross the host boundary
//! through a pluggable [`NetBackend`]; the transport itself only moves
//! bytes between the virtqueues and the backend. Every buffer starts with
//! the 10-byte legacy `virtio_net_hdr`, which this device neither needs
//! nor fills beyond zeroes.

use crate::devices::virtio::{MmioEvent, MmioTransport, INT_USED_RING, REG_CONFIG};
use crate::mem::Ram;

/// PLIC source number of the network device.
pub const VNET_IRQ: u32 = 2;

/// Virtio device id of a network device.
const DEVICE_ID_NET: u32 = 1;

/// The device exposes a stable MAC address in its config space.
const VIRTIO_NET_F_MAC: u32 = 1 << 5;

/// Legacy virtio_net_hdr length (no mergeable receive buffers).
const NET_HDR_LEN: u32 = 10;

const RX_QUEUE: u32 = 0;
const TX_QUEUE: u32 = 1;

/// Host side of the network device: a frame sink and source. The trait
/// keeps TAP/socket specifics out of the machine; tests plug in an
/// in-memory pair.
pub trait NetBackend: Send {
    /// Transmit one Ethernet frame from the guest.
    fn send(&mut self, frame: &[u8]);
    /// Fetch the next frame destined for the guest, if any.
    fn recv(&mut self) -> Option<Vec<u8>>;
}

pub struct VirtioNet {
    pub mmio: MmioTransport,
    backend: Box<dyn NetBackend>,
    mac: [u8; 6],
}

impl VirtioNet {
    pub fn new(backend: Box<dyn NetBackend>) -> Self {
        Self {
            mmio: MmioTransport::new(DEVICE_ID_NET, VIRTIO_NET_F_MAC, 2),
            backend,
            mac: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
        }
    }

    /// Whether the device is asserting its interrupt line.
    pub fn interrupting(&self) -> bool {
        self.mmio.interrupting()
    }

    pub fn read(&mut self, offset: u32) -> u32 {
        if offset >= REG_CONFIG {
            // Config space: the MAC address, byte-packed little-endian.
            let mut word = [0u8; 4];
            for (i, byte) in word.iter_mut().enumerate() {
                let idx = (offset - REG_CONFIG) as usize + i;
                *byte = self.mac.get(idx).copied().unwrap_or(0);
            }
            return u32::from_le_bytes(word);
        }
        self.mmio.read(offset)
    }

    pub fn write(&mut self, ram: &mut Ram, offset: u32, value: u32) {
        match self.mmio.write(offset, value) {
            MmioEvent::QueueNotify(TX_QUEUE) => self.process_tx(ram),
            MmioEvent::QueueNotify(RX_QUEUE) => self.refresh_rx(ram),
            _ => {}
        }
    }

    /// Transmit every pending chain on the TX queue to the backend.
    fn process_tx(&mut self, ram: &mut Ram) {
        let page_size = self.mmio.guest_page_size;
        let mut queue = self.mmio.queues[TX_QUEUE as usize];
        let mut used_any = false;

        while let Some(chain) = queue.pop(ram, page_size) {
            // Gather the chain, then strip the leading virtio_net_hdr.
            let mut frame = Vec::new();
            for desc in &chain.descs {
                if desc.is_writable() {
                    continue;
                }
                match ram.slice(desc.addr, desc.len) {
                    Some(bytes) => frame.extend_from_slice(bytes),
                    None => {
                        frame.clear();
                        break;
                    }
                }
            }
            if frame.len() > NET_HDR_LEN as usize {
                self.backend.send(&frame[NET_HDR_LEN as usize..]);
            }
            if queue.push_used(ram, page_size, chain.head, 0).is_none() {
                tracing::warn!("virtio-net tx used ring outside RAM");
                break;
            }
            used_any = true;
        }

        self.mmio.queues[TX_QUEUE as usize] = queue;
        if used_any {
            self.mmio.interrupt_status |= INT_USED_RING;
        }
    }

    /// Deliver frames waiting in the backend into RX buffers the guest
    /// posted. Called from the main-loop poll and on RX queue kicks.
    pub fn refresh_rx(&mut self, ram: &mut Ram) {
        let page_size = self.mmio.guest_page_size;
        let mut queue = self.mmio.queues[RX_QUEUE as usize];
        if !queue.ready() {
            return;
        }
        let mut used_any = false;

        while let Some(frame) = self.backend.recv() {
            let Some(chain) = queue.pop(ram, page_size) else {
                // No guest buffer available; the frame is dropped, as a
                // real NIC with a full RX ring would.
                tracing::warn!(len = frame.len(), "virtio-net rx ring full, frame dropped");
                break;
            };

            // Header (zeroed) followed by the frame, scattered across the
            // writable buffers of the chain.
            let mut payload = vec![0u8; NET_HDR_LEN as usize];
            payload.extend_from_slice(&frame);
            let mut copied = 0usize;
            for desc in &chain.descs {
                if !desc.is_writable() || copied == payload.len() {
                    continue;
                }
                let take = (desc.len as usize).min(payload.len() - copied);
                match ram.slice_mut(desc.addr, take as u32) {
                    Some(dst) => dst.copy_from_slice(&payload[copied..copied + take]),
                    None => break,
                }
                copied += take;
            }
            if queue.push_used(ram, page_size, chain.head, copied as u32).is_none() {
                tracing::warn!("virtio-net rx used ring outside RAM");
                break;
            }
            used_any = true;
        }

        self.mmio.queues[RX_QUEUE as usize] = queue;
        if used_any {
            self.mmio.interrupt_status |= INT_USED_RING;
        }
    }
}
