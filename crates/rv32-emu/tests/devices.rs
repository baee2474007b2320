//! Device behaviour through the physical address map: UART interrupts into
//! the PLIC, claim/complete over MMIO, and the virtio queues.

mod common;

use common::*;
use rv32_emu::devices::virtio::net::NetBackend;
use rv32_emu::primitives::constants::{BYTE, WORD};
use rv32_emu::reg::csr::{SCAUSE, SEIP_BIT, SIE, SSTATUS, SSTATUS_SIE};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const UART_BASE: u32 = 0xf400_0000;
const PLIC_ENABLE: u32 = 0xf000_2000;
const PLIC_CLAIM: u32 = 0xf020_0004;
const VBLK_BASE: u32 = 0xf420_0000;
const VNET_BASE: u32 = 0xf410_0000;

#[test]
fn uart_rx_interrupt_reaches_the_hart() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    emu.cpu.state.write_bit(SSTATUS, SSTATUS_SIE, true);
    emu.cpu.state.write(SIE, SEIP_BIT);
    // IER.RX = 1, PLIC enables source 1.
    emu.cpu.bus.write(UART_BASE + 4, WORD, 1).unwrap();
    emu.cpu.bus.write(PLIC_ENABLE, WORD, 1 << 1).unwrap();

    emu.cpu.bus.uart.inject(b'X');
    emu.poll();

    emu.step().unwrap();
    assert_eq!(emu.cpu.state.read(SCAUSE), 0x8000_0009);

    // Claiming returns the UART source; the receive register holds the
    // injected byte.
    assert_eq!(emu.cpu.bus.read(PLIC_CLAIM, WORD).unwrap(), 1);
    assert_eq!(emu.cpu.bus.read(UART_BASE, BYTE).unwrap(), u32::from(b'X'));
}

#[test]
fn mmio_claim_write_rearms_the_source() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    emu.cpu.bus.write(UART_BASE + 4, WORD, 1).unwrap();
    emu.cpu.bus.write(PLIC_ENABLE, WORD, 1 << 1).unwrap();
    emu.cpu.bus.uart.inject(b'a');
    emu.poll();

    assert_eq!(emu.cpu.bus.read(PLIC_CLAIM, WORD).unwrap(), 1);
    assert!(!emu.cpu.bus.plic.interrupt_pending());

    // The byte is still unread, so completing the claim re-raises it.
    emu.cpu.bus.write(PLIC_CLAIM, WORD, 1).unwrap();
    assert!(emu.cpu.bus.plic.interrupt_pending());
}

struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn uart_tx_bytes_reach_the_host_sink() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    let sink = Arc::new(Mutex::new(Vec::new()));
    emu.cpu.bus.uart.set_output(Box::new(SharedSink(Arc::clone(&sink))));

    for byte in b"ok\n" {
        emu.cpu.bus.write(UART_BASE, BYTE, u32::from(*byte)).unwrap();
    }
    assert_eq!(sink.lock().unwrap().as_slice(), b"ok\n");
}

/// Lay out a one-request virtqueue and return (pfn, head-descriptor
/// index). Descriptor table at 0x10000, buffers above it.
fn build_blk_request(
    emu: &mut rv32_emu::emu::Emu,
    req_type: u32,
    sector: u64,
    data_addr: u32,
    data_len: u32,
    device_writes: bool,
) {
    let ram = &mut emu.cpu.bus.ram;
    let desc = 0x1_0000;
    let header = 0x2_0000;
    let status = 0x2_1000;

    // Request header: type, reserved, sector.
    ram.write_u32(header, req_type).unwrap();
    ram.write_u32(header + 4, 0).unwrap();
    ram.write_u32(header + 8, sector as u32).unwrap();
    ram.write_u32(header + 12, (sector >> 32) as u32).unwrap();

    // Descriptor 0: header, chained.
    ram.write_u32(desc, header).unwrap();
    ram.write_u32(desc + 8, 16).unwrap();
    ram.write_u16(desc + 12, 1).unwrap(); // NEXT
    ram.write_u16(desc + 14, 1).unwrap();
    // Descriptor 1: data, chained.
    ram.write_u32(desc + 16, data_addr).unwrap();
    ram.write_u32(desc + 24, data_len).unwrap();
    ram.write_u16(desc + 28, 1 | if device_writes { 2 } else { 0 }).unwrap();
    ram.write_u16(desc + 30, 2).unwrap();
    // Descriptor 2: status byte, device-writable, end of chain.
    ram.write_u32(desc + 32, status).unwrap();
    ram.write_u32(desc + 40, 1).unwrap();
    ram.write_u16(desc + 44, 2).unwrap(); // WRITE

    // Avail ring: one entry pointing at descriptor 0.
    let avail = desc + 16 * 8;
    ram.write_u16(avail + 2, 1).unwrap();
    ram.write_u16(avail + 4, 0).unwrap();

    // Queue 0: num 8, align 4096, pfn desc >> 12.
    let bus = &mut emu.cpu.bus;
    bus.write(VBLK_BASE + 0x30, WORD, 0).unwrap();
    bus.write(VBLK_BASE + 0x38, WORD, 8).unwrap();
    bus.write(VBLK_BASE + 0x3c, WORD, 4096).unwrap();
    bus.write(VBLK_BASE + 0x40, WORD, desc >> 12).unwrap();
}

#[test]
fn virtio_blk_serves_a_read_request() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    let mut disk = vec![0u8; 4 * 512];
    disk[512..1024].iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
    emu.attach_disk(disk);

    // Identity registers first.
    assert_eq!(emu.cpu.bus.read(VBLK_BASE, WORD).unwrap(), 0x7472_6976);
    assert_eq!(emu.cpu.bus.read(VBLK_BASE + 4, WORD).unwrap(), 1);
    assert_eq!(emu.cpu.bus.read(VBLK_BASE + 8, WORD).unwrap(), 2);
    // Config space: capacity in sectors.
    assert_eq!(emu.cpu.bus.read(VBLK_BASE + 0x100, WORD).unwrap(), 4);

    let buffer = 0x3_0000;
    build_blk_request(&mut emu, 0, 1, buffer, 512, true);
    emu.cpu.bus.write(VBLK_BASE + 0x50, WORD, 0).unwrap();

    // Sector 1 landed in the buffer, the status byte is OK, the used ring
    // advanced, and the interrupt line reached the PLIC.
    let got = emu.cpu.bus.ram.slice(buffer, 512).unwrap();
    assert!(got.iter().enumerate().all(|(i, b)| *b == i as u8));
    assert_eq!(emu.cpu.bus.ram.read(0x2_1000, BYTE), Some(0));
    let used = 0x1_1000; // next 4096 boundary past desc + avail
    assert_eq!(emu.cpu.bus.ram.read_u16(used + 2), Some(1));
    assert_eq!(emu.cpu.bus.read(VBLK_BASE + 0x60, WORD).unwrap(), 1);
    assert!(emu.cpu.bus.plic.active & (1 << 3) != 0);
}

#[test]
fn virtio_blk_serves_a_write_request() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    emu.attach_disk(vec![0u8; 4 * 512]);

    let buffer = 0x3_0000;
    for i in 0..512u32 {
        emu.cpu.bus.ram.write(buffer + i, BYTE, 0xa5).unwrap();
    }
    build_blk_request(&mut emu, 1, 2, buffer, 512, false);
    emu.cpu.bus.write(VBLK_BASE + 0x50, WORD, 0).unwrap();

    assert_eq!(emu.cpu.bus.ram.read(0x2_1000, BYTE), Some(0));
    let disk = emu.take_disk().unwrap();
    assert!(disk[1024..1536].iter().all(|b| *b == 0xa5));
    assert!(disk[..1024].iter().all(|b| *b == 0));
}

#[derive(Default)]
struct LoopBackend {
    inbound: VecDeque<Vec<u8>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl NetBackend for LoopBackend {
    fn send(&mut self, frame: &[u8]) {
        self.sent.lock().unwrap().push(frame.to_vec());
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.pop_front()
    }
}

#[test]
fn virtio_net_transmits_and_receives_frames() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    let sent = Arc::new(Mutex::new(Vec::new()));
    let mut backend = LoopBackend {
        sent: Arc::clone(&sent),
        ..Default::default()
    };
    backend.inbound.push_back(vec![0xbb; 60]);
    emu.attach_net(Box::new(backend));

    assert_eq!(emu.cpu.bus.read(VNET_BASE + 8, WORD).unwrap(), 1);
    // The MAC feature is advertised and the config space carries it.
    assert_eq!(emu.cpu.bus.read(VNET_BASE + 0x10, WORD).unwrap(), 1 << 5);
    assert_eq!(
        emu.cpu.bus.read(VNET_BASE + 0x100, WORD).unwrap(),
        u32::from_le_bytes([0x00, 0x11, 0x22, 0x33])
    );

    let ram = &mut emu.cpu.bus.ram;
    // TX queue (1): one chain of header-plus-frame at descriptor 0.
    let desc = 0x1_0000;
    let payload = 0x2_0000;
    for i in 0..10u32 {
        ram.write(payload + i, BYTE, 0).unwrap();
    }
    for i in 0..20u32 {
        ram.write(payload + 10 + i, BYTE, 0xcc).unwrap();
    }
    ram.write_u32(desc, payload).unwrap();
    ram.write_u32(desc + 8, 30).unwrap();
    ram.write_u16(desc + 12, 0).unwrap();
    let avail = desc + 16 * 8;
    ram.write_u16(avail + 2, 1).unwrap();
    ram.write_u16(avail + 4, 0).unwrap();

    let bus = &mut emu.cpu.bus;
    bus.write(VNET_BASE + 0x30, WORD, 1).unwrap();
    bus.write(VNET_BASE + 0x38, WORD, 8).unwrap();
    bus.write(VNET_BASE + 0x3c, WORD, 4096).unwrap();
    bus.write(VNET_BASE + 0x40, WORD, desc >> 12).unwrap();
    bus.write(VNET_BASE + 0x50, WORD, 1).unwrap();

    let frames = sent.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0], vec![0xcc; 20]);
    drop(frames);

    // RX queue (0): one writable buffer; the poll delivers the inbound
    // frame behind a zeroed header.
    let rx_desc = 0x4_0000;
    let rx_buf = 0x5_0000;
    let ram = &mut emu.cpu.bus.ram;
    ram.write_u32(rx_desc, rx_buf).unwrap();
    ram.write_u32(rx_desc + 8, 1024).unwrap();
    ram.write_u16(rx_desc + 12, 2).unwrap(); // WRITE
    let rx_avail = rx_desc + 16 * 8;
    ram.write_u16(rx_avail + 2, 1).unwrap();
    ram.write_u16(rx_avail + 4, 0).unwrap();

    let bus = &mut emu.cpu.bus;
    bus.write(VNET_BASE + 0x30, WORD, 0).unwrap();
    bus.write(VNET_BASE + 0x38, WORD, 8).unwrap();
    bus.write(VNET_BASE + 0x3c, WORD, 4096).unwrap();
    bus.write(VNET_BASE + 0x40, WORD, rx_desc >> 12).unwrap();

    emu.poll();

    let rx_used = 0x4_1000;
    assert_eq!(emu.cpu.bus.ram.read_u16(rx_used + 2), Some(1));
    // 10 header bytes then the frame.
    assert_eq!(emu.cpu.bus.ram.read(rx_buf + 9, BYTE), Some(0));
    assert_eq!(emu.cpu.bus.ram.read(rx_buf + 10, BYTE), Some(0xbb));
    assert_eq!(emu.cpu.bus.ram.read(rx_buf + 69, BYTE), Some(0xbb));
    assert!(emu.cpu.bus.plic.active & (1 << 2) != 0);
}

#[test]
fn unmapped_addresses_fault() {
    let mut emu = boot(&[addi(1, 0, 1)]);
    assert!(emu.cpu.bus.read(0xe000_0000, WORD).is_err());
    assert!(emu.cpu.bus.write(0xf430_0000, WORD, 1).is_err());
    // virtio regions fault when no device is attached.
    assert!(emu.cpu.bus.read(VBLK_BASE, WORD).is_err());
}
