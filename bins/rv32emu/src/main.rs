//! Host binary: parses the command line, loads the guest images into RAM,
//! wires the console and the stop signal, runs the machine, and persists
//! the checkpoint on exit.

use anyhow::{Context, Result};
use clap::Parser;
use rv32_emu::emu::Emu;
use rv32_emu::primitives::constants::{DTB_ADDR, INITRD_ADDR};
use rv32_emu::snapshot;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use tracing::{info, warn};

/// Boot a supervisor-mode RV32 OS image.
#[derive(Parser)]
#[clap(name = "rv32emu", version, about, long_about = None)]
struct Args {
    /// Kernel image, loaded at physical address zero
    #[clap(short, long)]
    kernel: PathBuf,

    /// Device tree blob, loaded at the address advertised in a1
    #[clap(short = 'b', long)]
    dtb: Option<PathBuf>,

    /// Initrd image, loaded below the DTB region
    #[clap(short, long)]
    initrd: Option<PathBuf>,

    /// Disk image backing a virtio-blk device; written back on clean exit
    #[clap(short, long)]
    disk: Option<PathBuf>,

    /// Snapshot file: restored at boot when present and valid, written on
    /// exit
    #[clap(short, long)]
    snapshot: Option<PathBuf>,

    /// Dump the whole RAM image to this file on exit, for inspection
    #[clap(long)]
    dump_ram: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("rv32emu: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut emu = Emu::new();

    let kernel = fs::read(&args.kernel)
        .with_context(|| format!("reading kernel image {}", args.kernel.display()))?;
    emu.load_at(0, &kernel)?;

    if let Some(path) = &args.dtb {
        let dtb = fs::read(path).with_context(|| format!("reading dtb {}", path.display()))?;
        emu.load_at(DTB_ADDR, &dtb)?;
    }
    if let Some(path) = &args.initrd {
        let initrd =
            fs::read(path).with_context(|| format!("reading initrd {}", path.display()))?;
        emu.load_at(INITRD_ADDR, &initrd)?;
    }
    if let Some(path) = &args.disk {
        let disk = fs::read(path)
            .with_context(|| format!("reading disk image {}", path.display()))?;
        emu.attach_disk(disk);
    }

    // Console: a reader thread feeds stdin bytes to the UART; the main
    // loop drains the channel at its poll boundary.
    let (console_tx, console_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut byte = [0u8; 1];
        while stdin.read_exact(&mut byte).is_ok() {
            if console_tx.send(byte[0]).is_err() {
                break;
            }
        }
    });
    emu.cpu.bus.uart.set_input(console_rx);

    // A signal stops the loop at the next poll boundary so the checkpoint
    // still gets written.
    let stop = emu.stop_handle();
    ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
        .context("installing the stop handler")?;

    let mut restored = false;
    if let Some(path) = &args.snapshot {
        if path.exists() {
            let blob = fs::read(path)
                .with_context(|| format!("reading snapshot {}", path.display()))?;
            match snapshot::load(&mut emu, &blob) {
                Ok(consumed) => {
                    info!(bytes = consumed, "resumed from snapshot");
                    restored = true;
                }
                Err(err) => warn!(%err, "snapshot rejected, falling back to fresh boot"),
            }
        }
    }
    if !restored {
        emu.reset_boot();
    }

    emu.run()?;

    if let Some(path) = &args.snapshot {
        fs::write(path, snapshot::save(&emu))
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        info!(path = %path.display(), "snapshot written");
    }
    if let Some(path) = &args.dump_ram {
        fs::write(path, emu.cpu.bus.ram.bytes())
            .with_context(|| format!("writing RAM dump {}", path.display()))?;
    }
    if let (Some(path), Some(disk)) = (&args.disk, emu.take_disk()) {
        fs::write(path, disk)
            .with_context(|| format!("writing disk image {}", path.display()))?;
    }

    Ok(())
}
