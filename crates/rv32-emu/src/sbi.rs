//! Supervisor Binary Interface dispatcher.
//!
//! Entered by the main loop when the interpreter raises
//! environment-call-from-S. The extension id arrives in `a7`, the function
//! id in `a6`, arguments in `a0..a5`; the error code is returned in `a0`
//! and the value in `a1`. The caller advances the PC past the ecall.

use crate::emu::Emu;
use crate::reg::{A0, A1, A6, A7};

/// Completed without error.
pub const SBI_SUCCESS: i32 = 0;
/// Extension or function not available.
pub const SBI_ERR_NOT_SUPPORTED: i32 = -2;

/// Base extension.
pub const SBI_EID_BASE: u32 = 0x10;
/// Timer extension, "TIME".
pub const SBI_EID_TIMER: u32 = 0x5449_4d45;
/// System reset extension, "SRST".
pub const SBI_EID_RST: u32 = 0x5352_5354;

// Base extension function ids.
const FID_GET_SPEC_VERSION: u32 = 0;
const FID_GET_IMPL_ID: u32 = 1;
const FID_GET_IMPL_VERSION: u32 = 2;
const FID_PROBE_EXTENSION: u32 = 3;
const FID_GET_MVENDORID: u32 = 4;
const FID_GET_MARCHID: u32 = 5;
const FID_GET_MIMPID: u32 = 6;

// Timer extension function ids.
const FID_SET_TIMER: u32 = 0;

// System reset extension function ids.
const FID_SYSTEM_RESET: u32 = 0;

const SBI_IMPL_ID: i32 = 0x999;
const SBI_IMPL_VERSION: i32 = 1;
/// SBI specification version 0.3: major in [31:24], minor below.
const SBI_SPEC_VERSION: i32 = 3;

const MVENDORID: i32 = 0x1234_5678;
const MARCHID: i32 = (1u32 << 31) as i32 | 1;
const MIMPID: i32 = 1;

struct SbiRet {
    error: i32,
    value: i32,
}

/// Service the supervisor ecall currently sitting at `cpu.pc`.
pub fn handle_ecall(emu: &mut Emu) {
    let eid = emu.cpu.x_regs.read(A7);
    let fid = emu.cpu.x_regs.read(A6);
    let ret = match eid {
        SBI_EID_BASE => handle_base(emu, fid),
        SBI_EID_TIMER => handle_timer(emu, fid),
        SBI_EID_RST => handle_reset(emu, fid),
        _ => {
            tracing::debug!(eid, fid, "unknown sbi extension");
            SbiRet {
                error: SBI_ERR_NOT_SUPPORTED,
                value: 0,
            }
        }
    };
    emu.cpu.x_regs.write(A0, ret.error as u32);
    emu.cpu.x_regs.write(A1, ret.value as u32);
}

fn handle_base(emu: &mut Emu, fid: u32) -> SbiRet {
    let value = match fid {
        FID_GET_SPEC_VERSION => SBI_SPEC_VERSION,
        FID_GET_IMPL_ID => SBI_IMPL_ID,
        FID_GET_IMPL_VERSION => SBI_IMPL_VERSION,
        FID_PROBE_EXTENSION => {
            let eid = emu.cpu.x_regs.read(A0);
            i32::from(matches!(eid, SBI_EID_BASE | SBI_EID_TIMER | SBI_EID_RST))
        }
        FID_GET_MVENDORID => MVENDORID,
        FID_GET_MARCHID => MARCHID,
        FID_GET_MIMPID => MIMPID,
        _ => {
            return SbiRet {
                error: SBI_ERR_NOT_SUPPORTED,
                value: 0,
            }
        }
    };
    SbiRet {
        error: SBI_SUCCESS,
        value,
    }
}

fn handle_timer(emu: &mut Emu, fid: u32) -> SbiRet {
    match fid {
        FID_SET_TIMER => {
            let lo = emu.cpu.x_regs.read(A0);
            let hi = emu.cpu.x_regs.read(A1);
            emu.cpu.timer = u64::from(lo) | u64::from(hi) << 32;
            SbiRet {
                error: SBI_SUCCESS,
                value: 0,
            }
        }
        _ => SbiRet {
            error: SBI_ERR_NOT_SUPPORTED,
            value: 0,
        },
    }
}

fn handle_reset(emu: &mut Emu, fid: u32) -> SbiRet {
    match fid {
        FID_SYSTEM_RESET => {
            tracing::info!(
                reset_type = emu.cpu.x_regs.read(A0),
                reason = emu.cpu.x_regs.read(A1),
                "system reset requested"
            );
            emu.stopped = true;
            SbiRet {
                error: SBI_SUCCESS,
                value: 0,
            }
        }
        _ => SbiRet {
            error: SBI_ERR_NOT_SUPPORTED,
            value: 0,
        },
    }
}
