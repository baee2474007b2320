//! Decode and execute the RV32IMA base and the privileged instructions the
//! supervisor surface needs.
use crate::cpu::{Cpu, Mode};
use crate::exception::{Exception, VmError};
use crate::primitives::constants::{BYTE, HALFWORD, WORD};
use crate::reg::csr::{
    CsrAddress, SEPC, SSTATUS, SSTATUS_SIE, SSTATUS_SPIE, SSTATUS_SPP,
};

/// Execute a single 32-bit instruction. Raises an exception if something is
/// wrong; the caller increments the program counter by 4 afterwards, so a
/// taken branch stores `target - 4`.
pub fn execute_inner(cpu: &mut Cpu, inst: u32) -> Result<(), VmError> {
    // 2. Decode.
    let opcode = inst & 0x0000007f;
    let rd = (inst & 0x00000f80) >> 7;
    let rs1 = (inst & 0x000f8000) >> 15;
    let rs2 = (inst & 0x01f00000) >> 20;
    let funct3 = (inst & 0x00007000) >> 12;
    let funct7 = (inst & 0xfe000000) >> 25;

    // 3. Execute.
    match opcode {
        0x03 => {
            // RV32I loads
            // imm[11:0] = inst[31:20]
            let offset = (inst as i32 >> 20) as u32;
            let addr = cpu.x_regs.read(rs1).wrapping_add(offset);
            match funct3 {
                0x0 => {
                    // lb
                    let val = cpu.read(addr, BYTE)?;
                    cpu.x_regs.write(rd, val as i8 as i32 as u32);
                }
                0x1 => {
                    // lh
                    let val = cpu.read(addr, HALFWORD)?;
                    cpu.x_regs.write(rd, val as i16 as i32 as u32);
                }
                0x2 => {
                    // lw
                    let val = cpu.read(addr, WORD)?;
                    cpu.x_regs.write(rd, val);
                }
                0x4 => {
                    // lbu
                    let val = cpu.read(addr, BYTE)?;
                    cpu.x_regs.write(rd, val);
                }
                0x5 => {
                    // lhu
                    let val = cpu.read(addr, HALFWORD)?;
                    cpu.x_regs.write(rd, val);
                }
                _ => {
                    return Err(Exception::IllegalInstruction(inst).into());
                }
            }
        }
        0x0f => {
            // fence and fence.i are no-ops: a single hart executing
            // instructions sequentially needs neither memory ordering nor
            // an instruction-cache flush.
            match funct3 {
                0x0 => {
                    // fence
                }
                0x1 => {
                    // fence.i
                }
                _ => {
                    return Err(Exception::IllegalInstruction(inst).into());
                }
            }
        }
        0x13 => {
            // RV32I register-immediate
            // imm[11:0] = inst[31:20]
            let imm = (inst as i32 >> 20) as u32;
            match funct3 {
                0x0 => {
                    // addi
                    cpu.x_regs.write(rd, cpu.x_regs.read(rs1).wrapping_add(imm));
                }
                0x1 => {
                    // slli
                    if funct7 != 0 {
                        return Err(Exception::IllegalInstruction(inst).into());
                    }
                    let shamt = rs2;
                    cpu.x_regs.write(rd, cpu.x_regs.read(rs1) << shamt);
                }
                0x2 => {
                    // slti
                    cpu.x_regs.write(
                        rd,
                        u32::from((cpu.x_regs.read(rs1) as i32) < imm as i32),
                    );
                }
                0x3 => {
                    // sltiu
                    cpu.x_regs.write(rd, u32::from(cpu.x_regs.read(rs1) < imm));
                }
                0x4 => {
                    // xori
                    cpu.x_regs.write(rd, cpu.x_regs.read(rs1) ^ imm);
                }
                0x5 => match funct7 {
                    0x00 => {
                        // srli
                        let shamt = rs2;
                        cpu.x_regs.write(rd, cpu.x_regs.read(rs1) >> shamt);
                    }
                    0x20 => {
                        // srai
                        let shamt = rs2;
                        cpu.x_regs
                            .write(rd, ((cpu.x_regs.read(rs1) as i32) >> shamt) as u32);
                    }
                    _ => {
                        return Err(Exception::IllegalInstruction(inst).into());
                    }
                },
                0x6 => {
                    // ori
                    cpu.x_regs.write(rd, cpu.x_regs.read(rs1) | imm);
                }
                0x7 => {
                    // andi
                    cpu.x_regs.write(rd, cpu.x_regs.read(rs1) & imm);
                }
                _ => {
                    return Err(Exception::IllegalInstruction(inst).into());
                }
            }
        }
        0x17 => {
            // auipc
            // AUIPC forms a 32-bit offset from the 20-bit U-immediate,
            // filling in the lowest 12 bits with zeros.
            let imm = inst & 0xfffff000;
            cpu.x_regs.write(rd, cpu.pc.wrapping_add(imm));
        }
        0x23 => {
            // RV32I stores
            // offset[11:5|4:0] = inst[31:25|11:7]
            let offset = ((inst & 0xfe000000) as i32 >> 20) as u32 | ((inst >> 7) & 0x1f);
            let addr = cpu.x_regs.read(rs1).wrapping_add(offset);
            match funct3 {
                0x0 => {
                    // sb
                    cpu.write(addr, BYTE, cpu.x_regs.read(rs2))?;
                }
                0x1 => {
                    // sh
                    cpu.write(addr, HALFWORD, cpu.x_regs.read(rs2))?;
                }
                0x2 => {
                    // sw
                    cpu.write(addr, WORD, cpu.x_regs.read(rs2))?;
                }
                _ => {
                    return Err(Exception::IllegalInstruction(inst).into());
                }
            }
        }
        0x2f => {
            // RV32A
            let funct5 = funct7 >> 2;
            // The aq and rl ordering hints mean nothing on a single hart.
            if funct3 != 0x2 {
                return Err(Exception::IllegalInstruction(inst).into());
            }
            let addr = cpu.x_regs.read(rs1);
            match funct5 {
                0x02 => {
                    // lr.w
                    // "For LR and SC, the A extension requires that the
                    // address held in rs1 be naturally aligned to the size
                    // of the operand."
                    if addr & 3 != 0 {
                        return Err(Exception::LoadAddressMisaligned(addr).into());
                    }
                    let value = cpu.read(addr, WORD)?;
                    cpu.x_regs.write(rd, value);
                    cpu.reservation = Some(addr);
                }
                0x03 => {
                    // sc.w
                    if addr & 3 != 0 {
                        return Err(Exception::StoreAMOAddressMisaligned(addr).into());
                    }
                    if cpu.reservation == Some(addr) {
                        cpu.write(addr, WORD, cpu.x_regs.read(rs2))?;
                        cpu.x_regs.write(rd, 0);
                    } else {
                        cpu.x_regs.write(rd, 1);
                    }
                    // SC always invalidates the reservation, pass or fail.
                    cpu.reservation = None;
                }
                _ => {
                    // AMOs reduce to a non-atomic read-modify-write on a
                    // single-threaded core; the interface stays atomic at
                    // architectural granularity.
                    if addr & 3 != 0 {
                        return Err(Exception::StoreAMOAddressMisaligned(addr).into());
                    }
                    let t = cpu.read(addr, WORD)?;
                    let src = cpu.x_regs.read(rs2);
                    let result = match funct5 {
                        0x00 => t.wrapping_add(src),         // amoadd.w
                        0x01 => src,                         // amoswap.w
                        0x04 => t ^ src,                     // amoxor.w
                        0x08 => t | src,                     // amoor.w
                        0x0c => t & src,                     // amoand.w
                        0x10 => (t as i32).min(src as i32) as u32, // amomin.w
                        0x14 => (t as i32).max(src as i32) as u32, // amomax.w
                        0x18 => t.min(src),                  // amominu.w
                        0x1c => t.max(src),                  // amomaxu.w
                        _ => {
                            return Err(Exception::IllegalInstruction(inst).into());
                        }
                    };
                    cpu.write(addr, WORD, result)?;
                    cpu.x_regs.write(rd, t);
                }
            }
        }
        0x33 => {
            // RV32I register-register and RV32M
            let src1 = cpu.x_regs.read(rs1);
            let src2 = cpu.x_regs.read(rs2);
            match (funct3, funct7) {
                (0x0, 0x00) => {
                    // add
                    cpu.x_regs.write(rd, src1.wrapping_add(src2));
                }
                (0x0, 0x20) => {
                    // sub
                    cpu.x_regs.write(rd, src1.wrapping_sub(src2));
                }
                (0x1, 0x00) => {
                    // sll
                    cpu.x_regs.write(rd, src1 << (src2 & 0x1f));
                }
                (0x2, 0x00) => {
                    // slt
                    cpu.x_regs.write(rd, u32::from((src1 as i32) < (src2 as i32)));
                }
                (0x3, 0x00) => {
                    // sltu
                    cpu.x_regs.write(rd, u32::from(src1 < src2));
                }
                (0x4, 0x00) => {
                    // xor
                    cpu.x_regs.write(rd, src1 ^ src2);
                }
                (0x5, 0x00) => {
                    // srl
                    cpu.x_regs.write(rd, src1 >> (src2 & 0x1f));
                }
                (0x5, 0x20) => {
                    // sra
                    cpu.x_regs.write(rd, ((src1 as i32) >> (src2 & 0x1f)) as u32);
                }
                (0x6, 0x00) => {
                    // or
                    cpu.x_regs.write(rd, src1 | src2);
                }
                (0x7, 0x00) => {
                    // and
                    cpu.x_regs.write(rd, src1 & src2);
                }
                (0x0, 0x01) => {
                    // mul
                    cpu.x_regs.write(rd, src1.wrapping_mul(src2));
                }
                (0x1, 0x01) => {
                    // mulh
                    let product = i64::from(src1 as i32) * i64::from(src2 as i32);
                    cpu.x_regs.write(rd, (product >> 32) as u32);
                }
                (0x2, 0x01) => {
                    // mulhsu
                    let product = i64::from(src1 as i32) * i64::from(src2);
                    cpu.x_regs.write(rd, (product >> 32) as u32);
                }
                (0x3, 0x01) => {
                    // mulhu
                    let product = u64::from(src1) * u64::from(src2);
                    cpu.x_regs.write(rd, (product >> 32) as u32);
                }
                (0x4, 0x01) => {
                    // div
                    // "The quotient of division by zero has all bits set."
                    // "The quotient of a signed division with overflow is
                    // equal to the dividend", which is what wrapping_div
                    // produces for MIN / -1.
                    let dividend = src1 as i32;
                    let divisor = src2 as i32;
                    let quotient = if divisor == 0 {
                        -1
                    } else {
                        dividend.wrapping_div(divisor)
                    };
                    cpu.x_regs.write(rd, quotient as u32);
                }
                (0x5, 0x01) => {
                    // divu
                    let quotient = if src2 == 0 { u32::MAX } else { src1 / src2 };
                    cpu.x_regs.write(rd, quotient);
                }
                (0x6, 0x01) => {
                    // rem
                    // "The remainder of division by zero equals the
                    // dividend"; signed overflow yields a zero remainder,
                    // which wrapping_rem produces for MIN % -1.
                    let dividend = src1 as i32;
                    let divisor = src2 as i32;
                    let remainder = if divisor == 0 {
                        dividend
                    } else {
                        dividend.wrapping_rem(divisor)
                    };
                    cpu.x_regs.write(rd, remainder as u32);
                }
                (0x7, 0x01) => {
                    // remu
                    let remainder = if src2 == 0 { src1 } else { src1 % src2 };
                    cpu.x_regs.write(rd, remainder);
                }
                _ => {
                    return Err(Exception::IllegalInstruction(inst).into());
                }
            }
        }
        0x37 => {
            // lui
            cpu.x_regs.write(rd, inst & 0xfffff000);
        }
        0x63 => {
            // RV32I branches
            // imm[12|10:5|4:1|11] = inst[31|30:25|11:8|7]
            let imm = ((inst & 0x80000000) as i32 >> 19) as u32
                | ((inst & 0x80) << 4)
                | ((inst >> 20) & 0x7e0)
                | ((inst >> 7) & 0x1e);
            let src1 = cpu.x_regs.read(rs1);
            let src2 = cpu.x_regs.read(rs2);
            let taken = match funct3 {
                0x0 => src1 == src2,                       // beq
                0x1 => src1 != src2,                       // bne
                0x4 => (src1 as i32) < (src2 as i32),      // blt
                0x5 => (src1 as i32) >= (src2 as i32),     // bge
                0x6 => src1 < src2,                        // bltu
                0x7 => src1 >= src2,                       // bgeu
                _ => {
                    return Err(Exception::IllegalInstruction(inst).into());
                }
            };
            if taken {
                let target = cpu.pc.wrapping_add(imm);
                if target & 3 != 0 {
                    return Err(Exception::InstructionAddressMisaligned(target).into());
                }
                cpu.pc = target.wrapping_sub(4);
            }
        }
        0x67 => {
            // jalr
            // The target drops the least-significant bit of rs1 + imm.
            let imm = (inst as i32 >> 20) as u32;
            let target = cpu.x_regs.read(rs1).wrapping_add(imm) & !1;
            if target & 3 != 0 {
                return Err(Exception::InstructionAddressMisaligned(target).into());
            }
            cpu.x_regs.write(rd, cpu.pc.wrapping_add(4));
            cpu.pc = target.wrapping_sub(4);
        }
        0x6f => {
            // jal
            // imm[20|10:1|11|19:12] = inst[31|30:21|20|19:12]
            let imm = ((inst & 0x80000000) as i32 >> 11) as u32
                | (inst & 0xff000)
                | ((inst >> 9) & 0x800)
                | ((inst >> 20) & 0x7fe);
            let target = cpu.pc.wrapping_add(imm);
            if target & 3 != 0 {
                return Err(Exception::InstructionAddressMisaligned(target).into());
            }
            cpu.x_regs.write(rd, cpu.pc.wrapping_add(4));
            cpu.pc = target.wrapping_sub(4);
        }
        0x73 => {
            // Zicsr and privileged instructions
            let csr_addr = (inst >> 20) as CsrAddress;
            match funct3 {
                0x0 => match (rs2, funct7) {
                    (0x0, 0x0) => {
                        // ecall
                        return Err(match cpu.mode {
                            Mode::Supervisor => Exception::EnvironmentCallFromSMode.into(),
                            Mode::User => Exception::EnvironmentCallFromUMode.into(),
                        });
                    }
                    (0x1, 0x0) => {
                        // ebreak
                        return Err(Exception::Breakpoint(cpu.pc).into());
                    }
                    (0x2, 0x08) => {
                        // sret
                        // "When an SRET instruction is executed, SIE is set
                        // to SPIE, then SPIE is set to 1, the privilege
                        // mode is changed to SPP, and SPP is set to U."
                        if cpu.mode != Mode::Supervisor {
                            return Err(Exception::IllegalInstruction(inst).into());
                        }
                        cpu.pc = cpu.state.read(SEPC).wrapping_sub(4);
                        let spie = cpu.state.read_bit(SSTATUS, SSTATUS_SPIE);
                        cpu.state.write_bit(SSTATUS, SSTATUS_SIE, spie);
                        cpu.state.write_bit(SSTATUS, SSTATUS_SPIE, true);
                        cpu.mode = if cpu.state.read_bit(SSTATUS, SSTATUS_SPP) {
                            Mode::Supervisor
                        } else {
                            Mode::User
                        };
                        cpu.state.write_bit(SSTATUS, SSTATUS_SPP, false);
                    }
                    (0x5, 0x08) => {
                        // wfi
                        // A hint; the main loop polls devices regardless,
                        // so treat it as a no-op.
                    }
                    (_, 0x09) => {
                        // sfence.vma
                        // No TLB to flush, but satp-derived state is
                        // recomputed like a real fence would force.
                        cpu.update_paging();
                    }
                    _ => {
                        return Err(Exception::IllegalInstruction(inst).into());
                    }
                },
                0x1 => {
                    // csrrw
                    let old = cpu.csr_read(csr_addr, inst)?;
                    cpu.csr_write(csr_addr, cpu.x_regs.read(rs1), inst)?;
                    cpu.x_regs.write(rd, old);
                }
                0x2 => {
                    // csrrs
                    // With rs1 = x0 the CSR is read but not written, so
                    // csrr on a read-only counter is legal.
                    let old = cpu.csr_read(csr_addr, inst)?;
                    if rs1 != 0 {
                        cpu.csr_write(csr_addr, old | cpu.x_regs.read(rs1), inst)?;
                    }
                    cpu.x_regs.write(rd, old);
                }
                0x3 => {
                    // csrrc
                    let old = cpu.csr_read(csr_addr, inst)?;
                    if rs1 != 0 {
                        cpu.csr_write(csr_addr, old & !cpu.x_regs.read(rs1), inst)?;
                    }
                    cpu.x_regs.write(rd, old);
                }
                0x5 => {
                    // csrrwi
                    let old = cpu.csr_read(csr_addr, inst)?;
                    cpu.csr_write(csr_addr, rs1, inst)?;
                    cpu.x_regs.write(rd, old);
                }
                0x6 => {
                    // csrrsi
                    let old = cpu.csr_read(csr_addr, inst)?;
                    if rs1 != 0 {
                        cpu.csr_write(csr_addr, old | rs1, inst)?;
                    }
                    cpu.x_regs.write(rd, old);
                }
                0x7 => {
                    // csrrci
                    let old = cpu.csr_read(csr_addr, inst)?;
                    if rs1 != 0 {
                        cpu.csr_write(csr_addr, old & !rs1, inst)?;
                    }
                    cpu.x_regs.write(rd, old);
                }
                _ => {
                    return Err(Exception::IllegalInstruction(inst).into());
                }
            }
        }
        _ => {
            return Err(Exception::IllegalInstruction(inst).into());
        }
    }
    Ok(())
}
