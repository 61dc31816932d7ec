use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

use tracery_mem::AddressSpace;

use crate::state::{X86State, FLAG_CF, FLAG_OF, FLAG_SF, FLAG_ZF};

/// How one interpreted instruction left the machine.
#[derive(Debug, PartialEq, Eq)]
pub enum StepResult {
    /// Fall through to the next instruction.
    Continue,
    /// Control transfer: `state.rip` was updated by the instruction.
    Branched,
    /// Clean task exit (`hlt`, `syscall`, `int`).
    Exited,
    /// Guest fault: bad memory access or unsupported instruction.
    Fault,
}

/// Re-decode `bytes` at `rip` and execute one instruction.
pub fn step(state: &mut X86State, space: &mut AddressSpace, bytes: &[u8], bitness: u32) -> StepResult {
    let mut decoder = Decoder::with_ip(bitness, bytes, state.rip, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.code() == Code::INVALID {
        return StepResult::Fault;
    }
    let next_ip = instr.next_ip();

    let result = exec(state, space, &instr, next_ip);
    if result == StepResult::Continue {
        state.rip = next_ip;
    }
    result
}

fn exec(
    state: &mut X86State,
    space: &mut AddressSpace,
    instr: &Instruction,
    next_ip: u64,
) -> StepResult {
    match instr.mnemonic() {
        Mnemonic::Nop => StepResult::Continue,

        Mnemonic::Mov => {
            let Some(value) = read_operand(state, space, instr, 1) else {
                return StepResult::Fault;
            };
            if write_operand(state, space, instr, 0, value).is_none() {
                return StepResult::Fault;
            }
            StepResult::Continue
        }

        Mnemonic::Lea => {
            let Some(addr) = effective_address(state, instr) else {
                return StepResult::Fault;
            };
            if instr.op0_kind() != OpKind::Register {
                return StepResult::Fault;
            }
            match state.write_reg(instr.op0_register(), addr) {
                Some(()) => StepResult::Continue,
                None => StepResult::Fault,
            }
        }

        Mnemonic::Add | Mnemonic::Sub | Mnemonic::Cmp => {
            let Some(lhs) = read_operand(state, space, instr, 0) else {
                return StepResult::Fault;
            };
            let Some(rhs) = read_operand(state, space, instr, 1) else {
                return StepResult::Fault;
            };
            let bits = operand_bits(instr, 0);
            let subtract = instr.mnemonic() != Mnemonic::Add;
            let result = arith(state, lhs, rhs, bits, subtract);
            if instr.mnemonic() == Mnemonic::Cmp {
                return StepResult::Continue;
            }
            if write_operand(state, space, instr, 0, result).is_none() {
                return StepResult::Fault;
            }
            StepResult::Continue
        }

        Mnemonic::Xor | Mnemonic::And | Mnemonic::Or | Mnemonic::Test => {
            let Some(lhs) = read_operand(state, space, instr, 0) else {
                return StepResult::Fault;
            };
            let Some(rhs) = read_operand(state, space, instr, 1) else {
                return StepResult::Fault;
            };
            let bits = operand_bits(instr, 0);
            let result = mask_to(
                match instr.mnemonic() {
                    Mnemonic::Xor => lhs ^ rhs,
                    Mnemonic::And | Mnemonic::Test => lhs & rhs,
                    _ => lhs | rhs,
                },
                bits,
            );
            state.set_flag(FLAG_CF, false);
            state.set_flag(FLAG_OF, false);
            set_zs(state, result, bits);
            if instr.mnemonic() == Mnemonic::Test {
                return StepResult::Continue;
            }
            if write_operand(state, space, instr, 0, result).is_none() {
                return StepResult::Fault;
            }
            StepResult::Continue
        }

        Mnemonic::Inc | Mnemonic::Dec => {
            let Some(value) = read_operand(state, space, instr, 0) else {
                return StepResult::Fault;
            };
            let bits = operand_bits(instr, 0);
            // inc/dec preserve CF.
            let carry = state.flag(FLAG_CF);
            let result = arith(state, value, 1, bits, instr.mnemonic() == Mnemonic::Dec);
            state.set_flag(FLAG_CF, carry);
            if write_operand(state, space, instr, 0, result).is_none() {
                return StepResult::Fault;
            }
            StepResult::Continue
        }

        Mnemonic::Push => {
            let Some(value) = read_operand(state, space, instr, 0) else {
                return StepResult::Fault;
            };
            if push64(state, space, value).is_none() {
                return StepResult::Fault;
            }
            StepResult::Continue
        }

        Mnemonic::Pop => {
            let Some(value) = pop64(state, space) else {
                return StepResult::Fault;
            };
            if write_operand(state, space, instr, 0, value).is_none() {
                return StepResult::Fault;
            }
            StepResult::Continue
        }

        Mnemonic::Call => match instr.op0_kind() {
            OpKind::NearBranch64 => {
                if push64(state, space, next_ip).is_none() {
                    return StepResult::Fault;
                }
                state.rip = instr.near_branch_target();
                StepResult::Branched
            }
            _ => StepResult::Fault,
        },

        Mnemonic::Ret => {
            let Some(return_pc) = pop64(state, space) else {
                return StepResult::Fault;
            };
            state.rip = return_pc;
            StepResult::Branched
        }

        Mnemonic::Jmp => match instr.op0_kind() {
            OpKind::NearBranch64 => {
                state.rip = instr.near_branch_target();
                StepResult::Branched
            }
            OpKind::Register => match state.read_reg(instr.op0_register()) {
                Some(target) => {
                    state.rip = target;
                    StepResult::Branched
                }
                None => StepResult::Fault,
            },
            _ => StepResult::Fault,
        },

        Mnemonic::Je
        | Mnemonic::Jne
        | Mnemonic::Jb
        | Mnemonic::Jbe
        | Mnemonic::Ja
        | Mnemonic::Jae
        | Mnemonic::Jl
        | Mnemonic::Jle
        | Mnemonic::Jg
        | Mnemonic::Jge
        | Mnemonic::Js
        | Mnemonic::Jns => {
            let taken = condition(state, instr.mnemonic());
            if taken {
                state.rip = instr.near_branch_target();
                StepResult::Branched
            } else {
                StepResult::Continue
            }
        }

        // Kernel entries end the task under the generic runtime; a real
        // guest runtime would service them on the task's coroutine.
        Mnemonic::Hlt | Mnemonic::Syscall | Mnemonic::Int | Mnemonic::Int3 => StepResult::Exited,

        _ => StepResult::Fault,
    }
}

fn condition(state: &X86State, mnemonic: Mnemonic) -> bool {
    let zf = state.flag(FLAG_ZF);
    let cf = state.flag(FLAG_CF);
    let sf = state.flag(FLAG_SF);
    let of = state.flag(FLAG_OF);
    match mnemonic {
        Mnemonic::Je => zf,
        Mnemonic::Jne => !zf,
        Mnemonic::Jb => cf,
        Mnemonic::Jbe => cf || zf,
        Mnemonic::Ja => !cf && !zf,
        Mnemonic::Jae => !cf,
        Mnemonic::Jl => sf != of,
        Mnemonic::Jle => zf || sf != of,
        Mnemonic::Jg => !zf && sf == of,
        Mnemonic::Jge => sf == of,
        Mnemonic::Js => sf,
        Mnemonic::Jns => !sf,
        _ => false,
    }
}

/// Add or subtract with full CF/OF/ZF/SF bookkeeping; returns the masked
/// result.
fn arith(state: &mut X86State, lhs: u64, rhs: u64, bits: u32, subtract: bool) -> u64 {
    let masked_lhs = mask_to(lhs, bits);
    let masked_rhs = mask_to(rhs, bits);
    let wide = if subtract {
        (masked_lhs as u128).wrapping_sub(masked_rhs as u128)
    } else {
        (masked_lhs as u128).wrapping_add(masked_rhs as u128)
    };
    let result = mask_to(wide as u64, bits);

    let sign = 1u64 << (bits - 1);
    let carry = if subtract {
        masked_lhs < masked_rhs
    } else {
        wide > mask_to(u64::MAX, bits) as u128
    };
    let overflow = if subtract {
        ((masked_lhs ^ masked_rhs) & (masked_lhs ^ result)) & sign != 0
    } else {
        ((masked_lhs ^ result) & (masked_rhs ^ result)) & sign != 0
    };

    state.set_flag(FLAG_CF, carry);
    state.set_flag(FLAG_OF, overflow);
    set_zs(state, result, bits);
    result
}

fn set_zs(state: &mut X86State, result: u64, bits: u32) {
    let masked = mask_to(result, bits);
    state.set_flag(FLAG_ZF, masked == 0);
    state.set_flag(FLAG_SF, masked & (1 << (bits - 1)) != 0);
}

fn mask_to(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

fn operand_bits(instr: &Instruction, op: u32) -> u32 {
    match instr.op_kind(op) {
        OpKind::Register => instr.op_register(op).size() as u32 * 8,
        OpKind::Memory => instr.memory_size().size() as u32 * 8,
        _ => 64,
    }
}

fn read_operand(
    state: &X86State,
    space: &mut AddressSpace,
    instr: &Instruction,
    op: u32,
) -> Option<u64> {
    if op >= instr.op_count() {
        return None;
    }
    match instr.op_kind(op) {
        OpKind::Register => state.read_reg(instr.op_register(op)),
        OpKind::Immediate8 => Some(instr.immediate8() as u64),
        OpKind::Immediate8to16 => Some(instr.immediate8to16() as u64),
        OpKind::Immediate8to32 => Some(instr.immediate8to32() as u64),
        OpKind::Immediate8to64 => Some(instr.immediate8to64() as u64),
        OpKind::Immediate16 => Some(instr.immediate16() as u64),
        OpKind::Immediate32 => Some(instr.immediate32() as u64),
        OpKind::Immediate32to64 => Some(instr.immediate32to64() as u64),
        OpKind::Immediate64 => Some(instr.immediate64()),
        OpKind::Memory => {
            let addr = effective_address(state, instr)?;
            match instr.memory_size().size() {
                1 => space.try_read_u8(addr).map(u64::from),
                2 => space.try_read_u16(addr).map(u64::from),
                4 => space.try_read_u32(addr).map(u64::from),
                8 => space.try_read_u64(addr),
                _ => None,
            }
        }
        _ => None,
    }
}

fn write_operand(
    state: &mut X86State,
    space: &mut AddressSpace,
    instr: &Instruction,
    op: u32,
    value: u64,
) -> Option<()> {
    if op >= instr.op_count() {
        return None;
    }
    match instr.op_kind(op) {
        OpKind::Register => state.write_reg(instr.op_register(op), value),
        OpKind::Memory => {
            let addr = effective_address(state, instr)?;
            let ok = match instr.memory_size().size() {
                1 => space.try_write_u8(addr, value as u8),
                2 => space.try_write_u16(addr, value as u16),
                4 => space.try_write_u32(addr, value as u32),
                8 => space.try_write_u64(addr, value),
                _ => false,
            };
            ok.then_some(())
        }
        _ => None,
    }
}

fn effective_address(state: &X86State, instr: &Instruction) -> Option<u64> {
    // iced folds RIP-relative displacements into the displacement when the
    // decoder knows the instruction pointer.
    if instr.memory_base() == Register::RIP {
        return Some(instr.memory_displacement64());
    }
    let mut addr = instr.memory_displacement64();
    if instr.memory_base() != Register::None {
        addr = addr.wrapping_add(state.read_reg(instr.memory_base())?);
    }
    if instr.memory_index() != Register::None {
        let index = state.read_reg(instr.memory_index())?;
        addr = addr.wrapping_add(index.wrapping_mul(instr.memory_index_scale() as u64));
    }
    Some(addr)
}

fn push64(state: &mut X86State, space: &mut AddressSpace, value: u64) -> Option<()> {
    let rsp = state.read_reg(Register::RSP)?.wrapping_sub(8);
    if !space.try_write_u64(rsp, value) {
        return None;
    }
    state.write_reg(Register::RSP, rsp)
}

fn pop64(state: &mut X86State, space: &mut AddressSpace) -> Option<u64> {
    let rsp = state.read_reg(Register::RSP)?;
    let value = space.try_read_u64(rsp)?;
    state.write_reg(Register::RSP, rsp.wrapping_add(8))?;
    Some(value)
}
