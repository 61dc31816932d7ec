use iced_x86::{Decoder, DecoderError, DecoderOptions, FlowControl, Mnemonic, OpKind};

use tracery_mem::{AddressWidth, Pc};

use crate::{Category, DecodedInstruction, GuestArch};

/// Maximum architectural x86 instruction length.
pub const MAX_X86_INSTRUCTION_LEN: usize = 15;

/// x86 / x86-64 decode backend built on `iced-x86`.
pub struct X86Arch {
    bitness: u32,
}

impl X86Arch {
    /// 32-bit protected-mode decoding.
    pub fn x86() -> Self {
        Self { bitness: 32 }
    }

    /// 64-bit long-mode decoding.
    pub fn amd64() -> Self {
        Self { bitness: 64 }
    }
}

impl GuestArch for X86Arch {
    fn name(&self) -> &'static str {
        if self.bitness == 64 {
            "amd64"
        } else {
            "x86"
        }
    }

    fn address_width(&self) -> AddressWidth {
        if self.bitness == 64 {
            AddressWidth::Bits64
        } else {
            AddressWidth::Bits32
        }
    }

    fn max_instruction_size(&self) -> usize {
        MAX_X86_INSTRUCTION_LEN
    }

    fn decode(&self, pc: Pc, bytes: &[u8]) -> DecodedInstruction {
        if bytes.is_empty() {
            return DecodedInstruction::invalid(pc, Vec::new());
        }

        let mut decoder = Decoder::with_ip(self.bitness, bytes, pc.get(), DecoderOptions::NONE);
        let instruction = decoder.decode();
        match decoder.last_error() {
            DecoderError::None => {}
            // `DecoderError` is non-exhaustive; any failure is an undecodable
            // PC as far as trace formation is concerned.
            _ => return DecodedInstruction::invalid(pc, bytes.to_vec()),
        }

        let len = instruction.len();
        if len == 0 || len > bytes.len() {
            return DecodedInstruction::invalid(pc, bytes.to_vec());
        }

        let next_pc = Pc::new(instruction.next_ip());
        let near_target = || {
            matches!(
                instruction.op0_kind(),
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
            )
            .then(|| Pc::new(instruction.near_branch_target()))
        };

        let (category, taken, not_taken) = match instruction.mnemonic() {
            // Kernel-entry opcodes are async hypercalls regardless of how the
            // backend files their flow control.
            Mnemonic::Syscall | Mnemonic::Sysenter | Mnemonic::Int | Mnemonic::Int3
            | Mnemonic::Into => (Category::AsyncHypercall, None, None),
            // `hlt` is a privileged stop; lower it to the error intrinsic
            // like other halting opcodes.
            Mnemonic::Hlt => (Category::Error, None, None),
            Mnemonic::Nop => (Category::NoOp, None, None),
            _ => match instruction.flow_control() {
                FlowControl::Next => (Category::Normal, None, None),
                FlowControl::UnconditionalBranch => match near_target() {
                    Some(target) => (Category::DirectJump, Some(target), None),
                    // Far jumps carry a segmented target; resolve at run time.
                    None => (Category::IndirectJump, None, None),
                },
                FlowControl::IndirectBranch => (Category::IndirectJump, None, None),
                FlowControl::ConditionalBranch => match near_target() {
                    Some(target) => (Category::ConditionalBranch, Some(target), Some(next_pc)),
                    None => (Category::IndirectJump, None, None),
                },
                FlowControl::Call => match near_target() {
                    Some(target) => (Category::DirectCall, Some(target), Some(next_pc)),
                    None => (Category::IndirectCall, None, Some(next_pc)),
                },
                FlowControl::IndirectCall => (Category::IndirectCall, None, Some(next_pc)),
                FlowControl::Return => (Category::Return, None, None),
                FlowControl::Interrupt => (Category::AsyncHypercall, None, None),
                FlowControl::Exception => (Category::Error, None, None),
                // Transactional-memory fences and anything iced adds later.
                _ => (Category::Normal, None, None),
            },
        };

        DecodedInstruction {
            pc,
            bytes: bytes[..len].to_vec(),
            category,
            next_pc,
            branch_taken_pc: taken,
            branch_not_taken_pc: not_taken,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode64(pc: u64, bytes: &[u8]) -> DecodedInstruction {
        X86Arch::amd64().decode(Pc::new(pc), bytes)
    }

    #[test]
    fn nop_and_ret() {
        let nop = decode64(0x4000, &[0x90, 0x90, 0xC3]);
        assert_eq!(nop.category, Category::NoOp);
        assert_eq!(nop.next_pc, Pc::new(0x4001));
        assert_eq!(nop.bytes, vec![0x90]);

        let ret = decode64(0x4002, &[0xC3]);
        assert_eq!(ret.category, Category::Return);
    }

    #[test]
    fn direct_call_has_target_and_return_site() {
        // call rel32 (+0x3FFB from next ip 0x4005 -> 0x8000)
        let call = decode64(0x4000, &[0xE8, 0xFB, 0x3F, 0x00, 0x00]);
        assert_eq!(call.category, Category::DirectCall);
        assert_eq!(call.branch_taken_pc, Some(Pc::new(0x8000)));
        assert_eq!(call.branch_not_taken_pc, Some(Pc::new(0x4005)));
    }

    #[test]
    fn conditional_branch_has_both_edges() {
        // je +6
        let jcc = decode64(0x1000, &[0x74, 0x06]);
        assert_eq!(jcc.category, Category::ConditionalBranch);
        assert_eq!(jcc.branch_taken_pc, Some(Pc::new(0x1008)));
        assert_eq!(jcc.branch_not_taken_pc, Some(Pc::new(0x1002)));
    }

    #[test]
    fn indirect_and_invalid() {
        // jmp rax
        let jmp = decode64(0x1000, &[0xFF, 0xE0]);
        assert_eq!(jmp.category, Category::IndirectJump);

        let bad = decode64(0x1000, &[0x0F]);
        assert_eq!(bad.category, Category::Invalid);
        assert!(!bad.is_decoded());
    }

    #[test]
    fn hypercalls_and_errors() {
        let syscall = decode64(0x1000, &[0x0F, 0x05]);
        assert_eq!(syscall.category, Category::AsyncHypercall);

        let int80 = decode64(0x1000, &[0xCD, 0x80]);
        assert_eq!(int80.category, Category::AsyncHypercall);

        let ud2 = decode64(0x1000, &[0x0F, 0x0B]);
        assert_eq!(ud2.category, Category::Error);

        let hlt = decode64(0x1000, &[0xF4]);
        assert_eq!(hlt.category, Category::Error);
    }
}
