use tracery_mem::{AddressWidth, Pc};

use crate::{Category, DecodedInstruction, GuestArch};

/// AArch64 control-flow classifier.
///
/// A64 instructions are fixed 4-byte little-endian words, so trace formation
/// only needs the branch encodings; everything else is `Normal` with a
/// fall-through successor. Full operand semantics stay behind the lifter
/// boundary.
pub struct Aarch64Arch;

const INSTRUCTION_LEN: usize = 4;

impl GuestArch for Aarch64Arch {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn address_width(&self) -> AddressWidth {
        AddressWidth::Bits64
    }

    fn max_instruction_size(&self) -> usize {
        INSTRUCTION_LEN
    }

    fn decode(&self, pc: Pc, bytes: &[u8]) -> DecodedInstruction {
        if bytes.len() < INSTRUCTION_LEN {
            return DecodedInstruction::invalid(pc, bytes.to_vec());
        }
        let mut raw = [0u8; INSTRUCTION_LEN];
        raw.copy_from_slice(&bytes[..INSTRUCTION_LEN]);
        let word = u32::from_le_bytes(raw);

        let next_pc = Pc::new(pc.get().wrapping_add(INSTRUCTION_LEN as u64));
        let rel = |imm: i64| Pc::new(pc.get().wrapping_add_signed(imm));

        let (category, taken, not_taken) = if word == 0xD503_201F {
            // nop
            (Category::NoOp, None, None)
        } else if word >> 26 == 0b000101 {
            // b imm26
            (Category::DirectJump, Some(rel(simm(word, 26) * 4)), None)
        } else if word >> 26 == 0b100101 {
            // bl imm26
            (
                Category::DirectCall,
                Some(rel(simm(word, 26) * 4)),
                Some(next_pc),
            )
        } else if word & 0xFF00_0010 == 0x5400_0000 {
            // b.cond imm19
            let imm = simm(word >> 5, 19) * 4;
            (Category::ConditionalBranch, Some(rel(imm)), Some(next_pc))
        } else if word & 0x7E00_0000 == 0x3400_0000 {
            // cbz / cbnz imm19
            let imm = simm(word >> 5, 19) * 4;
            (Category::ConditionalBranch, Some(rel(imm)), Some(next_pc))
        } else if word & 0x7E00_0000 == 0x3600_0000 {
            // tbz / tbnz imm14
            let imm = simm(word >> 5, 14) * 4;
            (Category::ConditionalBranch, Some(rel(imm)), Some(next_pc))
        } else if word & 0xFFFF_FC1F == 0xD61F_0000 {
            // br Xn
            (Category::IndirectJump, None, None)
        } else if word & 0xFFFF_FC1F == 0xD63F_0000 {
            // blr Xn
            (Category::IndirectCall, None, Some(next_pc))
        } else if word & 0xFFFF_FC1F == 0xD65F_0000 {
            // ret Xn
            (Category::Return, None, None)
        } else if word & 0xFFE0_001F == 0xD400_0001 {
            // svc #imm16
            (Category::AsyncHypercall, None, None)
        } else if word >> 16 == 0 {
            // udf #imm16 (permanently undefined)
            (Category::Error, None, None)
        } else {
            (Category::Normal, None, None)
        };

        DecodedInstruction {
            pc,
            bytes: raw.to_vec(),
            category,
            next_pc,
            branch_taken_pc: taken,
            branch_not_taken_pc: not_taken,
        }
    }
}

/// Sign-extend the low `bits` of `word`.
fn simm(word: u32, bits: u32) -> i64 {
    let mask = (1u64 << bits) - 1;
    let value = (word as u64) & mask;
    let sign = 1u64 << (bits - 1);
    ((value ^ sign).wrapping_sub(sign)) as i64
}
